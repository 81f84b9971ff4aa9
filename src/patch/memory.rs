//! Access to memory the process does not own in the Rust sense.
//!
//! The runtime library's singleton lives in memory managed by C++ code. Every access
//! goes through [`ForeignMemory`], whose process implementation checks the target range
//! against the memory map before touching it.

use std::{mem, ptr};

use crate::{
    resolver::{MemoryMap, Permissions},
    Error, Result,
};

/// Reads and writes of raw process memory.
pub trait ForeignMemory {
    /// Reads `len` bytes at `address`.
    ///
    /// # Errors
    /// Returns [`Error::OutOfBounds`] if the range is not readable.
    fn read(&self, address: usize, len: usize) -> Result<Vec<u8>>;

    /// Writes `bytes` at `address`.
    ///
    /// # Errors
    /// Returns [`Error::OutOfBounds`] if the range is not writable.
    fn write(&mut self, address: usize, bytes: &[u8]) -> Result<()>;

    /// Reads a native-endian pointer at `address`.
    ///
    /// # Errors
    /// Returns [`Error::OutOfBounds`] if the range is not readable.
    fn read_pointer(&self, address: usize) -> Result<usize> {
        let bytes = self.read(address, mem::size_of::<usize>())?;
        let mut raw = [0u8; mem::size_of::<usize>()];
        raw.copy_from_slice(&bytes);
        Ok(usize::from_ne_bytes(raw))
    }
}

/// The current process's memory, bounded by a memory map snapshot.
#[derive(Debug, Clone)]
pub struct ProcessMemory {
    map: MemoryMap,
}

impl ProcessMemory {
    /// Snapshots `/proc/self/maps`.
    ///
    /// # Errors
    /// Returns an error if the memory map cannot be read.
    pub fn snapshot() -> Result<Self> {
        Ok(ProcessMemory {
            map: MemoryMap::current()?,
        })
    }

    /// Uses an existing memory map.
    pub fn with_map(map: MemoryMap) -> Self {
        ProcessMemory { map }
    }

    fn check(&self, address: usize, len: usize, required: Permissions) -> Result<()> {
        match self.map.find(address) {
            Some(entry) if entry.perms.contains(required) && entry.contains(address, len) => {
                Ok(())
            }
            _ => Err(Error::OutOfBounds),
        }
    }
}

impl ForeignMemory for ProcessMemory {
    fn read(&self, address: usize, len: usize) -> Result<Vec<u8>> {
        self.check(address, len, Permissions::READ)?;

        // Safety: the range lies inside a readable mapping of this process
        Ok((0..len)
            .map(|index| unsafe { ptr::read_volatile((address + index) as *const u8) })
            .collect())
    }

    fn write(&mut self, address: usize, bytes: &[u8]) -> Result<()> {
        self.check(address, bytes.len(), Permissions::READ | Permissions::WRITE)?;

        // A pointer-sized, aligned field is stored with one access so no other thread
        // can observe half of it
        if bytes.len() == mem::size_of::<usize>() && address % mem::align_of::<usize>() == 0 {
            let mut raw = [0u8; mem::size_of::<usize>()];
            raw.copy_from_slice(bytes);

            // Safety: checked writable, aligned and in bounds above
            unsafe { ptr::write_volatile(address as *mut usize, usize::from_ne_bytes(raw)) };
            return Ok(());
        }

        for (index, byte) in bytes.iter().enumerate() {
            // Safety: checked writable and in bounds above
            unsafe { ptr::write_volatile((address + index) as *mut u8, *byte) };
        }

        Ok(())
    }
}

use std::mem;

use tracing::{info, warn};

use crate::{
    patch::{ForeignMemory, OffsetEntry, OffsetTable, Pattern},
    platform::PlatformVersion,
    vm::Lifecycle,
    Error, Result,
};

/// Non-owning reference to the VM field of the runtime library's singleton.
///
/// The reference is consumed by the one transaction that patches it and exposes no
/// way to read or write on its own.
#[derive(Debug, PartialEq, Eq)]
pub struct SingletonRef {
    base: usize,
    offset: usize,
    width: usize,
}

impl SingletonRef {
    /// A field `offset` bytes past `base`, `width` bytes wide.
    ///
    /// # Errors
    /// Returns [`Error::OffsetTable`] unless `width` is 4 or 8, and
    /// [`Error::OutOfBounds`] if the field address overflows.
    pub fn new(base: usize, offset: usize, width: usize) -> Result<Self> {
        if width != 4 && width != 8 {
            return Err(Error::OffsetTable(format!(
                "field width must be 4 or 8, got {width}"
            )));
        }
        base.checked_add(offset).ok_or(Error::OutOfBounds)?;

        Ok(SingletonRef {
            base,
            offset,
            width,
        })
    }

    /// Builds the reference an offset table row describes, starting at `symbol_address`.
    ///
    /// For `deref` rows the pointer stored at the symbol is followed first; a null
    /// pointer there means the singleton does not exist yet.
    ///
    /// # Errors
    /// - [`Error::OutOfBounds`] if the symbol cannot be read
    /// - [`Error::OffsetValidationFailed`] if a `deref` symbol holds null
    pub fn locate<M: ForeignMemory + ?Sized>(
        entry: &OffsetEntry,
        symbol_address: usize,
        memory: &M,
    ) -> Result<Self> {
        let base = if entry.deref {
            match memory.read_pointer(symbol_address)? {
                0 => {
                    return Err(Error::OffsetValidationFailed {
                        address: symbol_address,
                        found: 0,
                    })
                }
                pointer => pointer,
            }
        } else {
            symbol_address
        };

        SingletonRef::new(base, entry.offset, entry.field_width())
    }

    fn field_address(&self) -> usize {
        self.base + self.offset
    }
}

/// Outcome of a successful patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchReceipt {
    /// Address of the patched field
    pub address: usize,
    /// Value the field held before
    pub previous: u64,
    /// Value written, the VM identity
    pub written: u64,
}

/// Registers the created VM inside the runtime library's singleton.
///
/// Patching is one validated transaction: read the field, check it against the
/// expected patterns, write the VM identity, read it back. Any failure leaves the
/// lifecycle `Failed`; success moves it to `Ready`.
pub struct RuntimePatcher<'a, M: ForeignMemory> {
    memory: M,
    lifecycle: &'a Lifecycle,
}

impl<'a, M: ForeignMemory> RuntimePatcher<'a, M> {
    /// A patcher writing through `memory` for the VM recorded in `lifecycle`.
    pub fn new(memory: M, lifecycle: &'a Lifecycle) -> Self {
        RuntimePatcher { memory, lifecycle }
    }

    /// The memory the patcher writes through.
    pub fn memory(&self) -> &M {
        &self.memory
    }

    /// Looks up the row for `version`, resolves its symbol and patches the field.
    ///
    /// `resolve` maps the row to the runtime address of its symbol. Nothing is read
    /// or written when the version has no row.
    ///
    /// # Errors
    /// - [`Error::NotReady`] if no VM has been created yet
    /// - [`Error::UnsupportedPlatformVersion`] if the table has no row for `version`
    /// - any error of `resolve`, [`SingletonRef::locate`] or [`RuntimePatcher::patch`]
    pub fn patch_versioned<F>(
        &mut self,
        table: &OffsetTable,
        version: &PlatformVersion,
        resolve: F,
    ) -> Result<PatchReceipt>
    where
        F: FnOnce(&OffsetEntry) -> Result<usize>,
    {
        let identity = self.lifecycle.pending_vm()?.identity();

        let outcome = table.lookup(version).and_then(|entry| {
            let symbol = resolve(entry)?;
            let target = SingletonRef::locate(entry, symbol, &self.memory)?;
            transact(&mut self.memory, target, &entry.expect_before, identity)
        });

        self.finish(outcome)
    }

    /// Patches `target`, which must currently match one of `expected`.
    ///
    /// # Errors
    /// - [`Error::NotReady`] if no VM has been created yet
    /// - [`Error::OffsetValidationFailed`] if the current value matches no pattern
    /// - [`Error::ReadBackMismatch`] if the written value does not read back
    /// - [`Error::OutOfBounds`] if the field is not accessible
    pub fn patch(&mut self, target: SingletonRef, expected: &[Pattern]) -> Result<PatchReceipt> {
        let identity = self.lifecycle.pending_vm()?.identity();
        let outcome = transact(&mut self.memory, target, expected, identity);

        self.finish(outcome)
    }

    fn finish(&self, outcome: Result<PatchReceipt>) -> Result<PatchReceipt> {
        match outcome {
            Ok(receipt) => {
                self.lifecycle.mark_ready()?;
                info!(
                    address = format_args!("{:#x}", receipt.address),
                    "runtime singleton now refers to the VM"
                );
                Ok(receipt)
            }
            Err(error) => {
                self.lifecycle.mark_failed();
                warn!(%error, "runtime patch refused");
                Err(error)
            }
        }
    }
}

fn transact<M: ForeignMemory + ?Sized>(
    memory: &mut M,
    target: SingletonRef,
    expected: &[Pattern],
    identity: usize,
) -> Result<PatchReceipt> {
    let address = target.field_address();
    let width = target.width;
    let value = identity as u64;

    if width < mem::size_of::<u64>() && value > u64::from(u32::MAX) {
        return Err(Error::OutOfBounds);
    }

    let before = memory.read(address, width)?;
    if !expected.iter().any(|pattern| pattern.matches(&before)) {
        return Err(Error::OffsetValidationFailed {
            address,
            found: decode(&before),
        });
    }

    let bytes = encode(value, width);
    memory.write(address, &bytes)?;

    let after = memory.read(address, width)?;
    if after != bytes {
        return Err(Error::ReadBackMismatch {
            address,
            expected: value,
            found: decode(&after),
        });
    }

    Ok(PatchReceipt {
        address,
        previous: decode(&before),
        written: value,
    })
}

fn encode(value: u64, width: usize) -> Vec<u8> {
    if width == 4 {
        (value as u32).to_ne_bytes().to_vec()
    } else {
        value.to_ne_bytes().to_vec()
    }
}

fn decode(bytes: &[u8]) -> u64 {
    match bytes.len() {
        4 => u64::from(u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
        8 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(bytes);
            u64::from_ne_bytes(raw)
        }
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::{
        patch::HexBytes,
        test::{fake_vm_handle, RecordingMemory},
        vm::RuntimeState,
        ErrorKind,
    };

    const BASE: usize = 0x7000_0000;

    fn bootstrapping() -> Lifecycle {
        let lifecycle = Lifecycle::new();
        lifecycle.begin().unwrap();
        lifecycle.record_vm(fake_vm_handle()).unwrap();
        lifecycle
    }

    fn table(deref: bool, offset: usize) -> OffsetTable {
        OffsetTable::from_json(&format!(
            r#"{{ "entries": [ {{
                "platform": {{ "min_api": 26, "max_api": 34 }},
                "symbol": "gRuntime",
                "deref": {deref},
                "offset": {offset},
                "width": 8,
                "expect_before": ["null"]
            }} ] }}"#
        ))
        .unwrap()
    }

    #[test]
    fn patches_null_field() {
        let lifecycle = bootstrapping();
        let mut patcher = RuntimePatcher::new(RecordingMemory::new(BASE, 64), &lifecycle);

        let target = SingletonRef::new(BASE, 8, 8).unwrap();
        let receipt = patcher.patch(target, &[Pattern::Null]).unwrap();

        assert_eq!(receipt.address, BASE + 8);
        assert_eq!(receipt.previous, 0);
        assert_eq!(receipt.written, fake_vm_handle().identity() as u64);
        assert_eq!(
            patcher.memory().bytes(BASE + 8, 8),
            (fake_vm_handle().identity() as u64).to_ne_bytes()
        );
        assert_eq!(patcher.memory().writes(), 1);
        assert_eq!(lifecycle.state(), RuntimeState::Ready);
    }

    #[test]
    fn unexpected_value_is_never_written() {
        let lifecycle = bootstrapping();
        let mut memory = RecordingMemory::new(BASE, 64);
        memory.poke(BASE, &0xdead_beef_u64.to_ne_bytes());
        let mut patcher = RuntimePatcher::new(memory, &lifecycle);

        let error = patcher
            .patch(SingletonRef::new(BASE, 0, 8).unwrap(), &[Pattern::Null])
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::OffsetValidationFailed);
        assert_eq!(patcher.memory().writes(), 0);
        assert_eq!(patcher.memory().bytes(BASE, 8), 0xdead_beef_u64.to_ne_bytes());
        assert_eq!(lifecycle.state(), RuntimeState::Failed);
    }

    #[test]
    fn alternative_pattern_is_accepted() {
        let lifecycle = bootstrapping();
        let mut memory = RecordingMemory::new(BASE, 64);
        memory.poke(BASE, &[0xef, 0xbe, 0xad, 0xde]);
        let mut patcher = RuntimePatcher::new(memory, &lifecycle);

        let expected = [
            Pattern::Null,
            Pattern::Bytes(HexBytes(vec![0xef, 0xbe, 0xad, 0xde])),
        ];
        let receipt = patcher
            .patch(SingletonRef::new(BASE, 0, 4).unwrap(), &expected)
            .unwrap();

        assert_eq!(receipt.previous, u64::from(u32::from_ne_bytes([0xef, 0xbe, 0xad, 0xde])));
        assert_eq!(lifecycle.state(), RuntimeState::Ready);
    }

    #[test]
    fn concurrent_overwrite_is_detected() {
        let lifecycle = bootstrapping();
        let memory = RecordingMemory::new(BASE, 64).interfere(BASE, &[0xff; 8]);
        let mut patcher = RuntimePatcher::new(memory, &lifecycle);

        let error = patcher
            .patch(SingletonRef::new(BASE, 0, 8).unwrap(), &[Pattern::Null])
            .unwrap_err();

        match error {
            Error::ReadBackMismatch {
                address,
                expected,
                found,
            } => {
                assert_eq!(address, BASE);
                assert_eq!(expected, fake_vm_handle().identity() as u64);
                assert_eq!(found, u64::MAX);
            }
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(lifecycle.state(), RuntimeState::Failed);
    }

    #[test]
    fn unsupported_version_touches_nothing() {
        let lifecycle = bootstrapping();
        let mut patcher = RuntimePatcher::new(RecordingMemory::new(BASE, 64), &lifecycle);
        let resolved = Cell::new(false);

        let error = patcher
            .patch_versioned(&table(false, 0), &PlatformVersion::new(99, "99"), |_| {
                resolved.set(true);
                Ok(BASE)
            })
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::UnsupportedPlatformVersion);
        assert!(!resolved.get());
        assert_eq!(patcher.memory().reads(), 0);
        assert_eq!(patcher.memory().writes(), 0);
        assert_eq!(lifecycle.state(), RuntimeState::Failed);
    }

    #[test]
    fn follows_pointer_rows() {
        let lifecycle = bootstrapping();
        let mut memory = RecordingMemory::new(BASE, 64);
        memory.poke(BASE, &(BASE + 32).to_ne_bytes());
        let mut patcher = RuntimePatcher::new(memory, &lifecycle);

        let receipt = patcher
            .patch_versioned(&table(true, 16), &PlatformVersion::new(30, "11"), |entry| {
                assert_eq!(entry.symbol, "gRuntime");
                Ok(BASE)
            })
            .unwrap();

        assert_eq!(receipt.address, BASE + 48);
        assert_eq!(lifecycle.state(), RuntimeState::Ready);
    }

    #[test]
    fn null_singleton_pointer() {
        let lifecycle = bootstrapping();
        let mut patcher = RuntimePatcher::new(RecordingMemory::new(BASE, 64), &lifecycle);

        let error = patcher
            .patch_versioned(&table(true, 16), &PlatformVersion::new(30, "11"), |_| Ok(BASE))
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::OffsetValidationFailed);
        assert_eq!(patcher.memory().writes(), 0);
    }

    #[test]
    fn requires_created_vm() {
        let lifecycle = Lifecycle::new();
        let mut patcher = RuntimePatcher::new(RecordingMemory::new(BASE, 64), &lifecycle);

        let error = patcher
            .patch(SingletonRef::new(BASE, 0, 8).unwrap(), &[Pattern::Null])
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::NotReady);
        assert_eq!(patcher.memory().reads(), 0);
        assert_eq!(lifecycle.state(), RuntimeState::Uninitialized);
    }

    #[test]
    fn field_outside_memory() {
        let lifecycle = bootstrapping();
        let mut patcher = RuntimePatcher::new(RecordingMemory::new(BASE, 64), &lifecycle);

        let error = patcher
            .patch(SingletonRef::new(BASE, 60, 8).unwrap(), &[Pattern::Null])
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::OutOfBounds);
        assert_eq!(patcher.memory().writes(), 0);
    }

    #[test]
    fn invalid_reference() {
        assert!(SingletonRef::new(BASE, 0, 2).is_err());
        assert!(SingletonRef::new(usize::MAX, 1, 8).is_err());
    }
}

use std::{
    ffi::{CStr, CString},
    os::unix::ffi::OsStrExt,
    path::Path,
};

use crate::{
    resolver::{DynamicLoader, LibraryHandle, MemoryMap},
    Result,
};

/// The process's own dynamic loader (`dlopen`, `dlsym`, `dlclose`).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLoader;

impl DynamicLoader for SystemLoader {
    fn open(&self, path: &Path) -> std::result::Result<LibraryHandle, String> {
        let path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| "library path contains an interior NUL byte".to_string())?;

        // Safety: path is a valid NUL-terminated string for the duration of the call
        let raw = unsafe { libc::dlopen(path.as_ptr(), libc::RTLD_NOW) };
        LibraryHandle::new(raw).ok_or_else(last_error)
    }

    fn lookup(&self, handle: LibraryHandle, name: &str) -> Option<usize> {
        let name = CString::new(name).ok()?;

        // Safety: handle came from dlopen and is never closed while the module is Loaded
        let address = unsafe {
            libc::dlerror();
            libc::dlsym(handle.as_ptr(), name.as_ptr())
        };

        (!address.is_null()).then_some(address as usize)
    }

    fn close(&self, handle: LibraryHandle) {
        // Safety: handle came from dlopen and is closed exactly once, during teardown
        unsafe {
            libc::dlclose(handle.as_ptr());
        }
    }

    fn memory_map(&self) -> Result<MemoryMap> {
        MemoryMap::current()
    }

    fn page_size(&self) -> usize {
        // Safety: sysconf has no preconditions
        match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
            size if size > 0 => size as usize,
            _ => 4096,
        }
    }
}

fn last_error() -> String {
    // Safety: dlerror returns either null or a thread-local NUL-terminated message
    unsafe {
        let message = libc::dlerror();
        if message.is_null() {
            "unknown loader error".to_string()
        } else {
            CStr::from_ptr(message).to_string_lossy().into_owned()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_library_reports_reason() {
        let reason = SystemLoader
            .open(Path::new("/nonexistent/droidstrap/libmissing.so"))
            .unwrap_err();

        assert!(!reason.is_empty());
    }

    #[test]
    fn page_size_is_power_of_two() {
        assert!(SystemLoader.page_size().is_power_of_two());
    }
}

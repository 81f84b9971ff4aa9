use std::{
    cell::RefCell,
    path::{Path, PathBuf},
};

use crate::{
    image::Image,
    resolver::{DynamicLoader, LibraryHandle, MapEntry, MemoryMap, Permissions},
    Result,
};

/// A loader that places library images at synthetic addresses without mapping them.
///
/// Nothing is executed or made accessible: the "mapping" only exists in the memory
/// map this loader reports. Resolving against it yields each symbol's offset from the
/// synthetic base, which is how offset tables are derived from a library pulled off a
/// device.
///
/// # Examples
///
/// ```rust,no_run
/// use droidstrap::resolver::{OfflineLoader, SignatureTag, SymbolRequest, SymbolResolver};
///
/// let mut resolver = SymbolResolver::new(OfflineLoader::new(), Vec::new());
/// let resolution = resolver.resolve(
///     "./libandroid_runtime.so",
///     &[SymbolRequest::new("_ZN7android14AndroidRuntime7mJavaVME", SignatureTag::DataPointer)],
/// )?;
/// let base = resolver.module(resolution.module).map(|m| m.base()).unwrap_or_default();
/// println!("offset {:#x}", resolution.symbols[0].address() - base);
/// # Ok::<(), droidstrap::Error>(())
/// ```
#[derive(Debug)]
pub struct OfflineLoader {
    base: usize,
    placed: RefCell<Vec<(PathBuf, MapEntry)>>,
}

impl OfflineLoader {
    /// First synthetic base address.
    pub const DEFAULT_BASE: usize = 0x1000_0000;

    /// Creates a loader placing the first image at [`OfflineLoader::DEFAULT_BASE`].
    pub fn new() -> Self {
        Self::with_base(Self::DEFAULT_BASE)
    }

    /// Creates a loader placing the first image at `base`.
    pub fn with_base(base: usize) -> Self {
        OfflineLoader {
            base,
            placed: RefCell::new(Vec::new()),
        }
    }

    fn next_base(&self) -> usize {
        self.placed
            .borrow()
            .last()
            .map(|(_, entry)| (entry.end + 0xffff) & !0xffff)
            .unwrap_or(self.base)
    }
}

impl Default for OfflineLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl DynamicLoader for OfflineLoader {
    fn open(&self, path: &Path) -> std::result::Result<LibraryHandle, String> {
        let image = Image::from_file(path).map_err(|error| error.to_string())?;
        let (low, high) = image
            .load_span()
            .ok_or_else(|| "image has no loadable segments".to_string())?;
        let span = usize::try_from(high - (low & !0xfff))
            .map_err(|_| "image span exceeds the address space".to_string())?;

        let start = self.next_base();
        let entry = MapEntry {
            start,
            end: start + ((span + 0xfff) & !0xfff),
            perms: Permissions::READ | Permissions::PRIVATE,
            offset: 0,
            path: Some(path.display().to_string()),
        };

        let mut placed = self.placed.borrow_mut();
        placed.push((path.to_path_buf(), entry));
        LibraryHandle::new(placed.len() as *mut libc::c_void)
            .ok_or_else(|| "handle space exhausted".to_string())
    }

    fn lookup(&self, _handle: LibraryHandle, _name: &str) -> Option<usize> {
        None
    }

    fn close(&self, handle: LibraryHandle) {
        let index = handle.as_ptr() as usize - 1;
        if let Some((_, entry)) = self.placed.borrow_mut().get_mut(index) {
            entry.path = None;
        }
    }

    fn memory_map(&self) -> Result<MemoryMap> {
        Ok(MemoryMap::from_entries(
            self.placed
                .borrow()
                .iter()
                .map(|(_, entry)| entry.clone())
                .collect(),
        ))
    }
}

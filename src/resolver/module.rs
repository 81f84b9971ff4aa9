use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    ptr::NonNull,
    sync::atomic::{AtomicU64, Ordering},
};

use strum::Display;

use crate::{image::Image, resolver::SymbolSource};

static NEXT_MODULE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a [`LoadedModule`].
///
/// Two modules mapped from the same file still receive different ids, which is what
/// keeps symbols resolved against one instance from being used with the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(u64);

impl ModuleId {
    pub(crate) fn next() -> Self {
        ModuleId(NEXT_MODULE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "module#{}", self.0)
    }
}

/// Lifecycle of a [`LoadedModule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ModuleState {
    /// Torn down; none of its symbols may be used.
    Unloaded,
    /// Mapped and usable.
    Loaded,
    /// The loader accepted the library but its mapping could not be established.
    Failed,
}

/// Opaque handle returned by the platform loader.
///
/// Handles are never closed implicitly. The library stays mapped for as long as the
/// owning [`crate::resolver::SymbolResolver`] lives, and is released only by
/// [`crate::resolver::SymbolResolver::teardown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LibraryHandle(NonNull<libc::c_void>);

impl LibraryHandle {
    /// Wraps a non-null loader handle.
    pub fn new(raw: *mut libc::c_void) -> Option<Self> {
        NonNull::new(raw).map(LibraryHandle)
    }

    /// Returns the raw loader handle.
    pub fn as_ptr(&self) -> *mut libc::c_void {
        self.0.as_ptr()
    }
}

// Safety: loader handles are process-global tokens and may be used from any thread
unsafe impl Send for LibraryHandle {}
unsafe impl Sync for LibraryHandle {}

/// A shared library mapped into the process, as seen by the resolver.
///
/// A module is exclusively owned by the resolver that opened it. Callers refer to it
/// through its [`ModuleId`] and borrow it only to validate resolved symbols.
pub struct LoadedModule {
    pub(crate) id: ModuleId,
    pub(crate) path: PathBuf,
    pub(crate) base: usize,
    pub(crate) size: usize,
    pub(crate) bias: usize,
    pub(crate) state: ModuleState,
    pub(crate) handle: Option<LibraryHandle>,
    pub(crate) image: Option<Image>,
    pub(crate) symbols: HashMap<String, (usize, SymbolSource)>,
}

impl LoadedModule {
    /// Unique identity of this module.
    pub fn id(&self) -> ModuleId {
        self.id
    }

    /// Path the module was mapped from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lowest mapped address.
    pub fn base(&self) -> usize {
        self.base
    }

    /// Size of the mapped range in bytes, including zero-initialised storage.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Difference between runtime and link-time addresses.
    pub fn bias(&self) -> usize {
        self.bias
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ModuleState {
        self.state
    }

    /// Returns true if the platform loader holds a handle for this module.
    pub fn has_handle(&self) -> bool {
        self.handle.is_some()
    }

    /// Returns true if `address` lies inside `[base, base + size)`.
    pub fn contains(&self, address: usize) -> bool {
        address >= self.base && address - self.base < self.size
    }

    /// Symbols resolved from this module so far, by name.
    pub fn resolved(&self) -> impl Iterator<Item = (&str, usize)> {
        self.symbols
            .iter()
            .map(|(name, (address, _))| (name.as_str(), *address))
    }
}

impl fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModule")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("base", &format_args!("{:#x}", self.base))
            .field("size", &format_args!("{:#x}", self.size))
            .field("state", &self.state)
            .field("handle", &self.handle.is_some())
            .field("symbols", &self.symbols.len())
            .finish()
    }
}

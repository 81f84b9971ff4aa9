//! In-process stand-in for the platform loader.

use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
};

use crate::{
    image::Image,
    resolver::{DynamicLoader, LibraryHandle, MapEntry, MemoryMap, Permissions},
    Error, Result,
};

/// A library known to [`FakeLoader`], placed at a fixed base address.
pub struct FakeLibrary {
    image: Vec<u8>,
    base: usize,
    exports: HashMap<String, usize>,
    refusal: Option<String>,
    premapped: bool,
}

impl FakeLibrary {
    pub fn new(image: Vec<u8>, base: usize) -> Self {
        FakeLibrary {
            image,
            base,
            exports: HashMap::new(),
            refusal: None,
            premapped: false,
        }
    }

    /// Makes the loader answer `name` with `base + offset`.
    pub fn export(mut self, name: &str, offset: usize) -> Self {
        self.exports.insert(name.to_string(), self.base + offset);
        self
    }

    /// Makes the loader answer `name` with an arbitrary address.
    pub fn export_absolute(mut self, name: &str, address: usize) -> Self {
        self.exports.insert(name.to_string(), address);
        self
    }

    /// Makes the loader refuse to open the library.
    pub fn refuse(mut self, reason: &str) -> Self {
        self.refusal = Some(reason.to_string());
        self
    }

    /// Shows the library in the memory map before anyone opens it.
    pub fn premapped(mut self) -> Self {
        self.premapped = true;
        self
    }

    fn span(&self) -> usize {
        let end = Image::from_mem(self.image.clone())
            .ok()
            .and_then(|image| image.load_span())
            .map(|(_, high)| high as usize)
            .unwrap_or(self.image.len());
        (end + 0xfff) & !0xfff
    }
}

/// A [`DynamicLoader`] over [`FakeLibrary`] descriptions.
pub struct FakeLoader {
    libraries: Vec<(PathBuf, FakeLibrary)>,
    mapped: RefCell<HashSet<PathBuf>>,
    closed: Cell<usize>,
}

impl FakeLoader {
    pub fn new() -> Self {
        FakeLoader {
            libraries: Vec::new(),
            mapped: RefCell::new(HashSet::new()),
            closed: Cell::new(0),
        }
    }

    pub fn with(mut self, path: &str, library: FakeLibrary) -> Self {
        if library.premapped {
            self.mapped.borrow_mut().insert(PathBuf::from(path));
        }
        self.libraries.push((PathBuf::from(path), library));
        self
    }

    /// Number of handles closed so far.
    pub fn closed(&self) -> usize {
        self.closed.get()
    }

    fn find(&self, path: &Path) -> Option<(usize, &FakeLibrary)> {
        self.libraries
            .iter()
            .enumerate()
            .find(|(_, (candidate, _))| candidate == path)
            .map(|(index, (_, library))| (index, library))
    }
}

impl DynamicLoader for FakeLoader {
    fn open(&self, path: &Path) -> std::result::Result<LibraryHandle, String> {
        let (index, library) = self
            .find(path)
            .ok_or_else(|| format!("library \"{}\" not found", path.display()))?;

        if let Some(reason) = &library.refusal {
            return Err(reason.clone());
        }

        self.mapped.borrow_mut().insert(path.to_path_buf());
        LibraryHandle::new((index + 1) as *mut libc::c_void).ok_or_else(String::new)
    }

    fn lookup(&self, handle: LibraryHandle, name: &str) -> Option<usize> {
        let index = handle.as_ptr() as usize - 1;
        self.libraries
            .get(index)
            .and_then(|(_, library)| library.exports.get(name).copied())
    }

    fn close(&self, _handle: LibraryHandle) {
        self.closed.set(self.closed.get() + 1);
    }

    fn memory_map(&self) -> Result<MemoryMap> {
        let mapped = self.mapped.borrow();
        let entries = self
            .libraries
            .iter()
            .filter(|(path, _)| mapped.contains(path))
            .map(|(path, library)| MapEntry {
                start: library.base,
                end: library.base + library.span(),
                perms: Permissions::READ | Permissions::EXEC | Permissions::PRIVATE,
                offset: 0,
                path: Some(path.display().to_string()),
            })
            .collect();

        Ok(MemoryMap::from_entries(entries))
    }

    fn image(&self, path: &Path) -> Result<Image> {
        let (_, library) = self.find(path).ok_or(Error::Empty)?;
        Image::from_mem(library.image.clone())
    }

    fn exists(&self, path: &Path) -> bool {
        self.find(path).is_some()
    }
}

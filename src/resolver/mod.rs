//! Locating the runtime library and resolving symbols inside it.
//!
//! Resolution is always scoped to one explicit [`LoadedModule`]: a name is looked up in
//! that module only, and every candidate address is checked against the module's mapped
//! bounds before it is handed out. The platform loader is asked first; when it refuses
//! the library (linker namespaces, policy) or does not export the symbol, the module's
//! on-disk image is read instead and the symbol's link-time value is rebased onto the
//! module's load bias.
//!
//! # Key Components
//!
//! - [`SymbolResolver`] - Owns every module it opens and resolves symbols within them
//! - [`DynamicLoader`] - Seam over the platform loader ([`SystemLoader`], [`OfflineLoader`])
//! - [`LoadedModule`] / [`ModuleId`] - A mapped library and its identity
//! - [`ResolvedSymbol`] / [`EntryPoint`] - An address and the typed view onto it
//! - [`MemoryMap`] - Parsed `/proc/self/maps`
//!
//! # Examples
//!
//! ```rust,no_run
//! use droidstrap::resolver::{CreateJavaVm, SignatureTag, SymbolRequest, SymbolResolver};
//!
//! let mut resolver = SymbolResolver::system(vec!["/system/lib64".into()]);
//! let resolution = resolver.resolve(
//!     "libandroid_runtime.so",
//!     &[SymbolRequest::new("JNI_CreateJavaVM", SignatureTag::JniCreateJavaVm)],
//! )?;
//!
//! let module = resolver.module(resolution.module).expect("module was just opened");
//! let create = resolution.symbols[0].entry::<CreateJavaVm>(module)?;
//! println!("JNI_CreateJavaVM at {:#x}", create as usize);
//! # Ok::<(), droidstrap::Error>(())
//! ```

mod maps;
mod module;
mod offline;
mod symbol;
mod system;

pub use maps::{Extent, MapEntry, MemoryMap, Permissions, PROC_SELF_MAPS};
pub use module::{LibraryHandle, LoadedModule, ModuleId, ModuleState};
pub use offline::OfflineLoader;
pub use symbol::{
    CreateJavaVm, CreateJavaVmFn, EntryPoint, JniInvocationCreate, JniInvocationCreateFn,
    JniInvocationInit, JniInvocationInitFn, ResolvedSymbol, SignatureTag, StartRegFn,
    StartRegistration, SymbolRequest, SymbolSource,
};
pub use system::SystemLoader;

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use tracing::{debug, info, warn};

use crate::{image::Image, Error, Result};

/// Seam over the platform's dynamic loader.
///
/// The resolver never talks to the loader directly, so resolution can run against the
/// real process ([`SystemLoader`]) or against images that are only read, never
/// executed ([`OfflineLoader`]).
pub trait DynamicLoader {
    /// Maps the library at `path`, returning the loader's diagnostic on refusal.
    fn open(&self, path: &Path) -> std::result::Result<LibraryHandle, String>;

    /// Looks up an exported symbol through the loader.
    ///
    /// The answer may come from a dependency of the library; the resolver bounds-checks it.
    fn lookup(&self, handle: LibraryHandle, name: &str) -> Option<usize>;

    /// Releases a handle obtained from [`DynamicLoader::open`].
    fn close(&self, handle: LibraryHandle);

    /// Snapshot of what is currently mapped.
    fn memory_map(&self) -> Result<MemoryMap>;

    /// Reads the on-disk image of the library at `path`.
    fn image(&self, path: &Path) -> Result<Image> {
        Image::from_file(path)
    }

    /// Returns true if a library file exists at `path`.
    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    /// Granularity the loader maps segments at.
    fn page_size(&self) -> usize {
        4096
    }
}

/// The module and symbols produced by [`SymbolResolver::resolve`].
#[derive(Debug, Clone)]
pub struct Resolution {
    /// The module every symbol was resolved in
    pub module: ModuleId,
    /// One symbol per request, in request order
    pub symbols: Vec<ResolvedSymbol>,
}

impl Resolution {
    /// Returns the symbol resolved for `name`.
    pub fn get(&self, name: &str) -> Option<&ResolvedSymbol> {
        self.symbols.iter().find(|symbol| symbol.name == name)
    }
}

/// Opens libraries and resolves symbols inside them.
///
/// The resolver exclusively owns every [`LoadedModule`] it creates. Modules stay mapped
/// for the resolver's whole lifetime; dropping the resolver does not unmap anything, only
/// [`SymbolResolver::teardown`] does.
pub struct SymbolResolver<L: DynamicLoader = SystemLoader> {
    loader: L,
    search_paths: Vec<PathBuf>,
    modules: Vec<LoadedModule>,
}

impl SymbolResolver<SystemLoader> {
    /// Creates a resolver over the process's own dynamic loader.
    pub fn system(search_paths: Vec<PathBuf>) -> Self {
        SymbolResolver::new(SystemLoader, search_paths)
    }
}

impl<L: DynamicLoader> SymbolResolver<L> {
    /// Creates a resolver over `loader`, searching `search_paths` for bare library names.
    pub fn new(loader: L, search_paths: Vec<PathBuf>) -> Self {
        SymbolResolver {
            loader,
            search_paths,
            modules: Vec::new(),
        }
    }

    /// The loader this resolver was created with.
    pub fn loader(&self) -> &L {
        &self.loader
    }

    /// Returns the module with the given id.
    pub fn module(&self, id: ModuleId) -> Option<&LoadedModule> {
        self.modules.iter().find(|module| module.id == id)
    }

    /// All modules this resolver has created, including failed and unloaded ones.
    pub fn modules(&self) -> &[LoadedModule] {
        &self.modules
    }

    /// Finds where `library` lives.
    ///
    /// A path containing `/` is taken literally. A bare name is matched against what is
    /// already mapped first, then against each search path in order.
    ///
    /// # Errors
    /// Returns [`Error::ModuleNotFound`] if the library is neither mapped nor on disk.
    pub fn locate(&self, library: &str) -> Result<PathBuf> {
        let map = match self.loader.memory_map() {
            Ok(map) => map,
            Err(error) => {
                warn!(%error, "memory map unavailable, locating {library} on disk only");
                MemoryMap::default()
            }
        };

        if let Some(mapped) = map.mapped_path(library) {
            return Ok(PathBuf::from(mapped));
        }

        if library.contains('/') {
            let path = PathBuf::from(library);
            if self.loader.exists(&path) {
                return Ok(path);
            }
        } else if let Some(path) = self
            .search_paths
            .iter()
            .map(|directory| directory.join(library))
            .find(|path| self.loader.exists(path))
        {
            return Ok(path);
        }

        Err(Error::ModuleNotFound {
            library: library.to_string(),
        })
    }

    /// Maps `library` and records it as a [`LoadedModule`].
    ///
    /// Opening a library this resolver already holds in the `Loaded` state returns the
    /// existing module.
    ///
    /// # Errors
    /// - [`Error::ModuleNotFound`] if the library cannot be located
    /// - [`Error::LoadFailed`] if the loader refused it and no mapped copy exists, or its
    ///   mapping cannot be found after loading
    pub fn open(&mut self, library: &str) -> Result<ModuleId> {
        let path = self.locate(library)?;

        if let Some(existing) = self
            .modules
            .iter()
            .find(|module| module.path == path && module.state == ModuleState::Loaded)
        {
            return Ok(existing.id);
        }

        let location = path.display().to_string();
        let (handle, refusal) = match self.loader.open(&path) {
            Ok(handle) => (Some(handle), None),
            Err(reason) => {
                debug!(library = %location, %reason, "loader refused library, trying mapped copy");
                (None, Some(reason))
            }
        };

        let map = self.loader.memory_map()?;
        let Some(extent) = map.module_extent(&location) else {
            let reason = refusal
                .unwrap_or_else(|| "mapped image not found in the process memory map".to_string());
            if handle.is_some() {
                self.modules.push(LoadedModule {
                    id: ModuleId::next(),
                    path,
                    base: 0,
                    size: 0,
                    bias: 0,
                    state: ModuleState::Failed,
                    handle,
                    image: None,
                    symbols: HashMap::new(),
                });
            }
            return Err(Error::LoadFailed {
                library: location,
                reason,
            });
        };

        let image = match self.loader.image(&path) {
            Ok(image) => Some(image),
            Err(error) if handle.is_some() => {
                warn!(library = %location, %error, "image unreadable, loader lookups only");
                None
            }
            Err(error) => {
                return Err(Error::LoadFailed {
                    library: location,
                    reason: format!(
                        "{}; image unreadable: {error}",
                        refusal.unwrap_or_default()
                    ),
                })
            }
        };

        let page_mask = !(self.loader.page_size().max(1) - 1);
        let (bias, size) = match image.as_ref().and_then(Image::load_span) {
            Some((low, high)) => {
                let low = usize::try_from(low).map_err(|_| Error::OutOfBounds)? & page_mask;
                let high = usize::try_from(high).map_err(|_| Error::OutOfBounds)?;
                let bias = extent.base.checked_sub(low).ok_or_else(|| {
                    malformed_error!("{} mapped below its first segment", location)
                })?;
                (bias, extent.size().max(high - low))
            }
            None => (extent.base, extent.size()),
        };

        let id = ModuleId::next();
        info!(
            library = %location,
            base = format_args!("{:#x}", extent.base),
            size = format_args!("{:#x}", size),
            handle = handle.is_some(),
            "module loaded"
        );

        self.modules.push(LoadedModule {
            id,
            path,
            base: extent.base,
            size,
            bias,
            state: ModuleState::Loaded,
            handle,
            image,
            symbols: HashMap::new(),
        });

        Ok(id)
    }

    /// Opens `library` and resolves every request inside it.
    ///
    /// # Errors
    /// Any error of [`SymbolResolver::open`] or [`SymbolResolver::resolve_in`]. The module
    /// stays `Loaded` when only a symbol is missing.
    pub fn resolve(&mut self, library: &str, requests: &[SymbolRequest]) -> Result<Resolution> {
        let module = self.open(library)?;
        let symbols = self.resolve_in(module, requests)?;

        Ok(Resolution { module, symbols })
    }

    /// Resolves every request inside an already opened module.
    ///
    /// # Errors
    /// - [`Error::ModuleNotLoaded`] if the module is unknown or not `Loaded`
    /// - [`Error::SymbolNotFound`] if the module does not define a requested name
    /// - [`Error::SymbolOutOfBounds`] if a candidate address lies outside the module
    pub fn resolve_in(
        &mut self,
        module: ModuleId,
        requests: &[SymbolRequest],
    ) -> Result<Vec<ResolvedSymbol>> {
        let loader = &self.loader;
        let module = loaded_mut(&mut self.modules, module)?;

        requests
            .iter()
            .map(|request| lookup(loader, module, request))
            .collect()
    }

    /// Resolves a symbol that is allowed to be absent.
    ///
    /// # Errors
    /// As [`SymbolResolver::resolve_in`], except that a missing symbol yields `Ok(None)`.
    pub fn resolve_optional(
        &mut self,
        module: ModuleId,
        request: SymbolRequest,
    ) -> Result<Option<ResolvedSymbol>> {
        match self.resolve_in(module, &[request]) {
            Ok(mut symbols) => Ok(symbols.pop()),
            Err(Error::SymbolNotFound { .. }) => Ok(None),
            Err(error) => Err(error),
        }
    }

    /// Releases every loader handle and marks all modules `Unloaded`.
    ///
    /// Symbols resolved earlier fail validation afterwards.
    pub fn teardown(&mut self) {
        for module in &mut self.modules {
            if let Some(handle) = module.handle.take() {
                self.loader.close(handle);
            }
            module.state = ModuleState::Unloaded;
            module.image = None;
            module.symbols.clear();
        }
    }
}

fn loaded_mut(modules: &mut [LoadedModule], id: ModuleId) -> Result<&mut LoadedModule> {
    match modules.iter_mut().find(|module| module.id == id) {
        Some(module) if module.state == ModuleState::Loaded => Ok(module),
        Some(module) => Err(Error::ModuleNotLoaded {
            module: module.path.display().to_string(),
        }),
        None => Err(Error::ModuleNotLoaded {
            module: id.to_string(),
        }),
    }
}

fn lookup<L: DynamicLoader>(
    loader: &L,
    module: &mut LoadedModule,
    request: &SymbolRequest,
) -> Result<ResolvedSymbol> {
    let found = |module: &LoadedModule, address: usize, source: SymbolSource| ResolvedSymbol {
        module: module.id,
        name: request.name.to_string(),
        address,
        tag: request.tag,
        source,
    };

    if let Some(&(address, source)) = module.symbols.get(request.name) {
        return Ok(found(module, address, source));
    }

    if let Some(handle) = module.handle {
        match loader.lookup(handle, request.name) {
            Some(address) if module.contains(address) => {
                module
                    .symbols
                    .insert(request.name.to_string(), (address, SymbolSource::Loader));
                return Ok(found(module, address, SymbolSource::Loader));
            }
            Some(address) => debug!(
                symbol = request.name,
                address = format_args!("{address:#x}"),
                "loader answer lies outside {}, ignored",
                module.path.display()
            ),
            None => {}
        }
    }

    if let Some(symbol) = module.image.as_ref().and_then(|image| image.symbol(request.name)) {
        let address = usize::try_from(symbol.value)
            .ok()
            .and_then(|value| module.bias.checked_add(value));

        return match address {
            Some(address) if module.contains(address) => {
                module
                    .symbols
                    .insert(request.name.to_string(), (address, SymbolSource::Image));
                Ok(found(module, address, SymbolSource::Image))
            }
            rejected => Err(Error::SymbolOutOfBounds {
                symbol: request.name.to_string(),
                address: rejected.unwrap_or(usize::MAX),
            }),
        };
    }

    Err(Error::SymbolNotFound {
        module: module.path.display().to_string(),
        symbol: request.name.to_string(),
    })
}

use strum::{Display, EnumIter, IntoStaticStr};
use thiserror::Error;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The bootstrap stage an operation belongs to.
///
/// Stages run strictly in declaration order; a failure in one stage aborts all
/// later ones. The names are stable and used in the single-line diagnostics
/// emitted by [`crate::Failure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
    /// Locating the runtime library and resolving its entry points.
    Resolve,
    /// Creating the virtual machine instance.
    CreateVm,
    /// Registering the new VM inside the runtime library's singleton.
    Patch,
    /// Managed calls producing the application context and native surface.
    Bridge,
    /// Frame presentation and input pumping after bootstrap.
    Present,
}

/// Stable, copyable classification of an [`Error`].
///
/// Every variant of [`Error`] maps to exactly one kind, so callers can branch on
/// the failure class without matching on payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    /// See [`Error::ModuleNotFound`].
    ModuleNotFound,
    /// See [`Error::SymbolNotFound`].
    SymbolNotFound,
    /// See [`Error::LoadFailed`].
    LoadFailed,
    /// See [`Error::AlreadyInitialized`].
    AlreadyInitialized,
    /// See [`Error::VmCreationFailed`].
    VmCreationFailed,
    /// See [`Error::UnsupportedPlatformVersion`].
    UnsupportedPlatformVersion,
    /// See [`Error::OffsetValidationFailed`].
    OffsetValidationFailed,
    /// See [`Error::ReadBackMismatch`].
    ReadBackMismatch,
    /// See [`Error::ManagedCallFailed`].
    ManagedCallFailed,
    /// See [`Error::PendingManagedException`].
    PendingManagedException,
    /// See [`Error::SignatureMismatch`].
    SignatureMismatch,
    /// See [`Error::ModuleNotLoaded`].
    ModuleNotLoaded,
    /// See [`Error::ForeignModule`].
    ForeignModule,
    /// See [`Error::SymbolOutOfBounds`].
    SymbolOutOfBounds,
    /// See [`Error::NotReady`].
    NotReady,
    /// See [`Error::InsufficientPrivilege`].
    InsufficientPrivilege,
    /// See [`Error::OffsetTable`].
    OffsetTable,
    /// See [`Error::Malformed`].
    Malformed,
    /// See [`Error::OutOfBounds`].
    OutOfBounds,
    /// See [`Error::Empty`].
    Empty,
    /// See [`Error::Io`].
    Io,
    /// See [`Error::GoblinErr`].
    Goblin,
    /// See [`Error::Jni`].
    Jni,
}

/// The generic Error type, which covers every failure the bootstrap subsystem can report.
///
/// The first ten variants form the bootstrap taxonomy: each one names a distinct
/// failure mode of a distinct stage and is never folded into a catch-all. The
/// remaining variants cover the invariants guarding foreign memory and the ambient
/// I/O and parsing layers underneath.
///
/// # Error Categories
///
/// ## Symbol Resolver
/// - [`Error::ModuleNotFound`] - Library is not present on disk nor mapped
/// - [`Error::SymbolNotFound`] - Library is present but lacks the symbol
/// - [`Error::LoadFailed`] - The dynamic loader rejected the library
/// - [`Error::SignatureMismatch`], [`Error::ModuleNotLoaded`], [`Error::ForeignModule`],
///   [`Error::SymbolOutOfBounds`] - A resolved address may not be used as requested
///
/// ## VM Bootstrapper
/// - [`Error::AlreadyInitialized`] - A VM was already created in this process
/// - [`Error::VmCreationFailed`] - The native creation call returned a failure status
///
/// ## Runtime State Patcher
/// - [`Error::UnsupportedPlatformVersion`] - No offset table row for this platform
/// - [`Error::OffsetValidationFailed`] - Pre-write check refused the write
/// - [`Error::ReadBackMismatch`] - Post-write verification failed
///
/// ## Context Bridge
/// - [`Error::ManagedCallFailed`] - A named managed call failed
/// - [`Error::PendingManagedException`] - A named managed call raised an exception
///
/// # Examples
///
/// ```rust,no_run
/// use droidstrap::{Error, PlatformVersion};
///
/// match PlatformVersion::detect() {
///     Ok(version) => println!("Running on {}", version),
///     Err(Error::UnsupportedPlatformVersion(version)) => {
///         eprintln!("Cannot parse platform version: {}", version);
///     }
///     Err(e) => eprintln!("Other error: {}", e),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The library is neither present in any search path nor mapped into the process.
    #[error("Module not found - {library}")]
    ModuleNotFound {
        /// The library name or path that was requested
        library: String,
    },

    /// The library was found and loaded but does not define the requested symbol.
    ///
    /// Resolution is always scoped to one module; a symbol that only exists in a
    /// dependency of the module is reported here as well.
    #[error("Symbol '{symbol}' not found in {module}")]
    SymbolNotFound {
        /// Path of the module that was searched
        module: String,
        /// The symbol name that was requested
        symbol: String,
    },

    /// The library exists but the dynamic loader rejected it and no mapped copy was found.
    ///
    /// Typical causes are linker namespace restrictions or SELinux policy.
    #[error("Loading {library} failed: {reason}")]
    LoadFailed {
        /// The library path that was attempted
        library: String,
        /// The loader's own diagnostic
        reason: String,
    },

    /// A virtual machine was already created (or its creation attempted) in this process.
    #[error("A virtual machine has already been created in this process")]
    AlreadyInitialized,

    /// The native VM creation entry point returned a non-success status.
    ///
    /// The payload is the entry point's own return code (`JNI_ERR`, `JNI_ENOMEM`, ...).
    #[error("VM creation failed with status {0}")]
    VmCreationFailed(i32),

    /// The offset table has no row for the detected platform version.
    #[error("Unsupported platform version - {0}")]
    UnsupportedPlatformVersion(String),

    /// The bytes currently at the patch target match none of the expected patterns.
    ///
    /// No write has been performed when this error is returned.
    #[error("Refusing to patch {address:#x}: found {found:#x}, which matches no expected pattern")]
    OffsetValidationFailed {
        /// Address of the field that was inspected
        address: usize,
        /// The value found at the address
        found: u64,
    },

    /// The patched field did not read back as the value that was written.
    #[error("Read-back of {address:#x} returned {found:#x}, expected {expected:#x}")]
    ReadBackMismatch {
        /// Address of the patched field
        address: usize,
        /// The value that was written
        expected: u64,
        /// The value that was read back
        found: u64,
    },

    /// A named managed call failed without raising a managed exception.
    #[error("Managed call '{stage}' failed: {message}")]
    ManagedCallFailed {
        /// The bridge stage that issued the call
        stage: String,
        /// Description of the failure
        message: String,
    },

    /// A named managed call raised a managed exception, which has since been cleared.
    #[error("Managed call '{stage}' raised an exception: {message}")]
    PendingManagedException {
        /// The bridge stage that issued the call
        stage: String,
        /// The exception's message
        message: String,
    },

    /// A resolved symbol was requested with a different calling-convention tag.
    #[error("Symbol '{symbol}' was resolved as {found}, but used as {expected}")]
    SignatureMismatch {
        /// The symbol name
        symbol: String,
        /// The tag the call site expects
        expected: &'static str,
        /// The tag the symbol was resolved with
        found: &'static str,
    },

    /// The module owning a symbol is not in the `Loaded` state.
    #[error("Module {module} is not loaded")]
    ModuleNotLoaded {
        /// Path of the module
        module: String,
    },

    /// A resolved symbol was presented together with a module it was not resolved from.
    #[error("Symbol '{symbol}' belongs to a different module")]
    ForeignModule {
        /// The symbol name
        symbol: String,
    },

    /// A candidate address lies outside the owning module's mapped bounds.
    #[error("Symbol '{symbol}' resolved to {address:#x}, outside of its module")]
    SymbolOutOfBounds {
        /// The symbol name
        symbol: String,
        /// The rejected address
        address: usize,
    },

    /// The process-wide runtime is not in the state the operation requires.
    #[error("Runtime is not ready - state is {0}")]
    NotReady(&'static str),

    /// The process does not run with the privileges the configuration requires.
    #[error("Insufficient privilege - effective uid is {euid}, root is required")]
    InsufficientPrivilege {
        /// The effective user id of the process
        euid: u32,
    },

    /// The offset table could not be parsed or is internally inconsistent.
    #[error("Invalid offset table - {0}")]
    OffsetTable(String),

    /// The library image is damaged and could not be parsed.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted.
    ///
    /// Raised for image reads past the end of a backend, and for foreign memory
    /// accesses outside any suitable mapping.
    #[error("Out of Bound access would have occurred!")]
    OutOfBounds,

    /// Provided input was empty.
    #[error("Provided input was empty")]
    Empty,

    /// I/O error.
    ///
    /// Wraps standard I/O errors from reading library images, process memory maps,
    /// input devices, or spawning threads.
    #[error("{0}")]
    Io(#[from] std::io::Error),

    /// Error from the goblin crate during ELF parsing.
    #[error("{0}")]
    GoblinErr(#[from] goblin::error::Error),

    /// Error from the JNI layer that is not tied to a named bridge stage.
    #[error("{0}")]
    Jni(#[from] jni::errors::Error),
}

impl Error {
    /// Returns the stable classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ModuleNotFound { .. } => ErrorKind::ModuleNotFound,
            Error::SymbolNotFound { .. } => ErrorKind::SymbolNotFound,
            Error::LoadFailed { .. } => ErrorKind::LoadFailed,
            Error::AlreadyInitialized => ErrorKind::AlreadyInitialized,
            Error::VmCreationFailed(_) => ErrorKind::VmCreationFailed,
            Error::UnsupportedPlatformVersion(_) => ErrorKind::UnsupportedPlatformVersion,
            Error::OffsetValidationFailed { .. } => ErrorKind::OffsetValidationFailed,
            Error::ReadBackMismatch { .. } => ErrorKind::ReadBackMismatch,
            Error::ManagedCallFailed { .. } => ErrorKind::ManagedCallFailed,
            Error::PendingManagedException { .. } => ErrorKind::PendingManagedException,
            Error::SignatureMismatch { .. } => ErrorKind::SignatureMismatch,
            Error::ModuleNotLoaded { .. } => ErrorKind::ModuleNotLoaded,
            Error::ForeignModule { .. } => ErrorKind::ForeignModule,
            Error::SymbolOutOfBounds { .. } => ErrorKind::SymbolOutOfBounds,
            Error::NotReady(_) => ErrorKind::NotReady,
            Error::InsufficientPrivilege { .. } => ErrorKind::InsufficientPrivilege,
            Error::OffsetTable(_) => ErrorKind::OffsetTable,
            Error::Malformed { .. } => ErrorKind::Malformed,
            Error::OutOfBounds => ErrorKind::OutOfBounds,
            Error::Empty => ErrorKind::Empty,
            Error::Io(_) => ErrorKind::Io,
            Error::GoblinErr(_) => ErrorKind::Goblin,
            Error::Jni(_) => ErrorKind::Jni,
        }
    }

    /// Returns the native status code carried by this error, if any.
    #[must_use]
    pub fn status(&self) -> Option<i32> {
        match self {
            Error::VmCreationFailed(code) => Some(*code),
            Error::Io(error) => error.raw_os_error(),
            _ => None,
        }
    }
}

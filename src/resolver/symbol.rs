//! Resolved symbols and the typed entry points they can be turned into.
//!
//! A [`ResolvedSymbol`] is only an address plus provenance. Turning it into something
//! callable goes through [`ResolvedSymbol::entry`], which checks, in order, that the
//! symbol is presented with the module it was resolved from, that the module is still
//! loaded, that the symbol was resolved for the same calling convention as the call
//! site expects, and that the address lies within the module. Only then is the
//! address reinterpreted as a function pointer of the matching type.

use std::ffi::{c_char, c_int, c_void};

use jni::sys::{jint, JNIEnv, JavaVM};
use strum::{Display, IntoStaticStr};

use crate::{
    resolver::module::{LoadedModule, ModuleId, ModuleState},
    Error, Result,
};

/// Calling-convention tag a symbol is resolved for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
pub enum SignatureTag {
    /// `jint JNI_CreateJavaVM(JavaVM**, JNIEnv**, void*)`
    JniCreateJavaVm,
    /// `JniInvocationImpl* JniInvocationCreate()`
    JniInvocationCreate,
    /// `bool JniInvocationInit(JniInvocationImpl*, const char*)`
    JniInvocationInit,
    /// `jint AndroidRuntime::startReg(JNIEnv*)`
    StartRegistration,
    /// Address of a data object, never called
    DataPointer,
}

/// Where a symbol's address came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SymbolSource {
    /// Answered by the platform loader's lookup.
    Loader,
    /// Computed from the module's on-disk image and load bias.
    Image,
}

/// A symbol to resolve, together with how it will be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolRequest<'a> {
    /// Exact (mangled) symbol name
    pub name: &'a str,
    /// Intended calling convention
    pub tag: SignatureTag,
}

impl<'a> SymbolRequest<'a> {
    /// Requests `name` for use as `tag`.
    pub const fn new(name: &'a str, tag: SignatureTag) -> Self {
        SymbolRequest { name, tag }
    }
}

/// An address resolved within one specific module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSymbol {
    pub(crate) module: ModuleId,
    pub(crate) name: String,
    pub(crate) address: usize,
    pub(crate) tag: SignatureTag,
    pub(crate) source: SymbolSource,
}

impl ResolvedSymbol {
    /// Module the symbol was resolved from.
    pub fn module(&self) -> ModuleId {
        self.module
    }

    /// The symbol name as requested.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runtime address.
    pub fn address(&self) -> usize {
        self.address
    }

    /// Calling-convention tag the symbol was resolved for.
    pub fn tag(&self) -> SignatureTag {
        self.tag
    }

    /// How the address was obtained.
    pub fn source(&self) -> SymbolSource {
        self.source
    }

    /// Validates the symbol against `module` and returns it as a typed entry point.
    ///
    /// # Errors
    /// - [`Error::ForeignModule`] if `module` is not the module this symbol came from
    /// - [`Error::ModuleNotLoaded`] if the module was torn down or never finished loading
    /// - [`Error::SignatureMismatch`] if `E::TAG` differs from the resolved tag
    /// - [`Error::SymbolOutOfBounds`] if the address lies outside the module
    pub fn entry<E: EntryPoint>(&self, module: &LoadedModule) -> Result<E::Target> {
        self.validate(module, E::TAG)?;

        // Safety: the address was resolved for this exact signature inside a loaded module
        Ok(unsafe { E::from_address(self.address) })
    }

    /// Validates a [`SignatureTag::DataPointer`] symbol and returns its address.
    ///
    /// # Errors
    /// Same as [`ResolvedSymbol::entry`].
    pub fn data(&self, module: &LoadedModule) -> Result<usize> {
        self.validate(module, SignatureTag::DataPointer)?;
        Ok(self.address)
    }

    fn validate(&self, module: &LoadedModule, expected: SignatureTag) -> Result<()> {
        if module.id() != self.module {
            return Err(Error::ForeignModule {
                symbol: self.name.clone(),
            });
        }

        if module.state() != ModuleState::Loaded {
            return Err(Error::ModuleNotLoaded {
                module: module.path().display().to_string(),
            });
        }

        if expected != self.tag {
            return Err(Error::SignatureMismatch {
                symbol: self.name.clone(),
                expected: expected.into(),
                found: self.tag.into(),
            });
        }

        if !module.contains(self.address) {
            return Err(Error::SymbolOutOfBounds {
                symbol: self.name.clone(),
                address: self.address,
            });
        }

        Ok(())
    }
}

/// A callable entry point with a fixed signature.
pub trait EntryPoint {
    /// Tag a symbol must have been resolved with.
    const TAG: SignatureTag;

    /// Function pointer type of the entry point.
    type Target: Copy;

    /// Reinterprets `address` as the entry point's function pointer.
    ///
    /// # Safety
    /// `address` must be the start of a function with exactly this signature.
    unsafe fn from_address(address: usize) -> Self::Target;
}

macro_rules! entry_point {
    ($(#[$meta:meta])* $name:ident, $tag:expr, $target:ty) => {
        $(#[$meta])*
        pub struct $name;

        impl EntryPoint for $name {
            const TAG: SignatureTag = $tag;
            type Target = $target;

            unsafe fn from_address(address: usize) -> Self::Target {
                unsafe { std::mem::transmute::<usize, $target>(address) }
            }
        }
    };
}

/// `JNI_CreateJavaVM` signature.
pub type CreateJavaVmFn =
    unsafe extern "system" fn(*mut *mut JavaVM, *mut *mut JNIEnv, *mut c_void) -> jint;
/// `JniInvocationCreate` signature.
pub type JniInvocationCreateFn = unsafe extern "C" fn() -> *mut c_void;
/// `JniInvocationInit` signature.
pub type JniInvocationInitFn = unsafe extern "C" fn(*mut c_void, *const c_char) -> bool;
/// `AndroidRuntime::startReg` signature.
pub type StartRegFn = unsafe extern "C" fn(*mut JNIEnv) -> c_int;

entry_point!(
    /// The VM creation entry point.
    CreateJavaVm,
    SignatureTag::JniCreateJavaVm,
    CreateJavaVmFn
);
entry_point!(
    /// Allocates the invocation indirection used to select the VM library.
    JniInvocationCreate,
    SignatureTag::JniInvocationCreate,
    JniInvocationCreateFn
);
entry_point!(
    /// Initialises the invocation indirection.
    JniInvocationInit,
    SignatureTag::JniInvocationInit,
    JniInvocationInitFn
);
entry_point!(
    /// Registers the runtime library's native methods with the VM.
    StartRegistration,
    SignatureTag::StartRegistration,
    StartRegFn
);

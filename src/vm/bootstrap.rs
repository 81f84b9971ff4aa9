//! Creating the process's one virtual machine.

use std::{
    ffi::{c_char, c_void, CString},
    ptr::{self, NonNull},
};

use jni::sys::{
    jint, JNIEnv, JavaVM, JavaVMInitArgs, JavaVMOption, JNI_EINVAL, JNI_ENOMEM, JNI_ERR, JNI_FALSE, JNI_OK,
    JNI_TRUE, JNI_VERSION_1_6,
};
use tracing::{debug, info, warn};

use crate::{
    resolver::{CreateJavaVmFn, JniInvocationCreateFn, JniInvocationInitFn},
    vm::{Lifecycle, VmHandle},
    Error, Result,
};

/// Arguments passed to the VM creation entry point.
///
/// # Examples
///
/// ```rust
/// use droidstrap::vm::VmOptions;
///
/// let options = VmOptions::default()
///     .with_option("-Xcheck:jni")
///     .with_option("-Djava.class.path=/data/local/tmp/helper.dex");
/// assert_eq!(options.options.len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmOptions {
    /// Requested JNI version
    pub version: jint,
    /// Option strings (`-Xmx64m`, `-Dkey=value`, ...)
    pub options: Vec<String>,
    /// Whether the VM should skip options it does not recognise
    pub ignore_unrecognized: bool,
}

impl Default for VmOptions {
    fn default() -> Self {
        VmOptions {
            version: JNI_VERSION_1_6,
            options: Vec::new(),
            ignore_unrecognized: true,
        }
    }
}

impl VmOptions {
    /// Appends one option string.
    pub fn with_option(mut self, option: impl Into<String>) -> Self {
        self.options.push(option.into());
        self
    }

    /// Sets the requested JNI version.
    pub fn with_version(mut self, version: jint) -> Self {
        self.version = version;
        self
    }

    /// Makes the VM reject options it does not recognise.
    pub fn strict(mut self) -> Self {
        self.ignore_unrecognized = false;
        self
    }
}

/// Creates the VM, at most once per [`Lifecycle`].
///
/// The first call claims the lifecycle before anything else happens, so concurrent or
/// repeated calls fail with [`Error::AlreadyInitialized`] without ever reaching the
/// native entry point. A failed creation leaves the lifecycle `Failed`.
pub struct VmBootstrapper<'a> {
    lifecycle: &'a Lifecycle,
}

impl VmBootstrapper<'static> {
    /// A bootstrapper over the process-wide lifecycle.
    pub fn global() -> Self {
        VmBootstrapper::new(Lifecycle::global())
    }
}

impl<'a> VmBootstrapper<'a> {
    /// A bootstrapper over `lifecycle`.
    pub fn new(lifecycle: &'a Lifecycle) -> Self {
        VmBootstrapper { lifecycle }
    }

    /// Calls `entry` to create the VM and records it in the lifecycle.
    ///
    /// On success the lifecycle stays `Bootstrapping` until the runtime patcher has
    /// registered the VM.
    ///
    /// # Errors
    /// - [`Error::AlreadyInitialized`] if a creation was already attempted
    /// - [`Error::VmCreationFailed`] with the entry point's status on failure, or with
    ///   `JNI_EINVAL` if an option string contains a NUL byte
    pub fn create(&self, entry: CreateJavaVmFn, options: &VmOptions) -> Result<VmHandle> {
        self.create_invoked(None, None, entry, options)
            .map(|(vm, _)| vm)
    }

    /// Initialises the platform's JNI invocation, when its entry points are given, and
    /// then creates the VM as [`VmBootstrapper::create`] does.
    ///
    /// The lifecycle is claimed before the invocation runs, so a failed initialisation
    /// leaves it `Failed` exactly like a failed creation.
    ///
    /// # Errors
    /// Same as [`VmBootstrapper::create`], plus the errors of [`JniInvocation::init`].
    pub fn create_invoked(
        &self,
        invocation: Option<(JniInvocationCreateFn, JniInvocationInitFn)>,
        provider: Option<&str>,
        entry: CreateJavaVmFn,
        options: &VmOptions,
    ) -> Result<(VmHandle, Option<JniInvocation>)> {
        self.lifecycle.begin()?;

        let created = invocation
            .map(|(create, init)| JniInvocation::init(create, init, provider))
            .transpose()
            .and_then(|invocation| {
                let vm = invoke(entry, options)?;
                self.lifecycle.record_vm(vm)?;
                Ok((vm, invocation))
            });

        match created {
            Ok((vm, invocation)) => {
                info!(vm = format_args!("{:#x}", vm.identity()), "virtual machine created");
                Ok((vm, invocation))
            }
            Err(error) => {
                self.lifecycle.mark_failed();
                Err(error)
            }
        }
    }
}

fn invoke(entry: CreateJavaVmFn, options: &VmOptions) -> Result<VmHandle> {
    let strings = options
        .options
        .iter()
        .map(|option| CString::new(option.as_str()))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| Error::VmCreationFailed(JNI_EINVAL))?;

    let mut raw: Vec<JavaVMOption> = strings
        .iter()
        .map(|option| JavaVMOption {
            optionString: option.as_ptr() as *mut c_char,
            extraInfo: ptr::null_mut(),
        })
        .collect();

    let mut args = JavaVMInitArgs {
        version: options.version,
        nOptions: raw.len() as jint,
        options: raw.as_mut_ptr(),
        ignoreUnrecognized: if options.ignore_unrecognized {
            JNI_TRUE
        } else {
            JNI_FALSE
        },
    };

    let mut vm: *mut JavaVM = ptr::null_mut();
    let mut env: *mut JNIEnv = ptr::null_mut();
    debug!(options = raw.len(), version = options.version, "calling VM creation entry point");

    // Safety: entry was resolved and validated as JNI_CreateJavaVM; args and the option
    // strings it points to outlive the call
    let status = unsafe { entry(&mut vm, &mut env, &mut args as *mut JavaVMInitArgs as *mut c_void) };
    if status != JNI_OK {
        return Err(Error::VmCreationFailed(status));
    }

    VmHandle::from_raw(vm, env).ok_or(Error::VmCreationFailed(JNI_ERR))
}

/// The platform's JNI invocation indirection, which selects the VM library.
///
/// Newer platforms expect it to be initialised before `JNI_CreateJavaVM` runs. The
/// instance is never freed.
#[derive(Debug)]
pub struct JniInvocation {
    instance: NonNull<c_void>,
}

impl JniInvocation {
    /// Creates and initialises the invocation.
    ///
    /// `provider` names the VM library; `None` lets the platform pick its default.
    ///
    /// # Errors
    /// Returns [`Error::VmCreationFailed`] if either call fails.
    pub fn init(
        create: JniInvocationCreateFn,
        init: JniInvocationInitFn,
        provider: Option<&str>,
    ) -> Result<Self> {
        let provider = provider
            .map(CString::new)
            .transpose()
            .map_err(|_| Error::VmCreationFailed(JNI_EINVAL))?;

        // Safety: create was resolved and validated as JniInvocationCreate
        let instance = NonNull::new(unsafe { create() })
            .ok_or(Error::VmCreationFailed(JNI_ENOMEM))?;

        // The invocation keeps the library name pointer, so it lives as long as the process
        let provider = provider.map_or(ptr::null(), |name| name.into_raw() as *const c_char);

        // Safety: instance came from JniInvocationCreate; provider is null or NUL-terminated
        if unsafe { init(instance.as_ptr(), provider) } {
            debug!("JNI invocation initialised");
            Ok(JniInvocation { instance })
        } else {
            warn!("JNI invocation initialisation failed");
            Err(Error::VmCreationFailed(JNI_ERR))
        }
    }

    /// The raw invocation instance.
    pub fn as_ptr(&self) -> *mut c_void {
        self.instance.as_ptr()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use super::*;
    use crate::{vm::RuntimeState, ErrorKind};

    static CREATED: AtomicUsize = AtomicUsize::new(0);
    static SEEN_OPTIONS: Mutex<Vec<String>> = Mutex::new(Vec::new());

    unsafe extern "system" fn recording_create(
        vm: *mut *mut JavaVM,
        env: *mut *mut JNIEnv,
        args: *mut c_void,
    ) -> jint {
        CREATED.fetch_add(1, Ordering::SeqCst);

        let args = &*(args as *const JavaVMInitArgs);
        let options = std::slice::from_raw_parts(args.options, args.nOptions as usize);
        let mut seen = SEEN_OPTIONS.lock().unwrap();
        for option in options {
            seen.push(
                std::ffi::CStr::from_ptr(option.optionString)
                    .to_string_lossy()
                    .into_owned(),
            );
        }

        *vm = 0x1000 as *mut JavaVM;
        *env = 0x2000 as *mut JNIEnv;
        JNI_OK
    }

    static FAILED: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "system" fn failing_create(
        _vm: *mut *mut JavaVM,
        _env: *mut *mut JNIEnv,
        _args: *mut c_void,
    ) -> jint {
        FAILED.fetch_add(1, Ordering::SeqCst);
        JNI_ENOMEM
    }

    unsafe extern "system" fn null_create(
        _vm: *mut *mut JavaVM,
        _env: *mut *mut JNIEnv,
        _args: *mut c_void,
    ) -> jint {
        JNI_OK
    }

    #[test]
    fn creates_once() {
        let lifecycle = Lifecycle::new();
        let bootstrapper = VmBootstrapper::new(&lifecycle);
        let options = VmOptions::default().with_option("-Xcheck:jni");

        let vm = bootstrapper.create(recording_create, &options).unwrap();
        assert_eq!(vm.identity(), 0x1000);
        assert_eq!(lifecycle.state(), RuntimeState::Bootstrapping);
        assert_eq!(lifecycle.pending_vm().unwrap(), vm);
        assert_eq!(*SEEN_OPTIONS.lock().unwrap(), vec!["-Xcheck:jni".to_string()]);

        let error = bootstrapper.create(recording_create, &options).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::AlreadyInitialized);
        assert_eq!(CREATED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failure_is_reported_and_final() {
        let lifecycle = Lifecycle::new();
        let bootstrapper = VmBootstrapper::new(&lifecycle);

        let error = bootstrapper
            .create(failing_create, &VmOptions::default())
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::VmCreationFailed);
        assert_eq!(error.status(), Some(JNI_ENOMEM));
        assert_eq!(lifecycle.state(), RuntimeState::Failed);

        let error = bootstrapper
            .create(failing_create, &VmOptions::default())
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::AlreadyInitialized);
        assert_eq!(FAILED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn null_vm_is_a_failure() {
        let lifecycle = Lifecycle::new();
        let error = VmBootstrapper::new(&lifecycle)
            .create(null_create, &VmOptions::default())
            .unwrap_err();

        assert_eq!(error.status(), Some(JNI_ERR));
        assert_eq!(lifecycle.state(), RuntimeState::Failed);
    }

    #[test]
    fn nul_in_option() {
        let lifecycle = Lifecycle::new();
        let options = VmOptions::default().with_option("-Dbad=\0");

        let error = VmBootstrapper::new(&lifecycle)
            .create(null_create, &options)
            .unwrap_err();
        assert_eq!(error.status(), Some(JNI_EINVAL));
        assert_eq!(lifecycle.state(), RuntimeState::Failed);
    }

    unsafe extern "C" fn invocation_create() -> *mut c_void {
        0x3000 as *mut c_void
    }

    unsafe extern "C" fn invocation_init(instance: *mut c_void, provider: *const c_char) -> bool {
        instance as usize == 0x3000 && provider.is_null()
    }

    unsafe extern "C" fn invocation_refuse(_instance: *mut c_void, _provider: *const c_char) -> bool {
        false
    }

    static CREATED_AFTER_REFUSAL: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "system" fn counting_create(
        vm: *mut *mut JavaVM,
        env: *mut *mut JNIEnv,
        _args: *mut c_void,
    ) -> jint {
        CREATED_AFTER_REFUSAL.fetch_add(1, Ordering::SeqCst);
        *vm = 0x1000 as *mut JavaVM;
        *env = 0x2000 as *mut JNIEnv;
        JNI_OK
    }

    #[test]
    fn invocation_runs_before_creation() {
        let lifecycle = Lifecycle::new();
        let (vm, invocation) = VmBootstrapper::new(&lifecycle)
            .create_invoked(
                Some((invocation_create, invocation_init)),
                None,
                invoked_create,
                &VmOptions::default(),
            )
            .unwrap();

        assert_eq!(vm.identity(), 0x4000);
        assert_eq!(invocation.unwrap().as_ptr() as usize, 0x3000);
        assert_eq!(lifecycle.state(), RuntimeState::Bootstrapping);
    }

    unsafe extern "system" fn invoked_create(
        vm: *mut *mut JavaVM,
        env: *mut *mut JNIEnv,
        _args: *mut c_void,
    ) -> jint {
        *vm = 0x4000 as *mut JavaVM;
        *env = 0x5000 as *mut JNIEnv;
        JNI_OK
    }

    #[test]
    fn refused_invocation_fails_the_lifecycle() {
        let lifecycle = Lifecycle::new();
        let bootstrapper = VmBootstrapper::new(&lifecycle);

        let error = bootstrapper
            .create_invoked(
                Some((invocation_create, invocation_refuse)),
                None,
                counting_create,
                &VmOptions::default(),
            )
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::VmCreationFailed);
        assert_eq!(error.status(), Some(JNI_ERR));
        assert_eq!(lifecycle.state(), RuntimeState::Failed);
        assert_eq!(CREATED_AFTER_REFUSAL.load(Ordering::SeqCst), 0);

        let error = bootstrapper
            .create(counting_create, &VmOptions::default())
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::AlreadyInitialized);
        assert_eq!(CREATED_AFTER_REFUSAL.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn jni_invocation() {
        let invocation = JniInvocation::init(invocation_create, invocation_init, None).unwrap();
        assert_eq!(invocation.as_ptr() as usize, 0x3000);

        let error =
            JniInvocation::init(invocation_create, invocation_refuse, Some("libart.so")).unwrap_err();
        assert_eq!(error.status(), Some(JNI_ERR));
    }
}

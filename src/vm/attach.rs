//! Scoped attachment of threads to the VM.
//!
//! Every thread that touches managed code must be attached. [`AttachScope`] attaches
//! on entry when the thread is not attached yet and detaches on drop only if it did
//! the attaching itself, so nested scopes and threads attached by someone else are
//! left alone. Each attach performed by a scope is paired with exactly one detach.

use std::{
    ffi::c_void,
    marker::PhantomData,
    ptr,
    sync::atomic::{AtomicUsize, Ordering},
    thread::{self, JoinHandle},
};

use jni::{
    sys::{self, JNI_OK, JNI_VERSION_1_6},
    JNIEnv,
};
use tracing::{trace, warn};

use crate::{vm::VmHandle, Error, Result};

static PROCESS_COUNTERS: AttachCounters = AttachCounters::new();

/// The part of the invocation interface thread attachment needs.
pub trait InvocationApi: Send + Sync {
    /// The calling thread's environment, if it is attached.
    fn current_env(&self) -> Option<*mut sys::JNIEnv>;

    /// Attaches the calling thread.
    fn attach_current_thread(&self) -> Result<*mut sys::JNIEnv>;

    /// Detaches the calling thread.
    fn detach_current_thread(&self) -> Result<()>;
}

impl InvocationApi for VmHandle {
    fn current_env(&self) -> Option<*mut sys::JNIEnv> {
        let vm = self.as_raw();
        let mut env: *mut c_void = ptr::null_mut();

        // Safety: vm is the live JavaVM created by the bootstrapper
        let status = unsafe { ((**vm).GetEnv?)(vm, &mut env, JNI_VERSION_1_6) };
        (status == JNI_OK && !env.is_null()).then_some(env.cast())
    }

    fn attach_current_thread(&self) -> Result<*mut sys::JNIEnv> {
        let vm = self.as_raw();
        let mut env: *mut c_void = ptr::null_mut();

        // Safety: vm is the live JavaVM created by the bootstrapper
        let status = unsafe {
            let attach = (**vm)
                .AttachCurrentThread
                .ok_or(Error::Jni(jni::errors::Error::JNIEnvMethodNotFound(
                    "AttachCurrentThread",
                )))?;
            attach(vm, &mut env, ptr::null_mut())
        };

        if status != JNI_OK || env.is_null() {
            return Err(Error::Jni(jni::errors::Error::JniCall(
                jni::errors::JniError::Other(status),
            )));
        }

        Ok(env.cast())
    }

    fn detach_current_thread(&self) -> Result<()> {
        let vm = self.as_raw();

        // Safety: vm is the live JavaVM created by the bootstrapper
        let status = unsafe {
            let detach = (**vm)
                .DetachCurrentThread
                .ok_or(Error::Jni(jni::errors::Error::JNIEnvMethodNotFound(
                    "DetachCurrentThread",
                )))?;
            detach(vm)
        };

        if status == JNI_OK {
            Ok(())
        } else {
            Err(Error::Jni(jni::errors::Error::JniCall(
                jni::errors::JniError::Other(status),
            )))
        }
    }
}

/// Attach and detach counts.
#[derive(Debug)]
pub struct AttachCounters {
    attaches: AtomicUsize,
    detaches: AtomicUsize,
}

impl AttachCounters {
    /// Zeroed counters.
    pub const fn new() -> Self {
        AttachCounters {
            attaches: AtomicUsize::new(0),
            detaches: AtomicUsize::new(0),
        }
    }

    /// A snapshot of the counts.
    pub fn stats(&self) -> AttachStats {
        AttachStats {
            attaches: self.attaches.load(Ordering::Acquire),
            detaches: self.detaches.load(Ordering::Acquire),
        }
    }
}

impl Default for AttachCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of [`AttachCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AttachStats {
    /// Attaches performed by scopes
    pub attaches: usize,
    /// Detaches performed by scopes
    pub detaches: usize,
}

impl AttachStats {
    /// Scopes currently holding an attachment they own.
    pub fn outstanding(&self) -> usize {
        self.attaches.saturating_sub(self.detaches)
    }
}

/// Process-wide counts of attaches and detaches performed by [`AttachScope`]s.
pub fn attach_stats() -> AttachStats {
    PROCESS_COUNTERS.stats()
}

/// A thread's attachment to the VM, for the lifetime of the scope.
///
/// The scope is neither `Send` nor `Sync`: the attachment belongs to the thread that
/// entered it.
pub struct AttachScope<'a, V: InvocationApi + ?Sized> {
    api: &'a V,
    counters: &'a AttachCounters,
    env: *mut sys::JNIEnv,
    owned: bool,
    _thread: PhantomData<*mut ()>,
}

impl<'a, V: InvocationApi + ?Sized> AttachScope<'a, V> {
    /// Attaches the calling thread unless it already is.
    ///
    /// # Errors
    /// Returns [`Error::Jni`] if the VM refuses the attachment.
    pub fn enter(api: &'a V) -> Result<Self> {
        Self::enter_counted(api, &PROCESS_COUNTERS)
    }

    /// As [`AttachScope::enter`], counting into `counters` instead of the process totals.
    ///
    /// # Errors
    /// Returns [`Error::Jni`] if the VM refuses the attachment.
    pub fn enter_counted(api: &'a V, counters: &'a AttachCounters) -> Result<Self> {
        if let Some(env) = api.current_env() {
            return Ok(AttachScope {
                api,
                counters,
                env,
                owned: false,
                _thread: PhantomData,
            });
        }

        let env = api.attach_current_thread()?;
        counters.attaches.fetch_add(1, Ordering::AcqRel);
        trace!("thread attached");

        Ok(AttachScope {
            api,
            counters,
            env,
            owned: true,
            _thread: PhantomData,
        })
    }

    /// Returns true if this scope attached the thread and will detach it.
    pub fn is_owner(&self) -> bool {
        self.owned
    }

    /// The thread's raw environment.
    pub fn env_raw(&self) -> *mut sys::JNIEnv {
        self.env
    }

    /// The thread's environment.
    ///
    /// # Errors
    /// Returns [`Error::Jni`] if the environment pointer is null.
    pub fn env(&self) -> Result<JNIEnv<'_>> {
        // Safety: env belongs to this thread and stays valid while the scope is alive
        Ok(unsafe { JNIEnv::from_raw(self.env) }?)
    }
}

impl<V: InvocationApi + ?Sized> Drop for AttachScope<'_, V> {
    fn drop(&mut self) {
        if !self.owned {
            return;
        }

        self.counters.detaches.fetch_add(1, Ordering::AcqRel);
        match self.api.detach_current_thread() {
            Ok(()) => trace!("thread detached"),
            Err(error) => warn!(%error, "detaching thread failed"),
        }
    }
}

/// Spawns a named thread that runs `work` attached to `vm`.
///
/// The thread is detached again when `work` returns, whether it succeeded or not.
///
/// # Errors
/// Returns [`Error::Io`] if the thread cannot be spawned. Errors of `work`, including
/// a refused attachment, are returned through the join handle.
pub fn spawn_attached<F, T>(name: &str, vm: VmHandle, work: F) -> Result<JoinHandle<Result<T>>>
where
    F: FnOnce(&mut JNIEnv<'_>) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
        let scope = AttachScope::enter(&vm)?;
        let mut env = scope.env()?;
        work(&mut env)
    })?;

    Ok(handle)
}

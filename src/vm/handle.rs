use std::ptr::NonNull;

use jni::{sys, JNIEnv, JavaVM};

use crate::Result;

/// Identity of the process's virtual machine.
///
/// Holds the raw invocation interface and the environment of the thread that created
/// the VM. The handle is only ever produced by [`crate::vm::VmBootstrapper`] and read
/// back through [`crate::vm::Lifecycle`]; it is `Copy` because the VM it names lives
/// for the rest of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmHandle {
    vm: NonNull<sys::JavaVM>,
    env: NonNull<sys::JNIEnv>,
}

// Safety: a JavaVM pointer is valid process-wide and from every thread; the creating
// thread's JNIEnv is only turned into a wrapper through the unsafe `main_env`
unsafe impl Send for VmHandle {}
unsafe impl Sync for VmHandle {}

impl VmHandle {
    pub(crate) fn from_raw(vm: *mut sys::JavaVM, env: *mut sys::JNIEnv) -> Option<Self> {
        Some(VmHandle {
            vm: NonNull::new(vm)?,
            env: NonNull::new(env)?,
        })
    }

    /// The raw `JavaVM*`.
    pub fn as_raw(&self) -> *mut sys::JavaVM {
        self.vm.as_ptr()
    }

    /// The value the runtime library's singleton must hold to refer to this VM.
    pub fn identity(&self) -> usize {
        self.vm.as_ptr() as usize
    }

    /// The raw `JNIEnv*` of the thread that created the VM.
    pub fn main_env_raw(&self) -> *mut sys::JNIEnv {
        self.env.as_ptr()
    }

    /// A safe wrapper around the invocation interface.
    ///
    /// # Errors
    /// Returns [`crate::Error::Jni`] if the interface table is null.
    pub fn java_vm(&self) -> Result<JavaVM> {
        // Safety: the pointer came from a successful JNI_CreateJavaVM
        Ok(unsafe { JavaVM::from_raw(self.as_raw()) }?)
    }

    /// The creating thread's environment.
    ///
    /// # Safety
    /// Must only be called on the thread that created the VM.
    pub unsafe fn main_env<'local>(&self) -> Result<JNIEnv<'local>> {
        Ok(unsafe { JNIEnv::from_raw(self.main_env_raw()) }?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_pointers_are_rejected() {
        let vm = 0x1000 as *mut sys::JavaVM;
        let env = 0x2000 as *mut sys::JNIEnv;

        assert!(VmHandle::from_raw(std::ptr::null_mut(), env).is_none());
        assert!(VmHandle::from_raw(vm, std::ptr::null_mut()).is_none());

        let handle = VmHandle::from_raw(vm, env).unwrap();
        assert_eq!(handle.identity(), 0x1000);
        assert_eq!(handle.main_env_raw(), env);
    }
}

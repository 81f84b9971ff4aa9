//! Pending managed exceptions.
//!
//! A JNI environment with a pending exception rejects every further call. Each call
//! the bridge makes therefore goes through [`guarded`], which inspects and clears the
//! environment afterwards whether or not the call itself reported an error.

use jni::{
    objects::{JObject, JString},
    JNIEnv,
};
use tracing::warn;

use crate::{Error, Result};

/// Inspection and clearing of a thread's pending managed exception.
pub trait ExceptionState {
    /// Returns true if an exception is pending.
    fn exception_pending(&mut self) -> bool;

    /// Clears the pending exception and returns its message, or `None` if nothing
    /// was pending.
    fn take_exception(&mut self) -> Option<String>;
}

impl ExceptionState for JNIEnv<'_> {
    fn exception_pending(&mut self) -> bool {
        self.exception_check().unwrap_or(false)
    }

    fn take_exception(&mut self) -> Option<String> {
        if !self.exception_pending() {
            return None;
        }

        let throwable = self.exception_occurred().ok();
        let _ = self.exception_describe();
        let _ = self.exception_clear();

        let message = throwable.and_then(|throwable| {
            string_call(self, &throwable, "getMessage")
                .or_else(|| string_call(self, &throwable, "toString"))
        });

        Some(message.unwrap_or_else(|| "<no message>".to_string()))
    }
}

/// Calls a `()Ljava/lang/String;` method, swallowing anything it throws.
fn string_call(env: &mut JNIEnv<'_>, object: &JObject<'_>, method: &str) -> Option<String> {
    if object.is_null() {
        return None;
    }

    let value = env
        .call_method(object, method, "()Ljava/lang/String;", &[])
        .and_then(|value| value.l());
    if env.exception_pending() {
        let _ = env.exception_clear();
        return None;
    }

    let value = value.ok().filter(|value| !value.is_null())?;
    let value = JString::from(value);
    let text: String = env.get_string(&value).ok()?.into();
    Some(text)
}

/// Runs one managed call for `stage` and leaves the environment without a pending
/// exception.
///
/// # Errors
/// - [`Error::PendingManagedException`] if the call left an exception pending, even when
///   the call itself succeeded
/// - [`Error::ManagedCallFailed`] if the call failed without an exception
pub fn guarded<E, T, F>(env: &mut E, stage: &str, call: F) -> Result<T>
where
    E: ExceptionState + ?Sized,
    F: FnOnce(&mut E) -> jni::errors::Result<T>,
{
    let outcome = call(env);

    if let Some(message) = env.take_exception() {
        warn!(stage, %message, "managed exception cleared");
        return Err(Error::PendingManagedException {
            stage: stage.to_string(),
            message,
        });
    }

    outcome.map_err(|error| Error::ManagedCallFailed {
        stage: stage.to_string(),
        message: error.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{test::MockEnv, ErrorKind};

    #[test]
    fn successful_call() {
        let mut env = MockEnv::new();

        let value = guarded(&mut env, "display_info", |_| Ok(42)).unwrap();

        assert_eq!(value, 42);
        assert_eq!(env.cleared, 0);
    }

    #[test]
    fn exception_is_cleared_before_next_call() {
        let mut env = MockEnv::new();

        let error = guarded(&mut env, "system_main", |env| {
            env.throw("java.lang.IllegalStateException: no looper");
            Ok(())
        })
        .unwrap_err();

        match &error {
            Error::PendingManagedException { stage, message } => {
                assert_eq!(stage, "system_main");
                assert!(message.contains("no looper"));
            }
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(env.cleared, 1);

        let seen = guarded(&mut env, "system_context", |env| Ok(env.exception_pending()));
        assert!(!seen.unwrap());
    }

    #[test]
    fn exception_wins_over_call_error() {
        let mut env = MockEnv::new();

        let error = guarded::<_, (), _>(&mut env, "load_helper", |env| {
            env.throw("java.lang.ClassNotFoundException");
            Err(jni::errors::Error::JavaException)
        })
        .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::PendingManagedException);
        assert!(!env.exception_pending());
    }

    #[test]
    fn failure_without_exception() {
        let mut env = MockEnv::new();

        let error = guarded::<_, (), _>(&mut env, "create_surface", |_| {
            Err(jni::errors::Error::NullPtr("surface"))
        })
        .unwrap_err();

        match error {
            Error::ManagedCallFailed { stage, .. } => assert_eq!(stage, "create_surface"),
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(env.cleared, 0);
    }
}

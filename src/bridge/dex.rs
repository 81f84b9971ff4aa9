use jni::{
    objects::{GlobalRef, JObject, JValue},
    JNIEnv,
};
use tracing::info;

use crate::{bridge::guarded, platform::PlatformVersion, Error, Result};

pub(crate) const LOAD_HELPER: &str = "load_helper";

/// First API level with `dalvik.system.InMemoryDexClassLoader`.
pub const MIN_IN_MEMORY_API: u32 = 26;

/// Fails on platforms without an in-memory dex class loader.
///
/// # Errors
/// Returns [`Error::UnsupportedPlatformVersion`] below API 26.
pub fn require_in_memory_loader(version: &PlatformVersion) -> Result<()> {
    if version.api_level < MIN_IN_MEMORY_API {
        return Err(Error::UnsupportedPlatformVersion(version.to_string()));
    }
    Ok(())
}

/// Defines the classes of `dex` in a new loader parented to the system class loader
/// and returns `class` from it.
///
/// # Errors
/// - [`Error::UnsupportedPlatformVersion`] below API 26
/// - [`Error::PendingManagedException`] / [`Error::ManagedCallFailed`] for stage
///   `load_helper`
pub fn load_class(
    env: &mut JNIEnv<'_>,
    dex: &[u8],
    class: &str,
    version: &PlatformVersion,
) -> Result<GlobalRef> {
    require_in_memory_loader(version)?;
    info!(bytes = dex.len(), class, "injecting helper dex from memory");

    let loader = guarded(env, LOAD_HELPER, |env| {
        let bytes = env.byte_array_from_slice(dex)?;
        let buffer = env
            .call_static_method(
                "java/nio/ByteBuffer",
                "wrap",
                "([B)Ljava/nio/ByteBuffer;",
                &[JValue::Object(&bytes)],
            )?
            .l()?;
        let buffers = env.new_object_array(1, "java/nio/ByteBuffer", &buffer)?;

        let parent = env
            .call_static_method(
                "java/lang/ClassLoader",
                "getSystemClassLoader",
                "()Ljava/lang/ClassLoader;",
                &[],
            )?
            .l()?;

        env.new_object(
            "dalvik/system/InMemoryDexClassLoader",
            "([Ljava/nio/ByteBuffer;Ljava/lang/ClassLoader;)V",
            &[JValue::Object(&buffers), JValue::Object(&parent)],
        )
    })?;

    guarded(env, LOAD_HELPER, |env| {
        let name = env.new_string(class)?;
        let class = env
            .call_method(
                &loader,
                "loadClass",
                "(Ljava/lang/String;)Ljava/lang/Class;",
                &[JValue::Object(&name)],
            )?
            .l()?;
        if class.is_null() {
            return Err(jni::errors::Error::NullPtr("loadClass"));
        }
        env.new_global_ref(class)
    })
}

/// An empty `String[]`, the argument of a `main` method.
pub(crate) fn empty_args<'local>(
    env: &mut JNIEnv<'local>,
) -> jni::errors::Result<JObject<'local>> {
    Ok(env
        .new_object_array(0, "java/lang/String", JObject::null())?
        .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn in_memory_loader_needs_oreo() {
        assert!(require_in_memory_loader(&PlatformVersion::new(26, "8.0.0")).is_ok());
        assert!(require_in_memory_loader(&PlatformVersion::new(34, "14")).is_ok());

        let error = require_in_memory_loader(&PlatformVersion::new(25, "7.1.1")).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::UnsupportedPlatformVersion);
        assert!(error.to_string().contains("7.1.1 (API 25)"));
    }
}

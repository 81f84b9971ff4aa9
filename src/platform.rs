//! Platform version detection and privilege checks.

use std::{env, fmt};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Environment variable overriding the detected API level.
pub const API_LEVEL_ENV: &str = "DROIDSTRAP_API_LEVEL";

const SDK_PROPERTY: &str = "ro.build.version.sdk";
const RELEASE_PROPERTY: &str = "ro.build.version.release";

/// The Android platform a process runs on.
///
/// Offset table rows are keyed by either the API level or the exact release string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlatformVersion {
    /// SDK API level (`ro.build.version.sdk`)
    pub api_level: u32,
    /// User-visible release (`ro.build.version.release`)
    pub release: String,
}

impl PlatformVersion {
    /// Creates a version from its parts.
    pub fn new(api_level: u32, release: impl Into<String>) -> Self {
        PlatformVersion {
            api_level,
            release: release.into(),
        }
    }

    /// Detects the running platform.
    ///
    /// `DROIDSTRAP_API_LEVEL` takes precedence over system properties.
    ///
    /// # Errors
    /// Returns [`Error::UnsupportedPlatformVersion`] if neither source yields a
    /// parseable API level.
    pub fn detect() -> Result<Self> {
        if let Ok(level) = env::var(API_LEVEL_ENV) {
            return Self::from_api_level(&level);
        }

        let sdk = property(SDK_PROPERTY).unwrap_or_default();
        let mut version = Self::from_api_level(&sdk)?;
        if let Some(release) = property(RELEASE_PROPERTY).filter(|release| !release.is_empty()) {
            version.release = release;
        }

        Ok(version)
    }

    /// Parses an API level string, using it as the release string too.
    ///
    /// # Errors
    /// Returns [`Error::UnsupportedPlatformVersion`] if `level` is not a number.
    pub fn from_api_level(level: &str) -> Result<Self> {
        let level = level.trim();
        match level.parse::<u32>() {
            Ok(api_level) => Ok(PlatformVersion::new(api_level, level)),
            Err(_) => Err(Error::UnsupportedPlatformVersion(if level.is_empty() {
                "<unknown>".to_string()
            } else {
                level.to_string()
            })),
        }
    }
}

impl fmt::Display for PlatformVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (API {})", self.release, self.api_level)
    }
}

#[cfg(target_os = "android")]
fn property(name: &str) -> Option<String> {
    use std::ffi::{c_char, c_int, CStr, CString};

    // PROP_VALUE_MAX
    const VALUE_MAX: usize = 92;

    extern "C" {
        fn __system_property_get(name: *const c_char, value: *mut c_char) -> c_int;
    }

    let name = CString::new(name).ok()?;
    let mut value = [0 as c_char; VALUE_MAX];

    // Safety: value has room for PROP_VALUE_MAX bytes including the terminator
    let len = unsafe { __system_property_get(name.as_ptr(), value.as_mut_ptr()) };
    if len <= 0 {
        return None;
    }

    // Safety: the property service always NUL-terminates the value
    let value = unsafe { CStr::from_ptr(value.as_ptr()) };
    Some(value.to_string_lossy().into_owned())
}

#[cfg(not(target_os = "android"))]
fn property(_name: &str) -> Option<String> {
    None
}

/// Fails unless the process runs with effective uid 0.
///
/// # Errors
/// Returns [`Error::InsufficientPrivilege`] for any other effective uid.
pub fn require_root() -> Result<()> {
    // Safety: geteuid has no preconditions and cannot fail
    let euid = unsafe { libc::geteuid() };
    if euid == 0 {
        Ok(())
    } else {
        Err(Error::InsufficientPrivilege { euid })
    }
}

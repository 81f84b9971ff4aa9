//! Bootstrap configuration.
//!
//! [`BootstrapConfig`] gathers everything [`crate::Bootstrap`] needs: which libraries
//! to resolve from and where to look for them, the VM creation options, the offset
//! table, the bridge plan and an optional platform override.
//!
//! # Environment
//!
//! [`BootstrapConfig::from_env`] observes:
//!
//! - `DROIDSTRAP_OFFSETS` - Offset table file replacing the built-in table
//! - `DROIDSTRAP_DEX` - Helper dex file
//! - `DROIDSTRAP_API_LEVEL` - Platform API level, used instead of system properties
//!
//! # Example
//!
//! ```rust,no_run
//! use droidstrap::{BootstrapConfig, OffsetSource};
//!
//! let config = BootstrapConfig::from_env()
//!     .with_vm_option("-Xcheck:jni")
//!     .with_offsets(OffsetSource::File("/data/local/tmp/offsets.json".into()))
//!     .with_root_required();
//! assert_eq!(config.runtime_library, "libandroid_runtime.so");
//! ```

use std::{env, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    bridge::{BridgePlan, DexSource},
    patch::{OffsetTable, OFFSETS_ENV},
    platform::PlatformVersion,
    vm::VmOptions,
    Result,
};

/// The platform runtime library.
pub const RUNTIME_LIBRARY: &str = "libandroid_runtime.so";

/// Directories searched for libraries that are not mapped yet.
pub const DEFAULT_SEARCH_PATHS: [&str; 4] = [
    "/system/lib64",
    "/system/lib",
    "/apex/com.android.art/lib64",
    "/apex/com.android.art/lib",
];

/// Where the offset table comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffsetSource {
    /// The table shipped with the crate
    #[default]
    Builtin,
    /// A JSON file read at bootstrap
    File(PathBuf),
}

impl OffsetSource {
    /// Loads the table.
    ///
    /// # Errors
    /// Returns [`crate::Error::Io`] if the file cannot be read and
    /// [`crate::Error::OffsetTable`] if it is not a valid table.
    pub fn load(&self) -> Result<OffsetTable> {
        match self {
            OffsetSource::Builtin => OffsetTable::builtin(),
            OffsetSource::File(path) => OffsetTable::from_file(path),
        }
    }
}

/// Everything a bootstrap run is configured by.
///
/// The default configuration:
/// - Resolves every entry point from `libandroid_runtime.so`
/// - Searches the system and ART module library directories
/// - Creates a JNI 1.6 VM that ignores unrecognised options
/// - Uses the built-in offset table
/// - Lets the platform choose the JNI provider
/// - Runs the default [`BridgePlan`]
/// - Detects the platform version
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    /// Library resolved for the singleton, `startReg` and the JNI invocation.
    pub runtime_library: String,

    /// Library `JNI_CreateJavaVM` is resolved from.
    ///
    /// `None` resolves it from [`BootstrapConfig::runtime_library`], which re-exports
    /// the VM's entry point.
    pub vm_library: Option<String>,

    /// Directories searched for libraries that are not mapped yet.
    pub search_paths: Vec<PathBuf>,

    /// Options for the VM creation call.
    pub vm_options: VmOptions,

    /// Offset table to patch with.
    pub offsets: OffsetSource,

    /// VM library passed to `JniInvocationInit`; `None` selects the platform default.
    pub jni_provider: Option<String>,

    /// Managed calls of the context bridge.
    pub bridge: BridgePlan,

    /// Platform version to assume instead of detecting it.
    pub platform: Option<PlatformVersion>,

    /// Fail before doing anything unless running as root.
    pub require_root: bool,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        BootstrapConfig {
            runtime_library: RUNTIME_LIBRARY.to_string(),
            vm_library: None,
            search_paths: DEFAULT_SEARCH_PATHS.iter().map(PathBuf::from).collect(),
            vm_options: VmOptions::default(),
            offsets: OffsetSource::Builtin,
            jni_provider: None,
            bridge: BridgePlan::default(),
            platform: None,
            require_root: false,
        }
    }
}

impl BootstrapConfig {
    /// Creates a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// The default configuration with the process environment applied.
    ///
    /// `DROIDSTRAP_OFFSETS` selects an offset table file. `DROIDSTRAP_DEX` and
    /// `DROIDSTRAP_API_LEVEL` are picked up by [`DexSource::from_env`] and
    /// [`PlatformVersion::detect`].
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(path) = env::var_os(OFFSETS_ENV) {
            config.offsets = OffsetSource::File(PathBuf::from(path));
        }
        config
    }

    /// Sets the runtime library.
    pub fn with_runtime_library(mut self, library: impl Into<String>) -> Self {
        self.runtime_library = library.into();
        self
    }

    /// Resolves `JNI_CreateJavaVM` from `library` instead of the runtime library.
    pub fn with_vm_library(mut self, library: impl Into<String>) -> Self {
        self.vm_library = Some(library.into());
        self
    }

    /// Replaces the library search paths.
    pub fn with_search_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.search_paths = paths;
        self
    }

    /// Replaces the VM options.
    pub fn with_vm_options(mut self, options: VmOptions) -> Self {
        self.vm_options = options;
        self
    }

    /// Appends one VM option string.
    pub fn with_vm_option(mut self, option: impl Into<String>) -> Self {
        self.vm_options.options.push(option.into());
        self
    }

    /// Selects the offset table.
    pub fn with_offsets(mut self, offsets: OffsetSource) -> Self {
        self.offsets = offsets;
        self
    }

    /// Names the VM library `JniInvocationInit` loads.
    pub fn with_jni_provider(mut self, provider: impl Into<String>) -> Self {
        self.jni_provider = Some(provider.into());
        self
    }

    /// Replaces the bridge plan.
    pub fn with_bridge(mut self, plan: BridgePlan) -> Self {
        self.bridge = plan;
        self
    }

    /// Replaces the helper dex.
    pub fn with_dex(mut self, dex: DexSource) -> Self {
        self.bridge.helper.dex = dex;
        self
    }

    /// Assumes `version` instead of detecting it.
    pub fn with_platform(mut self, version: PlatformVersion) -> Self {
        self.platform = Some(version);
        self
    }

    /// Requires the process to run as root.
    pub fn with_root_required(mut self) -> Self {
        self.require_root = true;
        self
    }

    /// Library `JNI_CreateJavaVM` is resolved from.
    pub fn vm_library(&self) -> &str {
        self.vm_library.as_deref().unwrap_or(&self.runtime_library)
    }

    /// The configured platform version, or the detected one.
    ///
    /// # Errors
    /// Returns [`crate::Error::UnsupportedPlatformVersion`] if detection fails.
    pub fn platform(&self) -> Result<PlatformVersion> {
        match &self.platform {
            Some(version) => Ok(version.clone()),
            None => PlatformVersion::detect(),
        }
    }
}

//! The managed calls the bridge makes, as data.

use std::{
    borrow::Cow,
    env, fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::Result;

/// Environment variable naming the helper dex file.
pub const DEX_ENV: &str = "DROIDSTRAP_DEX";

const DEFAULT_DEX: &str = "classes.dex";

/// A managed method, named the way JNI names it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedMethod {
    /// Binary class name, `android/os/Looper`
    pub class: String,
    /// Method name
    pub name: String,
    /// JNI signature, `()V`
    pub signature: String,
}

impl ManagedMethod {
    /// Creates a method reference.
    pub fn new(class: &str, name: &str, signature: &str) -> Self {
        ManagedMethod {
            class: class.to_string(),
            name: name.to_string(),
            signature: signature.to_string(),
        }
    }
}

/// Where the helper dex comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DexSource {
    /// Read from a file when the bridge runs
    File(PathBuf),
    /// Supplied in memory
    Bytes(Vec<u8>),
}

impl DexSource {
    /// `DROIDSTRAP_DEX` if set, else `classes.dex` next to the executable.
    pub fn from_env() -> Self {
        if let Some(path) = env::var_os(DEX_ENV) {
            return DexSource::File(PathBuf::from(path));
        }

        let beside_exe = env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(DEFAULT_DEX)));
        DexSource::File(beside_exe.unwrap_or_else(|| PathBuf::from(DEFAULT_DEX)))
    }

    /// The dex bytes.
    ///
    /// # Errors
    /// Returns [`crate::Error::Io`] if the file cannot be read.
    pub fn load(&self) -> Result<Cow<'_, [u8]>> {
        match self {
            DexSource::File(path) => Ok(Cow::Owned(fs::read(path)?)),
            DexSource::Bytes(bytes) => Ok(Cow::Borrowed(bytes)),
        }
    }

    /// The file the dex is read from, if any.
    pub fn path(&self) -> Option<&Path> {
        match self {
            DexSource::File(path) => Some(path),
            DexSource::Bytes(_) => None,
        }
    }
}

impl Default for DexSource {
    fn default() -> Self {
        Self::from_env()
    }
}

/// The helper class injected from a dex.
///
/// The class provides `main(String[])`, `getDisplayInfo()[I`,
/// `createNativeWindow(IIZZ)Landroid/view/Surface;` and `injectTouchEvent(IJII)V`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelperPlan {
    /// Where the dex comes from
    pub dex: DexSource,
    /// Dotted class name passed to `loadClass`
    pub class: String,
    /// Create the surface hidden
    pub hidden: bool,
    /// Create the surface secure
    pub secure: bool,
}

impl Default for HelperPlan {
    fn default() -> Self {
        HelperPlan {
            dex: DexSource::default(),
            class: "com.example.mylibrary.Main".to_string(),
            hidden: true,
            secure: false,
        }
    }
}

/// The calls establishing an application context and a surface.
///
/// The stages always run in the same order; the plan only names what each one calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgePlan {
    /// Static `()V`, prepares the main looper
    pub prepare_main_looper: ManagedMethod,
    /// Static, returns the activity thread
    pub system_main: ManagedMethod,
    /// Instance method of the activity thread, returns the system context
    pub system_context: ManagedMethod,
    /// The helper class
    pub helper: HelperPlan,
}

impl BridgePlan {
    /// Replaces the helper dex.
    pub fn with_dex(mut self, dex: DexSource) -> Self {
        self.helper.dex = dex;
        self
    }

    /// Replaces the helper class name.
    pub fn with_helper_class(mut self, class: impl Into<String>) -> Self {
        self.helper.class = class.into();
        self
    }
}

impl Default for BridgePlan {
    fn default() -> Self {
        BridgePlan {
            prepare_main_looper: ManagedMethod::new("android/os/Looper", "prepareMainLooper", "()V"),
            system_main: ManagedMethod::new(
                "android/app/ActivityThread",
                "systemMain",
                "()Landroid/app/ActivityThread;",
            ),
            system_context: ManagedMethod::new(
                "android/app/ActivityThread",
                "getSystemContext",
                "()Landroid/app/ContextImpl;",
            ),
            helper: HelperPlan::default(),
        }
    }
}

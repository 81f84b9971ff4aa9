//! # droidstrap Prelude
//!
//! The types most programs need to bootstrap a runtime and drive a present loop.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all droidstrap operations
pub use crate::Error;

/// The result type used throughout droidstrap
pub use crate::Result;

/// Error classification and bootstrap stages
pub use crate::{ErrorKind, Stage};

// ================================================================================================
// Bootstrap
// ================================================================================================

/// Orchestrator, its failure report and the bootstrapped runtime
pub use crate::{Bootstrap, Failure, Runtime};

/// Configuration
pub use crate::{BootstrapConfig, OffsetSource};

/// Platform detection
pub use crate::{require_root, PlatformVersion};

// ================================================================================================
// Stages
// ================================================================================================

/// Symbol resolution
pub use crate::resolver::{
    DynamicLoader, ModuleId, OfflineLoader, SignatureTag, SymbolRequest, SymbolResolver,
    SystemLoader,
};

/// VM lifecycle and thread attachment
pub use crate::vm::{spawn_attached, AttachScope, Lifecycle, RuntimeState, VmHandle, VmOptions};

/// Offset tables and patching
pub use crate::patch::{OffsetEntry, OffsetTable, Pattern, PatchReceipt, RuntimePatcher};

/// Context bridge
pub use crate::bridge::{BridgePlan, BridgeSession, DisplayInfo, SurfaceHandle, TouchAction};

// ================================================================================================
// Presentation
// ================================================================================================

/// Present loop boundary and input
pub use crate::present::{InputEvent, PacedLoop, PresentLoop, TouchInput, TouchPhase};

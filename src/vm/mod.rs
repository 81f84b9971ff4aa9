//! Virtual machine creation, lifecycle and thread attachment.
//!
//! # Key Components
//!
//! - [`VmBootstrapper`] - Calls the VM creation entry point, once per process
//! - [`Lifecycle`] / [`RuntimeState`] - The process-wide, forward-only runtime state
//! - [`VmHandle`] - The created VM and its main thread environment
//! - [`AttachScope`] / [`spawn_attached`] - Attaching worker threads for their lifetime
//! - [`JniInvocation`] - Platform indirection selecting the VM library
//!
//! # Examples
//!
//! ```rust,no_run
//! use droidstrap::vm::{spawn_attached, Lifecycle};
//!
//! let vm = Lifecycle::global().vm()?;
//! let worker = spawn_attached("render", vm, |env| {
//!     let version = env.get_version()?;
//!     Ok(version)
//! })?;
//! # Ok::<(), droidstrap::Error>(())
//! ```

mod attach;
mod bootstrap;
mod handle;
mod lifecycle;

pub use attach::{
    attach_stats, spawn_attached, AttachCounters, AttachScope, AttachStats, InvocationApi,
};
pub use bootstrap::{JniInvocation, VmBootstrapper, VmOptions};
pub use handle::VmHandle;
pub use lifecycle::{Lifecycle, RuntimeState};

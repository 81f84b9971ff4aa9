// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
// - 'image/physical.rs' uses mmap to map a file into memory
// - 'resolver/symbol.rs' transmutes validated addresses into entry points
// - 'patch/memory.rs' reads and writes foreign process memory
// - 'vm' and 'bridge' call through raw JNI pointers

//! # droidstrap
//!
//! Bootstraps an Android runtime inside a plain native executable.
//!
//! An executable launched from a shell has none of what an app process inherits from
//! the zygote: no VM, no framework classes registered, no `Context`. `droidstrap`
//! builds all of that by hand:
//!
//! 1. **Resolve** - locate the platform runtime library and resolve the VM creation
//!    entry point, `startReg` and the runtime singleton by their exact names
//! 2. **Create VM** - initialise the JNI invocation where the platform has one and
//!    create the VM on the calling thread, which becomes its main thread
//! 3. **Patch** - write the VM into the runtime library's singleton so that native code
//!    asking the runtime for "the" VM finds it, using a per-platform offset table
//! 4. **Bridge** - register the framework's natives, create the system context, load a
//!    helper dex and ask it for a drawable surface
//! 5. **Present** - hand the surface to a render loop and feed it touch input read
//!    straight from the kernel
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use droidstrap::prelude::*;
//!
//! let config = BootstrapConfig::from_env().with_vm_option("-Xcheck:jni");
//! let runtime = Bootstrap::new(config).run()?;
//!
//! let surface = runtime.session().surface();
//! println!("surface {}x{}", surface.width(), surface.height());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Architecture
//!
//! - [`image`] - ELF images and their symbol tables
//! - [`resolver`] - library loading and symbol resolution with validated entry points
//! - [`vm`] - the process lifecycle, VM creation and thread attachment
//! - [`patch`] - versioned offset tables and the singleton patch transaction
//! - [`bridge`] - the managed calls that produce a context and a surface
//! - [`present`] - the render loop boundary and evdev touch input
//! - [`Bootstrap`] - runs the stages above in order
//!
//! ## Error Handling
//!
//! Library operations return [`Result<T, Error>`](Result). [`Bootstrap::run`] attributes
//! a failure to its stage:
//!
//! ```rust,no_run
//! use droidstrap::{Bootstrap, BootstrapConfig, ErrorKind, Stage};
//!
//! match Bootstrap::new(BootstrapConfig::new()).run() {
//!     Ok(_) => println!("ready"),
//!     Err(failure) if failure.kind() == ErrorKind::UnsupportedPlatformVersion => {
//!         println!("no offsets for this platform, add a row to the offset table");
//!     }
//!     Err(failure) if failure.stage() == Stage::CreateVm => {
//!         println!("VM creation failed: {:?}", failure.status());
//!     }
//!     Err(failure) => println!("{failure}"),
//! }
//! ```
//!
//! ## Platform
//!
//! The bootstrap only does something useful on Android, as root or with an equivalent
//! SELinux context. Symbol resolution, offset tables, ELF parsing and input decoding
//! work on any Linux host and are what the test suite exercises.
#[macro_use]
pub(crate) mod error;

/// Shared functionality which is used in unit- and integration-tests
#[cfg(test)]
pub(crate) mod test;

/// Convenient re-exports of the most commonly used types and traits.
///
/// # Example
///
/// ```rust,no_run
/// use droidstrap::prelude::*;
///
/// let table = OffsetTable::builtin()?;
/// let row = table.lookup(&PlatformVersion::detect()?)?;
/// println!("singleton {}", row.symbol);
/// # Ok::<(), droidstrap::Error>(())
/// ```
pub mod prelude;

/// Read-only ELF images of shared libraries.
pub mod image;

/// Library loading and symbol resolution.
pub mod resolver;

/// The process-wide runtime lifecycle, VM creation and thread attachment.
pub mod vm;

/// Offset tables and the runtime singleton patch.
pub mod patch;

/// Managed calls producing the system context and a drawable surface.
pub mod bridge;

/// Render loop boundary and touch input.
pub mod present;

mod bootstrap;
mod config;
mod platform;

/// `droidstrap` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `droidstrap` Error type
///
/// Every failure carries an [`ErrorKind`]; [`Stage`] names the bootstrap stages a
/// [`Failure`] is attributed to.
pub use error::{Error, ErrorKind, Stage};

/// The bootstrap orchestrator and what it produces.
pub use bootstrap::{
    Bootstrap, Failure, Runtime, CREATE_VM_SYMBOL, INVOCATION_CREATE_SYMBOL,
    INVOCATION_INIT_SYMBOL, START_REG_SYMBOL,
};

/// Bootstrap configuration.
pub use config::{BootstrapConfig, OffsetSource, DEFAULT_SEARCH_PATHS, RUNTIME_LIBRARY};

/// Platform detection and privilege checks.
pub use platform::{require_root, PlatformVersion, API_LEVEL_ENV};

/// Parsed ELF image of a shared library.
pub use image::Image;

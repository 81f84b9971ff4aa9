//! Registering the created VM inside the runtime library.
//!
//! The platform's managed-side helpers ask the runtime library for "the" VM, which it
//! keeps in a singleton normally filled in by the zygote. This module writes the
//! externally created VM into that singleton, as one validated transaction.
//!
//! # Key Components
//!
//! - [`OffsetTable`] - Versioned data describing where the VM field lives
//! - [`RuntimePatcher`] - Performs the read, validate, write, read-back transaction
//! - [`SingletonRef`] - The field to patch, consumed by that transaction
//! - [`ForeignMemory`] / [`ProcessMemory`] - Checked access to foreign memory
//!
//! # Examples
//!
//! ```rust,no_run
//! use droidstrap::{
//!     patch::{OffsetTable, ProcessMemory, RuntimePatcher},
//!     vm::Lifecycle,
//!     PlatformVersion,
//! };
//!
//! # fn symbol_address(name: &str) -> droidstrap::Result<usize> { unimplemented!() }
//! let table = OffsetTable::builtin()?;
//! let version = PlatformVersion::detect()?;
//!
//! let mut patcher = RuntimePatcher::new(ProcessMemory::snapshot()?, Lifecycle::global());
//! let receipt = patcher.patch_versioned(&table, &version, |entry| symbol_address(&entry.symbol))?;
//! println!("patched {:#x}", receipt.address);
//! # Ok::<(), droidstrap::Error>(())
//! ```

mod memory;
mod offsets;
mod patcher;

pub use memory::{ForeignMemory, ProcessMemory};
pub use offsets::{HexBytes, OffsetEntry, OffsetTable, Pattern, PlatformMatch, OFFSETS_ENV};
pub use patcher::{PatchReceipt, RuntimePatcher, SingletonRef};

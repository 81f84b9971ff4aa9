//! Builders and fakes for exercising the crate without a device.
//!
//! - [`ElfBuilder`] writes minimal ELF shared objects with chosen symbols
//! - [`FakeLoader`] stands in for the platform loader over such images
//! - [`RecordingMemory`] is a foreign memory range that records every access
//! - [`MockInvocation`] and [`MockEnv`] stand in for the VM's invocation interface and
//!   a thread's pending-exception state

mod loader;

pub use elf::{ElfBuilder, TEXT_SIZE, TEXT_START};
pub use jvm::{fake_vm_handle, MockEnv, MockInvocation};
pub use loader::{FakeLibrary, FakeLoader};
pub use memory::RecordingMemory;

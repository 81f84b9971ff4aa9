//! Process-wide runtime lifecycle.
//!
//! The lifecycle is the single source of truth for whether a VM exists and whether the
//! runtime library knows about it. It only moves forward:
//!
//! ```text
//! Uninitialized -> Bootstrapping -> Ready
//!                        \-------> Failed
//! ```
//!
//! Transitions are compare-and-swap operations, so concurrent callers race on a
//! single atomic and exactly one of them wins `Uninitialized -> Bootstrapping`. There
//! is no transition back: after `Failed` the process must be restarted.

use std::sync::{
    atomic::{AtomicU8, Ordering},
    OnceLock,
};

use strum::{Display, FromRepr, IntoStaticStr};

use crate::{vm::VmHandle, Error, Result};

static GLOBAL: Lifecycle = Lifecycle::new();

/// State of the process-wide runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromRepr, IntoStaticStr)]
#[repr(u8)]
pub enum RuntimeState {
    /// No VM creation has been attempted.
    Uninitialized = 0,
    /// A VM creation has been claimed; the VM may exist but is not registered yet.
    Bootstrapping = 1,
    /// The VM exists and the runtime library's singleton refers to it.
    Ready = 2,
    /// Bootstrap failed; nothing further may be attempted in this process.
    Failed = 3,
}

/// Owner of the process's [`RuntimeState`] and, once created, its [`VmHandle`].
#[derive(Debug)]
pub struct Lifecycle {
    state: AtomicU8,
    vm: OnceLock<VmHandle>,
}

impl Lifecycle {
    /// Creates a lifecycle in the `Uninitialized` state.
    pub const fn new() -> Self {
        Lifecycle {
            state: AtomicU8::new(RuntimeState::Uninitialized as u8),
            vm: OnceLock::new(),
        }
    }

    /// The lifecycle of this process.
    pub fn global() -> &'static Lifecycle {
        &GLOBAL
    }

    /// Current state.
    pub fn state(&self) -> RuntimeState {
        RuntimeState::from_repr(self.state.load(Ordering::Acquire))
            .unwrap_or(RuntimeState::Failed)
    }

    /// The VM, once the runtime is `Ready`.
    ///
    /// # Errors
    /// Returns [`Error::NotReady`] in every other state.
    pub fn vm(&self) -> Result<VmHandle> {
        match (self.state(), self.vm.get()) {
            (RuntimeState::Ready, Some(vm)) => Ok(*vm),
            (state, _) => Err(Error::NotReady(state.into())),
        }
    }

    /// Claims the one VM creation this process gets.
    ///
    /// # Errors
    /// Returns [`Error::AlreadyInitialized`] unless the state was `Uninitialized`.
    pub(crate) fn begin(&self) -> Result<()> {
        self.transition(RuntimeState::Uninitialized, RuntimeState::Bootstrapping)
            .map_err(|_| Error::AlreadyInitialized)
    }

    /// Records the VM created during `Bootstrapping`.
    pub(crate) fn record_vm(&self, vm: VmHandle) -> Result<()> {
        if self.state() != RuntimeState::Bootstrapping {
            return Err(Error::NotReady(self.state().into()));
        }
        self.vm.set(vm).map_err(|_| Error::AlreadyInitialized)
    }

    /// The VM created during `Bootstrapping`, not yet registered.
    pub(crate) fn pending_vm(&self) -> Result<VmHandle> {
        match (self.state(), self.vm.get()) {
            (RuntimeState::Bootstrapping, Some(vm)) => Ok(*vm),
            (state, _) => Err(Error::NotReady(state.into())),
        }
    }

    pub(crate) fn mark_ready(&self) -> Result<()> {
        self.transition(RuntimeState::Bootstrapping, RuntimeState::Ready)
    }

    pub(crate) fn mark_failed(&self) {
        // Ready is final as well; only an in-flight bootstrap can fail
        let _ = self.transition(RuntimeState::Bootstrapping, RuntimeState::Failed);
    }

    fn transition(&self, from: RuntimeState, to: RuntimeState) -> Result<()> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| {
                Error::NotReady(
                    RuntimeState::from_repr(actual)
                        .unwrap_or(RuntimeState::Failed)
                        .into(),
                )
            })
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

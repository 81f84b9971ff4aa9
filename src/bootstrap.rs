//! The end-to-end bootstrap: resolve, create the VM, patch, bridge.
//!
//! [`Bootstrap::run`] drives every stage on the calling thread and stops at the first
//! failure, reporting it as a [`Failure`] that names the stage. The platform's offset
//! table row is looked up before anything is loaded, so an unknown platform never gets
//! as far as creating a VM it could not register.

use std::{fmt, marker::PhantomData};

use jni::JNIEnv;
use tracing::{debug, info, warn};

use crate::{
    bridge::{BridgeSession, ContextBridge, TouchAction},
    config::BootstrapConfig,
    error::{ErrorKind, Stage},
    patch::{OffsetTable, PatchReceipt, ProcessMemory, RuntimePatcher},
    platform::{self, PlatformVersion},
    present::InputEvent,
    resolver::{
        CreateJavaVm, CreateJavaVmFn, DynamicLoader, EntryPoint, JniInvocationCreate,
        JniInvocationCreateFn, JniInvocationInit, JniInvocationInitFn, ModuleId,
        ResolvedSymbol, SignatureTag, StartRegFn, StartRegistration, SymbolRequest,
        SymbolResolver, SystemLoader,
    },
    vm::{JniInvocation, Lifecycle, RuntimeState, VmBootstrapper, VmHandle},
    Error, Result,
};

/// `JNI_CreateJavaVM`.
pub const CREATE_VM_SYMBOL: &str = "JNI_CreateJavaVM";
/// `android::AndroidRuntime::startReg(JNIEnv*)`.
pub const START_REG_SYMBOL: &str = "_ZN7android14AndroidRuntime8startRegEP7_JNIEnv";
/// `JniInvocationCreate`, exported by newer runtime libraries.
pub const INVOCATION_CREATE_SYMBOL: &str = "JniInvocationCreate";
/// `JniInvocationInit`, exported by newer runtime libraries.
pub const INVOCATION_INIT_SYMBOL: &str = "JniInvocationInit";

/// A failed bootstrap: the stage that failed and why.
///
/// Displays as one line, `stage=<stage> kind=<kind> status=<code> <message>`, with `-`
/// standing in for a missing status.
#[derive(Debug)]
pub struct Failure {
    stage: Stage,
    error: Error,
}

impl Failure {
    /// Attributes `error` to `stage`.
    pub fn new(stage: Stage, error: Error) -> Self {
        Failure { stage, error }
    }

    /// The stage that failed.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// The error that ended the stage.
    pub fn error(&self) -> &Error {
        &self.error
    }

    /// Classification of the error.
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }

    /// Native status code of the error, if any.
    pub fn status(&self) -> Option<i32> {
        self.error.status()
    }

    /// Drops the stage.
    pub fn into_error(self) -> Error {
        self.error
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage={} kind={} status=", self.stage, self.kind())?;
        match self.status() {
            Some(status) => write!(f, "{status}")?,
            None => f.write_str("-")?,
        }
        write!(f, " {}", self.error)
    }
}

impl std::error::Error for Failure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

trait AtStage<T> {
    fn at(self, stage: Stage) -> std::result::Result<T, Failure>;
}

impl<T> AtStage<T> for Result<T> {
    fn at(self, stage: Stage) -> std::result::Result<T, Failure> {
        self.map_err(|error| Failure::new(stage, error))
    }
}

struct EntryPoints {
    runtime: ModuleId,
    create_vm: CreateJavaVmFn,
    start_reg: StartRegFn,
    invocation: Option<(JniInvocationCreateFn, JniInvocationInitFn)>,
}

struct Established {
    runtime: ModuleId,
    vm: VmHandle,
    session: BridgeSession,
    version: PlatformVersion,
    receipt: PatchReceipt,
    invocation: Option<JniInvocation>,
}

/// A bootstrapped runtime.
///
/// Bound to the thread that ran the bootstrap, which is the VM's main thread, so it is
/// neither `Send` nor `Sync`. Dropping it leaves every library mapped and the VM
/// running.
pub struct Runtime<L: DynamicLoader = SystemLoader> {
    resolver: SymbolResolver<L>,
    runtime_module: ModuleId,
    vm: VmHandle,
    session: BridgeSession,
    version: PlatformVersion,
    receipt: PatchReceipt,
    invocation: Option<JniInvocation>,
    _main_thread: PhantomData<*mut ()>,
}

impl<L: DynamicLoader> Runtime<L> {
    /// The resolver holding the runtime library.
    pub fn resolver(&self) -> &SymbolResolver<L> {
        &self.resolver
    }

    /// The runtime library module.
    pub fn runtime_module(&self) -> ModuleId {
        self.runtime_module
    }

    /// The process's VM.
    pub fn vm(&self) -> VmHandle {
        self.vm
    }

    /// Context and surface produced by the bridge.
    pub fn session(&self) -> &BridgeSession {
        &self.session
    }

    /// Platform the runtime was bootstrapped on.
    pub fn version(&self) -> &PlatformVersion {
        &self.version
    }

    /// The singleton patch that was applied.
    pub fn receipt(&self) -> PatchReceipt {
        self.receipt
    }

    /// The JNI invocation, on platforms that have one.
    pub fn invocation(&self) -> Option<&JniInvocation> {
        self.invocation.as_ref()
    }

    /// The main thread's environment.
    ///
    /// # Errors
    /// Returns [`Error::Jni`] if the environment pointer is null.
    pub fn main_env(&self) -> Result<JNIEnv<'_>> {
        // Safety: Runtime is neither Send nor Sync, so this is the VM's main thread
        unsafe { self.vm.main_env() }
    }

    /// Forwards a touch to the helper.
    ///
    /// # Errors
    /// As [`BridgeSession::inject_touch`].
    pub fn inject(&self, event: &InputEvent) -> Result<()> {
        let InputEvent::Touch {
            id, phase, x, y, ..
        } = *event;

        let mut env = self.main_env()?;
        self.session.inject_touch(
            &mut env,
            TouchAction::from(phase),
            id as i64,
            x as i32,
            y as i32,
        )
    }
}

/// Runs the bootstrap stages in order.
///
/// ```rust,no_run
/// use droidstrap::{Bootstrap, BootstrapConfig};
///
/// let runtime = match Bootstrap::new(BootstrapConfig::from_env()).run() {
///     Ok(runtime) => runtime,
///     Err(failure) => {
///         eprintln!("{failure}");
///         std::process::exit(1);
///     }
/// };
/// let surface = runtime.session().surface();
/// println!("{}x{}", surface.width(), surface.height());
/// ```
pub struct Bootstrap<'a, L: DynamicLoader = SystemLoader> {
    config: BootstrapConfig,
    resolver: SymbolResolver<L>,
    lifecycle: &'a Lifecycle,
}

impl Bootstrap<'static, SystemLoader> {
    /// A bootstrap of this process with `config`.
    pub fn new(config: BootstrapConfig) -> Self {
        let resolver = SymbolResolver::system(config.search_paths.clone());
        Bootstrap {
            config,
            resolver,
            lifecycle: Lifecycle::global(),
        }
    }
}

impl<'a, L: DynamicLoader> Bootstrap<'a, L> {
    /// A bootstrap resolving through `loader` and recording into `lifecycle`.
    pub fn with_loader(config: BootstrapConfig, loader: L, lifecycle: &'a Lifecycle) -> Self {
        let resolver = SymbolResolver::new(loader, config.search_paths.clone());
        Bootstrap {
            config,
            resolver,
            lifecycle,
        }
    }

    /// Runs every stage; the first failure ends the bootstrap.
    ///
    /// Must run on the thread that is to become the VM's main thread.
    ///
    /// # Errors
    /// A [`Failure`] naming the stage that failed. A failure after the VM was created
    /// leaves the lifecycle `Failed`, and no later bootstrap in this process can succeed.
    pub fn run(mut self) -> std::result::Result<Runtime<L>, Failure> {
        match self.stages() {
            Ok(established) => {
                info!(
                    vm = format_args!("{:#x}", established.vm.identity()),
                    version = %established.version,
                    "runtime bootstrapped"
                );
                Ok(Runtime {
                    resolver: self.resolver,
                    runtime_module: established.runtime,
                    vm: established.vm,
                    session: established.session,
                    version: established.version,
                    receipt: established.receipt,
                    invocation: established.invocation,
                    _main_thread: PhantomData,
                })
            }
            Err(failure) => {
                warn!(
                    stage = %failure.stage(),
                    kind = %failure.kind(),
                    state = %self.lifecycle.state(),
                    "bootstrap failed"
                );
                Err(failure)
            }
        }
    }

    fn stages(&mut self) -> std::result::Result<Established, Failure> {
        if self.lifecycle.state() != RuntimeState::Uninitialized {
            return Err(Failure::new(Stage::CreateVm, Error::AlreadyInitialized));
        }
        if self.config.require_root {
            platform::require_root().at(Stage::Resolve)?;
        }

        let version = self.config.platform().at(Stage::Patch)?;
        let table = self.config.offsets.load().at(Stage::Patch)?;
        let singleton = table.lookup(&version).at(Stage::Patch)?.symbol.clone();
        info!(%version, singleton = %singleton, "platform supported");

        let entries = self.resolve(&singleton).at(Stage::Resolve)?;

        let (vm, invocation) = VmBootstrapper::new(self.lifecycle)
            .create_invoked(
                entries.invocation,
                self.config.jni_provider.as_deref(),
                entries.create_vm,
                &self.config.vm_options,
            )
            .at(Stage::CreateVm)?;

        let receipt = self
            .patch(entries.runtime, &table, &version)
            .at(Stage::Patch)?;

        // Safety: stages() runs on the thread that created the VM
        let mut env = unsafe { vm.main_env() }.at(Stage::Bridge)?;
        let session = ContextBridge::new(&self.config.bridge, &version, self.lifecycle)
            .establish(&mut env, entries.start_reg)
            .at(Stage::Bridge)?;

        Ok(Established {
            runtime: entries.runtime,
            vm,
            session,
            version,
            receipt,
            invocation,
        })
    }

    fn resolve(&mut self, singleton: &str) -> Result<EntryPoints> {
        let runtime = self.resolver.open(&self.config.runtime_library)?;
        let symbols = self.resolver.resolve_in(
            runtime,
            &[
                SymbolRequest::new(START_REG_SYMBOL, SignatureTag::StartRegistration),
                SymbolRequest::new(singleton, SignatureTag::DataPointer),
            ],
        )?;
        let start_reg = self.typed::<StartRegistration>(runtime, &symbols[0])?;

        let vm_module = if self.config.vm_library() == self.config.runtime_library {
            runtime
        } else {
            self.resolver.open(self.config.vm_library())?
        };
        let create_vm = self
            .resolver
            .resolve_in(
                vm_module,
                &[SymbolRequest::new(CREATE_VM_SYMBOL, SignatureTag::JniCreateJavaVm)],
            )?
            .remove(0);
        let create_vm = self.typed::<CreateJavaVm>(vm_module, &create_vm)?;

        let invocation = self.invocation(runtime)?;

        Ok(EntryPoints {
            runtime,
            create_vm,
            start_reg,
            invocation,
        })
    }

    fn invocation(
        &mut self,
        runtime: ModuleId,
    ) -> Result<Option<(JniInvocationCreateFn, JniInvocationInitFn)>> {
        let create = self.resolver.resolve_optional(
            runtime,
            SymbolRequest::new(INVOCATION_CREATE_SYMBOL, SignatureTag::JniInvocationCreate),
        )?;
        let init = self.resolver.resolve_optional(
            runtime,
            SymbolRequest::new(INVOCATION_INIT_SYMBOL, SignatureTag::JniInvocationInit),
        )?;

        match (create, init) {
            (Some(create), Some(init)) => Ok(Some((
                self.typed::<JniInvocationCreate>(runtime, &create)?,
                self.typed::<JniInvocationInit>(runtime, &init)?,
            ))),
            _ => {
                debug!("no JNI invocation entry points, calling the VM library directly");
                Ok(None)
            }
        }
    }

    fn typed<E: EntryPoint>(&self, module: ModuleId, symbol: &ResolvedSymbol) -> Result<E::Target> {
        let module = self
            .resolver
            .module(module)
            .ok_or_else(|| Error::ModuleNotLoaded {
                module: module.to_string(),
            })?;
        symbol.entry::<E>(module)
    }

    fn patch(
        &mut self,
        runtime: ModuleId,
        table: &OffsetTable,
        version: &PlatformVersion,
    ) -> Result<PatchReceipt> {
        let memory = match ProcessMemory::snapshot() {
            Ok(memory) => memory,
            Err(error) => {
                self.lifecycle.mark_failed();
                return Err(error);
            }
        };

        let resolver = &mut self.resolver;
        let mut patcher = RuntimePatcher::new(memory, self.lifecycle);
        patcher.patch_versioned(table, version, |entry| {
            let symbol = resolver
                .resolve_in(
                    runtime,
                    &[SymbolRequest::new(&entry.symbol, SignatureTag::DataPointer)],
                )?
                .remove(0);
            let module = resolver
                .module(runtime)
                .ok_or_else(|| Error::ModuleNotLoaded {
                    module: runtime.to_string(),
                })?;
            symbol.data(module)
        })
    }
}

//! wavetap - dynamic binary instrumentation for AMD GPU code objects.
//!
//! The core intercepts GPU kernels at runtime, reconstructs a
//! compiler-level machine IR from their loaded machine code, lets tools
//! splice instrumentation hooks into that representation, regenerates a
//! functionally equivalent instrumented code object, and redirects
//! dispatch packets to the instrumented variant.
//!
//! # Primary usage
//!
//! ```ignore
//! use wavetap::{HookArg, HookHandle, InstrumentationCore};
//!
//! let core = InstrumentationCore::new(runtime);
//! let kernel = core.cache().symbol_by_name(lco, "vector_add")?;
//! let lr = core.lift(&kernel)?;
//! core.instrument_and_load(&kernel, &lr, "counted", |task, lr| {
//!     let (target, _) = first_store(lr);
//!     task.insert_hook_before(target, HookHandle(handle), vec![HookArg::Imm(1)])
//! })?;
//! core.override_with_instrumented(&mut packet, "counted")?;
//! ```
//!
//! # Architecture
//!
//! - [`amdgpu`] - target layer: ISA naming, opcode tables, the
//!   decoder/encoder pair, kernel descriptors
//! - [`hsa`] - runtime seam, symbol model, code-object cache
//! - [`mir`] / [`ir`] - the machine IR and the hook IR
//! - [`lifter`] - disassembly and lifting, with caching
//! - [`codegen`] - the instrumentation pipeline and the object printer
//! - [`loader`] - instrumented-executable tracking and dispatch rewriting

pub mod amdgpu;
pub mod codegen;
pub mod error;
pub mod hsa;
pub mod im;
pub mod intrinsics;
pub mod ir;
pub mod lifter;
pub mod loader;
pub mod mir;
pub mod target;
pub mod task;

pub use codegen::{CodeGenerator, FileType};
pub use error::{Error, Result};
pub use hsa::cache::CodeObjectCache;
pub use hsa::packet::KernelDispatchPacket;
pub use hsa::symbol::{Symbol, SymbolKind, SymbolKindFilter};
pub use hsa::{Agent, ApiTableSnapshot, ExecutableHandle, HsaRuntime, LcoHandle, LoadInfo};
pub use im::InstrumentationModule;
pub use intrinsics::{IntrinsicProcessor, IntrinsicRegistry};
pub use lifter::{CodeLifter, InstrRecord, LiftedRepresentation};
pub use loader::ToolExecutableLoader;
pub use target::TargetManager;
pub use task::{HookArg, HookHandle, InstrumentationTask};

use std::sync::{Arc, Mutex, OnceLock};

/// The process-wide instrumentation core: wires every long-lived
/// component to one captured API-table snapshot and routes the runtime's
/// callbacks.
///
/// Components exist at most once per core; the embedder either installs
/// a core globally with [`InstrumentationCore::init`] or owns one
/// directly (tests do).
pub struct InstrumentationCore {
    api: ApiTableSnapshot,
    targets: Arc<TargetManager>,
    cache: Arc<CodeObjectCache>,
    lifter: Arc<CodeLifter>,
    im: Arc<InstrumentationModule>,
    codegen: Arc<CodeGenerator>,
    loader: Arc<ToolExecutableLoader>,
}

static GLOBAL_CORE: OnceLock<Mutex<Option<Arc<InstrumentationCore>>>> = OnceLock::new();

fn global_slot() -> &'static Mutex<Option<Arc<InstrumentationCore>>> {
    GLOBAL_CORE.get_or_init(|| Mutex::new(None))
}

impl InstrumentationCore {
    /// Builds a core over a runtime, capturing its API tables.
    pub fn new(runtime: Arc<dyn HsaRuntime>) -> Arc<Self> {
        let api = ApiTableSnapshot::capture(runtime);
        let targets = Arc::new(TargetManager::new());
        let cache = Arc::new(CodeObjectCache::new(api.clone()));
        let lifter = Arc::new(CodeLifter::new(
            api.clone(),
            Arc::clone(&cache),
            Arc::clone(&targets),
        ));
        let im = Arc::new(InstrumentationModule::new());
        let intrinsics = Arc::new(IntrinsicRegistry::with_builtins());
        let codegen = Arc::new(CodeGenerator::new(
            Arc::clone(&cache),
            Arc::clone(&lifter),
            Arc::clone(&im),
            intrinsics,
        ));
        let loader = Arc::new(ToolExecutableLoader::new(
            api.clone(),
            Arc::clone(&cache),
            Arc::clone(&im),
        ));
        Arc::new(InstrumentationCore {
            api,
            targets,
            cache,
            lifter,
            im,
            codegen,
            loader,
        })
    }

    /// Installs a core as the process-wide instance.
    pub fn init(runtime: Arc<dyn HsaRuntime>) -> Arc<Self> {
        let core = Self::new(runtime);
        *global_slot().lock().unwrap() = Some(Arc::clone(&core));
        core
    }

    /// The process-wide instance. Using the core before [`init`] is a
    /// broken precondition and aborts.
    ///
    /// [`init`]: InstrumentationCore::init
    pub fn instance() -> Arc<Self> {
        match global_slot().lock().unwrap().as_ref() {
            Some(core) => Arc::clone(core),
            None => panic!("invariant violation: instrumentation core used before init"),
        }
    }

    /// Tears the process-wide instance down.
    pub fn teardown() {
        *global_slot().lock().unwrap() = None;
    }

    // component access

    pub fn api(&self) -> &ApiTableSnapshot {
        &self.api
    }

    pub fn targets(&self) -> &Arc<TargetManager> {
        &self.targets
    }

    pub fn cache(&self) -> &Arc<CodeObjectCache> {
        &self.cache
    }

    pub fn lifter(&self) -> &Arc<CodeLifter> {
        &self.lifter
    }

    pub fn instrumentation_module(&self) -> &Arc<InstrumentationModule> {
        &self.im
    }

    pub fn code_generator(&self) -> &Arc<CodeGenerator> {
        &self.codegen
    }

    pub fn loader(&self) -> &Arc<ToolExecutableLoader> {
        &self.loader
    }

    // runtime callback routing

    /// Routes the *load-agent-code-object* callback.
    pub fn on_code_object_loaded(
        &self,
        exec: ExecutableHandle,
        agent: Agent,
        info: LoadInfo,
        elf_bytes: &[u8],
    ) -> Result<()> {
        self.cache.on_code_object_loaded(exec, agent, info, elf_bytes)
    }

    /// Routes the *executable-freeze* callback.
    pub fn on_executable_frozen(&self, exec: ExecutableHandle) -> Result<()> {
        self.loader.on_executable_frozen(exec)
    }

    /// Routes the *register-function* callback.
    pub fn on_register_function(&self, shadow_ptr: usize, device_name: &str) {
        self.loader.on_register_function(shadow_ptr, device_name);
    }

    /// Routes the *executable-destroy* callback: tears down dependent
    /// instrumented executables, then invalidates every cache.
    pub fn on_executable_destroyed(&self, exec: ExecutableHandle) {
        let dependents = self.loader.on_executable_destroyed(exec);
        for dependent in dependents {
            self.invalidate_executable(dependent);
        }
        self.invalidate_executable(exec);
    }

    fn invalidate_executable(&self, exec: ExecutableHandle) {
        let lcos = self.cache.lcos_of_executable(exec);
        self.lifter.on_executable_destroyed(&lcos);
        self.cache.on_executable_destroyed(exec);
    }

    // public API surface

    /// Disassembles a kernel or device function.
    pub fn disassemble(&self, symbol: &Arc<Symbol>) -> Result<Arc<Vec<InstrRecord>>> {
        self.lifter.disassemble(symbol)
    }

    /// Lifts a kernel; cached per kernel until its executable dies.
    pub fn lift(&self, kernel: &Arc<Symbol>) -> Result<Arc<LiftedRepresentation>> {
        self.lifter.lift(kernel)
    }

    /// Clones and instruments a representation. See
    /// [`CodeGenerator::instrument`].
    pub fn instrument<F>(
        &self,
        lr: &LiftedRepresentation,
        mutator: F,
    ) -> Result<LiftedRepresentation>
    where
        F: FnOnce(&mut InstrumentationTask, &mut LiftedRepresentation) -> Result<()>,
    {
        self.codegen.instrument(lr, mutator)
    }

    /// Prints a representation as assembly text or a relocatable object.
    pub fn print_lifted_representation(
        &self,
        lr: &LiftedRepresentation,
        file_type: FileType,
    ) -> Result<Vec<u8>> {
        self.codegen.print(lr, file_type)
    }

    /// Instruments `kernel` and registers the result under `preset`.
    ///
    /// The extern addresses for the instrumented object come from the
    /// original code object's loaded symbols and the tool payload's
    /// per-agent globals.
    pub fn instrument_and_load<F>(
        &self,
        kernel: &Arc<Symbol>,
        lr: &LiftedRepresentation,
        mutator: F,
        preset: &str,
    ) -> Result<()>
    where
        F: FnOnce(&mut InstrumentationTask, &mut LiftedRepresentation) -> Result<()>,
    {
        if self.loader.is_kernel_instrumented(kernel, preset) {
            return Ok(());
        }
        let instrumented = self.codegen.instrument(lr, mutator)?;
        let elf = self.codegen.print(&instrumented, FileType::Relocatable)?;

        let agent = self.cache.entry(kernel.lco)?.agent;
        let mut externs: Vec<(String, u64)> = Vec::new();
        for (name, symbol) in instrumented.global_symbols() {
            let address = if symbol.is_external() {
                self.cache.resolve_external(kernel.lco, name)?.address
            } else {
                symbol.address
            };
            externs.push((name.clone(), address));
        }
        // tool-payload globals pulled in by the hooks resolve to their
        // per-agent loaded addresses
        for global in &instrumented.ir.globals {
            if externs.iter().any(|(n, _)| *n == global.name) {
                continue;
            }
            if let Some(address) = self.im.global_address(&global.name, agent) {
                externs.push((global.name.clone(), address));
            }
        }

        self.loader
            .load_instrumented_kernel(&elf, kernel, preset, &externs)
    }

    /// Whether `(kernel, preset)` has a registered instrumented variant.
    pub fn is_kernel_instrumented(&self, kernel: &Symbol, preset: &str) -> bool {
        self.loader.is_kernel_instrumented(kernel, preset)
    }

    /// Rewrites a dispatch packet to launch the instrumented variant.
    pub fn override_with_instrumented(
        &self,
        packet: &mut KernelDispatchPacket,
        preset: &str,
    ) -> Result<()> {
        self.loader.override_with_instrumented(packet, preset)
    }
}

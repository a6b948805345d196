//! The tool executable loader.
//!
//! Side-loads instrumented relocatables into the runtime as fresh
//! executables, tracks which `(original kernel, preset)` pairs have an
//! instrumented variant, detects the tool's own payload executable at
//! freeze time, and rewrites dispatch packets to launch the instrumented
//! kernel instead of the original.

use crate::amdgpu::object::AmdGcnObjectFile;
use crate::amdgpu::KernelMetadata;
use crate::error::{Error, Result};
use crate::hsa::cache::CodeObjectCache;
use crate::hsa::packet::KernelDispatchPacket;
use crate::hsa::symbol::Symbol;
use crate::hsa::{Agent, ApiTableSnapshot, ExecutableHandle, LcoHandle};
use crate::im::InstrumentationModule;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// One registered instrumented kernel.
#[derive(Debug, Clone)]
pub struct InstrumentedKernel {
    pub exec: ExecutableHandle,
    pub symbol: Arc<Symbol>,
    pub metadata: KernelMetadata,
    /// Loaded address of the instrumented kernel descriptor; what the
    /// rewritten packet carries.
    pub descriptor_address: u64,
    pub private_segment_size: u32,
}

type KernelKey = (LcoHandle, String);

#[derive(Default)]
struct LoaderState {
    /// (original kernel, preset) → instrumented kernel.
    presets: HashMap<KernelKey, HashMap<String, InstrumentedKernel>>,
    /// Original kernel-descriptor address → kernel key, for packet
    /// rewriting.
    by_kd_address: HashMap<u64, KernelKey>,
    /// Addresses of instrumented descriptors, for rewrite idempotence.
    instrumented_kds: HashSet<u64>,
    /// Original executable → instrumented executables built from it.
    deps: HashMap<ExecutableHandle, HashSet<ExecutableHandle>>,
    /// Original executable → kernels instrumented out of it.
    kernels_of_exec: HashMap<ExecutableHandle, Vec<KernelKey>>,
}

/// Process-wide loader of instrumented executables.
pub struct ToolExecutableLoader {
    api: ApiTableSnapshot,
    cache: Arc<CodeObjectCache>,
    im: Arc<InstrumentationModule>,
    state: Mutex<LoaderState>,
}

impl ToolExecutableLoader {
    pub fn new(
        api: ApiTableSnapshot,
        cache: Arc<CodeObjectCache>,
        im: Arc<InstrumentationModule>,
    ) -> Self {
        ToolExecutableLoader {
            api,
            cache,
            im,
            state: Mutex::new(LoaderState::default()),
        }
    }

    /// Wrapper body for the runtime's *register-function* operation:
    /// captures the shadow host pointer → device symbol name mapping.
    pub fn on_register_function(&self, shadow_ptr: usize, device_name: &str) {
        self.im.register_function(shadow_ptr, device_name);
    }

    /// Wrapper body for *executable-freeze*: detects the tool payload by
    /// its compile-unit identifier and registers it with the
    /// instrumentation module.
    pub fn on_executable_frozen(&self, exec: ExecutableHandle) -> Result<()> {
        for lco in self.cache.lcos_of_executable(exec) {
            let entry = self.cache.entry(lco)?;
            let bytes = entry.elf_bytes();
            let obj = AmdGcnObjectFile::parse(&bytes)?;
            if InstrumentationModule::compile_unit_id(&obj).is_some() {
                self.im.register_executable(exec, &entry)?;
            }
        }
        Ok(())
    }

    /// Wrapper body for *executable-destroy*. Unregisters the payload if
    /// this was a tool executable, and tears down every instrumented
    /// executable whose original kernels lived in `exec`. Returns the
    /// executables that were destroyed as a consequence, so the caller
    /// can invalidate their caches too.
    pub fn on_executable_destroyed(&self, exec: ExecutableHandle) -> Vec<ExecutableHandle> {
        self.im.unregister_executable(exec);

        let dead = {
            let mut state = self.state.lock().unwrap();
            let dead: Vec<ExecutableHandle> =
                state.deps.remove(&exec).unwrap_or_default().into_iter().collect();
            let keys = state.kernels_of_exec.remove(&exec).unwrap_or_default();
            let mut removed_kds = Vec::new();
            for key in &keys {
                if let Some(presets) = state.presets.remove(key) {
                    for info in presets.values() {
                        removed_kds.push(info.descriptor_address);
                    }
                }
            }
            state.by_kd_address.retain(|_, k| !keys.contains(k));
            // `exec` may itself be an instrumented executable; drop the
            // preset entries it backs
            for presets in state.presets.values_mut() {
                presets.retain(|_, info| {
                    if info.exec == exec {
                        removed_kds.push(info.descriptor_address);
                        false
                    } else {
                        true
                    }
                });
            }
            state.presets.retain(|_, m| !m.is_empty());
            for deps in state.deps.values_mut() {
                deps.remove(&exec);
            }
            for kd in removed_kds {
                state.instrumented_kds.remove(&kd);
            }
            dead
        };

        for handle in &dead {
            if let Err(e) = self.api.table().destroy_executable(*handle) {
                log::warn!("failed to destroy instrumented executable {handle}: {e}");
            }
        }
        dead
    }

    /// Loads an instrumented relocatable as a new executable and
    /// registers it under `(original kernel, preset)`.
    ///
    /// For a given pair this happens at most once: a second call
    /// observes the registered kernel and succeeds without side effects.
    pub fn load_instrumented_kernel(
        &self,
        elf: &[u8],
        original: &Arc<Symbol>,
        preset: &str,
        externs: &[(String, u64)],
    ) -> Result<()> {
        let key: KernelKey = (original.lco, original.name.clone());
        {
            let state = self.state.lock().unwrap();
            if state
                .presets
                .get(&key)
                .is_some_and(|m| m.contains_key(preset))
            {
                log::debug!(
                    "`{}` already instrumented under preset `{preset}`",
                    original.name
                );
                return Ok(());
            }
        }

        let original_info = original.as_kernel().ok_or_else(|| {
            Error::loader(format!("`{}` is not a kernel", original.name))
        })?;
        let entry = self.cache.entry(original.lco)?;
        let agent: Agent = entry.agent;

        let exec = self.api.table().create_executable(agent)?;
        for (name, address) in externs {
            self.api
                .table()
                .define_external(exec, agent, name, *address)?;
        }
        let info = self.api.table().load_code_object(exec, agent, elf)?;
        self.api.table().freeze_executable(exec)?;

        // capture in the cache, as the load wrapper would have
        self.cache.on_code_object_loaded(exec, agent, info, elf)?;

        let symbol = self.cache.symbol_by_name(info.handle, &original.name)?;
        let instrumented_info = symbol.as_kernel().ok_or_else(|| {
            Error::loader(format!(
                "instrumented object lacks kernel `{}`",
                original.name
            ))
        })?;
        let descriptor_address = instrumented_info.descriptor_address;
        let private_segment_size = instrumented_info.descriptor.private_segment_fixed_size;
        let metadata = instrumented_info.metadata.clone();

        let mut state = self.state.lock().unwrap();
        state
            .presets
            .entry(key.clone())
            .or_default()
            .insert(
                preset.to_string(),
                InstrumentedKernel {
                    exec,
                    symbol: Arc::clone(&symbol),
                    metadata,
                    descriptor_address,
                    private_segment_size,
                },
            );
        state
            .by_kd_address
            .insert(original_info.descriptor_address, key.clone());
        state.instrumented_kds.insert(descriptor_address);
        state.deps.entry(entry.exec).or_default().insert(exec);
        state.kernels_of_exec.entry(entry.exec).or_default().push(key);
        log::debug!(
            "registered instrumented `{}` under preset `{preset}` ({exec})",
            original.name
        );
        Ok(())
    }

    pub fn is_kernel_instrumented(&self, kernel: &Symbol, preset: &str) -> bool {
        let key: KernelKey = (kernel.lco, kernel.name.clone());
        self.state
            .lock()
            .unwrap()
            .presets
            .get(&key)
            .is_some_and(|m| m.contains_key(preset))
    }

    /// The instrumented kernel registered for `(kernel, preset)`.
    pub fn get_instrumented_kernel(
        &self,
        kernel: &Symbol,
        preset: &str,
    ) -> Result<InstrumentedKernel> {
        let key: KernelKey = (kernel.lco, kernel.name.clone());
        self.state
            .lock()
            .unwrap()
            .presets
            .get(&key)
            .and_then(|m| m.get(preset))
            .cloned()
            .ok_or_else(|| {
                Error::loader(format!(
                    "kernel `{}` has no instrumented variant under preset `{preset}`",
                    kernel.name
                ))
            })
    }

    /// Rewrites a dispatch packet in place so the instrumented variant
    /// launches instead. Idempotent: a packet that already points at the
    /// instrumented descriptor is left unchanged.
    pub fn override_with_instrumented(
        &self,
        packet: &mut KernelDispatchPacket,
        preset: &str,
    ) -> Result<()> {
        if !packet.is_kernel_dispatch() {
            return Err(Error::loader(
                "packet is not a kernel dispatch".to_string(),
            ));
        }
        let state = self.state.lock().unwrap();
        if state.instrumented_kds.contains(&packet.kernel_object) {
            return Ok(());
        }
        let key = state
            .by_kd_address
            .get(&packet.kernel_object)
            .ok_or_else(|| {
                Error::loader(format!(
                    "kernel object {:#x} has no instrumented variant",
                    packet.kernel_object
                ))
            })?;
        let info = state
            .presets
            .get(key)
            .and_then(|m| m.get(preset))
            .ok_or_else(|| {
                Error::loader(format!("no instrumented kernel under preset `{preset}`"))
            })?;
        packet.kernel_object = info.descriptor_address;
        if info.private_segment_size > packet.private_segment_size {
            packet.private_segment_size = info.private_segment_size;
        }
        Ok(())
    }
}

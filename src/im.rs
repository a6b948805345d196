//! The instrumentation module: the tool's payload.
//!
//! A tool ships one shared object per agent containing a hook-IR payload
//! section, a reserved managed variable whose initialiser doubles as the
//! compile-unit id, and one shadow host pointer per hook. The loader
//! detects the payload executable at freeze time by its compile-unit id
//! and registers it here; dispatch-time instrumentation reads the payload
//! back out per agent.

use crate::amdgpu::object::AmdGcnObjectFile;
use crate::error::{Error, Result};
use crate::hsa::cache::LoadedCodeObject;
use crate::hsa::{Agent, ExecutableHandle};
use crate::ir::{self, IrModule};
use crate::task::HookHandle;
use object::{Object, ObjectSection};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

/// The reserved managed variable marking a tool payload; its initialiser
/// bytes are the compile-unit id.
pub const RESERVED_MANAGED_VAR: &str = "__luthier_reserved";

/// Prefix of hook shadow-pointer symbols on the host side.
pub const HOOK_HANDLE_PREFIX: &str = "__luthier_hook_handle_";

/// Section of the tool shared object carrying the hook-IR payload.
pub const HOOK_IR_SECTION: &str = ".wavetap.ir";

#[derive(Default)]
struct AgentPayload {
    /// The payload buffer ("bitcode") for this agent.
    payload: Arc<Vec<u8>>,
    /// Global-variable name → loaded device address.
    globals: HashMap<String, u64>,
    executables: HashSet<ExecutableHandle>,
}

#[derive(Default)]
struct ImState {
    cuid: Option<String>,
    per_agent: HashMap<Agent, AgentPayload>,
    hook_handles: HashMap<usize, String>,
}

/// Process-wide registry of the tool payload.
pub struct InstrumentationModule {
    state: RwLock<ImState>,
}

impl InstrumentationModule {
    pub fn new() -> Self {
        InstrumentationModule {
            state: RwLock::new(ImState::default()),
        }
    }

    /// The compile-unit id of a code object, when it is a tool payload.
    pub fn compile_unit_id(obj: &AmdGcnObjectFile<'_>) -> Option<String> {
        let symbol = obj.symbol_by_name(RESERVED_MANAGED_VAR)?;
        let bytes = obj.bytes_at(symbol.address, symbol.size).ok()?;
        Some(
            bytes
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect::<String>(),
        )
    }

    /// Whether this module has seen any payload yet.
    pub fn is_registered(&self) -> bool {
        self.state.read().unwrap().cuid.is_some()
    }

    pub fn matches_cuid(&self, cuid: &str) -> bool {
        self.state
            .read()
            .unwrap()
            .cuid
            .as_deref()
            .is_some_and(|c| c == cuid)
    }

    /// Registers a frozen tool executable's code object for its agent.
    pub fn register_executable(
        &self,
        exec: ExecutableHandle,
        entry: &LoadedCodeObject,
    ) -> Result<()> {
        let bytes = entry.elf_bytes();
        let obj = AmdGcnObjectFile::parse(&bytes)?;
        let cuid = Self::compile_unit_id(&obj).ok_or_else(|| {
            Error::loader("code object carries no reserved managed variable".to_string())
        })?;

        let payload = obj
            .inner()
            .section_by_name(HOOK_IR_SECTION)
            .ok_or_else(|| {
                Error::loader(format!("tool payload lacks a {HOOK_IR_SECTION} section"))
            })?
            .data()
            .map_err(|e| Error::Object(e.to_string()))?
            .to_vec();

        let mut state = self.state.write().unwrap();
        match &state.cuid {
            None => state.cuid = Some(cuid),
            Some(existing) if *existing == cuid => {}
            Some(existing) => {
                return Err(Error::loader(format!(
                    "payload compile-unit id mismatch: {existing} vs {cuid}"
                )))
            }
        }

        let slot = state.per_agent.entry(entry.agent).or_default();
        slot.payload = Arc::new(payload);
        slot.executables.insert(exec);
        for symbol in entry.symbols() {
            if symbol.is_variable() {
                slot.globals.insert(symbol.name.clone(), symbol.address);
            }
        }
        log::debug!(
            "registered tool payload for {} ({} globals)",
            entry.agent,
            slot.globals.len()
        );
        Ok(())
    }

    /// Unregisters an executable; returns true when this was the last
    /// one and the module tore down fully.
    pub fn unregister_executable(&self, exec: ExecutableHandle) -> bool {
        let mut state = self.state.write().unwrap();
        let mut touched = false;
        state.per_agent.retain(|_, slot| {
            if slot.executables.remove(&exec) {
                touched = true;
            }
            !slot.executables.is_empty()
        });
        if touched && state.per_agent.is_empty() {
            log::debug!("last tool executable destroyed; tearing down the module");
            *state = ImState::default();
            return true;
        }
        false
    }

    /// Records a host shadow-pointer → device-symbol mapping from the
    /// register-function wrapper. Only hook handles are retained.
    pub fn register_function(&self, shadow_ptr: usize, device_name: &str) {
        if let Some(hook) = device_name.strip_prefix(HOOK_HANDLE_PREFIX) {
            self.state
                .write()
                .unwrap()
                .hook_handles
                .insert(shadow_ptr, hook.to_string());
        }
    }

    /// Resolves a hook handle to the hook's name in the payload.
    pub fn hook_name(&self, handle: HookHandle) -> Result<String> {
        self.state
            .read()
            .unwrap()
            .hook_handles
            .get(&handle.0)
            .cloned()
            .ok_or_else(|| {
                Error::codegen(format!(
                    "{handle:?} is not a registered hook handle"
                ))
            })
    }

    /// Parses the agent's payload into a fresh IR module.
    pub fn read_payload(&self, agent: Agent) -> Result<IrModule> {
        let payload = {
            let state = self.state.read().unwrap();
            let slot = state.per_agent.get(&agent).ok_or_else(|| {
                Error::loader(format!("no tool payload registered for {agent}"))
            })?;
            Arc::clone(&slot.payload)
        };
        let text = std::str::from_utf8(&payload)
            .map_err(|_| Error::loader("tool payload is not valid UTF-8".to_string()))?;
        ir::parse_module(text)
    }

    /// Loaded device address of a payload global on `agent`.
    pub fn global_address(&self, name: &str, agent: Agent) -> Option<u64> {
        self.state
            .read()
            .unwrap()
            .per_agent
            .get(&agent)?
            .globals
            .get(name)
            .copied()
    }
}

impl Default for InstrumentationModule {
    fn default() -> Self {
        InstrumentationModule::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_handle_registration_filters_by_prefix() {
        let im = InstrumentationModule::new();
        im.register_function(0x1000, "__luthier_hook_handle_count_stores");
        im.register_function(0x2000, "some_ordinary_kernel");
        assert_eq!(
            im.hook_name(HookHandle(0x1000)).unwrap(),
            "count_stores"
        );
        assert!(im.hook_name(HookHandle(0x2000)).is_err());
    }
}

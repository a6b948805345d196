//! An in-process runtime for tests.
//!
//! Owns "device memory" as host buffers, places code objects at arbitrary
//! bases, applies AMDGPU relocations the way the real loader does, and
//! answers symbol queries. Good enough to drive the whole
//! disassemble → lift → instrument → load → dispatch-rewrite pipeline
//! without a GPU.

use super::{
    Agent, ApiTableSnapshot, ExecutableHandle, HsaRuntime, LcoHandle, LoadInfo, RuntimeSymbolInfo,
    SymbolHandle,
};
use crate::amdgpu::object::{kernel_name_from_descriptor, AmdGcnObjectFile, RelocKind};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
struct MockSymbol {
    handle: SymbolHandle,
    device_address: u64,
    kernel_object: Option<u64>,
    is_global: bool,
}

#[derive(Debug)]
struct MockLco {
    handle: LcoHandle,
    load_base: u64,
    symbols: HashMap<String, MockSymbol>,
}

#[derive(Debug, Default)]
struct MockExecutable {
    agent: Option<Agent>,
    frozen: bool,
    destroyed: bool,
    externs: HashMap<String, u64>,
    lcos: Vec<MockLco>,
}

#[derive(Default)]
struct MockState {
    next_handle: u64,
    next_base: u64,
    memory: Vec<(u64, Vec<u8>)>,
    executables: HashMap<ExecutableHandle, MockExecutable>,
}

impl MockState {
    fn fresh_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn lookup_global(&self, agent: Agent, name: &str) -> Option<u64> {
        for exec in self.executables.values() {
            if exec.destroyed || exec.agent != Some(agent) {
                continue;
            }
            for lco in &exec.lcos {
                if let Some(sym) = lco.symbols.get(name) {
                    if sym.is_global {
                        return Some(sym.device_address);
                    }
                }
            }
        }
        None
    }
}

/// Test double for the GPU runtime.
pub struct MockRuntime {
    state: Mutex<MockState>,
}

impl MockRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(MockRuntime {
            state: Mutex::new(MockState {
                next_base: 0x7000_0000_0000,
                ..Default::default()
            }),
        })
    }

    /// Convenience for wiring the mock into an [`ApiTableSnapshot`].
    pub fn snapshot(self: &Arc<Self>) -> ApiTableSnapshot {
        ApiTableSnapshot::capture(Arc::clone(self) as Arc<dyn HsaRuntime>)
    }

    fn runtime_err(call: &'static str) -> Error {
        Error::Runtime { call, status: -1 }
    }
}

impl HsaRuntime for MockRuntime {
    fn read_device_memory(&self, _agent: Agent, address: u64, size: u64) -> Result<Vec<u8>> {
        let state = self.state.lock().unwrap();
        for (base, buf) in &state.memory {
            let end = base + buf.len() as u64;
            if address >= *base && address + size <= end {
                let begin = (address - base) as usize;
                return Ok(buf[begin..begin + size as usize].to_vec());
            }
        }
        Err(Self::runtime_err("read_device_memory"))
    }

    fn create_executable(&self, agent: Agent) -> Result<ExecutableHandle> {
        let mut state = self.state.lock().unwrap();
        let handle = ExecutableHandle(state.fresh_handle());
        state.executables.insert(
            handle,
            MockExecutable {
                agent: Some(agent),
                ..Default::default()
            },
        );
        Ok(handle)
    }

    fn define_external(
        &self,
        exec: ExecutableHandle,
        _agent: Agent,
        name: &str,
        address: u64,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let exec = state
            .executables
            .get_mut(&exec)
            .ok_or_else(|| Self::runtime_err("define_external"))?;
        if exec.frozen {
            return Err(Self::runtime_err("define_external"));
        }
        exec.externs.insert(name.to_string(), address);
        Ok(())
    }

    fn load_code_object(
        &self,
        exec: ExecutableHandle,
        agent: Agent,
        bytes: &[u8],
    ) -> Result<LoadInfo> {
        let obj = AmdGcnObjectFile::parse(bytes)?;
        let image_size = obj.image_size().max(1);
        let elf_symbols = obj.symbols();
        let relocations = obj.relocations();

        let mut state = self.state.lock().unwrap();
        let executable = state
            .executables
            .get(&exec)
            .ok_or_else(|| Self::runtime_err("load_code_object"))?;
        if executable.frozen || executable.destroyed {
            return Err(Self::runtime_err("load_code_object"));
        }
        let externs = executable.externs.clone();

        // place the image
        let load_base = state.next_base;
        state.next_base += image_size.div_ceil(0x1000) * 0x1000 + 0x1000;
        let mut image = vec![0u8; image_size as usize];
        {
            use object::{Object, ObjectSection};
            for section in obj.inner().sections() {
                let Some(base) = obj.section_base(section.index()) else {
                    continue;
                };
                if let Ok(data) = section.data() {
                    let begin = base as usize;
                    if begin + data.len() <= image.len() {
                        image[begin..begin + data.len()].copy_from_slice(data);
                    }
                }
            }
        }

        // the canonical layout means every file address maps by one delta
        let load_delta = load_base as i64;

        // resolve and apply relocations
        let resolve = |name: &str| -> Option<u64> {
            elf_symbols
                .iter()
                .find(|s| s.name == name && !s.is_undefined)
                .map(|s| s.address.wrapping_add(load_delta as u64))
                .or_else(|| externs.get(name).copied())
                .or_else(|| state.lookup_global(agent, name))
        };
        for reloc in &relocations {
            let target = resolve(&reloc.symbol).ok_or_else(|| {
                Error::loader(format!("unresolved symbol `{}`", reloc.symbol))
            })?;
            let s_plus_a = target.wrapping_add(reloc.addend as u64);
            let place = reloc.address.wrapping_add(load_delta as u64);
            let offset = reloc.address as usize;
            let patch32 = |image: &mut [u8], value: u32| {
                image[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
            };
            match reloc.kind {
                RelocKind::Abs64 => {
                    image[offset..offset + 8].copy_from_slice(&s_plus_a.to_le_bytes())
                }
                RelocKind::Abs32 | RelocKind::Abs32Lo => patch32(&mut image, s_plus_a as u32),
                RelocKind::Abs32Hi => patch32(&mut image, (s_plus_a >> 32) as u32),
                RelocKind::Rel32 | RelocKind::Rel32Lo => {
                    patch32(&mut image, s_plus_a.wrapping_sub(place) as u32)
                }
                RelocKind::Rel32Hi => {
                    patch32(&mut image, (s_plus_a.wrapping_sub(place) >> 32) as u32)
                }
                RelocKind::Rel64 => image[offset..offset + 8]
                    .copy_from_slice(&s_plus_a.wrapping_sub(place).to_le_bytes()),
            }
        }

        // index symbols
        let mut symbols = HashMap::new();
        for sym in &elf_symbols {
            if sym.is_undefined {
                continue;
            }
            let device_address = sym.address.wrapping_add(load_delta as u64);
            let kernel_object = elf_symbols
                .iter()
                .find(|kd| {
                    kernel_name_from_descriptor(&kd.name) == Some(sym.name.as_str())
                })
                .map(|kd| kd.address.wrapping_add(load_delta as u64));
            symbols.insert(
                sym.name.clone(),
                MockSymbol {
                    handle: SymbolHandle(0), // assigned below under the lock
                    device_address,
                    kernel_object,
                    is_global: sym.is_global,
                },
            );
        }
        for sym in symbols.values_mut() {
            sym.handle = SymbolHandle(state.fresh_handle());
        }

        let handle = LcoHandle(state.fresh_handle());
        state.memory.push((load_base, image));
        let executable = state.executables.get_mut(&exec).unwrap();
        executable.lcos.push(MockLco {
            handle,
            load_base,
            symbols,
        });

        Ok(LoadInfo {
            handle,
            load_base,
            load_size: image_size,
            load_delta,
        })
    }

    fn freeze_executable(&self, exec: ExecutableHandle) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let exec = state
            .executables
            .get_mut(&exec)
            .ok_or_else(|| Self::runtime_err("freeze_executable"))?;
        exec.frozen = true;
        Ok(())
    }

    fn destroy_executable(&self, exec: ExecutableHandle) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let bases: Vec<u64>;
        {
            let entry = state
                .executables
                .get_mut(&exec)
                .ok_or_else(|| Self::runtime_err("destroy_executable"))?;
            entry.destroyed = true;
            bases = entry.lcos.iter().map(|l| l.load_base).collect();
        }
        state.memory.retain(|(base, _)| !bases.contains(base));
        Ok(())
    }

    fn symbol_by_name(
        &self,
        exec: ExecutableHandle,
        _agent: Agent,
        name: &str,
    ) -> Result<RuntimeSymbolInfo> {
        let state = self.state.lock().unwrap();
        let executable = state
            .executables
            .get(&exec)
            .ok_or_else(|| Self::runtime_err("symbol_by_name"))?;
        for lco in &executable.lcos {
            if let Some(sym) = lco.symbols.get(name) {
                return Ok(RuntimeSymbolInfo {
                    handle: sym.handle,
                    name: name.to_string(),
                    device_address: sym.device_address,
                    kernel_object: sym.kernel_object,
                });
            }
        }
        Err(Self::runtime_err("symbol_by_name"))
    }
}

impl std::fmt::Debug for MockRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MockRuntime")
    }
}

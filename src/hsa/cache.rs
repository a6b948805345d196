//! The code-object cache.
//!
//! Snapshots the raw ELF bytes of every code object the runtime loads,
//! parses and indexes its symbols once, and answers queries until the
//! owning executable is destroyed. The runtime may reclaim its own copy of
//! the ELF at any time, which is why the cache owns a private buffer.

use super::symbol::{KernelInfo, Symbol, SymbolBinding, SymbolKind, SymbolKindFilter};
use super::{Agent, ApiTableSnapshot, ExecutableHandle, LcoHandle, LoadInfo};
use crate::amdgpu::object::{kernel_name_from_descriptor, AmdGcnObjectFile};
use crate::amdgpu::{Isa, KernelDescriptor, KernelMetadata, KERNEL_DESCRIPTOR_SIZE};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Everything the cache knows about one loaded code object.
#[derive(Debug, Clone)]
pub struct LoadedCodeObject {
    pub handle: LcoHandle,
    pub exec: ExecutableHandle,
    pub agent: Agent,
    pub isa: Isa,
    pub load_base: u64,
    pub load_size: u64,
    pub load_delta: i64,
    elf: Arc<Vec<u8>>,
    symbols: Arc<Vec<Arc<Symbol>>>,
}

impl LoadedCodeObject {
    pub fn elf_bytes(&self) -> Arc<Vec<u8>> {
        Arc::clone(&self.elf)
    }

    pub fn symbols(&self) -> &[Arc<Symbol>] {
        &self.symbols
    }

    /// Whether `addr` lies inside the loaded range.
    pub fn contains_address(&self, addr: u64) -> bool {
        addr >= self.load_base && addr < self.load_base + self.load_size
    }
}

#[derive(Default)]
struct CacheState {
    lcos: HashMap<LcoHandle, LoadedCodeObject>,
    by_exec: HashMap<ExecutableHandle, Vec<LcoHandle>>,
}

/// Process-wide cache of loaded code objects.
pub struct CodeObjectCache {
    api: ApiTableSnapshot,
    state: RwLock<CacheState>,
}

impl CodeObjectCache {
    pub fn new(api: ApiTableSnapshot) -> Self {
        CodeObjectCache {
            api,
            state: RwLock::new(CacheState::default()),
        }
    }

    /// Wrapper body for the runtime's *load-agent-code-object* operation.
    ///
    /// This runs on the application's critical startup path: it parses the
    /// ELF and indexes symbols, nothing more.
    pub fn on_code_object_loaded(
        &self,
        exec: ExecutableHandle,
        agent: Agent,
        info: LoadInfo,
        elf_bytes: &[u8],
    ) -> Result<()> {
        let elf = Arc::new(elf_bytes.to_vec());
        let obj = AmdGcnObjectFile::parse(&elf)?;
        let isa = obj.isa()?;
        let symbols = self.index_symbols(exec, agent, info, &obj)?;
        log::debug!(
            "caching {} ({isa}): {} symbols, {} bytes at {:#x}",
            info.handle,
            symbols.len(),
            elf.len(),
            info.load_base
        );
        drop(obj);

        let entry = LoadedCodeObject {
            handle: info.handle,
            exec,
            agent,
            isa,
            load_base: info.load_base,
            load_size: info.load_size,
            load_delta: info.load_delta,
            elf,
            symbols: Arc::new(symbols),
        };

        let mut state = self.state.write().unwrap();
        state.by_exec.entry(exec).or_default().push(info.handle);
        state.lcos.insert(info.handle, entry);
        Ok(())
    }

    /// Wrapper body for *executable-destroy*. Returns the handles that
    /// were invalidated so dependent caches can drop their entries.
    pub fn on_executable_destroyed(&self, exec: ExecutableHandle) -> Vec<LcoHandle> {
        let mut state = self.state.write().unwrap();
        let handles = state.by_exec.remove(&exec).unwrap_or_default();
        for handle in &handles {
            state.lcos.remove(handle);
        }
        if !handles.is_empty() {
            log::debug!("invalidated {} code objects of {exec}", handles.len());
        }
        handles
    }

    pub fn is_cached(&self, lco: LcoHandle) -> bool {
        self.state.read().unwrap().lcos.contains_key(&lco)
    }

    /// The owned snapshot of the LCO's ELF bytes.
    pub fn associated_code_object(&self, lco: LcoHandle) -> Result<Arc<Vec<u8>>> {
        Ok(self.entry(lco)?.elf_bytes())
    }

    /// The cache entry itself: load placement, ISA and indexed symbols.
    /// Callers parse the ELF view on demand from the owned bytes.
    pub fn entry(&self, lco: LcoHandle) -> Result<LoadedCodeObject> {
        self.state
            .read()
            .unwrap()
            .lcos
            .get(&lco)
            .cloned()
            .ok_or_else(|| Error::cache_miss(lco.to_string()))
    }

    /// Enumerates the LCO's symbols of one kind.
    pub fn symbols(&self, lco: LcoHandle, filter: SymbolKindFilter) -> Result<Vec<Arc<Symbol>>> {
        let entry = self.entry(lco)?;
        Ok(entry
            .symbols()
            .iter()
            .filter(|s| s.matches(filter))
            .cloned()
            .collect())
    }

    pub fn symbol_by_name(&self, lco: LcoHandle, name: &str) -> Result<Arc<Symbol>> {
        let entry = self.entry(lco)?;
        entry
            .symbols()
            .iter()
            .find(|s| s.name == name)
            .cloned()
            .ok_or_else(|| Error::cache_miss(format!("symbol `{name}` in {lco}")))
    }

    /// Finds the symbol behind a runtime-visible symbol handle.
    pub fn symbol_by_runtime_handle(&self, handle: super::SymbolHandle) -> Option<Arc<Symbol>> {
        let state = self.state.read().unwrap();
        for entry in state.lcos.values() {
            if let Some(sym) = entry
                .symbols()
                .iter()
                .find(|s| s.runtime_handle == Some(handle))
            {
                return Some(Arc::clone(sym));
            }
        }
        None
    }

    /// Finds the defined symbol whose loaded range contains `addr`.
    pub fn symbol_by_loaded_address(&self, addr: u64) -> Option<Arc<Symbol>> {
        let state = self.state.read().unwrap();
        for entry in state.lcos.values() {
            if !entry.contains_address(addr) {
                continue;
            }
            if let Some(sym) = entry
                .symbols()
                .iter()
                .find(|s| !s.is_external() && s.contains_address(addr))
            {
                return Some(Arc::clone(sym));
            }
        }
        None
    }

    /// Resolves an external symbol of `lco` against the other code
    /// objects loaded on the same agent.
    pub fn resolve_external(&self, lco: LcoHandle, name: &str) -> Result<Arc<Symbol>> {
        let agent = self.entry(lco)?.agent;
        let state = self.state.read().unwrap();
        for entry in state.lcos.values() {
            if entry.handle == lco || entry.agent != agent {
                continue;
            }
            if let Some(sym) = entry
                .symbols()
                .iter()
                .find(|s| s.name == name && !s.is_external() && s.binding == SymbolBinding::Global)
            {
                return Ok(Arc::clone(sym));
            }
        }
        Err(Error::cache_miss(format!(
            "external `{name}` has no definition on {agent}"
        )))
    }

    /// All cached LCO handles of one executable.
    pub fn lcos_of_executable(&self, exec: ExecutableHandle) -> Vec<LcoHandle> {
        self.state
            .read()
            .unwrap()
            .by_exec
            .get(&exec)
            .cloned()
            .unwrap_or_default()
    }

    fn index_symbols(
        &self,
        exec: ExecutableHandle,
        agent: Agent,
        info: LoadInfo,
        obj: &AmdGcnObjectFile<'_>,
    ) -> Result<Vec<Arc<Symbol>>> {
        let elf_syms = obj.symbols();
        let metadata = obj.kernel_metadata()?;
        let mut out = Vec::with_capacity(elf_syms.len());

        for sym in &elf_syms {
            // descriptor symbols are folded into their kernel
            if kernel_name_from_descriptor(&sym.name).is_some() {
                continue;
            }
            let binding = if sym.is_global {
                SymbolBinding::Global
            } else {
                SymbolBinding::Local
            };
            let kind = if sym.is_undefined {
                SymbolKind::External
            } else if sym.kind == object::SymbolKind::Text {
                let descriptor_symbol = format!("{}.kd", sym.name);
                match obj.symbol_by_name(&descriptor_symbol) {
                    Some(kd_sym) => {
                        let kd_bytes =
                            obj.bytes_at(kd_sym.address, KERNEL_DESCRIPTOR_SIZE as u64)?;
                        let descriptor = KernelDescriptor::parse(kd_bytes)?;
                        let metadata = metadata
                            .iter()
                            .find(|m| m.name == sym.name || m.symbol == descriptor_symbol)
                            .cloned()
                            .unwrap_or_else(|| KernelMetadata {
                                name: sym.name.clone(),
                                symbol: descriptor_symbol.clone(),
                                ..Default::default()
                            });
                        SymbolKind::Kernel(Box::new(KernelInfo {
                            descriptor_symbol,
                            descriptor_address: kd_sym
                                .address
                                .wrapping_add(info.load_delta as u64),
                            descriptor,
                            metadata,
                        }))
                    }
                    None => SymbolKind::DeviceFunction,
                }
            } else {
                SymbolKind::Variable
            };

            let runtime_handle = if binding == SymbolBinding::Global && !sym.is_undefined {
                self.api
                    .table()
                    .symbol_by_name(exec, agent, &sym.name)
                    .ok()
                    .map(|i| i.handle)
            } else {
                None
            };

            out.push(Arc::new(Symbol {
                lco: info.handle,
                name: sym.name.clone(),
                address: if sym.is_undefined {
                    0
                } else {
                    sym.address.wrapping_add(info.load_delta as u64)
                },
                file_address: sym.address,
                size: sym.size,
                binding,
                runtime_handle,
                kind,
            }));
        }
        Ok(out)
    }
}

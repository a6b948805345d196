//! The code lifter.
//!
//! Disassembles loaded kernels and device functions into instruction
//! records, recovers basic-block structure from direct-branch targets,
//! resolves relocations, and builds the machine-IR representation exposed
//! as a [`LiftedRepresentation`]. Everything is cached per symbol and
//! invalidated when the owning executable is destroyed.

pub mod lifted;

pub use lifted::{InstrRecord, LiftedRepresentation};

use crate::amdgpu::object::AmdGcnObjectFile;
use crate::amdgpu::{InstOperand, Opcode, PhysReg, RelocKind, SopkOp};
use crate::error::{Error, Result};
use crate::hsa::cache::CodeObjectCache;
use crate::hsa::symbol::{Symbol, SymbolKindFilter};
use crate::hsa::{ApiTableSnapshot, LcoHandle};
use crate::ir::{IrGlobal, IrModule, Type};
use crate::mir::{GlobalRef, InstId, MachFunction, MachInst, MachOperand, MbbId, MirGlobal, MirModule};
use crate::target::TargetManager;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Relocation info attached to a loaded address.
#[derive(Debug, Clone)]
pub struct LcoRelocation {
    pub symbol: String,
    pub kind: RelocKind,
    pub addend: i64,
}

#[derive(Default)]
struct LifterState {
    /// Disassembly cache, keyed by function symbol.
    disassembly: HashMap<(LcoHandle, String), Arc<Vec<InstrRecord>>>,
    /// Loaded addresses that are targets of direct branches, per LCO.
    branch_targets: HashMap<LcoHandle, HashSet<u64>>,
    /// Loaded address → relocation, per LCO.
    relocations: HashMap<LcoHandle, Arc<HashMap<u64, LcoRelocation>>>,
    /// Lift cache, keyed by kernel symbol.
    lifted: HashMap<(LcoHandle, String), Arc<LiftedRepresentation>>,
}

/// Process-wide lifter. One mutex guards all caches; a kernel is lifted
/// at most once concurrently.
pub struct CodeLifter {
    api: ApiTableSnapshot,
    cache: Arc<CodeObjectCache>,
    targets: Arc<TargetManager>,
    state: Mutex<LifterState>,
}

impl CodeLifter {
    pub fn new(
        api: ApiTableSnapshot,
        cache: Arc<CodeObjectCache>,
        targets: Arc<TargetManager>,
    ) -> Self {
        CodeLifter {
            api,
            cache,
            targets,
            state: Mutex::new(LifterState::default()),
        }
    }

    /// Disassembles a kernel or device function into instruction records.
    /// Cached on first use.
    pub fn disassemble(&self, symbol: &Arc<Symbol>) -> Result<Arc<Vec<InstrRecord>>> {
        if !symbol.is_function() {
            return Err(Error::lift(format!(
                "cannot disassemble non-function symbol `{}`",
                symbol.name
            )));
        }
        let mut state = self.state.lock().unwrap();
        self.disassemble_locked(&mut state, symbol)
    }

    fn disassemble_locked(
        &self,
        state: &mut LifterState,
        symbol: &Arc<Symbol>,
    ) -> Result<Arc<Vec<InstrRecord>>> {
        let key = (symbol.lco, symbol.name.clone());
        if let Some(records) = state.disassembly.get(&key) {
            return Ok(Arc::clone(records));
        }

        let entry = self.cache.entry(symbol.lco)?;
        let info = self.targets.target_info(&entry.isa)?;
        let bytes = self
            .api
            .table()
            .read_device_memory(entry.agent, symbol.address, symbol.size)?;
        let decoded = info.disassemble(&bytes).map_err(|e| match e {
            // report the offending location as a loaded address
            Error::Decode { offset, word } => Error::Decode {
                offset: offset + symbol.address,
                word,
            },
            other => other,
        })?;

        let mut records = Vec::with_capacity(decoded.len());
        for (i, (inst, offset)) in decoded.iter().enumerate() {
            let address = symbol.address + offset;
            let size = match decoded.get(i + 1) {
                Some((_, next)) => next - offset,
                None => bytes.len() as u64 - offset,
            };
            if inst.opcode.is_direct_branch() {
                if let Some(target) = info.evaluate_branch(inst, address, size) {
                    log::trace!(
                        "`{inst}` at {address:#x} branches to {target:#x}"
                    );
                    state
                        .branch_targets
                        .entry(symbol.lco)
                        .or_default()
                        .insert(target);
                } else {
                    log::warn!("failed to evaluate branch target of `{inst}` at {address:#x}");
                }
            }
            records.push(InstrRecord {
                inst: inst.clone(),
                address,
                size,
                symbol: Arc::clone(symbol),
            });
        }
        log::debug!(
            "disassembled `{}`: {} instructions, {} bytes",
            symbol.name,
            records.len(),
            bytes.len()
        );
        let records = Arc::new(records);
        state.disassembly.insert(key, Arc::clone(&records));
        Ok(records)
    }

    /// Loaded-address → relocation map of an LCO, built on first use.
    fn relocations_locked(
        &self,
        state: &mut LifterState,
        lco: LcoHandle,
    ) -> Result<Arc<HashMap<u64, LcoRelocation>>> {
        if let Some(map) = state.relocations.get(&lco) {
            return Ok(Arc::clone(map));
        }
        let entry = self.cache.entry(lco)?;
        let bytes = entry.elf_bytes();
        let obj = AmdGcnObjectFile::parse(&bytes)?;
        let mut map = HashMap::new();
        for record in obj.relocations() {
            map.insert(
                record.address.wrapping_add(entry.load_delta as u64),
                LcoRelocation {
                    symbol: record.symbol,
                    kind: record.kind,
                    addend: record.addend,
                },
            );
        }
        log::debug!("resolved {} relocations for {lco}", map.len());
        let map = Arc::new(map);
        state.relocations.insert(lco, Arc::clone(&map));
        Ok(map)
    }

    /// Lifts a kernel into machine IR. Cached on first invocation; a
    /// second caller receives the same representation.
    pub fn lift(&self, kernel: &Arc<Symbol>) -> Result<Arc<LiftedRepresentation>> {
        if kernel.as_kernel().is_none() {
            return Err(Error::lift(format!(
                "`{}` is not a kernel symbol",
                kernel.name
            )));
        }

        let mut state = self.state.lock().unwrap();
        let key = (kernel.lco, kernel.name.clone());
        if let Some(lr) = state.lifted.get(&key) {
            return Ok(Arc::clone(lr));
        }

        let entry = self.cache.entry(kernel.lco)?;
        let device_fns = self.cache.symbols(kernel.lco, SymbolKindFilter::DeviceFunction)?;
        let variables = self.cache.symbols(kernel.lco, SymbolKindFilter::Variable)?;
        let externals = self.cache.symbols(kernel.lco, SymbolKindFilter::External)?;

        // disassemble every function first so the branch-target set is
        // complete before any block splitting happens
        let mut all_records: Vec<(Arc<Symbol>, Arc<Vec<InstrRecord>>)> = Vec::new();
        all_records.push((
            Arc::clone(kernel),
            self.disassemble_locked(&mut state, kernel)?,
        ));
        for func in &device_fns {
            all_records.push((
                Arc::clone(func),
                self.disassemble_locked(&mut state, func)?,
            ));
        }

        let relocations = self.relocations_locked(&mut state, kernel.lco)?;
        let branch_targets = state
            .branch_targets
            .get(&kernel.lco)
            .cloned()
            .unwrap_or_default();

        let target_machine = self.targets.create_target_machine(&entry.isa)?;

        // globals: one IR + MIR global per variable and external
        let elf_bytes = entry.elf_bytes();
        let obj = AmdGcnObjectFile::parse(&elf_bytes)?;
        let mut ir = IrModule::default();
        let mut mir = MirModule::new();
        let mut global_symbols = HashMap::new();
        for var in variables.iter().chain(externals.iter()) {
            let is_extern = var.is_external();
            ir.add_global(IrGlobal {
                name: var.name.clone(),
                ty: if var.size <= 4 { Type::I32 } else { Type::I64 },
                is_extern,
            });
            let init = if is_extern {
                None
            } else {
                obj.bytes_at(var.file_address, var.size).ok().map(|b| b.to_vec())
            };
            mir.add_global(MirGlobal {
                name: var.name.clone(),
                size: var.size.max(1),
                align: 4,
                init,
                is_extern,
            });
            global_symbols.insert(var.name.clone(), Arc::clone(var));
        }

        // function start addresses, for call-target symbolisation
        let fn_by_addr: HashMap<u64, String> = all_records
            .iter()
            .map(|(sym, _)| (sym.address, sym.name.clone()))
            .collect();

        let mut function_symbols = HashMap::new();
        let mut records_flat = Vec::new();
        let mut mi_to_record = HashMap::new();
        for (symbol, records) in &all_records {
            let base = records_flat.len();
            let mut func = MachFunction::new(&symbol.name, symbol.as_kernel().is_some());
            if let Some(info) = symbol.as_kernel() {
                func.descriptor = Some(info.descriptor.clone());
            }
            lift_function(
                &mut mir,
                &mut func,
                records,
                &branch_targets,
                &relocations,
                &fn_by_addr,
                base,
                &mut mi_to_record,
            )?;
            mir.add_function(func);
            function_symbols.insert(symbol.name.clone(), Arc::clone(symbol));
            records_flat.extend(records.iter().cloned());
        }

        let lr = Arc::new(LiftedRepresentation::new(
            entry.isa.clone(),
            kernel.lco,
            target_machine,
            Arc::clone(kernel),
            mir,
            ir,
            function_symbols,
            global_symbols,
            records_flat,
            mi_to_record,
        ));
        log::debug!("lifted `{}`: {lr:?}", kernel.name);
        state.lifted.insert(key, Arc::clone(&lr));
        Ok(lr)
    }

    /// Deep-copies a representation so instrumentation can mutate it
    /// without poisoning the cached original.
    pub fn clone_representation(
        &self,
        lr: &LiftedRepresentation,
    ) -> Result<LiftedRepresentation> {
        let _guard = lr.lock();
        Ok(lr.deep_clone())
    }

    /// Drops every cached item that references the given LCOs.
    pub fn on_executable_destroyed(&self, lcos: &[LcoHandle]) {
        let mut state = self.state.lock().unwrap();
        state.disassembly.retain(|(lco, _), _| !lcos.contains(lco));
        state.lifted.retain(|(lco, _), _| !lcos.contains(lco));
        for lco in lcos {
            state.branch_targets.remove(lco);
            state.relocations.remove(lco);
        }
    }

    /// Whether a lifted representation is currently cached for `kernel`.
    pub fn is_lift_cached(&self, kernel: &Symbol) -> bool {
        self.state
            .lock()
            .unwrap()
            .lifted
            .contains_key(&(kernel.lco, kernel.name.clone()))
    }
}

/// Builds one machine function from its instruction records.
#[allow(clippy::too_many_arguments)]
fn lift_function(
    module: &mut MirModule,
    func: &mut MachFunction,
    records: &[InstrRecord],
    branch_targets: &HashSet<u64>,
    relocations: &HashMap<u64, LcoRelocation>,
    fn_by_addr: &HashMap<u64, String>,
    record_base: usize,
    mi_to_record: &mut HashMap<InstId, usize>,
) -> Result<()> {
    if records.is_empty() {
        return Err(Error::lift(format!(
            "function `{}` has no instructions",
            func.name
        )));
    }

    // block boundaries: the entry, every branch target, and everything
    // following a terminator
    let mut starts = BTreeSet::new();
    starts.insert(records[0].address);
    for (i, record) in records.iter().enumerate() {
        if branch_targets.contains(&record.address) {
            starts.insert(record.address);
        }
        if record.inst.opcode.is_terminator() {
            if let Some(next) = records.get(i + 1) {
                starts.insert(next.address);
            }
        }
    }

    let mut block_at: HashMap<u64, MbbId> = HashMap::new();
    for addr in &starts {
        let id = func.add_block();
        block_at.insert(*addr, id);
    }

    let end = records.last().map(|r| r.address + r.size).unwrap_or(0);
    let mut current = block_at[&records[0].address];
    for (i, record) in records.iter().enumerate() {
        if let Some(block) = block_at.get(&record.address) {
            current = *block;
        }
        let inst = translate_record(module, record, &block_at, relocations, fn_by_addr, end)?;
        mi_to_record.insert(inst.id, record_base + i);
        func.block_mut(current).insts.push(inst);
    }

    // wire edges
    let block_order: Vec<MbbId> = starts.iter().map(|addr| block_at[addr]).collect();
    for (i, block) in block_order.iter().enumerate() {
        let (target, falls_through) = match func.block(*block).terminator() {
            Some(term) => (
                term.branch_target(),
                term.opcode.is_conditional_branch(),
            ),
            // split forced by a branch target on the next address
            None => (None, true),
        };
        if let Some(target) = target {
            func.add_edge(*block, target);
        }
        if falls_through {
            if let Some(next) = block_order.get(i + 1) {
                func.add_edge(*block, *next);
            }
        }
    }
    Ok(())
}

/// Translates one record into a machine instruction, symbolising branch
/// targets, call targets and relocated immediates.
fn translate_record(
    module: &mut MirModule,
    record: &InstrRecord,
    block_at: &HashMap<u64, MbbId>,
    relocations: &HashMap<u64, LcoRelocation>,
    fn_by_addr: &HashMap<u64, String>,
    function_end: u64,
) -> Result<MachInst> {
    let opcode = record.inst.opcode;
    let def_count = opcode.def_count();
    let mut inst = module.new_inst(opcode);

    // a relocation patching inside this record symbolises its literal
    let reloc = (record.address..record.address + record.size)
        .find_map(|addr| relocations.get(&addr));

    for (i, op) in record.inst.operands.iter().enumerate() {
        let operand = match op {
            InstOperand::Reg(r) => {
                if i < def_count {
                    MachOperand::reg_def(*r)
                } else {
                    MachOperand::reg_use(*r)
                }
            }
            InstOperand::FImm(v) => MachOperand::FImm(*v),
            InstOperand::Imm(v) => {
                if opcode.is_direct_branch() {
                    let target = record.address + 4 + (*v as u64).wrapping_mul(4);
                    match block_at.get(&target) {
                        Some(block) => MachOperand::Block(*block),
                        None if target == function_end => {
                            // branch to the end of the function; keep the
                            // raw displacement
                            MachOperand::Imm(*v)
                        }
                        None => {
                            return Err(Error::lift(format!(
                                "branch at {:#x} targets {target:#x}, outside its function",
                                record.address
                            )))
                        }
                    }
                } else if opcode == Opcode::Sopk(SopkOp::S_CALL_B64) && i == 1 {
                    let target = record.address + 4 + (*v as u64).wrapping_mul(4);
                    match fn_by_addr.get(&target) {
                        Some(name) => MachOperand::Global(GlobalRef::new(name.clone())),
                        None => MachOperand::Imm(*v),
                    }
                } else if let Some(reloc) = reloc.filter(|_| !(-16..=64).contains(v)) {
                    // the literal slot is the relocated operand
                    MachOperand::Global(GlobalRef::with_reloc(
                        reloc.symbol.clone(),
                        reloc.kind,
                        reloc.addend,
                    ))
                } else {
                    MachOperand::Imm(*v)
                }
            }
        };
        inst.operands.push(operand);
    }

    // implicit state effects
    if opcode.defs_scc() {
        inst.operands.push(MachOperand::implicit_def(PhysReg::Scc));
    }
    match opcode {
        Opcode::Vop2(crate::amdgpu::Vop2Op::V_ADD_CO_U32)
        | Opcode::Vop2(crate::amdgpu::Vop2Op::V_SUB_CO_U32) => {
            inst.operands.push(MachOperand::implicit_def(PhysReg::VccLo));
        }
        Opcode::Vop2(crate::amdgpu::Vop2Op::V_ADDC_CO_U32) => {
            inst.operands.push(MachOperand::implicit_def(PhysReg::VccLo));
            inst.operands.push(MachOperand::implicit_use(PhysReg::VccLo));
        }
        Opcode::Vop2(crate::amdgpu::Vop2Op::V_CNDMASK_B32) => {
            inst.operands.push(MachOperand::implicit_use(PhysReg::VccLo));
        }
        _ => {}
    }
    Ok(inst)
}

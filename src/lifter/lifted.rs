//! The lifted representation of one kernel.
//!
//! Owns everything the kernel needs to be regenerated independently of
//! its executable: a machine-IR module with the kernel and every device
//! function of its code object, an IR module holding the globals (and,
//! after instrumentation, the injected hook code), a target machine, and
//! the map between machine instructions and the records they were lifted
//! from.

use crate::amdgpu::{Inst, Isa};
use crate::hsa::symbol::Symbol;
use crate::hsa::LcoHandle;
use crate::ir::IrModule;
use crate::mir::{InstId, MachFunction, MirModule};
use crate::target::TargetMachine;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// One disassembled instruction with its load placement.
#[derive(Debug, Clone)]
pub struct InstrRecord {
    pub inst: Inst,
    /// Loaded device address.
    pub address: u64,
    /// Byte size; strictly positive, equal to the distance to the next
    /// record.
    pub size: u64,
    /// The function symbol this instruction belongs to.
    pub symbol: Arc<Symbol>,
}

/// The product of lifting one kernel.
pub struct LiftedRepresentation {
    pub isa: Isa,
    pub lco: LcoHandle,
    pub target_machine: TargetMachine,
    /// The lifted kernel's symbol.
    pub kernel: Arc<Symbol>,
    /// Machine IR: the kernel function, every device function of the LCO,
    /// and (after instrumentation) the injected payload functions.
    pub mir: MirModule,
    /// IR level: globals for every variable/external, and the hook code
    /// cloned in during instrumentation.
    pub ir: IrModule,
    /// MIR function name → the symbol it was lifted from.
    functions: HashMap<String, Arc<Symbol>>,
    /// IR global name → the variable/external symbol behind it.
    globals: HashMap<String, Arc<Symbol>>,
    /// All records, in per-function disassembly order.
    records: Vec<InstrRecord>,
    /// Machine instruction ↔ record. Valid until the first
    /// transformation pass rewrites instructions; the code generator
    /// works on a clone and never consults the original's map again.
    mi_to_record: HashMap<InstId, usize>,
    record_to_mi: HashMap<usize, InstId>,
    /// The thread-safe context lock. Operations on the same
    /// representation from several threads serialise on it.
    context: Arc<Mutex<()>>,
}

impl LiftedRepresentation {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        isa: Isa,
        lco: LcoHandle,
        target_machine: TargetMachine,
        kernel: Arc<Symbol>,
        mir: MirModule,
        ir: IrModule,
        functions: HashMap<String, Arc<Symbol>>,
        globals: HashMap<String, Arc<Symbol>>,
        records: Vec<InstrRecord>,
        mi_to_record: HashMap<InstId, usize>,
    ) -> Self {
        let record_to_mi = mi_to_record.iter().map(|(mi, idx)| (*idx, *mi)).collect();
        LiftedRepresentation {
            isa,
            lco,
            target_machine,
            kernel,
            mir,
            ir,
            functions,
            globals,
            records,
            mi_to_record,
            record_to_mi,
            context: Arc::new(Mutex::new(())),
        }
    }

    /// Locks the representation's context. Hold the guard for the
    /// duration of any multi-step read of a shared representation.
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.context.lock().unwrap()
    }

    /// The kernel's machine function.
    pub fn kernel_mf(&self) -> &MachFunction {
        self.mir
            .function(&self.kernel.name)
            .expect("lifted module always contains the kernel function")
    }

    /// The record a machine instruction was lifted from, if the
    /// instruction is part of the original code.
    pub fn record_for(&self, mi: InstId) -> Option<&InstrRecord> {
        self.mi_to_record.get(&mi).map(|idx| &self.records[*idx])
    }

    /// The machine instruction a record was lifted to.
    pub fn mi_for_record(&self, record_index: usize) -> Option<InstId> {
        self.record_to_mi.get(&record_index).copied()
    }

    pub fn records(&self) -> &[InstrRecord] {
        &self.records
    }

    /// The symbol behind a lifted machine function.
    pub fn symbol_of_function(&self, name: &str) -> Option<&Arc<Symbol>> {
        self.functions.get(name)
    }

    /// The symbol behind an IR global.
    pub fn symbol_of_global(&self, name: &str) -> Option<&Arc<Symbol>> {
        self.globals.get(name)
    }

    /// Iterates over every lifted function (the kernel and all device
    /// functions) with its symbol.
    pub fn iterate_all_defined_functions<E>(
        &self,
        mut f: impl FnMut(&Arc<Symbol>, &MachFunction) -> std::result::Result<(), E>,
    ) -> std::result::Result<(), E> {
        for func in &self.mir.functions {
            if let Some(symbol) = self.functions.get(&func.name) {
                f(symbol, func)?;
            }
        }
        Ok(())
    }

    pub fn function_symbols(&self) -> impl Iterator<Item = (&String, &Arc<Symbol>)> {
        self.functions.iter()
    }

    pub fn global_symbols(&self) -> impl Iterator<Item = (&String, &Arc<Symbol>)> {
        self.globals.iter()
    }

    /// Deep copy under a fresh context. Instruction ids are preserved, so
    /// the clone's instruction↔record maps stay valid until the code
    /// generator starts rewriting the clone.
    pub(crate) fn deep_clone(&self) -> LiftedRepresentation {
        LiftedRepresentation {
            isa: self.isa.clone(),
            lco: self.lco,
            target_machine: self.target_machine.clone(),
            kernel: Arc::clone(&self.kernel),
            mir: self.mir.clone(),
            ir: self.ir.clone(),
            functions: self.functions.clone(),
            globals: self.globals.clone(),
            records: self.records.clone(),
            mi_to_record: self.mi_to_record.clone(),
            record_to_mi: self.record_to_mi.clone(),
            context: Arc::new(Mutex::new(())),
        }
    }
}

impl std::fmt::Debug for LiftedRepresentation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiftedRepresentation")
            .field("kernel", &self.kernel.name)
            .field("isa", &self.isa.target_string())
            .field("functions", &self.functions.len())
            .field("globals", &self.globals.len())
            .field("records", &self.records.len())
            .finish()
    }
}

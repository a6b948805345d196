//! The machine-IR container: functions, globals, and the instruction-id
//! allocator.
//!
//! Instruction ids are minted by the module and never reused, so maps
//! keyed by [`InstId`] survive instruction insertion. Deep-cloning the
//! module preserves ids, which is how a cloned lifted representation keeps
//! its instruction↔record correspondence without pointer identity.

use super::function::MachFunction;
use super::inst::{InstId, MachInst, MbbId};
use crate::amdgpu::Opcode;

/// A global value at the machine-IR level.
#[derive(Debug, Clone, PartialEq)]
pub struct MirGlobal {
    pub name: String,
    pub size: u64,
    pub align: u32,
    /// Initialiser bytes; `None` for zero-initialised or external.
    pub init: Option<Vec<u8>>,
    pub is_extern: bool,
}

/// The module owning all machine functions lifted from one code object
/// (plus, after instrumentation, the injected payload functions).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MirModule {
    pub functions: Vec<MachFunction>,
    pub globals: Vec<MirGlobal>,
    next_inst: u32,
}

impl MirModule {
    pub fn new() -> Self {
        MirModule::default()
    }

    /// Mints a fresh instruction with a module-unique id.
    pub fn new_inst(&mut self, opcode: Opcode) -> MachInst {
        let id = InstId(self.next_inst);
        self.next_inst += 1;
        MachInst::new(id, opcode)
    }

    pub fn add_function(&mut self, func: MachFunction) -> usize {
        self.functions.push(func);
        self.functions.len() - 1
    }

    pub fn function(&self, name: &str) -> Option<&MachFunction> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn function_mut(&mut self, name: &str) -> Option<&mut MachFunction> {
        self.functions.iter_mut().find(|f| f.name == name)
    }

    pub fn add_global(&mut self, global: MirGlobal) {
        if self.global(&global.name).is_none() {
            self.globals.push(global);
        }
    }

    pub fn global(&self, name: &str) -> Option<&MirGlobal> {
        self.globals.iter().find(|g| g.name == name)
    }

    /// Locates an instruction anywhere in the module.
    pub fn find_inst(&self, id: InstId) -> Option<(usize, MbbId, usize)> {
        for (fi, func) in self.functions.iter().enumerate() {
            if let Some((block, pos)) = func.find_inst(id) {
                return Some((fi, block, pos));
            }
        }
        None
    }

    /// Whether `id` names an instruction of this module.
    pub fn contains_inst(&self, id: InstId) -> bool {
        self.find_inst(id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amdgpu::PseudoOp;

    #[test]
    fn inst_ids_are_unique_and_survive_clone() {
        let mut module = MirModule::new();
        let mut func = MachFunction::new("k", true);
        let b0 = func.add_block();
        let a = module.new_inst(Opcode::Pseudo(PseudoOp::Copy));
        let b = module.new_inst(Opcode::Pseudo(PseudoOp::Copy));
        assert_ne!(a.id, b.id);
        let a_id = a.id;
        func.block_mut(b0).insts.push(a);
        func.block_mut(b0).insts.push(b);
        module.add_function(func);

        let clone = module.clone();
        assert!(clone.contains_inst(a_id));
        // a fresh instruction in the clone does not collide with kept ids
        let mut clone = clone;
        let c = clone.new_inst(Opcode::Pseudo(PseudoOp::Copy));
        assert!(!module.contains_inst(c.id));
    }

    #[test]
    fn globals_are_deduplicated() {
        let mut module = MirModule::new();
        module.add_global(MirGlobal {
            name: "counter".into(),
            size: 8,
            align: 8,
            init: None,
            is_extern: false,
        });
        module.add_global(MirGlobal {
            name: "counter".into(),
            size: 16,
            align: 8,
            init: None,
            is_extern: false,
        });
        assert_eq!(module.globals.len(), 1);
        assert_eq!(module.global("counter").unwrap().size, 8);
    }
}

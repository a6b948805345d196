//! Machine functions: basic blocks, virtual registers and frame state.

use super::inst::{InstId, MachInst, MbbId};
use super::reg::{RegClass, VirtReg};
use crate::amdgpu::KernelDescriptor;

/// One machine basic block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MachBasicBlock {
    pub id: MbbId,
    pub insts: Vec<MachInst>,
    pub succs: Vec<MbbId>,
    pub preds: Vec<MbbId>,
}

impl MachBasicBlock {
    pub fn terminator(&self) -> Option<&MachInst> {
        self.insts.last().filter(|i| i.is_terminator())
    }
}

/// Frame facts accumulated by preamble analysis and consumed by the
/// prologue/epilogue pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameInfo {
    /// Whether scratch-and-stack setup is required on entry.
    pub needs_scratch_setup: bool,
    /// Extra scratch bytes requested on top of the original kernel's
    /// private segment.
    pub extra_scratch_bytes: u32,
    /// Whether the injected payload uses the state-value array.
    pub uses_state_value_array: bool,
    /// Device functions: whether a pre/post-amble push/pop is required.
    pub needs_push_pop: bool,
}

/// One machine function.
#[derive(Debug, Clone, PartialEq)]
pub struct MachFunction {
    pub name: String,
    pub is_kernel: bool,
    /// Present for kernels; carried so the printer can re-emit an updated
    /// descriptor.
    pub descriptor: Option<KernelDescriptor>,
    pub blocks: Vec<MachBasicBlock>,
    vreg_classes: Vec<RegClass>,
    pub frame: FrameInfo,
}

impl MachFunction {
    pub fn new(name: impl Into<String>, is_kernel: bool) -> Self {
        MachFunction {
            name: name.into(),
            is_kernel,
            descriptor: None,
            blocks: Vec::new(),
            vreg_classes: Vec::new(),
            frame: FrameInfo::default(),
        }
    }

    pub fn add_block(&mut self) -> MbbId {
        let id = MbbId(self.blocks.len() as u32);
        self.blocks.push(MachBasicBlock {
            id,
            ..Default::default()
        });
        id
    }

    pub fn block(&self, id: MbbId) -> &MachBasicBlock {
        &self.blocks[id.0 as usize]
    }

    pub fn block_mut(&mut self, id: MbbId) -> &mut MachBasicBlock {
        &mut self.blocks[id.0 as usize]
    }

    pub fn add_edge(&mut self, from: MbbId, to: MbbId) {
        if !self.block(from).succs.contains(&to) {
            self.block_mut(from).succs.push(to);
        }
        if !self.block(to).preds.contains(&from) {
            self.block_mut(to).preds.push(from);
        }
    }

    pub fn create_vreg(&mut self, class: RegClass) -> VirtReg {
        let v = VirtReg(self.vreg_classes.len() as u32);
        self.vreg_classes.push(class);
        v
    }

    pub fn vreg_class(&self, v: VirtReg) -> RegClass {
        self.vreg_classes[v.0 as usize]
    }

    pub fn vreg_count(&self) -> usize {
        self.vreg_classes.len()
    }

    /// All instructions in block order.
    pub fn insts(&self) -> impl Iterator<Item = &MachInst> {
        self.blocks.iter().flat_map(|b| b.insts.iter())
    }

    /// Locates an instruction by id.
    pub fn find_inst(&self, id: InstId) -> Option<(MbbId, usize)> {
        for block in &self.blocks {
            if let Some(pos) = block.insts.iter().position(|i| i.id == id) {
                return Some((block.id, pos));
            }
        }
        None
    }

    /// Inserts `inst` immediately before the instruction `before`.
    pub fn insert_before(&mut self, before: InstId, inst: MachInst) -> bool {
        if let Some((block, pos)) = self.find_inst(before) {
            self.block_mut(block).insts.insert(pos, inst);
            true
        } else {
            false
        }
    }

    pub fn inst_count(&self) -> usize {
        self.blocks.iter().map(|b| b.insts.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amdgpu::{Opcode, PseudoOp};
    use crate::mir::inst::MachOperand;
    use crate::mir::reg::Register;
    use crate::amdgpu::PhysReg;

    fn copy(id: u32) -> MachInst {
        MachInst::new(InstId(id), Opcode::Pseudo(PseudoOp::Copy))
            .with(MachOperand::reg_def(Register::Phys(PhysReg::Sgpr(0))))
            .with(MachOperand::reg_use(Register::Phys(PhysReg::Sgpr(1))))
    }

    #[test]
    fn block_and_edge_management() {
        let mut func = MachFunction::new("k", true);
        let b0 = func.add_block();
        let b1 = func.add_block();
        func.add_edge(b0, b1);
        func.add_edge(b0, b1); // idempotent
        assert_eq!(func.block(b0).succs, vec![b1]);
        assert_eq!(func.block(b1).preds, vec![b0]);
    }

    #[test]
    fn insert_before_by_id() {
        let mut func = MachFunction::new("k", true);
        let b0 = func.add_block();
        func.block_mut(b0).insts.push(copy(10));
        func.block_mut(b0).insts.push(copy(11));
        assert!(func.insert_before(InstId(11), copy(99)));
        let ids: Vec<_> = func.block(b0).insts.iter().map(|i| i.id.0).collect();
        assert_eq!(ids, vec![10, 99, 11]);
        assert!(!func.insert_before(InstId(1000), copy(98)));
    }

    #[test]
    fn vreg_classes() {
        let mut func = MachFunction::new("k", false);
        let a = func.create_vreg(RegClass::SGpr32);
        let b = func.create_vreg(RegClass::VGpr64);
        assert_eq!(func.vreg_class(a), RegClass::SGpr32);
        assert_eq!(func.vreg_class(b), RegClass::VGpr64);
        assert_eq!(func.vreg_count(), 2);
    }
}

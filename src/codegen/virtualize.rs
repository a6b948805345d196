//! Physical-register virtualisation.
//!
//! Original machine code addresses physical registers directly, and
//! lowered intrinsics want access to the same registers. Inside injected
//! payload code this pass replaces every read or write of an allocatable
//! physical register by a virtual register of the matching class,
//! bracketed by explicit COPYs at function entry (for reads of the
//! surrounding kernel's state) and before returns (for writes back).
//! Non-allocatable machine state (EXEC, VCC, M0) is left alone; the
//! prologue/epilogue pass owns those.

use crate::amdgpu::{Opcode, PhysReg, PseudoOp, Sop1Op};
use crate::error::Result;
use crate::mir::{MachFunction, MachOperand, MirModule, RegClass, Register, VirtReg};
use std::collections::{BTreeMap, BTreeSet};

/// Outcome of virtualising one payload function.
#[derive(Debug, Default)]
pub struct VirtualizeResult {
    /// Physical registers the payload reads from the surrounding code.
    pub reads: Vec<PhysReg>,
    /// Physical registers the payload writes back into the surrounding
    /// code.
    pub writes: Vec<PhysReg>,
}

/// Virtualises `func`, honouring (and extending) the access map built by
/// the MIR intrinsic-lowering stage.
pub fn virtualize_function(
    module: &mut MirModule,
    func: &mut MachFunction,
    phys_vregs: &mut BTreeMap<PhysReg, VirtReg>,
    reserved: &dyn Fn(PhysReg) -> bool,
) -> Result<VirtualizeResult> {
    // phase 1: find direct references not routed through the intrinsic
    // factories
    let mut referenced: BTreeSet<PhysReg> = BTreeSet::new();
    for inst in func.insts() {
        for operand in &inst.operands {
            if let MachOperand::Reg(r) = operand {
                if r.is_implicit {
                    continue;
                }
                if let Register::Phys(p) = r.reg {
                    if p.is_allocatable() && !is_link_register(p) && !reserved(p) {
                        referenced.insert(p);
                    }
                }
            }
        }
    }
    for phys in referenced {
        phys_vregs
            .entry(phys)
            .or_insert_with(|| func.create_vreg(RegClass::of_phys(phys)));
    }

    // phase 2: rewrite operands through the map
    for block in &mut func.blocks {
        for inst in &mut block.insts {
            for operand in &mut inst.operands {
                let MachOperand::Reg(r) = operand else {
                    continue;
                };
                if r.is_implicit {
                    continue;
                }
                let Register::Phys(p) = r.reg else { continue };
                if let Some(v) = phys_vregs.get(&p) {
                    r.reg = Register::Virt(*v);
                }
            }
        }
    }

    // classify each virtualised register by how the payload touches it
    let mut result = VirtualizeResult::default();
    for (&phys, &vreg) in phys_vregs.iter() {
        let mut read = false;
        let mut written = false;
        for inst in func.insts() {
            for operand in &inst.operands {
                if let MachOperand::Reg(r) = operand {
                    if r.reg == Register::Virt(vreg) {
                        if r.is_def {
                            written = true;
                        } else {
                            read = true;
                        }
                    }
                }
            }
        }
        if read {
            result.reads.push(phys);
        }
        if written {
            result.writes.push(phys);
        }
    }

    // entry copies for reads: the registers still hold the surrounding
    // code's values on entry because allocation avoids them
    if !func.blocks.is_empty() {
        let mut head = Vec::new();
        for &phys in &result.reads {
            let vreg = phys_vregs[&phys];
            head.push(
                module
                    .new_inst(Opcode::Pseudo(PseudoOp::Copy))
                    .with(MachOperand::reg_def(vreg))
                    .with(MachOperand::reg_use(phys)),
            );
        }
        let entry = &mut func.blocks[0].insts;
        for inst in head.into_iter().rev() {
            entry.insert(0, inst);
        }
    }

    // write-backs before every return
    if !result.writes.is_empty() {
        for bi in 0..func.blocks.len() {
            let Some(pos) = func.blocks[bi]
                .insts
                .iter()
                .position(|i| i.opcode == Opcode::Sop1(Sop1Op::S_SETPC_B64))
            else {
                continue;
            };
            let mut tail = Vec::new();
            for &phys in &result.writes {
                let vreg = phys_vregs[&phys];
                tail.push(
                    module
                        .new_inst(Opcode::Pseudo(PseudoOp::Copy))
                        .with(MachOperand::reg_def(phys))
                        .with(MachOperand::reg_use(vreg)),
                );
            }
            for (n, inst) in tail.into_iter().enumerate() {
                func.blocks[bi].insts.insert(pos + n, inst);
            }
        }
    }

    func.frame.uses_state_value_array |= !phys_vregs.is_empty();
    func.frame.needs_push_pop = true;
    Ok(result)
}

/// s30/s31 carry the payload return address; the call sequence owns them.
fn is_link_register(p: PhysReg) -> bool {
    matches!(p, PhysReg::Sgpr(30) | PhysReg::Sgpr(31))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amdgpu::Sop2Op;

    #[test]
    fn direct_phys_use_becomes_entry_copy() {
        let mut module = MirModule::new();
        let mut func = MachFunction::new("payload", false);
        let b = func.add_block();
        let dst = func.create_vreg(RegClass::SGpr32);
        // payload reads s4 directly
        let mi = module
            .new_inst(Opcode::Sop2(Sop2Op::S_ADD_U32))
            .with(MachOperand::reg_def(dst))
            .with(MachOperand::reg_use(PhysReg::Sgpr(4)))
            .with(MachOperand::Imm(1));
        func.block_mut(b).insts.push(mi);
        let ret = module
            .new_inst(Opcode::Sop1(Sop1Op::S_SETPC_B64))
            .with(MachOperand::reg_use(PhysReg::Sgpr(30)))
            .with(MachOperand::reg_use(PhysReg::Sgpr(30)));
        func.block_mut(b).insts.push(ret);

        let mut map = BTreeMap::new();
        let result = virtualize_function(&mut module, &mut func, &mut map, &|_| false).unwrap();
        assert_eq!(result.reads, vec![PhysReg::Sgpr(4)]);
        assert!(result.writes.is_empty());

        // entry copy reads s4 into the minted vreg; the add now uses the
        // vreg
        let entry = &func.blocks[0].insts;
        assert_eq!(entry[0].opcode, Opcode::Pseudo(PseudoOp::Copy));
        assert!(entry[0].touches_phys(PhysReg::Sgpr(4)));
        assert!(!entry[1].touches_phys(PhysReg::Sgpr(4)));
        assert!(func.frame.uses_state_value_array);
    }

    #[test]
    fn write_back_lands_before_return() {
        let mut module = MirModule::new();
        let mut func = MachFunction::new("payload", false);
        let b = func.add_block();
        let src = func.create_vreg(RegClass::SGpr32);
        let mi = module
            .new_inst(Opcode::Pseudo(PseudoOp::Copy))
            .with(MachOperand::reg_def(PhysReg::Sgpr(8)))
            .with(MachOperand::reg_use(src));
        func.block_mut(b).insts.push(mi);
        let ret = module
            .new_inst(Opcode::Sop1(Sop1Op::S_SETPC_B64))
            .with(MachOperand::reg_use(PhysReg::Sgpr(30)))
            .with(MachOperand::reg_use(PhysReg::Sgpr(30)));
        func.block_mut(b).insts.push(ret);

        let mut map = BTreeMap::new();
        let result = virtualize_function(&mut module, &mut func, &mut map, &|_| false).unwrap();
        assert_eq!(result.writes, vec![PhysReg::Sgpr(8)]);
        let insts = &func.blocks[0].insts;
        // copy into vreg, write-back copy, then the return
        assert_eq!(insts.len(), 3);
        assert!(insts[1].touches_phys(PhysReg::Sgpr(8)));
        assert_eq!(insts[2].opcode, Opcode::Sop1(Sop1Op::S_SETPC_B64));
    }
}

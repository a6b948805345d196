//! Branch-target evaluation.
//!
//! SOPP branch targets are relative to the end of the four-byte branch
//! instruction, counted in dwords: `target = pc + 4 + simm16 * 4`. The
//! stock evaluator in the backend library adds the full instruction size a
//! second time when a literal trails the branch encoding, which is
//! impossible for SOPP but used to corrupt targets whenever a decoder
//! over-reported the size. This evaluator therefore computes from the
//! instruction start and the fixed SOPP width, never from `size`.

use super::inst::{Inst, InstOperand};

/// Evaluates the target of a direct branch.
///
/// Returns `Some(target)` if and only if `inst` is a direct branch with a
/// computable destination; `None` for indirect branches, non-branches and
/// malformed encodings.
pub fn evaluate_branch(inst: &Inst, pc: u64, _size: u64) -> Option<u64> {
    if !inst.opcode.is_direct_branch() {
        return None;
    }
    let simm = match inst.operands.first() {
        Some(InstOperand::Imm(v)) => *v,
        _ => return None,
    };
    // simm16 counts dwords from the end of the 4-byte SOPP word
    let base = pc.wrapping_add(4);
    Some(base.wrapping_add((simm as i64 as u64).wrapping_mul(4)))
}

/// The inverse: the simm16 dword delta that makes a branch at `pc` reach
/// `target`. `None` when the displacement does not fit.
pub fn branch_displacement(pc: u64, target: u64) -> Option<i16> {
    let delta = (target as i64) - (pc as i64 + 4);
    if delta % 4 != 0 {
        return None;
    }
    i16::try_from(delta / 4).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amdgpu::opcodes::{Opcode, Sop1Op, SoppOp};
    use crate::amdgpu::operand::PhysReg;

    fn branch(simm: i64) -> Inst {
        Inst::with_operands(Opcode::Sopp(SoppOp::S_BRANCH), [InstOperand::Imm(simm)])
    }

    #[test]
    fn forward_branch() {
        // s_branch 1 at 0x100 jumps over one dword
        assert_eq!(evaluate_branch(&branch(1), 0x100, 4), Some(0x108));
    }

    #[test]
    fn zero_displacement_targets_next() {
        assert_eq!(evaluate_branch(&branch(0), 0x100, 4), Some(0x104));
    }

    #[test]
    fn backward_branch() {
        assert_eq!(evaluate_branch(&branch(-2), 0x100, 4), Some(0xfc));
    }

    #[test]
    fn size_does_not_skew_target() {
        // a lying size must not affect the result (the defect the
        // corrected evaluator exists to remove)
        assert_eq!(
            evaluate_branch(&branch(1), 0x100, 8),
            evaluate_branch(&branch(1), 0x100, 4)
        );
    }

    #[test]
    fn indirect_branch_is_rejected() {
        let setpc = Inst::with_operands(
            Opcode::Sop1(Sop1Op::S_SETPC_B64),
            [
                InstOperand::Reg(PhysReg::Sgpr(30)),
                InstOperand::Reg(PhysReg::Sgpr(30)),
            ],
        );
        assert_eq!(evaluate_branch(&setpc, 0x100, 4), None);
    }

    #[test]
    fn displacement_round_trip() {
        let pc = 0x200u64;
        for simm in [-5i64, -1, 0, 1, 100] {
            let target = evaluate_branch(&branch(simm), pc, 4).unwrap();
            assert_eq!(branch_displacement(pc, target), Some(simm as i16));
        }
        assert_eq!(branch_displacement(0x100, 0x102), None);
    }
}

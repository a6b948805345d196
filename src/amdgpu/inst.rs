//! The machine-level instruction form produced by the disassembler and
//! consumed by the encoder.
//!
//! Operands here are fully concrete: physical registers and immediates.
//! Symbolisation (turning immediates into references to globals or basic
//! blocks) happens one layer up, when records are lifted into machine IR.

use super::opcodes::Opcode;
use super::operand::PhysReg;
use smallvec::SmallVec;
use std::fmt;

/// A machine-level operand.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InstOperand {
    Reg(PhysReg),
    Imm(i64),
    FImm(f32),
}

impl fmt::Display for InstOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstOperand::Reg(r) => write!(f, "{r}"),
            InstOperand::Imm(v) => {
                if *v < 0 || *v > 64 {
                    write!(f, "{v:#x}")
                } else {
                    write!(f, "{v}")
                }
            }
            InstOperand::FImm(v) => write!(f, "{v}"),
        }
    }
}

/// One decoded machine instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Inst {
    pub opcode: Opcode,
    pub operands: SmallVec<[InstOperand; 4]>,
}

impl Inst {
    pub fn new(opcode: Opcode) -> Self {
        Inst {
            opcode,
            operands: SmallVec::new(),
        }
    }

    pub fn with_operands(opcode: Opcode, operands: impl IntoIterator<Item = InstOperand>) -> Self {
        Inst {
            opcode,
            operands: operands.into_iter().collect(),
        }
    }

    pub fn push(&mut self, op: InstOperand) -> &mut Self {
        self.operands.push(op);
        self
    }

    /// The destination register, when the opcode defines one.
    pub fn dst_reg(&self) -> Option<PhysReg> {
        if self.opcode.def_count() == 0 {
            return None;
        }
        match self.operands.first() {
            Some(InstOperand::Reg(r)) => Some(*r),
            _ => None,
        }
    }
}

impl fmt::Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.opcode)?;
        for (i, op) in self.operands.iter().enumerate() {
            if i == 0 {
                write!(f, " {op}")?;
            } else {
                write!(f, ", {op}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amdgpu::opcodes::{Sop2Op, SoppOp};

    #[test]
    fn display_forms() {
        let inst = Inst::with_operands(
            Opcode::Sop2(Sop2Op::S_ADD_U32),
            [
                InstOperand::Reg(PhysReg::Sgpr(0)),
                InstOperand::Reg(PhysReg::Sgpr(0)),
                InstOperand::Imm(1),
            ],
        );
        assert_eq!(inst.to_string(), "s_add_u32 s0, s0, 1");
        assert_eq!(inst.dst_reg(), Some(PhysReg::Sgpr(0)));

        let endpgm = Inst::with_operands(Opcode::Sopp(SoppOp::S_ENDPGM), [InstOperand::Imm(0)]);
        assert_eq!(endpgm.dst_reg(), None);
    }
}

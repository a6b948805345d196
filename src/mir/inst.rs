//! Machine IR instructions.
//!
//! A [`MachInst`] is an [`crate::amdgpu::Opcode`] plus operands that may
//! still be symbolic: virtual registers, references to globals, or basic
//! blocks. Each instruction carries an id unique within its module; the
//! ids are stable across edits, which is what keeps the instruction↔record
//! maps of a lifted representation valid while hooks are queued.

use super::reg::Register;
use crate::amdgpu::{Opcode, PhysReg, RelocKind};
use smallvec::SmallVec;
use std::fmt;

/// Identifier of one machine instruction, unique within a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstId(pub u32);

/// Identifier of a machine basic block, unique within a function.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MbbId(pub u32);

impl fmt::Display for MbbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb.{}", self.0)
    }
}

/// A register operand with def/use polarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegOperand {
    pub reg: Register,
    pub is_def: bool,
    /// Implicit operands model side effects (SCC, VCC) rather than
    /// encoded fields.
    pub is_implicit: bool,
}

/// A symbolic reference to a global value.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalRef {
    pub name: String,
    /// Relocation kind to emit; `None` lets the printer pick from
    /// context.
    pub kind: Option<RelocKind>,
    pub addend: i64,
}

impl GlobalRef {
    pub fn new(name: impl Into<String>) -> Self {
        GlobalRef {
            name: name.into(),
            kind: None,
            addend: 0,
        }
    }

    pub fn with_reloc(name: impl Into<String>, kind: RelocKind, addend: i64) -> Self {
        GlobalRef {
            name: name.into(),
            kind: Some(kind),
            addend,
        }
    }
}

/// One machine operand.
#[derive(Debug, Clone, PartialEq)]
pub enum MachOperand {
    Reg(RegOperand),
    Imm(i64),
    FImm(f32),
    /// Reference to a global value by symbol name.
    Global(GlobalRef),
    Block(MbbId),
}

impl MachOperand {
    pub fn reg_use(reg: impl Into<Register>) -> Self {
        MachOperand::Reg(RegOperand {
            reg: reg.into(),
            is_def: false,
            is_implicit: false,
        })
    }

    pub fn reg_def(reg: impl Into<Register>) -> Self {
        MachOperand::Reg(RegOperand {
            reg: reg.into(),
            is_def: true,
            is_implicit: false,
        })
    }

    pub fn implicit_def(reg: impl Into<Register>) -> Self {
        MachOperand::Reg(RegOperand {
            reg: reg.into(),
            is_def: true,
            is_implicit: true,
        })
    }

    pub fn implicit_use(reg: impl Into<Register>) -> Self {
        MachOperand::Reg(RegOperand {
            reg: reg.into(),
            is_def: false,
            is_implicit: true,
        })
    }

    pub fn as_reg(&self) -> Option<&RegOperand> {
        match self {
            MachOperand::Reg(r) => Some(r),
            _ => None,
        }
    }
}

impl fmt::Display for MachOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MachOperand::Reg(r) => {
                if r.is_implicit {
                    write!(f, "implicit ")?;
                }
                if r.is_def && r.is_implicit {
                    write!(f, "def ")?;
                }
                write!(f, "{}", r.reg)
            }
            MachOperand::Imm(v) => write!(f, "{v}"),
            MachOperand::FImm(v) => write!(f, "{v}"),
            MachOperand::Global(g) => write!(f, "@{}", g.name),
            MachOperand::Block(b) => write!(f, "{b}"),
        }
    }
}

/// One machine IR instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct MachInst {
    pub id: InstId,
    pub opcode: Opcode,
    pub operands: SmallVec<[MachOperand; 4]>,
}

impl MachInst {
    pub fn new(id: InstId, opcode: Opcode) -> Self {
        MachInst {
            id,
            opcode,
            operands: SmallVec::new(),
        }
    }

    pub fn with(mut self, op: MachOperand) -> Self {
        self.operands.push(op);
        self
    }

    /// Registers written by this instruction, explicit and implicit.
    pub fn defs(&self) -> impl Iterator<Item = Register> + '_ {
        self.operands.iter().filter_map(|op| match op {
            MachOperand::Reg(r) if r.is_def => Some(r.reg),
            _ => None,
        })
    }

    /// Registers read by this instruction.
    pub fn uses(&self) -> impl Iterator<Item = Register> + '_ {
        self.operands.iter().filter_map(|op| match op {
            MachOperand::Reg(r) if !r.is_def => Some(r.reg),
            _ => None,
        })
    }

    /// Whether this instruction reads or writes `phys` explicitly.
    pub fn touches_phys(&self, phys: PhysReg) -> bool {
        self.operands.iter().any(|op| match op {
            MachOperand::Reg(r) => r.reg == Register::Phys(phys) && !r.is_implicit,
            _ => false,
        })
    }

    pub fn is_terminator(&self) -> bool {
        self.opcode.is_terminator()
    }

    /// The branch-target block operand, when present.
    pub fn branch_target(&self) -> Option<MbbId> {
        if !self.opcode.is_direct_branch() {
            return None;
        }
        self.operands.iter().find_map(|op| match op {
            MachOperand::Block(b) => Some(*b),
            _ => None,
        })
    }
}

impl fmt::Display for MachInst {
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
    use crate::amdgpu::{Sop2Op, SoppOp};
    use crate::mir::reg::VirtReg;

    #[test]
    fn defs_and_uses() {
        let inst = MachInst::new(InstId(1), Opcode::Sop2(Sop2Op::S_ADD_U32))
            .with(MachOperand::reg_def(PhysReg::Sgpr(0)))
            .with(MachOperand::reg_use(PhysReg::Sgpr(0)))
            .with(MachOperand::Imm(1))
            .with(MachOperand::implicit_def(PhysReg::Scc));
        let defs: Vec<_> = inst.defs().collect();
        assert_eq!(defs.len(), 2);
        assert!(defs.contains(&Register::Phys(PhysReg::Scc)));
        let uses: Vec<_> = inst.uses().collect();
        assert_eq!(uses, vec![Register::Phys(PhysReg::Sgpr(0))]);
        assert!(inst.touches_phys(PhysReg::Sgpr(0)));
        assert!(!inst.touches_phys(PhysReg::Scc)); // implicit
    }

    #[test]
    fn branch_target_extraction() {
        let br = MachInst::new(InstId(2), Opcode::Sopp(SoppOp::S_BRANCH))
            .with(MachOperand::Block(MbbId(3)));
        assert_eq!(br.branch_target(), Some(MbbId(3)));
        assert!(br.is_terminator());

        let copy = MachInst::new(
            InstId(3),
            Opcode::Pseudo(crate::amdgpu::PseudoOp::Copy),
        )
        .with(MachOperand::reg_def(VirtReg(0)))
        .with(MachOperand::reg_use(PhysReg::Sgpr(5)));
        assert_eq!(copy.branch_target(), None);
        assert!(!copy.is_terminator());
    }
}

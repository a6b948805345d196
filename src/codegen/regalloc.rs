//! Register allocation for injected payload functions.
//!
//! The payload must not disturb the kernel it is spliced into, so
//! allocation draws from a pool above the registers the original kernel
//! uses. Payload functions are small; every virtual register gets its own
//! physical register, and exhaustion of the pool is an error surfaced to
//! the caller rather than a spill (clobber spills around hook call sites
//! are the prologue/epilogue pass's job).

use super::session::CodeGenSession;
use crate::amdgpu::{Opcode, PhysReg, PseudoOp, RegBank, Sop1Op, Vop1Op};
use crate::error::{Error, Result};
use crate::mir::{MachFunction, MachInst, MachOperand, RegClass, Register, VirtReg};
use std::collections::{BTreeSet, HashMap};

/// The registers the payload may allocate from.
#[derive(Debug, Clone, Copy)]
pub struct RegPool {
    pub first_sgpr: u16,
    pub first_vgpr: u16,
    pub max_sgprs: u16,
    pub max_vgprs: u16,
}

impl RegPool {
    /// A pool starting above the original kernel's register usage.
    pub fn above(sgpr_count: u32, vgpr_count: u32) -> RegPool {
        RegPool {
            // s30/s31 carry the payload call return address
            first_sgpr: (sgpr_count as u16).max(32),
            first_vgpr: vgpr_count as u16,
            max_sgprs: 102,
            max_vgprs: 256,
        }
    }
}

/// What allocation did to one function.
#[derive(Debug, Default)]
pub struct AllocationResult {
    pub assignments: HashMap<VirtReg, PhysReg>,
    /// Every physical register the function writes, pairs expanded.
    pub clobbered: BTreeSet<PhysReg>,
    /// Highest SGPR / VGPR indices used, for descriptor updates.
    pub max_sgpr: u32,
    pub max_vgpr: u32,
}

/// Assigns physical registers, lowers COPY pseudos, and rewrites every
/// virtual operand.
pub fn allocate_function(
    session: &CodeGenSession<'_>,
    func: &mut MachFunction,
    pool: RegPool,
) -> Result<AllocationResult> {
    let mut result = AllocationResult::default();
    let mut next_sgpr = pool.first_sgpr;
    let mut next_vgpr = pool.first_vgpr;

    // distinct register per vreg, aligned to the class width
    let vreg_count = func.vreg_count() as u32;
    for i in 0..vreg_count {
        let v = VirtReg(i);
        let class = func.vreg_class(v);
        let dwords = class.dwords() as u16;
        let reg = match class.bank() {
            RegBank::Scalar => {
                let aligned = next_sgpr.div_ceil(dwords) * dwords;
                if aligned + dwords > pool.max_sgprs {
                    return Err(Error::codegen(format!(
                        "scalar register pool exhausted in `{}`",
                        func.name
                    )));
                }
                next_sgpr = aligned + dwords;
                PhysReg::Sgpr(aligned)
            }
            _ => {
                let aligned = next_vgpr.div_ceil(dwords) * dwords;
                if aligned + dwords > pool.max_vgprs {
                    return Err(Error::codegen(format!(
                        "vector register pool exhausted in `{}`",
                        func.name
                    )));
                }
                next_vgpr = aligned + dwords;
                PhysReg::Vgpr(aligned)
            }
        };
        session.record_register_allocated();
        result.assignments.insert(v, reg);
    }
    result.max_sgpr = next_sgpr.saturating_sub(1) as u32;
    result.max_vgpr = next_vgpr.saturating_sub(1) as u32;

    lower_copies(func, &result.assignments)?;
    rewrite_operands(func, &result.assignments)?;
    collect_clobbers(func, &mut result);
    Ok(result)
}

fn class_width(func: &MachFunction, reg: Register) -> u32 {
    match reg {
        Register::Virt(v) => func.vreg_class(v).dwords(),
        Register::Phys(PhysReg::ExecLo) => 2,
        Register::Phys(_) => 1,
    }
}

fn bank_of(func: &MachFunction, reg: Register) -> RegBank {
    match reg {
        Register::Virt(v) => func.vreg_class(v).bank(),
        Register::Phys(p) => p.bank(),
    }
}

/// Replaces COPY pseudos with real moves now that classes are known.
fn lower_copies(func: &mut MachFunction, assignments: &HashMap<VirtReg, PhysReg>) -> Result<()> {
    let _ = assignments;
    for bi in 0..func.blocks.len() {
        let mut i = 0;
        while i < func.blocks[bi].insts.len() {
            let inst = &func.blocks[bi].insts[i];
            if inst.opcode != Opcode::Pseudo(PseudoOp::Copy) {
                i += 1;
                continue;
            }
            let (dst, src) = match (&inst.operands[0], &inst.operands[1]) {
                (MachOperand::Reg(d), MachOperand::Reg(s)) => (d.reg, s.reg),
                _ => {
                    return Err(Error::codegen("malformed COPY operands".to_string()));
                }
            };
            let id = inst.id;
            let width = class_width(func, dst).max(class_width(func, src));
            let opcode = match (bank_of(func, dst), bank_of(func, src)) {
                (RegBank::Vector, RegBank::Vector) | (RegBank::Vector, _) => {
                    Opcode::Vop1(Vop1Op::V_MOV_B32)
                }
                (RegBank::Scalar | RegBank::Special, RegBank::Vector) => {
                    Opcode::Vop1(Vop1Op::V_READFIRSTLANE_B32)
                }
                _ => {
                    if width == 2 {
                        Opcode::Sop1(Sop1Op::S_MOV_B64)
                    } else {
                        Opcode::Sop1(Sop1Op::S_MOV_B32)
                    }
                }
            };
            let lowered = MachInst {
                id,
                opcode,
                operands: smallvec::smallvec![
                    MachOperand::reg_def(dst),
                    MachOperand::reg_use(src),
                ],
            };
            func.blocks[bi].insts[i] = lowered;
            i += 1;
        }
    }
    Ok(())
}

/// Rewrites every virtual register operand to its assignment.
fn rewrite_operands(
    func: &mut MachFunction,
    assignments: &HashMap<VirtReg, PhysReg>,
) -> Result<()> {
    for block in &mut func.blocks {
        for inst in &mut block.insts {
            for operand in &mut inst.operands {
                if let MachOperand::Reg(r) = operand {
                    if let Register::Virt(v) = r.reg {
                        let phys = assignments.get(&v).ok_or_else(|| {
                            Error::codegen(format!("virtual register {v} was never assigned"))
                        })?;
                        r.reg = Register::Phys(*phys);
                    }
                }
            }
        }
    }
    Ok(())
}

fn collect_clobbers(func: &MachFunction, result: &mut AllocationResult) {
    for inst in func.insts() {
        for def in inst.defs() {
            if let Register::Phys(p) = def {
                result.clobbered.insert(p);
                // wide moves clobber the odd half of the pair as well
                if matches!(
                    inst.opcode,
                    Opcode::Sop1(Sop1Op::S_MOV_B64)
                        | Opcode::Smem(crate::amdgpu::SmemOp::S_LOAD_DWORDX2)
                ) {
                    if let Some(hi) = p.pair_hi() {
                        result.clobbered.insert(hi);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::MirModule;
    use bumpalo::Bump;

    #[test]
    fn assigns_distinct_aligned_registers() {
        let arena = Bump::new();
        let session = CodeGenSession::new(&arena);
        let mut module = MirModule::new();
        let mut func = MachFunction::new("payload", false);
        let b = func.add_block();
        let a32 = func.create_vreg(RegClass::SGpr32);
        let a64 = func.create_vreg(RegClass::SGpr64);
        let v = func.create_vreg(RegClass::VGpr32);
        let mi = module
            .new_inst(Opcode::Pseudo(PseudoOp::Copy))
            .with(MachOperand::reg_def(a64))
            .with(MachOperand::reg_use(a64));
        func.block_mut(b).insts.push(mi);
        let _ = (a32, v);

        let result = allocate_function(&session, &mut func, RegPool::above(16, 4)).unwrap();
        let r32 = result.assignments[&VirtReg(0)];
        let r64 = result.assignments[&VirtReg(1)];
        let rv = result.assignments[&VirtReg(2)];
        assert!(matches!(r32, PhysReg::Sgpr(n) if n >= 32));
        match r64 {
            PhysReg::Sgpr(n) => assert_eq!(n % 2, 0, "64-bit scalar must be even-aligned"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(rv, PhysReg::Vgpr(n) if n >= 4));
        // the copy became a 64-bit scalar move
        let lowered = &func.blocks[0].insts[0];
        assert_eq!(lowered.opcode, Opcode::Sop1(Sop1Op::S_MOV_B64));
    }

    #[test]
    fn pool_exhaustion_is_an_error() {
        let arena = Bump::new();
        let session = CodeGenSession::new(&arena);
        let mut func = MachFunction::new("payload", false);
        for _ in 0..40 {
            func.create_vreg(RegClass::SGpr64);
        }
        let pool = RegPool {
            first_sgpr: 90,
            first_vgpr: 0,
            max_sgprs: 102,
            max_vgprs: 256,
        };
        assert!(allocate_function(&session, &mut func, pool).is_err());
    }
}

//! Instruction selection: hook IR → machine IR.
//!
//! Runs after the optimisation pipeline and IR-level intrinsic lowering,
//! so the input contains no calls — only straight computation, memory
//! access, control flow and indexed inline-asm placeholders. Every IR
//! value receives a virtual register; constraints recorded by the IR
//! lowering stage pick the bank.

use super::session::CodeGenSession;
use crate::amdgpu::{Opcode, PhysReg, PseudoOp, SmemOp, Sop1Op, Sop2Op, SopcOp, SoppOp};
use crate::error::{Error, Result};
use crate::intrinsics::IrLoweringInfo;
use crate::ir::{BinOp, IrFunction, IrInst, Type, ValueDef, ValueId};
use crate::mir::{MachFunction, MachOperand, MbbId, MirModule, RegClass, Register, VirtReg};
use std::collections::HashMap;

/// Selects `func` into a machine function appended to `module`.
pub fn select_function(
    session: &CodeGenSession<'_>,
    module: &mut MirModule,
    func: &IrFunction,
    lowering_infos: &HashMap<u32, IrLoweringInfo>,
) -> Result<()> {
    let mut mf = MachFunction::new(&func.name, false);
    let mut ctx = SelectionCtx {
        vregs: HashMap::new(),
        blocks: Vec::new(),
    };

    for _ in &func.blocks {
        ctx.blocks.push(mf.add_block());
    }

    if func.param_count != 0 {
        return Err(Error::codegen(format!(
            "payload function `{}` still has parameters after inlining",
            func.name
        )));
    }

    for (bi, block) in func.blocks.iter().enumerate() {
        let mbb = ctx.blocks[bi];
        for &vid in &block.insts {
            let ValueDef::Inst(inst) = &func.value(vid).def else {
                continue;
            };
            select_inst(session, module, &mut mf, &mut ctx, func, vid, inst, mbb, lowering_infos)?;
        }
    }

    // block edges from terminators
    for (bi, block) in func.blocks.iter().enumerate() {
        if let Some(&last) = block.insts.last() {
            if let ValueDef::Inst(inst) = &func.value(last).def {
                match inst {
                    IrInst::Br { target } => {
                        mf.add_edge(ctx.blocks[bi], ctx.blocks[target.0 as usize])
                    }
                    IrInst::CondBr {
                        then_target,
                        else_target,
                        ..
                    } => {
                        mf.add_edge(ctx.blocks[bi], ctx.blocks[then_target.0 as usize]);
                        mf.add_edge(ctx.blocks[bi], ctx.blocks[else_target.0 as usize]);
                    }
                    _ => {}
                }
            }
        }
    }

    session.record_payload_function();
    module.add_function(mf);
    Ok(())
}

struct SelectionCtx {
    vregs: HashMap<ValueId, VirtReg>,
    blocks: Vec<MbbId>,
}

impl SelectionCtx {
    fn vreg_for(
        &mut self,
        mf: &mut MachFunction,
        func: &IrFunction,
        value: ValueId,
        constraint: Option<&str>,
    ) -> Result<VirtReg> {
        if let Some(v) = self.vregs.get(&value) {
            return Ok(*v);
        }
        let ty = func.value_type(value).ok_or_else(|| {
            Error::codegen(format!(
                "value `%{}` has no type during selection",
                func.value(value).name
            ))
        })?;
        let class = match (constraint.unwrap_or("s"), ty) {
            ("v", Type::I64 | Type::Ptr) => RegClass::VGpr64,
            ("v", _) => RegClass::VGpr32,
            (_, Type::I64 | Type::Ptr) => RegClass::SGpr64,
            (_, _) => RegClass::SGpr32,
        };
        let v = mf.create_vreg(class);
        self.vregs.insert(value, v);
        Ok(v)
    }
}

#[allow(clippy::too_many_arguments)]
fn select_inst(
    session: &CodeGenSession<'_>,
    module: &mut MirModule,
    mf: &mut MachFunction,
    ctx: &mut SelectionCtx,
    func: &IrFunction,
    vid: ValueId,
    inst: &IrInst,
    mbb: MbbId,
    lowering_infos: &HashMap<u32, IrLoweringInfo>,
) -> Result<()> {
    let mut emit = |mf: &mut MachFunction, inst| {
        session.record_instruction_selected();
        mf.block_mut(mbb).insts.push(inst);
    };
    match inst {
        IrInst::IConst { ty, value } => {
            let dst = ctx.vreg_for(mf, func, vid, None)?;
            let opcode = if ty.dwords() == 2 {
                Opcode::Sop1(Sop1Op::S_MOV_B64)
            } else {
                Opcode::Sop1(Sop1Op::S_MOV_B32)
            };
            let mi = module
                .new_inst(opcode)
                .with(MachOperand::reg_def(dst))
                .with(MachOperand::Imm(*value));
            emit(mf, mi);
        }
        IrInst::Bin { op, ty, lhs, rhs } => {
            let opcode = bin_opcode(*op, *ty).ok_or_else(|| {
                Error::codegen(format!(
                    "unsupported {}-bit `{op:?}` in payload code",
                    ty.dwords() * 32
                ))
            })?;
            let dst = ctx.vreg_for(mf, func, vid, None)?;
            let l = ctx.vreg_for(mf, func, *lhs, None)?;
            let r = ctx.vreg_for(mf, func, *rhs, None)?;
            let mut mi = module
                .new_inst(opcode)
                .with(MachOperand::reg_def(dst))
                .with(MachOperand::reg_use(l))
                .with(MachOperand::reg_use(r));
            if opcode.defs_scc() {
                mi.operands.push(MachOperand::implicit_def(PhysReg::Scc));
            }
            emit(mf, mi);
        }
        IrInst::Load { ty, addr } => {
            let dst = ctx.vreg_for(mf, func, vid, None)?;
            let base = ctx.vreg_for(mf, func, *addr, None)?;
            let opcode = if ty.dwords() == 2 {
                Opcode::Smem(SmemOp::S_LOAD_DWORDX2)
            } else {
                Opcode::Smem(SmemOp::S_LOAD_DWORD)
            };
            let mi = module
                .new_inst(opcode)
                .with(MachOperand::reg_def(dst))
                .with(MachOperand::reg_use(base))
                .with(MachOperand::Imm(0));
            emit(mf, mi);
        }
        IrInst::Store { ty, addr, value } => {
            let base = ctx.vreg_for(mf, func, *addr, None)?;
            let data = ctx.vreg_for(mf, func, *value, None)?;
            let opcode = if ty.dwords() == 2 {
                Opcode::Smem(SmemOp::S_STORE_DWORDX2)
            } else {
                Opcode::Smem(SmemOp::S_STORE_DWORD)
            };
            let mi = module
                .new_inst(opcode)
                .with(MachOperand::reg_use(data))
                .with(MachOperand::reg_use(base))
                .with(MachOperand::Imm(0));
            emit(mf, mi);
        }
        IrInst::AddrOf { global } => {
            // materialised as a 64-bit move of the symbol's absolute
            // address; expanded into a lo/hi pair after allocation
            let dst = ctx.vreg_for(mf, func, vid, None)?;
            let mi = module
                .new_inst(Opcode::Sop1(Sop1Op::S_MOV_B64))
                .with(MachOperand::reg_def(dst))
                .with(MachOperand::Global(crate::mir::GlobalRef::new(
                    global.clone(),
                )));
            emit(mf, mi);
        }
        IrInst::Copy { src, .. } => {
            let dst = ctx.vreg_for(mf, func, vid, None)?;
            let s = ctx.vreg_for(mf, func, *src, None)?;
            let mi = module
                .new_inst(Opcode::Pseudo(PseudoOp::Copy))
                .with(MachOperand::reg_def(dst))
                .with(MachOperand::reg_use(s));
            emit(mf, mi);
        }
        IrInst::Call { callee, .. } => {
            return Err(Error::UnknownIntrinsic {
                name: callee.clone(),
                caller: func.name.clone(),
            });
        }
        IrInst::AsmPlaceholder { index, args, ty } => {
            let info = lowering_infos.get(index).ok_or_else(|| {
                Error::lowering(
                    format!("placeholder #{index}"),
                    "no lowering info recorded for this index",
                )
            })?;
            let mut mi = module
                .new_inst(Opcode::Pseudo(PseudoOp::InlineAsm))
                .with(MachOperand::Imm(*index as i64));
            if let Some(constraint) = &info.ret_constraint {
                let _ = ty;
                let dst = ctx.vreg_for(mf, func, vid, Some(constraint))?;
                mi.operands.push(MachOperand::reg_def(dst));
            }
            for (i, arg) in args.iter().enumerate() {
                let constraint = info
                    .arg_constraints
                    .get(i)
                    .map(String::as_str)
                    .unwrap_or("s");
                if constraint == "i" {
                    // immediate arguments were consumed at IR time
                    continue;
                }
                let v = ctx.vreg_for(mf, func, *arg, Some(constraint))?;
                mi.operands.push(MachOperand::reg_use(v));
            }
            emit(mf, mi);
        }
        IrInst::Br { target } => {
            let mi = module
                .new_inst(Opcode::Sopp(SoppOp::S_BRANCH))
                .with(MachOperand::Block(ctx.blocks[target.0 as usize]));
            emit(mf, mi);
        }
        IrInst::CondBr {
            cond,
            then_target,
            else_target,
        } => {
            let c = ctx.vreg_for(mf, func, *cond, None)?;
            let cmp = module
                .new_inst(Opcode::Sopc(SopcOp::S_CMP_LG_U32))
                .with(MachOperand::reg_use(c))
                .with(MachOperand::Imm(0))
                .with(MachOperand::implicit_def(PhysReg::Scc));
            emit(mf, cmp);
            let br_then = module
                .new_inst(Opcode::Sopp(SoppOp::S_CBRANCH_SCC1))
                .with(MachOperand::Block(ctx.blocks[then_target.0 as usize]));
            emit(mf, br_then);
            let br_else = module
                .new_inst(Opcode::Sopp(SoppOp::S_BRANCH))
                .with(MachOperand::Block(ctx.blocks[else_target.0 as usize]));
            emit(mf, br_else);
        }
        IrInst::Ret { .. } => {
            // payload functions return through the swap-pc link register
            let mi = module
                .new_inst(Opcode::Sop1(Sop1Op::S_SETPC_B64))
                .with(MachOperand::reg_use(PhysReg::Sgpr(30)))
                .with(MachOperand::reg_use(PhysReg::Sgpr(30)));
            emit(mf, mi);
        }
    }
    Ok(())
}

fn bin_opcode(op: BinOp, ty: Type) -> Option<Opcode> {
    let wide = ty.dwords() == 2;
    Some(match (op, wide) {
        (BinOp::Add, false) => Opcode::Sop2(Sop2Op::S_ADD_U32),
        (BinOp::Sub, false) => Opcode::Sop2(Sop2Op::S_SUB_U32),
        (BinOp::And, false) => Opcode::Sop2(Sop2Op::S_AND_B32),
        (BinOp::And, true) => Opcode::Sop2(Sop2Op::S_AND_B64),
        (BinOp::Or, false) => Opcode::Sop2(Sop2Op::S_OR_B32),
        (BinOp::Or, true) => Opcode::Sop2(Sop2Op::S_OR_B64),
        (BinOp::Xor, false) => Opcode::Sop2(Sop2Op::S_XOR_B32),
        (BinOp::Xor, true) => Opcode::Sop2(Sop2Op::S_XOR_B64),
        (BinOp::Shl, false) => Opcode::Sop2(Sop2Op::S_LSHL_B32),
        (BinOp::Shl, true) => Opcode::Sop2(Sop2Op::S_LSHL_B64),
        (BinOp::LShr, false) => Opcode::Sop2(Sop2Op::S_LSHR_B32),
        (BinOp::LShr, true) => Opcode::Sop2(Sop2Op::S_LSHR_B64),
        (BinOp::Add | BinOp::Sub, true) => return None,
    })
}

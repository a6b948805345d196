//! Injected-payload frame lowering.
//!
//! Replaces the backend's stock prologue/epilogue handling for
//! instrumented code. Runs after register allocation, on concrete
//! registers:
//!
//! - kernel entry captures the kernel arguments the payload needs into
//!   their reserved registers, and pushes the live set onto the
//!   state-value array (a lane-indexed VGPR save area);
//! - kernel exits restore symmetrically;
//! - every hook call site expands into the get-pc/add/swap-pc sequence,
//!   bracketed by SCC capture and spill/fill of the registers the payload
//!   clobbers but the surrounding code relies on;
//! - exec-mask writes inside payload code become the two-block
//!   compare-selected sequence that preserves SCC;
//! - 64-bit address moves of globals split into absolute lo/hi pairs.

use super::session::CodeGenSession;
use crate::amdgpu::{
    KernelCodeProperties, KernelDescriptor, Opcode, PhysReg, PseudoOp, RelocKind, SmemOp, Sop1Op,
    Sop2Op, SopcOp, SoppOp, Vop3Op,
};
use crate::error::{Error, Result};
use crate::intrinsics::{ArgStorage, KernelArgKind};
use crate::mir::{GlobalRef, MachFunction, MachInst, MachOperand, MirModule};
use std::collections::BTreeSet;

/// Registers reserved for frame lowering, outside every allocation pool.
#[derive(Debug, Clone, Copy)]
pub struct FrameRegs {
    /// Scratch SGPR holding the captured SCC value around hook calls.
    pub scc_tmp: PhysReg,
    /// The state-value-array VGPR.
    pub sva: PhysReg,
}

/// How many reserved scalar registers [`FrameRegs`] consumes above the
/// allocation pool.
pub const RESERVED_FRAME_SGPRS: u16 = 2;
/// Reserved vector registers (the state-value array).
pub const RESERVED_FRAME_VGPRS: u16 = 1;

/// Scratch bytes requested for the state-value array backing store.
pub const SVA_SCRATCH_BYTES: u32 = 64;

fn reg_def(reg: PhysReg) -> MachOperand {
    MachOperand::reg_def(reg)
}

fn reg_use(reg: PhysReg) -> MachOperand {
    MachOperand::reg_use(reg)
}

/// SGPR position of a kernel argument under the descriptor's user-SGPR
/// layout, when the argument is preloaded at all.
pub fn kernarg_sgpr_position(kd: &KernelDescriptor, kind: KernelArgKind) -> Option<u16> {
    use KernelCodeProperties as P;
    let props = kd.kernel_code_properties;
    let mut pos: u16 = 0;
    let mut take = |flag: P, width: u16| -> Option<u16> {
        if props.contains(flag) {
            let here = pos;
            pos += width;
            Some(here)
        } else {
            None
        }
    };
    let psb = take(P::ENABLE_SGPR_PRIVATE_SEGMENT_BUFFER, 4);
    let dispatch_ptr = take(P::ENABLE_SGPR_DISPATCH_PTR, 2);
    let queue_ptr = take(P::ENABLE_SGPR_QUEUE_PTR, 2);
    let kernarg = take(P::ENABLE_SGPR_KERNARG_SEGMENT_PTR, 2);
    let dispatch_id = take(P::ENABLE_SGPR_DISPATCH_ID, 2);
    let flat_scratch = take(P::ENABLE_SGPR_FLAT_SCRATCH_INIT, 2);
    let seg_size = take(P::ENABLE_SGPR_PRIVATE_SEGMENT_SIZE, 1);

    // system SGPRs follow the user set
    let system_base = kd.user_sgpr_count() as u16;
    let (wg_x, wg_y, wg_z) = kd.enable_sgpr_workgroup_id();
    let mut sys_pos = system_base;
    let mut sys_take = |enabled: bool| -> Option<u16> {
        if enabled {
            let here = sys_pos;
            sys_pos += 1;
            Some(here)
        } else {
            None
        }
    };
    let wg_id_x = sys_take(wg_x);
    let wg_id_y = sys_take(wg_y);
    let wg_id_z = sys_take(wg_z);

    match kind {
        KernelArgKind::PrivateSegmentBuffer => psb,
        KernelArgKind::DispatchPtr => dispatch_ptr,
        KernelArgKind::QueuePtr => queue_ptr,
        KernelArgKind::KernargSegmentPtr => kernarg,
        KernelArgKind::DispatchId => dispatch_id,
        KernelArgKind::FlatScratch => flat_scratch,
        KernelArgKind::WorkItemPrivateSegmentSize => seg_size,
        KernelArgKind::WorkgroupIdX => wg_id_x,
        KernelArgKind::WorkgroupIdY => wg_id_y,
        KernelArgKind::WorkgroupIdZ => wg_id_z,
        KernelArgKind::PrivateSegmentWaveByteOffset => {
            kd.enables_private_segment().then_some(sys_pos)
        }
        _ => None,
    }
}

/// Derives the preamble spec for every function of the instrumented
/// module.
pub fn analyze_preambles(
    module: &mut MirModule,
    kernel_name: &str,
    payload_names: &[String],
    kernarg_needs: &BTreeSet<KernelArgKind>,
) {
    let any_sva = payload_names.iter().any(|name| {
        module
            .function(name)
            .is_some_and(|f| f.frame.uses_state_value_array)
    });
    if let Some(kernel) = module.function_mut(kernel_name) {
        kernel.frame.needs_scratch_setup = any_sva || !kernarg_needs.is_empty();
        kernel.frame.uses_state_value_array = true;
        kernel.frame.extra_scratch_bytes = if any_sva { SVA_SCRATCH_BYTES } else { 0 };
    }
}

/// One kernel-argument capture: copy or load the value into its reserved
/// register at kernel entry.
fn capture_kernarg(
    module: &mut MirModule,
    kd: &KernelDescriptor,
    hidden_offset: Option<u32>,
    kind: KernelArgKind,
    dest: PhysReg,
    out: &mut Vec<MachInst>,
) -> Result<()> {
    let wide = kind.reg_class().dwords() >= 2;
    if let Some(pos) = kernarg_sgpr_position(kd, kind) {
        let opcode = if wide {
            Opcode::Sop1(Sop1Op::S_MOV_B64)
        } else {
            Opcode::Sop1(Sop1Op::S_MOV_B32)
        };
        out.push(
            module
                .new_inst(opcode)
                .with(reg_def(dest))
                .with(reg_use(PhysReg::Sgpr(pos))),
        );
        return Ok(());
    }
    // not preloaded; read it from the hidden kernarg area, which needs
    // the kernarg segment pointer to be preloaded
    match kind.storage() {
        ArgStorage::AlwaysSgpr => Err(Error::codegen(format!(
            "{kind:?} is not preloaded by this kernel's descriptor"
        ))),
        ArgStorage::EitherSgprOrHidden | ArgStorage::HiddenOnly => {
            let kernarg_pos = kernarg_sgpr_position(kd, KernelArgKind::KernargSegmentPtr)
                .ok_or_else(|| {
                    Error::codegen(format!(
                        "{kind:?} requires the kernarg segment pointer to be preloaded"
                    ))
                })?;
            let hidden = hidden_offset.ok_or_else(|| {
                Error::codegen(format!(
                    "{kind:?} needs the hidden-argument offset, but the kernel metadata \
                     carries no hidden arguments"
                ))
            })?;
            if kind == KernelArgKind::ImplicitArgPtr {
                // base + offset, on concrete register halves
                let lo = dest;
                let hi = dest.pair_hi().ok_or_else(|| {
                    Error::codegen("implicit-arg pointer needs a register pair".to_string())
                })?;
                out.push(
                    module
                        .new_inst(Opcode::Sop1(Sop1Op::S_MOV_B64))
                        .with(reg_def(dest))
                        .with(reg_use(PhysReg::Sgpr(kernarg_pos))),
                );
                out.push(
                    module
                        .new_inst(Opcode::Sop2(Sop2Op::S_ADD_U32))
                        .with(reg_def(lo))
                        .with(reg_use(lo))
                        .with(MachOperand::Imm(hidden as i64))
                        .with(MachOperand::implicit_def(PhysReg::Scc)),
                );
                out.push(
                    module
                        .new_inst(Opcode::Sop2(Sop2Op::S_ADDC_U32))
                        .with(reg_def(hi))
                        .with(reg_use(hi))
                        .with(MachOperand::Imm(0))
                        .with(MachOperand::implicit_def(PhysReg::Scc)),
                );
                return Ok(());
            }
            let opcode = if wide {
                Opcode::Smem(SmemOp::S_LOAD_DWORDX2)
            } else {
                Opcode::Smem(SmemOp::S_LOAD_DWORD)
            };
            out.push(
                module
                    .new_inst(opcode)
                    .with(reg_def(dest))
                    .with(reg_use(PhysReg::Sgpr(kernarg_pos)))
                    .with(MachOperand::Imm(hidden as i64)),
            );
            Ok(())
        }
    }
}

/// Emits the kernel prologue and epilogues.
///
/// Entry: kernel-argument captures, then the state-value-array push of
/// the live set. Every `s_endpgm` gets the symmetric restore.
pub fn run_kernel_frame(
    session: &CodeGenSession<'_>,
    module: &mut MirModule,
    kernel_name: &str,
    frame: FrameRegs,
    kernarg_captures: &[(KernelArgKind, PhysReg)],
    saved_set: &[PhysReg],
    hidden_offset: Option<u32>,
) -> Result<()> {
    let mut kernel = take_function(module, kernel_name)?;
    let kd = kernel.descriptor.clone().ok_or_else(|| {
        Error::codegen(format!("kernel `{kernel_name}` has no descriptor"))
    })?;
    // with no hidden arguments declared, the hidden area begins right
    // after the explicit kernarg segment
    let hidden_offset = hidden_offset.or(Some(kd.kernarg_size));

    // prologue
    let mut prologue = Vec::new();
    for (i, reg) in saved_set.iter().enumerate() {
        session.record_spill();
        prologue.push(
            module
                .new_inst(Opcode::Vop3(Vop3Op::V_WRITELANE_B32))
                .with(reg_def(frame.sva))
                .with(reg_use(*reg))
                .with(MachOperand::Imm(i as i64)),
        );
    }
    for (kind, dest) in kernarg_captures {
        capture_kernarg(module, &kd, hidden_offset, *kind, *dest, &mut prologue)?;
    }
    if !kernel.blocks.is_empty() {
        let entry = &mut kernel.blocks[0].insts;
        for inst in prologue.into_iter().rev() {
            entry.insert(0, inst);
        }
    }

    // epilogues: restore before every endpgm
    for block in &mut kernel.blocks {
        let Some(pos) = block
            .insts
            .iter()
            .position(|i| i.opcode == Opcode::Sopp(SoppOp::S_ENDPGM))
        else {
            continue;
        };
        let mut restores = Vec::new();
        for (i, reg) in saved_set.iter().enumerate() {
            restores.push(
                module
                    .new_inst(Opcode::Vop3(Vop3Op::V_READLANE_B32))
                    .with(reg_def(*reg))
                    .with(reg_use(frame.sva))
                    .with(MachOperand::Imm(i as i64)),
            );
        }
        for (n, inst) in restores.into_iter().enumerate() {
            block.insts.insert(pos + n, inst);
        }
    }

    put_function(module, kernel);
    Ok(())
}

/// Expands every `HOOK_CALL` pseudo in `func_name` into the spill /
/// SCC-capture / get-pc call sequence.
pub fn expand_hook_calls(
    session: &CodeGenSession<'_>,
    module: &mut MirModule,
    func_name: &str,
    frame: FrameRegs,
    call_saved: &[PhysReg],
    lane_base: i64,
) -> Result<()> {
    let mut func = take_function(module, func_name)?;
    for bi in 0..func.blocks.len() {
        loop {
            let Some(pos) = func.blocks[bi]
                .insts
                .iter()
                .position(|i| i.opcode == Opcode::Pseudo(PseudoOp::HookCall))
            else {
                break;
            };
            let target = match func.blocks[bi].insts[pos]
                .operands
                .iter()
                .find_map(|op| match op {
                    MachOperand::Global(g) => Some(g.name.clone()),
                    _ => None,
                }) {
                Some(name) => name,
                None => {
                    put_function(module, func);
                    return Err(Error::codegen(
                        "hook call pseudo lost its target".to_string(),
                    ));
                }
            };

            let mut seq = Vec::new();
            // spill the registers the payload clobbers but the original
            // code may rely on, plus the call link pair. Lanes below
            // `lane_base` belong to the kernel prologue.
            let mut lane = lane_base;
            for reg in call_saved {
                session.record_spill();
                seq.push(
                    module
                        .new_inst(Opcode::Vop3(Vop3Op::V_WRITELANE_B32))
                        .with(reg_def(frame.sva))
                        .with(reg_use(*reg))
                        .with(MachOperand::Imm(lane)),
                );
                lane += 1;
            }
            // capture SCC without clobbering it
            seq.push(
                module
                    .new_inst(Opcode::Sop2(Sop2Op::S_CSELECT_B32))
                    .with(reg_def(frame.scc_tmp))
                    .with(MachOperand::Imm(1))
                    .with(MachOperand::Imm(0))
                    .with(MachOperand::implicit_use(PhysReg::Scc)),
            );
            // get-pc / add / swap-pc call. The addends account for the
            // offset of each fixup from the get-pc result.
            seq.push(
                module
                    .new_inst(Opcode::Sop1(Sop1Op::S_GETPC_B64))
                    .with(reg_def(PhysReg::Sgpr(30)))
                    .with(reg_use(PhysReg::Sgpr(30))),
            );
            seq.push(
                module
                    .new_inst(Opcode::Sop2(Sop2Op::S_ADD_U32))
                    .with(reg_def(PhysReg::Sgpr(30)))
                    .with(reg_use(PhysReg::Sgpr(30)))
                    .with(MachOperand::Global(GlobalRef::with_reloc(
                        target.clone(),
                        RelocKind::Rel32Lo,
                        4,
                    )))
                    .with(MachOperand::implicit_def(PhysReg::Scc)),
            );
            seq.push(
                module
                    .new_inst(Opcode::Sop2(Sop2Op::S_ADDC_U32))
                    .with(reg_def(PhysReg::Sgpr(31)))
                    .with(reg_use(PhysReg::Sgpr(31)))
                    .with(MachOperand::Global(GlobalRef::with_reloc(
                        target.clone(),
                        RelocKind::Rel32Hi,
                        12,
                    )))
                    .with(MachOperand::implicit_def(PhysReg::Scc)),
            );
            seq.push(
                module
                    .new_inst(Opcode::Sop1(Sop1Op::S_SWAPPC_B64))
                    .with(reg_def(PhysReg::Sgpr(30)))
                    .with(reg_use(PhysReg::Sgpr(30))),
            );
            // restore SCC from the captured value
            seq.push(
                module
                    .new_inst(Opcode::Sopc(SopcOp::S_CMP_LG_U32))
                    .with(reg_use(frame.scc_tmp))
                    .with(MachOperand::Imm(0))
                    .with(MachOperand::implicit_def(PhysReg::Scc)),
            );
            // fill
            for reg in call_saved.iter().rev() {
                lane -= 1;
                seq.push(
                    module
                        .new_inst(Opcode::Vop3(Vop3Op::V_READLANE_B32))
                        .with(reg_def(*reg))
                        .with(reg_use(frame.sva))
                        .with(MachOperand::Imm(lane)),
                );
            }

            func.blocks[bi].insts.splice(pos..pos + 1, seq);
        }
    }
    put_function(module, func);
    Ok(())
}

/// Expands `s_mov_b64 dst, @global` into the absolute lo/hi pair.
pub fn expand_addr_moves(module: &mut MirModule, func_name: &str) -> Result<()> {
    let mut func = take_function(module, func_name)?;
    for bi in 0..func.blocks.len() {
        loop {
            let Some((pos, dst, global)) =
                func.blocks[bi].insts.iter().enumerate().find_map(|(i, inst)| {
                    if inst.opcode != Opcode::Sop1(Sop1Op::S_MOV_B64) {
                        return None;
                    }
                    let MachOperand::Global(g) = inst.operands.get(1)? else {
                        return None;
                    };
                    let dst = inst.operands.first()?.as_reg()?.reg.as_phys()?;
                    Some((i, dst, g.clone()))
                })
            else {
                break;
            };
            let hi = dst.pair_hi().ok_or_else(|| {
                Error::codegen(format!("address move writes unpaired register {dst}"))
            })?;
            let seq = vec![
                module
                    .new_inst(Opcode::Sop1(Sop1Op::S_MOV_B32))
                    .with(reg_def(dst))
                    .with(MachOperand::Global(GlobalRef::with_reloc(
                        global.name.clone(),
                        RelocKind::Abs32Lo,
                        global.addend,
                    ))),
                module
                    .new_inst(Opcode::Sop1(Sop1Op::S_MOV_B32))
                    .with(reg_def(hi))
                    .with(MachOperand::Global(GlobalRef::with_reloc(
                        global.name.clone(),
                        RelocKind::Abs32Hi,
                        global.addend,
                    ))),
            ];
            func.blocks[bi].insts.splice(pos..pos + 1, seq);
        }
    }
    put_function(module, func);
    Ok(())
}

/// Wraps every exec-mask write in the SCC-preserving two-block protocol:
/// the write is duplicated into two alternative blocks selected by the
/// current SCC, each re-establishing SCC with a compare before both
/// converge.
pub fn protect_exec_writes(module: &mut MirModule, func_name: &str) -> Result<()> {
    let mut func = take_function(module, func_name)?;
    let mut done: std::collections::HashSet<crate::mir::InstId> = std::collections::HashSet::new();
    let mut bi = 0;
    while bi < func.blocks.len() {
        let Some(pos) = func.blocks[bi].insts.iter().position(|inst| {
            !done.contains(&inst.id)
                && inst.opcode == Opcode::Sop1(Sop1Op::S_MOV_B64)
                && inst
                    .operands
                    .first()
                    .and_then(|op| op.as_reg())
                    .is_some_and(|r| r.is_def && r.reg.as_phys() == Some(PhysReg::ExecLo))
        }) else {
            bi += 1;
            continue;
        };

        let write = func.blocks[bi].insts[pos].clone();
        let tail: Vec<MachInst> = func.blocks[bi].insts.split_off(pos + 1);
        func.blocks[bi].insts.pop();

        let scc_clr = func.add_block();
        let scc_set = func.add_block();
        let cont = func.add_block();

        let branch = module
            .new_inst(Opcode::Sopp(SoppOp::S_CBRANCH_SCC1))
            .with(MachOperand::Block(scc_set));
        func.blocks[bi].insts.push(branch);

        let mut clr_write = write.clone();
        clr_write.id = module.new_inst(write.opcode).id;
        done.insert(clr_write.id);
        func.block_mut(scc_clr).insts.push(clr_write);
        let clr_cmp = module
            .new_inst(Opcode::Sopc(SopcOp::S_CMP_EQ_U32))
            .with(MachOperand::Imm(0))
            .with(MachOperand::Imm(1))
            .with(MachOperand::implicit_def(PhysReg::Scc));
        func.block_mut(scc_clr).insts.push(clr_cmp);
        let clr_br = module
            .new_inst(Opcode::Sopp(SoppOp::S_BRANCH))
            .with(MachOperand::Block(cont));
        func.block_mut(scc_clr).insts.push(clr_br);

        let mut set_write = write.clone();
        set_write.id = module.new_inst(write.opcode).id;
        done.insert(set_write.id);
        func.block_mut(scc_set).insts.push(set_write);
        let set_cmp = module
            .new_inst(Opcode::Sopc(SopcOp::S_CMP_EQ_U32))
            .with(MachOperand::Imm(0))
            .with(MachOperand::Imm(0))
            .with(MachOperand::implicit_def(PhysReg::Scc));
        func.block_mut(scc_set).insts.push(set_cmp);
        let set_br = module
            .new_inst(Opcode::Sopp(SoppOp::S_BRANCH))
            .with(MachOperand::Block(cont));
        func.block_mut(scc_set).insts.push(set_br);

        func.block_mut(cont).insts = tail;

        func.add_edge(func.blocks[bi].id, scc_clr);
        func.add_edge(func.blocks[bi].id, scc_set);
        func.add_edge(scc_clr, cont);
        func.add_edge(scc_set, cont);

        bi += 1;
    }
    put_function(module, func);
    Ok(())
}

fn take_function(module: &mut MirModule, name: &str) -> Result<MachFunction> {
    let index = module
        .functions
        .iter()
        .position(|f| f.name == name)
        .ok_or_else(|| Error::codegen(format!("no function `{name}` in the module")))?;
    Ok(std::mem::replace(
        &mut module.functions[index],
        MachFunction::new(name, false),
    ))
}

fn put_function(module: &mut MirModule, func: MachFunction) {
    if let Some(slot) = module.functions.iter_mut().find(|f| f.name == func.name) {
        *slot = func;
    } else {
        module.functions.push(func);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor_with(props: KernelCodeProperties, user_sgprs: u32) -> KernelDescriptor {
        let mut kd = KernelDescriptor {
            kernel_code_properties: props,
            ..Default::default()
        };
        kd.set_user_sgpr_count(user_sgprs);
        kd.compute_pgm_rsrc2 |= 1 << 7; // workgroup id x
        kd
    }

    #[test]
    fn user_sgpr_layout() {
        let kd = descriptor_with(
            KernelCodeProperties::ENABLE_SGPR_PRIVATE_SEGMENT_BUFFER
                | KernelCodeProperties::ENABLE_SGPR_KERNARG_SEGMENT_PTR
                | KernelCodeProperties::ENABLE_SGPR_DISPATCH_ID,
            8,
        );
        assert_eq!(
            kernarg_sgpr_position(&kd, KernelArgKind::PrivateSegmentBuffer),
            Some(0)
        );
        assert_eq!(
            kernarg_sgpr_position(&kd, KernelArgKind::KernargSegmentPtr),
            Some(4)
        );
        assert_eq!(
            kernarg_sgpr_position(&kd, KernelArgKind::DispatchId),
            Some(6)
        );
        // not enabled
        assert_eq!(kernarg_sgpr_position(&kd, KernelArgKind::QueuePtr), None);
        // first system SGPR
        assert_eq!(
            kernarg_sgpr_position(&kd, KernelArgKind::WorkgroupIdX),
            Some(8)
        );
    }
}

//! The code generator.
//!
//! Turns a lifted representation plus a mutator into an instrumented
//! relocatable. The pipeline: clone, run the mutator, materialise queued
//! hooks as IR, optimise the injected code, lower intrinsics in two
//! stages, select instructions, virtualise physical-register access,
//! analyse preambles, allocate registers, lower the injected frames, and
//! print.

pub mod frame;
pub mod isel;
pub mod printer;
pub mod regalloc;
pub mod session;
pub mod virtualize;

pub use printer::FileType;
pub use session::{CodeGenSession, CodeGenStats};

use crate::amdgpu::{Opcode, PhysReg, PseudoOp};
use crate::error::{Error, Result};
use crate::hsa::cache::CodeObjectCache;
use crate::hsa::symbol::KernelInfo;
use crate::im::InstrumentationModule;
use crate::intrinsics::{
    registry_key, AsmFlag, IntrinsicRegistry, IrLoweringInfo, KernelArgKind, MirBuilder,
};
use crate::ir::{self, IrFunction, IrInst, IrModule, Type, ValueDef, ValueId};
use crate::lifter::{CodeLifter, LiftedRepresentation};
use crate::mir::{GlobalRef, MachOperand, MirModule, Register, VirtReg};
use crate::task::{HookArg, HookInvocation, InstrumentationTask};
use bumpalo::Bump;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Name prefix of synthesised payload wrapper functions.
const INJECTED_PREFIX: &str = "__wavetap_injected_";

/// Process-wide code generator.
pub struct CodeGenerator {
    cache: Arc<CodeObjectCache>,
    lifter: Arc<CodeLifter>,
    im: Arc<InstrumentationModule>,
    intrinsics: Arc<IntrinsicRegistry>,
}

impl CodeGenerator {
    pub fn new(
        cache: Arc<CodeObjectCache>,
        lifter: Arc<CodeLifter>,
        im: Arc<InstrumentationModule>,
        intrinsics: Arc<IntrinsicRegistry>,
    ) -> Self {
        CodeGenerator {
            cache,
            lifter,
            im,
            intrinsics,
        }
    }

    /// The intrinsic registry, for tools registering their own entries.
    pub fn intrinsics(&self) -> &IntrinsicRegistry {
        &self.intrinsics
    }

    /// Clones `lr`, applies `mutator`, materialises its hook insertions,
    /// and runs the codegen pipeline over the injected code. The cached
    /// original is never touched.
    pub fn instrument<F>(
        &self,
        lr: &LiftedRepresentation,
        mutator: F,
    ) -> Result<LiftedRepresentation>
    where
        F: FnOnce(&mut InstrumentationTask, &mut LiftedRepresentation) -> Result<()>,
    {
        let arena = Bump::new();
        let session = CodeGenSession::new(&arena);

        let mut clone = self.lifter.clone_representation(lr)?;
        let mut task = InstrumentationTask::new(&clone, Arc::clone(&self.im));
        mutator(&mut task, &mut clone)?;
        let queue = task.take_queue();
        if queue.is_empty() {
            log::debug!("mutator queued no hooks; returning the edited clone");
            return Ok(clone);
        }

        let agent = self.cache.entry(clone.lco)?.agent;
        let payload = self.im.read_payload(agent)?;

        let kernel_info: KernelInfo = clone
            .kernel
            .as_kernel()
            .ok_or_else(|| Error::codegen("representation has no kernel".to_string()))?
            .clone();
        let kernel_name = clone.kernel.name.clone();

        // step 3: materialise hook calls
        let mut wrappers: Vec<String> = Vec::new();
        for (i, (target_mi, invocations)) in queue.iter().enumerate() {
            let wrapper = format!("{INJECTED_PREFIX}{i}");
            session.intern_str(&wrapper);
            build_wrapper(&mut clone.ir, &payload, &wrapper, invocations)?;
            for _ in invocations {
                session.record_hook_materialized();
            }

            let pseudo = clone
                .mir
                .new_inst(Opcode::Pseudo(PseudoOp::HookCall))
                .with(MachOperand::Global(GlobalRef::new(wrapper.clone())));
            let inserted = clone
                .mir
                .functions
                .iter_mut()
                .any(|f| f.insert_before(*target_mi, pseudo.clone()));
            if !inserted {
                return Err(Error::codegen(format!(
                    "hook target {target_mi:?} vanished from the clone"
                )));
            }
            wrappers.push(wrapper);
        }

        // step 4: IR optimisation over the injected code
        for wrapper in &wrappers {
            ir::opt::optimize_function(&mut clone.ir, wrapper)?;
        }

        // step 5: IR-level intrinsic lowering
        let mut infos: HashMap<u32, IrLoweringInfo> = HashMap::new();
        let mut next_index = 0u32;
        for wrapper in &wrappers {
            self.lower_intrinsics_ir(&mut clone, wrapper, &mut infos, &mut next_index, &session)?;
        }

        // step 6: instruction selection
        for wrapper in &wrappers {
            let func = clone
                .ir
                .function(wrapper)
                .cloned()
                .ok_or_else(|| Error::codegen(format!("wrapper `{wrapper}` vanished")))?;
            isel::select_function(&session, &mut clone.mir, &func, &infos)?;
        }

        // step 7: MIR-level intrinsic lowering
        let mut phys_maps: HashMap<String, BTreeMap<PhysReg, VirtReg>> = HashMap::new();
        let mut karg_maps: HashMap<String, BTreeMap<KernelArgKind, VirtReg>> = HashMap::new();
        for wrapper in &wrappers {
            let mut phys = BTreeMap::new();
            let mut kargs = BTreeMap::new();
            self.lower_intrinsics_mir(
                &mut clone.mir,
                wrapper,
                &infos,
                &kernel_info,
                &mut phys,
                &mut kargs,
                &session,
            )?;
            phys_maps.insert(wrapper.clone(), phys);
            karg_maps.insert(wrapper.clone(), kargs);
        }

        // reserved register area above the kernel's usage
        let kd = &kernel_info.descriptor;
        let frame_sgpr_base = (kd.sgpr_count().max(32) as u16).div_ceil(2) * 2;
        let sva_vgpr = kd.vgpr_count() as u16;
        let frame_regs = frame::FrameRegs {
            scc_tmp: PhysReg::Sgpr(frame_sgpr_base),
            sva: PhysReg::Vgpr(sva_vgpr),
        };

        // dedicated registers for captured kernel arguments
        let mut kernarg_needs: BTreeSet<KernelArgKind> = BTreeSet::new();
        for info in infos.values() {
            kernarg_needs.extend(info.accessed_kernel_args.iter().copied());
        }
        for map in karg_maps.values() {
            kernarg_needs.extend(map.keys().copied());
        }
        let mut next_karg_sgpr = frame_sgpr_base + frame::RESERVED_FRAME_SGPRS;
        let mut kernarg_alloc: BTreeMap<KernelArgKind, PhysReg> = BTreeMap::new();
        for kind in &kernarg_needs {
            let dwords = kind.reg_class().dwords() as u16;
            let aligned = next_karg_sgpr.div_ceil(dwords) * dwords;
            if aligned + dwords > 102 {
                return Err(Error::codegen(
                    "kernel-argument capture area exhausted".to_string(),
                ));
            }
            kernarg_alloc.insert(*kind, PhysReg::Sgpr(aligned));
            next_karg_sgpr = aligned + dwords;
        }
        // wire wrapper kernel-argument vregs to their dedicated registers
        for wrapper in &wrappers {
            let map = &karg_maps[wrapper];
            if map.is_empty() {
                continue;
            }
            let func = clone
                .mir
                .function_mut(wrapper)
                .ok_or_else(|| Error::codegen(format!("wrapper `{wrapper}` vanished")))?;
            for block in &mut func.blocks {
                for inst in &mut block.insts {
                    for operand in &mut inst.operands {
                        if let MachOperand::Reg(r) = operand {
                            if let Register::Virt(v) = r.reg {
                                if let Some((kind, _)) =
                                    map.iter().find(|(_, vreg)| **vreg == v)
                                {
                                    r.reg = Register::Phys(kernarg_alloc[kind]);
                                }
                            }
                        }
                    }
                }
            }
        }

        // step 8: physical-register virtualisation
        for wrapper in &wrappers {
            let mut func = take_function(&mut clone.mir, wrapper)?;
            let map = phys_maps.get_mut(wrapper).unwrap();
            // registers at or above the reserved area are
            // instrumentation-owned; leave them physical
            map.retain(|p, _| !is_reserved(*p, frame_sgpr_base, sva_vgpr));
            let outcome = virtualize::virtualize_function(&mut clone.mir, &mut func, map, &|p| {
                is_reserved(p, frame_sgpr_base, sva_vgpr)
            });
            strip_self_copies(&mut func);
            put_function(&mut clone.mir, func);
            outcome?;
        }

        // step 9: preamble analysis
        frame::analyze_preambles(&mut clone.mir, &kernel_name, &wrappers, &kernarg_needs);

        // step 10: register allocation over the payload functions
        let pool = regalloc::RegPool {
            first_sgpr: next_karg_sgpr,
            first_vgpr: sva_vgpr + frame::RESERVED_FRAME_VGPRS,
            max_sgprs: 102,
            max_vgprs: 256,
        };
        let mut max_sgpr_used = next_karg_sgpr.saturating_sub(1) as u32;
        let mut max_vgpr_used = sva_vgpr as u32;
        let mut clobbered: BTreeSet<PhysReg> = BTreeSet::new();
        for wrapper in &wrappers {
            let mut func = take_function(&mut clone.mir, wrapper)?;
            let result = regalloc::allocate_function(&session, &mut func, pool);
            put_function(&mut clone.mir, func);
            let result = result?;
            max_sgpr_used = max_sgpr_used.max(result.max_sgpr);
            max_vgpr_used = max_vgpr_used.max(result.max_vgpr);
            clobbered.extend(result.clobbered.iter().copied());
        }

        // step 11: frame lowering
        for wrapper in &wrappers {
            frame::expand_addr_moves(&mut clone.mir, wrapper)?;
            frame::protect_exec_writes(&mut clone.mir, wrapper)?;
        }
        let kernarg_captures: Vec<(KernelArgKind, PhysReg)> =
            kernarg_alloc.iter().map(|(k, r)| (*k, *r)).collect();
        // the live set saved across the payload: the call link pair and
        // VCC, plus anything the payload clobbers inside the kernel's
        // own register range
        let mut saved: Vec<PhysReg> = vec![
            PhysReg::Sgpr(30),
            PhysReg::Sgpr(31),
            PhysReg::VccLo,
            PhysReg::VccHi,
        ];
        for reg in &clobbered {
            if let PhysReg::Sgpr(n) = reg {
                if (*n as u32) < kd.sgpr_count() && !saved.contains(reg) {
                    saved.push(*reg);
                }
            }
        }
        let hidden_offset = kernel_info.metadata.hidden_args_offset();
        frame::run_kernel_frame(
            &session,
            &mut clone.mir,
            &kernel_name,
            frame_regs,
            &kernarg_captures,
            &saved,
            hidden_offset,
        )?;
        frame::expand_hook_calls(
            &session,
            &mut clone.mir,
            &kernel_name,
            frame_regs,
            &saved,
            saved.len() as i64,
        )?;

        // the printed descriptor reflects the widened register usage and
        // the extra scratch
        let extra_scratch = clone
            .mir
            .function(&kernel_name)
            .map(|f| f.frame.extra_scratch_bytes)
            .unwrap_or(0);
        if let Some(kernel_func) = clone.mir.function_mut(&kernel_name) {
            if let Some(kd) = &mut kernel_func.descriptor {
                kd.set_sgpr_count(max_sgpr_used + 2);
                kd.set_vgpr_count(max_vgpr_used + 1);
                kd.private_segment_fixed_size += extra_scratch;
            }
        }

        log::debug!("instrumented `{kernel_name}`: {}", session.stats());
        Ok(clone)
    }

    /// Prints a lifted representation.
    pub fn print(&self, lr: &LiftedRepresentation, file_type: FileType) -> Result<Vec<u8>> {
        let _guard = lr.lock();
        printer::print(lr, file_type)
    }

    /// Step 5: replace intrinsic calls with indexed placeholders.
    fn lower_intrinsics_ir(
        &self,
        clone: &mut LiftedRepresentation,
        wrapper: &str,
        infos: &mut HashMap<u32, IrLoweringInfo>,
        next_index: &mut u32,
        session: &CodeGenSession<'_>,
    ) -> Result<()> {
        // collect the remaining call sites first
        let call_sites: Vec<(ValueId, String)> = {
            let func = clone
                .ir
                .function(wrapper)
                .ok_or_else(|| Error::codegen(format!("wrapper `{wrapper}` vanished")))?;
            func.values
                .iter()
                .enumerate()
                .filter_map(|(i, v)| match &v.def {
                    ValueDef::Inst(IrInst::Call { callee, .. }) => {
                        Some((ValueId(i as u32), callee.clone()))
                    }
                    _ => None,
                })
                .collect()
        };

        for (vid, callee) in call_sites {
            let key = registry_key(&callee);
            let processor =
                self.intrinsics
                    .get(&key)
                    .ok_or_else(|| Error::UnknownIntrinsic {
                        name: key.clone(),
                        caller: wrapper.to_string(),
                    })?;
            let snapshot = clone.ir.function(wrapper).unwrap().clone();
            let mut info = (processor.ir_processor)(&snapshot, vid, &clone.target_machine)?;
            info.intrinsic = key;
            info.placeholder_index = *next_index;

            let func = clone.ir.function_mut(wrapper).unwrap();
            let (args, ty) = match &func.values[vid.0 as usize].def {
                ValueDef::Inst(IrInst::Call { args, ty, .. }) => (args.clone(), *ty),
                _ => unreachable!("call sites collected above"),
            };
            func.values[vid.0 as usize].def = ValueDef::Inst(IrInst::AsmPlaceholder {
                index: *next_index,
                args,
                ty: ty.or_else(|| info.ret_constraint.as_ref().map(|_| Type::I32)),
            });
            infos.insert(*next_index, info);
            *next_index += 1;
            session.record_intrinsic_lowered();
        }
        Ok(())
    }

    /// Step 7: replace placeholders with real machine IR.
    #[allow(clippy::too_many_arguments)]
    fn lower_intrinsics_mir(
        &self,
        module: &mut MirModule,
        wrapper: &str,
        infos: &HashMap<u32, IrLoweringInfo>,
        kernel_info: &KernelInfo,
        phys_map: &mut BTreeMap<PhysReg, VirtReg>,
        karg_map: &mut BTreeMap<KernelArgKind, VirtReg>,
        session: &CodeGenSession<'_>,
    ) -> Result<()> {
        let mut func = take_function(module, wrapper)?;
        let mut outcome = Ok(());
        loop {
            let mut site = None;
            'scan: for (bi, block) in func.blocks.iter().enumerate() {
                for (pos, inst) in block.insts.iter().enumerate() {
                    if inst.opcode == Opcode::Pseudo(PseudoOp::InlineAsm) {
                        site = Some((bi, pos));
                        break 'scan;
                    }
                }
            }
            let Some((bi, pos)) = site else {
                break;
            };

            let inst = func.blocks[bi].insts[pos].clone();
            let index = match inst.operands.first() {
                Some(MachOperand::Imm(v)) => *v as u32,
                _ => {
                    outcome = Err(Error::lowering(
                        "<placeholder>",
                        "inline-asm placeholder lost its index",
                    ));
                    break;
                }
            };
            let Some(info) = infos.get(&index) else {
                // an intrinsic modified its own placeholder
                outcome = Err(Error::lowering(
                    format!("placeholder #{index}"),
                    "bundle cannot be recovered after selection",
                ));
                break;
            };
            let regs: Vec<(AsmFlag, Register)> = inst.operands[1..]
                .iter()
                .filter_map(|op| {
                    op.as_reg().map(|r| {
                        (
                            if r.is_def { AsmFlag::Def } else { AsmFlag::Use },
                            r.reg,
                        )
                    })
                })
                .collect();

            let Some(processor) = self.intrinsics.get(&info.intrinsic) else {
                outcome = Err(Error::UnknownIntrinsic {
                    name: info.intrinsic.clone(),
                    caller: wrapper.to_string(),
                });
                break;
            };
            let mut builder =
                MirBuilder::new(module, &mut func, phys_map, karg_map, Some(kernel_info));
            if let Err(e) = (processor.mir_processor)(info, &regs, &mut builder) {
                outcome = Err(e);
                break;
            }
            let emitted = builder.finish();
            session.record_intrinsic_lowered();
            func.blocks[bi].insts.splice(pos..pos + 1, emitted);
        }
        put_function(module, func);
        outcome
    }
}

fn is_reserved(p: PhysReg, frame_sgpr_base: u16, sva_vgpr: u16) -> bool {
    match p {
        PhysReg::Sgpr(n) => n >= frame_sgpr_base,
        PhysReg::Vgpr(n) => n >= sva_vgpr,
        _ => false,
    }
}

/// Self-copies can appear when a direct reference hits a register that
/// the reserved-area filter kept physical. Drop the no-ops.
fn strip_self_copies(func: &mut crate::mir::MachFunction) {
    for block in &mut func.blocks {
        block.insts.retain(|inst| {
            if inst.opcode != Opcode::Pseudo(PseudoOp::Copy) {
                return true;
            }
            match (&inst.operands[0], &inst.operands[1]) {
                (MachOperand::Reg(a), MachOperand::Reg(b)) => a.reg != b.reg,
                _ => true,
            }
        });
    }
}

/// Builds the wrapper IR function calling `invocations` in order.
fn build_wrapper(
    ir_module: &mut IrModule,
    payload: &IrModule,
    name: &str,
    invocations: &[HookInvocation],
) -> Result<()> {
    let mut func = IrFunction::new(name, false);
    let entry = func.add_block("entry");

    for invocation in invocations {
        if !ir_module.import_function(payload, &invocation.hook) {
            return Err(Error::codegen(format!(
                "hook `{}` is not defined in the tool payload",
                invocation.hook
            )));
        }
        let hook = ir_module
            .function(&invocation.hook)
            .cloned()
            .ok_or_else(|| Error::codegen(format!("hook `{}` vanished", invocation.hook)))?;
        if hook.param_count != invocation.args.len() {
            return Err(Error::codegen(format!(
                "hook `{}` takes {} arguments, {} supplied",
                invocation.hook,
                hook.param_count,
                invocation.args.len()
            )));
        }

        let mut args = Vec::new();
        for (arg, (_, param_ty)) in invocation.args.iter().zip(hook.params()) {
            let value = match arg {
                HookArg::Imm(v) => func.push_inst(
                    entry,
                    "",
                    IrInst::IConst {
                        ty: param_ty,
                        value: *v,
                    },
                ),
                HookArg::PhysReg(reg) => {
                    let designator = reg.encoding_index().ok_or_else(|| {
                        Error::codegen(format!("register {reg} has no operand encoding"))
                    })?;
                    let idx = func.push_inst(
                        entry,
                        "",
                        IrInst::IConst {
                            ty: Type::I32,
                            value: designator as i64,
                        },
                    );
                    func.push_inst(
                        entry,
                        "",
                        IrInst::Call {
                            callee: "readReg".to_string(),
                            args: vec![idx],
                            ty: Some(Type::I32),
                        },
                    )
                }
            };
            args.push(value);
        }
        func.push_inst(
            entry,
            "",
            IrInst::Call {
                callee: invocation.hook.clone(),
                args,
                ty: None,
            },
        );
    }
    func.push_inst(entry, "", IrInst::Ret { value: None });
    ir_module.functions.push(func);
    Ok(())
}

fn take_function(module: &mut MirModule, name: &str) -> Result<crate::mir::MachFunction> {
    let index = module
        .functions
        .iter()
        .position(|f| f.name == name)
        .ok_or_else(|| Error::codegen(format!("no function `{name}` in the module")))?;
    Ok(std::mem::replace(
        &mut module.functions[index],
        crate::mir::MachFunction::new(name, false),
    ))
}

fn put_function(module: &mut MirModule, func: crate::mir::MachFunction) {
    if let Some(slot) = module.functions.iter_mut().find(|f| f.name == func.name) {
        *slot = func;
    } else {
        module.functions.push(func);
    }
}

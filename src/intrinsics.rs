//! The intrinsic registry and two-stage lowering machinery.
//!
//! An intrinsic is a call in hook code that must become specific machine
//! instructions. Lowering runs twice: the IR processor replaces the call
//! with an indexed inline-asm placeholder and records constraints; after
//! instruction selection the MIR processor finds the placeholder by index
//! and emits real machine IR in its place.
//!
//! Registry keys are demangled names with template arguments stripped, so
//! `_Z9readReg32ItET_j` and `readReg32<unsigned>` both key `readReg32`.

use crate::amdgpu::{Opcode, PhysReg, PseudoOp, SmemOp};
use crate::error::{Error, Result};
use crate::hsa::symbol::KernelInfo;
use crate::ir::{IrFunction, IrInst, Type, ValueDef, ValueId};
use crate::mir::{MachFunction, MachInst, MachOperand, MirModule, RegClass, Register, VirtReg};
use crate::target::TargetMachine;
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

/// Kernel values the lowering machinery can guarantee access to.
///
/// They arrive either preloaded in S/VGPRs or as hidden kernarg slots;
/// the injected prologue preserves whichever storage applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KernelArgKind {
    PrivateSegmentBuffer,
    KernargSegmentPtr,
    HiddenKernargOffset,
    UserKernargOffset,
    DispatchId,
    FlatScratch,
    PrivateSegmentWaveByteOffset,
    DispatchPtr,
    QueuePtr,
    WorkItemPrivateSegmentSize,
    WorkgroupIdX,
    WorkgroupIdY,
    WorkgroupIdZ,
    /// The pointer to the hidden-argument area itself.
    ImplicitArgPtr,
}

/// Where a kernel argument lives at dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgStorage {
    AlwaysSgpr,
    /// Requires runtime detection of which storage applies: the value is
    /// in an SGPR only when the descriptor enables it, otherwise it must
    /// be read from the hidden kernarg area.
    EitherSgprOrHidden,
    HiddenOnly,
}

impl KernelArgKind {
    pub fn storage(self) -> ArgStorage {
        use KernelArgKind::*;
        match self {
            PrivateSegmentBuffer | KernargSegmentPtr | HiddenKernargOffset
            | UserKernargOffset | DispatchId | FlatScratch | PrivateSegmentWaveByteOffset
            | WorkgroupIdX | WorkgroupIdY | WorkgroupIdZ => ArgStorage::AlwaysSgpr,
            DispatchPtr | QueuePtr | WorkItemPrivateSegmentSize => ArgStorage::EitherSgprOrHidden,
            ImplicitArgPtr => ArgStorage::HiddenOnly,
        }
    }

    /// Register class of the value when held in registers.
    pub fn reg_class(self) -> RegClass {
        use KernelArgKind::*;
        match self {
            PrivateSegmentBuffer => RegClass::SGpr128,
            KernargSegmentPtr | DispatchId | FlatScratch | DispatchPtr | QueuePtr
            | ImplicitArgPtr => RegClass::SGpr64,
            _ => RegClass::SGpr32,
        }
    }
}

/// Inline-asm operand polarity, as handed to the MIR processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsmFlag {
    Def,
    Use,
}

/// Output of the IR processing stage for one intrinsic call site.
pub struct IrLoweringInfo {
    /// Demangled intrinsic name; set by the code generator.
    pub intrinsic: String,
    /// Index embedded in the placeholder, keying this info.
    pub placeholder_index: u32,
    /// Constraint for the return value, when the call produces one
    /// (`"s"` scalar, `"v"` vector).
    pub ret_constraint: Option<String>,
    /// Constraint per argument. `"i"` arguments are immediates consumed
    /// at IR time and not lowered to registers.
    pub arg_constraints: Vec<String>,
    /// Arbitrary payload forwarded to the MIR processor.
    data: Option<Box<dyn Any + Send + Sync>>,
    /// Physical registers the intrinsic must be able to access.
    pub accessed_phys_regs: BTreeSet<PhysReg>,
    /// Kernel arguments the intrinsic must be able to access.
    pub accessed_kernel_args: BTreeSet<KernelArgKind>,
}

impl IrLoweringInfo {
    pub fn new() -> Self {
        IrLoweringInfo {
            intrinsic: String::new(),
            placeholder_index: 0,
            ret_constraint: None,
            arg_constraints: Vec::new(),
            data: None,
            accessed_phys_regs: BTreeSet::new(),
            accessed_kernel_args: BTreeSet::new(),
        }
    }

    pub fn set_data<T: Any + Send + Sync>(&mut self, value: T) {
        self.data = Some(Box::new(value));
    }

    pub fn data<T: Any>(&self) -> Option<&T> {
        self.data.as_ref().and_then(|d| d.downcast_ref::<T>())
    }

    pub fn request_phys_reg(&mut self, reg: PhysReg) {
        self.accessed_phys_regs.insert(reg);
    }

    pub fn request_kernel_arg(&mut self, arg: KernelArgKind) {
        self.accessed_kernel_args.insert(arg);
    }
}

impl Default for IrLoweringInfo {
    fn default() -> Self {
        IrLoweringInfo::new()
    }
}

/// Emission context handed to MIR processors.
///
/// Collects the instructions that replace one placeholder and provides
/// the factories the processors are allowed to use.
pub struct MirBuilder<'a> {
    pub module: &'a mut MirModule,
    pub func: &'a mut MachFunction,
    out: Vec<MachInst>,
    /// Virtual registers standing in for physical registers; the
    /// virtualisation pass wires them up.
    phys_vregs: &'a mut BTreeMap<PhysReg, VirtReg>,
    /// Virtual registers carrying kernel arguments; the prologue wires
    /// them up.
    kernarg_vregs: &'a mut BTreeMap<KernelArgKind, VirtReg>,
    /// Kernel context, absent inside device functions.
    pub kernel: Option<&'a KernelInfo>,
}

impl<'a> MirBuilder<'a> {
    pub fn new(
        module: &'a mut MirModule,
        func: &'a mut MachFunction,
        phys_vregs: &'a mut BTreeMap<PhysReg, VirtReg>,
        kernarg_vregs: &'a mut BTreeMap<KernelArgKind, VirtReg>,
        kernel: Option<&'a KernelInfo>,
    ) -> Self {
        MirBuilder {
            module,
            func,
            out: Vec::new(),
            phys_vregs,
            kernarg_vregs,
            kernel,
        }
    }

    /// Emits one instruction in place of the placeholder.
    pub fn emit(&mut self, opcode: Opcode) -> &mut MachInst {
        let inst = self.module.new_inst(opcode);
        self.out.push(inst);
        self.out.last_mut().unwrap()
    }

    pub fn create_vreg(&mut self, class: RegClass) -> VirtReg {
        self.func.create_vreg(class)
    }

    /// A virtual register that will carry the value of `phys` at the
    /// placeholder's position.
    pub fn phys_reg_vreg(&mut self, phys: PhysReg) -> Register {
        if let Some(v) = self.phys_vregs.get(&phys) {
            return Register::Virt(*v);
        }
        let v = self.func.create_vreg(RegClass::of_phys(phys));
        self.phys_vregs.insert(phys, v);
        Register::Virt(v)
    }

    /// A virtual register that will carry the given kernel argument.
    pub fn kernel_arg_reg(&mut self, arg: KernelArgKind) -> Result<Register> {
        if self.kernel.is_none() && arg.storage() != ArgStorage::AlwaysSgpr {
            return Err(Error::lowering(
                "<kernel-arg>",
                format!("{arg:?} is unavailable inside device functions"),
            ));
        }
        if let Some(v) = self.kernarg_vregs.get(&arg) {
            return Ok(Register::Virt(*v));
        }
        let v = self.func.create_vreg(arg.reg_class());
        self.kernarg_vregs.insert(arg, v);
        Ok(Register::Virt(v))
    }

    pub fn finish(self) -> Vec<MachInst> {
        self.out
    }
}

/// IR-stage processor: inspects the call and produces lowering info.
pub type IrProcessorFn =
    Arc<dyn Fn(&IrFunction, ValueId, &TargetMachine) -> Result<IrLoweringInfo> + Send + Sync>;

/// MIR-stage processor: emits machine IR in place of the placeholder.
pub type MirProcessorFn = Arc<
    dyn Fn(&IrLoweringInfo, &[(AsmFlag, Register)], &mut MirBuilder<'_>) -> Result<()>
        + Send
        + Sync,
>;

#[derive(Clone)]
pub struct IntrinsicProcessor {
    pub ir_processor: IrProcessorFn,
    pub mir_processor: MirProcessorFn,
}

/// Name → processor map. Tools may register additional intrinsics.
pub struct IntrinsicRegistry {
    map: RwLock<HashMap<String, IntrinsicProcessor>>,
}

impl IntrinsicRegistry {
    pub fn new() -> Self {
        IntrinsicRegistry {
            map: RwLock::new(HashMap::new()),
        }
    }

    /// A registry preloaded with the built-in intrinsics.
    pub fn with_builtins() -> Self {
        let registry = IntrinsicRegistry::new();
        register_builtins(&registry);
        registry
    }

    pub fn register(&self, name: impl Into<String>, processor: IntrinsicProcessor) {
        self.map.write().unwrap().insert(name.into(), processor);
    }

    pub fn get(&self, name: &str) -> Option<IntrinsicProcessor> {
        self.map.read().unwrap().get(name).cloned()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.map.read().unwrap().contains_key(name)
    }
}

impl Default for IntrinsicRegistry {
    fn default() -> Self {
        IntrinsicRegistry::with_builtins()
    }
}

/// Derives the registry key from a callee name: demangles C++ manglings
/// and strips template arguments and parameter lists.
pub fn registry_key(callee: &str) -> String {
    let demangled = cpp_demangle::Symbol::new(callee.as_bytes())
        .map(|sym| sym.to_string())
        .unwrap_or_else(|_| callee.to_string());
    let stripped: &str = demangled
        .split(['<', '('])
        .next()
        .unwrap_or(&demangled)
        .trim();
    stripped.to_string()
}

/// The constant argument of an intrinsic call, required by processors
/// that take immediate operands (register designators, lane numbers).
fn const_arg(func: &IrFunction, call: ValueId, index: usize) -> Result<i64> {
    let ValueDef::Inst(IrInst::Call { args, callee, .. }) = &func.value(call).def else {
        return Err(Error::lowering("<unknown>", "not a call site"));
    };
    let arg = args.get(index).ok_or_else(|| {
        Error::lowering(callee.clone(), format!("missing argument {index}"))
    })?;
    match &func.value(*arg).def {
        ValueDef::Inst(IrInst::IConst { value, .. }) => Ok(*value),
        _ => Err(Error::lowering(
            callee.clone(),
            format!("argument {index} must be a constant"),
        )),
    }
}

fn phys_reg_const_arg(func: &IrFunction, call: ValueId, index: usize) -> Result<PhysReg> {
    let value = const_arg(func, call, index)?;
    u16::try_from(value)
        .ok()
        .and_then(PhysReg::from_encoding_index)
        .ok_or_else(|| {
            Error::lowering(
                "<register-designator>",
                format!("{value} does not name a register"),
            )
        })
}

fn lowered_def(regs: &[(AsmFlag, Register)]) -> Result<Register> {
    regs.iter()
        .find(|(flag, _)| *flag == AsmFlag::Def)
        .map(|(_, reg)| *reg)
        .ok_or_else(|| Error::lowering("<intrinsic>", "placeholder lost its def register"))
}

fn lowered_uses(regs: &[(AsmFlag, Register)]) -> Vec<Register> {
    regs.iter()
        .filter(|(flag, _)| *flag == AsmFlag::Use)
        .map(|(_, reg)| *reg)
        .collect()
}

fn copy(builder: &mut MirBuilder<'_>, dst: Register, src: Register) {
    builder
        .emit(Opcode::Pseudo(PseudoOp::Copy))
        .operands
        .extend([MachOperand::reg_def(dst), MachOperand::reg_use(src)]);
}

fn register_builtins(registry: &IntrinsicRegistry) {
    // readReg(<reg designator>) -> i32
    registry.register(
        "readReg",
        IntrinsicProcessor {
            ir_processor: Arc::new(|func, call, _tm| {
                let phys = phys_reg_const_arg(func, call, 0)?;
                let mut info = IrLoweringInfo::new();
                info.ret_constraint = Some("s".into());
                info.arg_constraints = vec!["i".into()];
                info.request_phys_reg(phys);
                info.set_data(phys);
                Ok(info)
            }),
            mir_processor: Arc::new(|info, regs, builder| {
                let phys = *info
                    .data::<PhysReg>()
                    .ok_or_else(|| Error::lowering("readReg", "missing register payload"))?;
                let dst = lowered_def(regs)?;
                let src = builder.phys_reg_vreg(phys);
                copy(builder, dst, src);
                Ok(())
            }),
        },
    );

    // writeReg(<reg designator>, value)
    registry.register(
        "writeReg",
        IntrinsicProcessor {
            ir_processor: Arc::new(|func, call, _tm| {
                let phys = phys_reg_const_arg(func, call, 0)?;
                let mut info = IrLoweringInfo::new();
                info.arg_constraints = vec!["i".into(), "s".into()];
                info.request_phys_reg(phys);
                info.set_data(phys);
                Ok(info)
            }),
            mir_processor: Arc::new(|info, regs, builder| {
                let phys = *info
                    .data::<PhysReg>()
                    .ok_or_else(|| Error::lowering("writeReg", "missing register payload"))?;
                let value = *lowered_uses(regs)
                    .first()
                    .ok_or_else(|| Error::lowering("writeReg", "missing value register"))?;
                let dst = builder.phys_reg_vreg(phys);
                copy(builder, dst, value);
                Ok(())
            }),
        },
    );

    // writeExec(value: i64)
    registry.register(
        "writeExec",
        IntrinsicProcessor {
            ir_processor: Arc::new(|_func, _call, _tm| {
                let mut info = IrLoweringInfo::new();
                info.arg_constraints = vec!["s".into()];
                info.request_phys_reg(PhysReg::ExecLo);
                Ok(info)
            }),
            mir_processor: Arc::new(|_info, regs, builder| {
                let value = *lowered_uses(regs)
                    .first()
                    .ok_or_else(|| Error::lowering("writeExec", "missing value register"))?;
                // a direct exec write; the prologue/epilogue pass wraps it
                // in the SCC-preserving two-block sequence
                copy(builder, Register::Phys(PhysReg::ExecLo), value);
                Ok(())
            }),
        },
    );

    // implicitArgPtr() -> ptr
    registry.register(
        "implicitArgPtr",
        IntrinsicProcessor {
            ir_processor: Arc::new(|_func, _call, _tm| {
                let mut info = IrLoweringInfo::new();
                info.ret_constraint = Some("s".into());
                info.request_kernel_arg(KernelArgKind::ImplicitArgPtr);
                info.request_kernel_arg(KernelArgKind::KernargSegmentPtr);
                Ok(info)
            }),
            mir_processor: Arc::new(|_info, regs, builder| {
                let dst = lowered_def(regs)?;
                let src = builder.kernel_arg_reg(KernelArgKind::ImplicitArgPtr)?;
                copy(builder, dst, src);
                Ok(())
            }),
        },
    );

    // workgroupIdX/Y/Z() -> i32
    for (name, arg) in [
        ("workgroupIdX", KernelArgKind::WorkgroupIdX),
        ("workgroupIdY", KernelArgKind::WorkgroupIdY),
        ("workgroupIdZ", KernelArgKind::WorkgroupIdZ),
    ] {
        registry.register(
            name,
            IntrinsicProcessor {
                ir_processor: Arc::new(move |_func, _call, _tm| {
                    let mut info = IrLoweringInfo::new();
                    info.ret_constraint = Some("s".into());
                    info.request_kernel_arg(arg);
                    Ok(info)
                }),
                mir_processor: Arc::new(move |_info, regs, builder| {
                    let dst = lowered_def(regs)?;
                    let src = builder.kernel_arg_reg(arg)?;
                    copy(builder, dst, src);
                    Ok(())
                }),
            },
        );
    }

    // sAtomicAdd(ptr, i32) -> i32, scalar-memory atomic with return
    registry.register(
        "sAtomicAdd",
        IntrinsicProcessor {
            ir_processor: Arc::new(|_func, _call, _tm| {
                let mut info = IrLoweringInfo::new();
                info.ret_constraint = Some("s".into());
                info.arg_constraints = vec!["s".into(), "s".into()];
                Ok(info)
            }),
            mir_processor: Arc::new(|_info, regs, builder| {
                let dst = lowered_def(regs)?;
                let uses = lowered_uses(regs);
                let [ptr, value] = uses.as_slice() else {
                    return Err(Error::lowering("sAtomicAdd", "expected two registers"));
                };
                let data = builder.create_vreg(RegClass::SGpr32);
                copy(builder, Register::Virt(data), *value);
                let atomic = builder.emit(Opcode::Smem(SmemOp::S_ATOMIC_ADD));
                atomic.operands.extend([
                    MachOperand::reg_def(Register::Virt(data)),
                    MachOperand::reg_use(*ptr),
                    MachOperand::Imm(0),
                    MachOperand::implicit_use(Register::Virt(data)),
                ]);
                copy(builder, dst, Register::Virt(data));
                Ok(())
            }),
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_keys_strip_templates_and_params() {
        assert_eq!(registry_key("readReg"), "readReg");
        assert_eq!(registry_key("readReg<unsigned int>"), "readReg");
        assert_eq!(registry_key("myTool::probe(int, int)"), "myTool::probe");
    }

    #[test]
    fn builtins_are_registered() {
        let registry = IntrinsicRegistry::with_builtins();
        for name in [
            "readReg",
            "writeReg",
            "writeExec",
            "implicitArgPtr",
            "workgroupIdX",
            "workgroupIdY",
            "workgroupIdZ",
            "sAtomicAdd",
        ] {
            assert!(registry.is_registered(name), "missing builtin {name}");
        }
        assert!(!registry.is_registered("nope"));
    }

    #[test]
    fn storage_classification() {
        assert_eq!(
            KernelArgKind::KernargSegmentPtr.storage(),
            ArgStorage::AlwaysSgpr
        );
        assert_eq!(
            KernelArgKind::QueuePtr.storage(),
            ArgStorage::EitherSgprOrHidden
        );
        assert_eq!(
            KernelArgKind::ImplicitArgPtr.storage(),
            ArgStorage::HiddenOnly
        );
        assert_eq!(
            KernelArgKind::PrivateSegmentBuffer.reg_class(),
            RegClass::SGpr128
        );
    }
}

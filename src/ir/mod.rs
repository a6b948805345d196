//! The hook IR.
//!
//! Tool payloads carry their hook bodies in this compact SSA IR. It is the
//! "compiler IR" level of the instrumentation pipeline: hook calls are
//! materialised here, the optimisation pipeline and the first stage of
//! intrinsic lowering run here, and instruction selection consumes it.
//!
//! # Format
//!
//! ```text
//! ; comments run to end of line
//! global @counter : i64
//! extern global @buffer : ptr
//! hook @count(%n: i32) {
//! entry:
//!     %addr = addrof @counter
//!     %old = call.i64 @sAtomicAdd(%addr, %n)
//!     br ^done
//! done:
//!     ret
//! }
//! ```

pub mod opt;
pub mod parser;

pub use parser::parse_module;

use std::collections::{HashMap, HashSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    I1,
    I32,
    I64,
    Ptr,
}

impl Type {
    pub fn parse(s: &str) -> Option<Type> {
        Some(match s {
            "i1" => Type::I1,
            "i32" => Type::I32,
            "i64" => Type::I64,
            "ptr" => Type::Ptr,
            _ => return None,
        })
    }

    pub fn dwords(self) -> u32 {
        match self {
            Type::I1 | Type::I32 => 1,
            Type::I64 | Type::Ptr => 2,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Type::I1 => "i1",
            Type::I32 => "i32",
            Type::I64 => "i64",
            Type::Ptr => "ptr",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Shl,
    LShr,
}

impl BinOp {
    pub fn parse(s: &str) -> Option<BinOp> {
        Some(match s {
            "add" => BinOp::Add,
            "sub" => BinOp::Sub,
            "and" => BinOp::And,
            "or" => BinOp::Or,
            "xor" => BinOp::Xor,
            "shl" => BinOp::Shl,
            "lshr" => BinOp::LShr,
            _ => return None,
        })
    }

    pub fn fold(self, lhs: i64, rhs: i64) -> i64 {
        match self {
            BinOp::Add => lhs.wrapping_add(rhs),
            BinOp::Sub => lhs.wrapping_sub(rhs),
            BinOp::And => lhs & rhs,
            BinOp::Or => lhs | rhs,
            BinOp::Xor => lhs ^ rhs,
            BinOp::Shl => lhs.wrapping_shl(rhs as u32),
            BinOp::LShr => ((lhs as u64).wrapping_shr(rhs as u32)) as i64,
        }
    }
}

/// One IR instruction. Instructions that produce a value *are* that value.
#[derive(Debug, Clone, PartialEq)]
pub enum IrInst {
    IConst {
        ty: Type,
        value: i64,
    },
    Bin {
        op: BinOp,
        ty: Type,
        lhs: ValueId,
        rhs: ValueId,
    },
    Load {
        ty: Type,
        addr: ValueId,
    },
    Store {
        ty: Type,
        addr: ValueId,
        value: ValueId,
    },
    /// Address of a module global.
    AddrOf {
        global: String,
    },
    /// Value alias introduced by inlining; folded away by optimisation.
    Copy {
        ty: Type,
        src: ValueId,
    },
    Call {
        callee: String,
        args: Vec<ValueId>,
        ty: Option<Type>,
    },
    /// Inline-asm placeholder standing in for an intrinsic call until the
    /// machine-IR lowering stage; `index` keys the lowering side table.
    AsmPlaceholder {
        index: u32,
        args: Vec<ValueId>,
        ty: Option<Type>,
    },
    Br {
        target: BlockId,
    },
    CondBr {
        cond: ValueId,
        then_target: BlockId,
        else_target: BlockId,
    },
    Ret {
        value: Option<ValueId>,
    },
}

impl IrInst {
    pub fn result_type(&self) -> Option<Type> {
        match self {
            IrInst::IConst { ty, .. }
            | IrInst::Bin { ty, .. }
            | IrInst::Load { ty, .. }
            | IrInst::Copy { ty, .. } => Some(*ty),
            IrInst::AddrOf { .. } => Some(Type::Ptr),
            IrInst::Call { ty, .. } | IrInst::AsmPlaceholder { ty, .. } => *ty,
            _ => None,
        }
    }

    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            IrInst::Br { .. } | IrInst::CondBr { .. } | IrInst::Ret { .. }
        )
    }

    /// Whether removing an unused result changes program behaviour.
    pub fn has_side_effects(&self) -> bool {
        matches!(
            self,
            IrInst::Store { .. }
                | IrInst::Call { .. }
                | IrInst::AsmPlaceholder { .. }
                | IrInst::Br { .. }
                | IrInst::CondBr { .. }
                | IrInst::Ret { .. }
        )
    }

    pub fn operand_values(&self) -> Vec<ValueId> {
        match self {
            IrInst::IConst { .. } | IrInst::AddrOf { .. } | IrInst::Br { .. } => Vec::new(),
            IrInst::Bin { lhs, rhs, .. } => vec![*lhs, *rhs],
            IrInst::Load { addr, .. } => vec![*addr],
            IrInst::Store { addr, value, .. } => vec![*addr, *value],
            IrInst::Copy { src, .. } => vec![*src],
            IrInst::Call { args, .. } | IrInst::AsmPlaceholder { args, .. } => args.clone(),
            IrInst::CondBr { cond, .. } => vec![*cond],
            IrInst::Ret { value } => value.iter().copied().collect(),
        }
    }

    pub fn remap_values(&mut self, map: &dyn Fn(ValueId) -> ValueId) {
        match self {
            IrInst::IConst { .. } | IrInst::AddrOf { .. } | IrInst::Br { .. } => {}
            IrInst::Bin { lhs, rhs, .. } => {
                *lhs = map(*lhs);
                *rhs = map(*rhs);
            }
            IrInst::Load { addr, .. } => *addr = map(*addr),
            IrInst::Store { addr, value, .. } => {
                *addr = map(*addr);
                *value = map(*value);
            }
            IrInst::Copy { src, .. } => *src = map(*src),
            IrInst::Call { args, .. } | IrInst::AsmPlaceholder { args, .. } => {
                for a in args {
                    *a = map(*a);
                }
            }
            IrInst::CondBr { cond, .. } => *cond = map(*cond),
            IrInst::Ret { value } => {
                if let Some(v) = value {
                    *v = map(*v);
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValueDef {
    Arg { ty: Type },
    Inst(IrInst),
}

#[derive(Debug, Clone, PartialEq)]
pub struct IrValue {
    pub name: String,
    pub def: ValueDef,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IrBlock {
    pub name: String,
    pub insts: Vec<ValueId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IrFunction {
    pub name: String,
    /// Hooks are the functions tools may splice before instructions.
    pub is_hook: bool,
    pub param_count: usize,
    pub values: Vec<IrValue>,
    pub blocks: Vec<IrBlock>,
}

impl IrFunction {
    pub fn new(name: impl Into<String>, is_hook: bool) -> Self {
        IrFunction {
            name: name.into(),
            is_hook,
            param_count: 0,
            values: Vec::new(),
            blocks: Vec::new(),
        }
    }

    pub fn value(&self, id: ValueId) -> &IrValue {
        &self.values[id.0 as usize]
    }

    pub fn value_type(&self, id: ValueId) -> Option<Type> {
        match &self.value(id).def {
            ValueDef::Arg { ty } => Some(*ty),
            ValueDef::Inst(inst) => inst.result_type(),
        }
    }

    pub fn params(&self) -> impl Iterator<Item = (ValueId, Type)> + '_ {
        (0..self.param_count).map(|i| {
            let id = ValueId(i as u32);
            match &self.value(id).def {
                ValueDef::Arg { ty } => (id, *ty),
                ValueDef::Inst(_) => unreachable!("parameters precede instructions"),
            }
        })
    }

    pub fn push_value(&mut self, name: impl Into<String>, def: ValueDef) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(IrValue {
            name: name.into(),
            def,
        });
        id
    }

    pub fn push_inst(&mut self, block: BlockId, name: impl Into<String>, inst: IrInst) -> ValueId {
        let id = self.push_value(name, ValueDef::Inst(inst));
        self.blocks[block.0 as usize].insts.push(id);
        id
    }

    pub fn add_block(&mut self, name: impl Into<String>) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(IrBlock {
            name: name.into(),
            insts: Vec::new(),
        });
        id
    }

    /// Names of the functions this one calls.
    pub fn callees(&self) -> HashSet<String> {
        let mut out = HashSet::new();
        for value in &self.values {
            if let ValueDef::Inst(IrInst::Call { callee, .. }) = &value.def {
                out.insert(callee.clone());
            }
        }
        out
    }

    /// Names of the globals this function references.
    pub fn referenced_globals(&self) -> HashSet<String> {
        let mut out = HashSet::new();
        for value in &self.values {
            if let ValueDef::Inst(IrInst::AddrOf { global }) = &value.def {
                out.insert(global.clone());
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IrGlobal {
    pub name: String,
    pub ty: Type,
    pub is_extern: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IrModule {
    pub globals: Vec<IrGlobal>,
    pub functions: Vec<IrFunction>,
}

impl IrModule {
    pub fn function(&self, name: &str) -> Option<&IrFunction> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn function_mut(&mut self, name: &str) -> Option<&mut IrFunction> {
        self.functions.iter_mut().find(|f| f.name == name)
    }

    pub fn global(&self, name: &str) -> Option<&IrGlobal> {
        self.globals.iter().find(|g| g.name == name)
    }

    pub fn add_global(&mut self, global: IrGlobal) {
        if self.global(&global.name).is_none() {
            self.globals.push(global);
        }
    }

    /// Hook functions exported by this module.
    pub fn hooks(&self) -> impl Iterator<Item = &IrFunction> {
        self.functions.iter().filter(|f| f.is_hook)
    }

    /// Clones `name`, its transitive callees, and every referenced global
    /// from `source` into this module. Existing definitions are kept.
    pub fn import_function(&mut self, source: &IrModule, name: &str) -> bool {
        if self.function(name).is_some() {
            return true;
        }
        let Some(func) = source.function(name) else {
            return false;
        };
        self.functions.push(func.clone());
        for global in func.referenced_globals() {
            if let Some(g) = source.global(&global) {
                self.add_global(g.clone());
            }
        }
        for callee in func.callees() {
            // intrinsics have no body in the source module; skip them
            if source.function(&callee).is_some() {
                self.import_function(source, &callee);
            }
        }
        true
    }
}

/// Remaps block references after splicing.
pub(crate) fn remap_blocks(inst: &mut IrInst, map: &HashMap<BlockId, BlockId>) {
    match inst {
        IrInst::Br { target } => {
            if let Some(t) = map.get(target) {
                *target = *t;
            }
        }
        IrInst::CondBr {
            then_target,
            else_target,
            ..
        } => {
            if let Some(t) = map.get(then_target) {
                *then_target = *t;
            }
            if let Some(t) = map.get(else_target) {
                *else_target = *t;
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_construction() {
        let mut f = IrFunction::new("h", true);
        let n = f.push_value("n", ValueDef::Arg { ty: Type::I32 });
        f.param_count = 1;
        let entry = f.add_block("entry");
        let one = f.push_inst(entry, "one", IrInst::IConst { ty: Type::I32, value: 1 });
        let sum = f.push_inst(
            entry,
            "sum",
            IrInst::Bin {
                op: BinOp::Add,
                ty: Type::I32,
                lhs: n,
                rhs: one,
            },
        );
        f.push_inst(entry, "", IrInst::Ret { value: Some(sum) });

        assert_eq!(f.value_type(sum), Some(Type::I32));
        assert_eq!(f.value_type(n), Some(Type::I32));
        assert_eq!(f.params().count(), 1);
        assert_eq!(f.blocks[0].insts.len(), 3);
        assert_eq!(f.value_type(one), Some(Type::I32));
    }

    #[test]
    fn import_pulls_callees_and_globals() {
        let mut source = IrModule::default();
        source.add_global(IrGlobal {
            name: "counter".into(),
            ty: Type::I64,
            is_extern: false,
        });

        let mut helper = IrFunction::new("helper", false);
        let entry = helper.add_block("entry");
        helper.push_inst(entry, "", IrInst::Ret { value: None });
        source.functions.push(helper);

        let mut hook = IrFunction::new("hook_fn", true);
        let entry = hook.add_block("entry");
        hook.push_inst(
            entry,
            "addr",
            IrInst::AddrOf {
                global: "counter".into(),
            },
        );
        hook.push_inst(
            entry,
            "",
            IrInst::Call {
                callee: "helper".into(),
                args: vec![],
                ty: None,
            },
        );
        hook.push_inst(entry, "", IrInst::Ret { value: None });
        source.functions.push(hook);

        let mut dest = IrModule::default();
        assert!(dest.import_function(&source, "hook_fn"));
        assert!(dest.function("hook_fn").is_some());
        assert!(dest.function("helper").is_some());
        assert!(dest.global("counter").is_some());
        assert!(!dest.import_function(&source, "missing"));
    }
}

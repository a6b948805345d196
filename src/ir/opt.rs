//! The IR optimisation pipeline run over injected hook code.
//!
//! Four passes: call inlining (hooks and their helpers always end up
//! inlined into the injected payload, so instruction selection only ever
//! sees intrinsic calls), constant folding, copy propagation, and dead
//! code elimination. A module-level pass prunes globals nothing
//! references.

use super::*;
use crate::error::{Error, Result};

/// Runs the whole pipeline over one function.
pub fn optimize_function(module: &mut IrModule, name: &str) -> Result<()> {
    inline_calls(module, name)?;
    let func = module
        .function_mut(name)
        .ok_or_else(|| Error::codegen(format!("no function `{name}` to optimise")))?;
    fold_constants(func);
    propagate_copies(func);
    eliminate_dead_code(func);
    Ok(())
}

/// Inlines every call to a function defined in `module` into `name`.
///
/// Callees with more than one return block are left alone; instruction
/// selection reports them if they survive.
pub fn inline_calls(module: &mut IrModule, name: &str) -> Result<()> {
    // bounded: each round inlines one call site; nested calls need one
    // round per nesting level
    for _ in 0..64 {
        let Some(site) = find_inline_site(module, name) else {
            return Ok(());
        };
        inline_one(module, name, site)?;
    }
    Err(Error::codegen(format!(
        "call inlining in `{name}` did not converge (recursive hooks?)"
    )))
}

struct InlineSite {
    block: usize,
    pos: usize,
    call_value: ValueId,
    callee: String,
    args: Vec<ValueId>,
}

fn find_inline_site(module: &IrModule, name: &str) -> Option<InlineSite> {
    let func = module.function(name)?;
    for (bi, block) in func.blocks.iter().enumerate() {
        for (pos, &vid) in block.insts.iter().enumerate() {
            if let ValueDef::Inst(IrInst::Call { callee, args, .. }) = &func.value(vid).def {
                if let Some(target) = module.function(callee) {
                    let ret_blocks = target
                        .values
                        .iter()
                        .filter(|v| matches!(v.def, ValueDef::Inst(IrInst::Ret { .. })))
                        .count();
                    if ret_blocks != 1 {
                        continue;
                    }
                    return Some(InlineSite {
                        block: bi,
                        pos,
                        call_value: vid,
                        callee: callee.clone(),
                        args: args.clone(),
                    });
                }
            }
        }
    }
    None
}

fn inline_one(module: &mut IrModule, name: &str, site: InlineSite) -> Result<()> {
    let callee = module
        .function(&site.callee)
        .cloned()
        .ok_or_else(|| Error::codegen(format!("inline target `{}` vanished", site.callee)))?;
    let func = module
        .function_mut(name)
        .ok_or_else(|| Error::codegen(format!("no function `{name}`")))?;

    if site.args.len() != callee.param_count {
        return Err(Error::codegen(format!(
            "call to `{}` passes {} arguments, expected {}",
            site.callee,
            site.args.len(),
            callee.param_count
        )));
    }

    // continuation block receives everything after the call
    let cont = func.add_block(format!("{}.cont", func.blocks[site.block].name));
    let trailing: Vec<ValueId> = func.blocks[site.block].insts.split_off(site.pos + 1);
    func.blocks[cont.0 as usize].insts = trailing;
    func.blocks[site.block].insts.pop(); // the call itself

    // clone callee blocks
    let mut block_map = HashMap::new();
    for cb in &callee.blocks {
        let nb = func.add_block(format!("{}.{}", site.callee, cb.name));
        block_map.insert(BlockId(block_map.len() as u32), nb);
    }

    // clone callee values: params map to actual arguments
    let mut value_map: Vec<ValueId> = Vec::with_capacity(callee.values.len());
    for (i, value) in callee.values.iter().enumerate() {
        match &value.def {
            ValueDef::Arg { .. } => value_map.push(site.args[i]),
            ValueDef::Inst(_) => {
                // placeholder; the real def is patched below once the full
                // map exists
                let id = func.push_value(
                    format!("{}.{}", site.callee, value.name),
                    ValueDef::Inst(IrInst::Ret { value: None }),
                );
                value_map.push(id);
            }
        }
    }
    let mut ret_value: Option<Option<ValueId>> = None;
    for (i, value) in callee.values.iter().enumerate() {
        let ValueDef::Inst(inst) = &value.def else {
            continue;
        };
        let mut inst = inst.clone();
        inst.remap_values(&|v| value_map[v.0 as usize]);
        remap_blocks(&mut inst, &block_map);
        if let IrInst::Ret { value } = &inst {
            ret_value = Some(*value);
            inst = IrInst::Br { target: cont };
        }
        func.values[value_map[i].0 as usize].def = ValueDef::Inst(inst);
    }

    // block instruction lists
    for (ci, cb) in callee.blocks.iter().enumerate() {
        let nb = block_map[&BlockId(ci as u32)];
        func.blocks[nb.0 as usize].insts =
            cb.insts.iter().map(|v| value_map[v.0 as usize]).collect();
    }

    // the call block now branches into the inlined entry
    let entry = block_map[&BlockId(0)];
    let br = func.push_value("", ValueDef::Inst(IrInst::Br { target: entry }));
    func.blocks[site.block].insts.push(br);

    // the call's value becomes a copy of the returned value, placed at
    // the head of the continuation block
    let call_ty = match &func.value(site.call_value).def {
        ValueDef::Inst(IrInst::Call { ty, .. }) => *ty,
        _ => None,
    };
    match (call_ty, ret_value.flatten()) {
        (Some(ty), Some(ret)) => {
            func.values[site.call_value.0 as usize].def = ValueDef::Inst(IrInst::Copy {
                ty,
                src: ret,
            });
            func.blocks[cont.0 as usize]
                .insts
                .insert(0, site.call_value);
        }
        _ => {
            // no value to carry; neutralise the call slot
            func.values[site.call_value.0 as usize].def = ValueDef::Inst(IrInst::IConst {
                ty: Type::I32,
                value: 0,
            });
        }
    }
    Ok(())
}

/// Folds binary operations over constants and copies of constants.
pub fn fold_constants(func: &mut IrFunction) {
    for _ in 0..8 {
        let mut changed = false;
        for i in 0..func.values.len() {
            let folded = match &func.values[i].def {
                ValueDef::Inst(IrInst::Bin { op, ty, lhs, rhs }) => {
                    match (const_of(func, *lhs), const_of(func, *rhs)) {
                        (Some(a), Some(b)) => Some(IrInst::IConst {
                            ty: *ty,
                            value: op.fold(a, b),
                        }),
                        _ => None,
                    }
                }
                ValueDef::Inst(IrInst::Copy { ty, src }) => const_of(func, *src)
                    .map(|v| IrInst::IConst { ty: *ty, value: v }),
                _ => None,
            };
            if let Some(inst) = folded {
                func.values[i].def = ValueDef::Inst(inst);
                changed = true;
            }
        }
        if !changed {
            return;
        }
    }
}

fn const_of(func: &IrFunction, id: ValueId) -> Option<i64> {
    match &func.value(id).def {
        ValueDef::Inst(IrInst::IConst { value, .. }) => Some(*value),
        _ => None,
    }
}

/// Rewrites uses of `Copy` values to their sources.
pub fn propagate_copies(func: &mut IrFunction) {
    let mut forward: HashMap<ValueId, ValueId> = HashMap::new();
    for (i, value) in func.values.iter().enumerate() {
        if let ValueDef::Inst(IrInst::Copy { src, .. }) = value.def {
            forward.insert(ValueId(i as u32), src);
        }
    }
    if forward.is_empty() {
        return;
    }
    let resolve = |mut v: ValueId| {
        // chains are short; bound the walk anyway
        for _ in 0..forward.len() + 1 {
            match forward.get(&v) {
                Some(next) => v = *next,
                None => break,
            }
        }
        v
    };
    for value in &mut func.values {
        if let ValueDef::Inst(inst) = &mut value.def {
            inst.remap_values(&resolve);
        }
    }
}

/// Drops pure instructions whose results nothing uses.
pub fn eliminate_dead_code(func: &mut IrFunction) {
    let mut used: HashSet<ValueId> = HashSet::new();
    for block in &func.blocks {
        for &vid in &block.insts {
            if let ValueDef::Inst(inst) = &func.value(vid).def {
                if inst.has_side_effects() {
                    used.insert(vid);
                    mark_inputs(func, vid, &mut used);
                }
            }
        }
    }
    let IrFunction { values, blocks, .. } = func;
    for block in blocks.iter_mut() {
        block.insts.retain(|vid| {
            used.contains(vid)
                || matches!(
                    &values[vid.0 as usize].def,
                    ValueDef::Inst(inst) if inst.has_side_effects()
                )
        });
    }
}

fn mark_inputs(func: &IrFunction, vid: ValueId, used: &mut HashSet<ValueId>) {
    let ValueDef::Inst(inst) = &func.value(vid).def else {
        return;
    };
    for input in inst.operand_values() {
        if used.insert(input) {
            mark_inputs(func, input, used);
        }
    }
}

/// Removes globals that no function references, keeping `keep` alive.
pub fn prune_globals(module: &mut IrModule, keep: &HashSet<String>) {
    let mut referenced = keep.clone();
    for func in &module.functions {
        referenced.extend(func.referenced_globals());
    }
    module.globals.retain(|g| referenced.contains(&g.name));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parse_module;

    #[test]
    fn inlines_single_return_helper() {
        let text = r#"
func @double(%x: i32) {
entry:
    %two = iconst.i32 2
    %r = add.i32 %x, %x
    ret %r
}
hook @h(%n: i32) {
entry:
    %d = call.i32 @double(%n)
    %p = addrof @g
    store.i32 %p, %d
    ret
}
global @g : i32
"#;
        let mut module = parse_module(text).unwrap();
        optimize_function(&mut module, "h").unwrap();
        let h = module.function("h").unwrap();
        // no calls survive
        for value in &h.values {
            assert!(
                !matches!(value.def, ValueDef::Inst(IrInst::Call { .. })),
                "call survived inlining"
            );
        }
        // the stored value is the inlined add
        let stored: Vec<_> = h
            .values
            .iter()
            .filter(|v| matches!(v.def, ValueDef::Inst(IrInst::Store { .. })))
            .collect();
        assert_eq!(stored.len(), 1);
    }

    #[test]
    fn folds_constant_chains() {
        let text = r#"
hook @h() {
entry:
    %a = iconst.i32 3
    %b = iconst.i32 4
    %c = add.i32 %a, %b
    %d = shl.i32 %c, %a
    %p = addrof @g
    store.i32 %p, %d
    ret
}
global @g : i32
"#;
        let mut module = parse_module(text).unwrap();
        let func = module.function_mut("h").unwrap();
        fold_constants(func);
        let d = func
            .values
            .iter()
            .find(|v| v.name == "d")
            .expect("value d");
        match &d.def {
            ValueDef::Inst(IrInst::IConst { value, .. }) => assert_eq!(*value, 56),
            other => panic!("not folded: {other:?}"),
        }
    }

    #[test]
    fn dce_drops_unused_pure_values() {
        let text = r#"
hook @h() {
entry:
    %unused = iconst.i32 99
    ret
}
"#;
        let mut module = parse_module(text).unwrap();
        let func = module.function_mut("h").unwrap();
        eliminate_dead_code(func);
        assert_eq!(func.blocks[0].insts.len(), 1); // just the ret
    }

    #[test]
    fn prunes_unreferenced_globals() {
        let text = r#"
global @used : i64
global @unused : i64
hook @h() {
entry:
    %p = addrof @used
    %v = load.i64 %p
    store.i64 %p, %v
    ret
}
"#;
        let mut module = parse_module(text).unwrap();
        prune_globals(&mut module, &HashSet::new());
        assert!(module.global("used").is_some());
        assert!(module.global("unused").is_none());
    }
}

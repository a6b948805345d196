//! The instrumentation task: a deferred mutation plan.
//!
//! Tools describe where hooks go and with which arguments; nothing is
//! mutated until the code generator materialises the plan over the
//! cloned representation. There is deliberately no `insert_hook_after`:
//! splicing after a basic block's terminator would break the block
//! invariant.

use crate::amdgpu::PhysReg;
use crate::error::{Error, Result};
use crate::im::InstrumentationModule;
use crate::lifter::LiftedRepresentation;
use crate::mir::InstId;
use std::collections::HashSet;
use std::sync::Arc;

/// Shadow host pointer exported by the tool for one hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookHandle(pub usize);

/// One positional hook argument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HookArg {
    /// Passed through as an IR constant.
    Imm(i64),
    /// The value of this register at the instrumentation point.
    PhysReg(PhysReg),
}

/// One queued hook invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct HookInvocation {
    pub hook: String,
    pub args: Vec<HookArg>,
}

/// A plan of hook insertions over one cloned representation.
pub struct InstrumentationTask {
    im: Arc<InstrumentationModule>,
    /// Instructions of the representation at task creation; the only
    /// valid insertion targets.
    valid_targets: HashSet<InstId>,
    queue: Vec<(InstId, Vec<HookInvocation>)>,
}

impl InstrumentationTask {
    pub(crate) fn new(lr: &LiftedRepresentation, im: Arc<InstrumentationModule>) -> Self {
        let mut valid_targets = HashSet::new();
        for func in &lr.mir.functions {
            for inst in func.insts() {
                valid_targets.insert(inst.id);
            }
        }
        InstrumentationTask {
            im,
            valid_targets,
            queue: Vec::new(),
        }
    }

    /// Queues `hook` to run immediately before `mi`, with `args`.
    /// Invocations queued for the same instruction run in queue order,
    /// all strictly before it.
    pub fn insert_hook_before(
        &mut self,
        mi: InstId,
        hook: HookHandle,
        args: Vec<HookArg>,
    ) -> Result<()> {
        if !self.valid_targets.contains(&mi) {
            return Err(Error::codegen(format!(
                "instruction {mi:?} does not belong to the task's representation"
            )));
        }
        let name = self.im.hook_name(hook)?;
        let invocation = HookInvocation { hook: name, args };
        match self.queue.iter_mut().find(|(id, _)| *id == mi) {
            Some((_, list)) => list.push(invocation),
            None => self.queue.push((mi, vec![invocation])),
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn queued_insertions(&self) -> usize {
        self.queue.iter().map(|(_, list)| list.len()).sum()
    }

    /// Moves the plan out for materialisation.
    pub(crate) fn take_queue(self) -> Vec<(InstId, Vec<HookInvocation>)> {
        self.queue
    }
}

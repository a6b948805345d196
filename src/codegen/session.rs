//! Arena-backed state for one instrumentation run.
//!
//! Every `instrument` call gets its own session: an arena for run-scoped
//! allocations (wrapper names, interned strings) and counters describing
//! what the run did. The arena ties all run-scoped objects to a single
//! lifetime and is dropped wholesale when the run finishes.

use bumpalo::Bump;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;

/// Counters for one instrumentation run.
#[derive(Debug, Default, Clone)]
pub struct CodeGenStats {
    pub hooks_materialized: usize,
    pub intrinsics_lowered: usize,
    pub instructions_selected: usize,
    pub registers_allocated: usize,
    pub spills_generated: usize,
    pub payload_functions: usize,
}

impl fmt::Display for CodeGenStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} hooks, {} payload fns, {} intrinsics lowered, {} insts selected, {} regs, {} spills",
            self.hooks_materialized,
            self.payload_functions,
            self.intrinsics_lowered,
            self.instructions_selected,
            self.registers_allocated,
            self.spills_generated,
        )
    }
}

/// Per-run session: arena allocation plus statistics.
pub struct CodeGenSession<'arena> {
    arena: &'arena Bump,
    stats: RefCell<CodeGenStats>,
    interned: RefCell<HashMap<String, &'arena str>>,
}

impl<'arena> CodeGenSession<'arena> {
    pub fn new(arena: &'arena Bump) -> Self {
        CodeGenSession {
            arena,
            stats: RefCell::new(CodeGenStats::default()),
            interned: RefCell::new(HashMap::new()),
        }
    }

    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    /// Interns a string for the run's lifetime.
    pub fn intern_str(&self, s: &str) -> &'arena str {
        if let Some(interned) = self.interned.borrow().get(s) {
            return interned;
        }
        let interned = self.arena.alloc_str(s);
        self.interned.borrow_mut().insert(s.to_string(), interned);
        interned
    }

    pub fn record_hook_materialized(&self) {
        self.stats.borrow_mut().hooks_materialized += 1;
    }

    pub fn record_payload_function(&self) {
        self.stats.borrow_mut().payload_functions += 1;
    }

    pub fn record_intrinsic_lowered(&self) {
        self.stats.borrow_mut().intrinsics_lowered += 1;
    }

    pub fn record_instruction_selected(&self) {
        self.stats.borrow_mut().instructions_selected += 1;
    }

    pub fn record_register_allocated(&self) {
        self.stats.borrow_mut().registers_allocated += 1;
    }

    pub fn record_spill(&self) {
        self.stats.borrow_mut().spills_generated += 1;
    }

    pub fn stats(&self) -> CodeGenStats {
        self.stats.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_stable() {
        let arena = Bump::new();
        let session = CodeGenSession::new(&arena);
        let a = session.intern_str("__injected_0");
        let b = session.intern_str("__injected_0");
        assert_eq!(a.as_ptr(), b.as_ptr());
    }

    #[test]
    fn stats_accumulate() {
        let arena = Bump::new();
        let session = CodeGenSession::new(&arena);
        session.record_hook_materialized();
        session.record_instruction_selected();
        session.record_instruction_selected();
        let stats = session.stats();
        assert_eq!(stats.hooks_materialized, 1);
        assert_eq!(stats.instructions_selected, 2);
        assert!(stats.to_string().contains("1 hooks"));
    }
}

//! Loop control instructions.

use ahash::{AHashMap, AHashSet};

use super::{MakeImmRequest, RenameMode, instr::MakeImmChange, rename_arg, rename_out_var};
use crate::{
    arg::Arg,
    error::{CompileError, CompileResult},
    types::Var,
};

/// Tail transfer to the next iteration of the enclosing loop.
///
/// Carries the new bindings of the loop-carried variables and a parallel
/// `blocking` bitvector: a set bit means the next iteration may not start
/// until that binding's variable is closed. Bits whose variable is known
/// closed are pruned by make-immediate.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LoopContinue {
    pub loop_name: String,
    pub new_loop_vars: Vec<Arg>,
    pub blocking: Vec<bool>,
}

impl LoopContinue {
    pub fn new(loop_name: impl Into<String>, new_loop_vars: Vec<Arg>, blocking: Vec<bool>) -> CompileResult<Self> {
        if new_loop_vars.len() != blocking.len() {
            return Err(CompileError::internal(format!(
                "loop_continue binding/blocking length mismatch: {} vs {}",
                new_loop_vars.len(),
                blocking.len()
            )));
        }
        Ok(Self {
            loop_name: loop_name.into(),
            new_loop_vars,
            blocking,
        })
    }

    #[must_use]
    pub fn all_inputs(&self) -> Vec<Arg> {
        self.new_loop_vars.clone()
    }

    /// Variables gating the next iteration: bindings with a set bit.
    #[must_use]
    pub fn blocking_inputs(&self) -> Vec<Var> {
        self.new_loop_vars
            .iter()
            .zip(&self.blocking)
            .filter(|(_, blocking)| **blocking)
            .filter_map(|(arg, _)| arg.as_var())
            .cloned()
            .collect()
    }

    /// Requests pruning when any blocking bit's variable is known closed
    /// (or the binding is a constant, which is trivially closed).
    #[must_use]
    pub fn can_make_immediate(&self, closed: &AHashSet<String>, _wait_for_close: bool) -> Option<MakeImmRequest> {
        let any_prunable = self
            .new_loop_vars
            .iter()
            .zip(&self.blocking)
            .any(|(arg, blocking)| {
                *blocking
                    && match arg.as_var() {
                        Some(var) => closed.contains(&var.name),
                        None => true,
                    }
            });
        // Pruning needs no fetches; make_immediate rewrites the bitvector.
        any_prunable.then(MakeImmRequest::default)
    }

    /// Returns a copy of this instruction with closed bits cleared.
    pub fn make_immediate(&self, closed: &AHashSet<String>) -> MakeImmChange {
        let blocking = self
            .new_loop_vars
            .iter()
            .zip(&self.blocking)
            .map(|(arg, blocking)| {
                *blocking
                    && match arg.as_var() {
                        Some(var) => !closed.contains(&var.name),
                        None => false,
                    }
            })
            .collect();
        MakeImmChange {
            new_instrs: vec![super::instr::Instr::LoopContinue(Self {
                loop_name: self.loop_name.clone(),
                new_loop_vars: self.new_loop_vars.clone(),
                blocking,
            })],
        }
    }

    /// Read-refcounts on the new bindings.
    #[must_use]
    pub fn incr_vars(&self) -> (Vec<Var>, Vec<Var>) {
        let reads = self.new_loop_vars.iter().filter_map(Arg::as_var).cloned().collect();
        (reads, Vec::new())
    }

    pub fn rename_vars(&mut self, renames: &AHashMap<String, Arg>, _mode: RenameMode) {
        for arg in &mut self.new_loop_vars {
            rename_arg(arg, renames);
        }
    }
}

/// Terminal instruction abandoning the enclosing loop.
///
/// Has no inputs or outputs; it is side-effecting because eliding it
/// would change which iterations run. It carries the variables whose read
/// refcount must be dropped and whose write end must be closed when the
/// loop terminates.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LoopBreak {
    pub loop_name: String,
    /// Variables whose read refcount is released at loop termination.
    pub decrements: Vec<Var>,
    /// Variables whose write end is closed at loop termination.
    pub close_writes: Vec<Var>,
}

impl LoopBreak {
    #[must_use]
    pub fn new(loop_name: impl Into<String>, decrements: Vec<Var>, close_writes: Vec<Var>) -> Self {
        Self {
            loop_name: loop_name.into(),
            decrements,
            close_writes,
        }
    }

    pub fn rename_vars(&mut self, renames: &AHashMap<String, Arg>, _mode: RenameMode) {
        for var in self.decrements.iter_mut().chain(self.close_writes.iter_mut()) {
            rename_out_var(var, renames);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::types::{Alloc, DefKind, PrimKind, Type};

    use super::*;

    fn int_fut(name: &str) -> Var {
        Var::new(name, Type::PrimFuture(PrimKind::Int), Alloc::Stack, DefKind::LocalUser)
    }

    #[test]
    fn test_mismatched_lengths_rejected() {
        let err = LoopContinue::new("loop0", vec![Arg::int(1)], vec![true, false]).unwrap_err();
        assert!(matches!(err, CompileError::Internal { .. }));
    }

    #[test]
    fn test_prunes_closed_bits() {
        let a = int_fut("a");
        let b = int_fut("b");
        let cont = LoopContinue::new("loop0", vec![Arg::from(&a), Arg::from(&b)], vec![true, true]).unwrap();
        assert_eq!(cont.blocking_inputs().len(), 2);

        let mut closed = AHashSet::new();
        closed.insert("a".to_string());
        assert!(cont.can_make_immediate(&closed, false).is_some());
        let change = cont.make_immediate(&closed);
        let super::super::instr::Instr::LoopContinue(pruned) = &change.new_instrs[0] else {
            panic!("expected loop_continue replacement");
        };
        assert_eq!(pruned.blocking, vec![false, true]);
        assert_eq!(pruned.blocking_inputs(), vec![b]);

        // Nothing further to prune once the bit is cleared.
        assert!(pruned.can_make_immediate(&AHashSet::new(), false).is_none());
    }

    #[test]
    fn test_constant_bindings_never_block() {
        let cont = LoopContinue::new("loop0", vec![Arg::int(3)], vec![true]).unwrap();
        assert!(cont.blocking_inputs().is_empty());
        // A constant binding with a set bit is prunable.
        assert!(cont.can_make_immediate(&AHashSet::new(), false).is_some());
    }
}

//! Intermediate representation for the dataflow task engine.
//!
//! This module contains the instruction taxonomy, the semantic queries
//! optimizer passes make on instructions, the computed-value relation used
//! for common-subexpression elimination, and the program tree (functions,
//! blocks, continuations) the emitter builds.
//!
//! # Module Structure
//!
//! - `opcode` - Opcode enum for every instruction variant
//! - `value` - Computed values and result equivalences
//! - `builtin` - Sync/async builtin operator instructions
//! - `call` - Function, foreign, and external-process calls
//! - `loops` - Loop continue/break instructions
//! - `turbine` - Data-movement primitives (store/load/deref/array/struct/...)
//! - `instr` - The instruction sum type and its query dispatch
//! - `program` - Program/function/block tree with per-function block arena

pub use builtin::{Builtin, BuiltinOp};
pub use call::{ForeignCall, FunctionCall, LocalForeignCall, Redirects, RunExternal};
pub use instr::{Comment, Instr, MakeImmChange};
pub use loops::{LoopBreak, LoopContinue};
pub use opcode::Opcode;
pub use program::{
    Block, BlockId, BlockKind, CleanupAction, Conditional, Continuation, ForeachLoop, Function, Program, Statement,
    WaitStatement,
};
pub use turbine::TurbineOp;
pub use value::{ComputedValue, ResultVal, ValueTag, ValueTracker};

mod builtin;
mod call;
mod instr;
mod loops;
mod opcode;
mod program;
mod turbine;
mod value;

use ahash::AHashMap;

use crate::{arg::Arg, types::Var};

/// Execution locality of the task an instruction spawns.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, serde::Serialize, serde::Deserialize,
)]
#[strum(serialize_all = "snake_case")]
pub enum TaskMode {
    /// Executes inline in the emitting task; may not cross a task boundary
    /// that would require remote execution.
    Sync,
    /// Spawns a task pinned to the local worker.
    Local,
    /// Spawns a control task pinned to the local worker.
    LocalControl,
    /// Spawns a control task that may run anywhere.
    Control,
}

/// Suspension mode of a wait statement.
///
/// Only suspend-until-closed is modeled: the wait produces no task body of
/// its own, execution simply does not proceed past it until the listed
/// variables are closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, serde::Serialize, serde::Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum WaitMode {
    WaitOnly,
}

/// Keys of task properties attached to spawned tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, serde::Serialize, serde::Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum TaskPropKey {
    Priority,
    Parallelism,
    Location,
}

/// Properties attached to a spawned task: priority, parallelism, location.
///
/// Property values are arguments and count as instruction inputs, so the
/// optimizer sees them when it reasons about data flow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct TaskProps {
    pub priority: Option<Arg>,
    pub parallelism: Option<Arg>,
    pub location: Option<Arg>,
}

impl TaskProps {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True if no property is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.priority.is_none() && self.parallelism.is_none() && self.location.is_none()
    }

    /// The property value for `key`, if set.
    #[must_use]
    pub fn get(&self, key: TaskPropKey) -> Option<&Arg> {
        match key {
            TaskPropKey::Priority => self.priority.as_ref(),
            TaskPropKey::Parallelism => self.parallelism.as_ref(),
            TaskPropKey::Location => self.location.as_ref(),
        }
    }

    /// Sets the property value for `key`.
    pub fn set(&mut self, key: TaskPropKey, value: Arg) {
        match key {
            TaskPropKey::Priority => self.priority = Some(value),
            TaskPropKey::Parallelism => self.parallelism = Some(value),
            TaskPropKey::Location => self.location = Some(value),
        }
    }

    /// The set property values, in key order.
    pub fn args(&self) -> impl Iterator<Item = &Arg> {
        [self.priority.as_ref(), self.parallelism.as_ref(), self.location.as_ref()]
            .into_iter()
            .flatten()
    }

    /// Applies a rename map to the set property values.
    pub fn rename_vars(&mut self, renames: &AHashMap<String, Arg>) {
        for slot in [&mut self.priority, &mut self.parallelism, &mut self.location] {
            if let Some(arg) = slot {
                rename_arg(arg, renames);
            }
        }
    }
}

/// How completely an instruction initializes a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, serde::Serialize, serde::Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum InitDegree {
    /// The variable is fully assigned after this instruction.
    Full,
    /// The variable is partially assigned (e.g. one container slot).
    Partial,
}

/// Substitution mode for variable renaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RenameMode {
    /// Replace the variable identity everywhere it appears, including as
    /// an output. The replacement must be a variable reference.
    ReplaceVar,
    /// Replace references to the variable's storage (inputs and outputs).
    Reference,
    /// Replace only value reads; outputs are left alone.
    Value,
}

/// Which refcount a piggyback request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, serde::Serialize, serde::Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum RcKind {
    Readers,
    Writers,
}

/// Request returned by `can_make_immediate`: which async inputs to fetch
/// and which outputs to materialize as local values before calling
/// `make_immediate`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MakeImmRequest {
    /// Future outputs to materialize; `make_immediate` receives local
    /// variables standing in for them, in the same order.
    pub outputs: Vec<Var>,
    /// Future inputs whose values must be fetched, in the order
    /// `make_immediate` expects them.
    pub inputs: Vec<Var>,
}

/// Replaces a variable reference inside an argument, per the rename map.
pub(crate) fn rename_arg(arg: &mut Arg, renames: &AHashMap<String, Arg>) {
    if let Arg::Var(var) = arg
        && let Some(replacement) = renames.get(&var.name)
    {
        *arg = replacement.clone();
    }
}

/// Replaces an output variable, per the rename map.
///
/// Output positions can only hold variables, so non-variable replacements
/// are ignored.
pub(crate) fn rename_out_var(var: &mut Var, renames: &AHashMap<String, Arg>) {
    if let Some(Arg::Var(replacement)) = renames.get(&var.name) {
        *var = replacement.clone();
    }
}

#[cfg(test)]
mod tests {
    use crate::types::{Alloc, DefKind, PrimKind, Type};

    use super::*;

    #[test]
    fn test_task_props_args_in_key_order() {
        let mut props = TaskProps::new();
        assert!(props.is_empty());
        props.set(TaskPropKey::Location, Arg::str("rank0"));
        props.set(TaskPropKey::Priority, Arg::int(5));
        let args: Vec<&Arg> = props.args().collect();
        assert_eq!(args, vec![&Arg::int(5), &Arg::str("rank0")]);
    }

    #[test]
    fn test_rename_arg_replaces_by_name() {
        let old = Var::new("x", Type::PrimFuture(PrimKind::Int), Alloc::Stack, DefKind::LocalUser);
        let mut arg = Arg::from(&old);
        let mut renames = AHashMap::new();
        renames.insert("x".to_string(), Arg::int(7));
        rename_arg(&mut arg, &renames);
        assert_eq!(arg, Arg::int(7));
    }
}

//! The instruction sum type and its semantic query dispatch.
//!
//! Optimizer passes interrogate instructions exclusively through the
//! queries on [`Instr`]; each concrete family answers the queries that
//! are opcode-specific, while defaults (`modified_outputs`,
//! `can_change_timing`, the alias/mapping predicates) live here.

use std::fmt;

use ahash::{AHashMap, AHashSet};

use super::{
    InitDegree, MakeImmRequest, RcKind, RenameMode, TaskMode,
    builtin::Builtin,
    call::{ForeignCall, FunctionCall, LocalForeignCall, RunExternal},
    loops::{LoopBreak, LoopContinue},
    opcode::Opcode,
    turbine::TurbineOp,
    value::{ResultVal, ValueTracker},
};
use crate::{
    arg::Arg,
    diag::Diagnostics,
    error::{CompileError, CompileResult},
    foreign::ForeignRegistry,
    settings::Settings,
    types::{Alloc, Var},
};

/// Free-text comment preserved through optimization.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Comment {
    pub text: String,
}

/// Replacement produced by `make_immediate`: the instructions that take
/// the place of the transformed one.
#[derive(Debug, Clone, PartialEq)]
pub struct MakeImmChange {
    pub new_instrs: Vec<Instr>,
}

/// A dataflow instruction.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Instr {
    Comment(Comment),
    Builtin(Builtin),
    ForeignCall(ForeignCall),
    LocalForeignCall(LocalForeignCall),
    FunctionCall(FunctionCall),
    RunExternal(RunExternal),
    LoopContinue(LoopContinue),
    LoopBreak(LoopBreak),
    Turbine(TurbineOp),
}

impl Instr {
    /// The instruction's opcode.
    #[must_use]
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Comment(_) => Opcode::Comment,
            Self::Builtin(b) => b.op,
            Self::ForeignCall(_) => Opcode::CallForeign,
            Self::LocalForeignCall(_) => Opcode::CallForeignLocal,
            Self::FunctionCall(c) => c.op,
            Self::RunExternal(_) => Opcode::RunExternal,
            Self::LoopContinue(_) => Opcode::LoopContinue,
            Self::LoopBreak(_) => Opcode::LoopBreak,
            Self::Turbine(t) => t.op,
        }
    }

    /// All values read, including task properties when present.
    #[must_use]
    pub fn inputs(&self) -> Vec<Arg> {
        match self {
            Self::Comment(_) | Self::LoopBreak(_) => Vec::new(),
            Self::Builtin(b) => b.all_inputs(),
            Self::ForeignCall(c) => c.all_inputs(),
            Self::LocalForeignCall(c) => c.inputs.to_vec(),
            Self::FunctionCall(c) => c.all_inputs(),
            Self::RunExternal(r) => r.all_inputs(),
            Self::LoopContinue(l) => l.all_inputs(),
            Self::Turbine(t) => t.all_inputs(),
        }
    }

    /// All variables the instruction may mutate.
    #[must_use]
    pub fn outputs(&self) -> Vec<Var> {
        match self {
            Self::Comment(_) | Self::LoopContinue(_) | Self::LoopBreak(_) => Vec::new(),
            Self::Builtin(b) => b.outputs(),
            Self::ForeignCall(c) => c.outputs.clone(),
            Self::LocalForeignCall(c) => c.outputs.clone(),
            Self::FunctionCall(c) => c.outputs.clone(),
            Self::RunExternal(r) => r.outputs().to_vec(),
            Self::Turbine(t) => t.outputs(),
        }
    }

    /// The subset of outputs actually mutated. Defaults to all outputs.
    #[must_use]
    pub fn modified_outputs(&self) -> Vec<Var> {
        self.outputs()
    }

    /// Outputs whose prior value is read (e.g. mapped files).
    #[must_use]
    pub fn read_outputs(&self) -> Vec<Var> {
        match self {
            Self::RunExternal(r) => r.read_outputs(),
            Self::Turbine(t) => t.read_outputs(),
            _ => Vec::new(),
        }
    }

    /// Variables this instruction initializes, and how completely.
    #[must_use]
    pub fn initialized(&self) -> Vec<(Var, InitDegree)> {
        match self {
            Self::Comment(_) | Self::LoopContinue(_) | Self::LoopBreak(_) => Vec::new(),
            Self::Turbine(t) => t.initialized(),
            // Calls and operators fully assign each of their outputs.
            _ => self.outputs().into_iter().map(|v| (v, InitDegree::Full)).collect(),
        }
    }

    /// Variables the scheduler must wait on before firing this
    /// instruction's task.
    #[must_use]
    pub fn blocking_inputs(&self, _fns: &ForeignRegistry) -> Vec<Var> {
        match self {
            Self::Comment(_) | Self::LoopBreak(_) | Self::LocalForeignCall(_) | Self::RunExternal(_) => Vec::new(),
            Self::Builtin(b) => b.blocking_inputs(),
            Self::ForeignCall(c) => c.blocking_inputs(),
            Self::FunctionCall(c) => c.blocking_inputs(),
            Self::LoopContinue(l) => l.blocking_inputs(),
            Self::Turbine(t) => t.blocking_inputs(),
        }
    }

    /// Execution locality of the task this instruction spawns.
    #[must_use]
    pub fn mode(&self, fns: &ForeignRegistry) -> TaskMode {
        match self {
            Self::Comment(_)
            | Self::LoopContinue(_)
            | Self::LoopBreak(_)
            | Self::LocalForeignCall(_)
            | Self::RunExternal(_) => TaskMode::Sync,
            Self::Builtin(b) => b.mode(),
            Self::ForeignCall(c) => c.mode(fns),
            Self::FunctionCall(c) => c.mode(),
            Self::Turbine(t) => t.mode(),
        }
    }

    /// True if reordering or eliding this instruction changes observable
    /// behaviour beyond its outputs.
    #[must_use]
    pub fn has_side_effects(&self, fns: &ForeignRegistry) -> bool {
        match self {
            Self::Comment(_) => false,
            Self::Builtin(b) => b.has_side_effects(),
            Self::ForeignCall(c) => c.has_side_effects(fns),
            Self::LocalForeignCall(c) => c.has_side_effects(fns),
            // Composite callees are not tracked for purity.
            Self::FunctionCall(_) => true,
            Self::RunExternal(r) => r.has_side_effects(),
            Self::LoopContinue(_) | Self::LoopBreak(_) => true,
            Self::Turbine(t) => t.has_side_effects(),
        }
    }

    /// True if the instruction may run earlier or later than emitted.
    /// Defaults to the absence of side effects; timing-sensitive reads
    /// override it.
    #[must_use]
    pub fn can_change_timing(&self, fns: &ForeignRegistry) -> bool {
        match self {
            Self::Turbine(t) => t.can_change_timing(),
            _ => !self.has_side_effects(fns),
        }
    }

    /// True if repeated execution is equivalent to a single one.
    #[must_use]
    pub fn is_idempotent(&self, fns: &ForeignRegistry) -> bool {
        match self {
            Self::Comment(_) => true,
            Self::Builtin(b) => !b.has_side_effects(),
            Self::ForeignCall(c) => !c.has_side_effects(fns),
            Self::LocalForeignCall(c) => !c.has_side_effects(fns),
            Self::FunctionCall(_) | Self::LoopContinue(_) | Self::LoopBreak(_) => false,
            Self::RunExternal(r) => r.is_idempotent(),
            Self::Turbine(t) => t.is_idempotent(),
        }
    }

    /// True if any output is alias-allocated.
    #[must_use]
    pub fn writes_alias_var(&self) -> bool {
        self.outputs().iter().any(|v| v.alloc == Alloc::Alias)
    }

    /// True if any output carries a filename mapping.
    #[must_use]
    pub fn writes_mapped_var(&self) -> bool {
        self.outputs().iter().any(Var::is_mapped)
    }

    /// Attempts to fold this instruction's outputs to constants given the
    /// already-known constants.
    pub fn constant_fold(
        &self,
        known: &AHashMap<String, Arg>,
        diag: &mut dyn Diagnostics,
    ) -> Option<AHashMap<String, Arg>> {
        match self {
            Self::Builtin(b) => b.constant_fold(known, diag),
            _ => None,
        }
    }

    /// Attempts to replace this instruction with a simpler one (e.g. a
    /// short-circuited and/or becomes a copy).
    #[must_use]
    pub fn constant_replace(&self, known: &AHashMap<String, Arg>) -> Option<Self> {
        match self {
            Self::Builtin(b) => b.constant_replace(known).map(Self::Builtin),
            _ => None,
        }
    }

    /// If this instruction's async futures have known values, returns
    /// which inputs to fetch and which outputs to materialize.
    #[must_use]
    pub fn can_make_immediate(&self, closed: &AHashSet<String>, wait_for_close: bool) -> Option<MakeImmRequest> {
        match self {
            Self::Builtin(b) => b.can_make_immediate(closed, wait_for_close),
            Self::LoopContinue(l) => l.can_make_immediate(closed, wait_for_close),
            _ => None,
        }
    }

    /// Replaces this instruction with a synchronous form.
    ///
    /// `out_vars` and `in_vals` correspond positionally to the request
    /// returned by [`Instr::can_make_immediate`]; `closed` is the closed
    /// set the request was computed against.
    pub fn make_immediate(
        &self,
        out_vars: Vec<Var>,
        in_vals: Vec<Arg>,
        closed: &AHashSet<String>,
    ) -> CompileResult<MakeImmChange> {
        match self {
            Self::Builtin(b) => b.make_immediate(out_vars, in_vals),
            Self::LoopContinue(l) => Ok(l.make_immediate(closed)),
            _ => Err(CompileError::internal(format!(
                "make_immediate unsupported for {}",
                self.opcode()
            ))),
        }
    }

    /// Computed values this instruction publishes for CSE.
    #[must_use]
    pub fn results(&self, fns: &ForeignRegistry, tracker: &ValueTracker, settings: &Settings) -> Vec<ResultVal> {
        match self {
            Self::Builtin(b) => b.results(tracker, settings),
            Self::ForeignCall(c) => c.results(fns),
            Self::LocalForeignCall(c) => c.results(fns),
            Self::RunExternal(r) => r.results(),
            Self::Turbine(t) => t.results(),
            _ => Vec::new(),
        }
    }

    /// Refcounts this instruction claims: `(read-incrs, write-incrs)`.
    #[must_use]
    pub fn incr_vars(&self, fns: &ForeignRegistry) -> (Vec<Var>, Vec<Var>) {
        match self {
            Self::Builtin(b) => b.incr_vars(),
            Self::ForeignCall(c) => c.incr_vars(fns),
            Self::FunctionCall(c) => c.incr_vars(),
            Self::RunExternal(r) => r.incr_vars(),
            Self::LoopContinue(l) => l.incr_vars(),
            _ => (Vec::new(), Vec::new()),
        }
    }

    /// Absorbs pending refcount increments, returning the absorbed
    /// variables.
    pub fn try_piggyback(&mut self, counters: &AHashMap<String, i64>, kind: RcKind) -> Vec<Var> {
        match self {
            Self::Turbine(t) => t.try_piggyback(counters, kind),
            _ => Vec::new(),
        }
    }

    /// Declares an output as an alias into another variable:
    /// `(whole, part)`.
    #[must_use]
    pub fn component_alias(&self) -> Option<(Var, Var)> {
        match self {
            Self::Turbine(t) => t.component_alias(),
            _ => None,
        }
    }

    /// Substitutes variables per the rename map and mode.
    pub fn rename_vars(&mut self, renames: &AHashMap<String, Arg>, mode: RenameMode) {
        match self {
            Self::Comment(_) => {}
            Self::Builtin(b) => b.rename_vars(renames, mode),
            Self::ForeignCall(c) => c.rename_vars(renames, mode),
            Self::LocalForeignCall(c) => c.rename_vars(renames, mode),
            Self::FunctionCall(c) => c.rename_vars(renames, mode),
            Self::RunExternal(r) => r.rename_vars(renames, mode),
            Self::LoopContinue(l) => l.rename_vars(renames, mode),
            Self::LoopBreak(l) => l.rename_vars(renames, mode),
            Self::Turbine(t) => t.rename_vars(renames, mode),
        }
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Comment(c) => return write!(f, "# {}", c.text),
            Self::Builtin(b) => {
                write!(f, "{}:{}", b.op, b.subop)?;
            }
            Self::ForeignCall(c) => {
                write!(f, "{}:{}", Opcode::CallForeign, c.function)?;
            }
            Self::LocalForeignCall(c) => {
                write!(f, "{}:{}", Opcode::CallForeignLocal, c.function)?;
            }
            Self::FunctionCall(c) => {
                write!(f, "{}:{}", c.op, c.function)?;
            }
            Self::RunExternal(r) => {
                write!(f, "{}:{}", Opcode::RunExternal, r.cmd)?;
            }
            Self::LoopContinue(l) => {
                write!(f, "{}:{}", Opcode::LoopContinue, l.loop_name)?;
            }
            Self::LoopBreak(l) => {
                write!(f, "{}:{}", Opcode::LoopBreak, l.loop_name)?;
            }
            Self::Turbine(t) => {
                write!(f, "{}", t.op)?;
            }
        }
        f.write_str(" (")?;
        for (i, arg) in self.inputs().iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{arg}")?;
        }
        f.write_str(") -> (")?;
        for (i, out) in self.outputs().iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            f.write_str(&out.name)?;
        }
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use crate::types::{DefKind, PrimKind, Type};

    use super::{super::TaskProps, *};

    fn int_fut(name: &str) -> Var {
        Var::new(name, Type::PrimFuture(PrimKind::Int), Alloc::Stack, DefKind::LocalUser)
    }

    #[test]
    fn test_blocking_inputs_subset_of_future_inputs() {
        let fns = ForeignRegistry::with_specials();
        let x = int_fut("x");
        let a = int_fut("a");
        let instr = Instr::Builtin(super::super::Builtin::create_async(
            super::super::BuiltinOp::PlusInt,
            x,
            vec![Arg::from(&a), Arg::int(3)],
            TaskProps::new(),
        ));
        let blocking = instr.blocking_inputs(&fns);
        let future_inputs: Vec<Var> = instr
            .inputs()
            .iter()
            .filter_map(Arg::as_var)
            .filter(|v| v.blocks_reads())
            .cloned()
            .collect();
        assert!(blocking.iter().all(|v| future_inputs.contains(v)));
    }

    #[test]
    fn test_side_effect_monotone() {
        let fns = ForeignRegistry::with_specials();
        let instrs = [
            Instr::Comment(Comment {
                text: "hello".to_string(),
            }),
            Instr::Turbine(TurbineOp::store_scalar(int_fut("x"), Arg::int(1))),
            Instr::Turbine(TurbineOp::write_checkpoint(Arg::blob(vec![1]), Arg::blob(vec![2]))),
            Instr::LoopBreak(LoopBreak::new("loop0", Vec::new(), Vec::new())),
        ];
        for instr in &instrs {
            // can_change_timing implies no side effects.
            if instr.can_change_timing(&fns) {
                assert!(!instr.has_side_effects(&fns), "violated by {instr}");
            }
        }
    }

    #[test]
    fn test_writes_alias_flag_matches_outputs() {
        let arr = Var::new(
            "a",
            Type::array(Type::PrimFuture(PrimKind::Int), Type::PrimFuture(PrimKind::Int)),
            Alloc::Stack,
            DefKind::LocalUser,
        );
        let alias = Var::new(
            "alias0",
            Type::PrimFuture(PrimKind::Int),
            Alloc::Alias,
            DefKind::LocalCompiler,
        );
        let lookup = Instr::Turbine(TurbineOp::array_lookup_ref_imm(alias, &arr, Arg::int(0)));
        assert!(lookup.writes_alias_var());
        let store = Instr::Turbine(TurbineOp::store_scalar(int_fut("x"), Arg::int(1)));
        assert!(!store.writes_alias_var());
    }

    #[test]
    fn test_display_shape() {
        let x = int_fut("x");
        let instr = Instr::Builtin(super::super::Builtin::create_async(
            super::super::BuiltinOp::PlusInt,
            x,
            vec![Arg::int(2), Arg::int(3)],
            TaskProps::new(),
        ));
        assert_eq!(instr.to_string(), "async_op:plus_int (2, 3) -> (x)");
    }
}

//! Builtin operator instructions: `LocalOp` (sync, on local values) and
//! `AsyncOp` (the same operators applied to futures).

use ahash::AHashMap;
use smallvec::SmallVec;

use super::{
    MakeImmRequest, RenameMode, TaskMode, TaskProps,
    instr::MakeImmChange,
    opcode::Opcode,
    rename_arg, rename_out_var,
    value::{ComputedValue, ResultVal, ValueTag, ValueTracker},
};
use crate::{
    arg::{Arg, Lit},
    diag::Diagnostics,
    error::{CompileError, CompileResult},
    settings::Settings,
    types::{PrimKind, Var},
};

/// Operator applied by a builtin instruction.
///
/// The same operator is used by both the local and the async form; the
/// surrounding instruction's opcode distinguishes them.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::IntoStaticStr,
    serde::Serialize, serde::Deserialize,
)]
#[strum(serialize_all = "snake_case")]
pub enum BuiltinOp {
    // Integer arithmetic.
    PlusInt,
    MinusInt,
    MultInt,
    DivInt,
    ModInt,
    PowInt,
    NegInt,
    MaxInt,
    MinInt,
    AbsInt,

    // Float arithmetic.
    PlusFlt,
    MinusFlt,
    MultFlt,
    DivFlt,
    PowFlt,
    NegFlt,
    MaxFlt,
    MinFlt,
    AbsFlt,

    /// Reinterpret an integer as a float (used for integer literals
    /// assigned to float locations).
    IntToFlt,

    // Integer comparison.
    EqInt,
    NeqInt,
    LtInt,
    LteInt,
    GtInt,
    GteInt,

    // Float comparison.
    EqFlt,
    NeqFlt,
    LtFlt,
    LteFlt,
    GtFlt,
    GteFlt,

    // Boolean logic.
    And,
    Or,
    Not,
    Xor,

    // Strings.
    StrCat,
    EqStr,
    NeqStr,

    // Kind-directed copies.
    CopyInt,
    CopyFlt,
    CopyBool,
    CopyStr,
    CopyBlob,
    CopyVoid,

    // Compile-time-checkable assertions.
    Assert,
    AssertEq,
}

impl BuiltinOp {
    /// True if the operator's inputs may be reordered without changing
    /// the result, so computed values sort them canonically.
    #[must_use]
    pub fn commutative(&self) -> bool {
        matches!(
            self,
            Self::PlusInt
                | Self::MultInt
                | Self::MaxInt
                | Self::MinInt
                | Self::EqInt
                | Self::NeqInt
                | Self::PlusFlt
                | Self::MultFlt
                | Self::MaxFlt
                | Self::MinFlt
                | Self::EqFlt
                | Self::NeqFlt
                | Self::And
                | Self::Or
                | Self::Xor
                | Self::EqStr
                | Self::NeqStr
        )
    }

    /// The canonical direction for flippable comparisons: `a > b` keys as
    /// `b < a`, so both directions land on the same computed value.
    #[must_use]
    pub fn flipped(&self) -> Option<Self> {
        match self {
            Self::GtInt => Some(Self::LtInt),
            Self::GteInt => Some(Self::LteInt),
            Self::GtFlt => Some(Self::LtFlt),
            Self::GteFlt => Some(Self::LteFlt),
            _ => None,
        }
    }

    /// True for the kind-directed copy operators.
    #[must_use]
    pub fn is_copy(&self) -> bool {
        matches!(
            self,
            Self::CopyInt | Self::CopyFlt | Self::CopyBool | Self::CopyStr | Self::CopyBlob | Self::CopyVoid
        )
    }

    /// True for min/max, which are copy-equivalent on identical inputs.
    #[must_use]
    pub fn is_min_max(&self) -> bool {
        matches!(self, Self::MaxInt | Self::MinInt | Self::MaxFlt | Self::MinFlt)
    }

    /// True for the assert variants.
    #[must_use]
    pub fn is_assert(&self) -> bool {
        matches!(self, Self::Assert | Self::AssertEq)
    }

    /// The copy operator for a primitive kind, if the kind supports
    /// value copies.
    #[must_use]
    pub fn copy_for_kind(kind: PrimKind) -> Option<Self> {
        match kind {
            PrimKind::Int => Some(Self::CopyInt),
            PrimKind::Float => Some(Self::CopyFlt),
            PrimKind::Bool => Some(Self::CopyBool),
            PrimKind::String => Some(Self::CopyStr),
            PrimKind::Blob => Some(Self::CopyBlob),
            PrimKind::Void => Some(Self::CopyVoid),
            PrimKind::File => None,
        }
    }
}

/// A builtin operator instruction.
///
/// `LocalOp` computes on local values inline; `AsyncOp` applies the same
/// operator to futures and blocks on every primitive-future or reference
/// input. Assert variants have no output and perform compile-time checks
/// during constant folding.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Builtin {
    pub op: Opcode,
    pub subop: BuiltinOp,
    pub output: Option<Var>,
    pub inputs: SmallVec<[Arg; 4]>,
    /// Task properties; only meaningful for the async form.
    pub props: TaskProps,
}

impl Builtin {
    /// Creates a synchronous local-value operation.
    #[must_use]
    pub fn local(subop: BuiltinOp, output: Option<Var>, inputs: impl Into<SmallVec<[Arg; 4]>>) -> Self {
        Self {
            op: Opcode::LocalOp,
            subop,
            output,
            inputs: inputs.into(),
            props: TaskProps::new(),
        }
    }

    /// Creates an asynchronous operation on futures.
    #[must_use]
    pub fn create_async(
        subop: BuiltinOp,
        output: Var,
        inputs: impl Into<SmallVec<[Arg; 4]>>,
        props: TaskProps,
    ) -> Self {
        Self {
            op: Opcode::AsyncOp,
            subop,
            output: Some(output),
            inputs: inputs.into(),
            props,
        }
    }

    /// All values read, including task properties.
    #[must_use]
    pub fn all_inputs(&self) -> Vec<Arg> {
        self.inputs.iter().chain(self.props.args()).cloned().collect()
    }

    #[must_use]
    pub fn outputs(&self) -> Vec<Var> {
        self.output.iter().cloned().collect()
    }

    /// Future/ref inputs the scheduler waits on; the local form never
    /// blocks.
    #[must_use]
    pub fn blocking_inputs(&self) -> Vec<Var> {
        if self.op == Opcode::LocalOp {
            return Vec::new();
        }
        self.inputs
            .iter()
            .filter_map(Arg::as_var)
            .filter(|v| v.blocks_reads())
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn mode(&self) -> TaskMode {
        match self.op {
            Opcode::AsyncOp => TaskMode::Local,
            _ => TaskMode::Sync,
        }
    }

    #[must_use]
    pub fn has_side_effects(&self) -> bool {
        self.subop.is_assert()
    }

    /// Resolves each input to a constant using the argument itself or the
    /// known-constant map; `None` if any input is unresolved.
    fn resolved_consts(&self, known: &AHashMap<String, Arg>) -> Option<Vec<Lit>> {
        self.inputs
            .iter()
            .map(|arg| match arg {
                Arg::Const(lit) => Some(lit.clone()),
                Arg::Var(var) => known.get(&var.name)?.as_const().cloned(),
            })
            .collect()
    }

    /// Attempts to fold this operation to constants.
    ///
    /// Returns a map from output names to constant values when every
    /// input is known. Assert variants return an empty map when they
    /// check out (the instruction can be elided) and report a warning on
    /// a provable failure.
    pub fn constant_fold(
        &self,
        known: &AHashMap<String, Arg>,
        diag: &mut dyn Diagnostics,
    ) -> Option<AHashMap<String, Arg>> {
        let consts = self.resolved_consts(known)?;
        if self.subop.is_assert() {
            check_assert(self.subop, &consts, diag);
            return Some(AHashMap::new());
        }
        let folded = fold_value(self.subop, &consts)?;
        let out = self.output.as_ref()?;
        let mut result = AHashMap::new();
        result.insert(out.name.clone(), Arg::Const(folded));
        Some(result)
    }

    /// Attempts to replace this instruction with a simpler one given some
    /// known constants; e.g. a short-circuited and/or becomes a copy.
    #[must_use]
    pub fn constant_replace(&self, known: &AHashMap<String, Arg>) -> Option<Self> {
        if !matches!(self.subop, BuiltinOp::And | BuiltinOp::Or) || self.inputs.len() != 2 {
            return None;
        }
        let resolve = |arg: &Arg| -> Option<bool> {
            match arg {
                Arg::Const(Lit::Bool(b)) => Some(*b),
                Arg::Var(var) => match known.get(&var.name)? {
                    Arg::Const(Lit::Bool(b)) => Some(*b),
                    _ => None,
                },
                Arg::Const(_) => None,
            }
        };
        let output = self.output.clone()?;
        let lhs = resolve(&self.inputs[0]);
        let rhs = resolve(&self.inputs[1]);
        let (known_side, other) = match (lhs, rhs) {
            (Some(b), _) => (b, self.inputs[1].clone()),
            (_, Some(b)) => (b, self.inputs[0].clone()),
            (None, None) => return None,
        };
        let absorbing = match self.subop {
            BuiltinOp::And => !known_side,
            BuiltinOp::Or => known_side,
            _ => unreachable!("filtered above"),
        };
        let replacement_input = if absorbing {
            // false && x == false; true || x == true.
            Arg::bool_lit(known_side)
        } else {
            other
        };
        let copy = Self {
            op: self.op,
            subop: BuiltinOp::CopyBool,
            output: Some(output),
            inputs: SmallVec::from_vec(vec![replacement_input]),
            props: self.props.clone(),
        };
        Some(copy)
    }

    /// If all async future inputs are known closed, requests the fetches
    /// needed to run this operator synchronously.
    #[must_use]
    pub fn can_make_immediate(&self, closed: &ahash::AHashSet<String>, _wait_for_close: bool) -> Option<MakeImmRequest> {
        if self.op != Opcode::AsyncOp {
            return None;
        }
        let blocking = self.blocking_inputs();
        if blocking.iter().any(|v| !closed.contains(&v.name)) {
            return None;
        }
        Some(MakeImmRequest {
            outputs: self.outputs(),
            inputs: blocking,
        })
    }

    /// Replaces the async operator with its local-value form.
    ///
    /// `out_vars` are local variables standing in for the future outputs;
    /// `in_vals` are the fetched input values in request order.
    pub fn make_immediate(&self, out_vars: Vec<Var>, in_vals: Vec<Arg>) -> CompileResult<MakeImmChange> {
        if self.op != Opcode::AsyncOp {
            return Err(CompileError::internal(format!(
                "make_immediate on non-async builtin {}",
                self.subop
            )));
        }
        let blocking = self.blocking_inputs();
        if in_vals.len() != blocking.len() || out_vars.len() != self.outputs().len() {
            return Err(CompileError::internal(format!(
                "make_immediate arity mismatch for {}: {} fetched of {} blocking",
                self.subop,
                in_vals.len(),
                blocking.len()
            )));
        }
        // Substitute fetched values for the futures they stand in for.
        let mut fetched = blocking.iter().zip(in_vals).collect::<Vec<_>>();
        let new_inputs: SmallVec<[Arg; 4]> = self
            .inputs
            .iter()
            .map(|arg| match arg.as_var() {
                Some(var) if var.blocks_reads() => {
                    let pos = fetched
                        .iter()
                        .position(|(v, _)| v.name == var.name)
                        .expect("blocking input missing from fetch vector");
                    fetched.remove(pos).1
                }
                _ => arg.clone(),
            })
            .collect();
        let new_instr = Self::local(self.subop, out_vars.into_iter().next(), new_inputs);
        Ok(MakeImmChange {
            new_instrs: vec![super::instr::Instr::Builtin(new_instr)],
        })
    }

    /// Publishes computed values for this operation.
    ///
    /// Pure operators publish one value per output under the canonical
    /// input vector; copies (and min/max over identical inputs) publish a
    /// copy equivalence instead. With the algebra switch on, integer
    /// plus/minus additionally folds through a known `y = z +- c`.
    #[must_use]
    pub fn results(&self, tracker: &ValueTracker, settings: &Settings) -> Vec<ResultVal> {
        if self.has_side_effects() {
            return Vec::new();
        }
        let Some(out) = &self.output else { return Vec::new() };
        let out_arg = Arg::from(out);
        let mut results = Vec::new();

        if self.subop.is_copy() && self.inputs.len() == 1 {
            results.push(ResultVal::copy(out_arg, self.inputs[0].clone()));
            return results;
        }
        if self.subop.is_min_max() && self.inputs.len() == 2 && self.inputs[0] == self.inputs[1] {
            results.push(ResultVal::copy(out_arg, self.inputs[0].clone()));
            return results;
        }

        let value = match self.op {
            Opcode::LocalOp => ComputedValue::local_op(self.subop, self.inputs.to_vec()),
            _ => ComputedValue::async_op(self.subop, self.inputs.to_vec()),
        };
        results.push(ResultVal::new(out_arg.clone(), value));

        if settings.algebra {
            results.extend(self.algebra_results(tracker, &out_arg));
        }
        results
    }

    /// Algebraic inference for integer plus/minus: folds
    /// `x = y +- c1` with a known `y = z +- c2` into `x = z +- (c1 +- c2)`.
    fn algebra_results(&self, tracker: &ValueTracker, out_arg: &Arg) -> Vec<ResultVal> {
        let Some((y, c1)) = self.var_const_operands() else {
            return Vec::new();
        };
        let Some(prior) = tracker.computed_for(&y.name) else {
            return Vec::new();
        };
        let prior_op = match &prior.tag {
            ValueTag::LocalOp(op) | ValueTag::AsyncOp(op) => *op,
            _ => return Vec::new(),
        };
        let Some((z, c2)) = var_const_of(prior_op, &prior.inputs) else {
            return Vec::new();
        };
        let Some(offset) = c1.checked_add(c2) else {
            return Vec::new();
        };
        let rv = if offset == 0 {
            ResultVal::copy(out_arg.clone(), Arg::Var(z))
        } else {
            ResultVal::new(
                out_arg.clone(),
                ComputedValue {
                    tag: match self.op {
                        Opcode::LocalOp => ValueTag::LocalOp(BuiltinOp::PlusInt),
                        _ => ValueTag::AsyncOp(BuiltinOp::PlusInt),
                    },
                    inputs: canonical_plus(Arg::Var(z), offset),
                },
            )
        };
        vec![rv]
    }

    /// Extracts the (variable, signed constant) pair of this instruction's
    /// own integer plus/minus, if it has the right shape.
    fn var_const_operands(&self) -> Option<(Var, i64)> {
        if !matches!(self.subop, BuiltinOp::PlusInt | BuiltinOp::MinusInt) || self.inputs.len() != 2 {
            return None;
        }
        var_const_of(self.subop, &self.inputs)
    }

    /// Conservative refcount claims: readers on every future/ref input.
    #[must_use]
    pub fn incr_vars(&self) -> (Vec<Var>, Vec<Var>) {
        if self.op == Opcode::LocalOp {
            return (Vec::new(), Vec::new());
        }
        let reads = self
            .inputs
            .iter()
            .filter_map(Arg::as_var)
            .filter(|v| v.blocks_reads())
            .cloned()
            .collect();
        (reads, Vec::new())
    }

    pub fn rename_vars(&mut self, renames: &AHashMap<String, Arg>, mode: RenameMode) {
        for arg in &mut self.inputs {
            rename_arg(arg, renames);
        }
        self.props.rename_vars(renames);
        if mode != RenameMode::Value
            && let Some(out) = &mut self.output
        {
            rename_out_var(out, renames);
        }
    }
}

/// Extracts a (variable, signed offset) pair from a canonical plus/minus
/// input vector. For plus the constant may be on either side; for minus
/// only a trailing constant counts (a variable second operand is not
/// canonicalized).
fn var_const_of(op: BuiltinOp, inputs: &[Arg]) -> Option<(Var, i64)> {
    if inputs.len() != 2 {
        return None;
    }
    match op {
        BuiltinOp::PlusInt => match (&inputs[0], &inputs[1]) {
            (Arg::Var(v), Arg::Const(Lit::Int(c))) | (Arg::Const(Lit::Int(c)), Arg::Var(v)) => Some((v.clone(), *c)),
            _ => None,
        },
        BuiltinOp::MinusInt => match (&inputs[0], &inputs[1]) {
            (Arg::Var(v), Arg::Const(Lit::Int(c))) => c.checked_neg().map(|n| (v.clone(), n)),
            _ => None,
        },
        _ => None,
    }
}

/// Canonical `z + offset` input vector (constants sort first).
fn canonical_plus(z: Arg, offset: i64) -> Vec<Arg> {
    let mut inputs = vec![Arg::int(offset), z];
    inputs.sort_by(Arg::canonical_cmp);
    inputs
}

/// Checks an assert over constant inputs, warning on provable failure.
fn check_assert(op: BuiltinOp, consts: &[Lit], diag: &mut dyn Diagnostics) {
    match op {
        BuiltinOp::Assert => {
            if let [Lit::Bool(cond), msg] = consts
                && !cond
            {
                diag.warn(None, format!("assertion will always fail at runtime: {msg}"));
            }
        }
        BuiltinOp::AssertEq => {
            if let [a, b, msg] = consts
                && a != b
            {
                diag.warn(
                    None,
                    format!("assertion will always fail at runtime: {a} != {b}: {msg}"),
                );
            }
        }
        _ => {}
    }
}

/// Evaluates a pure operator over constants. Returns `None` when the
/// result is undefined (division by zero, overflow) so the instruction is
/// left for the runtime to fail on.
pub(crate) fn fold_value(op: BuiltinOp, consts: &[Lit]) -> Option<Lit> {
    use BuiltinOp as B;
    use Lit::{Bool, Float, Int, Str};
    let lit = match (op, consts) {
        (B::PlusInt, [Int(a), Int(b)]) => Int(a.checked_add(*b)?),
        (B::MinusInt, [Int(a), Int(b)]) => Int(a.checked_sub(*b)?),
        (B::MultInt, [Int(a), Int(b)]) => Int(a.checked_mul(*b)?),
        (B::DivInt, [Int(a), Int(b)]) => Int(a.checked_div(*b)?),
        (B::ModInt, [Int(a), Int(b)]) => Int(a.checked_rem(*b)?),
        (B::PowInt, [Int(a), Int(b)]) => Int(a.checked_pow(u32::try_from(*b).ok()?)?),
        (B::NegInt, [Int(a)]) => Int(a.checked_neg()?),
        (B::MaxInt, [Int(a), Int(b)]) => Int(*a.max(b)),
        (B::MinInt, [Int(a), Int(b)]) => Int(*a.min(b)),
        (B::AbsInt, [Int(a)]) => Int(a.checked_abs()?),

        (B::PlusFlt, [Float(a), Float(b)]) => Float(a + b),
        (B::MinusFlt, [Float(a), Float(b)]) => Float(a - b),
        (B::MultFlt, [Float(a), Float(b)]) => Float(a * b),
        (B::DivFlt, [Float(a), Float(b)]) => Float(a / b),
        (B::PowFlt, [Float(a), Float(b)]) => Float(a.powf(*b)),
        (B::NegFlt, [Float(a)]) => Float(-a),
        (B::MaxFlt, [Float(a), Float(b)]) => Float(a.max(*b)),
        (B::MinFlt, [Float(a), Float(b)]) => Float(a.min(*b)),
        (B::AbsFlt, [Float(a)]) => Float(a.abs()),

        (B::IntToFlt, [Int(a)]) => Float(*a as f64),

        (B::EqInt, [Int(a), Int(b)]) => Bool(a == b),
        (B::NeqInt, [Int(a), Int(b)]) => Bool(a != b),
        (B::LtInt, [Int(a), Int(b)]) => Bool(a < b),
        (B::LteInt, [Int(a), Int(b)]) => Bool(a <= b),
        (B::GtInt, [Int(a), Int(b)]) => Bool(a > b),
        (B::GteInt, [Int(a), Int(b)]) => Bool(a >= b),

        (B::EqFlt, [Float(a), Float(b)]) => Bool(a == b),
        (B::NeqFlt, [Float(a), Float(b)]) => Bool(a != b),
        (B::LtFlt, [Float(a), Float(b)]) => Bool(a < b),
        (B::LteFlt, [Float(a), Float(b)]) => Bool(a <= b),
        (B::GtFlt, [Float(a), Float(b)]) => Bool(a > b),
        (B::GteFlt, [Float(a), Float(b)]) => Bool(a >= b),

        (B::And, [Bool(a), Bool(b)]) => Bool(*a && *b),
        (B::Or, [Bool(a), Bool(b)]) => Bool(*a || *b),
        (B::Not, [Bool(a)]) => Bool(!a),
        (B::Xor, [Bool(a), Bool(b)]) => Bool(a != b),

        (B::StrCat, [Str(a), Str(b)]) => Str(format!("{a}{b}")),
        (B::EqStr, [Str(a), Str(b)]) => Bool(a == b),
        (B::NeqStr, [Str(a), Str(b)]) => Bool(a != b),

        (op, [single]) if op.is_copy() => single.clone(),

        _ => return None,
    };
    Some(lit)
}

#[cfg(test)]
mod tests {
    use crate::{
        diag::CollectDiagnostics,
        types::{Alloc, DefKind, PrimKind, Type},
    };

    use super::*;

    fn int_fut(name: &str) -> Var {
        Var::new(name, Type::PrimFuture(PrimKind::Int), Alloc::Stack, DefKind::LocalUser)
    }

    fn bool_fut(name: &str) -> Var {
        Var::new(name, Type::PrimFuture(PrimKind::Bool), Alloc::Stack, DefKind::LocalUser)
    }

    #[test]
    fn test_fold_integer_plus() {
        let x = int_fut("x");
        let instr = Builtin::create_async(
            BuiltinOp::PlusInt,
            x,
            vec![Arg::int(2), Arg::int(3)],
            TaskProps::new(),
        );
        let mut diag = CollectDiagnostics::new();
        let folded = instr.constant_fold(&AHashMap::new(), &mut diag).unwrap();
        assert_eq!(folded.get("x"), Some(&Arg::int(5)));
    }

    #[test]
    fn test_fold_refuses_division_by_zero() {
        let x = int_fut("x");
        let instr = Builtin::create_async(
            BuiltinOp::DivInt,
            x,
            vec![Arg::int(1), Arg::int(0)],
            TaskProps::new(),
        );
        let mut diag = CollectDiagnostics::new();
        assert!(instr.constant_fold(&AHashMap::new(), &mut diag).is_none());
    }

    #[test]
    fn test_assert_warns_on_provable_failure() {
        let instr = Builtin::local(
            BuiltinOp::Assert,
            None,
            vec![Arg::bool_lit(false), Arg::str("boom")],
        );
        let mut diag = CollectDiagnostics::new();
        let folded = instr.constant_fold(&AHashMap::new(), &mut diag).unwrap();
        assert!(folded.is_empty());
        assert!(diag.has_warning_containing("always fail"));
    }

    #[test]
    fn test_short_circuit_and_becomes_copy() {
        let x = bool_fut("x");
        let a = bool_fut("a");
        let t = bool_fut("t");
        let instr = Builtin::create_async(
            BuiltinOp::And,
            x.clone(),
            vec![Arg::from(&a), Arg::from(&t)],
            TaskProps::new(),
        );
        let mut known = AHashMap::new();
        known.insert("t".to_string(), Arg::bool_lit(true));
        let replaced = instr.constant_replace(&known).unwrap();
        assert_eq!(replaced.subop, BuiltinOp::CopyBool);
        assert_eq!(replaced.output, Some(x));
        assert_eq!(replaced.inputs.to_vec(), vec![Arg::from(&a)]);
    }

    #[test]
    fn test_short_circuit_and_false_becomes_const_copy() {
        let x = bool_fut("x");
        let a = bool_fut("a");
        let instr = Builtin::create_async(
            BuiltinOp::And,
            x,
            vec![Arg::from(&a), Arg::bool_lit(false)],
            TaskProps::new(),
        );
        let replaced = instr.constant_replace(&AHashMap::new()).unwrap();
        assert_eq!(replaced.inputs.to_vec(), vec![Arg::bool_lit(false)]);
    }

    #[test]
    fn test_make_immediate_coherence() {
        // Async plus whose inputs are closed futures becomes a local op
        // over the fetched values.
        let x = int_fut("x");
        let a = int_fut("a");
        let b = int_fut("b");
        let instr = Builtin::create_async(
            BuiltinOp::PlusInt,
            x,
            vec![Arg::from(&a), Arg::from(&b)],
            TaskProps::new(),
        );
        let mut closed = ahash::AHashSet::new();
        closed.insert("a".to_string());
        closed.insert("b".to_string());
        let req = instr.can_make_immediate(&closed, false).unwrap();
        assert_eq!(req.inputs.len(), 2);
        assert_eq!(req.outputs.len(), 1);

        let out_local = Var::new("v0", Type::PrimValue(PrimKind::Int), Alloc::Local, DefKind::LocalCompiler);
        let change = instr
            .make_immediate(vec![out_local], vec![Arg::int(1), Arg::int(2)])
            .unwrap();
        assert_eq!(change.new_instrs.len(), 1);
        let super::super::instr::Instr::Builtin(new_instr) = &change.new_instrs[0] else {
            panic!("expected builtin replacement");
        };
        assert_eq!(new_instr.op, Opcode::LocalOp);
        // Every input of the replacement is a local value.
        assert!(new_instr.inputs.iter().all(|arg| arg.ty().is_prim_value()));
    }

    #[test]
    fn test_min_max_identical_inputs_is_copy() {
        let x = int_fut("x");
        let a = int_fut("a");
        let instr = Builtin::create_async(
            BuiltinOp::MaxInt,
            x.clone(),
            vec![Arg::from(&a), Arg::from(&a)],
            TaskProps::new(),
        );
        let results = instr.results(&ValueTracker::new(), &Settings::new());
        assert_eq!(results, vec![ResultVal::copy(Arg::from(&x), Arg::from(&a))]);
    }

    #[test]
    fn test_algebra_folds_offsets() {
        let settings = Settings {
            algebra: true,
            ..Settings::new()
        };
        let y = int_fut("y");
        let z = int_fut("z");
        let x = int_fut("x");
        let mut tracker = ValueTracker::new();
        // y = z + 2
        let prior = Builtin::create_async(
            BuiltinOp::PlusInt,
            y.clone(),
            vec![Arg::from(&z), Arg::int(2)],
            TaskProps::new(),
        );
        for rv in prior.results(&tracker, &settings) {
            tracker.insert(rv);
        }
        // x = y - 2 folds to a copy of z.
        let instr = Builtin::create_async(
            BuiltinOp::MinusInt,
            x.clone(),
            vec![Arg::from(&y), Arg::int(2)],
            TaskProps::new(),
        );
        let results = instr.results(&tracker, &settings);
        assert!(
            results.contains(&ResultVal::copy(Arg::from(&x), Arg::from(&z))),
            "expected copy equivalence, got {results:?}"
        );
    }

    #[test]
    fn test_idempotent_outputs_disjoint_from_inputs() {
        let x = int_fut("x");
        let a = int_fut("a");
        let instr = Builtin::create_async(
            BuiltinOp::PlusInt,
            x,
            vec![Arg::from(&a), Arg::int(1)],
            TaskProps::new(),
        );
        let outputs = instr.outputs();
        assert!(
            instr
                .all_inputs()
                .iter()
                .filter_map(Arg::as_var)
                .all(|v| !outputs.contains(v))
        );
    }
}

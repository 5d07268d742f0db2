//! Computed values: canonical symbolic descriptions of instruction outputs.
//!
//! Pure, deterministic instructions publish one [`ResultVal`] per output.
//! The value half is a [`ComputedValue`] keyed on the opcode (or a
//! synthetic tag for cross-opcode equivalences such as filenames and array
//! sizes) plus a canonical input vector: commutative operators sort their
//! inputs, flippable comparisons canonicalize direction. Two instructions
//! that compute the same key compute the same value, which is what
//! common-subexpression elimination relies on.

use ahash::AHashMap;

use super::{builtin::BuiltinOp, opcode::Opcode};
use crate::arg::Arg;

/// Discriminates what relation a computed value describes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ValueTag {
    /// Keyed on a data-movement opcode (loads, lookups, dereferences).
    Op(Opcode),
    /// A pure operator applied to local values.
    LocalOp(BuiltinOp),
    /// A pure operator applied to futures.
    AsyncOp(BuiltinOp),
    /// Output `out` of a pure foreign function call.
    Foreign { function: String, out: u32 },
    /// Output `out` of a pure local foreign function call. Kept distinct
    /// from [`ValueTag::Foreign`] because the locations differ in storage
    /// (local value vs. future).
    ForeignLocal { function: String, out: u32 },
    /// Output file `out` of a deterministic external command.
    External { cmd: String, out: u32 },
    /// The location is a copy of the single input; copy equivalences
    /// propagate transitively through the tracker.
    Copy,
    /// The location holds the filename of the single file-typed input.
    FilenameOf,
    /// The location holds the size of the single array-typed input.
    ArraySize,
    /// The location holds the runtime argument named by the single input.
    ArgvVal,
}

/// A canonical symbolic value: tag plus canonical input vector.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ComputedValue {
    pub tag: ValueTag,
    pub inputs: Vec<Arg>,
}

impl ComputedValue {
    /// A value keyed on a data-movement opcode; inputs are not reordered.
    #[must_use]
    pub fn op(op: Opcode, inputs: Vec<Arg>) -> Self {
        Self {
            tag: ValueTag::Op(op),
            inputs,
        }
    }

    /// A local builtin operator value, canonicalized.
    #[must_use]
    pub fn local_op(op: BuiltinOp, inputs: Vec<Arg>) -> Self {
        let (op, inputs) = canonicalize_builtin(op, inputs);
        Self {
            tag: ValueTag::LocalOp(op),
            inputs,
        }
    }

    /// An async builtin operator value, canonicalized.
    #[must_use]
    pub fn async_op(op: BuiltinOp, inputs: Vec<Arg>) -> Self {
        let (op, inputs) = canonicalize_builtin(op, inputs);
        Self {
            tag: ValueTag::AsyncOp(op),
            inputs,
        }
    }

    /// Output `out` of a pure foreign call; inputs sorted when the
    /// function is commutative.
    #[must_use]
    pub fn foreign(function: impl Into<String>, out: u32, mut inputs: Vec<Arg>, commutative: bool) -> Self {
        if commutative {
            inputs.sort_by(Arg::canonical_cmp);
        }
        Self {
            tag: ValueTag::Foreign {
                function: function.into(),
                out,
            },
            inputs,
        }
    }

    /// Output `out` of a pure local foreign call; inputs sorted when the
    /// function is commutative.
    #[must_use]
    pub fn foreign_local(function: impl Into<String>, out: u32, mut inputs: Vec<Arg>, commutative: bool) -> Self {
        if commutative {
            inputs.sort_by(Arg::canonical_cmp);
        }
        Self {
            tag: ValueTag::ForeignLocal {
                function: function.into(),
                out,
            },
            inputs,
        }
    }

    /// A copy equivalence: the location mirrors `src`.
    #[must_use]
    pub fn copy_of(src: Arg) -> Self {
        Self {
            tag: ValueTag::Copy,
            inputs: vec![src],
        }
    }

    /// A filename equivalence for a file variable.
    #[must_use]
    pub fn filename_of(file: Arg) -> Self {
        Self {
            tag: ValueTag::FilenameOf,
            inputs: vec![file],
        }
    }

    /// An array-size equivalence for an array variable.
    #[must_use]
    pub fn array_size(array: Arg) -> Self {
        Self {
            tag: ValueTag::ArraySize,
            inputs: vec![array],
        }
    }

    /// True for copy equivalences.
    #[must_use]
    pub fn is_copy(&self) -> bool {
        self.tag == ValueTag::Copy
    }
}

/// Sorts commutative inputs and canonicalizes flippable comparison
/// direction, so `a <= b` and `b >= a` key identically.
fn canonicalize_builtin(op: BuiltinOp, mut inputs: Vec<Arg>) -> (BuiltinOp, Vec<Arg>) {
    let op = match op.flipped() {
        Some(flipped) => {
            inputs.reverse();
            flipped
        }
        None => op,
    };
    if op.commutative() {
        inputs.sort_by(Arg::canonical_cmp);
    }
    (op, inputs)
}

/// A published equivalence: `location` holds `value`.
///
/// `location` is either an output variable or, after folding, a constant.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ResultVal {
    pub location: Arg,
    pub value: ComputedValue,
}

impl ResultVal {
    #[must_use]
    pub fn new(location: Arg, value: ComputedValue) -> Self {
        Self { location, value }
    }

    /// A copy equivalence `dst <- src`.
    #[must_use]
    pub fn copy(dst: Arg, src: Arg) -> Self {
        Self {
            location: dst,
            value: ComputedValue::copy_of(src),
        }
    }
}

/// Accumulates published result values for congruence queries.
///
/// The map closes under copy equivalence: looking up a value first
/// canonicalizes its inputs through recorded copies, and the location
/// returned is itself canonicalized. Algebraic inference reads back the
/// recorded computed value of a variable via [`ValueTracker::computed_for`].
#[derive(Debug, Clone, Default)]
pub struct ValueTracker {
    /// Canonical location for each computed value (first publisher wins).
    by_value: AHashMap<ComputedValue, Arg>,
    /// The computed value recorded for each variable location.
    by_var: AHashMap<String, ComputedValue>,
    /// Copy chains: variable name to its canonical source.
    copy_of: AHashMap<String, Arg>,
}

impl ValueTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a published result value.
    pub fn insert(&mut self, rv: ResultVal) {
        let canonical_value = self.canonical_value(&rv.value);
        if canonical_value.is_copy() {
            if let Arg::Var(dst) = &rv.location {
                let src = self.canonical(&canonical_value.inputs[0]);
                self.copy_of.insert(dst.name.clone(), src);
            }
            return;
        }
        let location = self.canonical(&rv.location);
        if let Arg::Var(var) = &location {
            self.by_var.insert(var.name.clone(), canonical_value.clone());
        }
        self.by_value.entry(canonical_value).or_insert(location);
    }

    /// The canonical location computing `value`, if one was recorded.
    #[must_use]
    pub fn lookup(&self, value: &ComputedValue) -> Option<&Arg> {
        self.by_value.get(&self.canonical_value(value))
    }

    /// The computed value recorded for a variable, if any.
    #[must_use]
    pub fn computed_for(&self, var_name: &str) -> Option<&ComputedValue> {
        self.by_var.get(var_name)
    }

    /// Chases copy chains to the canonical representative of `arg`.
    #[must_use]
    pub fn canonical(&self, arg: &Arg) -> Arg {
        let mut current = arg.clone();
        // Chains are short; the bound guards against accidental cycles.
        for _ in 0..64 {
            let Arg::Var(var) = &current else { break };
            match self.copy_of.get(&var.name) {
                Some(next) => current = next.clone(),
                None => break,
            }
        }
        current
    }

    /// Rewrites a value's inputs through copy chains.
    fn canonical_value(&self, value: &ComputedValue) -> ComputedValue {
        if self.copy_of.is_empty() {
            return value.clone();
        }
        ComputedValue {
            tag: value.tag.clone(),
            inputs: value.inputs.iter().map(|arg| self.canonical(arg)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::types::{Alloc, DefKind, PrimKind, Type, Var};

    use super::*;

    fn int_fut(name: &str) -> Var {
        Var::new(name, Type::PrimFuture(PrimKind::Int), Alloc::Stack, DefKind::LocalUser)
    }

    #[test]
    fn test_commutative_inputs_sorted() {
        let a = Arg::from(&int_fut("a"));
        let b = Arg::from(&int_fut("b"));
        let ab = ComputedValue::async_op(BuiltinOp::PlusInt, vec![a.clone(), b.clone()]);
        let ba = ComputedValue::async_op(BuiltinOp::PlusInt, vec![b, a]);
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_flippable_comparison_canonicalized() {
        let a = Arg::from(&int_fut("a"));
        let b = Arg::from(&int_fut("b"));
        // a <= b and b >= a are the same value.
        let lte = ComputedValue::async_op(BuiltinOp::LteInt, vec![a.clone(), b.clone()]);
        let gte = ComputedValue::async_op(BuiltinOp::GteInt, vec![b, a]);
        assert_eq!(lte, gte);
    }

    #[test]
    fn test_non_commutative_inputs_kept() {
        let a = Arg::from(&int_fut("a"));
        let b = Arg::from(&int_fut("b"));
        let ab = ComputedValue::async_op(BuiltinOp::MinusInt, vec![a.clone(), b.clone()]);
        let ba = ComputedValue::async_op(BuiltinOp::MinusInt, vec![b, a]);
        assert_ne!(ab, ba);
    }

    #[test]
    fn test_tracker_closes_under_copies() {
        let a = int_fut("a");
        let b = int_fut("b");
        let x = int_fut("x");
        let mut tracker = ValueTracker::new();
        // b is a copy of a.
        tracker.insert(ResultVal::copy(Arg::from(&b), Arg::from(&a)));
        // x = a + 1.
        tracker.insert(ResultVal::new(
            Arg::from(&x),
            ComputedValue::async_op(BuiltinOp::PlusInt, vec![Arg::from(&a), Arg::int(1)]),
        ));
        // A lookup phrased in terms of b resolves through the copy.
        let through_copy = ComputedValue::async_op(BuiltinOp::PlusInt, vec![Arg::from(&b), Arg::int(1)]);
        assert_eq!(tracker.lookup(&through_copy), Some(&Arg::from(&x)));
        assert_eq!(tracker.canonical(&Arg::from(&b)), Arg::from(&a));
    }
}

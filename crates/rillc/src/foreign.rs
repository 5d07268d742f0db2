//! Registry of foreign (builtin) functions and their middle-end metadata.
//!
//! Foreign functions are implemented by the runtime; the middle end only
//! needs to know how calls to them behave: where their tasks run, whether
//! they are pure (so calls publish computed values), whether a call is
//! equivalent to a copy or to a builtin operator, and whether the function
//! is one of the special identities the optimizer understands.

use ahash::AHashMap;

use crate::ir::{BuiltinOp, TaskMode};

/// Foreign functions with special computed-value semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, serde::Serialize, serde::Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum SpecialFn {
    /// `range(start, end)` builds a dense integer-keyed array.
    Range,
    /// `range_step(start, end, step)` with an explicit stride.
    RangeStep,
    /// `size(arr)` publishes an array-size equivalence.
    Size,
    /// `input_file(path)` publishes a filename equivalence.
    InputFile,
    /// `uncached_input_file(path)`: filename equivalence, never pure.
    UncachedInputFile,
    /// `input_url(url)`: filename equivalence for fetched files.
    InputUrl,
    /// `argv(name)` is resolvable at compile time when the driver
    /// provides the argument table.
    Argv,
    /// `assert(cond, msg)`.
    Assert,
    /// `assert_eq(a, b, msg)`.
    AssertEq,
}

impl SpecialFn {
    /// Resolves a function name to its special identity.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "range" => Some(Self::Range),
            "range_step" => Some(Self::RangeStep),
            "size" => Some(Self::Size),
            "input_file" => Some(Self::InputFile),
            "uncached_input_file" => Some(Self::UncachedInputFile),
            "input_url" => Some(Self::InputUrl),
            "argv" => Some(Self::Argv),
            "assert" => Some(Self::Assert),
            "assert_eq" => Some(Self::AssertEq),
            _ => None,
        }
    }

    /// True for the assert variants elided under `disable_asserts`.
    #[must_use]
    pub fn is_assert_variant(self) -> bool {
        matches!(self, Self::Assert | Self::AssertEq)
    }
}

/// Middle-end metadata for one foreign function.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ForeignFn {
    pub name: String,
    /// Where tasks spawned for this function run.
    pub mode: TaskMode,
    /// Pure calls publish one computed value per output.
    pub pure: bool,
    /// Inputs may be reordered in the computed-value key.
    pub commutative: bool,
    /// The function self-identifies as a copy (single input, outputs
    /// mirror it).
    pub is_copy: bool,
    /// Min/max shape: copy-equivalent when both inputs are identical.
    pub is_min_max: bool,
    /// The function never reads its outputs' prior values (affects the
    /// read-refcounts calls claim on outputs).
    pub output_write_only: bool,
    /// Special computed-value identity, if any.
    pub special: Option<SpecialFn>,
    /// Builtin operator this function is equivalent to, if any; calls to
    /// it lower to `AsyncOp` instead of a foreign call.
    pub op_equivalent: Option<BuiltinOp>,
}

impl ForeignFn {
    /// A foreign function with default metadata: control-task mode,
    /// impure, no equivalences.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            special: SpecialFn::from_name(&name),
            name,
            mode: TaskMode::Control,
            pure: false,
            commutative: false,
            is_copy: false,
            is_min_max: false,
            output_write_only: true,
            op_equivalent: None,
        }
    }

    #[must_use]
    pub fn pure_fn(name: impl Into<String>) -> Self {
        Self {
            pure: true,
            ..Self::new(name)
        }
    }
}

/// Table of foreign functions, plus the compile-time argv values the
/// driver passes through for `argv()` folding.
#[derive(Debug, Clone, Default)]
pub struct ForeignRegistry {
    fns: AHashMap<String, ForeignFn>,
    argv: AHashMap<String, String>,
}

impl ForeignRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-populated with the special foreign functions.
    #[must_use]
    pub fn with_specials() -> Self {
        let mut reg = Self::new();
        for name in ["range", "range_step", "size", "input_file", "input_url", "argv"] {
            reg.register(ForeignFn::pure_fn(name));
        }
        reg.register(ForeignFn::new("uncached_input_file"));
        reg.register(ForeignFn::new("assert"));
        reg.register(ForeignFn::new("assert_eq"));
        reg
    }

    /// Registers (or replaces) a foreign function.
    pub fn register(&mut self, f: ForeignFn) {
        self.fns.insert(f.name.clone(), f);
    }

    /// Looks up a foreign function's metadata.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ForeignFn> {
        self.fns.get(name)
    }

    /// Provides a compile-time value for a runtime argument.
    pub fn set_argv(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.argv.insert(name.into(), value.into());
    }

    /// The compile-time value of a runtime argument, if known.
    #[must_use]
    pub fn argv_value(&self, name: &str) -> Option<&str> {
        self.argv.get(name).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_special_resolution() {
        assert_eq!(SpecialFn::from_name("range"), Some(SpecialFn::Range));
        assert_eq!(SpecialFn::from_name("frobnicate"), None);
        assert!(SpecialFn::AssertEq.is_assert_variant());
        assert!(!SpecialFn::Size.is_assert_variant());
    }

    #[test]
    fn test_registry_defaults() {
        let reg = ForeignRegistry::with_specials();
        let range = reg.get("range").unwrap();
        assert!(range.pure);
        assert_eq!(range.special, Some(SpecialFn::Range));
        assert!(reg.get("uncached_input_file").is_some());
        assert!(!reg.get("uncached_input_file").unwrap().pure);
    }

    #[test]
    fn test_argv_table() {
        let mut reg = ForeignRegistry::new();
        reg.set_argv("n", "100");
        assert_eq!(reg.argv_value("n"), Some("100"));
        assert_eq!(reg.argv_value("m"), None);
    }
}

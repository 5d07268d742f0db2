//! Call instructions: user functions, foreign functions, and external
//! processes.

use ahash::AHashMap;
use smallvec::SmallVec;

use super::{
    RenameMode, TaskMode, TaskProps,
    opcode::Opcode,
    rename_arg, rename_out_var,
    value::{ComputedValue, ResultVal, ValueTag},
};
use crate::{
    arg::{Arg, Lit},
    foreign::{ForeignRegistry, SpecialFn},
    types::Var,
};

/// Call of a user-defined (composite) function.
///
/// The opcode fixes the spawn mode: `CallSync` executes inline and never
/// blocks on inputs; the control/local variants spawn tasks gated by the
/// callee's blocking-input vector, which for a dataflow function is its
/// future- and reference-typed parameters.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FunctionCall {
    pub op: Opcode,
    pub function: String,
    pub inputs: SmallVec<[Arg; 4]>,
    pub outputs: Vec<Var>,
    pub props: TaskProps,
    /// True when the callee never reads its outputs' prior state, so no
    /// read-refcount is claimed on them.
    pub output_write_only: bool,
}

impl FunctionCall {
    #[must_use]
    pub fn new(
        mode: TaskMode,
        function: impl Into<String>,
        inputs: impl Into<SmallVec<[Arg; 4]>>,
        outputs: Vec<Var>,
        props: TaskProps,
    ) -> Self {
        let op = match mode {
            TaskMode::Control => Opcode::CallControl,
            TaskMode::Sync => Opcode::CallSync,
            TaskMode::Local => Opcode::CallLocal,
            TaskMode::LocalControl => Opcode::CallLocalControl,
        };
        Self {
            op,
            function: function.into(),
            inputs: inputs.into(),
            outputs,
            props,
            output_write_only: false,
        }
    }

    #[must_use]
    pub fn mode(&self) -> TaskMode {
        match self.op {
            Opcode::CallSync => TaskMode::Sync,
            Opcode::CallLocal => TaskMode::Local,
            Opcode::CallLocalControl => TaskMode::LocalControl,
            _ => TaskMode::Control,
        }
    }

    #[must_use]
    pub fn all_inputs(&self) -> Vec<Arg> {
        self.inputs.iter().chain(self.props.args()).cloned().collect()
    }

    /// Sync calls never block; spawned calls block on every future- or
    /// reference-typed input of the callee's signature.
    #[must_use]
    pub fn blocking_inputs(&self) -> Vec<Var> {
        if self.op == Opcode::CallSync {
            return Vec::new();
        }
        self.inputs
            .iter()
            .filter_map(Arg::as_var)
            .filter(|v| v.blocks_reads())
            .cloned()
            .collect()
    }

    /// Read-refcounts on inputs, plus outputs when the callee reads their
    /// prior state; write-refcounts on every mutable output.
    #[must_use]
    pub fn incr_vars(&self) -> (Vec<Var>, Vec<Var>) {
        let mut reads: Vec<Var> = self
            .inputs
            .iter()
            .filter_map(Arg::as_var)
            .filter(|v| v.blocks_reads() || v.ty.is_container())
            .cloned()
            .collect();
        if !self.output_write_only {
            reads.extend(self.outputs.iter().cloned());
        }
        (reads, self.outputs.clone())
    }

    pub fn rename_vars(&mut self, renames: &AHashMap<String, Arg>, mode: RenameMode) {
        for arg in &mut self.inputs {
            rename_arg(arg, renames);
        }
        self.props.rename_vars(renames);
        if mode != RenameMode::Value {
            for out in &mut self.outputs {
                rename_out_var(out, renames);
            }
        }
    }
}

/// Async call of a foreign (builtin) function.
///
/// Blocks on every primitive-future or reference input; the task mode
/// comes from the foreign-function table.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ForeignCall {
    pub function: String,
    pub inputs: SmallVec<[Arg; 4]>,
    pub outputs: Vec<Var>,
    pub props: TaskProps,
}

impl ForeignCall {
    #[must_use]
    pub fn new(
        function: impl Into<String>,
        inputs: impl Into<SmallVec<[Arg; 4]>>,
        outputs: Vec<Var>,
        props: TaskProps,
    ) -> Self {
        Self {
            function: function.into(),
            inputs: inputs.into(),
            outputs,
            props,
        }
    }

    #[must_use]
    pub fn all_inputs(&self) -> Vec<Arg> {
        self.inputs.iter().chain(self.props.args()).cloned().collect()
    }

    #[must_use]
    pub fn blocking_inputs(&self) -> Vec<Var> {
        self.inputs
            .iter()
            .filter_map(Arg::as_var)
            .filter(|v| v.blocks_reads())
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn mode(&self, fns: &ForeignRegistry) -> TaskMode {
        fns.get(&self.function).map_or(TaskMode::Control, |f| f.mode)
    }

    #[must_use]
    pub fn has_side_effects(&self, fns: &ForeignRegistry) -> bool {
        !fns.get(&self.function).is_some_and(|f| f.pure)
    }

    /// Computed values this call publishes.
    ///
    /// Pure calls publish one value per output under the canonical
    /// (commutativity-sorted) input vector. Copy-equivalent calls (a
    /// self-identified copy, or min/max over identical inputs) publish a
    /// copy equivalence. The special foreign functions additionally
    /// publish filename, array-size, argv, and range-size equivalences.
    #[must_use]
    pub fn results(&self, fns: &ForeignRegistry) -> Vec<ResultVal> {
        let Some(info) = fns.get(&self.function) else {
            return Vec::new();
        };
        let mut results = Vec::new();

        if info.is_copy && self.inputs.len() == 1 && self.outputs.len() == 1 {
            results.push(ResultVal::copy(Arg::from(&self.outputs[0]), self.inputs[0].clone()));
            return results;
        }
        if info.is_min_max && self.inputs.len() == 2 && self.inputs[0] == self.inputs[1] && self.outputs.len() == 1 {
            results.push(ResultVal::copy(Arg::from(&self.outputs[0]), self.inputs[0].clone()));
            return results;
        }

        if info.pure {
            for (i, out) in self.outputs.iter().enumerate() {
                results.push(ResultVal::new(
                    Arg::from(out),
                    ComputedValue::foreign(
                        self.function.clone(),
                        u32::try_from(i).expect("output count exceeds u32"),
                        self.inputs.to_vec(),
                        info.commutative,
                    ),
                ));
            }
        }

        match info.special {
            Some(SpecialFn::InputFile | SpecialFn::UncachedInputFile | SpecialFn::InputUrl) => {
                if let (Some(out), Some(path)) = (self.outputs.first(), self.inputs.first()) {
                    // The output file's filename equals the path argument.
                    results.push(ResultVal::new(path.clone(), ComputedValue::filename_of(Arg::from(out))));
                }
            }
            Some(SpecialFn::Size) => {
                if let (Some(out), Some(arr)) = (self.outputs.first(), self.inputs.first()) {
                    results.push(ResultVal::new(Arg::from(out), ComputedValue::array_size(arr.clone())));
                }
            }
            Some(SpecialFn::Argv) => {
                if let (Some(out), Some(name)) = (self.outputs.first(), self.inputs.first()) {
                    let value = ComputedValue {
                        tag: ValueTag::ArgvVal,
                        inputs: vec![name.clone()],
                    };
                    let known = match name.as_const() {
                        Some(Lit::Str(key)) => fns.argv_value(key),
                        _ => None,
                    };
                    let location = match known {
                        Some(v) => Arg::str(v),
                        None => Arg::from(out),
                    };
                    results.push(ResultVal::new(location, value));
                }
            }
            Some(SpecialFn::Range | SpecialFn::RangeStep) => {
                if let (Some(out), Some(size)) = (self.outputs.first(), self.range_size()) {
                    results.push(ResultVal::new(Arg::int(size), ComputedValue::array_size(Arg::from(out))));
                }
            }
            _ => {}
        }
        results
    }

    /// The compile-time size of a constant range: `max(0, (end-start)/step + 1)`.
    fn range_size(&self) -> Option<i64> {
        let consts: Vec<i64> = self.inputs.iter().map(Arg::int_value).collect::<Option<_>>()?;
        let (start, end, step) = match consts[..] {
            [start, end] => (start, end, 1),
            [start, end, step] => (start, end, step),
            _ => return None,
        };
        if step == 0 {
            return None;
        }
        let span = end.checked_sub(start)?;
        Some((span / step + 1).max(0))
    }

    #[must_use]
    pub fn incr_vars(&self, fns: &ForeignRegistry) -> (Vec<Var>, Vec<Var>) {
        let mut reads: Vec<Var> = self
            .inputs
            .iter()
            .filter_map(Arg::as_var)
            .filter(|v| v.blocks_reads() || v.ty.is_container())
            .cloned()
            .collect();
        let write_only = fns.get(&self.function).is_none_or(|f| f.output_write_only);
        if !write_only {
            reads.extend(self.outputs.iter().cloned());
        }
        (reads, self.outputs.clone())
    }

    pub fn rename_vars(&mut self, renames: &AHashMap<String, Arg>, mode: RenameMode) {
        for arg in &mut self.inputs {
            rename_arg(arg, renames);
        }
        self.props.rename_vars(renames);
        if mode != RenameMode::Value {
            for out in &mut self.outputs {
                rename_out_var(out, renames);
            }
        }
    }
}

/// Synchronous foreign call over local values; never blocks.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LocalForeignCall {
    pub function: String,
    pub inputs: SmallVec<[Arg; 4]>,
    pub outputs: Vec<Var>,
}

impl LocalForeignCall {
    #[must_use]
    pub fn new(function: impl Into<String>, inputs: impl Into<SmallVec<[Arg; 4]>>, outputs: Vec<Var>) -> Self {
        Self {
            function: function.into(),
            inputs: inputs.into(),
            outputs,
        }
    }

    #[must_use]
    pub fn has_side_effects(&self, fns: &ForeignRegistry) -> bool {
        !fns.get(&self.function).is_some_and(|f| f.pure)
    }

    #[must_use]
    pub fn results(&self, fns: &ForeignRegistry) -> Vec<ResultVal> {
        let Some(info) = fns.get(&self.function) else {
            return Vec::new();
        };
        if !info.pure {
            return Vec::new();
        }
        self.outputs
            .iter()
            .enumerate()
            .map(|(i, out)| {
                ResultVal::new(
                    Arg::from(out),
                    ComputedValue::foreign_local(
                        self.function.clone(),
                        u32::try_from(i).expect("output count exceeds u32"),
                        self.inputs.to_vec(),
                        info.commutative,
                    ),
                )
            })
            .collect()
    }

    pub fn rename_vars(&mut self, renames: &AHashMap<String, Arg>, mode: RenameMode) {
        for arg in &mut self.inputs {
            rename_arg(arg, renames);
        }
        if mode != RenameMode::Value {
            for out in &mut self.outputs {
                rename_out_var(out, renames);
            }
        }
    }
}

/// Filename redirects for an external process.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Redirects {
    pub stdin: Option<Arg>,
    pub stdout: Option<Arg>,
    pub stderr: Option<Arg>,
}

impl Redirects {
    pub fn args(&self) -> impl Iterator<Item = &Arg> {
        [self.stdin.as_ref(), self.stdout.as_ref(), self.stderr.as_ref()]
            .into_iter()
            .flatten()
    }

    fn args_mut(&mut self) -> impl Iterator<Item = &mut Arg> {
        [self.stdin.as_mut(), self.stdout.as_mut(), self.stderr.as_mut()]
            .into_iter()
            .flatten()
    }
}

/// Spawn of an external process.
///
/// Inputs are the argv tokens, redirect filenames, and input-file
/// variables; outputs are the output files, closed after the process
/// returns. Deterministic commands publish computed values keyed on the
/// command and its argv.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RunExternal {
    pub cmd: String,
    pub argv: Vec<Arg>,
    pub redirects: Redirects,
    pub input_files: Vec<Arg>,
    pub output_files: Vec<Var>,
    pub deterministic: bool,
}

impl RunExternal {
    #[must_use]
    pub fn all_inputs(&self) -> Vec<Arg> {
        self.argv
            .iter()
            .chain(self.redirects.args())
            .chain(self.input_files.iter())
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn outputs(&self) -> &[Var] {
        &self.output_files
    }

    /// Output files whose prior state (the mapped filename) is read.
    #[must_use]
    pub fn read_outputs(&self) -> Vec<Var> {
        self.output_files.iter().filter(|v| v.is_mapped()).cloned().collect()
    }

    #[must_use]
    pub fn has_side_effects(&self) -> bool {
        !self.deterministic
    }

    #[must_use]
    pub fn is_idempotent(&self) -> bool {
        self.deterministic
    }

    /// One computed value per output file, only for deterministic
    /// commands; the key includes the command and full argv.
    #[must_use]
    pub fn results(&self) -> Vec<ResultVal> {
        if !self.deterministic {
            return Vec::new();
        }
        self.output_files
            .iter()
            .enumerate()
            .map(|(i, out)| {
                ResultVal::new(
                    Arg::from(out),
                    ComputedValue {
                        tag: ValueTag::External {
                            cmd: self.cmd.clone(),
                            out: u32::try_from(i).expect("output count exceeds u32"),
                        },
                        inputs: self.argv.clone(),
                    },
                )
            })
            .collect()
    }

    #[must_use]
    pub fn incr_vars(&self) -> (Vec<Var>, Vec<Var>) {
        let reads = self.all_inputs().iter().filter_map(Arg::as_var).cloned().collect();
        (reads, self.output_files.clone())
    }

    pub fn rename_vars(&mut self, renames: &AHashMap<String, Arg>, mode: RenameMode) {
        for arg in self
            .argv
            .iter_mut()
            .chain(self.redirects.args_mut())
            .chain(self.input_files.iter_mut())
        {
            rename_arg(arg, renames);
        }
        if mode != RenameMode::Value {
            for out in &mut self.output_files {
                rename_out_var(out, renames);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        foreign::ForeignFn,
        types::{Alloc, DefKind, PrimKind, Type},
    };

    use super::*;

    fn int_fut(name: &str) -> Var {
        Var::new(name, Type::PrimFuture(PrimKind::Int), Alloc::Stack, DefKind::LocalUser)
    }

    #[test]
    fn test_sync_call_never_blocks() {
        let a = int_fut("a");
        let call = FunctionCall::new(
            TaskMode::Sync,
            "f",
            vec![Arg::from(&a)],
            vec![int_fut("o")],
            TaskProps::new(),
        );
        assert_eq!(call.op, Opcode::CallSync);
        assert!(call.blocking_inputs().is_empty());

        let spawned = FunctionCall::new(
            TaskMode::Control,
            "f",
            vec![Arg::from(&a)],
            vec![int_fut("o")],
            TaskProps::new(),
        );
        assert_eq!(spawned.blocking_inputs(), vec![a]);
    }

    #[test]
    fn test_call_refcounts_cover_outputs() {
        let a = int_fut("a");
        let o = int_fut("o");
        let mut call = FunctionCall::new(
            TaskMode::Control,
            "f",
            vec![Arg::from(&a)],
            vec![o.clone()],
            TaskProps::new(),
        );
        let (reads, writes) = call.incr_vars();
        assert!(reads.contains(&a));
        assert!(reads.contains(&o));
        assert_eq!(writes, vec![o.clone()]);

        call.output_write_only = true;
        let (reads, _) = call.incr_vars();
        assert!(!reads.contains(&o));
    }

    #[test]
    fn test_pure_foreign_results_commutative() {
        let mut fns = ForeignRegistry::new();
        fns.register(ForeignFn {
            commutative: true,
            ..ForeignFn::pure_fn("add")
        });
        let a = int_fut("a");
        let b = int_fut("b");
        let out = int_fut("o");
        let ab = ForeignCall::new("add", vec![Arg::from(&a), Arg::from(&b)], vec![out.clone()], TaskProps::new());
        let ba = ForeignCall::new("add", vec![Arg::from(&b), Arg::from(&a)], vec![out], TaskProps::new());
        assert_eq!(ab.results(&fns)[0].value, ba.results(&fns)[0].value);
    }

    #[test]
    fn test_range_size_clamps_to_zero() {
        let fns = ForeignRegistry::with_specials();
        let out = Var::new(
            "r",
            Type::array(Type::PrimFuture(PrimKind::Int), Type::PrimFuture(PrimKind::Int)),
            Alloc::Stack,
            DefKind::LocalUser,
        );
        // end < start with positive step: size 0.
        let call = ForeignCall::new("range", vec![Arg::int(5), Arg::int(1)], vec![out.clone()], TaskProps::new());
        let results = call.results(&fns);
        let size_rv = results
            .iter()
            .find(|rv| matches!(rv.value.tag, ValueTag::ArraySize))
            .unwrap();
        assert_eq!(size_rv.location, Arg::int(0));
    }

    #[test]
    fn test_argv_compile_time_lookup() {
        let mut fns = ForeignRegistry::with_specials();
        fns.register(ForeignFn::pure_fn("argv"));
        fns.set_argv("n", "100");
        let out = Var::new(
            "o",
            Type::PrimFuture(PrimKind::String),
            Alloc::Stack,
            DefKind::LocalUser,
        );
        let call = ForeignCall::new("argv", vec![Arg::str("n")], vec![out], TaskProps::new());
        let results = call.results(&fns);
        let argv_rv = results
            .iter()
            .find(|rv| matches!(rv.value.tag, ValueTag::ArgvVal))
            .unwrap();
        assert_eq!(argv_rv.location, Arg::str("100"));
    }

    #[test]
    fn test_run_external_results_require_deterministic() {
        let out = Var::new("f", Type::PrimFuture(PrimKind::File), Alloc::Stack, DefKind::LocalUser);
        let mut run = RunExternal {
            cmd: "sort".to_string(),
            argv: vec![Arg::str("-n")],
            redirects: Redirects::default(),
            input_files: Vec::new(),
            output_files: vec![out],
            deterministic: false,
        };
        assert!(run.results().is_empty());
        assert!(run.has_side_effects());
        run.deterministic = true;
        assert_eq!(run.results().len(), 1);
        assert!(run.is_idempotent());
    }
}

//! Thin data-movement primitives: stores, loads, dereferences, container
//! and struct access, reference copies, file and checkpoint plumbing,
//! updateable cells, and refcount manipulation.
//!
//! Each opcode has fixed arity, so one carrier struct serves the whole
//! family and the opcode fully determines the semantics of the inputs and
//! outputs.

use ahash::AHashMap;
use smallvec::SmallVec;

use super::{
    InitDegree, RcKind, RenameMode, TaskMode,
    opcode::Opcode,
    rename_arg, rename_out_var,
    value::{ComputedValue, ResultVal},
};
use crate::{arg::Arg, types::Var};

/// A data-movement instruction.
///
/// `absorbed_reads`/`absorbed_writes` hold refcount increments the
/// refcount pass piggybacked onto this instruction instead of emitting
/// separate increment instructions.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TurbineOp {
    pub op: Opcode,
    pub outputs: SmallVec<[Var; 1]>,
    pub inputs: SmallVec<[Arg; 4]>,
    pub absorbed_reads: Vec<Var>,
    pub absorbed_writes: Vec<Var>,
}

impl TurbineOp {
    fn new(op: Opcode, outputs: impl Into<SmallVec<[Var; 1]>>, inputs: impl Into<SmallVec<[Arg; 4]>>) -> Self {
        Self {
            op,
            outputs: outputs.into(),
            inputs: inputs.into(),
            absorbed_reads: Vec::new(),
            absorbed_writes: Vec::new(),
        }
    }

    // Stores: local value into future.

    #[must_use]
    pub fn store_scalar(dst: Var, src: Arg) -> Self {
        debug_assert!(dst.ty.is_prim_future(), "store_scalar destination must be a future");
        Self::new(Opcode::StoreScalar, vec![dst], vec![src])
    }

    #[must_use]
    pub fn store_file(dst: Var, src: Arg) -> Self {
        Self::new(Opcode::StoreFile, vec![dst], vec![src])
    }

    #[must_use]
    pub fn store_ref(dst: Var, src: Arg) -> Self {
        debug_assert!(dst.ty.is_ref(), "store_ref destination must be a ref");
        Self::new(Opcode::StoreRef, vec![dst], vec![src])
    }

    #[must_use]
    pub fn store_array(dst: Var, src: Arg) -> Self {
        Self::new(Opcode::StoreArray, vec![dst], vec![src])
    }

    #[must_use]
    pub fn store_bag(dst: Var, src: Arg) -> Self {
        Self::new(Opcode::StoreBag, vec![dst], vec![src])
    }

    #[must_use]
    pub fn store_recursive(dst: Var, src: Arg) -> Self {
        Self::new(Opcode::StoreRecursive, vec![dst], vec![src])
    }

    // Loads: future into local value. Container loads are shallow;
    // `load_recursive` retrieves contents recursively.

    #[must_use]
    pub fn load_scalar(dst: Var, src: &Var) -> Self {
        debug_assert!(dst.ty.is_prim_value(), "load_scalar destination must be a local value");
        Self::new(Opcode::LoadScalar, vec![dst], vec![Arg::from(src)])
    }

    #[must_use]
    pub fn load_file(dst: Var, src: &Var) -> Self {
        Self::new(Opcode::LoadFile, vec![dst], vec![Arg::from(src)])
    }

    #[must_use]
    pub fn load_ref(dst: Var, src: &Var) -> Self {
        Self::new(Opcode::LoadRef, vec![dst], vec![Arg::from(src)])
    }

    #[must_use]
    pub fn load_array(dst: Var, src: &Var) -> Self {
        Self::new(Opcode::LoadArray, vec![dst], vec![Arg::from(src)])
    }

    #[must_use]
    pub fn load_bag(dst: Var, src: &Var) -> Self {
        Self::new(Opcode::LoadBag, vec![dst], vec![Arg::from(src)])
    }

    #[must_use]
    pub fn load_recursive(dst: Var, src: &Var) -> Self {
        Self::new(Opcode::LoadRecursive, vec![dst], vec![Arg::from(src)])
    }

    // Dereferences.

    #[must_use]
    pub fn deref_scalar(dst: Var, src: &Var) -> Self {
        debug_assert!(src.ty.is_ref(), "deref_scalar source must be a ref");
        Self::new(Opcode::DerefScalar, vec![dst], vec![Arg::from(src)])
    }

    #[must_use]
    pub fn deref_file(dst: Var, src: &Var) -> Self {
        debug_assert!(src.ty.is_ref(), "deref_file source must be a ref");
        Self::new(Opcode::DerefFile, vec![dst], vec![Arg::from(src)])
    }

    // Container access.

    #[must_use]
    pub fn array_lookup_ref_imm(out: Var, arr: &Var, ix: Arg) -> Self {
        Self::new(Opcode::ArrayLookupRefImm, vec![out], vec![Arg::from(arr), ix])
    }

    #[must_use]
    pub fn array_lookup_future(out: Var, arr: &Var, ix: &Var) -> Self {
        Self::new(Opcode::ArrayLookupFuture, vec![out], vec![Arg::from(arr), Arg::from(ix)])
    }

    #[must_use]
    pub fn array_insert_imm(arr: Var, ix: Arg, val: Arg) -> Self {
        Self::new(Opcode::ArrayInsertImm, vec![arr], vec![ix, val])
    }

    #[must_use]
    pub fn array_insert_future(arr: Var, ix: &Var, val: Arg) -> Self {
        Self::new(Opcode::ArrayInsertFuture, vec![arr], vec![Arg::from(ix), val])
    }

    /// Builds a whole array from parallel key/value vectors and closes it.
    /// Inputs are interleaved `k0, v0, k1, v1, ...`.
    #[must_use]
    pub fn array_build(arr: Var, keys: Vec<Arg>, vals: Vec<Arg>) -> Self {
        debug_assert_eq!(keys.len(), vals.len(), "array_build key/value arity mismatch");
        let inputs: SmallVec<[Arg; 4]> = keys.into_iter().zip(vals).flat_map(|(k, v)| [k, v]).collect();
        Self::new(Opcode::ArrayBuild, vec![arr], inputs)
    }

    #[must_use]
    pub fn bag_insert(bag: Var, val: Arg) -> Self {
        Self::new(Opcode::BagInsert, vec![bag], vec![val])
    }

    // Struct access. The field path is carried as string constants after
    // the struct input.

    #[must_use]
    pub fn struct_lookup(out: Var, st: &Var, path: &[String]) -> Self {
        let mut inputs: SmallVec<[Arg; 4]> = SmallVec::new();
        inputs.push(Arg::from(st));
        inputs.extend(path.iter().map(Arg::str));
        Self::new(Opcode::StructLookup, vec![out], inputs)
    }

    #[must_use]
    pub fn struct_ref_lookup(out: Var, st: &Var, path: &[String]) -> Self {
        let mut inputs: SmallVec<[Arg; 4]> = SmallVec::new();
        inputs.push(Arg::from(st));
        inputs.extend(path.iter().map(Arg::str));
        Self::new(Opcode::StructRefLookup, vec![out], inputs)
    }

    #[must_use]
    pub fn copy_ref(dst: Var, src: &Var) -> Self {
        Self::new(Opcode::CopyRef, vec![dst], vec![Arg::from(src)])
    }

    // File plumbing.

    #[must_use]
    pub fn get_filename_alias(out: Var, file: &Var) -> Self {
        Self::new(Opcode::GetFilenameAlias, vec![out], vec![Arg::from(file)])
    }

    #[must_use]
    pub fn get_filename_val(out: Var, file: &Var) -> Self {
        Self::new(Opcode::GetFilenameVal, vec![out], vec![Arg::from(file)])
    }

    #[must_use]
    pub fn set_filename_val(file: Var, val: Arg) -> Self {
        Self::new(Opcode::SetFilenameVal, vec![file], vec![val])
    }

    #[must_use]
    pub fn choose_tmp_filename(out: Var) -> Self {
        Self::new(Opcode::ChooseTmpFilename, vec![out], SmallVec::new())
    }

    #[must_use]
    pub fn init_local_output_file(out: Var, filename: Arg) -> Self {
        Self::new(Opcode::InitLocalOutputFile, vec![out], vec![filename])
    }

    #[must_use]
    pub fn copy_file(dst: Var, src: &Var) -> Self {
        Self::new(Opcode::CopyFile, vec![dst], vec![Arg::from(src)])
    }

    // Refcounts, inserted by the refcount pass.

    #[must_use]
    pub fn refcount(kind: RcKind, incr: bool, var: &Var, amount: i64) -> Self {
        let op = match (kind, incr) {
            (RcKind::Readers, true) => Opcode::IncrReaders,
            (RcKind::Readers, false) => Opcode::DecrReaders,
            (RcKind::Writers, true) => Opcode::IncrWriters,
            (RcKind::Writers, false) => Opcode::DecrWriters,
        };
        Self::new(op, SmallVec::new(), vec![Arg::from(var), Arg::int(amount)])
    }

    // Updateable cells.

    #[must_use]
    pub fn update(op: Opcode, cell: Var, val: Arg) -> Self {
        debug_assert!(
            matches!(
                op,
                Opcode::UpdateMin
                    | Opcode::UpdateIncr
                    | Opcode::UpdateScale
                    | Opcode::UpdateMinImm
                    | Opcode::UpdateIncrImm
                    | Opcode::UpdateScaleImm
            ),
            "update constructor requires an update opcode"
        );
        Self::new(op, vec![cell], vec![val])
    }

    #[must_use]
    pub fn latest_value(out: Var, cell: &Var) -> Self {
        Self::new(Opcode::LatestValue, vec![out], vec![Arg::from(cell)])
    }

    // Checkpointing.

    #[must_use]
    pub fn lookup_checkpoint(exists_out: Var, val_out: Var, key: Arg) -> Self {
        Self::new(Opcode::LookupCheckpoint, vec![exists_out, val_out], vec![key])
    }

    #[must_use]
    pub fn write_checkpoint(key: Arg, val: Arg) -> Self {
        Self::new(Opcode::WriteCheckpoint, SmallVec::new(), vec![key, val])
    }

    #[must_use]
    pub fn pack_values(out: Var, vals: Vec<Arg>) -> Self {
        Self::new(Opcode::PackValues, vec![out], SmallVec::from_vec(vals))
    }

    #[must_use]
    pub fn unpack_values(outs: Vec<Var>, blob: Arg) -> Self {
        Self::new(Opcode::UnpackValues, SmallVec::from_vec(outs), vec![blob])
    }

    #[must_use]
    pub fn free_blob(var: &Var) -> Self {
        Self::new(Opcode::FreeBlob, SmallVec::new(), vec![Arg::from(var)])
    }

    // Semantic queries.

    #[must_use]
    pub fn all_inputs(&self) -> Vec<Arg> {
        self.inputs.to_vec()
    }

    #[must_use]
    pub fn outputs(&self) -> Vec<Var> {
        self.outputs.to_vec()
    }

    /// Inputs whose closure gates execution.
    #[must_use]
    pub fn blocking_inputs(&self) -> Vec<Var> {
        fn one(arg: &Arg) -> Vec<Var> {
            arg.as_var().cloned().into_iter().collect()
        }
        match self.op {
            op if op.is_load() => one(&self.inputs[0]),
            Opcode::DerefScalar | Opcode::DerefFile => one(&self.inputs[0]),
            Opcode::ArrayLookupFuture => one(&self.inputs[1]),
            Opcode::PackValues => self
                .inputs
                .iter()
                .filter_map(Arg::as_var)
                .filter(|v| v.blocks_reads() || v.ty.is_container())
                .cloned()
                .collect(),
            _ => Vec::new(),
        }
    }

    #[must_use]
    pub fn mode(&self) -> TaskMode {
        if self.blocking_inputs().is_empty() {
            TaskMode::Sync
        } else {
            TaskMode::Local
        }
    }

    /// True for operations whose effects are not captured by their
    /// outputs: updateable mutation, filename mutation, checkpoint
    /// writes, blob frees, filesystem copies, and refcount manipulation.
    #[must_use]
    pub fn has_side_effects(&self) -> bool {
        matches!(
            self.op,
            Opcode::SetFilenameVal
                | Opcode::UpdateMin
                | Opcode::UpdateIncr
                | Opcode::UpdateScale
                | Opcode::UpdateMinImm
                | Opcode::UpdateIncrImm
                | Opcode::UpdateScaleImm
                | Opcode::WriteCheckpoint
                | Opcode::FreeBlob
                | Opcode::CopyFile
        ) || self.op.is_refcount_op()
    }

    /// Timing-sensitive reads may not move even though they have no side
    /// effects: a snapshot of an updateable observes whatever updates
    /// happened to run first.
    #[must_use]
    pub fn can_change_timing(&self) -> bool {
        !self.has_side_effects() && self.op != Opcode::LatestValue
    }

    #[must_use]
    pub fn is_idempotent(&self) -> bool {
        self.op.is_load()
            || matches!(
                self.op,
                Opcode::ArrayLookupRefImm
                    | Opcode::StructLookup
                    | Opcode::GetFilenameVal
                    | Opcode::GetFilenameAlias
                    | Opcode::LookupCheckpoint
                    | Opcode::PackValues
                    | Opcode::UnpackValues
            )
    }

    /// What this instruction initializes, and how completely.
    #[must_use]
    pub fn initialized(&self) -> Vec<(Var, InitDegree)> {
        let degree = match self.op {
            Opcode::ArrayInsertImm | Opcode::ArrayInsertFuture | Opcode::BagInsert | Opcode::SetFilenameVal => {
                InitDegree::Partial
            }
            op if op.is_refcount_op() => return Vec::new(),
            Opcode::UpdateMin
            | Opcode::UpdateIncr
            | Opcode::UpdateScale
            | Opcode::UpdateMinImm
            | Opcode::UpdateIncrImm
            | Opcode::UpdateScaleImm
            | Opcode::WriteCheckpoint
            | Opcode::FreeBlob => return Vec::new(),
            _ => InitDegree::Full,
        };
        self.outputs.iter().map(|v| (v.clone(), degree)).collect()
    }

    /// Outputs whose prior state is read: mapped files being written.
    #[must_use]
    pub fn read_outputs(&self) -> Vec<Var> {
        match self.op {
            Opcode::StoreFile | Opcode::CopyFile | Opcode::InitLocalOutputFile => {
                self.outputs.iter().filter(|v| v.is_mapped()).cloned().collect()
            }
            _ => Vec::new(),
        }
    }

    /// Computed values this operation publishes.
    ///
    /// Loads and lookups key on `(opcode, inputs)`; stores publish the
    /// inverse relation (a later load of the destination yields the
    /// stored value); filename reads publish filename equivalences; copies
    /// publish copy equivalences.
    #[must_use]
    pub fn results(&self) -> Vec<ResultVal> {
        match self.op {
            op if op.is_load() => vec![ResultVal::new(
                Arg::from(&self.outputs[0]),
                ComputedValue::op(op, self.inputs.to_vec()),
            )],
            op if op.is_store() => {
                let Some(load_op) = store_to_load(op) else {
                    return Vec::new();
                };
                vec![ResultVal::new(
                    self.inputs[0].clone(),
                    ComputedValue::op(load_op, vec![Arg::from(&self.outputs[0])]),
                )]
            }
            Opcode::DerefScalar
            | Opcode::DerefFile
            | Opcode::ArrayLookupRefImm
            | Opcode::ArrayLookupFuture
            | Opcode::StructLookup
            | Opcode::StructRefLookup => vec![ResultVal::new(
                Arg::from(&self.outputs[0]),
                ComputedValue::op(self.op, self.inputs.to_vec()),
            )],
            Opcode::CopyRef => vec![ResultVal::copy(Arg::from(&self.outputs[0]), self.inputs[0].clone())],
            Opcode::GetFilenameAlias | Opcode::GetFilenameVal => vec![ResultVal::new(
                Arg::from(&self.outputs[0]),
                ComputedValue::filename_of(self.inputs[0].clone()),
            )],
            _ => Vec::new(),
        }
    }

    /// Refcounts this instruction claims, including piggybacked ones.
    #[must_use]
    pub fn incr_vars(&self) -> (Vec<Var>, Vec<Var>) {
        let mut reads: Vec<Var> = match self.op {
            // Storing a future-typed value into a container or future
            // gives the destination a read reference to it.
            op if op.is_store() => self
                .inputs
                .iter()
                .filter_map(Arg::as_var)
                .filter(|v| v.blocks_reads() || v.ty.is_container())
                .cloned()
                .collect(),
            Opcode::ArrayInsertImm | Opcode::ArrayInsertFuture | Opcode::BagInsert | Opcode::CopyRef => self
                .inputs
                .iter()
                .filter_map(Arg::as_var)
                .filter(|v| v.blocks_reads() || v.ty.is_container())
                .cloned()
                .collect(),
            _ => Vec::new(),
        };
        let mut writes: Vec<Var> = match self.op {
            Opcode::DerefScalar | Opcode::DerefFile | Opcode::ArrayLookupFuture | Opcode::StructRefLookup => {
                self.outputs.to_vec()
            }
            _ => Vec::new(),
        };
        reads.extend(self.absorbed_reads.iter().cloned());
        writes.extend(self.absorbed_writes.iter().cloned());
        (reads, writes)
    }

    /// Absorbs pending refcount increments this instruction can carry,
    /// returning the variables it absorbed.
    ///
    /// Stores and inserts can carry a read increment for the value they
    /// store and a write increment for the destination they initialize.
    pub fn try_piggyback(&mut self, counters: &AHashMap<String, i64>, kind: RcKind) -> Vec<Var> {
        if !matches!(
            self.op,
            Opcode::ArrayInsertImm
                | Opcode::ArrayInsertFuture
                | Opcode::BagInsert
                | Opcode::ArrayBuild
                | Opcode::StoreScalar
                | Opcode::StoreRef
        ) {
            return Vec::new();
        }
        let candidates: Vec<Var> = match kind {
            RcKind::Readers => self.inputs.iter().filter_map(Arg::as_var).cloned().collect(),
            RcKind::Writers => self.outputs.to_vec(),
        };
        let mut absorbed = Vec::new();
        for var in candidates {
            if counters.get(&var.name).copied().unwrap_or(0) > 0 {
                match kind {
                    RcKind::Readers => self.absorbed_reads.push(var.clone()),
                    RcKind::Writers => self.absorbed_writes.push(var.clone()),
                }
                absorbed.push(var);
            }
        }
        absorbed
    }

    /// Declares the output as an alias into a larger structure.
    #[must_use]
    pub fn component_alias(&self) -> Option<(Var, Var)> {
        match self.op {
            Opcode::ArrayLookupRefImm | Opcode::StructLookup | Opcode::GetFilenameAlias => {
                let whole = self.inputs.first()?.as_var()?.clone();
                let part = self.outputs.first()?.clone();
                Some((whole, part))
            }
            _ => None,
        }
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

/// The load opcode reading back what a store opcode wrote.
fn store_to_load(op: Opcode) -> Option<Opcode> {
    match op {
        Opcode::StoreScalar => Some(Opcode::LoadScalar),
        Opcode::StoreFile => Some(Opcode::LoadFile),
        Opcode::StoreRef => Some(Opcode::LoadRef),
        Opcode::StoreArray => Some(Opcode::LoadArray),
        Opcode::StoreBag => Some(Opcode::LoadBag),
        Opcode::StoreRecursive => Some(Opcode::LoadRecursive),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use crate::types::{Alloc, DefKind, PrimKind, Type};

    use super::*;

    fn int_fut(name: &str) -> Var {
        Var::new(name, Type::PrimFuture(PrimKind::Int), Alloc::Stack, DefKind::LocalUser)
    }

    fn int_local(name: &str) -> Var {
        Var::new(name, Type::PrimValue(PrimKind::Int), Alloc::Local, DefKind::LocalCompiler)
    }

    fn int_array(name: &str) -> Var {
        Var::new(
            name,
            Type::array(Type::PrimFuture(PrimKind::Int), Type::PrimFuture(PrimKind::Int)),
            Alloc::Stack,
            DefKind::LocalUser,
        )
    }

    #[test]
    fn test_store_load_publish_matching_values() {
        let x = int_fut("x");
        let v = int_local("v");
        let store = TurbineOp::store_scalar(x.clone(), Arg::int(5));
        let load = TurbineOp::load_scalar(v.clone(), &x);

        // The store says "a load of x yields 5"; the load says "v holds
        // the load of x". Both key on the same computed value.
        let store_rv = &store.results()[0];
        let load_rv = &load.results()[0];
        assert_eq!(store_rv.value, load_rv.value);
        assert_eq!(store_rv.location, Arg::int(5));
        assert_eq!(load_rv.location, Arg::from(&v));
    }

    #[test]
    fn test_load_blocks_on_source() {
        let x = int_fut("x");
        let v = int_local("v");
        let load = TurbineOp::load_scalar(v, &x);
        assert_eq!(load.blocking_inputs(), vec![x]);
        assert_eq!(load.mode(), TaskMode::Local);
        assert!(load.is_idempotent());
        assert!(!load.has_side_effects());
    }

    #[test]
    fn test_array_build_interleaves_and_fully_initializes() {
        let arr = int_array("a");
        let build = TurbineOp::array_build(
            arr.clone(),
            vec![Arg::int(0), Arg::int(1)],
            vec![Arg::from(&int_fut("v0")), Arg::from(&int_fut("v1"))],
        );
        assert_eq!(build.inputs.len(), 4);
        assert_eq!(build.initialized(), vec![(arr, InitDegree::Full)]);
    }

    #[test]
    fn test_insert_partially_initializes() {
        let arr = int_array("a");
        let ins = TurbineOp::array_insert_imm(arr.clone(), Arg::int(0), Arg::from(&int_fut("v")));
        assert_eq!(ins.initialized(), vec![(arr, InitDegree::Partial)]);
    }

    #[test]
    fn test_component_alias_for_lookups() {
        let arr = int_array("a");
        let alias = Var::new(
            "alias0",
            Type::PrimFuture(PrimKind::Int),
            Alloc::Alias,
            DefKind::LocalCompiler,
        );
        let lookup = TurbineOp::array_lookup_ref_imm(alias.clone(), &arr, Arg::int(2));
        assert_eq!(lookup.component_alias(), Some((arr, alias)));
    }

    #[test]
    fn test_latest_value_cannot_change_timing() {
        let cell = Var::new("u", Type::updateable_float(), Alloc::Stack, DefKind::LocalUser);
        let out = Var::new("v", Type::PrimValue(PrimKind::Float), Alloc::Local, DefKind::LocalCompiler);
        let snap = TurbineOp::latest_value(out, &cell);
        assert!(!snap.has_side_effects());
        assert!(!snap.can_change_timing());
    }

    #[test]
    fn test_piggyback_absorbs_pending_increments() {
        let arr = int_array("a");
        let val = int_fut("v");
        let mut ins = TurbineOp::array_insert_imm(arr.clone(), Arg::int(0), Arg::from(&val));

        let mut pending = AHashMap::new();
        pending.insert("v".to_string(), 1i64);
        let absorbed = ins.try_piggyback(&pending, RcKind::Readers);
        assert_eq!(absorbed, vec![val.clone()]);
        let (reads, _) = ins.incr_vars();
        assert_eq!(reads.iter().filter(|v| v.name == "v").count(), 2);

        // Nothing pending for writers on an unrelated name.
        let absorbed = ins.try_piggyback(&AHashMap::new(), RcKind::Writers);
        assert!(absorbed.is_empty());
    }

    #[test]
    fn test_update_ops_are_side_effecting() {
        let cell = Var::new("u", Type::updateable_float(), Alloc::Stack, DefKind::LocalUser);
        let update = TurbineOp::update(Opcode::UpdateMinImm, cell, Arg::float(0.5));
        assert!(update.has_side_effects());
        assert!(!update.is_idempotent());
        assert!(update.initialized().is_empty());
        assert!(update.results().is_empty());
    }

    #[test]
    fn test_refcount_ops_are_flagged() {
        let x = int_fut("x");
        let incr = TurbineOp::refcount(RcKind::Readers, true, &x, 1);
        assert!(incr.op.is_refcount_op());
        assert!(incr.has_side_effects());
        assert!(incr.initialized().is_empty());
    }
}

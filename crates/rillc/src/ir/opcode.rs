//! Opcode taxonomy for the dataflow IR.

/// Identifies the concrete operation of an instruction.
///
/// Each instruction struct carries the opcode it was built with; optimizer
/// passes dispatch on it and the computed-value relation keys on it. The
/// turbine family (stores, loads, dereferences, container and struct
/// access, refcounts, file and checkpoint plumbing) shares one carrier
/// struct, so for those the opcode fully determines arity and semantics.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::IntoStaticStr,
    serde::Serialize, serde::Deserialize,
)]
#[strum(serialize_all = "snake_case")]
pub enum Opcode {
    /// Free-text comment preserved through optimization.
    Comment,

    // Calls.
    /// Async call to a foreign (builtin) function.
    CallForeign,
    /// Synchronous local call to a foreign function on local values.
    CallForeignLocal,
    /// Call spawning a control task that may run anywhere.
    CallControl,
    /// Call executed inline; never blocks on inputs.
    CallSync,
    /// Call spawning a worker-local task.
    CallLocal,
    /// Call spawning a worker-local control task.
    CallLocalControl,

    // Builtin operators.
    /// Pure operator applied to local values.
    LocalOp,
    /// Operator applied to futures; blocks on its inputs.
    AsyncOp,

    /// Spawn of an external process with argv and file redirects.
    RunExternal,

    // Loop control.
    /// Tail transfer to the next loop iteration with fresh bindings.
    LoopContinue,
    /// Terminal instruction abandoning the enclosing loop.
    LoopBreak,

    // Stores: local value into future.
    StoreScalar,
    StoreFile,
    StoreRef,
    StoreArray,
    StoreBag,
    /// Store that recursively stores container contents.
    StoreRecursive,

    // Loads: future into local value.
    LoadScalar,
    LoadFile,
    LoadRef,
    LoadArray,
    LoadBag,
    /// Load that recursively retrieves container contents.
    LoadRecursive,

    // Dereferences: follow a reference into a fresh future.
    DerefScalar,
    DerefFile,

    // Container access.
    /// Alias lookup of an array slot at a compile-time immediate key.
    ArrayLookupRefImm,
    /// Reference-producing lookup of an array slot at a future key.
    ArrayLookupFuture,
    /// Insert at a compile-time immediate key.
    ArrayInsertImm,
    /// Insert at a future key.
    ArrayInsertFuture,
    /// Build a whole array from parallel key/value vectors; closes it.
    ArrayBuild,
    /// Insert into a bag.
    BagInsert,

    // Struct access.
    StructLookup,
    /// Lookup of a struct field holding a reference.
    StructRefLookup,

    /// Copy one reference into another.
    CopyRef,

    // File plumbing.
    /// Alias the filename future of a file variable.
    GetFilenameAlias,
    /// Fetch the filename of a file variable into a local string.
    GetFilenameVal,
    /// Set the filename of an unmapped file variable.
    SetFilenameVal,
    /// Pick a fresh temporary filename.
    ChooseTmpFilename,
    /// Initialize a local output file handle from a filename.
    InitLocalOutputFile,
    /// Physical file copy.
    CopyFile,

    // Reference counting (inserted by the refcount pass).
    IncrReaders,
    DecrReaders,
    IncrWriters,
    DecrWriters,

    // Updateable cells.
    UpdateMin,
    UpdateIncr,
    UpdateScale,
    UpdateMinImm,
    UpdateIncrImm,
    UpdateScaleImm,
    /// Snapshot of an updateable's current value into a local.
    LatestValue,

    // Checkpointing.
    LookupCheckpoint,
    WriteCheckpoint,
    PackValues,
    UnpackValues,
    FreeBlob,
}

impl Opcode {
    /// True for the refcount-manipulation opcodes the standard-mode
    /// validator rejects.
    #[must_use]
    pub fn is_refcount_op(&self) -> bool {
        matches!(
            self,
            Self::IncrReaders | Self::DecrReaders | Self::IncrWriters | Self::DecrWriters
        )
    }

    /// True for the store family.
    #[must_use]
    pub fn is_store(&self) -> bool {
        matches!(
            self,
            Self::StoreScalar | Self::StoreFile | Self::StoreRef | Self::StoreArray | Self::StoreBag | Self::StoreRecursive
        )
    }

    /// True for the load family.
    #[must_use]
    pub fn is_load(&self) -> bool {
        matches!(
            self,
            Self::LoadScalar | Self::LoadFile | Self::LoadRef | Self::LoadArray | Self::LoadBag | Self::LoadRecursive
        )
    }
}

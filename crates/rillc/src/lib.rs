//! Middle end of the Rill implicitly-parallel dataflow language compiler.
//!
//! The crate lowers typed expression trees into a dataflow intermediate
//! representation executed by an asynchronous task engine. It contains
//! the type and variable model, the lexical context stack, the backend
//! emission contract and its IR emitter, the instruction model with the
//! semantic queries optimizer passes rely on, the expression walker, and
//! the structural validator. Parsing, type checking, target code
//! generation, and the task engine itself are external collaborators.
#![expect(clippy::unused_self, reason = "query methods stay shape-consistent across families")]

pub mod arg;
pub mod backend;
pub mod context;
pub mod diag;
pub mod error;
pub mod foreign;
pub mod ir;
pub mod settings;
pub mod tree;
pub mod types;
pub mod validator;
pub mod walker;

pub use crate::{
    arg::{Arg, Lit},
    backend::{Backend, IrEmitter},
    context::{ContextStack, FnProp, FnProps, FunctionInfo, FunctionSig},
    diag::{CollectDiagnostics, Diagnostics, NoDiagnostics, StderrDiagnostics},
    error::{CompileError, CompileResult},
    foreign::{ForeignFn, ForeignRegistry, SpecialFn},
    settings::Settings,
    tree::{Annotation, ExprToken, ExprTree},
    types::{Alloc, DefKind, PrimKind, Type, Var},
    validator::{Validator, ValidatorMode, validate, validate_final},
    walker::{Renames, Walker},
};

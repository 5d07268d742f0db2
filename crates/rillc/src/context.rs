//! Lexical context stack: global scope, function scopes, block scopes.
//!
//! The stack resolves variable and function names, declares variables
//! (minting unique compiler names on demand), and answers the
//! function-property queries that drive call lowering. Scopes form a
//! chain; lookups chase parents from the innermost scope outward.

use ahash::AHashMap;
use enumflags2::{BitFlags, bitflags};
use indexmap::IndexMap;

use crate::{
    error::{CompileError, CompileResult},
    foreign::ForeignRegistry,
    types::{Alloc, DefKind, PrimKind, Type, Var},
};

/// Properties a function declares in the symbol table.
///
/// These drive the call-emission decision tree: builtins lower to foreign
/// calls or operator instructions, composites to function calls with sync
/// or control mode, wrapped builtins and apps through generated wrappers.
#[bitflags]
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FnProp {
    Builtin,
    WrappedBuiltin,
    App,
    Composite,
    Sync,
    Control,
    Parallel,
    Targetable,
    Deprecated,
    Checkpointed,
}

/// A set of function properties.
pub type FnProps = BitFlags<FnProp>;

/// A function's parameter and result types.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FunctionSig {
    pub inputs: Vec<Type>,
    pub outputs: Vec<Type>,
}

/// Symbol-table entry for a callable function.
#[derive(Debug, Clone)]
pub struct FunctionInfo {
    pub props: FnProps,
    pub sig: FunctionSig,
    /// Intrinsics bypass normal call lowering entirely.
    pub intrinsic: bool,
    /// The callee never reads its outputs' prior state.
    pub output_write_only: bool,
}

impl FunctionInfo {
    #[must_use]
    pub fn new(props: FnProps, sig: FunctionSig) -> Self {
        Self {
            props,
            sig,
            intrinsic: false,
            output_write_only: false,
        }
    }
}

/// What kind of scope a stack entry is.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ScopeKind {
    Global,
    Function { name: String },
    Block,
}

/// One scope: its declared variables and, for function scopes, the
/// counter pool used to mint unique compiler names.
#[derive(Debug, Clone)]
struct Scope {
    kind: ScopeKind,
    vars: AHashMap<String, Var>,
    counter: u32,
}

impl Scope {
    fn new(kind: ScopeKind) -> Self {
        Self {
            kind,
            vars: AHashMap::new(),
            counter: 0,
        }
    }
}

/// The context stack threaded through the walker.
#[derive(Debug, Clone)]
pub struct ContextStack {
    scopes: Vec<Scope>,
    /// Function symbol table, in definition order.
    functions: IndexMap<String, FunctionInfo>,
    foreign: ForeignRegistry,
    /// Named (struct) types, in definition order.
    named_types: IndexMap<String, Type>,
    line: u32,
}

impl ContextStack {
    /// Creates a stack holding only the global scope.
    #[must_use]
    pub fn new(foreign: ForeignRegistry) -> Self {
        Self {
            scopes: vec![Scope::new(ScopeKind::Global)],
            functions: IndexMap::new(),
            foreign,
            named_types: IndexMap::new(),
            line: 0,
        }
    }

    /// Sets the source line subsequent errors are attached to.
    pub fn set_line(&mut self, line: u32) {
        self.line = line;
    }

    #[must_use]
    pub fn line(&self) -> u32 {
        self.line
    }

    #[must_use]
    pub fn foreign(&self) -> &ForeignRegistry {
        &self.foreign
    }

    pub fn foreign_mut(&mut self) -> &mut ForeignRegistry {
        &mut self.foreign
    }

    /// Enters a function scope with a fresh counter pool.
    pub fn push_function(&mut self, name: impl Into<String>) {
        self.scopes.push(Scope::new(ScopeKind::Function { name: name.into() }));
    }

    /// Enters a block scope.
    pub fn push_block(&mut self) {
        self.scopes.push(Scope::new(ScopeKind::Block));
    }

    /// Leaves the innermost scope, tearing down its variables.
    pub fn pop_scope(&mut self) -> CompileResult<()> {
        if self.scopes.len() <= 1 {
            return Err(CompileError::internal("attempted to pop the global scope"));
        }
        self.scopes.pop();
        Ok(())
    }

    /// The name of the enclosing function, if inside one.
    #[must_use]
    pub fn function_context_name(&self) -> Option<&str> {
        self.scopes.iter().rev().find_map(|scope| match &scope.kind {
            ScopeKind::Function { name } => Some(name.as_str()),
            _ => None,
        })
    }

    /// Declares a variable in the innermost scope.
    ///
    /// Raises a definition error on a double define, and a type/name
    /// error when a file mapping names an undeclared or non-string
    /// variable.
    pub fn declare_variable(&mut self, var: Var) -> CompileResult<Var> {
        if let Some(mapping) = &var.mapping {
            if !var.ty.is_file() {
                return Err(CompileError::type_error(
                    self.line,
                    format!("variable {} has a filename mapping but is not file-typed", var.name),
                ));
            }
            let declared = self.lookup_var(&mapping.name).ok_or_else(|| {
                CompileError::name_error(
                    self.line,
                    format!("mapping target {} of {} is not declared", mapping.name, var.name),
                )
            })?;
            if declared.ty.prim_kind() != Some(PrimKind::String) {
                return Err(CompileError::type_error(
                    self.line,
                    format!("mapping target {} of {} must be a string", mapping.name, var.name),
                ));
            }
        }
        let scope = self.scopes.last_mut().expect("context stack has a global scope");
        if scope.vars.contains_key(&var.name) {
            return Err(CompileError::definition_error(
                self.line,
                format!("variable {} defined twice in the same scope", var.name),
            ));
        }
        scope.vars.insert(var.name.clone(), var.clone());
        Ok(var)
    }

    /// Looks a variable up, chasing parent scopes.
    #[must_use]
    pub fn lookup_var(&self, name: &str) -> Option<&Var> {
        self.scopes.iter().rev().find_map(|scope| scope.vars.get(name))
    }

    /// Looks a variable up, raising a name error if undeclared.
    pub fn lookup_def(&self, name: &str) -> CompileResult<&Var> {
        self.lookup_var(name)
            .ok_or_else(|| CompileError::name_error(self.line, format!("undefined variable {name}")))
    }

    /// All variables visible from the innermost scope. Inner declarations
    /// shadow outer ones.
    #[must_use]
    pub fn visible_variables(&self) -> Vec<Var> {
        let mut seen = AHashMap::new();
        for scope in self.scopes.iter().rev() {
            for (name, var) in &scope.vars {
                seen.entry(name.clone()).or_insert_with(|| var.clone());
            }
        }
        seen.into_values().collect()
    }

    /// Registers a named type (struct definitions).
    pub fn register_type(&mut self, name: impl Into<String>, ty: Type) {
        self.named_types.insert(name.into(), ty);
    }

    /// Looks a named type up without raising; callers decide whether a
    /// miss is an error.
    #[must_use]
    pub fn lookup_type_unsafe(&self, name: &str) -> Option<&Type> {
        self.named_types.get(name)
    }

    /// Defines a function in the symbol table.
    ///
    /// Only the global context may define functions; an attempt from a
    /// nested scope is a programmer error.
    pub fn define_function(&mut self, name: impl Into<String>, info: FunctionInfo) -> CompileResult<()> {
        if self.scopes.len() > 1 {
            return Err(CompileError::definition_error(
                self.line,
                "functions may only be defined in the global context",
            ));
        }
        let name = name.into();
        if self.functions.contains_key(&name) {
            return Err(CompileError::definition_error(
                self.line,
                format!("function {name} defined twice"),
            ));
        }
        self.functions.insert(name, info);
        Ok(())
    }

    #[must_use]
    pub fn function_info(&self, name: &str) -> Option<&FunctionInfo> {
        self.functions.get(name)
    }

    /// Looks a function up, raising a name error if unknown.
    pub fn lookup_function(&self, name: &str) -> CompileResult<&FunctionInfo> {
        self.function_info(name)
            .ok_or_else(|| CompileError::name_error(self.line, format!("undefined function {name}")))
    }

    #[must_use]
    pub fn has_function_prop(&self, name: &str, prop: FnProp) -> bool {
        self.function_info(name).is_some_and(|f| f.props.contains(prop))
    }

    #[must_use]
    pub fn is_intrinsic(&self, name: &str) -> bool {
        self.function_info(name).is_some_and(|f| f.intrinsic)
    }

    /// Mints a fresh name with the given prefix from the enclosing
    /// function's counter pool (or the global pool outside functions).
    pub fn unique_name(&mut self, prefix: &str) -> String {
        loop {
            let counter = {
                let scope = self
                    .scopes
                    .iter_mut()
                    .rev()
                    .find(|s| !matches!(s.kind, ScopeKind::Block))
                    .expect("context stack has a global scope");
                let value = scope.counter;
                scope.counter += 1;
                value
            };
            let name = format!("{prefix}{counter}");
            if self.lookup_var(&name).is_none() {
                return name;
            }
        }
    }

    /// Creates and declares a temporary future-holding variable.
    pub fn create_tmp(&mut self, ty: Type) -> CompileResult<Var> {
        let name = self.unique_name("tmp");
        self.declare_variable(Var::new(name, ty, Alloc::Temp, DefKind::LocalCompiler))
    }

    /// Creates and declares an alias variable: a handle to storage owned
    /// elsewhere.
    pub fn create_alias_var(&mut self, ty: Type) -> CompileResult<Var> {
        let name = self.unique_name("alias");
        self.declare_variable(Var::new(name, ty, Alloc::Alias, DefKind::LocalCompiler))
    }

    /// Creates and declares a local value variable.
    pub fn create_local_value_var(&mut self, ty: Type) -> CompileResult<Var> {
        let name = self.unique_name("v");
        self.declare_variable(Var::new(name, ty, Alloc::Local, DefKind::LocalCompiler))
    }

    /// Creates and declares an alias for a struct field, named after the
    /// root variable and full field path.
    pub fn create_struct_field_tmp(&mut self, root: &Var, path: &[String], ty: Type, alloc: Alloc) -> CompileResult<Var> {
        let base = format!("f_{}_{}", root.name, path.join("_"));
        let name = if self.lookup_var(&base).is_none() {
            base
        } else {
            self.unique_name(&format!("{base}_"))
        };
        self.declare_variable(Var::new(name, ty, alloc, DefKind::LocalCompiler))
    }

    /// Creates and declares a filename alias for a file variable.
    pub fn create_filename_alias(&mut self, file: &Var) -> CompileResult<Var> {
        let base = format!("filename_of_{}", file.name);
        let name = if self.lookup_var(&base).is_none() {
            base
        } else {
            self.unique_name(&format!("{base}_"))
        };
        self.declare_variable(Var::new(
            name,
            Type::PrimFuture(PrimKind::String),
            Alloc::Alias,
            DefKind::LocalCompiler,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ContextStack {
        ContextStack::new(ForeignRegistry::with_specials())
    }

    #[test]
    fn test_double_define_fails() {
        let mut ctx = ctx();
        let v = Var::new("x", Type::PrimFuture(PrimKind::Int), Alloc::Stack, DefKind::LocalUser);
        ctx.declare_variable(v.clone()).unwrap();
        let err = ctx.declare_variable(v).unwrap_err();
        assert!(matches!(err, CompileError::Definition { .. }));
    }

    #[test]
    fn test_lookup_chases_parents() {
        let mut ctx = ctx();
        let v = Var::new("x", Type::PrimFuture(PrimKind::Int), Alloc::Stack, DefKind::LocalUser);
        ctx.declare_variable(v.clone()).unwrap();
        ctx.push_function("f");
        ctx.push_block();
        assert_eq!(ctx.lookup_var("x"), Some(&v));
        // Shadowing in the inner scope wins.
        let inner = Var::new("x", Type::PrimFuture(PrimKind::Float), Alloc::Stack, DefKind::LocalUser);
        ctx.declare_variable(inner.clone()).unwrap();
        assert_eq!(ctx.lookup_var("x"), Some(&inner));
        ctx.pop_scope().unwrap();
        assert_eq!(ctx.lookup_var("x"), Some(&v));
    }

    #[test]
    fn test_fresh_names_per_function() {
        let mut ctx = ctx();
        ctx.push_function("f");
        let t0 = ctx.create_tmp(Type::PrimFuture(PrimKind::Int)).unwrap();
        let t1 = ctx.create_tmp(Type::PrimFuture(PrimKind::Int)).unwrap();
        assert_eq!(t0.name, "tmp0");
        assert_eq!(t1.name, "tmp1");
        assert_eq!(t0.alloc, Alloc::Temp);

        let a = ctx.create_alias_var(Type::PrimFuture(PrimKind::Int)).unwrap();
        assert_eq!(a.alloc, Alloc::Alias);
        assert!(a.name.starts_with("alias"));

        ctx.pop_scope().unwrap();
        ctx.push_function("g");
        // Fresh counter pool in the new function.
        let t = ctx.create_tmp(Type::PrimFuture(PrimKind::Int)).unwrap();
        assert_eq!(t.name, "tmp0");
    }

    #[test]
    fn test_function_definition_only_global() {
        let mut ctx = ctx();
        let sig = FunctionSig {
            inputs: Vec::new(),
            outputs: Vec::new(),
        };
        ctx.define_function("f", FunctionInfo::new(FnProp::Composite.into(), sig.clone()))
            .unwrap();
        assert!(ctx.has_function_prop("f", FnProp::Composite));
        assert!(!ctx.has_function_prop("f", FnProp::Sync));

        ctx.push_function("f");
        let err = ctx
            .define_function("g", FunctionInfo::new(FnProp::Composite.into(), sig))
            .unwrap_err();
        assert!(matches!(err, CompileError::Definition { .. }));
    }

    #[test]
    fn test_mapping_target_must_be_declared_string() {
        let mut ctx = ctx();
        let fname = Var::new("fname", Type::PrimFuture(PrimKind::String), Alloc::Stack, DefKind::LocalUser);
        let mapped = Var::new_mapped(
            "f",
            Type::PrimFuture(PrimKind::File),
            Alloc::Stack,
            DefKind::LocalUser,
            fname.clone(),
        );
        // Mapping target not declared yet.
        assert!(ctx.declare_variable(mapped.clone()).is_err());
        ctx.declare_variable(fname).unwrap();
        ctx.declare_variable(mapped).unwrap();
    }

    #[test]
    fn test_struct_field_tmp_naming() {
        let mut ctx = ctx();
        ctx.push_function("f");
        let root = Var::new(
            "s",
            Type::PrimFuture(PrimKind::Int),
            Alloc::Stack,
            DefKind::LocalUser,
        );
        let path = vec!["inner".to_string(), "field".to_string()];
        let alias = ctx
            .create_struct_field_tmp(&root, &path, Type::PrimFuture(PrimKind::Int), Alloc::Alias)
            .unwrap();
        assert_eq!(alias.name, "f_s_inner_field");
        // A second lookup of the same path gets a suffixed name.
        let alias2 = ctx
            .create_struct_field_tmp(&root, &path, Type::PrimFuture(PrimKind::Int), Alloc::Alias)
            .unwrap();
        assert_ne!(alias.name, alias2.name);
    }
}

//! Structural sanity pass over lowered programs.
//!
//! Runs after the walker (standard mode) or after refcount insertion
//! (final mode). All violations are internal invariant errors: the
//! validator guards the compiler against itself, not the user against
//! their program. The pass never mutates, so validating twice is the
//! same as validating once.

use ahash::AHashMap;

use crate::{
    error::{CompileError, CompileResult},
    ir::{Block, BlockId, Function, Instr, Opcode, Program, Statement},
    types::{Alloc, PrimKind, Var},
};

/// Which rule set to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidatorMode {
    /// Pre-refcount IR: refcount opcodes must be absent and cleanup
    /// placement is checked.
    Standard,
    /// Post-refcount IR: refcount opcodes are expected; cleanup and
    /// passing checks are disabled.
    Final,
}

/// Validates a program in standard mode.
pub fn validate(program: &Program) -> CompileResult<()> {
    Validator::new(ValidatorMode::Standard).validate(program)
}

/// Validates a program in final mode (post-refcount IR).
pub fn validate_final(program: &Program) -> CompileResult<()> {
    Validator::new(ValidatorMode::Final).validate(program)
}

/// The structural validator.
#[derive(Debug, Clone, Copy)]
pub struct Validator {
    mode: ValidatorMode,
}

impl Validator {
    #[must_use]
    pub fn new(mode: ValidatorMode) -> Self {
        Self { mode }
    }

    pub fn validate(&self, program: &Program) -> CompileResult<()> {
        for function in &program.functions {
            self.validate_function(program, function)?;
        }
        Ok(())
    }

    fn validate_function(&self, program: &Program, func: &Function) -> CompileResult<()> {
        let names = self.collect_unique_names(program, func)?;
        self.check_mappings(func, &names)?;
        self.check_parent_links(func)?;

        // Visible-variable computation (non-mutating): walk the block
        // tree with a scope chain and check every variable reference and
        // cleanup against it.
        let mut visible = AHashMap::new();
        for var in program.globals.iter().chain(&func.inputs).chain(&func.outputs) {
            visible.insert(var.name.clone(), var.clone());
        }
        self.validate_block(func, func.main_block(), &visible, true)
    }

    /// Collects every variable the function declares and rejects
    /// duplicate names.
    fn collect_unique_names(&self, program: &Program, func: &Function) -> CompileResult<AHashMap<String, Var>> {
        let mut seen: AHashMap<String, Var> = AHashMap::new();
        let mut declare = |var: &Var, what: &str| -> CompileResult<()> {
            if seen.insert(var.name.clone(), var.clone()).is_some() {
                return Err(CompileError::internal(format!(
                    "{what} {} declared twice in function {}",
                    var.name, func.name
                )));
            }
            Ok(())
        };
        for var in &func.inputs {
            declare(var, "input")?;
        }
        for var in &func.outputs {
            declare(var, "output")?;
        }
        for (_, block) in func.blocks() {
            for var in &block.declared {
                declare(var, "variable")?;
            }
            for cont in &block.continuations {
                for var in cont.construct_vars() {
                    declare(&var, "construct variable")?;
                }
            }
        }
        for var in &program.globals {
            // Globals may shadow nothing; a function-local reusing the
            // name is a defect.
            if seen.contains_key(&var.name) {
                return Err(CompileError::internal(format!(
                    "variable {} in function {} collides with a global constant",
                    var.name, func.name
                )));
            }
        }
        Ok(seen)
    }

    /// Mapping targets must be declared and string-typed.
    fn check_mappings(&self, func: &Function, names: &AHashMap<String, Var>) -> CompileResult<()> {
        for var in names.values() {
            let Some(mapping) = &var.mapping else { continue };
            let Some(target) = names.get(&mapping.name) else {
                return Err(CompileError::internal(format!(
                    "mapping target {} of {} is not declared in function {}",
                    mapping.name, var.name, func.name
                )));
            };
            if target.ty.prim_kind() != Some(PrimKind::String) {
                return Err(CompileError::internal(format!(
                    "mapping target {} of {} is not string-typed",
                    mapping.name, var.name
                )));
            }
        }
        Ok(())
    }

    /// Every block is either the main block (no parent) or referenced by
    /// exactly one continuation or conditional of its recorded parent.
    fn check_parent_links(&self, func: &Function) -> CompileResult<()> {
        let mut referenced: AHashMap<u32, BlockId> = AHashMap::new();
        for (id, block) in func.blocks() {
            for cont in &block.continuations {
                if referenced.insert(cont.block().0, id).is_some() {
                    return Err(CompileError::internal(format!(
                        "block {} referenced by more than one construct in function {}",
                        cont.block().0,
                        func.name
                    )));
                }
            }
            for statement in &block.statements {
                if let Statement::Conditional(cond) = statement {
                    let mut arms = vec![cond.then_block];
                    arms.extend(cond.else_block);
                    for arm in arms {
                        if referenced.insert(arm.0, id).is_some() {
                            return Err(CompileError::internal(format!(
                                "block {} referenced by more than one construct in function {}",
                                arm.0, func.name
                            )));
                        }
                    }
                }
            }
        }
        for (id, block) in func.blocks() {
            match (id == func.main_block(), block.parent, referenced.get(&id.0)) {
                (true, None, None) => {}
                (true, _, _) => {
                    return Err(CompileError::internal(format!(
                        "main block of function {} has a parent link",
                        func.name
                    )));
                }
                (false, Some(parent), Some(owner)) if parent == *owner => {}
                (false, _, _) => {
                    return Err(CompileError::internal(format!(
                        "block {} of function {} has a broken parent link",
                        id.0, func.name
                    )));
                }
            }
        }
        Ok(())
    }

    fn validate_block(
        &self,
        func: &Function,
        id: BlockId,
        visible_above: &AHashMap<String, Var>,
        is_main: bool,
    ) -> CompileResult<()> {
        let block = func.block(id);
        let mut visible = visible_above.clone();
        for var in &block.declared {
            visible.insert(var.name.clone(), var.clone());
        }

        for statement in &block.statements {
            match statement {
                Statement::Instr(instr) => self.check_instr(func, instr, &visible)?,
                Statement::Conditional(cond) => {
                    self.check_var_ref(func, cond.condition.as_var(), &visible, "conditional")?;
                    self.validate_block(func, cond.then_block, &visible, false)?;
                    if let Some(else_block) = cond.else_block {
                        self.validate_block(func, else_block, &visible, false)?;
                    }
                }
            }
        }

        self.check_cleanups(func, id, block, is_main)?;

        for cont in &block.continuations {
            let mut body_visible = visible.clone();
            for var in cont.construct_vars() {
                body_visible.insert(var.name.clone(), var.clone());
            }
            self.validate_block(func, cont.block(), &body_visible, false)?;
        }
        Ok(())
    }

    fn check_instr(&self, func: &Function, instr: &Instr, visible: &AHashMap<String, Var>) -> CompileResult<()> {
        if self.mode == ValidatorMode::Standard && instr.opcode().is_refcount_op() {
            return Err(CompileError::internal(format!(
                "refcount instruction {} present before refcount insertion in function {}",
                instr.opcode(),
                func.name
            )));
        }
        for arg in instr.inputs() {
            self.check_var_ref(func, arg.as_var(), visible, "input")?;
        }
        for out in instr.outputs() {
            self.check_var_ref(func, Some(&out), visible, "output")?;
            self.check_output_alloc(func, instr, &out)?;
        }
        Ok(())
    }

    /// Output allocation classes must be compatible with the opcode:
    /// local operations and loads produce local values, stores and async
    /// operations produce backend-visible futures.
    fn check_output_alloc(&self, func: &Function, instr: &Instr, out: &Var) -> CompileResult<()> {
        let op = instr.opcode();
        let wants_local = matches!(
            op,
            Opcode::LocalOp
                | Opcode::CallForeignLocal
                | Opcode::LatestValue
                | Opcode::GetFilenameVal
                | Opcode::LookupCheckpoint
                | Opcode::PackValues
                | Opcode::InitLocalOutputFile
                | Opcode::ChooseTmpFilename
        ) || op.is_load();
        let wants_future = op.is_store() || matches!(op, Opcode::AsyncOp);
        let ok = if wants_local {
            out.alloc == Alloc::Local
        } else if wants_future {
            out.alloc != Alloc::Local
        } else {
            true
        };
        if ok {
            Ok(())
        } else {
            Err(CompileError::internal(format!(
                "output {} of {op} has incompatible allocation class {} in function {}",
                out.name, out.alloc, func.name
            )))
        }
    }

    /// A referenced variable must be visible and identical (name,
    /// storage, type, mapping) to its declaration.
    fn check_var_ref(
        &self,
        func: &Function,
        var: Option<&Var>,
        visible: &AHashMap<String, Var>,
        what: &str,
    ) -> CompileResult<()> {
        let Some(var) = var else { return Ok(()) };
        match visible.get(&var.name) {
            None => Err(CompileError::internal(format!(
                "{what} variable {} is not in scope in function {}",
                var.name, func.name
            ))),
            Some(declared) if declared != var => Err(CompileError::internal(format!(
                "{what} variable {} does not match its declaration in function {} ({} vs {})",
                var.name, func.name, var.ty, declared.ty
            ))),
            Some(_) => Ok(()),
        }
    }

    /// A cleanup on block `B` references a variable declared in `B`, a
    /// construct-defined variable of `B`'s parent continuation, or (in a
    /// main block) a function input or output.
    fn check_cleanups(&self, func: &Function, id: BlockId, block: &Block, is_main: bool) -> CompileResult<()> {
        if self.mode == ValidatorMode::Final {
            return Ok(());
        }
        for cleanup in &block.cleanups {
            let declared_here = block.declared.contains(&cleanup.var);
            let construct_defined = block.parent.is_some_and(|parent| {
                func.block(parent)
                    .continuations
                    .iter()
                    .any(|cont| cont.block() == id && cont.construct_vars().contains(&cleanup.var))
            });
            let io_of_main =
                is_main && (func.inputs.contains(&cleanup.var) || func.outputs.contains(&cleanup.var));
            if !(declared_here || construct_defined || io_of_main) {
                return Err(CompileError::internal(format!(
                    "cleanup for {} attached to a block where it is not in scope (function {})",
                    cleanup.var.name, func.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        arg::Arg,
        ir::{Builtin, BuiltinOp, CleanupAction, RcKind, TurbineOp},
        types::{DefKind, Type},
    };

    use super::*;

    fn int_fut(name: &str) -> Var {
        Var::new(name, Type::PrimFuture(PrimKind::Int), Alloc::Stack, DefKind::LocalUser)
    }

    fn program_with(func: Function) -> Program {
        let mut program = Program::new();
        program.add_function(func);
        program
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut func = Function::new("main", Vec::new(), Vec::new());
        let main = func.main_block();
        func.declare(main, int_fut("v"));
        func.declare(main, int_fut("v"));
        let err = validate(&program_with(func)).unwrap_err();
        assert!(matches!(err, CompileError::Internal { .. }));
    }

    #[test]
    fn test_reference_must_match_declaration() {
        let mut func = Function::new("main", Vec::new(), Vec::new());
        let main = func.main_block();
        func.declare(main, int_fut("x"));
        // Same name, different type: not identical to the declaration.
        let wrong = Var::new("x", Type::PrimFuture(PrimKind::Float), Alloc::Stack, DefKind::LocalUser);
        func.push_instr(main, Instr::Turbine(TurbineOp::store_scalar(wrong, Arg::int(1))));
        assert!(validate(&program_with(func)).is_err());

        let mut ok = Function::new("main", Vec::new(), Vec::new());
        let main = ok.main_block();
        ok.declare(main, int_fut("x"));
        ok.push_instr(main, Instr::Turbine(TurbineOp::store_scalar(int_fut("x"), Arg::int(1))));
        validate(&program_with(ok)).unwrap();
    }

    #[test]
    fn test_refcount_ops_rejected_in_standard_mode_only() {
        let mut func = Function::new("main", Vec::new(), Vec::new());
        let main = func.main_block();
        func.declare(main, int_fut("x"));
        let x = int_fut("x");
        func.push_instr(main, Instr::Turbine(TurbineOp::refcount(RcKind::Readers, true, &x, 1)));
        let program = program_with(func);
        assert!(validate(&program).is_err());
        validate_final(&program).unwrap();
    }

    #[test]
    fn test_cleanup_out_of_scope_rejected() {
        let mut func = Function::new("main", Vec::new(), Vec::new());
        let main = func.main_block();
        let stray = int_fut("stray");
        func.block_mut(main).cleanups.push(CleanupAction {
            var: stray.clone(),
            action: Instr::Turbine(TurbineOp::refcount(RcKind::Readers, false, &stray, 1)),
        });
        assert!(validate(&program_with(func)).is_err());
    }

    #[test]
    fn test_local_op_output_must_be_local() {
        let mut func = Function::new("main", Vec::new(), Vec::new());
        let main = func.main_block();
        // A local operation writing a backend-visible future is rejected.
        func.declare(main, int_fut("x"));
        func.push_instr(
            main,
            Instr::Builtin(Builtin::local(BuiltinOp::CopyInt, Some(int_fut("x")), vec![Arg::int(1)])),
        );
        assert!(validate(&program_with(func)).is_err());
    }

    #[test]
    fn test_validator_is_idempotent() {
        let mut func = Function::new("main", Vec::new(), Vec::new());
        let main = func.main_block();
        func.declare(main, int_fut("x"));
        func.push_instr(main, Instr::Turbine(TurbineOp::store_scalar(int_fut("x"), Arg::int(1))));
        let program = program_with(func);
        validate(&program).unwrap();
        // The pass never mutates, so a second run sees the same program.
        validate(&program).unwrap();
    }
}

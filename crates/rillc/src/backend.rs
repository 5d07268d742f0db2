//! The emission contract the walker targets, and its IR implementation.
//!
//! The walker never builds IR nodes directly: it drives a [`Backend`],
//! the one-way channel to the emitter. [`IrEmitter`] is the crate's
//! implementation, materializing backend calls as instructions and
//! continuations in a [`Function`] under construction. Alternative
//! backends (e.g. a textual tracer for tests) implement the same trait.

use crate::{
    arg::Arg,
    error::{CompileError, CompileResult},
    ir::{
        Block, BlockId, BlockKind, Builtin, BuiltinOp, Comment, Conditional, Continuation, ForeignCall, Function,
        FunctionCall, Instr, LocalForeignCall, Statement, TaskMode, TaskProps, TurbineOp, WaitMode,
    },
    types::{PrimKind, Var},
};

/// The emission operations the walker requires.
///
/// Data-movement operations mirror the turbine primitives; control
/// operations open and close nested constructs, which must be closed in
/// LIFO order.
pub trait Backend {
    /// Records a variable declaration in the current block.
    fn declare(&mut self, var: &Var) -> CompileResult<()>;

    fn comment(&mut self, text: &str) -> CompileResult<()>;

    // Primitive data movement: local values into futures.
    fn assign_scalar(&mut self, dst: &Var, src: &Arg) -> CompileResult<()>;
    fn assign_file(&mut self, dst: &Var, src: &Arg) -> CompileResult<()>;
    fn assign_array(&mut self, dst: &Var, src: &Arg) -> CompileResult<()>;
    fn assign_bag(&mut self, dst: &Var, src: &Arg) -> CompileResult<()>;
    fn assign_ref(&mut self, dst: &Var, src: &Var) -> CompileResult<()>;
    fn store_recursive(&mut self, dst: &Var, src: &Arg) -> CompileResult<()>;

    // Futures into local values. Container retrieves are shallow;
    // `retrieve_recursive` fetches contents recursively.
    fn retrieve_scalar(&mut self, dst: &Var, src: &Var) -> CompileResult<()>;
    fn retrieve_file(&mut self, dst: &Var, src: &Var) -> CompileResult<()>;
    fn retrieve_array(&mut self, dst: &Var, src: &Var) -> CompileResult<()>;
    fn retrieve_bag(&mut self, dst: &Var, src: &Var) -> CompileResult<()>;
    fn retrieve_ref(&mut self, dst: &Var, src: &Var) -> CompileResult<()>;
    fn retrieve_recursive(&mut self, dst: &Var, src: &Var) -> CompileResult<()>;

    // Dereference.
    fn deref_scalar(&mut self, dst: &Var, src: &Var) -> CompileResult<()>;
    fn deref_file(&mut self, dst: &Var, src: &Var) -> CompileResult<()>;

    // Container operations.
    fn array_lookup_ref_imm(&mut self, out: &Var, arr: &Var, ix: &Arg) -> CompileResult<()>;
    fn array_lookup_future(&mut self, out: &Var, arr: &Var, ix: &Var) -> CompileResult<()>;
    fn array_insert_imm(&mut self, arr: &Var, ix: &Arg, val: &Arg) -> CompileResult<()>;
    fn array_insert_future(&mut self, arr: &Var, ix: &Var, val: &Arg) -> CompileResult<()>;
    fn array_build(&mut self, arr: &Var, keys: &[Arg], vals: &[Arg]) -> CompileResult<()>;
    fn bag_insert(&mut self, bag: &Var, val: &Arg) -> CompileResult<()>;

    // Struct operations.
    fn struct_lookup(&mut self, out: &Var, st: &Var, path: &[String]) -> CompileResult<()>;
    fn struct_ref_lookup(&mut self, out: &Var, st: &Var, path: &[String]) -> CompileResult<()>;

    fn copy_file(&mut self, dst: &Var, src: &Var) -> CompileResult<()>;

    // Updateable cells.
    fn latest_value(&mut self, out: &Var, cell: &Var) -> CompileResult<()>;

    // Operator operations.
    fn local_op(&mut self, subop: BuiltinOp, out: Option<&Var>, inputs: &[Arg]) -> CompileResult<()>;
    fn async_op(&mut self, subop: BuiltinOp, out: &Var, inputs: &[Arg], props: TaskProps) -> CompileResult<()>;

    // Control.
    #[expect(clippy::too_many_arguments, reason = "mirrors the wait construct's full parameter set")]
    fn start_wait_statement(
        &mut self,
        name: &str,
        wait_vars: Vec<Var>,
        mode: WaitMode,
        recursive: bool,
        continue_after: bool,
        task_mode: TaskMode,
        props: TaskProps,
    ) -> CompileResult<()>;
    fn end_wait_statement(&mut self) -> CompileResult<()>;
    fn start_foreach_loop(&mut self, loop_name: &str, array: &Var, member: &Var, key: Option<&Var>)
    -> CompileResult<()>;
    fn end_foreach_loop(&mut self) -> CompileResult<()>;
    fn start_if_statement(&mut self, condition: Arg, has_else: bool) -> CompileResult<()>;
    fn start_else_block(&mut self) -> CompileResult<()>;
    fn end_if_statement(&mut self) -> CompileResult<()>;

    // Function dispatch.
    fn function_call(
        &mut self,
        function: &str,
        inputs: &[Arg],
        outputs: &[Var],
        mode: TaskMode,
        props: TaskProps,
    ) -> CompileResult<()>;
    fn builtin_function_call(
        &mut self,
        function: &str,
        inputs: &[Arg],
        outputs: &[Var],
        props: TaskProps,
    ) -> CompileResult<()>;
    fn builtin_local_function_call(&mut self, function: &str, inputs: &[Arg], outputs: &[Var]) -> CompileResult<()>;
    fn intrinsic_call(&mut self, function: &str, inputs: &[Arg], outputs: &[Var]) -> CompileResult<()>;

    // Checkpointing. The enabled queries are compile-time configuration;
    // the rest are emissions.
    fn checkpoint_lookup_enabled(&self) -> bool;
    fn checkpoint_write_enabled(&self) -> bool;
    fn lookup_checkpoint(&mut self, exists_out: &Var, val_out: &Var, key: &Arg) -> CompileResult<()>;
    fn write_checkpoint(&mut self, key: &Arg, val: &Arg) -> CompileResult<()>;
    fn pack_values(&mut self, out: &Var, vals: &[Arg]) -> CompileResult<()>;
    fn unpack_values(&mut self, outs: &[Var], blob: &Arg) -> CompileResult<()>;
    fn free_blob(&mut self, var: &Var) -> CompileResult<()>;
}

/// A construct opened by a `start_*` call and not yet closed.
#[derive(Debug)]
enum OpenConstruct {
    Wait { block: BlockId },
    Foreach { block: BlockId },
    If { then_block: BlockId, else_block: Option<BlockId>, in_else: bool },
}

/// Backend implementation that builds IR.
#[derive(Debug)]
pub struct IrEmitter {
    func: Function,
    open: Vec<OpenConstruct>,
    checkpoint_lookup: bool,
    checkpoint_write: bool,
}

impl IrEmitter {
    /// Starts emitting a function with the given signature. Checkpoint
    /// lookup and write are disabled until configured.
    #[must_use]
    pub fn new(name: impl Into<String>, inputs: Vec<Var>, outputs: Vec<Var>) -> Self {
        Self {
            func: Function::new(name, inputs, outputs),
            open: Vec::new(),
            checkpoint_lookup: false,
            checkpoint_write: false,
        }
    }

    /// Configures whether emitted programs look up and write checkpoints.
    #[must_use]
    pub fn with_checkpointing(mut self, lookup: bool, write: bool) -> Self {
        self.checkpoint_lookup = lookup;
        self.checkpoint_write = write;
        self
    }

    /// The block emission currently targets.
    fn current_block(&self) -> BlockId {
        match self.open.last() {
            None => self.func.main_block(),
            Some(OpenConstruct::Wait { block } | OpenConstruct::Foreach { block }) => *block,
            Some(OpenConstruct::If {
                then_block,
                else_block,
                in_else,
            }) => {
                if *in_else {
                    else_block.expect("in_else implies an else block")
                } else {
                    *then_block
                }
            }
        }
    }

    fn push(&mut self, instr: Instr) {
        let block = self.current_block();
        self.func.push_instr(block, instr);
    }

    /// Finishes emission, failing if any construct is still open.
    pub fn into_function(self) -> CompileResult<Function> {
        if !self.open.is_empty() {
            return Err(CompileError::internal(format!(
                "{} construct(s) left open at end of function {}",
                self.open.len(),
                self.func.name
            )));
        }
        Ok(self.func)
    }

    /// Read access to the function under construction (for tests and
    /// diagnostics).
    #[must_use]
    pub fn function(&self) -> &Function {
        &self.func
    }

    /// The current block's contents (for tests).
    #[must_use]
    pub fn current_block_ref(&self) -> &Block {
        self.func.block(self.current_block())
    }

    fn require_future_kind(&self, var: &Var, what: &str) -> CompileResult<()> {
        if var.ty.is_prim_future() {
            Ok(())
        } else {
            Err(CompileError::type_error_no_line(format!(
                "{what} destination {} must be a future, not {}",
                var.name, var.ty
            )))
        }
    }
}

impl Backend for IrEmitter {
    fn declare(&mut self, var: &Var) -> CompileResult<()> {
        let block = self.current_block();
        self.func.declare(block, var.clone());
        Ok(())
    }

    fn comment(&mut self, text: &str) -> CompileResult<()> {
        self.push(Instr::Comment(Comment { text: text.to_string() }));
        Ok(())
    }

    fn assign_scalar(&mut self, dst: &Var, src: &Arg) -> CompileResult<()> {
        self.require_future_kind(dst, "scalar assign")?;
        self.push(Instr::Turbine(TurbineOp::store_scalar(dst.clone(), src.clone())));
        Ok(())
    }

    fn assign_file(&mut self, dst: &Var, src: &Arg) -> CompileResult<()> {
        self.push(Instr::Turbine(TurbineOp::store_file(dst.clone(), src.clone())));
        Ok(())
    }

    fn assign_array(&mut self, dst: &Var, src: &Arg) -> CompileResult<()> {
        self.push(Instr::Turbine(TurbineOp::store_array(dst.clone(), src.clone())));
        Ok(())
    }

    fn assign_bag(&mut self, dst: &Var, src: &Arg) -> CompileResult<()> {
        self.push(Instr::Turbine(TurbineOp::store_bag(dst.clone(), src.clone())));
        Ok(())
    }

    fn assign_ref(&mut self, dst: &Var, src: &Var) -> CompileResult<()> {
        if !dst.ty.is_ref() {
            return Err(CompileError::type_error_no_line(format!(
                "ref assign destination {} must be a ref, not {}",
                dst.name, dst.ty
            )));
        }
        self.push(Instr::Turbine(TurbineOp::store_ref(dst.clone(), Arg::from(src))));
        Ok(())
    }

    fn store_recursive(&mut self, dst: &Var, src: &Arg) -> CompileResult<()> {
        self.push(Instr::Turbine(TurbineOp::store_recursive(dst.clone(), src.clone())));
        Ok(())
    }

    fn retrieve_scalar(&mut self, dst: &Var, src: &Var) -> CompileResult<()> {
        self.push(Instr::Turbine(TurbineOp::load_scalar(dst.clone(), src)));
        Ok(())
    }

    fn retrieve_file(&mut self, dst: &Var, src: &Var) -> CompileResult<()> {
        self.push(Instr::Turbine(TurbineOp::load_file(dst.clone(), src)));
        Ok(())
    }

    fn retrieve_array(&mut self, dst: &Var, src: &Var) -> CompileResult<()> {
        self.push(Instr::Turbine(TurbineOp::load_array(dst.clone(), src)));
        Ok(())
    }

    fn retrieve_bag(&mut self, dst: &Var, src: &Var) -> CompileResult<()> {
        self.push(Instr::Turbine(TurbineOp::load_bag(dst.clone(), src)));
        Ok(())
    }

    fn retrieve_ref(&mut self, dst: &Var, src: &Var) -> CompileResult<()> {
        self.push(Instr::Turbine(TurbineOp::load_ref(dst.clone(), src)));
        Ok(())
    }

    fn retrieve_recursive(&mut self, dst: &Var, src: &Var) -> CompileResult<()> {
        self.push(Instr::Turbine(TurbineOp::load_recursive(dst.clone(), src)));
        Ok(())
    }

    fn deref_scalar(&mut self, dst: &Var, src: &Var) -> CompileResult<()> {
        if !src.ty.is_ref() {
            return Err(CompileError::type_error_no_line(format!(
                "cannot dereference non-ref {} of type {}",
                src.name, src.ty
            )));
        }
        self.push(Instr::Turbine(TurbineOp::deref_scalar(dst.clone(), src)));
        Ok(())
    }

    fn deref_file(&mut self, dst: &Var, src: &Var) -> CompileResult<()> {
        if !src.ty.is_ref() {
            return Err(CompileError::type_error_no_line(format!(
                "cannot dereference non-ref {} of type {}",
                src.name, src.ty
            )));
        }
        self.push(Instr::Turbine(TurbineOp::deref_file(dst.clone(), src)));
        Ok(())
    }

    fn array_lookup_ref_imm(&mut self, out: &Var, arr: &Var, ix: &Arg) -> CompileResult<()> {
        self.push(Instr::Turbine(TurbineOp::array_lookup_ref_imm(
            out.clone(),
            arr,
            ix.clone(),
        )));
        Ok(())
    }

    fn array_lookup_future(&mut self, out: &Var, arr: &Var, ix: &Var) -> CompileResult<()> {
        self.push(Instr::Turbine(TurbineOp::array_lookup_future(out.clone(), arr, ix)));
        Ok(())
    }

    fn array_insert_imm(&mut self, arr: &Var, ix: &Arg, val: &Arg) -> CompileResult<()> {
        self.push(Instr::Turbine(TurbineOp::array_insert_imm(
            arr.clone(),
            ix.clone(),
            val.clone(),
        )));
        Ok(())
    }

    fn array_insert_future(&mut self, arr: &Var, ix: &Var, val: &Arg) -> CompileResult<()> {
        self.push(Instr::Turbine(TurbineOp::array_insert_future(arr.clone(), ix, val.clone())));
        Ok(())
    }

    fn array_build(&mut self, arr: &Var, keys: &[Arg], vals: &[Arg]) -> CompileResult<()> {
        if keys.len() != vals.len() {
            return Err(CompileError::internal(format!(
                "array build key/value arity mismatch: {} vs {}",
                keys.len(),
                vals.len()
            )));
        }
        self.push(Instr::Turbine(TurbineOp::array_build(
            arr.clone(),
            keys.to_vec(),
            vals.to_vec(),
        )));
        Ok(())
    }

    fn bag_insert(&mut self, bag: &Var, val: &Arg) -> CompileResult<()> {
        self.push(Instr::Turbine(TurbineOp::bag_insert(bag.clone(), val.clone())));
        Ok(())
    }

    fn struct_lookup(&mut self, out: &Var, st: &Var, path: &[String]) -> CompileResult<()> {
        self.push(Instr::Turbine(TurbineOp::struct_lookup(out.clone(), st, path)));
        Ok(())
    }

    fn struct_ref_lookup(&mut self, out: &Var, st: &Var, path: &[String]) -> CompileResult<()> {
        self.push(Instr::Turbine(TurbineOp::struct_ref_lookup(out.clone(), st, path)));
        Ok(())
    }

    fn copy_file(&mut self, dst: &Var, src: &Var) -> CompileResult<()> {
        self.push(Instr::Turbine(TurbineOp::copy_file(dst.clone(), src)));
        Ok(())
    }

    fn latest_value(&mut self, out: &Var, cell: &Var) -> CompileResult<()> {
        if !cell.ty.is_updateable() {
            return Err(CompileError::type_error_no_line(format!(
                "latest_value source {} must be updateable, not {}",
                cell.name, cell.ty
            )));
        }
        self.push(Instr::Turbine(TurbineOp::latest_value(out.clone(), cell)));
        Ok(())
    }

    fn local_op(&mut self, subop: BuiltinOp, out: Option<&Var>, inputs: &[Arg]) -> CompileResult<()> {
        self.push(Instr::Builtin(Builtin::local(subop, out.cloned(), inputs.to_vec())));
        Ok(())
    }

    fn async_op(&mut self, subop: BuiltinOp, out: &Var, inputs: &[Arg], props: TaskProps) -> CompileResult<()> {
        self.push(Instr::Builtin(Builtin::create_async(
            subop,
            out.clone(),
            inputs.to_vec(),
            props,
        )));
        Ok(())
    }

    #[expect(clippy::too_many_arguments, reason = "mirrors the wait construct's full parameter set")]
    fn start_wait_statement(
        &mut self,
        name: &str,
        wait_vars: Vec<Var>,
        mode: WaitMode,
        recursive: bool,
        continue_after: bool,
        task_mode: TaskMode,
        props: TaskProps,
    ) -> CompileResult<()> {
        let parent = self.current_block();
        let block = self.func.alloc_block(BlockKind::WaitBody, parent);
        self.func
            .block_mut(parent)
            .continuations
            .push(Continuation::Wait(crate::ir::WaitStatement {
                name: name.to_string(),
                wait_vars,
                mode,
                recursive,
                continue_after,
                task_mode,
                props,
                block,
            }));
        self.open.push(OpenConstruct::Wait { block });
        Ok(())
    }

    fn end_wait_statement(&mut self) -> CompileResult<()> {
        match self.open.pop() {
            Some(OpenConstruct::Wait { .. }) => Ok(()),
            other => Err(CompileError::internal(format!(
                "end_wait_statement without matching start (found {other:?})"
            ))),
        }
    }

    fn start_foreach_loop(
        &mut self,
        loop_name: &str,
        array: &Var,
        member: &Var,
        key: Option<&Var>,
    ) -> CompileResult<()> {
        if !array.ty.is_container() {
            return Err(CompileError::type_error_no_line(format!(
                "foreach over non-container {} of type {}",
                array.name, array.ty
            )));
        }
        let parent = self.current_block();
        let block = self.func.alloc_block(BlockKind::ForeachBody, parent);
        self.func
            .block_mut(parent)
            .continuations
            .push(Continuation::Foreach(crate::ir::ForeachLoop {
                loop_name: loop_name.to_string(),
                array: array.clone(),
                member_var: member.clone(),
                key_var: key.cloned(),
                block,
            }));
        self.open.push(OpenConstruct::Foreach { block });
        Ok(())
    }

    fn end_foreach_loop(&mut self) -> CompileResult<()> {
        match self.open.pop() {
            Some(OpenConstruct::Foreach { .. }) => Ok(()),
            other => Err(CompileError::internal(format!(
                "end_foreach_loop without matching start (found {other:?})"
            ))),
        }
    }

    fn start_if_statement(&mut self, condition: Arg, has_else: bool) -> CompileResult<()> {
        if condition.ty().prim_kind() != Some(PrimKind::Bool) || !condition.ty().is_prim_value() {
            return Err(CompileError::type_error_no_line(format!(
                "if condition must be a local boolean, not {}",
                condition.ty()
            )));
        }
        let parent = self.current_block();
        let then_block = self.func.alloc_block(BlockKind::ThenBlock, parent);
        let else_block = has_else.then(|| self.func.alloc_block(BlockKind::ElseBlock, parent));
        self.func.push_statement(
            parent,
            Statement::Conditional(Conditional {
                condition,
                then_block,
                else_block,
            }),
        );
        self.open.push(OpenConstruct::If {
            then_block,
            else_block,
            in_else: false,
        });
        Ok(())
    }

    fn start_else_block(&mut self) -> CompileResult<()> {
        match self.open.last_mut() {
            Some(OpenConstruct::If {
                else_block: Some(_),
                in_else,
                ..
            }) if !*in_else => {
                *in_else = true;
                Ok(())
            }
            _ => Err(CompileError::internal("start_else_block without open two-armed if")),
        }
    }

    fn end_if_statement(&mut self) -> CompileResult<()> {
        match self.open.pop() {
            Some(OpenConstruct::If { .. }) => Ok(()),
            other => Err(CompileError::internal(format!(
                "end_if_statement without matching start (found {other:?})"
            ))),
        }
    }

    fn function_call(
        &mut self,
        function: &str,
        inputs: &[Arg],
        outputs: &[Var],
        mode: TaskMode,
        props: TaskProps,
    ) -> CompileResult<()> {
        self.push(Instr::FunctionCall(FunctionCall::new(
            mode,
            function,
            inputs.to_vec(),
            outputs.to_vec(),
            props,
        )));
        Ok(())
    }

    fn builtin_function_call(
        &mut self,
        function: &str,
        inputs: &[Arg],
        outputs: &[Var],
        props: TaskProps,
    ) -> CompileResult<()> {
        self.push(Instr::ForeignCall(ForeignCall::new(
            function,
            inputs.to_vec(),
            outputs.to_vec(),
            props,
        )));
        Ok(())
    }

    fn builtin_local_function_call(&mut self, function: &str, inputs: &[Arg], outputs: &[Var]) -> CompileResult<()> {
        self.push(Instr::LocalForeignCall(LocalForeignCall::new(
            function,
            inputs.to_vec(),
            outputs.to_vec(),
        )));
        Ok(())
    }

    fn intrinsic_call(&mut self, function: &str, inputs: &[Arg], outputs: &[Var]) -> CompileResult<()> {
        match function {
            "filename" => {
                let (Some(out), Some(Arg::Var(file))) = (outputs.first(), inputs.first()) else {
                    return Err(CompileError::internal("filename intrinsic requires a file variable"));
                };
                self.push(Instr::Turbine(TurbineOp::get_filename_alias(out.clone(), file)));
                Ok(())
            }
            other => Err(CompileError::internal(format!("unknown intrinsic {other}"))),
        }
    }

    fn checkpoint_lookup_enabled(&self) -> bool {
        self.checkpoint_lookup
    }

    fn checkpoint_write_enabled(&self) -> bool {
        self.checkpoint_write
    }

    fn lookup_checkpoint(&mut self, exists_out: &Var, val_out: &Var, key: &Arg) -> CompileResult<()> {
        self.push(Instr::Turbine(TurbineOp::lookup_checkpoint(
            exists_out.clone(),
            val_out.clone(),
            key.clone(),
        )));
        Ok(())
    }

    fn write_checkpoint(&mut self, key: &Arg, val: &Arg) -> CompileResult<()> {
        self.push(Instr::Turbine(TurbineOp::write_checkpoint(key.clone(), val.clone())));
        Ok(())
    }

    fn pack_values(&mut self, out: &Var, vals: &[Arg]) -> CompileResult<()> {
        self.push(Instr::Turbine(TurbineOp::pack_values(out.clone(), vals.to_vec())));
        Ok(())
    }

    fn unpack_values(&mut self, outs: &[Var], blob: &Arg) -> CompileResult<()> {
        self.push(Instr::Turbine(TurbineOp::unpack_values(outs.to_vec(), blob.clone())));
        Ok(())
    }

    fn free_blob(&mut self, var: &Var) -> CompileResult<()> {
        self.push(Instr::Turbine(TurbineOp::free_blob(var)));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        ir::Opcode,
        types::{Alloc, DefKind, Type},
    };

    use super::*;

    fn int_fut(name: &str) -> Var {
        Var::new(name, Type::PrimFuture(PrimKind::Int), Alloc::Stack, DefKind::LocalUser)
    }

    #[test]
    fn test_emits_into_current_block() {
        let mut emitter = IrEmitter::new("main", Vec::new(), Vec::new());
        let x = int_fut("x");
        emitter.assign_scalar(&x, &Arg::int(1)).unwrap();
        let func = emitter.into_function().unwrap();
        assert_eq!(func.all_instrs().len(), 1);
        assert_eq!(func.all_instrs()[0].opcode(), Opcode::StoreScalar);
    }

    #[test]
    fn test_wait_opens_child_block() {
        let mut emitter = IrEmitter::new("main", Vec::new(), Vec::new());
        let x = int_fut("x");
        emitter
            .start_wait_statement(
                "wait0",
                vec![x.clone()],
                WaitMode::WaitOnly,
                false,
                false,
                TaskMode::LocalControl,
                TaskProps::new(),
            )
            .unwrap();
        emitter.assign_scalar(&x, &Arg::int(1)).unwrap();
        emitter.end_wait_statement().unwrap();
        let func = emitter.into_function().unwrap();

        let main = func.block(func.main_block());
        assert!(main.statements.is_empty());
        assert_eq!(main.continuations.len(), 1);
        let Continuation::Wait(wait) = &main.continuations[0] else {
            panic!("expected wait continuation");
        };
        assert_eq!(wait.wait_vars, vec![x]);
        assert_eq!(func.block(wait.block).statements.len(), 1);
        assert_eq!(func.block(wait.block).parent, Some(func.main_block()));
    }

    #[test]
    fn test_if_else_blocks() {
        let mut emitter = IrEmitter::new("main", Vec::new(), Vec::new());
        let cond = Var::new("c", Type::PrimValue(PrimKind::Bool), Alloc::Local, DefKind::LocalCompiler);
        emitter.start_if_statement(Arg::from(&cond), true).unwrap();
        emitter.comment("then").unwrap();
        emitter.start_else_block().unwrap();
        emitter.comment("else").unwrap();
        emitter.end_if_statement().unwrap();
        let func = emitter.into_function().unwrap();

        let main = func.block(func.main_block());
        let Statement::Conditional(cond_stmt) = &main.statements[0] else {
            panic!("expected conditional");
        };
        assert_eq!(func.block(cond_stmt.then_block).statements.len(), 1);
        assert_eq!(func.block(cond_stmt.else_block.unwrap()).statements.len(), 1);
    }

    #[test]
    fn test_unbalanced_constructs_rejected() {
        let mut emitter = IrEmitter::new("main", Vec::new(), Vec::new());
        let x = int_fut("x");
        emitter
            .start_wait_statement(
                "wait0",
                vec![x],
                WaitMode::WaitOnly,
                false,
                false,
                TaskMode::LocalControl,
                TaskProps::new(),
            )
            .unwrap();
        assert!(emitter.end_foreach_loop().is_err());
    }

    #[test]
    fn test_deref_requires_ref() {
        let mut emitter = IrEmitter::new("main", Vec::new(), Vec::new());
        let x = int_fut("x");
        let dst = int_fut("y");
        let err = emitter.deref_scalar(&dst, &x).unwrap_err();
        assert!(matches!(err, CompileError::Type { .. }));
    }

    #[test]
    fn test_if_condition_must_be_local_bool() {
        let mut emitter = IrEmitter::new("main", Vec::new(), Vec::new());
        let fut_cond = Var::new("c", Type::PrimFuture(PrimKind::Bool), Alloc::Stack, DefKind::LocalUser);
        assert!(emitter.start_if_statement(Arg::from(&fut_cond), false).is_err());
    }
}

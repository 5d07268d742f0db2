//! The expression walker: recursive translation from typed expression
//! trees to backend emissions.
//!
//! Entry point is [`Walker::eval_to_vars`], which lowers a tree into a
//! set of already-declared output variables. The walker handles the
//! value/reference duality (implicit dereferencing where a ref meets a
//! value context), kind-directed copies, struct and array member access,
//! range and element constructors, operator dispatch, and the call
//! decision tree including annotations and checkpointing.

use ahash::AHashMap;

use crate::{
    arg::{Arg, Lit},
    backend::Backend,
    context::{ContextStack, FnProp, FunctionInfo},
    diag::Diagnostics,
    error::{CompileError, CompileResult},
    foreign::SpecialFn,
    ir::{BuiltinOp, TaskMode, TaskProps, WaitMode},
    settings::Settings,
    tree::{Annotation, ExprToken, ExprTree},
    types::{Alloc, PrimKind, Type, Var, check_copy},
};

/// Variable substitutions applied while walking (loop unrolling and
/// inlining hand these in).
pub type Renames = AHashMap<String, Arg>;

/// The expression-to-IR lowering walker.
pub struct Walker<'a, D: Diagnostics> {
    settings: &'a Settings,
    diag: &'a mut D,
    /// Wrapper function names already generated, keyed by foreign
    /// function plus the extra-argument signature.
    wrapper_cache: AHashMap<String, String>,
}

impl<'a, D: Diagnostics> Walker<'a, D> {
    pub fn new(settings: &'a Settings, diag: &'a mut D) -> Self {
        Self {
            settings,
            diag,
            wrapper_cache: AHashMap::new(),
        }
    }

    /// Lowers `tree` into the given output variables.
    pub fn eval_to_vars(
        &mut self,
        ctx: &mut ContextStack,
        backend: &mut impl Backend,
        tree: &ExprTree,
        outs: &[Var],
        renames: &Renames,
    ) -> CompileResult<()> {
        ctx.set_line(tree.line);
        match tree.token {
            ExprToken::CallFunction => self.eval_call(ctx, backend, tree, outs, renames),
            _ => {
                let out = single_out(outs, tree)?;
                match tree.token {
                    ExprToken::Variable => self.eval_variable(ctx, backend, tree, &out, renames),
                    ExprToken::IntLiteral
                    | ExprToken::FloatLiteral
                    | ExprToken::StringLiteral
                    | ExprToken::BoolLiteral => self.eval_literal(ctx, backend, tree, &out),
                    ExprToken::Operator => self.eval_operator(ctx, backend, tree, &out, renames),
                    ExprToken::ArrayLoad => self.eval_array_load(ctx, backend, tree, &out, renames),
                    ExprToken::StructLoad => self.eval_struct_load(ctx, backend, tree, &out, renames),
                    ExprToken::ArrayRange => self.eval_array_range(ctx, backend, tree, &out, renames),
                    ExprToken::ArrayElems => self.eval_array_elems(ctx, backend, tree, &out, renames),
                    ExprToken::ArrayKvElems => self.eval_array_kv_elems(ctx, backend, tree, &out, renames),
                    ExprToken::CallFunction => unreachable!("handled above"),
                }
            }
        }
    }

    /// Lowers `tree` to a variable of type `expected`, reusing an
    /// existing variable without a copy when possible.
    fn eval(
        &mut self,
        ctx: &mut ContextStack,
        backend: &mut impl Backend,
        tree: &ExprTree,
        expected: &Type,
        renames: &Renames,
    ) -> CompileResult<Var> {
        if tree.token == ExprToken::Variable {
            let resolved = self.resolve_variable(ctx, tree, renames)?;
            if let Arg::Var(var) = &resolved
                && var.ty == *expected
            {
                return Ok(var.clone());
            }
        }
        let tmp = ctx.create_tmp(expected.clone())?;
        backend.declare(&tmp)?;
        self.eval_to_vars(ctx, backend, tree, std::slice::from_ref(&tmp), renames)?;
        Ok(tmp)
    }

    fn resolve_variable(&self, ctx: &ContextStack, tree: &ExprTree, renames: &Renames) -> CompileResult<Arg> {
        match renames.get(&tree.text) {
            Some(arg) => Ok(arg.clone()),
            None => Ok(Arg::from(ctx.lookup_def(&tree.text)?)),
        }
    }

    fn eval_variable(
        &mut self,
        ctx: &mut ContextStack,
        backend: &mut impl Backend,
        tree: &ExprTree,
        out: &Var,
        renames: &Renames,
    ) -> CompileResult<()> {
        let resolved = self.resolve_variable(ctx, tree, renames)?;
        match resolved {
            Arg::Const(lit) => self.assign_const(backend, out, &lit, tree.line),
            Arg::Var(src) => {
                if src.name == out.name {
                    return Err(CompileError::definition_error(
                        tree.line,
                        format!("assignment of variable {} to itself", src.name),
                    ));
                }
                if src.ty == out.ty {
                    self.copy_by_value(ctx, backend, &src, out)?;
                } else if src.ty.deref_result_type() == Some(&out.ty) {
                    self.dereference(ctx, backend, out, &src)?;
                } else if src.ty.is_updateable() && out.ty == Type::PrimFuture(PrimKind::Float) {
                    // Snapshot the updateable, then assign the snapshot.
                    let local = ctx.create_local_value_var(Type::PrimValue(PrimKind::Float))?;
                    backend.declare(&local)?;
                    backend.latest_value(&local, &src)?;
                    backend.assign_scalar(out, &Arg::from(&local))?;
                } else {
                    return Err(CompileError::type_error(
                        tree.line,
                        format!("cannot assign {} of type {} to {} of type {}", src.name, src.ty, out.name, out.ty),
                    ));
                }
                Ok(())
            }
        }
    }

    fn eval_literal(
        &mut self,
        _ctx: &mut ContextStack,
        backend: &mut impl Backend,
        tree: &ExprTree,
        out: &Var,
    ) -> CompileResult<()> {
        let lit = literal_of(tree)?.ok_or_else(|| CompileError::internal("literal token without literal text"))?;
        self.assign_const(backend, out, &lit, tree.line)
    }

    fn assign_const(&mut self, backend: &mut impl Backend, out: &Var, lit: &Lit, line: u32) -> CompileResult<()> {
        let out_kind = out.ty.prim_kind().ok_or_else(|| {
            CompileError::type_error(line, format!("cannot assign literal {lit} to non-primitive {}", out.ty))
        })?;
        let coerced = match (lit, out_kind) {
            // Integer literals flow into float contexts.
            (Lit::Int(v), PrimKind::Float) => Lit::Float(interpret_int_as_float(*v)),
            (lit, kind) if lit.kind() == kind => lit.clone(),
            (lit, kind) => {
                return Err(CompileError::type_error(
                    line,
                    format!("literal {lit} has kind {}, expected {kind}", lit.kind()),
                ));
            }
        };
        backend.assign_scalar(out, &Arg::Const(coerced))
    }

    fn eval_operator(
        &mut self,
        ctx: &mut ContextStack,
        backend: &mut impl Backend,
        tree: &ExprTree,
        out: &Var,
        renames: &Renames,
    ) -> CompileResult<()> {
        // A unary-negated literal folds at compile time.
        if tree.text == "-"
            && tree.child_count() == 1
            && let Some(lit) = literal_of(tree.child(0))?
        {
            let negated = match lit {
                Lit::Int(v) => Lit::Int(v.checked_neg().ok_or_else(|| {
                    CompileError::type_error(tree.line, "integer literal negation overflows".to_string())
                })?),
                Lit::Float(v) => Lit::Float(-v),
                other => {
                    return Err(CompileError::type_error(
                        tree.line,
                        format!("cannot negate literal {other}"),
                    ));
                }
            };
            return self.assign_const(backend, out, &negated, tree.line);
        }

        let operand_kind = self.operand_kind(tree, out)?;
        let subop = resolve_op(&tree.text, operand_kind, tree.child_count()).ok_or_else(|| {
            CompileError::type_error(
                tree.line,
                format!(
                    "operator {} is not defined for {} operand(s) of kind {operand_kind}",
                    tree.text,
                    tree.child_count()
                ),
            )
        })?;
        let operand_ty = Type::PrimFuture(operand_kind);
        let mut args = Vec::with_capacity(tree.child_count());
        for child in &tree.children {
            args.push(Arg::Var(self.eval(ctx, backend, child, &operand_ty, renames)?));
        }
        backend.async_op(subop, out, &args, TaskProps::new())
    }

    /// The primitive kind the operator's operands are lowered at:
    /// booleans for logic, the first typed child for comparisons, the
    /// output kind for arithmetic.
    fn operand_kind(&self, tree: &ExprTree, out: &Var) -> CompileResult<PrimKind> {
        let name = tree.text.as_str();
        if matches!(name, "&&" | "||" | "!") {
            return Ok(PrimKind::Bool);
        }
        if matches!(name, "==" | "!=" | "<" | "<=" | ">" | ">=") {
            for child in &tree.children {
                if let [ty] = child.type_alternatives()
                    && let Some(kind) = ty.prim_kind()
                {
                    return Ok(kind);
                }
            }
            return Err(CompileError::type_error(
                tree.line,
                format!("cannot infer operand kind of comparison {name}"),
            ));
        }
        out.ty.prim_kind().ok_or_else(|| {
            CompileError::type_error(
                tree.line,
                format!("operator {name} output {} is not primitive", out.ty),
            )
        })
    }

    // Kind-directed copy of `src` into `dst` (same types).
    fn copy_by_value(
        &mut self,
        ctx: &mut ContextStack,
        backend: &mut impl Backend,
        src: &Var,
        dst: &Var,
    ) -> CompileResult<()> {
        check_copy(&src.ty, &dst.ty)?;
        match &dst.ty {
            Type::PrimFuture(PrimKind::File) => {
                if dst.is_mapped() {
                    return Err(CompileError::type_error(
                        ctx.line(),
                        format!("cannot copy into possibly-mapped file {}", dst.name),
                    ));
                }
                backend.copy_file(dst, src)
            }
            Type::PrimFuture(kind) => {
                let subop = BuiltinOp::copy_for_kind(*kind)
                    .ok_or_else(|| CompileError::internal(format!("no copy operator for kind {kind}")))?;
                backend.async_op(subop, dst, &[Arg::from(src)], TaskProps::new())
            }
            Type::PrimValue(kind) => {
                let subop = BuiltinOp::copy_for_kind(*kind)
                    .ok_or_else(|| CompileError::internal(format!("no copy operator for kind {kind}")))?;
                backend.local_op(subop, Some(dst), &[Arg::from(src)])
            }
            Type::Struct(_) => {
                let mut src_path = Vec::new();
                let mut dst_path = Vec::new();
                self.copy_struct(ctx, backend, src, dst, &mut src_path, &mut dst_path)
            }
            Type::Array { .. } | Type::Bag(_) => self.copy_container(ctx, backend, src, dst),
            Type::Ref(referand) => {
                // Wait on the source ref, retrieve its target to an
                // alias, then assign that into the destination ref.
                let wait_name = ctx.unique_name("wait");
                backend.start_wait_statement(
                    &wait_name,
                    vec![src.clone()],
                    WaitMode::WaitOnly,
                    false,
                    false,
                    TaskMode::LocalControl,
                    TaskProps::new(),
                )?;
                let alias = ctx.create_alias_var((**referand).clone())?;
                backend.declare(&alias)?;
                backend.retrieve_ref(&alias, src)?;
                backend.assign_ref(dst, &alias)?;
                backend.end_wait_statement()
            }
            other => Err(CompileError::type_error(
                ctx.line(),
                format!("cannot copy value of type {other}"),
            )),
        }
    }

    /// Field-by-field recursive struct copy, maintaining explicit source
    /// and destination path stacks.
    fn copy_struct(
        &mut self,
        ctx: &mut ContextStack,
        backend: &mut impl Backend,
        src: &Var,
        dst: &Var,
        src_path: &mut Vec<String>,
        dst_path: &mut Vec<String>,
    ) -> CompileResult<()> {
        let Type::Struct(st) = src.ty.clone() else {
            return Err(CompileError::internal("copy_struct on non-struct"));
        };
        for (field, field_ty) in &st.fields {
            src_path.push(field.clone());
            dst_path.push(field.clone());

            let src_alias = ctx.create_struct_field_tmp(src, src_path, field_ty.clone(), Alloc::Alias)?;
            backend.declare(&src_alias)?;
            backend.struct_lookup(&src_alias, src, std::slice::from_ref(field))?;
            let dst_alias = ctx.create_struct_field_tmp(dst, dst_path, field_ty.clone(), Alloc::Alias)?;
            backend.declare(&dst_alias)?;
            backend.struct_lookup(&dst_alias, dst, std::slice::from_ref(field))?;
            let result = if field_ty.is_struct() {
                self.copy_struct(ctx, backend, &src_alias, &dst_alias, src_path, dst_path)
            } else {
                self.copy_by_value(ctx, backend, &src_alias, &dst_alias)
            };

            src_path.pop();
            dst_path.pop();
            result?;
        }
        Ok(())
    }

    /// Container copy: wait for the source, then insert each member into
    /// the destination.
    fn copy_container(
        &mut self,
        ctx: &mut ContextStack,
        backend: &mut impl Backend,
        src: &Var,
        dst: &Var,
    ) -> CompileResult<()> {
        let elem_ty = src
            .ty
            .container_elem_type()
            .ok_or_else(|| CompileError::internal("container copy on non-container"))?
            .clone();
        let wait_name = ctx.unique_name("wait");
        backend.start_wait_statement(
            &wait_name,
            vec![src.clone()],
            WaitMode::WaitOnly,
            false,
            false,
            TaskMode::LocalControl,
            TaskProps::new(),
        )?;
        let loop_name = ctx.unique_name("copyloop");
        let member = Var::new(
            ctx.unique_name("member"),
            elem_ty,
            Alloc::Alias,
            crate::types::DefKind::LocalCompiler,
        );
        match &src.ty {
            Type::Array { key, .. } => {
                let key_var = Var::new(
                    ctx.unique_name("key"),
                    Type::PrimValue(key.prim_kind().unwrap_or(PrimKind::Int)),
                    Alloc::Local,
                    crate::types::DefKind::LocalCompiler,
                );
                backend.start_foreach_loop(&loop_name, src, &member, Some(&key_var))?;
                backend.array_insert_imm(dst, &Arg::from(&key_var), &Arg::from(&member))?;
            }
            Type::Bag(_) => {
                backend.start_foreach_loop(&loop_name, src, &member, None)?;
                backend.bag_insert(dst, &Arg::from(&member))?;
            }
            other => {
                return Err(CompileError::internal(format!("container copy on {other}")));
            }
        }
        backend.end_foreach_loop()?;
        backend.end_wait_statement()
    }

    /// Dereference `src` (a ref) into `dst`.
    fn dereference(
        &mut self,
        ctx: &mut ContextStack,
        backend: &mut impl Backend,
        dst: &Var,
        src: &Var,
    ) -> CompileResult<()> {
        let referand = src.ty.deref_result_type().ok_or_else(|| {
            CompileError::type_error(ctx.line(), format!("cannot dereference non-ref {} of type {}", src.name, src.ty))
        })?;
        if *referand != dst.ty {
            return Err(CompileError::type_error(
                ctx.line(),
                format!("dereference of {} yields {referand}, expected {}", src.name, dst.ty),
            ));
        }
        match referand {
            Type::PrimFuture(PrimKind::File) => backend.deref_file(dst, src),
            Type::PrimFuture(_) => backend.deref_scalar(dst, src),
            Type::Array { .. } | Type::Bag(_) | Type::Struct(_) => {
                // Wait for the ref, retrieve the target handle, then copy.
                let wait_name = ctx.unique_name("wait");
                backend.start_wait_statement(
                    &wait_name,
                    vec![src.clone()],
                    WaitMode::WaitOnly,
                    false,
                    false,
                    TaskMode::LocalControl,
                    TaskProps::new(),
                )?;
                let alias = ctx.create_alias_var(referand.clone())?;
                backend.declare(&alias)?;
                backend.retrieve_ref(&alias, src)?;
                let result = self.copy_by_value(ctx, backend, &alias, dst);
                backend.end_wait_statement()?;
                result
            }
            other => Err(CompileError::type_error(
                ctx.line(),
                format!("cannot dereference into {other}"),
            )),
        }
    }

    fn eval_array_load(
        &mut self,
        ctx: &mut ContextStack,
        backend: &mut impl Backend,
        tree: &ExprTree,
        out: &Var,
        renames: &Renames,
    ) -> CompileResult<()> {
        let arr_expr = tree.child(0);
        let ix_expr = tree.child(1);

        // Pick the concrete array type among the union alternatives whose
        // element type can produce the output.
        let arr_ty = arr_expr
            .type_alternatives()
            .iter()
            .find(|alt| {
                alt.container_elem_type().is_some_and(|elem| {
                    elem.assignable_to(&out.ty) || elem.deref_result_type() == Some(&out.ty)
                })
            })
            .cloned()
            .ok_or_else(|| {
                CompileError::type_error(
                    tree.line,
                    format!("no array type alternative yields element type {}", out.ty),
                )
            })?;
        let elem_ty = arr_ty
            .container_elem_type()
            .expect("selected alternative is a container")
            .clone();
        let key_ty = arr_ty
            .array_key_type()
            .ok_or_else(|| CompileError::type_error(tree.line, "element load from non-array container"))?
            .clone();
        let arr_var = self.eval(ctx, backend, arr_expr, &arr_ty, renames)?;

        if let Some(ix) = literal_of(ix_expr)? {
            // Immediate key: alias lookup of the slot.
            if ix.kind() != key_ty.prim_kind().unwrap_or(PrimKind::Int) {
                return Err(CompileError::type_error(
                    tree.line,
                    format!("array index kind {} disagrees with key type {key_ty}", ix.kind()),
                ));
            }
            if elem_ty == out.ty {
                backend.array_lookup_ref_imm(out, &arr_var, &Arg::Const(ix))
            } else if elem_ty.deref_result_type() == Some(&out.ty) {
                let slot = ctx.create_alias_var(elem_ty.clone())?;
                backend.declare(&slot)?;
                backend.array_lookup_ref_imm(&slot, &arr_var, &Arg::Const(ix))?;
                self.dereference(ctx, backend, out, &slot)
            } else {
                Err(CompileError::type_error(
                    tree.line,
                    format!("array slot type {elem_ty} cannot produce output type {}", out.ty),
                ))
            }
        } else {
            // Future key: lookup yields a reference to the slot.
            let ix_var = self.eval(ctx, backend, ix_expr, &key_ty, renames)?;
            let ref_ty = Type::ref_to(elem_ty.clone());
            if out.ty == ref_ty {
                backend.array_lookup_future(out, &arr_var, &ix_var)
            } else if elem_ty == out.ty {
                let slot_ref = ctx.create_tmp(ref_ty)?;
                backend.declare(&slot_ref)?;
                backend.array_lookup_future(&slot_ref, &arr_var, &ix_var)?;
                self.dereference(ctx, backend, out, &slot_ref)
            } else {
                Err(CompileError::type_error(
                    tree.line,
                    format!("array slot type {elem_ty} cannot produce output type {}", out.ty),
                ))
            }
        }
    }

    fn eval_struct_load(
        &mut self,
        ctx: &mut ContextStack,
        backend: &mut impl Backend,
        tree: &ExprTree,
        out: &Var,
        renames: &Renames,
    ) -> CompileResult<()> {
        // Walk upward through nested loads to the root expression,
        // accumulating the full field path.
        let mut path = vec![tree.text.clone()];
        let mut node = tree.child(0);
        while node.token == ExprToken::StructLoad {
            path.insert(0, node.text.clone());
            node = node.child(0);
        }
        let root_ty = node.get_type()?.clone();
        let root_var = self.eval(ctx, backend, node, &root_ty, renames)?;

        // Emit one lookup per path component, walking the struct type.
        let mut current = root_var;
        let mut current_ty = root_ty;
        for (i, field) in path.iter().enumerate() {
            let Type::Struct(st) = &current_ty else {
                return Err(CompileError::type_error(
                    tree.line,
                    format!("member access .{field} on non-struct type {current_ty}"),
                ));
            };
            let field_ty = st
                .field_type(field)
                .ok_or_else(|| {
                    CompileError::name_error(tree.line, format!("struct {} has no field {field}", st.name))
                })?
                .clone();
            let last = i + 1 == path.len();
            if last && field_ty.is_ref() && field_ty.deref_result_type() == Some(&out.ty) {
                // Struct-of-ref: produce the ref, then dereference.
                let ref_alias =
                    ctx.create_struct_field_tmp(&current, std::slice::from_ref(field), field_ty.clone(), Alloc::Alias)?;
                backend.declare(&ref_alias)?;
                backend.struct_ref_lookup(&ref_alias, &current, std::slice::from_ref(field))?;
                return self.dereference(ctx, backend, out, &ref_alias);
            }
            let alias =
                ctx.create_struct_field_tmp(&current, std::slice::from_ref(field), field_ty.clone(), Alloc::Alias)?;
            backend.declare(&alias)?;
            backend.struct_lookup(&alias, &current, std::slice::from_ref(field))?;
            current = alias;
            current_ty = field_ty;
        }
        self.copy_by_value(ctx, backend, &current, out)
    }

    /// `[a:b]` and `[a:b:s]` lower to the range special functions.
    fn eval_array_range(
        &mut self,
        ctx: &mut ContextStack,
        backend: &mut impl Backend,
        tree: &ExprTree,
        out: &Var,
        renames: &Renames,
    ) -> CompileResult<()> {
        let function = match tree.child_count() {
            2 => "range",
            3 => "range_step",
            n => {
                return Err(CompileError::internal(format!("array range with {n} bounds")));
            }
        };
        let int_fut = Type::PrimFuture(PrimKind::Int);
        let mut args = Vec::with_capacity(tree.child_count());
        for child in &tree.children {
            args.push(Arg::Var(self.eval(ctx, backend, child, &int_fut, renames)?));
        }
        backend.builtin_function_call(function, &args, std::slice::from_ref(out), TaskProps::new())
    }

    /// `[e0, e1, ...]`: evaluate element futures and build the whole
    /// array with literal integer keys. The result array is closed.
    fn eval_array_elems(
        &mut self,
        ctx: &mut ContextStack,
        backend: &mut impl Backend,
        tree: &ExprTree,
        out: &Var,
        renames: &Renames,
    ) -> CompileResult<()> {
        let elem_ty = out
            .ty
            .container_elem_type()
            .ok_or_else(|| CompileError::type_error(tree.line, format!("array literal into non-array {}", out.ty)))?
            .clone();
        let mut keys = Vec::with_capacity(tree.child_count());
        let mut vals = Vec::with_capacity(tree.child_count());
        for (i, child) in tree.children.iter().enumerate() {
            keys.push(Arg::int(i64::try_from(i).expect("array literal length exceeds i64")));
            vals.push(Arg::Var(self.eval(ctx, backend, child, &elem_ty, renames)?));
        }
        backend.array_build(out, &keys, &vals)
    }

    /// `[k0=v0, k1=v1, ...]` with expression keys: a sequence of inserts
    /// at future keys.
    fn eval_array_kv_elems(
        &mut self,
        ctx: &mut ContextStack,
        backend: &mut impl Backend,
        tree: &ExprTree,
        out: &Var,
        renames: &Renames,
    ) -> CompileResult<()> {
        let elem_ty = out
            .ty
            .container_elem_type()
            .ok_or_else(|| CompileError::type_error(tree.line, format!("array literal into non-array {}", out.ty)))?
            .clone();
        let key_ty = out
            .ty
            .array_key_type()
            .ok_or_else(|| CompileError::type_error(tree.line, "keyed array literal into non-array"))?
            .clone();
        for pair in tree.children.chunks(2) {
            let [key_expr, val_expr] = pair else {
                return Err(CompileError::internal("keyed array literal with dangling key"));
            };
            let key = self.eval(ctx, backend, key_expr, &key_ty, renames)?;
            let val = self.eval(ctx, backend, val_expr, &elem_ty, renames)?;
            backend.array_insert_future(out, &key, &Arg::from(&val))?;
        }
        Ok(())
    }

    // Call lowering.

    fn eval_call(
        &mut self,
        ctx: &mut ContextStack,
        backend: &mut impl Backend,
        tree: &ExprTree,
        outs: &[Var],
        renames: &Renames,
    ) -> CompileResult<()> {
        let function = tree.text.clone();
        let info = ctx.lookup_function(&function)?.clone();

        if info.props.contains(FnProp::Deprecated) {
            self.diag
                .warn(Some(tree.line), format!("function {function} is deprecated"));
        }
        // Assert variants vanish entirely under the disable switch.
        if self.settings.disable_asserts
            && ctx
                .foreign()
                .get(&function)
                .and_then(|f| f.special)
                .is_some_and(SpecialFn::is_assert_variant)
        {
            return Ok(());
        }

        if tree.child_count() != info.sig.inputs.len() {
            return Err(CompileError::type_error(
                tree.line,
                format!(
                    "function {function} expects {} argument(s), got {}",
                    info.sig.inputs.len(),
                    tree.child_count()
                ),
            ));
        }

        // Evaluate argument expressions into freshly typed temporaries,
        // reconciling union parameter types against the argument trees.
        let mut arg_vars = Vec::with_capacity(tree.child_count());
        for (param_ty, arg_expr) in info.sig.inputs.iter().zip(&tree.children) {
            let concrete = concretize_param(param_ty, arg_expr, tree.line)?;
            arg_vars.push(self.eval(ctx, backend, arg_expr, &concrete, renames)?);
        }

        // Evaluate annotation expressions and open a wait on them.
        let mut props = TaskProps::new();
        let mut ann_futures = Vec::new();
        let mut ann_slots = Vec::new();
        for (annotation, expr) in &tree.annotations {
            match annotation {
                Annotation::Par if !info.props.contains(FnProp::Parallel) => {
                    return Err(CompileError::annotation_error(
                        tree.line,
                        format!("function {function} does not declare the parallel property"),
                    ));
                }
                Annotation::Location if !info.props.contains(FnProp::Targetable) => {
                    return Err(CompileError::annotation_error(
                        tree.line,
                        format!("function {function} does not declare the targetable property"),
                    ));
                }
                _ => {}
            }
            let ann_ty = match annotation {
                Annotation::Location => Type::PrimFuture(PrimKind::String),
                _ => Type::PrimFuture(PrimKind::Int),
            };
            let future = self.eval(ctx, backend, expr, &ann_ty, renames)?;
            ann_futures.push(future);
            ann_slots.push(*annotation);
        }
        let annotation_wait = !ann_futures.is_empty();
        if annotation_wait {
            let wait_name = ctx.unique_name("wait");
            backend.start_wait_statement(
                &wait_name,
                ann_futures.clone(),
                WaitMode::WaitOnly,
                false,
                false,
                TaskMode::LocalControl,
                TaskProps::new(),
            )?;
            for (annotation, future) in ann_slots.iter().zip(&ann_futures) {
                let kind = future.ty.prim_kind().expect("annotation futures are primitive");
                let local = ctx.create_local_value_var(Type::PrimValue(kind))?;
                backend.declare(&local)?;
                backend.retrieve_scalar(&local, future)?;
                props.set(annotation.prop_key(), Arg::from(&local));
            }
        }

        // Coerce each argument to the callee's expected type.
        let mut inputs = Vec::with_capacity(arg_vars.len());
        for (arg_var, param_ty) in arg_vars.iter().zip(&info.sig.inputs) {
            let expected = concretize_param_var(param_ty, arg_var);
            if arg_var.ty == expected {
                inputs.push(Arg::from(arg_var));
            } else if arg_var.ty.deref_result_type() == Some(&expected) {
                let tmp = ctx.create_tmp(expected.clone())?;
                backend.declare(&tmp)?;
                self.dereference(ctx, backend, &tmp, arg_var)?;
                inputs.push(Arg::from(&tmp));
            } else if arg_var.ty.is_updateable() && expected == Type::PrimFuture(PrimKind::Float) {
                let local = ctx.create_local_value_var(Type::PrimValue(PrimKind::Float))?;
                backend.declare(&local)?;
                backend.latest_value(&local, arg_var)?;
                let tmp = ctx.create_tmp(expected.clone())?;
                backend.declare(&tmp)?;
                backend.assign_scalar(&tmp, &Arg::from(&local))?;
                inputs.push(Arg::from(&tmp));
            } else {
                return Err(CompileError::type_error(
                    tree.line,
                    format!(
                        "argument {} of type {} does not match parameter type {expected} of {function}",
                        arg_var.name, arg_var.ty
                    ),
                ));
            }
        }

        let result = if info.props.contains(FnProp::Checkpointed) {
            self.emit_checkpointed_call(ctx, backend, &function, &info, &inputs, outs, &props)
        } else {
            self.emit_plain_call(ctx, backend, &function, &info, &inputs, outs, &props)
        };
        if annotation_wait {
            backend.end_wait_statement()?;
        }
        result
    }

    /// The call-emission decision tree on function properties.
    #[expect(clippy::too_many_arguments, reason = "shares the plain-call parameter set")]
    fn emit_plain_call(
        &mut self,
        ctx: &mut ContextStack,
        backend: &mut impl Backend,
        function: &str,
        info: &FunctionInfo,
        inputs: &[Arg],
        outs: &[Var],
        props: &TaskProps,
    ) -> CompileResult<()> {
        if info.intrinsic {
            return backend.intrinsic_call(function, inputs, outs);
        }
        if info.props.contains(FnProp::Builtin) {
            let op_equivalent = ctx.foreign().get(function).and_then(|f| f.op_equivalent);
            return match (op_equivalent, outs) {
                (Some(subop), [out]) => backend.async_op(subop, out, inputs, props.clone()),
                _ => backend.builtin_function_call(function, inputs, outs, props.clone()),
            };
        }
        if info.props.contains(FnProp::WrappedBuiltin) || info.props.contains(FnProp::App) {
            let mut wrapped_inputs = inputs.to_vec();
            // Parallelism and location travel as extra arguments when the
            // function declares the matching flags.
            if info.props.contains(FnProp::Parallel)
                && let Some(par) = &props.parallelism
            {
                wrapped_inputs.push(par.clone());
            }
            if info.props.contains(FnProp::Targetable)
                && let Some(location) = &props.location
            {
                wrapped_inputs.push(location.clone());
            }
            let wrapper = self.wrapper_for(function, info);
            let mut call_props = TaskProps::new();
            call_props.priority = props.priority.clone();
            return backend.function_call(&wrapper, &wrapped_inputs, outs, TaskMode::Sync, call_props);
        }
        if info.props.contains(FnProp::Composite) {
            let mode = if info.props.contains(FnProp::Sync) {
                TaskMode::Sync
            } else {
                TaskMode::Control
            };
            return backend.function_call(function, inputs, outs, mode, props.clone());
        }
        Err(CompileError::internal(format!(
            "function {function} has no lowerable property set"
        )))
    }

    /// Generates (or reuses) the wrapper function name for a
    /// wrapped-builtin or app function.
    fn wrapper_for(&mut self, function: &str, info: &FunctionInfo) -> String {
        let key = format!(
            "{function}/par={}/loc={}",
            info.props.contains(FnProp::Parallel),
            info.props.contains(FnProp::Targetable)
        );
        self.wrapper_cache
            .entry(key)
            .or_insert_with(|| format!("wrap_{function}"))
            .clone()
    }

    /// Checkpointed call structure: wait on the inputs, try the cached
    /// result, fall back to the normal call and write the checkpoint.
    #[expect(clippy::too_many_arguments, reason = "shares the plain-call parameter set")]
    fn emit_checkpointed_call(
        &mut self,
        ctx: &mut ContextStack,
        backend: &mut impl Backend,
        function: &str,
        info: &FunctionInfo,
        inputs: &[Arg],
        outs: &[Var],
        props: &TaskProps,
    ) -> CompileResult<()> {
        let lookup_enabled = backend.checkpoint_lookup_enabled();
        let write_enabled = backend.checkpoint_write_enabled();
        if !lookup_enabled && !write_enabled {
            return self.emit_plain_call(ctx, backend, function, info, inputs, outs, props);
        }

        // All inputs form the checkpoint key; all outputs the value.
        let key_futures: Vec<Var> = inputs.iter().filter_map(Arg::as_var).cloned().collect();
        let wait_name = ctx.unique_name("wait");
        backend.start_wait_statement(
            &wait_name,
            key_futures.clone(),
            WaitMode::WaitOnly,
            true,
            false,
            TaskMode::LocalControl,
            TaskProps::new(),
        )?;

        // Fetch scalar inputs; containers pass through (packing retrieves
        // their contents recursively).
        let mut key_args: Vec<Arg> = vec![Arg::str(function)];
        for input in inputs {
            key_args.push(self.fetchable_arg(ctx, backend, input)?);
        }

        let result = if lookup_enabled {
            self.emit_checkpoint_lookup(ctx, backend, function, info, inputs, outs, props, &key_args, write_enabled)
        } else {
            self.emit_plain_call(ctx, backend, function, info, inputs, outs, props)
                .and_then(|()| self.emit_checkpoint_write(ctx, backend, outs, &key_args))
        };
        backend.end_wait_statement()?;
        result
    }

    #[expect(clippy::too_many_arguments, reason = "shares the plain-call parameter set")]
    fn emit_checkpoint_lookup(
        &mut self,
        ctx: &mut ContextStack,
        backend: &mut impl Backend,
        function: &str,
        info: &FunctionInfo,
        inputs: &[Arg],
        outs: &[Var],
        props: &TaskProps,
        key_args: &[Arg],
        write_enabled: bool,
    ) -> CompileResult<()> {
        let key_blob = ctx.create_local_value_var(Type::PrimValue(PrimKind::Blob))?;
        backend.declare(&key_blob)?;
        backend.pack_values(&key_blob, key_args)?;
        let exists = ctx.create_local_value_var(Type::PrimValue(PrimKind::Bool))?;
        backend.declare(&exists)?;
        let val_blob = ctx.create_local_value_var(Type::PrimValue(PrimKind::Blob))?;
        backend.declare(&val_blob)?;
        backend.lookup_checkpoint(&exists, &val_blob, &Arg::from(&key_blob))?;
        backend.free_blob(&key_blob)?;

        backend.start_if_statement(Arg::from(&exists), true)?;
        backend.unpack_values(outs, &Arg::from(&val_blob))?;
        backend.start_else_block()?;
        self.emit_plain_call(ctx, backend, function, info, inputs, outs, props)?;
        if write_enabled {
            self.emit_checkpoint_write(ctx, backend, outs, key_args)?;
        }
        backend.end_if_statement()?;
        // Blobs are freed at the end of the block that declared them.
        backend.free_blob(&val_blob)
    }

    /// Write-back wait: once the outputs are closed, pack and store them
    /// under the input key.
    fn emit_checkpoint_write(
        &mut self,
        ctx: &mut ContextStack,
        backend: &mut impl Backend,
        outs: &[Var],
        key_args: &[Arg],
    ) -> CompileResult<()> {
        let wait_name = ctx.unique_name("wait");
        backend.start_wait_statement(
            &wait_name,
            outs.to_vec(),
            WaitMode::WaitOnly,
            true,
            false,
            TaskMode::LocalControl,
            TaskProps::new(),
        )?;
        let mut out_args = Vec::with_capacity(outs.len());
        for out in outs {
            out_args.push(self.fetchable_arg(ctx, backend, &Arg::from(out))?);
        }
        let key_blob = ctx.create_local_value_var(Type::PrimValue(PrimKind::Blob))?;
        backend.declare(&key_blob)?;
        backend.pack_values(&key_blob, key_args)?;
        let val_blob = ctx.create_local_value_var(Type::PrimValue(PrimKind::Blob))?;
        backend.declare(&val_blob)?;
        backend.pack_values(&val_blob, &out_args)?;
        backend.write_checkpoint(&Arg::from(&key_blob), &Arg::from(&val_blob))?;
        backend.free_blob(&key_blob)?;
        backend.free_blob(&val_blob)?;
        backend.end_wait_statement()
    }

    /// Fetches a closed scalar future to a local value; containers and
    /// constants pass through for recursive packing.
    fn fetchable_arg(&mut self, ctx: &mut ContextStack, backend: &mut impl Backend, arg: &Arg) -> CompileResult<Arg> {
        match arg {
            Arg::Var(var) if var.ty.is_prim_future() && !var.ty.is_file() => {
                let kind = var.ty.prim_kind().expect("prim future has a kind");
                let local = ctx.create_local_value_var(Type::PrimValue(kind))?;
                backend.declare(&local)?;
                backend.retrieve_scalar(&local, var)?;
                Ok(Arg::from(&local))
            }
            other => Ok(other.clone()),
        }
    }
}

/// Reads a literal off a tree node, or `None` when the node is not a
/// literal token.
fn literal_of(tree: &ExprTree) -> CompileResult<Option<Lit>> {
    let lit = match tree.token {
        ExprToken::IntLiteral => {
            let value = tree.text.parse::<i64>().map_err(|_| {
                CompileError::type_error(tree.line, format!("invalid integer literal {}", tree.text))
            })?;
            Some(Lit::Int(value))
        }
        ExprToken::FloatLiteral => {
            let value = tree.text.parse::<f64>().map_err(|_| {
                CompileError::type_error(tree.line, format!("invalid float literal {}", tree.text))
            })?;
            Some(Lit::Float(value))
        }
        ExprToken::StringLiteral => Some(Lit::Str(tree.text.clone())),
        ExprToken::BoolLiteral => Some(Lit::Bool(tree.text == "true")),
        _ => None,
    };
    Ok(lit)
}

/// An integer literal in a float context keeps its numeric value.
fn interpret_int_as_float(v: i64) -> f64 {
    v as f64
}

fn single_out(outs: &[Var], tree: &ExprTree) -> CompileResult<Var> {
    match outs {
        [out] => Ok(out.clone()),
        _ => Err(CompileError::internal(format!(
            "expression ({}) requires exactly one output, got {}",
            tree.token,
            outs.len()
        ))),
    }
}

/// Picks the concrete parameter type for an argument expression when the
/// signature declares a union.
fn concretize_param(param_ty: &Type, arg_expr: &ExprTree, line: u32) -> CompileResult<Type> {
    if !param_ty.is_union() {
        return Ok(param_ty.clone());
    }
    for alt in param_ty.alternatives() {
        if arg_expr
            .type_alternatives()
            .iter()
            .any(|arg_ty| arg_ty.assignable_to(alt) || arg_ty.deref_result_type() == Some(alt))
        {
            return Ok(alt.clone());
        }
    }
    Err(CompileError::type_error(
        line,
        format!("no alternative of parameter type {param_ty} matches the argument"),
    ))
}

/// The parameter type an evaluated argument is coerced to; for unions the
/// choice already happened during evaluation.
fn concretize_param_var(param_ty: &Type, arg_var: &Var) -> Type {
    if !param_ty.is_union() {
        return param_ty.clone();
    }
    param_ty
        .alternatives()
        .iter()
        .find(|alt| arg_var.ty.assignable_to(alt) || arg_var.ty.deref_result_type() == Some(*alt))
        .cloned()
        .unwrap_or_else(|| param_ty.clone())
}

/// Maps a surface operator to its builtin opcode for an operand kind and
/// arity.
fn resolve_op(name: &str, kind: PrimKind, arity: usize) -> Option<BuiltinOp> {
    use BuiltinOp as B;
    use PrimKind as K;
    let op = match (name, kind, arity) {
        ("+", K::Int, 2) => B::PlusInt,
        ("+", K::Float, 2) => B::PlusFlt,
        ("+", K::String, 2) => B::StrCat,
        ("-", K::Int, 2) => B::MinusInt,
        ("-", K::Float, 2) => B::MinusFlt,
        ("-", K::Int, 1) => B::NegInt,
        ("-", K::Float, 1) => B::NegFlt,
        ("*", K::Int, 2) => B::MultInt,
        ("*", K::Float, 2) => B::MultFlt,
        ("/", K::Int, 2) => B::DivInt,
        ("/", K::Float, 2) => B::DivFlt,
        ("%", K::Int, 2) => B::ModInt,
        ("**", K::Int, 2) => B::PowInt,
        ("**", K::Float, 2) => B::PowFlt,
        ("==", K::Int, 2) => B::EqInt,
        ("==", K::Float, 2) => B::EqFlt,
        ("==", K::String, 2) => B::EqStr,
        ("!=", K::Int, 2) => B::NeqInt,
        ("!=", K::Float, 2) => B::NeqFlt,
        ("!=", K::String, 2) => B::NeqStr,
        ("<", K::Int, 2) => B::LtInt,
        ("<", K::Float, 2) => B::LtFlt,
        ("<=", K::Int, 2) => B::LteInt,
        ("<=", K::Float, 2) => B::LteFlt,
        (">", K::Int, 2) => B::GtInt,
        (">", K::Float, 2) => B::GtFlt,
        (">=", K::Int, 2) => B::GteInt,
        (">=", K::Float, 2) => B::GteFlt,
        ("&&", K::Bool, 2) => B::And,
        ("||", K::Bool, 2) => B::Or,
        ("!", K::Bool, 1) => B::Not,
        _ => return None,
    };
    Some(op)
}

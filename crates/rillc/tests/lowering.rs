//! End-to-end lowering scenarios: expression trees in, IR out.

use pretty_assertions::assert_eq;
use rillc::{
    Annotation, Arg, Backend, CollectDiagnostics, CompileError, ContextStack, ExprTree, FnProp, ForeignRegistry,
    FunctionInfo, FunctionSig, IrEmitter, PrimKind, Renames, Settings, Type, Var, Walker,
    ir::{Continuation, Function, Instr, Opcode, Statement},
    types::{Alloc, DefKind},
    validator::validate,
};

fn int_fut() -> Type {
    Type::PrimFuture(PrimKind::Int)
}

struct Harness {
    ctx: ContextStack,
    emitter: IrEmitter,
    settings: Settings,
    diag: CollectDiagnostics,
}

impl Harness {
    fn new() -> Self {
        let mut ctx = ContextStack::new(ForeignRegistry::with_specials());
        ctx.push_function("main");
        Self {
            ctx,
            emitter: IrEmitter::new("main", Vec::new(), Vec::new()),
            settings: Settings::new(),
            diag: CollectDiagnostics::new(),
        }
    }

    /// Declares a user variable in both the context and the emitted
    /// function.
    fn declare(&mut self, name: &str, ty: Type) -> Var {
        let var = self
            .ctx
            .declare_variable(Var::new(name, ty, Alloc::Stack, DefKind::LocalUser))
            .unwrap();
        self.emitter.declare(&var).unwrap();
        var
    }

    fn lower(&mut self, tree: &ExprTree, outs: &[Var]) -> Result<(), CompileError> {
        let mut walker = Walker::new(&self.settings, &mut self.diag);
        walker.eval_to_vars(&mut self.ctx, &mut self.emitter, tree, outs, &Renames::new())
    }

    fn finish(self) -> Function {
        let func = self.emitter.into_function().unwrap();
        let mut program = rillc::ir::Program::new();
        program.add_function(func.clone());
        validate(&program).unwrap();
        func
    }
}

fn opcodes(func: &Function) -> Vec<Opcode> {
    func.all_instrs().iter().map(|i| i.opcode()).collect()
}

#[test]
fn integer_arithmetic_lowers_to_async_plus_then_folds() {
    let mut h = Harness::new();
    let x = h.declare("x", int_fut());
    let tree = ExprTree::operator("+", int_fut(), vec![ExprTree::int_lit(2, 1), ExprTree::int_lit(3, 1)], 1);
    h.lower(&tree, std::slice::from_ref(&x)).unwrap();
    let func = h.finish();

    let instrs = func.all_instrs();
    assert_eq!(instrs.len(), 1);
    assert_eq!(instrs[0].opcode(), Opcode::AsyncOp);
    assert_eq!(instrs[0].inputs(), vec![Arg::int(2), Arg::int(3)]);
    assert_eq!(instrs[0].outputs(), vec![x.clone()]);

    // Constant folding turns the operation into an assignment of 5.
    let mut diag = CollectDiagnostics::new();
    let folded = instrs[0].constant_fold(&ahash::AHashMap::new(), &mut diag).unwrap();
    assert_eq!(folded.get("x"), Some(&Arg::int(5)));
}

#[test]
fn array_literal_builds_whole_array() {
    let mut h = Harness::new();
    let arr_ty = Type::array(int_fut(), int_fut());
    let a = h.declare("a", arr_ty.clone());
    let tree = ExprTree::array_elems(
        vec![ExprTree::int_lit(10, 2), ExprTree::int_lit(20, 2), ExprTree::int_lit(30, 2)],
        arr_ty,
        2,
    );
    h.lower(&tree, std::slice::from_ref(&a)).unwrap();
    let func = h.finish();

    // Three element futures, then one build closing the array.
    assert_eq!(
        opcodes(&func),
        vec![Opcode::StoreScalar, Opcode::StoreScalar, Opcode::StoreScalar, Opcode::ArrayBuild]
    );
    let build = func.all_instrs()[3].clone();
    let inputs = build.inputs();
    assert_eq!(inputs.len(), 6);
    assert_eq!(inputs[0], Arg::int(0));
    assert_eq!(inputs[2], Arg::int(1));
    assert_eq!(inputs[4], Arg::int(2));
    assert_eq!(build.outputs(), vec![a]);
}

#[test]
fn empty_array_literal_still_builds_and_closes() {
    let mut h = Harness::new();
    let arr_ty = Type::array(int_fut(), int_fut());
    let a = h.declare("a", arr_ty.clone());
    let tree = ExprTree::array_elems(Vec::new(), arr_ty, 2);
    h.lower(&tree, std::slice::from_ref(&a)).unwrap();
    let func = h.finish();
    assert_eq!(opcodes(&func), vec![Opcode::ArrayBuild]);
    assert!(func.all_instrs()[0].inputs().is_empty());
}

#[test]
fn nested_struct_access_lowers_to_stepwise_lookups() {
    let mut h = Harness::new();
    let inner_ty = Type::Struct(rillc::types::StructType {
        name: "Inner".to_string(),
        fields: vec![("field".to_string(), int_fut())],
    });
    let outer_ty = Type::Struct(rillc::types::StructType {
        name: "Outer".to_string(),
        fields: vec![("inner".to_string(), inner_ty)],
    });
    h.declare("s", outer_ty.clone());
    let y = h.declare("y", int_fut());

    let tree = ExprTree::struct_load(
        ExprTree::struct_load(ExprTree::variable("s", outer_ty, 3), "inner", int_fut(), 3),
        "field",
        int_fut(),
        3,
    );
    h.lower(&tree, std::slice::from_ref(&y)).unwrap();
    let func = h.finish();

    // Two lookups walking the path, then a copy into y (the member is an
    // int future, not a ref).
    assert_eq!(
        opcodes(&func),
        vec![Opcode::StructLookup, Opcode::StructLookup, Opcode::AsyncOp]
    );
    let instrs = func.all_instrs();
    assert_eq!(instrs[0].inputs()[1], Arg::str("inner"));
    assert_eq!(instrs[1].inputs()[1], Arg::str("field"));
    assert_eq!(instrs[2].outputs(), vec![y]);
}

#[test]
fn call_with_priority_annotation_waits_and_retrieves() {
    let mut h = Harness::new();
    let a = h.declare("a", int_fut());
    let b = h.declare("b", int_fut());
    let p = h.declare("p", int_fut());
    let o = h.declare("o", int_fut());
    h.ctx
        .define_function(
            "f",
            FunctionInfo::new(
                FnProp::Composite.into(),
                FunctionSig {
                    inputs: vec![int_fut(), int_fut()],
                    outputs: vec![int_fut()],
                },
            ),
        )
        .unwrap();

    let tree = ExprTree::call(
        "f",
        vec![
            ExprTree::variable("a", int_fut(), 4),
            ExprTree::variable("b", int_fut(), 4),
        ],
        vec![int_fut()],
        4,
    )
    .with_annotation(Annotation::Priority, ExprTree::variable("p", int_fut(), 4));
    h.lower(&tree, std::slice::from_ref(&o)).unwrap();
    let func = h.finish();

    // The call sits inside a wait on the priority future.
    let main = func.block(func.main_block());
    assert!(main.statements.is_empty());
    let Continuation::Wait(wait) = &main.continuations[0] else {
        panic!("expected wait continuation");
    };
    assert_eq!(wait.wait_vars, vec![p.clone()]);

    let body = func.block(wait.block);
    let Statement::Instr(retrieve) = &body.statements[0] else {
        panic!("expected retrieve");
    };
    assert_eq!(retrieve.opcode(), Opcode::LoadScalar);
    let Statement::Instr(Instr::FunctionCall(call)) = &body.statements[1] else {
        panic!("expected function call, got {:?}", body.statements[1]);
    };
    assert_eq!(call.op, Opcode::CallControl);
    assert_eq!(call.function, "f");
    assert_eq!(call.inputs.to_vec(), vec![Arg::from(&a), Arg::from(&b)]);
    assert_eq!(call.outputs, vec![o]);
    // The retrieved local value travels as the priority property.
    let priority = call.props.priority.as_ref().unwrap();
    assert_eq!(priority, &Arg::from(retrieve.outputs()[0].clone()));
}

#[test]
fn checkpointed_call_emits_lookup_branch() {
    let mut h = Harness::new();
    h.emitter = IrEmitter::new("main", Vec::new(), Vec::new()).with_checkpointing(true, true);
    let a = h.declare("a", int_fut());
    let o = h.declare("o", int_fut());
    h.ctx
        .define_function(
            "g",
            FunctionInfo::new(
                FnProp::Composite | FnProp::Checkpointed,
                FunctionSig {
                    inputs: vec![int_fut()],
                    outputs: vec![int_fut()],
                },
            ),
        )
        .unwrap();

    let tree = ExprTree::call("g", vec![ExprTree::variable("a", int_fut(), 5)], vec![int_fut()], 5);
    h.lower(&tree, std::slice::from_ref(&o)).unwrap();
    let func = h.finish();

    // Everything happens inside a recursive wait on the inputs.
    let main = func.block(func.main_block());
    let Continuation::Wait(wait) = &main.continuations[0] else {
        panic!("expected wait continuation");
    };
    assert!(wait.recursive);
    assert_eq!(wait.wait_vars, vec![a]);

    let body = func.block(wait.block);
    let body_ops: Vec<Opcode> = body
        .statements
        .iter()
        .filter_map(|s| match s {
            Statement::Instr(i) => Some(i.opcode()),
            Statement::Conditional(_) => None,
        })
        .collect();
    assert!(body_ops.contains(&Opcode::LoadScalar));
    assert!(body_ops.contains(&Opcode::PackValues));
    assert!(body_ops.contains(&Opcode::LookupCheckpoint));
    // Both the key blob and the value blob are released in this block.
    assert_eq!(body_ops.iter().filter(|op| **op == Opcode::FreeBlob).count(), 2);

    // The hit branch unpacks and never calls; the miss branch calls and
    // writes the checkpoint back.
    let cond = body
        .statements
        .iter()
        .find_map(|s| match s {
            Statement::Conditional(c) => Some(c),
            Statement::Instr(_) => None,
        })
        .expect("expected a conditional in the wait body");
    let then_ops: Vec<Opcode> = func.block(cond.then_block).statements.iter().filter_map(instr_op).collect();
    assert_eq!(then_ops, vec![Opcode::UnpackValues]);

    let else_block = func.block(cond.else_block.unwrap());
    let else_ops: Vec<Opcode> = else_block.statements.iter().filter_map(instr_op).collect();
    assert_eq!(else_ops, vec![Opcode::CallControl]);
    let Continuation::Wait(write_wait) = &else_block.continuations[0] else {
        panic!("expected write-back wait");
    };
    let write_ops: Vec<Opcode> = func.block(write_wait.block).statements.iter().filter_map(instr_op).collect();
    assert!(write_ops.contains(&Opcode::WriteCheckpoint));
}

fn instr_op(statement: &Statement) -> Option<Opcode> {
    match statement {
        Statement::Instr(i) => Some(i.opcode()),
        Statement::Conditional(_) => None,
    }
}

#[test]
fn assignment_to_self_is_an_error() {
    let mut h = Harness::new();
    let x = h.declare("x", int_fut());
    let tree = ExprTree::variable("x", int_fut(), 6);
    let err = h.lower(&tree, std::slice::from_ref(&x)).unwrap_err();
    assert!(matches!(err, CompileError::Definition { .. }));
}

#[test]
fn updateable_assignment_snapshots_exactly_once() {
    let mut h = Harness::new();
    h.declare("u", Type::updateable_float());
    let x = h.declare("x", Type::PrimFuture(PrimKind::Float));
    let tree = ExprTree::variable("u", Type::updateable_float(), 7);
    h.lower(&tree, std::slice::from_ref(&x)).unwrap();
    let func = h.finish();
    assert_eq!(opcodes(&func), vec![Opcode::LatestValue, Opcode::StoreScalar]);
}

#[test]
fn int_literal_into_float_future_is_reinterpreted() {
    let mut h = Harness::new();
    let x = h.declare("x", Type::PrimFuture(PrimKind::Float));
    let tree = ExprTree::int_lit(3, 8);
    h.lower(&tree, std::slice::from_ref(&x)).unwrap();
    let func = h.finish();
    assert_eq!(func.all_instrs()[0].inputs(), vec![Arg::float(3.0)]);
}

#[test]
fn array_range_lowers_to_range_builtin() {
    let mut h = Harness::new();
    let arr_ty = Type::array(int_fut(), int_fut());
    let a = h.declare("a", arr_ty.clone());
    let tree = ExprTree::array_range(vec![ExprTree::int_lit(1, 9), ExprTree::int_lit(4, 9)], arr_ty, 9);
    h.lower(&tree, std::slice::from_ref(&a)).unwrap();
    let func = h.finish();
    let instrs = func.all_instrs();
    let Instr::ForeignCall(call) = instrs.last().unwrap() else {
        panic!("expected foreign call");
    };
    assert_eq!(call.function, "range");
    assert_eq!(call.outputs, vec![a]);
}

#[test]
fn deprecated_function_warns() {
    let mut h = Harness::new();
    let o = h.declare("o", int_fut());
    h.ctx
        .define_function(
            "old_thing",
            FunctionInfo::new(
                FnProp::Composite | FnProp::Deprecated,
                FunctionSig {
                    inputs: Vec::new(),
                    outputs: vec![int_fut()],
                },
            ),
        )
        .unwrap();
    let tree = ExprTree::call("old_thing", Vec::new(), vec![int_fut()], 10);
    h.lower(&tree, std::slice::from_ref(&o)).unwrap();
    assert!(h.diag.has_warning_containing("deprecated"));
}

#[test]
fn asserts_are_elided_when_disabled() {
    let mut h = Harness::new();
    h.settings.disable_asserts = true;
    let c = h.declare("c", Type::PrimFuture(PrimKind::Bool));
    h.ctx
        .define_function(
            "assert",
            FunctionInfo::new(
                FnProp::Builtin.into(),
                FunctionSig {
                    inputs: vec![Type::PrimFuture(PrimKind::Bool), Type::PrimFuture(PrimKind::String)],
                    outputs: Vec::new(),
                },
            ),
        )
        .unwrap();
    let tree = ExprTree::call(
        "assert",
        vec![
            ExprTree::variable("c", Type::PrimFuture(PrimKind::Bool), 11),
            ExprTree::string_lit("failed", 11),
        ],
        Vec::new(),
        11,
    );
    let _ = c;
    h.lower(&tree, &[]).unwrap();
    let func = h.finish();
    assert!(func.all_instrs().is_empty());
}

#[test]
fn builtin_with_op_equivalent_lowers_to_async_op() {
    let mut h = Harness::new();
    let a = h.declare("a", int_fut());
    let o = h.declare("o", int_fut());
    h.ctx
        .define_function(
            "abs_int",
            FunctionInfo::new(
                FnProp::Builtin.into(),
                FunctionSig {
                    inputs: vec![int_fut()],
                    outputs: vec![int_fut()],
                },
            ),
        )
        .unwrap();
    h.ctx.foreign_mut().register(rillc::ForeignFn {
        op_equivalent: Some(rillc::ir::BuiltinOp::AbsInt),
        ..rillc::ForeignFn::pure_fn("abs_int")
    });
    let tree = ExprTree::call("abs_int", vec![ExprTree::variable("a", int_fut(), 12)], vec![int_fut()], 12);
    h.lower(&tree, std::slice::from_ref(&o)).unwrap();
    let func = h.finish();
    let instrs = func.all_instrs();
    assert_eq!(instrs.len(), 1);
    assert_eq!(instrs[0].opcode(), Opcode::AsyncOp);
    let _ = a;
}

#[test]
fn wrapped_app_call_goes_through_generated_wrapper() {
    let mut h = Harness::new();
    let o = h.declare("o", Type::PrimFuture(PrimKind::File));
    h.ctx
        .define_function(
            "simulate",
            FunctionInfo::new(
                FnProp::App | FnProp::Parallel,
                FunctionSig {
                    inputs: Vec::new(),
                    outputs: vec![Type::PrimFuture(PrimKind::File)],
                },
            ),
        )
        .unwrap();
    let tree = ExprTree::call("simulate", Vec::new(), vec![Type::PrimFuture(PrimKind::File)], 13)
        .with_annotation(Annotation::Par, ExprTree::int_lit(4, 13));
    h.lower(&tree, std::slice::from_ref(&o)).unwrap();
    let func = h.finish();
    let call = func
        .all_instrs()
        .into_iter()
        .find_map(|i| match i {
            Instr::FunctionCall(c) => Some(c.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(call.function, "wrap_simulate");
    assert_eq!(call.op, Opcode::CallSync);
    // Parallelism travels as an extra trailing argument.
    assert_eq!(call.inputs.len(), 1);
}

#[test]
fn annotation_on_undeclared_property_is_an_error() {
    let mut h = Harness::new();
    let o = h.declare("o", int_fut());
    h.ctx
        .define_function(
            "f",
            FunctionInfo::new(
                FnProp::Composite.into(),
                FunctionSig {
                    inputs: Vec::new(),
                    outputs: vec![int_fut()],
                },
            ),
        )
        .unwrap();
    let tree = ExprTree::call("f", Vec::new(), vec![int_fut()], 14)
        .with_annotation(Annotation::Par, ExprTree::int_lit(2, 14));
    let err = h.lower(&tree, std::slice::from_ref(&o)).unwrap_err();
    assert!(matches!(err, CompileError::Annotation { .. }));
}

//! The program tree: functions, blocks, continuations, statements.
//!
//! Blocks form a tree per function. Ownership lives in a per-function
//! arena (`Vec<Block>` indexed by [`BlockId`]); parent links are indices
//! into the same arena, so the structure stays acyclic for the borrow
//! checker while the validator can still check parent-link invariants.

use std::fmt;

use super::{TaskMode, TaskProps, WaitMode, instr::Instr};
use crate::{arg::Arg, types::Var};

/// Index of a block within its function's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct BlockId(pub u32);

impl BlockId {
    #[must_use]
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// What role a block plays in its parent construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, serde::Serialize, serde::Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum BlockKind {
    /// A function's top-level block.
    Main,
    /// Body of a wait statement.
    WaitBody,
    /// Body of a foreach loop.
    ForeachBody,
    /// True branch of a conditional.
    ThenBlock,
    /// False branch of a conditional.
    ElseBlock,
}

/// A statement: either an instruction or a conditional.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Statement {
    Instr(Instr),
    Conditional(Conditional),
}

/// A two-way branch on a local boolean value.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Conditional {
    pub condition: Arg,
    pub then_block: BlockId,
    pub else_block: Option<BlockId>,
}

/// A suspension until the listed variables are closed.
///
/// `WaitOnly` waits spawn no task body; execution simply does not proceed
/// into the block until the variables are closed (recursively for
/// containers when `recursive` is set).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct WaitStatement {
    pub name: String,
    pub wait_vars: Vec<Var>,
    pub mode: WaitMode,
    pub recursive: bool,
    /// Whether statements after the wait run without entering it.
    pub continue_after: bool,
    pub task_mode: TaskMode,
    pub props: TaskProps,
    pub block: BlockId,
}

/// A data-parallel loop over the members of a container.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ForeachLoop {
    pub loop_name: String,
    pub array: Var,
    /// Bound to each member inside the body.
    pub member_var: Var,
    /// Bound to the member's key, when requested.
    pub key_var: Option<Var>,
    pub block: BlockId,
}

/// A continuation: a construct owning a child block.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Continuation {
    Wait(WaitStatement),
    Foreach(ForeachLoop),
}

impl Continuation {
    /// The child block this continuation owns.
    #[must_use]
    pub fn block(&self) -> BlockId {
        match self {
            Self::Wait(w) => w.block,
            Self::Foreach(l) => l.block,
        }
    }

    /// Variables the construct itself defines for its body (loop member
    /// and key variables).
    #[must_use]
    pub fn construct_vars(&self) -> Vec<Var> {
        match self {
            Self::Wait(_) => Vec::new(),
            Self::Foreach(l) => {
                let mut vars = vec![l.member_var.clone()];
                vars.extend(l.key_var.iter().cloned());
                vars
            }
        }
    }
}

/// A cleanup attached to a block: an action run when the block's scope
/// ends, referencing a variable that must be in scope there.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CleanupAction {
    pub var: Var,
    pub action: Instr,
}

/// A block: straight-line statements, then continuations, plus the
/// variables declared in it and its cleanups.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Block {
    pub kind: BlockKind,
    pub statements: Vec<Statement>,
    pub continuations: Vec<Continuation>,
    pub cleanups: Vec<CleanupAction>,
    pub declared: Vec<Var>,
    /// Owning block, or `None` for a function's main block.
    pub parent: Option<BlockId>,
}

impl Block {
    fn new(kind: BlockKind, parent: Option<BlockId>) -> Self {
        Self {
            kind,
            statements: Vec::new(),
            continuations: Vec::new(),
            cleanups: Vec::new(),
            declared: Vec::new(),
            parent,
        }
    }
}

/// A function under construction or in final form.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Function {
    pub name: String,
    pub inputs: Vec<Var>,
    pub outputs: Vec<Var>,
    blocks: Vec<Block>,
    main: BlockId,
}

impl Function {
    /// Creates a function with an empty main block.
    #[must_use]
    pub fn new(name: impl Into<String>, inputs: Vec<Var>, outputs: Vec<Var>) -> Self {
        Self {
            name: name.into(),
            inputs,
            outputs,
            blocks: vec![Block::new(BlockKind::Main, None)],
            main: BlockId(0),
        }
    }

    #[must_use]
    pub fn main_block(&self) -> BlockId {
        self.main
    }

    /// Allocates a child block under `parent`.
    #[must_use]
    pub fn alloc_block(&mut self, kind: BlockKind, parent: BlockId) -> BlockId {
        let id = BlockId(u32::try_from(self.blocks.len()).expect("block arena exceeds u32"));
        self.blocks.push(Block::new(kind, Some(parent)));
        id
    }

    /// The block at `id`.
    ///
    /// # Panics
    ///
    /// Panics on a dangling id, which indicates a compiler bug.
    #[must_use]
    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    #[must_use]
    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.index()]
    }

    /// All blocks with their ids, in allocation order.
    pub fn blocks(&self) -> impl Iterator<Item = (BlockId, &Block)> {
        self.blocks
            .iter()
            .enumerate()
            .map(|(i, b)| (BlockId(u32::try_from(i).expect("block arena exceeds u32")), b))
    }

    pub fn push_statement(&mut self, block: BlockId, statement: Statement) {
        self.block_mut(block).statements.push(statement);
    }

    pub fn push_instr(&mut self, block: BlockId, instr: Instr) {
        self.push_statement(block, Statement::Instr(instr));
    }

    /// Records a variable declaration in `block`.
    pub fn declare(&mut self, block: BlockId, var: Var) {
        self.block_mut(block).declared.push(var);
    }

    /// All instructions in the function, depth-first.
    pub fn all_instrs(&self) -> Vec<&Instr> {
        let mut instrs = Vec::new();
        self.collect_instrs(self.main, &mut instrs);
        instrs
    }

    fn collect_instrs<'a>(&'a self, block: BlockId, out: &mut Vec<&'a Instr>) {
        let block = self.block(block);
        for statement in &block.statements {
            match statement {
                Statement::Instr(instr) => out.push(instr),
                Statement::Conditional(cond) => {
                    self.collect_instrs(cond.then_block, out);
                    if let Some(else_block) = cond.else_block {
                        self.collect_instrs(else_block, out);
                    }
                }
            }
        }
        for cont in &block.continuations {
            self.collect_instrs(cont.block(), out);
        }
    }
}

/// A lowered program: global constants plus functions.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Program {
    pub globals: Vec<Var>,
    pub functions: Vec<Function>,
}

impl Program {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_function(&mut self, function: Function) {
        self.functions.push(function);
    }

    #[must_use]
    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn {}(", self.name)?;
        for (i, v) in self.inputs.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{v}")?;
        }
        f.write_str(") -> (")?;
        for (i, v) in self.outputs.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{v}")?;
        }
        f.write_str(")\n")?;
        self.fmt_block(f, self.main, 1)
    }
}

impl Function {
    fn fmt_block(&self, f: &mut fmt::Formatter<'_>, id: BlockId, depth: usize) -> fmt::Result {
        let indent = "  ".repeat(depth);
        let block = self.block(id);
        for statement in &block.statements {
            match statement {
                Statement::Instr(_) => writeln!(f, "{indent}{statement}")?,
                Statement::Conditional(cond) => {
                    writeln!(f, "{indent}if {} {{", cond.condition)?;
                    self.fmt_block(f, cond.then_block, depth + 1)?;
                    if let Some(else_block) = cond.else_block {
                        writeln!(f, "{indent}}} else {{")?;
                        self.fmt_block(f, else_block, depth + 1)?;
                    }
                    writeln!(f, "{indent}}}")?;
                }
            }
        }
        for cont in &block.continuations {
            f.write_str(&indent)?;
            cont.fmt_header(f)?;
            f.write_str(" {\n")?;
            self.fmt_block(f, cont.block(), depth + 1)?;
            writeln!(f, "{indent}}}")?;
        }
        Ok(())
    }
}

impl Continuation {
    /// Writes the construct's header line, without the child block.
    fn fmt_header(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wait(w) => {
                write!(f, "wait {} [", w.name)?;
                for (i, v) in w.wait_vars.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    f.write_str(&v.name)?;
                }
                f.write_str("]")?;
                if w.recursive {
                    f.write_str(" recursive")?;
                }
                Ok(())
            }
            Self::Foreach(l) => write!(f, "foreach {} in {}", l.member_var.name, l.array.name),
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Instr(instr) => write!(f, "{instr}"),
            Self::Conditional(cond) => {
                write!(f, "if {} -> block {}", cond.condition, cond.then_block.0)?;
                if let Some(else_block) = cond.else_block {
                    write!(f, " else block {}", else_block.0)?;
                }
                Ok(())
            }
        }
    }
}

/// Renders the block's own contents, one statement per line. Child
/// blocks appear by id; only the owning function's arena can resolve
/// them (the indented recursive view is `Function`'s `Display`).
impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for statement in &self.statements {
            writeln!(f, "{statement}")?;
        }
        for cont in &self.continuations {
            cont.fmt_header(f)?;
            writeln!(f, " -> block {}", cont.block().0)?;
        }
        Ok(())
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for function in &self.functions {
            writeln!(f, "{function}")?;
        }
        Ok(())
    }
}

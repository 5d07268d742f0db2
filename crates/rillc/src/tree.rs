//! The typed expression trees the walker consumes.
//!
//! Earlier phases (parsing and type checking) hand the middle end trees
//! whose nodes carry a token, the source text of the node, the type
//! alternatives the checker derived, and a source line. The walker
//! concretizes union alternatives against the expected output types as it
//! lowers.

use crate::{
    error::{CompileError, CompileResult},
    ir::TaskPropKey,
    types::Type,
};

/// Token of an expression-tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, serde::Serialize, serde::Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum ExprToken {
    Variable,
    IntLiteral,
    FloatLiteral,
    StringLiteral,
    BoolLiteral,
    Operator,
    CallFunction,
    ArrayLoad,
    StructLoad,
    ArrayRange,
    ArrayElems,
    ArrayKvElems,
}

/// A call annotation: `@prio=`, `@par=`, `@location=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, serde::Serialize, serde::Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum Annotation {
    Priority,
    Par,
    Location,
}

impl Annotation {
    /// The task property the annotation sets.
    #[must_use]
    pub fn prop_key(self) -> TaskPropKey {
        match self {
            Self::Priority => TaskPropKey::Priority,
            Self::Par => TaskPropKey::Parallelism,
            Self::Location => TaskPropKey::Location,
        }
    }
}

/// A typed expression-tree node.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ExprTree {
    pub token: ExprToken,
    /// Variable name, literal text, operator name, function name, or
    /// struct field name, depending on the token.
    pub text: String,
    /// Type alternatives from the checker. A concrete node has exactly
    /// one; union-typed nodes are concretized during lowering.
    pub types: Vec<Type>,
    pub children: Vec<ExprTree>,
    /// Call annotations; only meaningful on `CallFunction` nodes.
    pub annotations: Vec<(Annotation, ExprTree)>,
    pub line: u32,
}

impl ExprTree {
    fn node(token: ExprToken, text: impl Into<String>, types: Vec<Type>, children: Vec<Self>, line: u32) -> Self {
        Self {
            token,
            text: text.into(),
            types,
            children,
            annotations: Vec::new(),
            line,
        }
    }

    #[must_use]
    pub fn variable(name: impl Into<String>, ty: Type, line: u32) -> Self {
        Self::node(ExprToken::Variable, name, vec![ty], Vec::new(), line)
    }

    #[must_use]
    pub fn int_lit(value: i64, line: u32) -> Self {
        Self::node(ExprToken::IntLiteral, value.to_string(), Vec::new(), Vec::new(), line)
    }

    #[must_use]
    pub fn float_lit(value: f64, line: u32) -> Self {
        Self::node(
            ExprToken::FloatLiteral,
            ryu::Buffer::new().format(value),
            Vec::new(),
            Vec::new(),
            line,
        )
    }

    #[must_use]
    pub fn string_lit(value: impl Into<String>, line: u32) -> Self {
        Self::node(ExprToken::StringLiteral, value, Vec::new(), Vec::new(), line)
    }

    #[must_use]
    pub fn bool_lit(value: bool, line: u32) -> Self {
        Self::node(ExprToken::BoolLiteral, value.to_string(), Vec::new(), Vec::new(), line)
    }

    /// An operator application; `name` is the surface operator (`+`,
    /// `<=`, ...), `ty` the result type.
    #[must_use]
    pub fn operator(name: impl Into<String>, ty: Type, operands: Vec<Self>, line: u32) -> Self {
        Self::node(ExprToken::Operator, name, vec![ty], operands, line)
    }

    /// A function call; `types` are the call's result types.
    #[must_use]
    pub fn call(function: impl Into<String>, args: Vec<Self>, types: Vec<Type>, line: u32) -> Self {
        Self::node(ExprToken::CallFunction, function, types, args, line)
    }

    /// Attaches a call annotation.
    #[must_use]
    pub fn with_annotation(mut self, annotation: Annotation, value: Self) -> Self {
        self.annotations.push((annotation, value));
        self
    }

    /// An array element load: children are `[array, index]`.
    #[must_use]
    pub fn array_load(array: Self, index: Self, ty: Type, line: u32) -> Self {
        Self::node(ExprToken::ArrayLoad, "", vec![ty], vec![array, index], line)
    }

    /// A struct member load: the single child is the struct expression,
    /// the text is the field name.
    #[must_use]
    pub fn struct_load(object: Self, field: impl Into<String>, ty: Type, line: u32) -> Self {
        Self::node(ExprToken::StructLoad, field, vec![ty], vec![object], line)
    }

    /// A range constructor `[start:end]` or `[start:end:step]`.
    #[must_use]
    pub fn array_range(bounds: Vec<Self>, ty: Type, line: u32) -> Self {
        Self::node(ExprToken::ArrayRange, "", vec![ty], bounds, line)
    }

    /// An array literal `[e0, e1, ...]` with implicit integer keys.
    #[must_use]
    pub fn array_elems(elems: Vec<Self>, ty: Type, line: u32) -> Self {
        Self::node(ExprToken::ArrayElems, "", vec![ty], elems, line)
    }

    /// An array literal `[k0=v0, k1=v1, ...]`; children alternate key,
    /// value.
    #[must_use]
    pub fn array_kv_elems(pairs: Vec<(Self, Self)>, ty: Type, line: u32) -> Self {
        let children = pairs.into_iter().flat_map(|(k, v)| [k, v]).collect();
        Self::node(ExprToken::ArrayKvElems, "", vec![ty], children, line)
    }

    #[must_use]
    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// The `i`-th child.
    ///
    /// # Panics
    ///
    /// Panics when out of range; tree shapes are fixed per token, so this
    /// indicates a front-end bug.
    #[must_use]
    pub fn child(&self, i: usize) -> &Self {
        &self.children[i]
    }

    /// The node's single concrete type; raises a type error for nodes the
    /// checker left union-typed or untyped.
    pub fn get_type(&self) -> CompileResult<&Type> {
        match &self.types[..] {
            [ty] => Ok(ty),
            [] => Err(CompileError::type_error(
                self.line,
                format!("expression ({}) carries no type", self.token),
            )),
            _ => Err(CompileError::type_error(
                self.line,
                format!("expression ({}) has unresolved type alternatives", self.token),
            )),
        }
    }

    /// All type alternatives of the node (may be empty for literals,
    /// whose type comes from the assignment context).
    #[must_use]
    pub fn type_alternatives(&self) -> &[Type] {
        &self.types
    }
}

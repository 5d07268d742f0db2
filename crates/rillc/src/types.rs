//! The algebra of Rill types and the variable descriptor.
//!
//! Types distinguish asynchronously-assigned futures (`PrimFuture`) from
//! synchronously available local values (`PrimValue`). Containers carry
//! future-typed keys and elements; references add one level of
//! indirection. `Union` appears only transiently in the typed trees the
//! checker hands us and is concretized during lowering.

use std::fmt;

use crate::error::{CompileError, CompileResult};

/// Primitive kinds shared by futures, local values, and updateables.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::IntoStaticStr,
    serde::Serialize, serde::Deserialize,
)]
#[strum(serialize_all = "lowercase")]
pub enum PrimKind {
    Int,
    Float,
    Bool,
    String,
    Blob,
    Void,
    File,
}

/// A named record type: nominal, with ordered fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct StructType {
    pub name: String,
    pub fields: Vec<(String, Type)>,
}

impl StructType {
    /// Looks up a field's type by name.
    #[must_use]
    pub fn field_type(&self, field: &str) -> Option<&Type> {
        self.fields.iter().find(|(name, _)| name == field).map(|(_, ty)| ty)
    }
}

/// A Rill type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Type {
    /// Single-assignment asynchronous cell of a primitive kind.
    PrimFuture(PrimKind),
    /// Synchronously available local value of a primitive kind.
    PrimValue(PrimKind),
    /// Mutable cell supporting monotonic updates (min, increment, scale).
    ///
    /// The kind is currently restricted to `Float`; `updateable_float()`
    /// is the only constructor.
    PrimUpdateable(PrimKind),
    /// A reference whose contents, once assigned, point to a value of the
    /// inner type.
    Ref(Box<Type>),
    /// Associative container with future-typed keys.
    Array { key: Box<Type>, elem: Box<Type> },
    /// Unordered multiset.
    Bag(Box<Type>),
    /// Nominal record type.
    Struct(StructType),
    /// Set of alternatives produced by the type checker. Concretized
    /// before lowering; never appears in emitted IR.
    Union(Vec<Type>),
}

impl Type {
    /// The updateable float cell type.
    #[must_use]
    pub fn updateable_float() -> Self {
        Self::PrimUpdateable(PrimKind::Float)
    }

    /// An array with the given key and element types.
    #[must_use]
    pub fn array(key: Self, elem: Self) -> Self {
        Self::Array {
            key: Box::new(key),
            elem: Box::new(elem),
        }
    }

    /// A reference to the given type.
    #[must_use]
    pub fn ref_to(inner: Self) -> Self {
        Self::Ref(Box::new(inner))
    }

    /// True for single-assignment primitive futures.
    #[must_use]
    pub fn is_prim_future(&self) -> bool {
        matches!(self, Self::PrimFuture(_))
    }

    /// True for synchronously available primitive local values.
    #[must_use]
    pub fn is_prim_value(&self) -> bool {
        matches!(self, Self::PrimValue(_))
    }

    /// True for updateable cells.
    #[must_use]
    pub fn is_updateable(&self) -> bool {
        matches!(self, Self::PrimUpdateable(_))
    }

    /// True for references.
    #[must_use]
    pub fn is_ref(&self) -> bool {
        matches!(self, Self::Ref(_))
    }

    /// True for arrays and bags.
    #[must_use]
    pub fn is_container(&self) -> bool {
        matches!(self, Self::Array { .. } | Self::Bag(_))
    }

    /// True for arrays.
    #[must_use]
    pub fn is_array(&self) -> bool {
        matches!(self, Self::Array { .. })
    }

    /// True for struct types.
    #[must_use]
    pub fn is_struct(&self) -> bool {
        matches!(self, Self::Struct(_))
    }

    /// True for union types.
    #[must_use]
    pub fn is_union(&self) -> bool {
        matches!(self, Self::Union(_))
    }

    /// The primitive kind of a future, local value, or updateable.
    #[must_use]
    pub fn prim_kind(&self) -> Option<PrimKind> {
        match self {
            Self::PrimFuture(k) | Self::PrimValue(k) | Self::PrimUpdateable(k) => Some(*k),
            _ => None,
        }
    }

    /// True for `File`-kinded futures or values.
    #[must_use]
    pub fn is_file(&self) -> bool {
        self.prim_kind() == Some(PrimKind::File)
    }

    /// The union alternatives, treating a non-union type as a singleton.
    #[must_use]
    pub fn alternatives(&self) -> &[Self] {
        match self {
            Self::Union(alts) => alts,
            _ => std::slice::from_ref(self),
        }
    }

    /// Strips one level of reference, yielding the referand type.
    #[must_use]
    pub fn deref_result_type(&self) -> Option<&Self> {
        match self {
            Self::Ref(inner) => Some(inner),
            _ => None,
        }
    }

    /// The element type of an array or bag.
    #[must_use]
    pub fn container_elem_type(&self) -> Option<&Self> {
        match self {
            Self::Array { elem, .. } => Some(elem),
            Self::Bag(elem) => Some(elem),
            _ => None,
        }
    }

    /// The key type of an array.
    #[must_use]
    pub fn array_key_type(&self) -> Option<&Self> {
        match self {
            Self::Array { key, .. } => Some(key),
            _ => None,
        }
    }

    /// Recursively strips futures, yielding the local-value shape of the
    /// type: futures become values, references unwrap, and containers and
    /// structs recurse into their members.
    #[must_use]
    pub fn unpacked_container_type(&self) -> Self {
        match self {
            Self::PrimFuture(k) => Self::PrimValue(*k),
            Self::Ref(inner) => inner.unpacked_container_type(),
            Self::Array { key, elem } => Self::Array {
                key: key.clone(),
                elem: Box::new(elem.unpacked_container_type()),
            },
            Self::Bag(elem) => Self::Bag(Box::new(elem.unpacked_container_type())),
            Self::Struct(st) => Self::Struct(StructType {
                name: st.name.clone(),
                fields: st
                    .fields
                    .iter()
                    .map(|(name, ty)| (name.clone(), ty.unpacked_container_type()))
                    .collect(),
            }),
            other => other.clone(),
        }
    }

    /// The future equivalent of a local-value type.
    ///
    /// Used when a constant must be materialized into a future. Non-value
    /// types are returned unchanged.
    #[must_use]
    pub fn future_type(&self) -> Self {
        match self {
            Self::PrimValue(k) => Self::PrimFuture(*k),
            other => other.clone(),
        }
    }

    /// True if a value of `self` can be assigned to a location of `other`.
    ///
    /// Assignability is structural equality with union alternatives
    /// reconciled on both sides: some alternative of `self` must equal
    /// some alternative of `other`.
    #[must_use]
    pub fn assignable_to(&self, other: &Self) -> bool {
        self.alternatives()
            .iter()
            .any(|a| other.alternatives().iter().any(|b| a == b))
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PrimFuture(k) => write!(f, "{k}"),
            Self::PrimValue(k) => write!(f, "${k}"),
            Self::PrimUpdateable(k) => write!(f, "updateable_{k}"),
            Self::Ref(inner) => write!(f, "*{inner}"),
            Self::Array { key, elem } => write!(f, "{elem}[{key}]"),
            Self::Bag(elem) => write!(f, "bag<{elem}>"),
            Self::Struct(st) => write!(f, "{}", st.name),
            Self::Union(alts) => {
                let mut first = true;
                for alt in alts {
                    if !first {
                        write!(f, "|")?;
                    }
                    first = false;
                    write!(f, "{alt}")?;
                }
                Ok(())
            }
        }
    }
}

/// Asserts that `src` is assignable to `dst`, raising a type error otherwise.
pub fn check_copy(src: &Type, dst: &Type) -> CompileResult<()> {
    if src.assignable_to(dst) {
        Ok(())
    } else {
        Err(CompileError::type_error_no_line(format!(
            "cannot copy value of type {src} to location of type {dst}"
        )))
    }
}

/// Allocation class of a variable.
///
/// `Alias` marks a handle to storage owned elsewhere (e.g. an array slot);
/// `Local` marks a plain value held in the enclosing task's frame; the
/// remaining classes denote backend-visible futures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, serde::Serialize, serde::Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum Alloc {
    Stack,
    Temp,
    Alias,
    Local,
    GlobalConst,
}

/// How a variable came to be defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, serde::Serialize, serde::Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum DefKind {
    /// Declared by the user in source.
    LocalUser,
    /// Minted by the compiler (temporaries, aliases, locals).
    LocalCompiler,
    /// A global constant.
    GlobalConst,
    /// A function input parameter.
    InputArg,
    /// A function output parameter.
    OutputArg,
}

/// A variable descriptor.
///
/// Instructions reference variables by descriptor, not by owning handle;
/// two descriptors denote the same variable exactly when they compare
/// equal (name, type, allocation, definition kind, and mapping all match).
/// Names are unique within a function, which the validator enforces.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Var {
    pub name: String,
    pub ty: Type,
    pub alloc: Alloc,
    pub def: DefKind,
    /// For `File`-typed variables only: the `String` variable holding the
    /// filename this file is mapped to.
    pub mapping: Option<Box<Var>>,
}

impl Var {
    /// Creates an unmapped variable.
    #[must_use]
    pub fn new(name: impl Into<String>, ty: Type, alloc: Alloc, def: DefKind) -> Self {
        Self {
            name: name.into(),
            ty,
            alloc,
            def,
            mapping: None,
        }
    }

    /// Creates a file variable mapped to a filename variable.
    ///
    /// The mapping target must be a previously declared `String` variable;
    /// the caller (the context) checks this before construction.
    #[must_use]
    pub fn new_mapped(name: impl Into<String>, ty: Type, alloc: Alloc, def: DefKind, mapping: Self) -> Self {
        Self {
            name: name.into(),
            ty,
            alloc,
            def,
            mapping: Some(Box::new(mapping)),
        }
    }

    /// True if this variable carries a filename mapping.
    #[must_use]
    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }

    /// True if reads of this variable may suspend (futures and refs).
    #[must_use]
    pub fn blocks_reads(&self) -> bool {
        self.ty.is_prim_future() || self.ty.is_ref()
    }
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.ty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicates() {
        let fut = Type::PrimFuture(PrimKind::Int);
        let val = Type::PrimValue(PrimKind::Int);
        let arr = Type::array(Type::PrimFuture(PrimKind::Int), fut.clone());

        assert!(fut.is_prim_future());
        assert!(!fut.is_prim_value());
        assert!(val.is_prim_value());
        assert!(arr.is_container());
        assert!(arr.is_array());
        assert!(!arr.is_ref());
        assert!(Type::ref_to(fut.clone()).is_ref());
        assert!(Type::updateable_float().is_updateable());
    }

    #[test]
    fn test_deref_and_container_projections() {
        let fut = Type::PrimFuture(PrimKind::Float);
        let r = Type::ref_to(fut.clone());
        assert_eq!(r.deref_result_type(), Some(&fut));
        assert_eq!(fut.deref_result_type(), None);

        let arr = Type::array(Type::PrimFuture(PrimKind::Int), fut.clone());
        assert_eq!(arr.container_elem_type(), Some(&fut));
        assert_eq!(arr.array_key_type(), Some(&Type::PrimFuture(PrimKind::Int)));
        assert_eq!(Type::Bag(Box::new(fut.clone())).container_elem_type(), Some(&fut));
    }

    #[test]
    fn test_unpacked_container_type_strips_futures_recursively() {
        let nested = Type::array(
            Type::PrimFuture(PrimKind::Int),
            Type::ref_to(Type::array(
                Type::PrimFuture(PrimKind::Int),
                Type::PrimFuture(PrimKind::Float),
            )),
        );
        let unpacked = nested.unpacked_container_type();
        assert_eq!(
            unpacked,
            Type::array(
                Type::PrimFuture(PrimKind::Int),
                Type::array(Type::PrimFuture(PrimKind::Int), Type::PrimValue(PrimKind::Float)),
            )
        );
    }

    #[test]
    fn test_assignable_with_unions() {
        let int_fut = Type::PrimFuture(PrimKind::Int);
        let float_fut = Type::PrimFuture(PrimKind::Float);
        let union = Type::Union(vec![int_fut.clone(), float_fut.clone()]);

        assert!(int_fut.assignable_to(&int_fut));
        assert!(!int_fut.assignable_to(&float_fut));
        assert!(int_fut.assignable_to(&union));
        assert!(union.assignable_to(&float_fut));
    }

    #[test]
    fn test_check_copy_mismatch() {
        let src = Type::PrimFuture(PrimKind::String);
        let dst = Type::PrimFuture(PrimKind::Int);
        assert!(check_copy(&src, &src).is_ok());
        let err = check_copy(&src, &dst).unwrap_err();
        assert!(matches!(err, CompileError::Type { .. }));
    }

    #[test]
    fn test_var_identity_includes_mapping() {
        let filename = Var::new("fname", Type::PrimFuture(PrimKind::String), Alloc::Stack, DefKind::LocalUser);
        let plain = Var::new("f", Type::PrimFuture(PrimKind::File), Alloc::Stack, DefKind::LocalUser);
        let mapped = Var::new_mapped(
            "f",
            Type::PrimFuture(PrimKind::File),
            Alloc::Stack,
            DefKind::LocalUser,
            filename,
        );
        assert_ne!(plain, mapped);
        assert!(mapped.is_mapped());
        assert!(plain.blocks_reads());
    }
}

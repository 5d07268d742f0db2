use std::fmt;

/// Result type alias for operations that can fail with a compile error.
pub type CompileResult<T> = Result<T, CompileError>;

/// Error raised by the middle end, separating failures by cause.
///
/// Keeping the error kinds distinct lets callers report user mistakes
/// (type, name, definition, annotation, option errors) differently from
/// internal invariant violations, which indicate a compiler bug and are
/// never caught.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum CompileError {
    /// Operand or assignment types don't match: operator/function argument
    /// mismatch, array index type disagreeing with the key type, a copy
    /// incompatible with a file mapping, or a dereference of a non-ref.
    Type { line: Option<u32>, message: String },
    /// Undefined variable, type, or function.
    Name { line: Option<u32>, message: String },
    /// Double definition in the same scope, assignment to self, or an
    /// attempt to define a function in a non-global context.
    Definition { line: Option<u32>, message: String },
    /// A call annotation names a property the function doesn't declare.
    Annotation { line: Option<u32>, message: String },
    /// A required compiler option is missing.
    Option { message: String },
    /// A "cannot happen" condition. Fatal; never caught.
    Internal { message: String },
}

impl CompileError {
    /// Creates a type error with source-line context.
    pub fn type_error(line: u32, message: impl Into<String>) -> Self {
        Self::Type {
            line: Some(line),
            message: message.into(),
        }
    }

    /// Creates a type error with no source position (e.g. from `check_copy`).
    pub fn type_error_no_line(message: impl Into<String>) -> Self {
        Self::Type {
            line: None,
            message: message.into(),
        }
    }

    /// Creates a name error with source-line context.
    pub fn name_error(line: u32, message: impl Into<String>) -> Self {
        Self::Name {
            line: Some(line),
            message: message.into(),
        }
    }

    /// Creates a definition error with source-line context.
    pub fn definition_error(line: u32, message: impl Into<String>) -> Self {
        Self::Definition {
            line: Some(line),
            message: message.into(),
        }
    }

    /// Creates a definition error with no source position.
    pub fn definition_error_no_line(message: impl Into<String>) -> Self {
        Self::Definition {
            line: None,
            message: message.into(),
        }
    }

    /// Creates an annotation error with source-line context.
    pub fn annotation_error(line: u32, message: impl Into<String>) -> Self {
        Self::Annotation {
            line: Some(line),
            message: message.into(),
        }
    }

    /// Creates an internal invariant violation.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// The source line the error is attached to, if any.
    #[must_use]
    pub fn line(&self) -> Option<u32> {
        match self {
            Self::Type { line, .. }
            | Self::Name { line, .. }
            | Self::Definition { line, .. }
            | Self::Annotation { line, .. } => *line,
            Self::Option { .. } | Self::Internal { .. } => None,
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (kind, line, message) = match self {
            Self::Type { line, message } => ("type error", *line, message),
            Self::Name { line, message } => ("name error", *line, message),
            Self::Definition { line, message } => ("definition error", *line, message),
            Self::Annotation { line, message } => ("annotation error", *line, message),
            Self::Option { message } => ("option error", None, message),
            Self::Internal { message } => ("internal error", None, message),
        };
        match line {
            Some(line) => write!(f, "{kind} at line {line}: {message}"),
            None => write!(f, "{kind}: {message}"),
        }
    }
}

impl std::error::Error for CompileError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_with_line() {
        let err = CompileError::type_error(12, "cannot assign string to int");
        assert_eq!(err.to_string(), "type error at line 12: cannot assign string to int");
        assert_eq!(err.line(), Some(12));
    }

    #[test]
    fn test_display_without_line() {
        let err = CompileError::internal("block parent link broken");
        assert_eq!(err.to_string(), "internal error: block parent link broken");
        assert_eq!(err.line(), None);
    }
}

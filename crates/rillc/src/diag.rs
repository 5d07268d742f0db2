//! Compiler diagnostics infrastructure.
//!
//! Provides a trait-based sink for warnings and notes emitted during
//! lowering and optimization queries. When using [`NoDiagnostics`], all
//! hooks compile away entirely via monomorphization.
//!
//! | Sink | Purpose |
//! |------|---------|
//! | [`NoDiagnostics`] | Zero-cost no-op |
//! | [`StderrDiagnostics`] | Human-readable warnings to stderr |
//! | [`CollectDiagnostics`] | Buffers messages for test assertions |

/// A single diagnostic message with optional source-line context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// Severity of the message.
    pub severity: Severity,
    /// Source line the message refers to, when known.
    pub line: Option<u32>,
    /// Human-readable message text.
    pub message: String,
}

/// Diagnostic severity. Warnings never halt compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Severity {
    #[strum(serialize = "warning")]
    Warning,
    #[strum(serialize = "note")]
    Note,
}

/// Sink for compiler warnings and notes.
///
/// The walker and the instruction queries report non-fatal findings here:
/// use of a deprecated function, an assertion provably failing at runtime,
/// and similar. Implementations decide whether to print, buffer, or drop.
pub trait Diagnostics {
    /// Reports a warning, optionally attached to a source line.
    fn warn(&mut self, line: Option<u32>, message: String);

    /// Reports an informational note, optionally attached to a source line.
    fn note(&mut self, line: Option<u32>, message: String);
}

/// Zero-cost sink that drops every message.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDiagnostics;

impl Diagnostics for NoDiagnostics {
    fn warn(&mut self, _line: Option<u32>, _message: String) {}

    fn note(&mut self, _line: Option<u32>, _message: String) {}
}

/// Sink that prints each message to stderr as it arrives.
#[derive(Debug, Clone, Copy, Default)]
pub struct StderrDiagnostics;

impl Diagnostics for StderrDiagnostics {
    fn warn(&mut self, line: Option<u32>, message: String) {
        match line {
            Some(line) => eprintln!("warning (line {line}): {message}"),
            None => eprintln!("warning: {message}"),
        }
    }

    fn note(&mut self, line: Option<u32>, message: String) {
        match line {
            Some(line) => eprintln!("note (line {line}): {message}"),
            None => eprintln!("note: {message}"),
        }
    }
}

/// Sink that buffers every message for later inspection.
///
/// Used by tests to assert that a lowering step emitted (or did not emit)
/// a particular warning.
#[derive(Debug, Clone, Default)]
pub struct CollectDiagnostics {
    messages: Vec<Diagnostic>,
}

impl CollectDiagnostics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All buffered messages in emission order.
    #[must_use]
    pub fn messages(&self) -> &[Diagnostic] {
        &self.messages
    }

    /// Buffered warnings only.
    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.messages.iter().filter(|d| d.severity == Severity::Warning)
    }

    /// True if any buffered warning contains `needle`.
    #[must_use]
    pub fn has_warning_containing(&self, needle: &str) -> bool {
        self.warnings().any(|d| d.message.contains(needle))
    }
}

impl Diagnostics for CollectDiagnostics {
    fn warn(&mut self, line: Option<u32>, message: String) {
        self.messages.push(Diagnostic {
            severity: Severity::Warning,
            line,
            message,
        });
    }

    fn note(&mut self, line: Option<u32>, message: String) {
        self.messages.push(Diagnostic {
            severity: Severity::Note,
            line,
            message,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_buffers_in_order() {
        let mut diag = CollectDiagnostics::new();
        diag.warn(Some(3), "assertion always fails".to_string());
        diag.note(None, "folded constant".to_string());

        assert_eq!(diag.messages().len(), 2);
        assert_eq!(diag.messages()[0].severity, Severity::Warning);
        assert_eq!(diag.messages()[0].line, Some(3));
        assert!(diag.has_warning_containing("always fails"));
        assert!(!diag.has_warning_containing("deprecated"));
    }
}

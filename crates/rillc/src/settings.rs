//! Compiler switches consumed by the middle end.

/// Optimizer and lowering switches.
///
/// Only the two switches the middle end consumes are modeled here; pass
/// pipeline configuration lives with the driver. Settings are threaded by
/// reference through the walker and the instruction queries, never stored
/// in process-global state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Settings {
    /// Elide assert-variant foreign calls during lowering.
    pub disable_asserts: bool,
    /// Enable algebraic computed-value inference for integer plus/minus.
    pub algebra: bool,
}

impl Settings {
    /// Settings with every switch off.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

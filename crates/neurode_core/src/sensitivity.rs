use serde::{Deserialize, Serialize};

/// Differentiation-strategy token forwarded to the solve backend.
///
/// The core never computes gradients itself. Each layer kind resolves one of
/// these tokens at construction time and passes it through every solve call;
/// the external differentiation subsystem interprets it. An explicit
/// [`crate::backend::SolveOptions::sensitivity`] override always wins over
/// the layer's resolved default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sensitivity {
    /// Leave the choice to the solver: differentiate through the discretized
    /// solver steps.
    SolverDefault,
    /// Continuous adjoint over an interpolated forward solution, with
    /// tape-compiled reverse-mode vector-Jacobian products.
    InterpolatingAdjoint,
    /// Reverse-mode differentiation through the literal sequence of
    /// operations the solver performed. The only strategy valid for
    /// stochastic and delay equations.
    ReverseModeTape,
}

use thiserror::Error;

/// Errors raised by layer construction and call-time contract checks.
///
/// Numerical failures (non-convergence, step-size collapse) are not listed
/// here; they originate in the solve backend and propagate as plain
/// `anyhow` errors, unchanged.
#[derive(Debug, Error)]
pub enum LayerError {
    /// A supplied flat parameter vector does not match the length fixed at
    /// construction. Detected at call time; vectors are never truncated or
    /// padded.
    #[error("parameter vector has length {got}, expected {expected}")]
    ParameterLength { expected: usize, got: usize },

    #[error("time span ({t0}, {t1}) is malformed; require finite t0 < t1")]
    TimeSpan { t0: f64, t1: f64 },

    #[error("mass matrix is {rows}x{cols}, expected {dim}x{dim}")]
    MassMatrixShape { rows: usize, cols: usize, dim: usize },

    /// The diffusion function's output cannot be reshaped to the declared
    /// `n_state x n_brownian` noise-rate matrix.
    #[error("diffusion output has length {got}, cannot reshape to {rows}x{cols}")]
    DiffusionShape { rows: usize, cols: usize, got: usize },

    #[error("function output has length {got}, expected {expected}")]
    OutputLength { expected: usize, got: usize },

    #[error("differential mask has length {mask}, state has dimension {state}")]
    MaskLength { mask: usize, state: usize },

    #[error("delay lags must be non-empty, finite and positive")]
    InvalidLags,

    #[error("brownian count must be positive")]
    BrownianCount,

    #[error("split offset {offset} exceeds parameter vector length {len}")]
    SplitOffset { offset: usize, len: usize },
}

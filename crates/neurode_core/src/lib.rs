//! The `neurode_core` crate composes learnable functions (neural networks
//! presented as flat parameter vectors) with differential-equation solves,
//! exposing each combination as an immutable, repeatedly-invokable layer.
//!
//! Key components:
//! - **Restructure**: parameter packing between structured networks and the
//!   flat vectors an external optimizer manipulates.
//! - **Layers**: one variant per equation family (ODE, diagonal/general
//!   SDE, constant-delay DDE, DAE with residual, singular-mass-matrix ODE),
//!   each resolving its differentiation strategy at construction.
//! - **Backend**: the narrow `solve(problem) -> trajectory` seam to the
//!   external solver subsystem, with a deterministic fixed-step reference
//!   implementation for tests and demos.

pub mod backend;
pub mod error;
pub mod layers;
pub mod mlp;
pub mod problem;
pub mod restructure;
pub mod sensitivity;

pub use backend::{NewtonSettings, ReferenceBackend, SolveBackend, SolveOptions, SolverChoice};
pub use error::LayerError;
pub use layers::{Layer, NeuralCdde, NeuralDae, NeuralDsde, NeuralOde, NeuralOdeMm, NeuralSde};
pub use problem::{Problem, Trajectory};
pub use restructure::{FlatFunction, Restructurable, StateFn};
pub use sensitivity::Sensitivity;

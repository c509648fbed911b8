//! Layer variants, one per equation family.
//!
//! A layer is an immutable configuration value: the learnable function(s),
//! a default flat parameter vector, a time span, a solver selection and the
//! solve options, with the differentiation strategy resolved once at
//! construction. Invoking a layer builds a fresh problem descriptor with
//! the supplied parameter vector bound in and hands it to the backend;
//! nothing is mutated and nothing leaks between calls, so a layer can be
//! invoked concurrently with different vectors.

pub mod dae;
pub mod dde;
pub mod mass_matrix;
pub mod ode;
pub mod sde;

pub use dae::NeuralDae;
pub use dde::NeuralCdde;
pub use mass_matrix::NeuralOdeMm;
pub use ode::NeuralOde;
pub use sde::{NeuralDsde, NeuralSde};

use anyhow::Result;
use nalgebra::DVector;

use crate::problem::Trajectory;

/// Common capability of every layer: solve the layer's problem from an
/// initial state.
///
/// `theta` defaults to the vector stored at construction when omitted.
/// "Updating parameters" means passing a new vector to `forward`, never
/// altering the layer.
pub trait Layer {
    fn forward(&self, u0: &DVector<f64>, theta: Option<&DVector<f64>>) -> Result<Trajectory>;

    /// The layer's default flat parameter vector.
    fn parameters(&self) -> &DVector<f64>;
}

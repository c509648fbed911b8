//! Minimal dense network used to drive the layers in tests and demos.
//!
//! Not a neural-network library: just enough of one to have a concrete
//! [`Restructurable`] implementation with a documented flat layout. Per
//! layer, weights come first in column-major order, then the bias.

use anyhow::Result;
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::error::LayerError;
use crate::restructure::{FlatFunction, Restructurable, StateFn};

/// Activation applied after a dense layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Identity,
    Tanh,
}

impl Activation {
    fn apply(self, x: f64) -> f64 {
        match self {
            Activation::Identity => x,
            Activation::Tanh => x.tanh(),
        }
    }
}

/// One dense layer: `activation(W u + b)`.
#[derive(Debug, Clone)]
pub struct Dense {
    weight: DMatrix<f64>,
    bias: DVector<f64>,
    activation: Activation,
}

impl Dense {
    pub fn new(weight: DMatrix<f64>, bias: DVector<f64>, activation: Activation) -> Result<Self> {
        if weight.nrows() != bias.len() {
            return Err(LayerError::OutputLength {
                expected: weight.nrows(),
                got: bias.len(),
            }
            .into());
        }
        Ok(Self {
            weight,
            bias,
            activation,
        })
    }

    /// Seeded normal init scaled by `1/sqrt(inputs)`, zero bias.
    pub fn random(inputs: usize, outputs: usize, activation: Activation, rng: &mut StdRng) -> Self {
        let scale = 1.0 / (inputs.max(1) as f64).sqrt();
        let weight = DMatrix::from_fn(outputs, inputs, |_, _| {
            let z: f64 = rng.sample(StandardNormal);
            z * scale
        });
        Self {
            weight,
            bias: DVector::zeros(outputs),
            activation,
        }
    }

    fn eval(&self, u: &DVector<f64>) -> DVector<f64> {
        (&self.weight * u + &self.bias).map(|x| self.activation.apply(x))
    }

    fn parameter_count(&self) -> usize {
        self.weight.len() + self.bias.len()
    }
}

/// A stack of dense layers.
#[derive(Debug, Clone)]
pub struct Mlp {
    layers: Vec<Dense>,
}

impl Mlp {
    pub fn new(layers: Vec<Dense>) -> Result<Self> {
        if layers.is_empty() {
            anyhow::bail!("an MLP needs at least one layer");
        }
        for pair in layers.windows(2) {
            if pair[1].weight.ncols() != pair[0].weight.nrows() {
                anyhow::bail!(
                    "layer output dimension {} does not feed layer input dimension {}",
                    pair[0].weight.nrows(),
                    pair[1].weight.ncols()
                );
            }
        }
        Ok(Self { layers })
    }

    /// Build from layer sizes, e.g. `[3, 50, 3]` for one hidden layer.
    /// Hidden layers use `hidden_activation`; the output layer is linear.
    pub fn random(sizes: &[usize], hidden_activation: Activation, seed: u64) -> Result<Self> {
        if sizes.len() < 2 {
            anyhow::bail!("need at least an input and an output size");
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let mut layers = Vec::with_capacity(sizes.len() - 1);
        for (i, pair) in sizes.windows(2).enumerate() {
            let activation = if i + 2 == sizes.len() {
                Activation::Identity
            } else {
                hidden_activation
            };
            layers.push(Dense::random(pair[0], pair[1], activation, &mut rng));
        }
        Self::new(layers)
    }

    pub fn input_dim(&self) -> usize {
        self.layers[0].weight.ncols()
    }

    pub fn output_dim(&self) -> usize {
        self.layers[self.layers.len() - 1].weight.nrows()
    }

    pub fn parameter_count(&self) -> usize {
        self.layers.iter().map(Dense::parameter_count).sum()
    }

    pub fn eval(&self, u: &DVector<f64>) -> DVector<f64> {
        let mut v = u.clone();
        for layer in &self.layers {
            v = layer.eval(&v);
        }
        v
    }

    /// Pre-flattened evaluation over the same layout [`Mlp::parameters`]
    /// produces, without constructing an intermediate network.
    pub fn eval_direct(&self, u: &DVector<f64>, theta: &DVector<f64>) -> Result<DVector<f64>> {
        let expected = self.parameter_count();
        if theta.len() != expected {
            return Err(LayerError::ParameterLength {
                expected,
                got: theta.len(),
            }
            .into());
        }
        let data = theta.as_slice();
        let mut offset = 0;
        let mut v = u.clone();
        for layer in &self.layers {
            let (rows, cols) = (layer.weight.nrows(), layer.weight.ncols());
            let w = DMatrix::from_column_slice(rows, cols, &data[offset..offset + rows * cols]);
            offset += rows * cols;
            let b = DVector::from_column_slice(&data[offset..offset + rows]);
            offset += rows;
            v = (w * v + b).map(|x| layer.activation.apply(x));
        }
        Ok(v)
    }

    /// Convert into the pre-flattened [`FlatFunction`] form.
    pub fn into_direct(self) -> FlatFunction {
        let theta = self.parameters();
        FlatFunction::from_direct(theta, move |u, p| self.eval_direct(u, p))
    }

    fn rebuild_from(&self, theta: &DVector<f64>) -> Result<Mlp> {
        let expected = self.parameter_count();
        if theta.len() != expected {
            return Err(LayerError::ParameterLength {
                expected,
                got: theta.len(),
            }
            .into());
        }
        let data = theta.as_slice();
        let mut offset = 0;
        let mut layers = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let (rows, cols) = (layer.weight.nrows(), layer.weight.ncols());
            let weight =
                DMatrix::from_column_slice(rows, cols, &data[offset..offset + rows * cols]);
            offset += rows * cols;
            let bias = DVector::from_column_slice(&data[offset..offset + rows]);
            offset += rows;
            layers.push(Dense {
                weight,
                bias,
                activation: layer.activation,
            });
        }
        Ok(Mlp { layers })
    }
}

impl Restructurable for Mlp {
    fn parameters(&self) -> DVector<f64> {
        let mut data = Vec::with_capacity(self.parameter_count());
        for layer in &self.layers {
            data.extend_from_slice(layer.weight.as_slice());
            data.extend_from_slice(layer.bias.as_slice());
        }
        DVector::from_vec(data)
    }

    fn restructure(&self, theta: &DVector<f64>) -> Result<Box<dyn StateFn>> {
        let net = self.rebuild_from(theta)?;
        Ok(Box::new(move |u: &DVector<f64>| net.eval(u)))
    }
}

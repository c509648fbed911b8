//! Parameter packing: structured learnable functions to flat vectors and back.
//!
//! An external optimizer sees every layer as one contiguous `DVector<f64>`.
//! This module provides the two representations a layer can hold:
//!
//! - *Structured*: the function owns nested weights. The flat vector is
//!   extracted once at construction and a pure rebuild closure reconstructs
//!   a fresh callable from any vector of the right length on every call.
//! - *Direct* (pre-flattened): the function already evaluates against a flat
//!   vector, skipping the rebuild step entirely.

use std::sync::Arc;

use anyhow::Result;
use nalgebra::DVector;

use crate::error::LayerError;

/// A concrete callable produced from one specific parameter vector.
pub trait StateFn {
    fn eval(&self, u: &DVector<f64>) -> DVector<f64>;
}

impl<F> StateFn for F
where
    F: Fn(&DVector<f64>) -> DVector<f64>,
{
    fn eval(&self, u: &DVector<f64>) -> DVector<f64> {
        self(u)
    }
}

/// A learnable function that owns a structured parameter set.
pub trait Restructurable {
    /// Flatten the current parameters into one contiguous vector. The layout
    /// this produces is the layout [`Restructurable::restructure`] expects.
    fn parameters(&self) -> DVector<f64>;

    /// Rebuild a callable from `theta`.
    ///
    /// Must be a pure function of `theta`: a fresh callable per call, no
    /// shared mutable state, so concurrent rebuilds with different vectors
    /// never interfere. Errors on a vector of the wrong length.
    fn restructure(&self, theta: &DVector<f64>) -> Result<Box<dyn StateFn>>;
}

type RebuildFn = dyn Fn(&DVector<f64>) -> Result<Box<dyn StateFn>> + Send + Sync;
type DirectFn = dyn Fn(&DVector<f64>, &DVector<f64>) -> Result<DVector<f64>> + Send + Sync;

/// Unified runtime representation of a learnable function, as stored by
/// layers. Cloning is cheap; the closures are shared immutably.
#[derive(Clone)]
pub enum FlatFunction {
    /// Rebuilds a fresh callable from the flat vector on every evaluation.
    Structured {
        theta: DVector<f64>,
        rebuild: Arc<RebuildFn>,
    },
    /// Evaluates `(state, flat_vector)` directly; no rebuild step.
    Direct {
        theta: DVector<f64>,
        eval: Arc<DirectFn>,
    },
}

impl FlatFunction {
    /// Wrap a structured function, extracting its flat vector once.
    pub fn from_structured<N>(net: N) -> Self
    where
        N: Restructurable + Send + Sync + 'static,
    {
        let theta = net.parameters();
        let rebuild: Arc<RebuildFn> = Arc::new(move |p| net.restructure(p));
        FlatFunction::Structured { theta, rebuild }
    }

    /// Wrap a pre-flattened function with its default parameter vector.
    pub fn from_direct<F>(theta: DVector<f64>, eval: F) -> Self
    where
        F: Fn(&DVector<f64>, &DVector<f64>) -> Result<DVector<f64>> + Send + Sync + 'static,
    {
        FlatFunction::Direct {
            theta,
            eval: Arc::new(eval),
        }
    }

    /// Length of the flat parameter vector, fixed at construction.
    pub fn parameter_count(&self) -> usize {
        self.default_parameters().len()
    }

    /// The vector captured at construction, used when a call supplies none.
    pub fn default_parameters(&self) -> &DVector<f64> {
        match self {
            FlatFunction::Structured { theta, .. } => theta,
            FlatFunction::Direct { theta, .. } => theta,
        }
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, FlatFunction::Direct { .. })
    }

    /// Check a candidate vector against the fixed parameter count.
    pub fn check_parameters(&self, theta: &DVector<f64>) -> Result<(), LayerError> {
        let expected = self.parameter_count();
        if theta.len() != expected {
            return Err(LayerError::ParameterLength {
                expected,
                got: theta.len(),
            });
        }
        Ok(())
    }

    /// Evaluate at `u` under `theta`.
    ///
    /// The length check happens here, at call time, because downstream
    /// optimizers may supply arbitrary vectors. The structured form rebuilds
    /// a fresh callable on every call; nothing is cached between calls.
    pub fn eval(&self, u: &DVector<f64>, theta: &DVector<f64>) -> Result<DVector<f64>> {
        self.check_parameters(theta)?;
        match self {
            FlatFunction::Structured { rebuild, .. } => Ok(rebuild(theta)?.eval(u)),
            FlatFunction::Direct { eval, .. } => eval(u, theta),
        }
    }
}

/// Concatenate two sub-function parameter vectors into the joint vector a
/// dual-function layer stores. Returns the joined vector and the split
/// offset (the first sub-function's parameter count).
pub fn concat_parameters(a: &DVector<f64>, b: &DVector<f64>) -> (DVector<f64>, usize) {
    let mut joined = DVector::zeros(a.len() + b.len());
    joined.rows_mut(0, a.len()).copy_from(a);
    joined.rows_mut(a.len(), b.len()).copy_from(b);
    (joined, a.len())
}

/// Split a joint vector back into its two halves at `offset`. Each half
/// feeds only its corresponding sub-function.
pub fn split_parameters(
    theta: &DVector<f64>,
    offset: usize,
) -> Result<(DVector<f64>, DVector<f64>), LayerError> {
    if offset > theta.len() {
        return Err(LayerError::SplitOffset {
            offset,
            len: theta.len(),
        });
    }
    let first = theta.rows(0, offset).into_owned();
    let second = theta.rows(offset, theta.len() - offset).into_owned();
    Ok((first, second))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mlp::{Activation, Mlp};
    use approx::assert_relative_eq;

    fn small_net() -> Mlp {
        Mlp::random(&[3, 8, 3], Activation::Tanh, 42).expect("net should build")
    }

    #[test]
    fn round_trip_matches_structured_network() {
        let net = small_net();
        let theta = net.parameters();
        let rebuilt = net.restructure(&theta).expect("rebuild should succeed");

        let u = DVector::from_vec(vec![0.3, -1.2, 0.7]);
        let direct = net.eval(&u);
        let via_flat = rebuilt.eval(&u);

        assert_relative_eq!(direct, via_flat, epsilon = 1e-14);
    }

    #[test]
    fn wrong_length_is_a_call_time_error() {
        let func = FlatFunction::from_structured(small_net());
        let u = DVector::from_vec(vec![0.0, 0.0, 0.0]);
        let short = DVector::zeros(func.parameter_count() - 1);

        let err = func.eval(&u, &short).expect_err("expected length error");
        assert!(format!("{err}").contains("parameter vector has length"));
    }

    #[test]
    fn interleaved_calls_do_not_interfere() {
        let func = FlatFunction::from_structured(small_net());
        let u = DVector::from_vec(vec![1.0, 0.5, -0.5]);

        let theta_a = func.default_parameters().clone();
        let theta_b = &theta_a * 2.0;

        let first = func.eval(&u, &theta_a).expect("eval a");
        let _ = func.eval(&u, &theta_b).expect("eval b");
        let third = func.eval(&u, &theta_a).expect("eval a again");

        assert_eq!(first, third);
    }

    #[test]
    fn direct_form_skips_rebuild_but_checks_length() {
        let theta = DVector::from_vec(vec![2.0]);
        let func = FlatFunction::from_direct(theta, |u, p| Ok(u * p[0]));
        assert!(func.is_direct());

        let u = DVector::from_vec(vec![1.0, -1.0]);
        let out = func
            .eval(&u, &DVector::from_vec(vec![3.0]))
            .expect("direct eval");
        assert_eq!(out, DVector::from_vec(vec![3.0, -3.0]));

        let err = func
            .eval(&u, &DVector::from_vec(vec![3.0, 4.0]))
            .expect_err("expected length error");
        assert!(format!("{err}").contains("expected 1"));
    }

    #[test]
    fn concat_then_split_returns_the_halves() {
        let a = DVector::from_vec(vec![1.0, 2.0, 3.0]);
        let b = DVector::from_vec(vec![4.0, 5.0]);

        let (joined, offset) = concat_parameters(&a, &b);
        assert_eq!(offset, 3);
        assert_eq!(joined.len(), 5);

        let (first, second) = split_parameters(&joined, offset).expect("split");
        assert_eq!(first, a);
        assert_eq!(second, b);
    }

    #[test]
    fn split_offset_out_of_range_errors() {
        let theta = DVector::from_vec(vec![1.0, 2.0]);
        let err = split_parameters(&theta, 3).expect_err("expected offset error");
        assert!(format!("{err}").contains("split offset"));
    }
}

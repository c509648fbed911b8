//! Problem descriptors handed to the solve backend, and the trajectory
//! representation every solve returns.
//!
//! A layer builds one of these per invocation with the parameter vector
//! already bound into the right-hand-side closures; the descriptors borrow
//! from the layer for the duration of the call.

use anyhow::Result;
use nalgebra::{DMatrix, DVector};

use crate::error::LayerError;

/// Right-hand side with parameters already bound: `du/dt = f(t, u)`.
pub type Rhs<'a> = Box<dyn Fn(f64, &DVector<f64>) -> Result<DVector<f64>> + 'a>;

/// DDE right-hand side: current state plus one delayed state per lag, in
/// lag order.
pub type DelayRhs<'a> =
    Box<dyn Fn(f64, &DVector<f64>, &[DVector<f64>]) -> Result<DVector<f64>> + 'a>;

/// DAE residual `F(t, u, du) = 0`.
pub type Residual<'a> = Box<dyn Fn(f64, &DVector<f64>, &DVector<f64>) -> Result<DVector<f64>> + 'a>;

/// History function supplying states for `t <= t0`.
pub type History<'a> = Box<dyn Fn(f64) -> DVector<f64> + 'a>;

/// Diffusion output expected as an `n_state x n_brownian` matrix.
pub type NoiseRate<'a> = Box<dyn Fn(f64, &DVector<f64>) -> Result<DMatrix<f64>> + 'a>;

pub struct OdeProblem<'a> {
    pub rhs: Rhs<'a>,
    pub u0: DVector<f64>,
    pub tspan: (f64, f64),
    /// `M` in `M du/dt = f(u, t)`; zero rows encode algebraic constraints.
    pub mass_matrix: Option<DMatrix<f64>>,
}

/// Noise structure of a stochastic problem.
pub enum Diffusion<'a> {
    /// Independent noise per state component; the closure returns the
    /// per-component coefficients.
    Diagonal(Rhs<'a>),
    /// Full noise-rate matrix driven by `brownian` independent processes.
    General { g: NoiseRate<'a>, brownian: usize },
}

pub struct SdeProblem<'a> {
    pub drift: Rhs<'a>,
    pub diffusion: Diffusion<'a>,
    pub u0: DVector<f64>,
    pub tspan: (f64, f64),
}

pub struct DdeProblem<'a> {
    pub rhs: DelayRhs<'a>,
    /// Constant delays, fixed at layer construction.
    pub lags: Vec<f64>,
    pub history: History<'a>,
    pub u0: DVector<f64>,
    pub tspan: (f64, f64),
}

pub struct DaeProblem<'a> {
    pub residual: Residual<'a>,
    pub u0: DVector<f64>,
    pub du0: DVector<f64>,
    pub tspan: (f64, f64),
}

/// The problem families the solve seam accepts.
pub enum Problem<'a> {
    Ode(OdeProblem<'a>),
    Sde(SdeProblem<'a>),
    Dde(DdeProblem<'a>),
    Dae(DaeProblem<'a>),
}

impl Problem<'_> {
    pub fn dimension(&self) -> usize {
        match self {
            Problem::Ode(p) => p.u0.len(),
            Problem::Sde(p) => p.u0.len(),
            Problem::Dde(p) => p.u0.len(),
            Problem::Dae(p) => p.u0.len(),
        }
    }

    pub fn tspan(&self) -> (f64, f64) {
        match self {
            Problem::Ode(p) => p.tspan,
            Problem::Sde(p) => p.tspan,
            Problem::Dde(p) => p.tspan,
            Problem::Dae(p) => p.tspan,
        }
    }
}

/// Validate a time span at construction time.
pub fn check_tspan(tspan: (f64, f64)) -> Result<(), LayerError> {
    let (t0, t1) = tspan;
    if !t0.is_finite() || !t1.is_finite() || t0 >= t1 {
        return Err(LayerError::TimeSpan { t0, t1 });
    }
    Ok(())
}

/// Time-ordered solution snapshots returned by a solve. Dense on the
/// integration grid, or at the caller's `saveat` times when given.
#[derive(Debug, Clone, PartialEq)]
pub struct Trajectory {
    pub times: Vec<f64>,
    pub states: Vec<DVector<f64>>,
}

impl Trajectory {
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn final_state(&self) -> Option<&DVector<f64>> {
        self.states.last()
    }

    /// State stored at exactly time `t`, if `t` is a sample point.
    pub fn state_at(&self, t: f64) -> Option<&DVector<f64>> {
        self.times
            .iter()
            .position(|&ti| (ti - t).abs() <= 1e-12)
            .map(|i| &self.states[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = (f64, &DVector<f64>)> {
        self.times.iter().copied().zip(self.states.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tspan_must_be_finite_and_increasing() {
        assert!(check_tspan((0.0, 1.0)).is_ok());
        assert!(check_tspan((1.0, 0.0)).is_err());
        assert!(check_tspan((0.0, 0.0)).is_err());
        assert!(check_tspan((0.0, f64::INFINITY)).is_err());
        assert!(check_tspan((f64::NAN, 1.0)).is_err());
    }

    #[test]
    fn trajectory_lookup_and_iteration() {
        let traj = Trajectory {
            times: vec![0.0, 0.5, 1.0],
            states: vec![
                DVector::from_vec(vec![1.0]),
                DVector::from_vec(vec![2.0]),
                DVector::from_vec(vec![3.0]),
            ],
        };

        assert_eq!(traj.len(), 3);
        assert_eq!(traj.final_state().map(|s| s[0]), Some(3.0));
        assert_eq!(traj.state_at(0.5).map(|s| s[0]), Some(2.0));
        assert!(traj.state_at(0.25).is_none());
        assert_eq!(traj.iter().count(), 3);
    }
}

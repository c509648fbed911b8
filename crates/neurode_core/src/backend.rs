//! The narrow seam to the external solver subsystem.
//!
//! Layers never integrate anything themselves; they build a
//! [`crate::problem::Problem`] and hand it to a [`SolveBackend`] together
//! with a solver selection, a differentiation-strategy token and the
//! call-time options. A deterministic fixed-step [`ReferenceBackend`] ships
//! with the crate so everything is exercisable end to end; production
//! integrators plug in through the same trait.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::problem::{Problem, Trajectory};
use crate::sensitivity::Sensitivity;

pub mod reference;

pub use reference::{NewtonSettings, ReferenceBackend};

/// Integrator selection forwarded to the backend. `Default` lets the
/// backend pick a family-appropriate method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolverChoice {
    Default,
    Rk4,
    Tsit5,
    EulerMaruyama,
    ImplicitEuler,
}

/// Call-time solver keywords, layered over a layer's construction-time
/// defaults. Explicitly set fields win over the layer's resolved defaults;
/// in particular `sensitivity` overrides the per-family strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolveOptions {
    /// Fixed step size used by the reference backend.
    pub dt: f64,
    /// Output sampling times; `None` returns every accepted step.
    pub saveat: Option<Vec<f64>>,
    pub reltol: f64,
    pub abstol: f64,
    /// Explicit differentiation-strategy override.
    pub sensitivity: Option<Sensitivity>,
    /// Sample count for ensemble solves of stochastic layers.
    pub trajectories: usize,
    /// Base RNG seed for stochastic solves; derived per sample in
    /// ensembles. Defaults to 0 when unset, keeping runs reproducible.
    pub seed: Option<u64>,
    /// Hard cap on accepted steps; exceeding it is a solve failure.
    pub max_steps: usize,
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self {
            dt: 0.01,
            saveat: None,
            reltol: 1e-6,
            abstol: 1e-9,
            sensitivity: None,
            trajectories: 1,
            seed: None,
            max_steps: 10_000_000,
        }
    }
}

/// "Solve this problem, get this trajectory."
///
/// The sensitivity token is forwarded for the backend's differentiation
/// machinery; backends without one (like the reference backend) accept and
/// ignore it. All failures propagate unrecovered: no retry, no fallback
/// solver, no tolerance relaxation.
pub trait SolveBackend {
    fn solve(
        &self,
        problem: Problem<'_>,
        solver: SolverChoice,
        sensitivity: Sensitivity,
        options: &SolveOptions,
    ) -> Result<Trajectory>;
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Records the sensitivity token of every solve it receives; the
    /// "trajectory" is just the initial state at both span endpoints.
    #[derive(Default)]
    pub struct RecordingBackend {
        pub seen: Mutex<Vec<Sensitivity>>,
    }

    impl SolveBackend for RecordingBackend {
        fn solve(
            &self,
            problem: Problem<'_>,
            _solver: SolverChoice,
            sensitivity: Sensitivity,
            _options: &SolveOptions,
        ) -> Result<Trajectory> {
            self.seen.lock().expect("seen lock").push(sensitivity);
            let (t0, t1) = problem.tspan();
            let u0 = match &problem {
                Problem::Ode(p) => p.u0.clone(),
                Problem::Sde(p) => p.u0.clone(),
                Problem::Dde(p) => p.u0.clone(),
                Problem::Dae(p) => p.u0.clone(),
            };
            Ok(Trajectory {
                times: vec![t0, t1],
                states: vec![u0.clone(), u0],
            })
        }
    }
}

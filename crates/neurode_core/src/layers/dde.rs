//! Constant-delay neural DDE: the network sees the current state and one
//! delayed state per lag, concatenated in lag order.

use std::sync::Arc;

use anyhow::Result;
use nalgebra::DVector;

use crate::backend::{SolveBackend, SolveOptions, SolverChoice};
use crate::error::LayerError;
use crate::problem::{check_tspan, DdeProblem, DelayRhs, History, Problem, Trajectory};
use crate::restructure::FlatFunction;
use crate::sensitivity::Sensitivity;

use super::Layer;

type HistoryFn = dyn Fn(f64) -> DVector<f64> + Send + Sync;

pub struct NeuralCdde<B> {
    func: FlatFunction,
    theta: DVector<f64>,
    lags: Vec<f64>,
    history: Arc<HistoryFn>,
    tspan: (f64, f64),
    solver: SolverChoice,
    options: SolveOptions,
    sensitivity: Sensitivity,
    backend: B,
}

impl<B> std::fmt::Debug for NeuralCdde<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NeuralCdde").finish_non_exhaustive()
    }
}

impl<B: SolveBackend> NeuralCdde<B> {
    /// `history` supplies states for `t <= t0`; it is an external
    /// collaborator, not part of the learnable parameters. The lag set is
    /// fixed here and reused by every call.
    pub fn new<H>(
        func: FlatFunction,
        tspan: (f64, f64),
        lags: Vec<f64>,
        history: H,
        backend: B,
    ) -> Result<Self>
    where
        H: Fn(f64) -> DVector<f64> + Send + Sync + 'static,
    {
        check_tspan(tspan)?;
        if lags.is_empty() || lags.iter().any(|l| !l.is_finite() || *l <= 0.0) {
            return Err(LayerError::InvalidLags.into());
        }
        let theta = func.default_parameters().clone();
        Ok(Self {
            func,
            theta,
            lags,
            history: Arc::new(history),
            tspan,
            solver: SolverChoice::Default,
            options: SolveOptions::default(),
            // Adjoint methods are not valid across delay terms.
            sensitivity: Sensitivity::ReverseModeTape,
            backend,
        })
    }

    pub fn with_solver(mut self, solver: SolverChoice) -> Self {
        self.solver = solver;
        self
    }

    pub fn with_options(mut self, options: SolveOptions) -> Self {
        self.options = options;
        self
    }

    pub fn lags(&self) -> &[f64] {
        &self.lags
    }

    pub fn sensitivity(&self) -> Sensitivity {
        self.sensitivity
    }

    pub fn forward_with(
        &self,
        u0: &DVector<f64>,
        theta: Option<&DVector<f64>>,
        options: &SolveOptions,
    ) -> Result<Trajectory> {
        let theta = theta.unwrap_or(&self.theta);
        self.func.check_parameters(theta)?;
        let rhs: DelayRhs<'_> = Box::new(move |_t, u, delayed| {
            let n = u.len();
            let mut input = DVector::zeros(n * (1 + delayed.len()));
            input.rows_mut(0, n).copy_from(u);
            for (i, d) in delayed.iter().enumerate() {
                if d.len() != n {
                    return Err(LayerError::OutputLength {
                        expected: n,
                        got: d.len(),
                    }
                    .into());
                }
                input.rows_mut((i + 1) * n, n).copy_from(d);
            }
            self.func.eval(&input, theta)
        });
        let history: History<'_> = Box::new(|t| (self.history)(t));
        let problem = Problem::Dde(DdeProblem {
            rhs,
            lags: self.lags.clone(),
            history,
            u0: u0.clone(),
            tspan: self.tspan,
        });
        let sensitivity = options.sensitivity.unwrap_or(self.sensitivity);
        self.backend.solve(problem, self.solver, sensitivity, options)
    }
}

impl<B: SolveBackend> Layer for NeuralCdde<B> {
    fn forward(&self, u0: &DVector<f64>, theta: Option<&DVector<f64>>) -> Result<Trajectory> {
        self.forward_with(u0, theta, &self.options)
    }

    fn parameters(&self) -> &DVector<f64> {
        &self.theta
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ReferenceBackend;
    use approx::assert_relative_eq;

    /// `f(u, u(t - lag)) = -u(t - lag)`: the net input is the state
    /// followed by the delayed state, so the second component drives.
    fn delayed_decay() -> FlatFunction {
        FlatFunction::from_direct(DVector::zeros(0), |input, _p| {
            Ok(DVector::from_vec(vec![-input[1]]))
        })
    }

    fn options(dt: f64) -> SolveOptions {
        SolveOptions {
            dt,
            ..SolveOptions::default()
        }
    }

    #[test]
    fn history_drives_the_early_dynamics() {
        // With unit history, u(t) = 1 - t until the delay runs out.
        let layer = NeuralCdde::new(
            delayed_decay(),
            (0.0, 1.0),
            vec![1.0],
            |_t| DVector::from_vec(vec![1.0]),
            ReferenceBackend::default(),
        )
        .expect("layer")
        .with_options(options(0.01));

        let u0 = DVector::from_vec(vec![1.0]);
        let traj = layer.forward(&u0, None).expect("solve");
        let mid = traj.state_at(0.5).expect("sample at 0.5");
        assert_relative_eq!(mid[0], 0.5, epsilon = 1e-9);
        let end = traj.final_state().expect("final state");
        assert_relative_eq!(end[0], 0.0, epsilon = 1e-9);
    }

    #[test]
    fn repeated_solves_are_identical() {
        let layer = NeuralCdde::new(
            delayed_decay(),
            (0.0, 2.0),
            vec![1.0],
            |_t| DVector::from_vec(vec![1.0]),
            ReferenceBackend::default(),
        )
        .expect("layer")
        .with_options(options(0.01));

        let u0 = DVector::from_vec(vec![1.0]);
        let a = layer.forward(&u0, None).expect("first");
        let b = layer.forward(&u0, None).expect("second");
        assert_eq!(a, b);
    }

    #[test]
    fn lag_set_must_be_positive_and_non_empty() {
        let err = NeuralCdde::new(
            delayed_decay(),
            (0.0, 1.0),
            vec![],
            |_t| DVector::from_vec(vec![1.0]),
            ReferenceBackend::default(),
        )
        .expect_err("expected lag error");
        assert!(format!("{err}").contains("lags"));

        let err = NeuralCdde::new(
            delayed_decay(),
            (0.0, 1.0),
            vec![-0.5],
            |_t| DVector::from_vec(vec![1.0]),
            ReferenceBackend::default(),
        )
        .expect_err("expected lag error");
        assert!(format!("{err}").contains("lags"));
    }
}

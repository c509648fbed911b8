//! Neural DAE with residual selection: component `j` of the residual comes
//! from the learnable function when `mask[j]` is set (a differential
//! equation `f_j(u, theta) - du_j = 0`) and from the constraint function
//! otherwise (an algebraic equation `g_j(u) = 0`), in state-component order.

use std::sync::Arc;

use anyhow::Result;
use nalgebra::DVector;

use crate::backend::{SolveBackend, SolveOptions, SolverChoice};
use crate::error::LayerError;
use crate::problem::{check_tspan, DaeProblem, Problem, Residual, Trajectory};
use crate::restructure::FlatFunction;
use crate::sensitivity::Sensitivity;

use super::Layer;

type ConstraintFn = dyn Fn(&DVector<f64>) -> DVector<f64> + Send + Sync;

pub struct NeuralDae<B> {
    func: FlatFunction,
    constraint: Arc<ConstraintFn>,
    theta: DVector<f64>,
    du0: DVector<f64>,
    mask: Vec<bool>,
    tspan: (f64, f64),
    solver: SolverChoice,
    options: SolveOptions,
    sensitivity: Sensitivity,
    backend: B,
}

impl<B> std::fmt::Debug for NeuralDae<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NeuralDae").finish_non_exhaustive()
    }
}

impl<B: SolveBackend> NeuralDae<B> {
    /// `mask` marks the differential components; it is fixed here and its
    /// length must equal the state dimension of every later call. `du0` is
    /// the consistent initial derivative the DAE solver starts from.
    pub fn new<C>(
        func: FlatFunction,
        constraint: C,
        du0: DVector<f64>,
        mask: Vec<bool>,
        tspan: (f64, f64),
        backend: B,
    ) -> Result<Self>
    where
        C: Fn(&DVector<f64>) -> DVector<f64> + Send + Sync + 'static,
    {
        check_tspan(tspan)?;
        if mask.len() != du0.len() {
            return Err(LayerError::MaskLength {
                mask: mask.len(),
                state: du0.len(),
            }
            .into());
        }
        let theta = func.default_parameters().clone();
        Ok(Self {
            func,
            constraint: Arc::new(constraint),
            theta,
            du0,
            mask,
            tspan,
            solver: SolverChoice::Default,
            options: SolveOptions::default(),
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

    pub fn differential_mask(&self) -> &[bool] {
        &self.mask
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
        let n = u0.len();
        if self.mask.len() != n {
            return Err(LayerError::MaskLength {
                mask: self.mask.len(),
                state: n,
            }
            .into());
        }
        let theta = theta.unwrap_or(&self.theta);
        self.func.check_parameters(theta)?;
        let residual: Residual<'_> = Box::new(move |_t, u, du| {
            let f = self.func.eval(u, theta)?;
            if f.len() != n {
                return Err(LayerError::OutputLength {
                    expected: n,
                    got: f.len(),
                }
                .into());
            }
            let g = (self.constraint)(u);
            if g.len() != n {
                return Err(LayerError::OutputLength {
                    expected: n,
                    got: g.len(),
                }
                .into());
            }
            let mut out = DVector::zeros(n);
            for j in 0..n {
                out[j] = if self.mask[j] { f[j] - du[j] } else { g[j] };
            }
            Ok(out)
        });
        let problem = Problem::Dae(DaeProblem {
            residual,
            u0: u0.clone(),
            du0: self.du0.clone(),
            tspan: self.tspan,
        });
        let sensitivity = options.sensitivity.unwrap_or(self.sensitivity);
        self.backend.solve(problem, self.solver, sensitivity, options)
    }
}

impl<B: SolveBackend> Layer for NeuralDae<B> {
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

    fn options(dt: f64) -> SolveOptions {
        SolveOptions {
            dt,
            ..SolveOptions::default()
        }
    }

    /// The function's third output is garbage on purpose; the mask must
    /// keep it out of the residual entirely.
    fn masked_layer() -> NeuralDae<ReferenceBackend> {
        let func = FlatFunction::from_direct(DVector::zeros(0), |u, _p| {
            Ok(DVector::from_vec(vec![-u[0], -u[1], 99.0]))
        });
        let constraint =
            |u: &DVector<f64>| DVector::from_vec(vec![0.0, 0.0, u[2] - (u[0] + u[1])]);
        NeuralDae::new(
            func,
            constraint,
            DVector::from_vec(vec![-1.0, -0.5, -1.5]),
            vec![true, true, false],
            (0.0, 1.0),
            ReferenceBackend::default(),
        )
        .expect("layer")
        .with_options(options(0.001))
    }

    #[test]
    fn masked_component_always_comes_from_the_constraint() {
        let layer = masked_layer();
        let u0 = DVector::from_vec(vec![1.0, 0.5, 1.5]);
        let traj = layer.forward(&u0, None).expect("solve");

        for (_, state) in traj.iter() {
            assert_relative_eq!(state[2], state[0] + state[1], epsilon = 1e-7);
        }
        let end = traj.final_state().expect("final state");
        assert_relative_eq!(end[0], (-1.0f64).exp(), epsilon = 2e-3);
        assert_relative_eq!(end[1], 0.5 * (-1.0f64).exp(), epsilon = 2e-3);
    }

    #[test]
    fn mask_length_must_match_the_state_dimension() {
        let layer = masked_layer();
        let u0 = DVector::from_vec(vec![1.0, 0.5]);
        let err = layer.forward(&u0, None).expect_err("expected mask error");
        assert!(format!("{err}").contains("differential mask"));
    }

    #[test]
    fn mask_and_du0_length_mismatch_is_a_construction_error() {
        let func = FlatFunction::from_direct(DVector::zeros(0), |u, _p| Ok(u.clone()));
        let err = NeuralDae::new(
            func,
            |u: &DVector<f64>| u.clone(),
            DVector::from_vec(vec![0.0, 0.0]),
            vec![true],
            (0.0, 1.0),
            ReferenceBackend::default(),
        )
        .expect_err("expected mask error");
        assert!(format!("{err}").contains("differential mask"));
    }
}

//! Neural ODE against a fixed (possibly singular) mass matrix: the
//! right-hand side is the learnable function's output stacked over the
//! constraint function's output, solved as `M du/dt = [f(u, theta); g(u)]`.
//! Zero rows of `M` turn the corresponding `g` rows into algebraic
//! constraints.

use std::sync::Arc;

use anyhow::Result;
use nalgebra::{DMatrix, DVector};

use crate::backend::{SolveBackend, SolveOptions, SolverChoice};
use crate::error::LayerError;
use crate::problem::{check_tspan, OdeProblem, Problem, Rhs, Trajectory};
use crate::restructure::FlatFunction;
use crate::sensitivity::Sensitivity;

use super::Layer;

type ConstraintFn = dyn Fn(&DVector<f64>) -> DVector<f64> + Send + Sync;

pub struct NeuralOdeMm<B> {
    func: FlatFunction,
    constraint: Arc<ConstraintFn>,
    theta: DVector<f64>,
    mass_matrix: DMatrix<f64>,
    tspan: (f64, f64),
    solver: SolverChoice,
    options: SolveOptions,
    sensitivity: Sensitivity,
    backend: B,
}

impl<B> std::fmt::Debug for NeuralOdeMm<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NeuralOdeMm").finish_non_exhaustive()
    }
}

impl<B: SolveBackend> NeuralOdeMm<B> {
    /// The strategy rule matches the plain ODE layer, and deliberately so
    /// for this dual-function variant too: interpolating adjoint for the
    /// pre-flattened form, solver default otherwise.
    pub fn new<C>(
        func: FlatFunction,
        constraint: C,
        mass_matrix: DMatrix<f64>,
        tspan: (f64, f64),
        backend: B,
    ) -> Result<Self>
    where
        C: Fn(&DVector<f64>) -> DVector<f64> + Send + Sync + 'static,
    {
        check_tspan(tspan)?;
        if !mass_matrix.is_square() {
            return Err(LayerError::MassMatrixShape {
                rows: mass_matrix.nrows(),
                cols: mass_matrix.ncols(),
                dim: mass_matrix.nrows(),
            }
            .into());
        }
        let sensitivity = if func.is_direct() {
            Sensitivity::InterpolatingAdjoint
        } else {
            Sensitivity::SolverDefault
        };
        let theta = func.default_parameters().clone();
        Ok(Self {
            func,
            constraint: Arc::new(constraint),
            theta,
            mass_matrix,
            tspan,
            solver: SolverChoice::Default,
            options: SolveOptions::default(),
            sensitivity,
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

    pub fn mass_matrix(&self) -> &DMatrix<f64> {
        &self.mass_matrix
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
        if self.mass_matrix.nrows() != n {
            return Err(LayerError::MassMatrixShape {
                rows: self.mass_matrix.nrows(),
                cols: self.mass_matrix.ncols(),
                dim: n,
            }
            .into());
        }
        let theta = theta.unwrap_or(&self.theta);
        self.func.check_parameters(theta)?;
        let rhs: Rhs<'_> = Box::new(move |_t, u| {
            let f = self.func.eval(u, theta)?;
            let g = (self.constraint)(u);
            if f.len() + g.len() != n {
                return Err(LayerError::OutputLength {
                    expected: n,
                    got: f.len() + g.len(),
                }
                .into());
            }
            let mut out = DVector::zeros(n);
            out.rows_mut(0, f.len()).copy_from(&f);
            out.rows_mut(f.len(), g.len()).copy_from(&g);
            Ok(out)
        });
        let problem = Problem::Ode(OdeProblem {
            rhs,
            u0: u0.clone(),
            tspan: self.tspan,
            mass_matrix: Some(self.mass_matrix.clone()),
        });
        let sensitivity = options.sensitivity.unwrap_or(self.sensitivity);
        self.backend.solve(problem, self.solver, sensitivity, options)
    }
}

impl<B: SolveBackend> Layer for NeuralOdeMm<B> {
    fn forward(&self, u0: &DVector<f64>, theta: Option<&DVector<f64>>) -> Result<Trajectory> {
        self.forward_with(u0, theta, &self.options)
    }

    fn parameters(&self) -> &DVector<f64> {
        &self.theta
    }
}

//! Plain neural ODE: `du/dt = f(u, theta)`.

use anyhow::Result;
use nalgebra::DVector;

use crate::backend::{SolveBackend, SolveOptions, SolverChoice};
use crate::problem::{check_tspan, OdeProblem, Problem, Rhs, Trajectory};
use crate::restructure::FlatFunction;
use crate::sensitivity::Sensitivity;

use super::Layer;

pub struct NeuralOde<B> {
    func: FlatFunction,
    theta: DVector<f64>,
    tspan: (f64, f64),
    solver: SolverChoice,
    options: SolveOptions,
    sensitivity: Sensitivity,
    backend: B,
}

impl<B> std::fmt::Debug for NeuralOde<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NeuralOde").finish_non_exhaustive()
    }
}

impl<B: SolveBackend> NeuralOde<B> {
    /// The pre-flattened form gets the interpolating adjoint (the fast
    /// common path); the structured form leaves the solver's own default.
    pub fn new(func: FlatFunction, tspan: (f64, f64), backend: B) -> Result<Self> {
        check_tspan(tspan)?;
        let sensitivity = if func.is_direct() {
            Sensitivity::InterpolatingAdjoint
        } else {
            Sensitivity::SolverDefault
        };
        let theta = func.default_parameters().clone();
        Ok(Self {
            func,
            theta,
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

    /// The strategy resolved at construction (before any call-time override).
    pub fn sensitivity(&self) -> Sensitivity {
        self.sensitivity
    }

    /// Solve with explicit call-time options layered over the stored ones.
    pub fn forward_with(
        &self,
        u0: &DVector<f64>,
        theta: Option<&DVector<f64>>,
        options: &SolveOptions,
    ) -> Result<Trajectory> {
        let theta = theta.unwrap_or(&self.theta);
        self.func.check_parameters(theta)?;
        let rhs: Rhs<'_> = Box::new(move |_t, u| self.func.eval(u, theta));
        let problem = Problem::Ode(OdeProblem {
            rhs,
            u0: u0.clone(),
            tspan: self.tspan,
            mass_matrix: None,
        });
        let sensitivity = options.sensitivity.unwrap_or(self.sensitivity);
        self.backend.solve(problem, self.solver, sensitivity, options)
    }
}

impl<B: SolveBackend> Layer for NeuralOde<B> {
    fn forward(&self, u0: &DVector<f64>, theta: Option<&DVector<f64>>) -> Result<Trajectory> {
        self.forward_with(u0, theta, &self.options)
    }

    fn parameters(&self) -> &DVector<f64> {
        &self.theta
    }
}

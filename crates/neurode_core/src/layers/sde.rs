//! Neural SDE layers: drift and diffusion networks over a joint parameter
//! vector `concat(theta_drift, theta_diffusion)`, split at a fixed offset.

use anyhow::Result;
use nalgebra::{DMatrix, DVector};

use crate::backend::{SolveBackend, SolveOptions, SolverChoice};
use crate::error::LayerError;
use crate::problem::{
    check_tspan, Diffusion, NoiseRate, Problem, Rhs, SdeProblem, Trajectory,
};
use crate::restructure::{concat_parameters, split_parameters, FlatFunction};
use crate::sensitivity::Sensitivity;

use super::Layer;

/// Diagonal-noise SDE: drift `f(u, theta1)`, diffusion `g(u, theta2)` with
/// one independent noise process per state component.
pub struct NeuralDsde<B> {
    drift: FlatFunction,
    diffusion: FlatFunction,
    theta: DVector<f64>,
    split: usize,
    tspan: (f64, f64),
    solver: SolverChoice,
    options: SolveOptions,
    sensitivity: Sensitivity,
    backend: B,
}

impl<B: SolveBackend> NeuralDsde<B> {
    pub fn new(
        drift: FlatFunction,
        diffusion: FlatFunction,
        tspan: (f64, f64),
        backend: B,
    ) -> Result<Self> {
        check_tspan(tspan)?;
        let (theta, split) =
            concat_parameters(drift.default_parameters(), diffusion.default_parameters());
        Ok(Self {
            drift,
            diffusion,
            theta,
            split,
            tspan,
            solver: SolverChoice::Default,
            options: SolveOptions::default(),
            // Adjoint methods are not valid for stochastic dynamics.
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

    /// Offset at which the joint vector splits into drift and diffusion
    /// halves; equals the drift function's parameter count.
    pub fn split_offset(&self) -> usize {
        self.split
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
        if theta.len() != self.theta.len() {
            return Err(LayerError::ParameterLength {
                expected: self.theta.len(),
                got: theta.len(),
            }
            .into());
        }
        let (theta_drift, theta_diff) = split_parameters(theta, self.split)?;
        let drift: Rhs<'_> = Box::new(move |_t, u| self.drift.eval(u, &theta_drift));
        let diffusion =
            Diffusion::Diagonal(Box::new(move |_t, u| self.diffusion.eval(u, &theta_diff)));
        let problem = Problem::Sde(SdeProblem {
            drift,
            diffusion,
            u0: u0.clone(),
            tspan: self.tspan,
        });
        let sensitivity = options.sensitivity.unwrap_or(self.sensitivity);
        self.backend.solve(problem, self.solver, sensitivity, options)
    }

    /// One trajectory per `SolveOptions::trajectories` sample, with seeds
    /// derived from the base seed.
    pub fn forward_ensemble(
        &self,
        u0: &DVector<f64>,
        theta: Option<&DVector<f64>>,
    ) -> Result<Vec<Trajectory>> {
        let base = self.options.seed.unwrap_or(0);
        (0..self.options.trajectories)
            .map(|i| {
                let mut options = self.options.clone();
                options.seed = Some(base.wrapping_add(i as u64));
                self.forward_with(u0, theta, &options)
            })
            .collect()
    }
}

impl<B: SolveBackend> Layer for NeuralDsde<B> {
    fn forward(&self, u0: &DVector<f64>, theta: Option<&DVector<f64>>) -> Result<Trajectory> {
        self.forward_with(u0, theta, &self.options)
    }

    fn parameters(&self) -> &DVector<f64> {
        &self.theta
    }
}

/// General-noise SDE: the diffusion output is reshaped to an
/// `n_state x n_brownian` noise-rate matrix (column-major); a length
/// mismatch is a shape error surfaced at solve time.
pub struct NeuralSde<B> {
    drift: FlatFunction,
    diffusion: FlatFunction,
    theta: DVector<f64>,
    split: usize,
    brownian: usize,
    tspan: (f64, f64),
    solver: SolverChoice,
    options: SolveOptions,
    sensitivity: Sensitivity,
    backend: B,
}

impl<B> std::fmt::Debug for NeuralSde<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NeuralSde").finish_non_exhaustive()
    }
}

impl<B: SolveBackend> NeuralSde<B> {
    pub fn new(
        drift: FlatFunction,
        diffusion: FlatFunction,
        brownian: usize,
        tspan: (f64, f64),
        backend: B,
    ) -> Result<Self> {
        check_tspan(tspan)?;
        if brownian == 0 {
            return Err(LayerError::BrownianCount.into());
        }
        let (theta, split) =
            concat_parameters(drift.default_parameters(), diffusion.default_parameters());
        Ok(Self {
            drift,
            diffusion,
            theta,
            split,
            brownian,
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

    pub fn split_offset(&self) -> usize {
        self.split
    }

    pub fn brownian_count(&self) -> usize {
        self.brownian
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
        if theta.len() != self.theta.len() {
            return Err(LayerError::ParameterLength {
                expected: self.theta.len(),
                got: theta.len(),
            }
            .into());
        }
        let (theta_drift, theta_diff) = split_parameters(theta, self.split)?;
        let brownian = self.brownian;
        let drift: Rhs<'_> = Box::new(move |_t, u| self.drift.eval(u, &theta_drift));
        let g: NoiseRate<'_> = Box::new(move |_t, u| {
            let out = self.diffusion.eval(u, &theta_diff)?;
            let n = u.len();
            if out.len() != n * brownian {
                return Err(LayerError::DiffusionShape {
                    rows: n,
                    cols: brownian,
                    got: out.len(),
                }
                .into());
            }
            Ok(DMatrix::from_column_slice(n, brownian, out.as_slice()))
        });
        let problem = Problem::Sde(SdeProblem {
            drift,
            diffusion: Diffusion::General { g, brownian },
            u0: u0.clone(),
            tspan: self.tspan,
        });
        let sensitivity = options.sensitivity.unwrap_or(self.sensitivity);
        self.backend.solve(problem, self.solver, sensitivity, options)
    }

    /// One trajectory per `SolveOptions::trajectories` sample, with seeds
    /// derived from the base seed.
    pub fn forward_ensemble(
        &self,
        u0: &DVector<f64>,
        theta: Option<&DVector<f64>>,
    ) -> Result<Vec<Trajectory>> {
        let base = self.options.seed.unwrap_or(0);
        (0..self.options.trajectories)
            .map(|i| {
                let mut options = self.options.clone();
                options.seed = Some(base.wrapping_add(i as u64));
                self.forward_with(u0, theta, &options)
            })
            .collect()
    }
}

impl<B: SolveBackend> Layer for NeuralSde<B> {
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

    /// Drift `-p[0] * u`, one parameter.
    fn linear_drift(rate: f64) -> FlatFunction {
        FlatFunction::from_direct(DVector::from_vec(vec![rate]), |u, p| Ok(u * -p[0]))
    }

    /// Constant diagonal diffusion `p[0]`, one parameter.
    fn constant_diffusion(level: f64) -> FlatFunction {
        FlatFunction::from_direct(DVector::from_vec(vec![level]), |u, p| {
            Ok(DVector::from_element(u.len(), p[0]))
        })
    }

    fn options(dt: f64) -> SolveOptions {
        SolveOptions {
            dt,
            ..SolveOptions::default()
        }
    }

    #[test]
    fn each_half_of_the_joint_vector_feeds_its_sub_function() {
        // Zero diffusion makes the decay rate observable: overriding the
        // first half must change it, overriding the second must not.
        let layer = NeuralDsde::new(
            linear_drift(2.0),
            constant_diffusion(0.0),
            (0.0, 1.0),
            ReferenceBackend::default(),
        )
        .expect("layer")
        .with_options(options(0.001));
        assert_eq!(layer.split_offset(), 1);

        let u0 = DVector::from_vec(vec![1.0]);
        let traj = layer
            .forward(&u0, Some(&DVector::from_vec(vec![3.0, 0.0])))
            .expect("solve");
        let end = traj.final_state().expect("final state");
        assert_relative_eq!(end[0], (-3.0f64).exp(), epsilon = 1e-3);
    }

    #[test]
    fn joint_vector_length_is_checked_as_a_whole() {
        let layer = NeuralDsde::new(
            linear_drift(1.0),
            constant_diffusion(0.1),
            (0.0, 1.0),
            ReferenceBackend::default(),
        )
        .expect("layer");

        let u0 = DVector::from_vec(vec![1.0]);
        let err = layer
            .forward(&u0, Some(&DVector::from_vec(vec![1.0])))
            .expect_err("expected length error");
        assert!(format!("{err}").contains("expected 2"));
    }

    #[test]
    fn stochastic_layers_use_reverse_mode_tape() {
        let dsde = NeuralDsde::new(
            linear_drift(1.0),
            constant_diffusion(0.1),
            (0.0, 1.0),
            ReferenceBackend::default(),
        )
        .expect("layer");
        assert_eq!(dsde.sensitivity(), Sensitivity::ReverseModeTape);

        let sde = NeuralSde::new(
            linear_drift(1.0),
            constant_diffusion(0.1),
            1,
            (0.0, 1.0),
            ReferenceBackend::default(),
        )
        .expect("layer");
        assert_eq!(sde.sensitivity(), Sensitivity::ReverseModeTape);
    }

    #[test]
    fn stochastic_override_reaches_the_backend() {
        use crate::backend::testing::RecordingBackend;

        let layer = NeuralDsde::new(
            linear_drift(1.0),
            constant_diffusion(0.1),
            (0.0, 1.0),
            RecordingBackend::default(),
        )
        .expect("layer");

        let u0 = DVector::from_vec(vec![1.0]);
        layer.forward(&u0, None).expect("default solve");

        let opts = SolveOptions {
            sensitivity: Some(Sensitivity::SolverDefault),
            ..SolveOptions::default()
        };
        layer.forward_with(&u0, None, &opts).expect("override solve");

        let seen = layer.backend.seen.lock().expect("seen lock");
        assert_eq!(
            *seen,
            vec![Sensitivity::ReverseModeTape, Sensitivity::SolverDefault]
        );
    }

    #[test]
    fn ensemble_returns_one_trajectory_per_sample() {
        let layer = NeuralDsde::new(
            linear_drift(1.0),
            constant_diffusion(0.3),
            (0.0, 0.5),
            ReferenceBackend::default(),
        )
        .expect("layer")
        .with_options(SolveOptions {
            dt: 0.01,
            trajectories: 3,
            ..SolveOptions::default()
        });

        let u0 = DVector::from_vec(vec![1.0]);
        let runs = layer.forward_ensemble(&u0, None).expect("ensemble");
        assert_eq!(runs.len(), 3);
        assert_ne!(runs[0], runs[1]);
        assert_ne!(runs[1], runs[2]);

        // Same base seed, same ensemble.
        let again = layer.forward_ensemble(&u0, None).expect("ensemble");
        assert_eq!(runs, again);
    }

    #[test]
    fn general_noise_layer_runs_with_matching_shape() {
        // 2 states driven by 1 brownian process: diffusion returns 2 values.
        let diffusion = FlatFunction::from_direct(DVector::from_vec(vec![0.2]), |u, p| {
            Ok(DVector::from_element(u.len(), p[0]))
        });
        let layer = NeuralSde::new(
            linear_drift(1.0),
            diffusion,
            1,
            (0.0, 0.5),
            ReferenceBackend::default(),
        )
        .expect("layer")
        .with_options(options(0.01));

        let u0 = DVector::from_vec(vec![1.0, 2.0]);
        let traj = layer.forward(&u0, None).expect("solve");
        assert_eq!(traj.final_state().map(DVector::len), Some(2));
    }

    #[test]
    fn diffusion_shape_mismatch_surfaces_at_solve_time() {
        // Declares 2 brownian processes but returns only n values.
        let diffusion = FlatFunction::from_direct(DVector::from_vec(vec![0.2]), |u, p| {
            Ok(DVector::from_element(u.len(), p[0]))
        });
        let layer = NeuralSde::new(
            linear_drift(1.0),
            diffusion,
            2,
            (0.0, 0.5),
            ReferenceBackend::default(),
        )
        .expect("layer")
        .with_options(options(0.01));

        let u0 = DVector::from_vec(vec![1.0, 2.0]);
        let err = layer.forward(&u0, None).expect_err("expected shape error");
        assert!(format!("{err}").contains("cannot reshape"));
    }

    #[test]
    fn zero_brownian_count_is_a_construction_error() {
        let err = NeuralSde::new(
            linear_drift(1.0),
            constant_diffusion(0.1),
            0,
            (0.0, 1.0),
            ReferenceBackend::default(),
        )
        .expect_err("expected brownian error");
        assert!(format!("{err}").contains("brownian"));
    }
}

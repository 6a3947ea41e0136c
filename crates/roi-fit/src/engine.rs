//! The seam to the external likelihood engine.
//!
//! The engine is opaque: [`Maximizer`] takes a [`FitProblem`] and an
//! [`Objective`] and returns a [`FitResult`]. Nothing here knows how the
//! likelihood is computed or maximized; this module only defines what goes in
//! and what comes out.

use roi_core::{OptimizerConfig, ParameterKey, Registry};
use serde::Serialize;

use crate::error::{EngineError, FitError};

/// Fit quality code of a fully converged fit with an accurate covariance.
pub const QUALITY_GOOD: u8 = 3;

/// Everything the engine needs to run one fit.
///
/// All vectors are aligned with `parameters`. Values and bounds are in
/// parameter units; multiply by `scales` for physical values.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FitProblem {
    /// Free parameters, in registry order.
    pub parameters: Vec<ParameterKey>,
    /// Starting values.
    pub initial: Vec<f64>,
    /// `(min, max)` bounds.
    pub bounds: Vec<(f64, f64)>,
    /// Parameter scales.
    pub scales: Vec<f64>,
    /// Restricts the likelihood to `(emin, emax)` MeV when set.
    pub energy_range: Option<(f64, f64)>,
    /// Maximizer name.
    pub optimizer: String,
    /// Convergence tolerance.
    pub tol: f64,
}

impl FitProblem {
    /// Collects the registry's free parameters into a problem.
    ///
    /// # Errors
    ///
    /// [`FitError::NoFreeParameters`] if nothing is free.
    pub fn from_registry(registry: &Registry, options: &FitOptions) -> Result<Self, FitError> {
        let problem = Self::collect(registry, options);
        if problem.is_empty() {
            return Err(FitError::NoFreeParameters);
        }
        Ok(problem)
    }

    /// Like [`from_registry`](Self::from_registry), but allows an empty
    /// problem.
    #[must_use]
    pub fn collect(registry: &Registry, options: &FitOptions) -> Self {
        let parameters = registry.free_parameters();
        let mut initial = Vec::with_capacity(parameters.len());
        let mut bounds = Vec::with_capacity(parameters.len());
        let mut scales = Vec::with_capacity(parameters.len());
        for par in parameters.iter().filter_map(|key| registry.parameter(key)) {
            initial.push(par.value);
            bounds.push((par.min, par.max));
            scales.push(par.scale);
        }
        Self {
            parameters,
            initial,
            bounds,
            scales,
            energy_range: options.energy_range,
            optimizer: options.optimizer.clone(),
            tol: options.tol,
        }
    }

    /// Number of free parameters.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    /// Returns `true` if there is nothing to fit.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Position of a parameter in the problem's vectors.
    #[must_use]
    pub fn index_of(&self, key: &ParameterKey) -> Option<usize> {
        self.parameters.iter().position(|k| k == key)
    }

    /// Copy of the problem starting from `values`, clamped to the bounds.
    ///
    /// Inverted bounds clamp to `max` rather than panicking.
    #[must_use]
    pub fn restarted_from(&self, values: &[f64]) -> Self {
        let initial = values
            .iter()
            .zip(&self.bounds)
            .map(|(&v, &(min, max))| v.max(min).min(max))
            .collect();
        Self {
            initial,
            ..self.clone()
        }
    }
}

/// Output of one engine run.
///
/// `values` and `errors` are aligned with the problem's parameters and in
/// parameter units. `covariance` is row-major `n x n`, or empty if the engine
/// did not compute one. `errors` may be empty, in which case they are taken
/// from the covariance diagonal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FitResult {
    /// Whether the engine reports convergence.
    pub converged: bool,
    /// Engine diagnostic code (`0` on success).
    pub status: i32,
    /// Fit quality code, `0` (no covariance) to [`QUALITY_GOOD`].
    pub quality: u8,
    /// Log-likelihood at the best fit.
    pub log_likelihood: f64,
    /// Best-fit values.
    pub values: Vec<f64>,
    /// One-sigma errors.
    pub errors: Vec<f64>,
    /// Covariance matrix, row-major.
    pub covariance: Vec<f64>,
    /// Predicted counts per source, by canonical name.
    pub npred: Vec<(String, f64)>,
}

/// The likelihood function, evaluated by the engine.
pub trait Objective {
    /// Log-likelihood at `values` (aligned with `problem.parameters`, in
    /// parameter units).
    fn log_likelihood(&self, problem: &FitProblem, values: &[f64]) -> Result<f64, EngineError>;
}

impl<F> Objective for F
where
    F: Fn(&FitProblem, &[f64]) -> Result<f64, EngineError>,
{
    fn log_likelihood(&self, problem: &FitProblem, values: &[f64]) -> Result<f64, EngineError> {
        self(problem, values)
    }
}

/// The external maximum-likelihood engine.
///
/// Implementations may block for a long time; no timeout is imposed by the
/// caller.
pub trait Maximizer {
    /// Maximizes `objective` over the problem's free parameters.
    fn maximize(
        &self,
        problem: &FitProblem,
        objective: &dyn Objective,
    ) -> Result<FitResult, EngineError>;
}

/// Settings of one fit invocation.
///
/// # Examples
///
/// ```
/// use roi_core::OptimizerConfig;
/// use roi_fit::FitOptions;
///
/// let options = FitOptions::from_config(&OptimizerConfig::default()).with_energy_range(1e3, 1e4);
/// assert_eq!(options.retries, 3);
/// assert_eq!(options.energy_range, Some((1e3, 1e4)));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct FitOptions {
    /// Maximizer name.
    pub optimizer: String,
    /// Convergence tolerance.
    pub tol: f64,
    /// Maximum engine runs while the quality is below [`QUALITY_GOOD`].
    pub retries: u32,
    /// Minimum quality for a commit.
    pub min_fit_quality: u8,
    /// Energy range restriction.
    pub energy_range: Option<(f64, f64)>,
}

impl FitOptions {
    /// Builds options from the optimizer configuration.
    #[must_use]
    pub fn from_config(config: &OptimizerConfig) -> Self {
        Self {
            optimizer: config.optimizer.clone(),
            tol: config.tol,
            retries: config.retries.max(1),
            min_fit_quality: config.min_fit_quality,
            energy_range: None,
        }
    }

    /// Restricts the fit to `[emin, emax]` MeV.
    #[must_use]
    pub fn with_energy_range(mut self, emin: f64, emax: f64) -> Self {
        self.energy_range = Some((emin, emax));
        self
    }
}

impl Default for FitOptions {
    fn default() -> Self {
        Self::from_config(&OptimizerConfig::default())
    }
}

//! Fit orchestration.
//!
//! Each [`Fitter::fit`] call walks one invocation through
//! `IDLE -> PREPARING -> RUNNING -> {CONVERGED, FAILED}`:
//!
//! 1. **Preparing**: collect the free parameters under a read lock. An empty
//!    free set fails with [`FitError::NoFreeParameters`].
//! 2. **Running**: call the engine with no lock held. While the engine
//!    converges with a quality below [`QUALITY_GOOD`] it is re-run from its
//!    own best-fit values, up to `retries` runs in total. Engine errors and
//!    non-convergence end the invocation immediately.
//! 3. **Converged**: the result is validated as a whole (vector lengths,
//!    covariance shape, finite values, unchanged free set) and only then
//!    written back in one step under the write lock.
//!
//! Any failure leaves the registry exactly as it was.

use roi_core::{ParameterKey, Registry, fx_hash_set_with_capacity};
use tracing::{debug, info, warn};

use crate::engine::{FitOptions, FitProblem, FitResult, Maximizer, Objective, QUALITY_GOOD};
use crate::error::FitError;
use crate::handle::{FitPhase, PhaseGuard, RegistryHandle};

/// A committed fit.
#[derive(Debug, Clone, PartialEq)]
pub struct FitSummary {
    /// The problem that was fitted.
    pub problem: FitProblem,
    /// The engine result of the final run.
    pub result: FitResult,
    /// Number of engine runs.
    pub attempts: u32,
}

impl FitSummary {
    /// Best-fit value (parameter units) of a fitted parameter.
    #[must_use]
    pub fn value(&self, key: &ParameterKey) -> Option<f64> {
        self.problem.index_of(key).and_then(|i| self.result.values.get(i).copied())
    }
}

/// Runs fits of one objective with one engine.
pub struct Fitter<'a> {
    maximizer: &'a dyn Maximizer,
    objective: &'a dyn Objective,
    options: FitOptions,
}

impl std::fmt::Debug for Fitter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fitter").field("options", &self.options).finish_non_exhaustive()
    }
}

impl<'a> Fitter<'a> {
    /// Creates a fitter.
    #[must_use]
    pub fn new(
        maximizer: &'a dyn Maximizer,
        objective: &'a dyn Objective,
        options: FitOptions,
    ) -> Self {
        Self {
            maximizer,
            objective,
            options,
        }
    }

    /// Fit settings.
    #[inline]
    #[must_use]
    pub fn options(&self) -> &FitOptions {
        &self.options
    }

    /// The objective being maximized.
    #[inline]
    #[must_use]
    pub fn objective(&self) -> &'a dyn Objective {
        self.objective
    }

    /// Returns a fitter with the same engine and objective and other options.
    #[must_use]
    pub fn with_options(&self, options: FitOptions) -> Self {
        Self::new(self.maximizer, self.objective, options)
    }

    /// Fits the registry's free parameters and commits the result.
    ///
    /// # Errors
    ///
    /// - [`FitError::ConcurrentFit`] if a fit is already in flight on `handle`
    /// - [`FitError::NoFreeParameters`] if nothing is free
    /// - [`FitError::Failure`] on engine errors, non-convergence or a fit
    ///   quality below `min_fit_quality`
    /// - [`FitError::Commit`] if the result cannot be applied consistently
    pub fn fit(&self, handle: &RegistryHandle) -> Result<FitSummary, FitError> {
        let guard = handle.begin()?;
        let outcome = self.run(handle, &guard);
        match &outcome {
            Ok(summary) => {
                info!(
                    log_likelihood = summary.result.log_likelihood,
                    quality = summary.result.quality,
                    attempts = summary.attempts,
                    parameters = summary.problem.len(),
                    "fit converged"
                );
                guard.finish(FitPhase::Converged);
            }
            Err(error) => {
                warn!(%error, "fit failed");
                guard.finish(FitPhase::Failed);
            }
        }
        outcome
    }

    fn run(&self, handle: &RegistryHandle, guard: &PhaseGuard<'_>) -> Result<FitSummary, FitError> {
        let problem = FitProblem::from_registry(&handle.read(), &self.options)?;

        guard.set(FitPhase::Running);
        info!(parameters = problem.len(), optimizer = %problem.optimizer, "starting fit");
        let (result, attempts) =
            run_engine(self.maximizer, self.objective, &problem, &self.options)?;
        check_convergence(&result, &self.options)?;

        let mut registry = handle.write();
        let plan = CommitPlan::validate(&registry, &problem, &result)?;
        plan.apply(&mut registry);

        Ok(FitSummary {
            problem,
            result,
            attempts,
        })
    }
}

/// Runs the engine, re-running while it converges with a low quality.
pub(crate) fn run_engine(
    maximizer: &dyn Maximizer,
    objective: &dyn Objective,
    problem: &FitProblem,
    options: &FitOptions,
) -> Result<(FitResult, u32), FitError> {
    let retries = options.retries.max(1);
    let mut attempts = 0;
    let mut current = None;
    loop {
        attempts += 1;
        let input = current.as_ref().unwrap_or(problem);
        let result = maximizer.maximize(input, objective)?;

        let done = !result.converged
            || result.quality >= QUALITY_GOOD
            || attempts >= retries
            || result.values.len() != problem.len();
        if done {
            return Ok((result, attempts));
        }
        debug!(attempt = attempts, quality = result.quality, "fit quality low, retrying");
        current = Some(problem.restarted_from(&result.values));
    }
}

/// Checks the convergence flag and quality threshold.
pub(crate) fn check_convergence(result: &FitResult, options: &FitOptions) -> Result<(), FitError> {
    if !result.converged {
        return Err(FitError::failure(result.status, "engine did not converge"));
    }
    if result.quality < options.min_fit_quality {
        return Err(FitError::failure(
            i32::from(result.quality),
            format!(
                "fit quality {} below required {}",
                result.quality, options.min_fit_quality
            ),
        ));
    }
    Ok(())
}

/// A validated set of updates for one registry.
#[derive(Debug)]
pub(crate) struct CommitPlan {
    updates: Vec<(ParameterKey, f64, Option<f64>)>,
    npred: Vec<(String, f64)>,
    log_likelihood: f64,
    quality: u8,
}

impl CommitPlan {
    /// Checks `result` against `problem` and the registry's current state.
    pub(crate) fn validate(
        registry: &Registry,
        problem: &FitProblem,
        result: &FitResult,
    ) -> Result<Self, FitError> {
        let n = problem.len();
        if result.values.len() != n {
            return Err(FitError::commit(format!(
                "engine returned {} values for {n} free parameters",
                result.values.len()
            )));
        }
        if !result.errors.is_empty() && result.errors.len() != n {
            return Err(FitError::commit(format!(
                "engine returned {} errors for {n} free parameters",
                result.errors.len()
            )));
        }
        if !result.covariance.is_empty() && result.covariance.len() != n * n {
            return Err(FitError::commit(format!(
                "covariance has {} entries, expected {n}x{n}",
                result.covariance.len()
            )));
        }
        if !result.log_likelihood.is_finite() {
            return Err(FitError::commit("log-likelihood is not finite"));
        }
        if registry.free_parameters() != problem.parameters {
            return Err(FitError::commit("free parameters changed while the engine was running"));
        }

        let mut updates = Vec::with_capacity(n);
        for (i, key) in problem.parameters.iter().enumerate() {
            let value = result.values[i];
            if !value.is_finite() {
                return Err(FitError::commit(format!("best-fit value of {key} is not finite")));
            }
            let error = if result.errors.is_empty() {
                result.covariance.get(i * n + i).map(|var| var.sqrt())
            } else {
                Some(result.errors[i])
            };
            let error = error.filter(|e| e.is_finite());
            updates.push((key.clone(), value, error));
        }

        let mut reported = fx_hash_set_with_capacity(result.npred.len());
        for (name, npred) in &result.npred {
            if !reported.insert(name.as_str()) {
                return Err(FitError::commit(format!(
                    "predicted counts for '{name}' reported twice"
                )));
            }
            if registry.get(name).is_none() {
                return Err(FitError::commit(format!(
                    "predicted counts for unknown source '{name}'"
                )));
            }
            if !npred.is_finite() {
                return Err(FitError::commit(format!(
                    "predicted counts of '{name}' are not finite"
                )));
            }
        }

        Ok(Self {
            updates,
            npred: result.npred.clone(),
            log_likelihood: result.log_likelihood,
            quality: result.quality,
        })
    }

    /// Applies the plan. Every key was checked by [`validate`](Self::validate)
    /// under the same lock.
    pub(crate) fn apply(self, registry: &mut Registry) {
        for (key, value, error) in &self.updates {
            if let Some(par) = registry.parameter_mut(key) {
                par.value = *value;
                par.error = *error;
            }
        }
        for (name, npred) in self.npred {
            if let Some(source) = registry.get_mut(&name) {
                source.npred = Some(npred);
            }
        }
        registry.log_likelihood = Some(self.log_likelihood);
        registry.fit_quality = Some(self.quality);
        debug!(updates = self.updates.len(), "committed fit result");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::cell::{Cell, RefCell};

    use super::*;
    use crate::error::EngineError;
    use crate::selector::{ParameterControl, ParameterSelector};
    use roi_core::{DiffuseModels, GALDIFF, ISODIFF, SkyDir, Source, SpectralModel, SpectrumType};

    /// Objective peaking at every parameter equal to 2.
    pub(crate) fn quadratic(_: &FitProblem, values: &[f64]) -> Result<f64, EngineError> {
        Ok(-values.iter().map(|v| (v - 2.0).powi(2)).sum::<f64>())
    }

    /// Engine returning scripted results in order; the last one repeats.
    pub(crate) struct Scripted {
        pub(crate) results: RefCell<Vec<Result<FitResult, EngineError>>>,
        pub(crate) calls: Cell<u32>,
        pub(crate) seen: RefCell<Vec<FitProblem>>,
    }

    impl Scripted {
        pub(crate) fn new(results: Vec<Result<FitResult, EngineError>>) -> Self {
            Self {
                results: RefCell::new(results),
                calls: Cell::new(0),
                seen: RefCell::new(Vec::new()),
            }
        }
    }

    impl Maximizer for Scripted {
        fn maximize(
            &self,
            problem: &FitProblem,
            _: &dyn Objective,
        ) -> Result<FitResult, EngineError> {
            self.calls.set(self.calls.get() + 1);
            self.seen.borrow_mut().push(problem.clone());
            let mut results = self.results.borrow_mut();
            if results.len() > 1 {
                results.remove(0)
            } else {
                results[0].clone()
            }
        }
    }

    pub(crate) fn converged(values: Vec<f64>, quality: u8) -> FitResult {
        let n = values.len();
        FitResult {
            converged: true,
            status: 0,
            quality,
            log_likelihood: -42.0,
            errors: vec![0.1; n],
            covariance: Vec::new(),
            values,
            npred: Vec::new(),
        }
    }

    pub(crate) fn handle() -> RegistryHandle {
        let mut registry = Registry::new(SkyDir::new(166.1, 38.2), DiffuseModels::default());
        registry
            .register(
                Source::point(
                    "mkn421",
                    SkyDir::new(166.1, 38.2),
                    SpectralModel::new(SpectrumType::LogParabola),
                )
                .with_alias("Mkn 421"),
            )
            .unwrap();
        RegistryHandle::new(registry)
    }

    fn values(handle: &RegistryHandle) -> Vec<(f64, Option<f64>, bool)> {
        handle
            .read()
            .iter()
            .flat_map(|s| s.parameters().iter().map(|p| (p.value, p.error, p.free)))
            .collect()
    }

    #[test]
    fn test_no_free_parameters() {
        let handle = handle();
        let engine = Scripted::new(vec![Ok(converged(vec![], 3))]);
        let fitter = Fitter::new(&engine, &quadratic, FitOptions::default());
        assert_eq!(fitter.fit(&handle).unwrap_err(), FitError::NoFreeParameters);
        assert_eq!(engine.calls.get(), 0);
        assert_eq!(handle.phase(), FitPhase::Failed);
    }

    #[test]
    fn test_converged_fit_commits_values_and_aggregates() {
        let handle = handle();
        handle.write().free_norm("mkn421", true).unwrap();
        handle.write().free_norm(ISODIFF, true).unwrap();

        let mut result = converged(vec![1.5, 0.9], 3);
        result.npred = vec![("mkn421".to_owned(), 250.0)];
        let engine = Scripted::new(vec![Ok(result)]);
        let fitter = Fitter::new(&engine, &quadratic, FitOptions::default());

        let summary = fitter.fit(&handle).unwrap();
        assert_eq!(summary.attempts, 1);
        assert_eq!(summary.value(&ParameterKey::new("mkn421", "norm")), Some(0.9));

        let registry = handle.read();
        let isodiff = registry.get(ISODIFF).unwrap().spectrum.parameter("Normalization").unwrap();
        assert_eq!((isodiff.value, isodiff.error), (1.5, Some(0.1)));
        let mkn421 = registry.get("mkn421").unwrap();
        assert_eq!(mkn421.spectrum.parameter("norm").unwrap().value, 0.9);
        assert_eq!(mkn421.npred, Some(250.0));
        assert_eq!(registry.log_likelihood, Some(-42.0));
        assert_eq!(registry.fit_quality, Some(3));
        drop(registry);
        assert_eq!(handle.phase(), FitPhase::Converged);
    }

    #[test]
    fn test_wrong_length_leaves_registry_untouched() {
        let handle = handle();
        handle.write().free_norm("mkn421", true).unwrap();
        handle.write().free_norm(GALDIFF, true).unwrap();
        let before = values(&handle);

        let engine = Scripted::new(vec![Ok(converged(vec![5.0, 5.0, 5.0], 3))]);
        let fitter = Fitter::new(&engine, &quadratic, FitOptions::default());
        let err = fitter.fit(&handle).unwrap_err();

        assert!(err.is_commit(), "{err}");
        assert_eq!(values(&handle), before);
        assert_eq!(handle.read().log_likelihood, None);
        assert_eq!(handle.phase(), FitPhase::Failed);
    }

    #[test]
    fn test_bad_covariance_shape_rejected() {
        let handle = handle();
        handle.write().free_norm("mkn421", true).unwrap();
        let mut result = converged(vec![1.0], 3);
        result.covariance = vec![0.1, 0.0];
        let engine = Scripted::new(vec![Ok(result)]);
        let err = Fitter::new(&engine, &quadratic, FitOptions::default()).fit(&handle).unwrap_err();
        assert!(err.to_string().contains("covariance"));
    }

    #[test]
    fn test_non_finite_value_rejected() {
        let handle = handle();
        handle.write().free_norm("mkn421", true).unwrap();
        let before = values(&handle);
        let engine = Scripted::new(vec![Ok(converged(vec![f64::NAN], 3))]);
        let err = Fitter::new(&engine, &quadratic, FitOptions::default()).fit(&handle).unwrap_err();
        assert!(err.to_string().contains("mkn421.norm"));
        assert_eq!(values(&handle), before);
    }

    #[test]
    fn test_duplicate_npred_rejected() {
        let handle = handle();
        handle.write().free_norm("mkn421", true).unwrap();
        let mut result = converged(vec![1.0], 3);
        result.npred = vec![("mkn421".to_owned(), 5.0), ("mkn421".to_owned(), 6.0)];
        let engine = Scripted::new(vec![Ok(result)]);
        let err = Fitter::new(&engine, &quadratic, FitOptions::default()).fit(&handle).unwrap_err();
        insta::assert_snapshot!(
            err.to_string(),
            @"cannot commit fit result: predicted counts for 'mkn421' reported twice"
        );
        assert_eq!(handle.read().get("mkn421").unwrap().npred, None);
    }

    #[test]
    fn test_errors_from_covariance_diagonal() {
        let handle = handle();
        handle.write().free_norm("mkn421", true).unwrap();
        let mut result = converged(vec![1.2], 3);
        result.errors.clear();
        result.covariance = vec![0.04];
        let engine = Scripted::new(vec![Ok(result)]);
        Fitter::new(&engine, &quadratic, FitOptions::default()).fit(&handle).unwrap();
        let error = handle.read().get("mkn421").unwrap().spectrum.parameter("norm").unwrap().error;
        assert!((error.unwrap() - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_non_convergence_is_failure_and_not_retried() {
        let handle = handle();
        handle.write().free_norm("mkn421", true).unwrap();
        let before = values(&handle);
        let mut result = converged(vec![3.0], 0);
        result.converged = false;
        result.status = 4;
        let engine = Scripted::new(vec![Ok(result)]);
        let err = Fitter::new(&engine, &quadratic, FitOptions::default()).fit(&handle).unwrap_err();

        assert_eq!(err.code(), 4);
        assert_eq!(engine.calls.get(), 1);
        assert_eq!(values(&handle), before);
    }

    #[test]
    fn test_engine_error_is_failure() {
        let handle = handle();
        handle.write().free_norm("mkn421", true).unwrap();
        let engine = Scripted::new(vec![Err(EngineError::new(-2, "objective raised"))]);
        let err = Fitter::new(&engine, &quadratic, FitOptions::default()).fit(&handle).unwrap_err();
        assert_eq!(err, FitError::failure(-2, "objective raised"));
        assert_eq!(engine.calls.get(), 1);
    }

    #[test]
    fn test_low_quality_retries_from_returned_values() {
        let handle = handle();
        handle.write().free_norm("mkn421", true).unwrap();
        let engine = Scripted::new(vec![
            Ok(converged(vec![1.5], 1)),
            Ok(converged(vec![1.9], 2)),
            Ok(converged(vec![2.0], 3)),
        ]);
        let summary = Fitter::new(&engine, &quadratic, FitOptions::default()).fit(&handle).unwrap();
        assert_eq!(summary.attempts, 3);
        let seen = engine.seen.borrow();
        assert_eq!(seen[1].initial, [1.5]);
        assert_eq!(seen[2].initial, [1.9]);
    }

    #[test]
    fn test_retry_with_inverted_bounds_does_not_panic() {
        let handle = handle();
        {
            let mut registry = handle.write();
            registry.free_norm("mkn421", true).unwrap();
            let key = roi_core::ParameterKey::new("mkn421", "norm");
            let par = registry.parameter_mut(&key).unwrap();
            par.min = 5.0;
            par.max = 1.0;
        }
        let engine = Scripted::new(vec![Ok(converged(vec![3.0], 1)), Ok(converged(vec![1.0], 3))]);
        let summary = Fitter::new(&engine, &quadratic, FitOptions::default()).fit(&handle).unwrap();
        assert_eq!(summary.attempts, 2);
        assert_eq!(engine.seen.borrow()[1].initial, [1.0]);
    }

    #[test]
    fn test_quality_below_minimum_after_retries_fails() {
        let handle = handle();
        handle.write().free_norm("mkn421", true).unwrap();
        let engine = Scripted::new(vec![Ok(converged(vec![1.5], 2))]);
        let err = Fitter::new(&engine, &quadratic, FitOptions::default()).fit(&handle).unwrap_err();
        assert_eq!(engine.calls.get(), 3);
        assert_eq!(err.code(), 2);
        assert!(err.to_string().contains("below required 3"));
    }

    #[test]
    fn test_lower_minimum_quality_accepts() {
        let handle = handle();
        handle.write().free_norm("mkn421", true).unwrap();
        let engine = Scripted::new(vec![Ok(converged(vec![1.5], 2))]);
        let options = FitOptions {
            retries: 1,
            min_fit_quality: 2,
            ..FitOptions::default()
        };
        let summary = Fitter::new(&engine, &quadratic, options).fit(&handle).unwrap();
        assert_eq!(summary.attempts, 1);
    }

    /// Engine that starts a second fit on the same registry while running.
    struct Reentrant<'h> {
        handle: &'h RegistryHandle,
        inner: RefCell<Option<FitError>>,
    }

    impl Maximizer for Reentrant<'_> {
        fn maximize(
            &self,
            problem: &FitProblem,
            objective: &dyn Objective,
        ) -> Result<FitResult, EngineError> {
            assert_eq!(self.handle.phase(), FitPhase::Running);
            // The registry is not locked while the engine runs.
            assert!(!self.handle.read().is_empty());
            let nested = Fitter::new(self, objective, FitOptions::default()).fit(self.handle);
            *self.inner.borrow_mut() = nested.err();
            Ok(converged(problem.initial.clone(), 3))
        }
    }

    #[test]
    fn test_concurrent_fit_rejected() {
        let handle = handle();
        handle.write().free_norm("mkn421", true).unwrap();
        let engine = Reentrant {
            handle: &handle,
            inner: RefCell::new(None),
        };
        Fitter::new(&engine, &quadratic, FitOptions::default()).fit(&handle).unwrap();
        assert_eq!(engine.inner.borrow().clone(), Some(FitError::ConcurrentFit));
        assert_eq!(handle.phase(), FitPhase::Converged);
    }

    /// Engine that changes the free set while running.
    struct Meddling<'h> {
        handle: &'h RegistryHandle,
    }

    impl Maximizer for Meddling<'_> {
        fn maximize(
            &self,
            problem: &FitProblem,
            _: &dyn Objective,
        ) -> Result<FitResult, EngineError> {
            self.handle
                .write()
                .apply(&ParameterSelector::new().name(GALDIFF).free())
                .map_err(|e| EngineError::new(-1, e.to_string()))?;
            Ok(converged(problem.initial.clone(), 3))
        }
    }

    #[test]
    fn test_free_set_change_during_fit_is_commit_error() {
        let handle = handle();
        handle.write().free_norm("mkn421", true).unwrap();
        let engine = Meddling { handle: &handle };
        let err = Fitter::new(&engine, &quadratic, FitOptions::default()).fit(&handle).unwrap_err();
        assert!(err.is_commit());
        assert!(err.to_string().contains("free parameters changed"));
    }
}

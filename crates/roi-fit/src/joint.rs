//! Joint likelihood over several analysis components.
//!
//! Each component owns its own registry and objective. The joint fit
//! concatenates every component's free parameters into one problem, sums the
//! component log-likelihoods into one objective and calls the engine once.
//! The result is committed to all components or to none.

use std::ops::Range;

use roi_core::ParameterKey;
use tracing::{info, warn};

use crate::engine::{FitOptions, FitProblem, FitResult, Maximizer, Objective};
use crate::error::{EngineError, FitError};
use crate::fitter::{CommitPlan, check_convergence, run_engine};
use crate::handle::{FitPhase, PhaseGuard, RegistryHandle};

/// One component of a joint fit.
#[derive(Clone, Copy)]
pub struct JointComponent<'a> {
    /// Component name, used to label its parameters in the joint problem.
    pub name: &'a str,
    /// The component's registry.
    pub handle: &'a RegistryHandle,
    /// The component's likelihood.
    pub objective: &'a dyn Objective,
}

impl std::fmt::Debug for JointComponent<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JointComponent").field("name", &self.name).finish_non_exhaustive()
    }
}

/// A committed joint fit.
#[derive(Debug, Clone, PartialEq)]
pub struct JointSummary {
    /// The concatenated problem; parameter keys are `component/source`.
    pub problem: FitProblem,
    /// The engine result of the final run.
    pub result: FitResult,
    /// Number of engine runs.
    pub attempts: u32,
    /// Log-likelihood of each component at the best fit.
    pub components: Vec<(String, f64)>,
}

/// Sums component objectives over slices of the joint parameter vector.
struct SumObjective<'a> {
    parts: Vec<(&'a dyn Objective, &'a FitProblem, Range<usize>)>,
    total: usize,
}

impl Objective for SumObjective<'_> {
    fn log_likelihood(&self, _: &FitProblem, values: &[f64]) -> Result<f64, EngineError> {
        if values.len() != self.total {
            return Err(EngineError::new(
                -1,
                format!("expected {} values, got {}", self.total, values.len()),
            ));
        }
        self.parts.iter().try_fold(0.0, |sum, (objective, problem, range)| {
            Ok(sum + objective.log_likelihood(problem, &values[range.clone()])?)
        })
    }
}

/// Runs joint fits with one engine.
pub struct JointFitter<'a> {
    maximizer: &'a dyn Maximizer,
    options: FitOptions,
}

impl std::fmt::Debug for JointFitter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JointFitter").field("options", &self.options).finish_non_exhaustive()
    }
}

impl<'a> JointFitter<'a> {
    /// Creates a joint fitter.
    #[must_use]
    pub fn new(maximizer: &'a dyn Maximizer, options: FitOptions) -> Self {
        Self { maximizer, options }
    }

    /// Fits all components together and commits to every component or none.
    ///
    /// # Errors
    ///
    /// As [`Fitter::fit`](crate::Fitter::fit); [`FitError::ConcurrentFit`]
    /// also covers a registry listed twice.
    pub fn fit(&self, components: &[JointComponent<'_>]) -> Result<JointSummary, FitError> {
        let mut guards = Vec::with_capacity(components.len());
        for component in components {
            guards.push(component.handle.begin()?);
        }

        let outcome = self.run(components, &guards);
        let phase = match &outcome {
            Ok(summary) => {
                info!(
                    components = components.len(),
                    log_likelihood = summary.result.log_likelihood,
                    attempts = summary.attempts,
                    "joint fit converged"
                );
                FitPhase::Converged
            }
            Err(error) => {
                warn!(%error, "joint fit failed");
                FitPhase::Failed
            }
        };
        for guard in guards {
            guard.finish(phase);
        }
        outcome
    }

    fn run(
        &self,
        components: &[JointComponent<'_>],
        guards: &[PhaseGuard<'_>],
    ) -> Result<JointSummary, FitError> {
        let problems: Vec<FitProblem> = components
            .iter()
            .map(|c| FitProblem::collect(&c.handle.read(), &self.options))
            .collect();

        let mut ranges = Vec::with_capacity(problems.len());
        let mut joint = FitProblem {
            parameters: Vec::new(),
            initial: Vec::new(),
            bounds: Vec::new(),
            scales: Vec::new(),
            energy_range: self.options.energy_range,
            optimizer: self.options.optimizer.clone(),
            tol: self.options.tol,
        };
        for (component, problem) in components.iter().zip(&problems) {
            let start = joint.len();
            joint.parameters.extend(problem.parameters.iter().map(|key| {
                let source = format!("{}/{}", component.name, key.source);
                ParameterKey::new(source, key.parameter.as_str())
            }));
            joint.initial.extend_from_slice(&problem.initial);
            joint.bounds.extend_from_slice(&problem.bounds);
            joint.scales.extend_from_slice(&problem.scales);
            ranges.push(start..joint.len());
        }
        if joint.is_empty() {
            return Err(FitError::NoFreeParameters);
        }

        let objective = SumObjective {
            parts: components
                .iter()
                .zip(&problems)
                .zip(&ranges)
                .map(|((c, p), r)| (c.objective, p, r.clone()))
                .collect(),
            total: joint.len(),
        };

        for guard in guards {
            guard.set(FitPhase::Running);
        }
        let (result, attempts) = run_engine(self.maximizer, &objective, &joint, &self.options)?;
        check_convergence(&result, &self.options)?;
        validate_shape(&joint, &result)?;

        // Per-component results and likelihoods, computed before any lock.
        let mut parts = Vec::with_capacity(components.len());
        for ((component, problem), range) in components.iter().zip(&problems).zip(&ranges) {
            let mut part = split_result(&result, range.clone(), joint.len(), component.name);
            part.log_likelihood = component.objective.log_likelihood(problem, &part.values)?;
            parts.push(part);
        }

        let mut registries: Vec<_> = components.iter().map(|c| c.handle.write()).collect();
        let mut plans = Vec::with_capacity(components.len());
        for ((registry, problem), part) in registries.iter().zip(&problems).zip(&parts) {
            plans.push(CommitPlan::validate(registry, problem, part)?);
        }
        for (registry, plan) in registries.iter_mut().zip(plans) {
            plan.apply(registry);
        }

        Ok(JointSummary {
            problem: joint,
            result,
            attempts,
            components: components
                .iter()
                .zip(&parts)
                .map(|(c, part)| (c.name.to_owned(), part.log_likelihood))
                .collect(),
        })
    }
}

/// Length checks that must pass before the joint result can be sliced.
fn validate_shape(joint: &FitProblem, result: &FitResult) -> Result<(), FitError> {
    let n = joint.len();
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
    Ok(())
}

/// The slice of a joint result belonging to one component.
fn split_result(result: &FitResult, range: Range<usize>, n: usize, component: &str) -> FitResult {
    let errors = if result.errors.is_empty() {
        Vec::new()
    } else {
        result.errors[range.clone()].to_vec()
    };
    let covariance = if result.covariance.is_empty() {
        Vec::new()
    } else {
        range
            .clone()
            .flat_map(|row| {
                result.covariance[row * n + range.start..row * n + range.end]
                    .iter()
                    .copied()
            })
            .collect()
    };
    let prefix = format!("{component}/");
    let npred = result
        .npred
        .iter()
        .filter_map(|(name, value)| {
            name.strip_prefix(&prefix)
                .map(|source| (source.to_owned(), *value))
        })
        .collect();

    FitResult {
        converged: result.converged,
        status: result.status,
        quality: result.quality,
        log_likelihood: result.log_likelihood,
        values: result.values[range].to_vec(),
        errors,
        covariance,
        npred,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fitter::tests::{Scripted, converged, handle, quadratic};
    use crate::selector::ParameterControl;
    use roi_core::ISODIFF;

    fn free_norm(handle: &RegistryHandle, name: &str) {
        handle.write().free_norm(name, true).unwrap();
    }

    #[test]
    fn test_joint_fit_commits_to_every_component() {
        let (a, b) = (handle(), handle());
        free_norm(&a, "mkn421");
        free_norm(&b, "mkn421");
        free_norm(&b, ISODIFF);

        let mut result = converged(vec![1.1, 1.2, 1.3], 3);
        result.covariance = (0..9).map(f64::from).collect();
        result.npred = vec![("psf1/mkn421".to_owned(), 12.0)];
        let engine = Scripted::new(vec![Ok(result)]);
        let components = [
            JointComponent { name: "psf0", handle: &a, objective: &quadratic },
            JointComponent { name: "psf1", handle: &b, objective: &quadratic },
        ];

        let summary = JointFitter::new(&engine, FitOptions::default()).fit(&components).unwrap();
        assert_eq!(summary.problem.parameters[0], ParameterKey::new("psf0/mkn421", "norm"));
        assert_eq!(summary.components.len(), 2);

        let a = a.read();
        assert_eq!(a.get("mkn421").unwrap().spectrum.parameter("norm").unwrap().value, 1.1);
        assert_eq!(a.log_likelihood, Some(-(1.1f64 - 2.0).powi(2)));
        let b = b.read();
        assert_eq!(b.get(ISODIFF).unwrap().spectrum.parameter("Normalization").unwrap().value, 1.2);
        assert_eq!(b.get("mkn421").unwrap().spectrum.parameter("norm").unwrap().value, 1.3);
        assert_eq!(b.get("mkn421").unwrap().npred, Some(12.0));
    }

    #[test]
    fn test_joint_objective_sums_components() {
        let (a, b) = (handle(), handle());
        free_norm(&a, "mkn421");
        free_norm(&b, "mkn421");

        struct StartingPoint;
        impl Maximizer for StartingPoint {
            fn maximize(
                &self,
                problem: &FitProblem,
                objective: &dyn Objective,
            ) -> Result<FitResult, EngineError> {
                let at_start = objective.log_likelihood(problem, &problem.initial)?;
                // Both components start at norm = 1, so each contributes -1.
                assert!((at_start + 2.0).abs() < 1e-12);
                Ok(converged(vec![2.0, 2.0], 3))
            }
        }
        let components = [
            JointComponent { name: "a", handle: &a, objective: &quadratic },
            JointComponent { name: "b", handle: &b, objective: &quadratic },
        ];
        let summary = JointFitter::new(&StartingPoint, FitOptions::default())
            .fit(&components)
            .unwrap();
        assert_eq!(summary.components, [("a".to_owned(), 0.0), ("b".to_owned(), 0.0)]);
    }

    #[test]
    fn test_joint_commit_is_all_or_nothing() {
        let (a, b) = (handle(), handle());
        free_norm(&a, "mkn421");
        free_norm(&b, "mkn421");

        let mut result = converged(vec![1.5, 1.5], 3);
        // Unknown source in component b only.
        result.npred = vec![("b/crab".to_owned(), 3.0)];
        let engine = Scripted::new(vec![Ok(result)]);
        let components = [
            JointComponent { name: "a", handle: &a, objective: &quadratic },
            JointComponent { name: "b", handle: &b, objective: &quadratic },
        ];
        let err = JointFitter::new(&engine, FitOptions::default()).fit(&components).unwrap_err();
        assert!(err.is_commit());
        assert_eq!(a.read().get("mkn421").unwrap().spectrum.parameter("norm").unwrap().value, 1.0);
        assert_eq!(a.read().log_likelihood, None);
        assert_eq!(a.phase(), FitPhase::Failed);
    }

    #[test]
    fn test_joint_rejects_shared_registry() {
        let a = handle();
        free_norm(&a, "mkn421");
        let engine = Scripted::new(vec![Ok(converged(vec![1.0, 1.0], 3))]);
        let components = [
            JointComponent { name: "a", handle: &a, objective: &quadratic },
            JointComponent { name: "b", handle: &a, objective: &quadratic },
        ];
        let err = JointFitter::new(&engine, FitOptions::default()).fit(&components).unwrap_err();
        assert_eq!(err, FitError::ConcurrentFit);
        assert_eq!(engine.calls.get(), 0);
        assert_eq!(a.phase(), FitPhase::Idle);
    }

    #[test]
    fn test_joint_no_free_parameters() {
        let (a, b) = (handle(), handle());
        let engine = Scripted::new(vec![Ok(converged(vec![], 3))]);
        let components = [
            JointComponent { name: "a", handle: &a, objective: &quadratic },
            JointComponent { name: "b", handle: &b, objective: &quadratic },
        ];
        let err = JointFitter::new(&engine, FitOptions::default()).fit(&components).unwrap_err();
        assert_eq!(err, FitError::NoFreeParameters);
    }

    #[test]
    fn test_split_result_extracts_covariance_block() {
        let mut result = converged(vec![0.0, 1.0, 2.0], 3);
        result.covariance = (0..9).map(f64::from).collect();
        let part = split_result(&result, 1..3, 3, "x");
        assert_eq!(part.values, [1.0, 2.0]);
        assert_eq!(part.covariance, [4.0, 5.0, 7.0, 8.0]);
        assert_eq!(part.errors, [0.1, 0.1]);
    }
}

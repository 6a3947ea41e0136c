//! Error types for the roi-fit crate.
//!
//! - [`SelectionError`] - a parameter selector could not be evaluated
//! - [`EngineError`] - raised by the external maximizer or objective
//! - [`FitError`] - a fit invocation did not commit
//!
//! None of these leave partial state behind: a failed selection toggles
//! nothing and a failed fit leaves every parameter as it was.

use roi_core::ResolutionError;

/// Errors raised while evaluating a [`ParameterSelector`](crate::ParameterSelector).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectionError {
    /// A parameter named by the selector exists in none of the sources it
    /// was checked against.
    #[error("parameter '{parameter}' is not defined for {}", describe_sources(sources))]
    UnknownParameter {
        /// The unknown parameter name.
        parameter: String,
        /// Canonical names of the sources checked.
        sources: Vec<String>,
    },

    /// The selector has no free/fix target, so it cannot be applied.
    #[error("selector has no target state (free or fix)")]
    MissingTarget,

    /// The selector's source name did not resolve.
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
}

fn describe_sources(sources: &[String]) -> String {
    match sources {
        [] => "any source".to_owned(),
        [one] => format!("source '{one}'"),
        many => format!("sources {}", many.join(", ")),
    }
}

/// An error reported by the external likelihood engine.
///
/// `code` is the engine's own diagnostic code and is passed through
/// unchanged.
///
/// # Examples
///
/// ```
/// use roi_fit::EngineError;
///
/// let error = EngineError::new(-4, "covariance matrix not positive definite");
/// assert_eq!(error.code, -4);
/// assert!(error.to_string().contains("not positive definite"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("likelihood engine error (code {code}): {message}")]
pub struct EngineError {
    /// Engine diagnostic code.
    pub code: i32,
    /// Engine diagnostic message.
    pub message: String,
}

impl EngineError {
    /// Creates a new engine error.
    #[inline]
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Errors from a fit invocation. The registry is unchanged after any of them.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FitError {
    /// No parameter is free, so there is nothing to fit.
    #[error("no free parameters")]
    NoFreeParameters,

    /// The engine raised an error, did not converge, or converged with an
    /// insufficient fit quality.
    #[error("fit failed (code {code}): {message}")]
    Failure {
        /// Engine diagnostic code, or the fit quality for quality failures.
        code: i32,
        /// Diagnostic message.
        message: String,
    },

    /// The engine's result could not be applied consistently.
    #[error("cannot commit fit result: {reason}")]
    Commit {
        /// What was inconsistent.
        reason: String,
    },

    /// Another fit is already running against the same registry.
    #[error("a fit is already running on this registry")]
    ConcurrentFit,

    /// SED energy bins are unusable.
    #[error("invalid energy bins: {reason}")]
    InvalidEnergyBins {
        /// What is wrong with the bin edges.
        reason: String,
    },

    /// SED settings are unusable.
    #[error("invalid SED configuration: {reason}")]
    InvalidSedConfig {
        /// The configuration error.
        reason: String,
    },

    /// A selector used to prepare the fit failed.
    #[error(transparent)]
    Selection(#[from] SelectionError),

    /// A source name used to prepare the fit did not resolve.
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
}

impl FitError {
    /// Creates a new [`FitError::Commit`] error.
    #[inline]
    pub fn commit(reason: impl Into<String>) -> Self {
        Self::Commit {
            reason: reason.into(),
        }
    }

    /// Creates a new [`FitError::Failure`] error.
    #[inline]
    pub fn failure(code: i32, message: impl Into<String>) -> Self {
        Self::Failure {
            code,
            message: message.into(),
        }
    }

    /// Returns `true` for engine and convergence failures.
    #[inline]
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure { .. })
    }

    /// Returns `true` for commit inconsistencies.
    #[inline]
    #[must_use]
    pub fn is_commit(&self) -> bool {
        matches!(self, Self::Commit { .. })
    }

    /// Diagnostic code: the engine's code for failures, `-1` otherwise.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::Failure { code, .. } => *code,
            _ => -1,
        }
    }
}

impl From<EngineError> for FitError {
    fn from(error: EngineError) -> Self {
        Self::Failure {
            code: error.code,
            message: error.message,
        }
    }
}

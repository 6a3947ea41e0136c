//! Error types for the roi-core crate.
//!
//! - [`RegistrationError`] - a source could not be added to (or removed from)
//!   the registry without breaking its naming invariants
//! - [`ResolutionError`] - a source identifier did not resolve to exactly one
//!   source
//! - [`RegistryError`] - either of the above, for operations that resolve and
//!   then mutate
//! - [`ConfigError`] - configuration loading and validation failures
//! - [`SetupError`] - the setup collaborator could not build a registry
//!
//! Registry operations that fail leave the registry unchanged.

use camino::Utf8PathBuf;

/// Errors raised while adding sources or aliases to a registry.
///
/// # Examples
///
/// ```
/// use roi_core::RegistrationError;
///
/// let error = RegistrationError::DuplicateName { name: "mkn421".to_owned() };
/// assert!(error.to_string().contains("mkn421"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    /// A source with the same canonical name is already registered.
    #[error("source '{name}' is already registered")]
    DuplicateName {
        /// The rejected canonical name.
        name: String,
    },

    /// An alias (or the canonical name itself) normalizes to a key that
    /// already belongs to a different source.
    #[error("alias '{alias}' of source '{requested}' collides with source '{existing}'")]
    AliasCollision {
        /// The alias that collided.
        alias: String,
        /// The source that already owns the normalized key.
        existing: String,
        /// The source whose registration was rejected.
        requested: String,
    },

    /// The source is one of the diffuse components that must always exist.
    #[error("source '{name}' is a protected diffuse component and cannot be removed")]
    ProtectedSource {
        /// The protected source name.
        name: String,
    },

    /// The canonical name is empty after normalization.
    #[error("source name must not be empty")]
    EmptyName,
}

/// Errors raised while resolving a source identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolutionError {
    /// No canonical name or alias matches the query.
    #[error("no source matching '{query}'")]
    NotFound {
        /// The identifier as given by the caller.
        query: String,
    },

    /// The normalized query maps to more than one canonical name.
    #[error("'{query}' matches multiple sources: {}", candidates.join(", "))]
    Ambiguous {
        /// The identifier as given by the caller.
        query: String,
        /// Every canonical name the query matched.
        candidates: Vec<String>,
    },
}

impl ResolutionError {
    /// Creates a new [`ResolutionError::NotFound`] error.
    #[inline]
    pub fn not_found(query: impl Into<String>) -> Self {
        Self::NotFound {
            query: query.into(),
        }
    }

    /// Returns the identifier that failed to resolve.
    #[must_use]
    pub fn query(&self) -> &str {
        match self {
            Self::NotFound { query } | Self::Ambiguous { query, .. } => query,
        }
    }
}

/// Errors from registry operations that resolve a name and then mutate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// The mutation would break a registration invariant.
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    /// The source identifier did not resolve.
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
}

/// Errors that can occur during configuration loading and validation.
///
/// # Examples
///
/// ```
/// use roi_core::ConfigError;
///
/// let error = ConfigError::invalid_option("binning.binsz", "must be positive");
/// assert!(error.to_string().contains("binning.binsz"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A configuration option has an invalid value.
    #[error("invalid configuration option '{option}': {reason}")]
    InvalidOption {
        /// The dotted path of the invalid option.
        option: String,
        /// Explanation of why the option is invalid.
        reason: String,
    },

    /// An I/O error occurred while reading a configuration file.
    #[error("failed to read configuration {path}: {source}")]
    Io {
        /// The configuration file.
        path: Utf8PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse the configuration document.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    /// Creates a new [`ConfigError::InvalidOption`] error.
    #[inline]
    pub fn invalid_option(option: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidOption {
            option: option.into(),
            reason: reason.into(),
        }
    }
}

/// Errors returned by a [`Setup`](crate::Setup) collaborator.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    /// The configuration cannot describe a valid ROI.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The configured sources violate registry invariants.
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    /// The configured ROI target did not resolve.
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    /// Data preparation failed in the external pipeline.
    #[error("setup failed: {0}")]
    Failed(String),
}

//! Error types for the roi-state crate.

use camino::Utf8PathBuf;
use roi_core::{ConfigError, SetupError};

/// Errors from encoding, decoding and overlaying snapshots.
///
/// # Examples
///
/// ```
/// use roi_state::SerializationError;
///
/// let error = SerializationError::schema_mismatch(vec!["mkn421".to_owned()]);
/// assert!(error.to_string().contains("mkn421"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum SerializationError {
    /// The snapshot was written by a newer format version.
    #[error("snapshot format version {found} is newer than supported version {supported}")]
    FormatVersion {
        /// Version found in the snapshot.
        found: u32,
        /// Newest version this build reads.
        supported: u32,
    },

    /// The snapshot could not be decoded.
    #[error("corrupt snapshot ({origin}): {reason}")]
    Corrupt {
        /// File path, or the encoding when decoding from memory.
        origin: String,
        /// What failed to decode.
        reason: String,
    },

    /// The snapshot names sources the target registry does not have.
    #[error("snapshot does not match the registry: {} not found", missing.join(", "))]
    SchemaMismatch {
        /// Canonical names of the missing sources.
        missing: Vec<String>,
    },

    /// The snapshot could not be encoded.
    #[error("failed to encode {encoding} snapshot: {reason}")]
    Encode {
        /// `text` or `binary`.
        encoding: &'static str,
        /// Encoder message.
        reason: String,
    },

    /// Reading or writing a snapshot file failed.
    #[error("snapshot I/O failed for {path}: {source}")]
    Io {
        /// The snapshot file.
        path: Utf8PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl SerializationError {
    /// Creates a new [`SerializationError::Corrupt`] error.
    #[inline]
    pub fn corrupt(origin: impl Into<String>, reason: impl ToString) -> Self {
        Self::Corrupt {
            origin: origin.into(),
            reason: reason.to_string(),
        }
    }

    /// Creates a new [`SerializationError::SchemaMismatch`] error.
    #[inline]
    pub fn schema_mismatch(missing: Vec<String>) -> Self {
        Self::SchemaMismatch { missing }
    }

    /// Creates a new [`SerializationError::Io`] error.
    #[inline]
    pub fn io(path: impl Into<Utf8PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns `true` for [`SerializationError::Corrupt`].
    #[inline]
    #[must_use]
    pub const fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt { .. })
    }

    /// The file path associated with this error, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Utf8PathBuf> {
        match self {
            Self::Io { path, .. } => Some(path),
            Self::FormatVersion { .. }
            | Self::Corrupt { .. }
            | Self::SchemaMismatch { .. }
            | Self::Encode { .. } => None,
        }
    }
}

/// Errors from session creation and loading.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Snapshot encoding, decoding or overlay failed.
    #[error(transparent)]
    Serialization(#[from] SerializationError),

    /// The embedded configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Rebuilding the registry from the configuration failed.
    #[error("session setup failed: {0}")]
    Setup(#[from] SetupError),
}

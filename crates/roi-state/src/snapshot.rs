//! The versioned snapshot schema.

use roi_core::{Registry, ResolvedConfig, SkyDir, Source};
use serde::{Deserialize, Serialize};

use crate::error::SerializationError;

/// Newest snapshot format version this build writes and reads.
pub const FORMAT_VERSION: u32 = 1;

/// Version of the software writing snapshots.
pub const SOFTWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// ROI-level aggregates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoiSummary {
    /// ROI center.
    pub center: SkyDir,
    /// Log-likelihood of the last committed fit.
    #[serde(default, with = "roi_core::lossless::option")]
    pub log_likelihood: Option<f64>,
    /// Fit quality of the last committed fit.
    pub fit_quality: Option<u8>,
    /// Total predicted counts over all sources.
    #[serde(with = "roi_core::lossless")]
    pub npred: f64,
}

/// Complete, self-contained copy of an analysis state.
///
/// A snapshot is a value: it is created by [`capture`](Self::capture), written
/// to disk, and read back to rebuild or overlay a registry. It never stays
/// attached to a live registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Schema version, see [`FORMAT_VERSION`].
    pub format_version: u32,
    /// Version of the software that wrote the snapshot.
    pub software_version: String,
    /// Resolved configuration, components included.
    pub config: ResolvedConfig,
    /// ROI aggregates.
    pub roi: RoiSummary,
    /// Every source with its full parameter state, in registry order.
    pub sources: Vec<Source>,
}

impl Snapshot {
    /// Deep-copies the registry and configuration.
    #[must_use]
    pub fn capture(registry: &Registry, config: &ResolvedConfig) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            software_version: SOFTWARE_VERSION.to_owned(),
            config: config.clone(),
            roi: RoiSummary {
                center: registry.center(),
                log_likelihood: registry.log_likelihood,
                fit_quality: registry.fit_quality,
                npred: registry.total_npred(),
            },
            sources: registry.iter().cloned().collect(),
        }
    }

    /// Source by canonical name.
    #[must_use]
    pub fn source(&self, name: &str) -> Option<&Source> {
        self.sources.iter().find(|s| s.name() == name)
    }

    /// Checks every parameter for inconsistent numeric state (NaN or inverted
    /// bounds, non-finite values, unusable scales).
    ///
    /// # Errors
    ///
    /// [`SerializationError::Corrupt`] naming `origin`, the source and the
    /// parameter.
    pub fn validate(&self, origin: &str) -> Result<(), SerializationError> {
        for source in &self.sources {
            for par in source.parameters() {
                if let Some(defect) = par.inconsistency() {
                    return Err(SerializationError::corrupt(
                        origin,
                        format!("{}: parameter {}: {defect}", source.name(), par.name),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Overlays the snapshot's parameter state onto `registry`.
    ///
    /// Spectral models (values, errors, bounds, scales and free flags), TS,
    /// npred and the ROI aggregates are replaced. Sources in the registry
    /// but not in the snapshot are left alone.
    ///
    /// # Errors
    ///
    /// [`SerializationError::Corrupt`] if a parameter fails
    /// [`validate`](Self::validate), [`SerializationError::SchemaMismatch`]
    /// if any snapshot source is not registered. The registry is unchanged
    /// in both cases.
    pub fn overlay(&self, registry: &mut Registry) -> Result<(), SerializationError> {
        self.validate("snapshot")?;
        let missing: Vec<String> = self
            .sources
            .iter()
            .filter(|s| registry.get(s.name()).is_none())
            .map(|s| s.name().to_owned())
            .collect();
        if !missing.is_empty() {
            return Err(SerializationError::schema_mismatch(missing));
        }

        for saved in &self.sources {
            if let Some(source) = registry.get_mut(saved.name()) {
                source.spectrum = saved.spectrum.clone();
                source.ts = saved.ts;
                source.npred = saved.npred;
            }
        }
        registry.log_likelihood = self.roi.log_likelihood;
        registry.fit_quality = self.roi.fit_quality;
        Ok(())
    }
}

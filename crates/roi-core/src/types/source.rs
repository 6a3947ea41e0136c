//! Sources: the modeled emitters of an ROI.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use super::{Parameter, SkyDir, SpatialModel, SpectralModel};

/// Aliases per source; most sources carry one or two catalog associations.
pub type Aliases = SmallVec<[String; 2]>;

/// A modeled emitter in the ROI.
///
/// The canonical name and aliases can only be changed through the
/// [`Registry`](crate::Registry), which keeps its name index in step with them.
/// Everything else is plain data.
///
/// # Examples
///
/// ```
/// use roi_core::{SkyDir, Source, SpectralModel, SpectrumType};
///
/// let spectrum = SpectralModel::new(SpectrumType::LogParabola);
/// let source = Source::point("mkn421", SkyDir::new(166.1, 38.2), spectrum)
///     .with_alias("Mkn 421")
///     .with_alias("3FGL J1104.4+3812");
///
/// assert_eq!(source.name(), "mkn421");
/// assert_eq!(source.aliases().len(), 2);
/// assert!(!source.is_diffuse());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    name: String,
    aliases: Aliases,
    /// Position; `None` for diffuse sources.
    pub skydir: Option<SkyDir>,
    /// Spatial model.
    pub spatial: SpatialModel,
    /// Spectral model with its parameter state.
    pub spectrum: SpectralModel,
    /// Test statistic from the last committed fit.
    #[serde(default, with = "crate::lossless::option")]
    pub ts: Option<f64>,
    /// Predicted counts from the last committed fit.
    #[serde(default, with = "crate::lossless::option")]
    pub npred: Option<f64>,
}

impl Source {
    /// Creates a point source at `skydir`.
    #[must_use]
    pub fn point(name: impl Into<String>, skydir: SkyDir, spectrum: SpectralModel) -> Self {
        Self {
            name: name.into(),
            aliases: Aliases::new(),
            skydir: Some(skydir),
            spatial: SpatialModel::PointSource,
            spectrum,
            ts: None,
            npred: None,
        }
    }

    /// Creates a diffuse source with no position.
    #[must_use]
    pub fn diffuse(
        name: impl Into<String>,
        spatial: SpatialModel,
        spectrum: SpectralModel,
    ) -> Self {
        Self {
            name: name.into(),
            aliases: Aliases::new(),
            skydir: None,
            spatial,
            spectrum,
            ts: None,
            npred: None,
        }
    }

    /// Adds an alias before registration.
    #[must_use]
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    /// Replaces the spatial model.
    #[must_use]
    pub fn with_spatial(mut self, spatial: SpatialModel) -> Self {
        self.spatial = spatial;
        self
    }

    /// Canonical name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Aliases in registration order.
    #[inline]
    #[must_use]
    pub fn aliases(&self) -> &[String] {
        &self.aliases
    }

    /// Canonical name followed by every alias.
    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str()).chain(self.aliases.iter().map(String::as_str))
    }

    pub(crate) fn push_alias(&mut self, alias: String) {
        self.aliases.push(alias);
    }

    /// Returns `true` for all-sky components.
    #[inline]
    #[must_use]
    pub fn is_diffuse(&self) -> bool {
        self.spatial.is_diffuse()
    }

    /// Angular distance from `center` in degrees, `None` without a position.
    #[must_use]
    pub fn distance_to(&self, center: &SkyDir) -> Option<f64> {
        self.skydir.as_ref().map(|dir| dir.separation(center))
    }

    /// Spectral parameters in model order.
    #[inline]
    #[must_use]
    pub fn parameters(&self) -> &[Parameter] {
        &self.spectrum.parameters
    }
}

//! Spatial models.

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

/// Spatial distribution of a source's emission.
///
/// # Examples
///
/// ```
/// use roi_core::SpatialModel;
///
/// assert!(!SpatialModel::PointSource.is_diffuse());
/// assert!(SpatialModel::Isotropic.is_diffuse());
/// assert!(SpatialModel::RadialGaussian { width: 0.2 }.is_extended());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpatialModel {
    /// Point-like emission at the source position.
    PointSource,

    /// Symmetric 2D Gaussian centered on the source position.
    RadialGaussian {
        /// 68% containment radius in degrees.
        width: f64,
    },

    /// Uniform disk centered on the source position.
    RadialDisk {
        /// 68% containment radius in degrees.
        width: f64,
    },

    /// Arbitrary 2D template.
    SpatialMap {
        /// Template file.
        file: Utf8PathBuf,
    },

    /// Energy-dependent all-sky template (galactic diffuse emission).
    MapCube {
        /// Template file.
        file: Utf8PathBuf,
    },

    /// Uniform all-sky emission (isotropic diffuse background).
    Isotropic,
}

impl SpatialModel {
    /// Returns `true` for the all-sky components, which have no position.
    #[inline]
    #[must_use]
    pub const fn is_diffuse(&self) -> bool {
        matches!(self, Self::MapCube { .. } | Self::Isotropic)
    }

    /// Returns `true` for positioned sources with a spatial extent.
    #[inline]
    #[must_use]
    pub const fn is_extended(&self) -> bool {
        matches!(
            self,
            Self::RadialGaussian { .. } | Self::RadialDisk { .. } | Self::SpatialMap { .. }
        )
    }

    /// Spatial function name used in the engine's model files.
    #[must_use]
    pub const fn function_name(&self) -> &'static str {
        match self {
            Self::PointSource => "SkyDirFunction",
            Self::RadialGaussian { .. } => "RadialGaussian",
            Self::RadialDisk { .. } => "RadialDisk",
            Self::SpatialMap { .. } => "SpatialMap",
            Self::MapCube { .. } => "MapCubeFunction",
            Self::Isotropic => "ConstantValue",
        }
    }

    /// Template file, for template-based models.
    #[must_use]
    pub fn file(&self) -> Option<&Utf8Path> {
        match self {
            Self::SpatialMap { file } | Self::MapCube { file } => Some(file),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diffuse_and_extended_are_disjoint() {
        let models = [
            SpatialModel::PointSource,
            SpatialModel::RadialGaussian { width: 0.1 },
            SpatialModel::RadialDisk { width: 0.3 },
            SpatialModel::SpatialMap {
                file: "template.fits".into(),
            },
            SpatialModel::MapCube {
                file: "gll_iem_v06.fits".into(),
            },
            SpatialModel::Isotropic,
        ];
        for model in &models {
            assert!(!(model.is_diffuse() && model.is_extended()), "{model:?}");
        }
    }

    #[test]
    fn test_file() {
        let map = SpatialModel::MapCube {
            file: "gll_iem_v06.fits".into(),
        };
        assert_eq!(map.file().map(Utf8Path::as_str), Some("gll_iem_v06.fits"));
        assert_eq!(SpatialModel::PointSource.file(), None);
    }

    #[test]
    fn test_serialization_tags() {
        let json = serde_json::to_string(&SpatialModel::RadialDisk { width: 0.5 }).unwrap();
        assert_eq!(json, r#"{"radial_disk":{"width":0.5}}"#);
        let json = serde_json::to_string(&SpatialModel::PointSource).unwrap();
        assert_eq!(json, r#""point_source""#);
    }
}

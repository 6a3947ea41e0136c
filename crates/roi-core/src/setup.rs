//! Building a registry from configuration.
//!
//! The [`Setup`] trait is the seam to the data preparation pipeline: it turns
//! a resolved configuration into an initialized [`Registry`]. Event selection,
//! binning and map generation happen behind it and are not modeled here.
//!
//! [`ModelSetup`] is the implementation that only builds the ROI model: ROI
//! center, diffuse sources and the configured source list.

use tracing::{debug, info};

use crate::config::{ResolvedConfig, SourceSpec};
use crate::error::{ConfigError, ResolutionError, SetupError};
use crate::name::normalize_name;
use crate::registry::{DiffuseModels, Registry};
use crate::types::{SkyDir, Source, SpatialModel, SpectralModel};

/// Produces an initialized registry for a configuration.
///
/// Any `Fn(&ResolvedConfig) -> Result<Registry, SetupError>` is a `Setup`.
pub trait Setup {
    /// Runs the setup pipeline.
    fn setup(&self, config: &ResolvedConfig) -> Result<Registry, SetupError>;
}

impl<F> Setup for F
where
    F: Fn(&ResolvedConfig) -> Result<Registry, SetupError>,
{
    fn setup(&self, config: &ResolvedConfig) -> Result<Registry, SetupError> {
        self(config)
    }
}

/// Builds the ROI model described by the primary component's configuration.
///
/// # Examples
///
/// ```
/// use roi_core::{ModelSetup, ResolvedConfig, Setup};
///
/// let config = ResolvedConfig::from_json(serde_json::json!({
///     "selection": {"target": "Mkn 421"},
///     "model": {"sources": [{
///         "name": "mkn421", "aliases": ["Mkn 421"],
///         "ra": 166.1, "dec": 38.2, "spectrum_type": "LogParabola"
///     }]}
/// }))?;
///
/// let registry = ModelSetup.setup(&config)?;
/// assert_eq!(registry.len(), 3);
/// assert_eq!(registry.center().ra, 166.1);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct ModelSetup;

impl Setup for ModelSetup {
    fn setup(&self, config: &ResolvedConfig) -> Result<Registry, SetupError> {
        let analysis = config.primary();
        let model = &analysis.model;
        let center = roi_center(config)?;

        let defaults = DiffuseModels::default();
        let diffuse = DiffuseModels {
            galdiff: model.galdiff.clone().unwrap_or(defaults.galdiff),
            isodiff: model.isodiff.clone().unwrap_or(defaults.isodiff),
        };
        let mut registry = Registry::with_capacity(center, diffuse, model.sources.len());

        for spec in &model.sources {
            let source = build_source(spec)?;
            let distance = source.distance_to(&center);
            if let (Some(radius), Some(distance)) = (model.src_radius, distance) {
                if distance > radius {
                    debug!(source = %spec.name, distance, radius, "outside source radius");
                    continue;
                }
            }
            registry.register(source)?;
        }

        info!(
            sources = registry.len(),
            ra = center.ra,
            dec = center.dec,
            "built ROI model"
        );
        Ok(registry)
    }
}

fn position(
    ra: Option<f64>,
    dec: Option<f64>,
    glon: Option<f64>,
    glat: Option<f64>,
) -> Option<SkyDir> {
    match (ra, dec, glon, glat) {
        (Some(ra), Some(dec), _, _) => Some(SkyDir::new(ra, dec)),
        (_, _, Some(glon), Some(glat)) => Some(SkyDir::from_galactic(glon, glat)),
        _ => None,
    }
}

/// ROI center: the target source, else `ra`/`dec`, else `glon`/`glat`.
fn roi_center(config: &ResolvedConfig) -> Result<SkyDir, SetupError> {
    let analysis = config.primary();
    let sel = &analysis.selection;

    if let Some(target) = &sel.target {
        let key = normalize_name(target);
        let spec = analysis
            .model
            .sources
            .iter()
            .find(|spec| {
                std::iter::once(&spec.name)
                    .chain(&spec.aliases)
                    .any(|id| normalize_name(id) == key)
            })
            .ok_or_else(|| ResolutionError::not_found(target.as_str()))?;
        return position(spec.ra, spec.dec, spec.glon, spec.glat).ok_or_else(|| {
            ConfigError::invalid_option(
                "selection.target",
                format!("target '{target}' has no position"),
            )
            .into()
        });
    }

    position(sel.ra, sel.dec, sel.glon, sel.glat).ok_or_else(|| {
        ConfigError::invalid_option("selection", "set one of target, ra/dec or glon/glat").into()
    })
}

fn build_source(spec: &SourceSpec) -> Result<Source, SetupError> {
    let mut spectrum = SpectralModel::new(spec.spectrum_type);
    for (name, &value) in &spec.parameters {
        if !spectrum.set_true_value(name, value) {
            return Err(ConfigError::invalid_option(
                format!("model.sources.{}.parameters.{name}", spec.name),
                format!("not a parameter of {}", spec.spectrum_type),
            )
            .into());
        }
    }

    let spatial = spec.spatial_model.clone().unwrap_or(SpatialModel::PointSource);
    let skydir = position(spec.ra, spec.dec, spec.glon, spec.glat);
    let mut source = match skydir {
        Some(dir) => Source::point(spec.name.as_str(), dir, spectrum).with_spatial(spatial),
        None if spatial.is_diffuse() => Source::diffuse(spec.name.as_str(), spatial, spectrum),
        None => {
            return Err(ConfigError::invalid_option(
                format!("model.sources.{}", spec.name),
                "positioned source needs ra/dec or glon/glat",
            )
            .into());
        }
    };
    for alias in &spec.aliases {
        source = source.with_alias(alias.as_str());
    }
    Ok(source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RegistrationError;
    use crate::types::SpectrumType;
    use serde_json::json;

    fn config(value: serde_json::Value) -> ResolvedConfig {
        ResolvedConfig::from_json(value).unwrap()
    }

    #[test]
    fn test_center_from_ra_dec() {
        let registry = ModelSetup
            .setup(&config(json!({"selection": {"ra": 83.63, "dec": 22.01}})))
            .unwrap();
        assert_eq!(registry.center(), SkyDir::new(83.63, 22.01));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_center_from_galactic() {
        let registry = ModelSetup
            .setup(&config(json!({"selection": {"glon": 0.0, "glat": 0.0}})))
            .unwrap();
        assert!((registry.center().ra - 266.405).abs() < 0.01);
    }

    #[test]
    fn test_missing_center() {
        let err = ModelSetup.setup(&config(json!({}))).unwrap_err();
        assert!(matches!(err, SetupError::Config(_)));
    }

    #[test]
    fn test_unknown_target() {
        let err = ModelSetup
            .setup(&config(json!({"selection": {"target": "crab"}})))
            .unwrap_err();
        assert!(err.to_string().contains("crab"));
    }

    #[test]
    fn test_sources_with_parameters_and_radius() {
        let registry = ModelSetup
            .setup(&config(json!({
                "selection": {"ra": 166.1, "dec": 38.2},
                "model": {
                    "src_radius": 5.0,
                    "galdiff": "custom_iem.fits",
                    "sources": [
                        {"name": "mkn421", "ra": 166.1, "dec": 38.2,
                         "spectrum_type": "LogParabola",
                         "parameters": {"norm": 3e-11, "alpha": 1.8}},
                        {"name": "far", "ra": 10.0, "dec": -40.0},
                        {"name": "halo", "ra": 166.5, "dec": 38.0,
                         "spatial_model": {"radial_gaussian": {"width": 0.3}}}
                    ]
                }
            })))
            .unwrap();

        let names: Vec<_> = registry.iter().map(Source::name).collect();
        assert_eq!(names, ["galdiff", "isodiff", "mkn421", "halo"]);

        let mkn421 = registry.get("mkn421").unwrap();
        assert_eq!(mkn421.spectrum.spectrum_type, SpectrumType::LogParabola);
        assert!((mkn421.spectrum.true_value("alpha").unwrap() - 1.8).abs() < 1e-12);
        assert!(mkn421.parameters().iter().all(|p| !p.free));

        let halo = registry.get("halo").unwrap();
        assert!(halo.spatial.is_extended());

        let galdiff = registry.get("galdiff").unwrap();
        assert_eq!(galdiff.spatial.file().map(|f| f.as_str()), Some("custom_iem.fits"));
    }

    #[test]
    fn test_unknown_parameter_in_config() {
        let err = ModelSetup
            .setup(&config(json!({
                "selection": {"ra": 0.0, "dec": 0.0},
                "model": {"sources": [
                    {"name": "a", "ra": 0.0, "dec": 0.0, "parameters": {"Eb": 1.0}}
                ]}
            })))
            .unwrap_err();
        assert!(err.to_string().contains("model.sources.a.parameters.Eb"));
    }

    #[test]
    fn test_duplicate_configured_source() {
        let err = ModelSetup
            .setup(&config(json!({
                "selection": {"ra": 0.0, "dec": 0.0},
                "model": {"sources": [
                    {"name": "a", "ra": 0.0, "dec": 0.0},
                    {"name": "A", "ra": 0.1, "dec": 0.0}
                ]}
            })))
            .unwrap_err();
        assert!(matches!(
            err,
            SetupError::Registration(RegistrationError::DuplicateName { .. })
        ));
    }

    #[test]
    fn test_closure_setup() {
        let setup = |_: &ResolvedConfig| -> Result<Registry, SetupError> {
            Ok(Registry::new(SkyDir::new(1.0, 2.0), DiffuseModels::default()))
        };
        let registry = setup.setup(&config(json!({}))).unwrap();
        assert_eq!(registry.center(), SkyDir::new(1.0, 2.0));
    }
}

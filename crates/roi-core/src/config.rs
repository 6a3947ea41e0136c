//! Analysis configuration.
//!
//! - [`SelectionConfig`] - ROI center, energy range and event type
//! - [`BinningConfig`] - spatial/energy binning of the ROI
//! - [`ModelConfig`] - diffuse templates and the configured source list
//! - [`OptimizerConfig`] - maximizer settings and retry policy
//! - [`SedConfig`] - SED extraction settings
//! - [`FileIoConfig`] - output locations
//! - [`AnalysisConfig`] - root configuration combining all sections
//! - [`ResolvedConfig`] - the root configuration plus one merged
//!   configuration per analysis component
//!
//! All section types implement [`Default`] and deserialize with missing
//! fields filled from those defaults.
//!
//! # Components
//!
//! A configuration document may carry a `components` entry listing
//! per-component overrides. Each override is deep-merged over the root
//! document (the component wins on conflict). A list yields components
//! `00`, `01`, ...; a map yields one component per key in sorted order; an
//! absent or empty entry yields the single component `00`.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::ConfigError;
use crate::types::{CoordSys, SpatialModel, SpectrumType};

/// Data selection: ROI center, energy range and event type.
///
/// The ROI center is taken from `target` if set, otherwise from `ra`/`dec`,
/// otherwise from `glon`/`glat`.
///
/// # Examples
///
/// ```
/// use roi_core::SelectionConfig;
///
/// let config = SelectionConfig::default();
/// assert_eq!(config.emin, 100.0);
/// assert_eq!(config.emax, 100_000.0);
/// assert!(config.target.is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// Name or alias of a configured source to center the ROI on.
    pub target: Option<String>,

    /// Right ascension of the ROI center in degrees.
    pub ra: Option<f64>,

    /// Declination of the ROI center in degrees.
    pub dec: Option<f64>,

    /// Galactic longitude of the ROI center in degrees.
    pub glon: Option<f64>,

    /// Galactic latitude of the ROI center in degrees.
    pub glat: Option<f64>,

    /// Lower energy bound in MeV.
    pub emin: f64,

    /// Upper energy bound in MeV.
    pub emax: f64,

    /// Event type selection bitmask.
    pub evtype: Option<u32>,

    /// Maximum zenith angle in degrees.
    pub zmax: Option<f64>,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            target: None,
            ra: None,
            dec: None,
            glon: None,
            glat: None,
            emin: 100.0,
            emax: 100_000.0,
            evtype: None,
            zmax: None,
        }
    }
}

/// Spatial and energy binning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BinningConfig {
    /// Width of the ROI in degrees.
    pub roiwidth: f64,

    /// Pixel size in degrees.
    pub binsz: f64,

    /// Energy bins per decade.
    pub binsperdec: u32,

    /// Coordinate system of the ROI projection.
    pub coordsys: CoordSys,
}

impl Default for BinningConfig {
    fn default() -> Self {
        Self {
            roiwidth: 10.0,
            binsz: 0.1,
            binsperdec: 8,
            coordsys: CoordSys::Cel,
        }
    }
}

/// One configured source.
///
/// Parameter values are physical values keyed by parameter name; anything not
/// listed keeps the spectrum type's default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSpec {
    /// Canonical name.
    pub name: String,

    /// Catalog associations and other alternate names.
    pub aliases: Vec<String>,

    /// Right ascension in degrees.
    pub ra: Option<f64>,

    /// Declination in degrees.
    pub dec: Option<f64>,

    /// Galactic longitude in degrees.
    pub glon: Option<f64>,

    /// Galactic latitude in degrees.
    pub glat: Option<f64>,

    /// Spectral model type.
    pub spectrum_type: SpectrumType,

    /// Spatial model; a point source when absent.
    pub spatial_model: Option<SpatialModel>,

    /// Physical parameter values.
    pub parameters: BTreeMap<String, f64>,
}

/// ROI model: diffuse templates and configured sources.
///
/// # Examples
///
/// ```
/// use roi_core::ModelConfig;
///
/// let config = ModelConfig::default();
/// assert!(config.src_radius.is_none());
/// assert!(config.sources.is_empty());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Only configured sources within this distance (degrees) of the ROI
    /// center are included. `None` includes every source.
    pub src_radius: Option<f64>,

    /// Galactic diffuse map cube.
    pub galdiff: Option<Utf8PathBuf>,

    /// Isotropic diffuse spectrum.
    pub isodiff: Option<Utf8PathBuf>,

    /// Configured sources.
    pub sources: Vec<SourceSpec>,
}

/// Maximizer settings.
///
/// # Examples
///
/// ```
/// use roi_core::OptimizerConfig;
///
/// let config = OptimizerConfig::default();
/// assert_eq!(config.optimizer, "MINUIT");
/// assert_eq!(config.retries, 3);
/// assert_eq!(config.min_fit_quality, 3);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Maximizer name, passed through to the engine.
    pub optimizer: String,

    /// Convergence tolerance.
    pub tol: f64,

    /// Maximum number of engine runs per fit while the fit quality is below
    /// the fully converged level.
    pub retries: u32,

    /// Minimum fit quality for a fit to be committed.
    pub min_fit_quality: u8,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            optimizer: "MINUIT".to_owned(),
            tol: 1e-4,
            retries: 3,
            min_fit_quality: 3,
        }
    }
}

/// SED extraction settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SedConfig {
    /// Also free the diffuse normalizations in every bin.
    pub free_diffuse: bool,

    /// Photon index of the power law fitted in each bin (positive, so `2.0`
    /// means `dN/dE ~ E^-2`).
    pub bin_index: f64,

    /// Confidence level of the per-bin upper limits.
    pub ul_confidence: f64,
}

impl Default for SedConfig {
    fn default() -> Self {
        Self {
            free_diffuse: false,
            bin_index: 2.0,
            ul_confidence: 0.95,
        }
    }
}

impl SedConfig {
    /// Checks the upper-limit confidence and the bin index.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.ul_confidence > 0.0 && self.ul_confidence < 1.0) {
            return Err(ConfigError::invalid_option(
                "sed.ul_confidence",
                "must lie strictly between 0 and 1",
            ));
        }
        if !self.bin_index.is_finite() {
            return Err(ConfigError::invalid_option("sed.bin_index", "must be finite"));
        }
        Ok(())
    }
}

/// Output locations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileIoConfig {
    /// Directory snapshots and model files are written to.
    pub outdir: Utf8PathBuf,
}

impl Default for FileIoConfig {
    fn default() -> Self {
        Self {
            outdir: Utf8PathBuf::from("."),
        }
    }
}

/// Root configuration of one analysis (or one analysis component).
///
/// # Examples
///
/// ```
/// use roi_core::AnalysisConfig;
///
/// let config: AnalysisConfig =
///     serde_json::from_str(r#"{"selection": {"ra": 166.1, "dec": 38.2}}"#).unwrap();
/// assert_eq!(config.selection.ra, Some(166.1));
/// assert_eq!(config.binning.binsperdec, 8);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Data selection.
    pub selection: SelectionConfig,

    /// Binning.
    pub binning: BinningConfig,

    /// ROI model.
    pub model: ModelConfig,

    /// Maximizer settings.
    pub optimizer: OptimizerConfig,

    /// SED extraction settings.
    pub sed: SedConfig,

    /// Output locations.
    pub fileio: FileIoConfig,
}

impl AnalysisConfig {
    /// Checks value ranges that deserialization cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sel = &self.selection;
        if !is_positive(sel.emin) {
            return Err(ConfigError::invalid_option("selection.emin", "must be positive"));
        }
        if !is_positive(sel.emax - sel.emin) {
            return Err(ConfigError::invalid_option(
                "selection.emax",
                format!("must exceed selection.emin ({})", sel.emin),
            ));
        }
        if sel.ra.is_some() != sel.dec.is_some() {
            return Err(ConfigError::invalid_option(
                "selection.ra",
                "ra and dec must be given together",
            ));
        }
        if sel.glon.is_some() != sel.glat.is_some() {
            return Err(ConfigError::invalid_option(
                "selection.glon",
                "glon and glat must be given together",
            ));
        }
        if self.binning.binsperdec == 0 {
            return Err(ConfigError::invalid_option("binning.binsperdec", "must be at least 1"));
        }
        if !is_positive(self.binning.binsz) {
            return Err(ConfigError::invalid_option("binning.binsz", "must be positive"));
        }
        if self.optimizer.retries == 0 {
            return Err(ConfigError::invalid_option("optimizer.retries", "must be at least 1"));
        }
        if self.optimizer.min_fit_quality > 3 {
            return Err(ConfigError::invalid_option(
                "optimizer.min_fit_quality",
                "must be between 0 and 3",
            ));
        }
        self.sed.validate()?;
        if self.model.src_radius.is_some_and(|r| r.is_nan() || r < 0.0) {
            return Err(ConfigError::invalid_option("model.src_radius", "must not be negative"));
        }
        for spec in &self.model.sources {
            if spec.name.trim().is_empty() {
                return Err(ConfigError::invalid_option(
                    "model.sources",
                    "source name must not be empty",
                ));
            }
        }
        Ok(())
    }

    /// Log-spaced energy bin edges (MeV) between `selection.emin` and
    /// `selection.emax`, with `binning.binsperdec` bins per decade (at least
    /// one bin).
    ///
    /// # Examples
    ///
    /// ```
    /// use roi_core::AnalysisConfig;
    ///
    /// let mut config = AnalysisConfig::default();
    /// config.selection.emin = 1000.0;
    /// config.selection.emax = 100_000.0;
    /// config.binning.binsperdec = 2;
    ///
    /// let edges = config.energy_edges();
    /// assert_eq!(edges.len(), 5);
    /// assert!((edges[2] - 10_000.0).abs() < 1e-6);
    /// ```
    #[must_use]
    pub fn energy_edges(&self) -> Vec<f64> {
        let (emin, emax) = (self.selection.emin, self.selection.emax);
        let decades = (emax / emin).log10();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let nbins = ((decades * f64::from(self.binning.binsperdec)).round() as usize).max(1);
        let mut edges: Vec<f64> = (0..=nbins)
            .map(|i| emin * 10f64.powf(decades * i as f64 / nbins as f64))
            .collect();
        // Pin the outer edges to the configured bounds.
        edges[0] = emin;
        edges[nbins] = emax;
        edges
    }
}

fn is_positive(value: f64) -> bool {
    value > 0.0
}

/// One analysis component: a configuration merged from the root document and
/// the component's overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentConfig {
    /// Component name (`00`, `01`, ... or the key of a component map).
    pub name: String,

    /// Suffix appended to per-component output files.
    pub file_suffix: String,

    /// Merged configuration.
    pub config: AnalysisConfig,
}

/// A configuration document with its components resolved.
///
/// This is the form embedded in snapshots: it carries everything needed to
/// re-run setup without the original file.
///
/// # Examples
///
/// ```
/// use roi_core::ResolvedConfig;
///
/// let resolved = ResolvedConfig::from_json(serde_json::json!({
///     "selection": {"ra": 166.1, "dec": 38.2, "emin": 100.0},
///     "components": [{"selection": {"emin": 1000.0}}, {}]
/// })).unwrap();
///
/// assert_eq!(resolved.components().len(), 2);
/// assert_eq!(resolved.components()[0].config.selection.emin, 1000.0);
/// assert_eq!(resolved.components()[1].config.selection.emin, 100.0);
/// assert_eq!(resolved.components()[0].config.selection.ra, Some(166.1));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedConfig {
    root: AnalysisConfig,
    components: Vec<ComponentConfig>,
}

impl ResolvedConfig {
    /// Resolves a configuration document.
    pub fn from_json(mut document: Value) -> Result<Self, ConfigError> {
        let overrides = document
            .as_object_mut()
            .and_then(|map| map.remove("components"))
            .unwrap_or(Value::Null);

        let root: AnalysisConfig = serde_json::from_value(document.clone())?;
        root.validate()?;

        let named: Vec<(String, Value)> = match overrides {
            Value::Null => Vec::new(),
            Value::Array(list) => list
                .into_iter()
                .enumerate()
                .map(|(i, value)| (format!("{i:02}"), value))
                .collect(),
            Value::Object(map) => {
                let mut entries: Vec<_> = map.into_iter().collect();
                entries.sort_by(|a, b| a.0.cmp(&b.0));
                entries
            }
            other => {
                return Err(ConfigError::invalid_option(
                    "components",
                    format!("expected a list or a map, found {other}"),
                ));
            }
        };

        let components = if named.is_empty() {
            vec![ComponentConfig {
                name: "00".to_owned(),
                file_suffix: "_00".to_owned(),
                config: root.clone(),
            }]
        } else {
            let mut components = Vec::with_capacity(named.len());
            for (name, overlay) in named {
                let mut merged = document.clone();
                merge_json(&mut merged, &overlay);
                let config: AnalysisConfig = serde_json::from_value(merged)?;
                config.validate()?;
                debug!(component = %name, "resolved component configuration");
                components.push(ComponentConfig {
                    file_suffix: format!("_{name}"),
                    name,
                    config,
                });
            }
            components
        };

        warn_on_overlapping_selections(&components);
        Ok(Self { root, components })
    }

    /// Parses and resolves a JSON configuration string.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        Self::from_json(serde_json::from_str(text)?)
    }

    /// Reads and resolves a JSON configuration file.
    pub fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    /// Wraps an already-built root configuration with a single component.
    pub fn single(root: AnalysisConfig) -> Result<Self, ConfigError> {
        Self::from_json(serde_json::to_value(root)?)
    }

    /// Root configuration (without component overrides).
    #[inline]
    #[must_use]
    pub fn root(&self) -> &AnalysisConfig {
        &self.root
    }

    /// Resolved components, never empty.
    #[inline]
    #[must_use]
    pub fn components(&self) -> &[ComponentConfig] {
        &self.components
    }

    /// Configuration of the first component.
    #[inline]
    #[must_use]
    pub fn primary(&self) -> &AnalysisConfig {
        self.components.first().map_or(&self.root, |c| &c.config)
    }
}

/// Deep-merges `overlay` into `base`; values from `overlay` win.
fn merge_json(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(key) {
                    Some(slot) => merge_json(slot, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (slot, value) => *slot = value.clone(),
    }
}

/// Reports components requesting the same event type.
///
/// Which of them should take precedence is undefined, so both are kept.
fn warn_on_overlapping_selections(components: &[ComponentConfig]) {
    for (i, a) in components.iter().enumerate() {
        for b in &components[i + 1..] {
            if let (Some(ea), Some(eb)) = (a.config.selection.evtype, b.config.selection.evtype) {
                if ea == eb {
                    warn!(
                        first = %a.name,
                        second = %b.name,
                        evtype = ea,
                        "components select the same event type; precedence is undefined"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let config = AnalysisConfig::default();
        assert_eq!(config.binning.binsperdec, 8);
        assert_eq!(config.optimizer.tol, 1e-4);
        assert_eq!(config.sed.bin_index, 2.0);
        assert!(!config.sed.free_diffuse);
        assert_eq!(config.fileio.outdir, ".");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_with_missing_fields() {
        let config: AnalysisConfig =
            serde_json::from_str(r#"{"optimizer": {"retries": 5}}"#).unwrap();
        assert_eq!(config.optimizer.retries, 5);
        assert_eq!(config.optimizer.optimizer, "MINUIT");
        assert_eq!(config.selection.emin, 100.0);
    }

    #[test]
    fn test_source_spec() {
        let config: AnalysisConfig = serde_json::from_value(json!({
            "model": {"sources": [{
                "name": "mkn421",
                "aliases": ["Mkn 421"],
                "ra": 166.1, "dec": 38.2,
                "spectrum_type": "LogParabola",
                "parameters": {"norm": 3e-11, "alpha": 1.8}
            }]}
        }))
        .unwrap();
        let spec = &config.model.sources[0];
        assert_eq!(spec.spectrum_type, SpectrumType::LogParabola);
        assert_eq!(spec.parameters["alpha"], 1.8);
        assert!(spec.spatial_model.is_none());
    }

    #[test]
    fn test_validate_rejects_inverted_energy_range() {
        let mut config = AnalysisConfig::default();
        config.selection.emin = 1e4;
        config.selection.emax = 1e3;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("selection.emax"));
    }

    #[test]
    fn test_validate_rejects_half_position() {
        let mut config = AnalysisConfig::default();
        config.selection.ra = Some(10.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_retries() {
        let mut config = AnalysisConfig::default();
        config.optimizer.retries = 0;
        let err = config.validate().unwrap_err();
        insta::assert_snapshot!(
            err.to_string(),
            @"invalid configuration option 'optimizer.retries': must be at least 1"
        );
    }

    #[test]
    fn test_sed_config_validation() {
        assert!(SedConfig::default().validate().is_ok());
        for ul_confidence in [0.0, 1.0, f64::NAN] {
            let sed = SedConfig { ul_confidence, ..SedConfig::default() };
            assert!(sed.validate().is_err(), "{ul_confidence}");
        }
        let mut config = AnalysisConfig::default();
        config.sed.bin_index = f64::INFINITY;
        let err = config.validate().unwrap_err();
        insta::assert_snapshot!(
            err.to_string(),
            @"invalid configuration option 'sed.bin_index': must be finite"
        );
    }

    #[test]
    fn test_energy_edges_default() {
        let edges = AnalysisConfig::default().energy_edges();
        // Three decades at eight bins per decade.
        assert_eq!(edges.len(), 25);
        assert_eq!(edges[0], 100.0);
        assert_eq!(edges[24], 100_000.0);
        assert!(edges.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_energy_edges_narrow_range_has_one_bin() {
        let mut config = AnalysisConfig::default();
        config.selection.emin = 1000.0;
        config.selection.emax = 1010.0;
        assert_eq!(config.energy_edges(), vec![1000.0, 1010.0]);
    }

    #[test]
    fn test_no_components_yields_single_component() {
        let resolved = ResolvedConfig::from_json(json!({"selection": {"emin": 300.0}})).unwrap();
        let components = resolved.components();
        assert_eq!(components.len(), 1);
        assert_eq!(components[0].name, "00");
        assert_eq!(components[0].file_suffix, "_00");
        assert_eq!(components[0].config, *resolved.root());
    }

    #[test]
    fn test_component_map_sorted_by_key() {
        let resolved = ResolvedConfig::from_json(json!({
            "components": {
                "psf3": {"selection": {"evtype": 32}},
                "psf0": {"selection": {"evtype": 4}}
            }
        }))
        .unwrap();
        let names: Vec<_> = resolved.components().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["psf0", "psf3"]);
        assert_eq!(resolved.components()[1].file_suffix, "_psf3");
        assert_eq!(resolved.components()[1].config.selection.evtype, Some(32));
    }

    #[test]
    fn test_component_wins_deep_merge() {
        let resolved = ResolvedConfig::from_json(json!({
            "selection": {"emin": 100.0, "emax": 1e5},
            "optimizer": {"retries": 2},
            "components": [{"selection": {"emin": 1000.0}}]
        }))
        .unwrap();
        let config = &resolved.components()[0].config;
        assert_eq!(config.selection.emin, 1000.0);
        assert_eq!(config.selection.emax, 1e5);
        assert_eq!(config.optimizer.retries, 2);
        assert_eq!(resolved.root().selection.emin, 100.0);
    }

    #[test]
    fn test_overlapping_evtype_is_kept() {
        let resolved = ResolvedConfig::from_json(json!({
            "components": [{"selection": {"evtype": 3}}, {"selection": {"evtype": 3}}]
        }))
        .unwrap();
        assert_eq!(resolved.components().len(), 2);
    }

    #[test]
    fn test_invalid_components_entry() {
        let err = ResolvedConfig::from_json(json!({"components": 7})).unwrap_err();
        assert!(err.to_string().contains("components"));
    }

    #[test]
    fn test_invalid_component_override_is_rejected() {
        let err = ResolvedConfig::from_json(json!({
            "components": [{"selection": {"emin": -1.0}}]
        }))
        .unwrap_err();
        assert!(err.to_string().contains("selection.emin"));
    }

    #[test]
    fn test_resolved_config_serialization() {
        let resolved = ResolvedConfig::from_json(json!({"components": [{}, {}]})).unwrap();
        let json = serde_json::to_string(&resolved).unwrap();
        let parsed: ResolvedConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, resolved);
    }

    #[test]
    fn test_load_missing_file() {
        let err = ResolvedConfig::load(Utf8Path::new("/nonexistent/roi-config.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
        assert!(err.to_string().contains("/nonexistent/roi-config.json"));
    }
}

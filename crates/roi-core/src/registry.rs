//! The source registry: the ROI model's catalog of sources.
//!
//! The registry owns every [`Source`] of an ROI in insertion order, together
//! with a precomputed index from normalized identifiers (canonical names and
//! aliases, see [`normalize_name`]) to canonical names. Resolution is a single
//! hash lookup.
//!
//! Two diffuse sources, [`GALDIFF`] and [`ISODIFF`], are created with the
//! registry and can never be removed.
//!
//! Every mutating operation validates first and mutates second, so a failed
//! call leaves the registry exactly as it was.
//!
//! ```
//! use roi_core::{DiffuseModels, Registry, SkyDir, Source, SpectralModel, SpectrumType};
//!
//! let mut registry = Registry::new(SkyDir::new(166.1, 38.2), DiffuseModels::default());
//! registry.register(
//!     Source::point(
//!         "mkn421",
//!         SkyDir::new(166.1, 38.2),
//!         SpectralModel::new(SpectrumType::LogParabola),
//!     )
//!     .with_alias("Mkn 421"),
//! )?;
//!
//! assert_eq!(registry.resolve("MKN   421")?.name(), "mkn421");
//! assert!(registry.remove("galdiff").is_err());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::debug;

use crate::error::{RegistrationError, RegistryError, ResolutionError};
use crate::hash::{FxHashMap, fx_hash_map_with_capacity};
use crate::name::normalize_name;
use crate::types::{Parameter, SkyDir, Source, SpatialModel, SpectralModel, SpectrumType};

/// Canonical name of the galactic diffuse source.
pub const GALDIFF: &str = "galdiff";

/// Canonical name of the isotropic diffuse source.
pub const ISODIFF: &str = "isodiff";

/// Template files of the two diffuse sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffuseModels {
    /// Galactic diffuse map cube.
    pub galdiff: Utf8PathBuf,
    /// Isotropic diffuse spectrum.
    pub isodiff: Utf8PathBuf,
}

impl Default for DiffuseModels {
    fn default() -> Self {
        Self {
            galdiff: Utf8PathBuf::from("gll_iem_v07.fits"),
            isodiff: Utf8PathBuf::from("iso_P8R3_SOURCE_V3_v1.txt"),
        }
    }
}

/// Identifies one parameter of one source by canonical names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParameterKey {
    /// Canonical source name.
    pub source: String,
    /// Parameter name.
    pub parameter: String,
}

impl ParameterKey {
    /// Creates a key from its parts.
    #[must_use]
    pub fn new(source: impl Into<String>, parameter: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            parameter: parameter.into(),
        }
    }
}

impl std::fmt::Display for ParameterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.source, self.parameter)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct SourceState {
    spectrum: SpectralModel,
    ts: Option<f64>,
    npred: Option<f64>,
}

/// A checkpoint of every source's spectral model, TS and predicted counts,
/// plus the ROI aggregates.
///
/// Taken with [`Registry::parameter_state`] and put back with
/// [`Registry::restore_parameter_state`]. Sources added after the checkpoint
/// are left alone by a restore.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterState {
    sources: Vec<(String, SourceState)>,
    log_likelihood: Option<f64>,
    fit_quality: Option<u8>,
}

impl ParameterState {
    /// Number of sources in the checkpoint.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Returns `true` if the checkpoint holds no sources.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

/// The ROI model: sources, ROI center and ROI-level fit aggregates.
#[derive(Debug, Clone)]
pub struct Registry {
    center: SkyDir,
    sources: Vec<Source>,
    /// Canonical name to position in `sources`.
    positions: FxHashMap<String, usize>,
    /// Normalized identifier to the canonical names it resolves to.
    keys: FxHashMap<String, SmallVec<[String; 1]>>,
    /// Log-likelihood of the last committed fit.
    pub log_likelihood: Option<f64>,
    /// Quality code of the last committed fit.
    pub fit_quality: Option<u8>,
}

impl Registry {
    /// Creates a registry centered on `center` holding only the two diffuse
    /// sources.
    ///
    /// Both diffuse sources start with every parameter fixed.
    #[must_use]
    pub fn new(center: SkyDir, diffuse: DiffuseModels) -> Self {
        Self::with_capacity(center, diffuse, 0)
    }

    /// Like [`new`](Self::new), with room for `capacity` further sources.
    #[must_use]
    pub fn with_capacity(center: SkyDir, diffuse: DiffuseModels, capacity: usize) -> Self {
        let capacity = capacity + 2;
        let mut registry = Self {
            center,
            sources: Vec::with_capacity(capacity),
            positions: fx_hash_map_with_capacity(capacity),
            keys: fx_hash_map_with_capacity(capacity * 2),
            log_likelihood: None,
            fit_quality: None,
        };
        registry.insert(galactic_diffuse(diffuse.galdiff));
        registry.insert(isotropic_diffuse(diffuse.isodiff));
        registry
    }

    /// ROI center.
    #[inline]
    #[must_use]
    pub fn center(&self) -> SkyDir {
        self.center
    }

    /// Number of sources, diffuse sources included.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Always `false`: the diffuse sources are always present.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Sources in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Source> {
        self.sources.iter()
    }

    /// Sources in registration order, mutably.
    ///
    /// Names and aliases are not reachable through this; only model state is.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Source> {
        self.sources.iter_mut()
    }

    /// Looks up a source by exact canonical name.
    #[must_use]
    pub fn get(&self, canonical: &str) -> Option<&Source> {
        self.positions.get(canonical).map(|&i| &self.sources[i])
    }

    /// Looks up a source by exact canonical name, mutably.
    pub fn get_mut(&mut self, canonical: &str) -> Option<&mut Source> {
        self.positions.get(canonical).map(|&i| &mut self.sources[i])
    }

    /// Returns `true` if `name` is one of the protected diffuse sources.
    #[inline]
    #[must_use]
    pub fn is_protected(name: &str) -> bool {
        name == GALDIFF || name == ISODIFF
    }

    /// Adds a source.
    ///
    /// # Errors
    ///
    /// - [`RegistrationError::EmptyName`] if the name or an alias is blank
    /// - [`RegistrationError::DuplicateName`] if a source with the same
    ///   (normalized) canonical name exists
    /// - [`RegistrationError::AliasCollision`] if the name or an alias
    ///   normalizes to an identifier of a different source
    pub fn register(&mut self, source: Source) -> Result<(), RegistrationError> {
        let name_key = normalize_name(source.name());
        if name_key.is_empty() {
            return Err(RegistrationError::EmptyName);
        }
        if let Some(existing) = self.owner(&name_key) {
            return Err(if normalize_name(existing) == name_key {
                RegistrationError::DuplicateName {
                    name: source.name().to_owned(),
                }
            } else {
                RegistrationError::AliasCollision {
                    alias: source.name().to_owned(),
                    existing: existing.to_owned(),
                    requested: source.name().to_owned(),
                }
            });
        }
        for alias in source.aliases() {
            let key = normalize_name(alias);
            if key.is_empty() {
                return Err(RegistrationError::EmptyName);
            }
            if let Some(existing) = self.owner(&key) {
                return Err(RegistrationError::AliasCollision {
                    alias: alias.clone(),
                    existing: existing.to_owned(),
                    requested: source.name().to_owned(),
                });
            }
        }

        debug!(source = source.name(), aliases = source.aliases().len(), "registered source");
        self.insert(source);
        Ok(())
    }

    /// Adds an alias to a registered source.
    ///
    /// Adding an identifier the source already answers to is a no-op.
    pub fn add_alias(&mut self, name: &str, alias: &str) -> Result<(), RegistryError> {
        let index = self.resolve_index(name)?;
        let canonical = self.sources[index].name().to_owned();
        let key = normalize_name(alias);
        if key.is_empty() {
            return Err(RegistrationError::EmptyName.into());
        }
        match self.owner(&key) {
            Some(existing) if existing == canonical => return Ok(()),
            Some(existing) => {
                return Err(RegistrationError::AliasCollision {
                    alias: alias.to_owned(),
                    existing: existing.to_owned(),
                    requested: canonical,
                }
                .into());
            }
            None => {}
        }
        self.sources[index].push_alias(alias.to_owned());
        self.keys.entry(key).or_default().push(canonical);
        Ok(())
    }

    /// Resolves a canonical name or alias, in any case and with any internal
    /// whitespace, to its source.
    ///
    /// # Errors
    ///
    /// [`ResolutionError::NotFound`] if nothing matches,
    /// [`ResolutionError::Ambiguous`] if the identifier maps to more than one
    /// source.
    pub fn resolve(&self, query: &str) -> Result<&Source, ResolutionError> {
        self.resolve_index(query).map(|i| &self.sources[i])
    }

    /// Like [`resolve`](Self::resolve), returning the source mutably.
    pub fn resolve_mut(&mut self, query: &str) -> Result<&mut Source, ResolutionError> {
        let index = self.resolve_index(query)?;
        Ok(&mut self.sources[index])
    }

    fn resolve_index(&self, query: &str) -> Result<usize, ResolutionError> {
        let key = normalize_name(query);
        let names = self
            .keys
            .get(&key)
            .filter(|names| !names.is_empty())
            .ok_or_else(|| ResolutionError::not_found(query))?;
        if names.len() > 1 {
            return Err(ResolutionError::Ambiguous {
                query: query.to_owned(),
                candidates: names.to_vec(),
            });
        }
        self.positions
            .get(&names[0])
            .copied()
            .ok_or_else(|| ResolutionError::not_found(query))
    }

    /// Positioned sources within `radius` degrees of `center` (inclusive), in
    /// registration order.
    ///
    /// Diffuse sources have no position and are never returned.
    #[must_use]
    pub fn sources_within(&self, center: &SkyDir, radius: f64) -> Vec<&Source> {
        self.sources
            .iter()
            .filter(|s| s.distance_to(center).is_some_and(|d| d <= radius))
            .collect()
    }

    /// Positioned sources within `radius` degrees of the named source, the
    /// source itself included.
    pub fn nearby(&self, name: &str, radius: f64) -> Result<Vec<&Source>, ResolutionError> {
        let source = self.resolve(name)?;
        Ok(match source.skydir {
            Some(dir) => self.sources_within(&dir, radius),
            None => Vec::new(),
        })
    }

    /// Removes a source and every identifier pointing to it.
    ///
    /// # Errors
    ///
    /// Resolution errors for unknown names, and
    /// [`RegistrationError::ProtectedSource`] for the diffuse sources.
    pub fn remove(&mut self, name: &str) -> Result<Source, RegistryError> {
        let index = self.resolve_index(name)?;
        let canonical = self.sources[index].name().to_owned();
        if Self::is_protected(&canonical) {
            return Err(RegistrationError::ProtectedSource { name: canonical }.into());
        }

        let source = self.sources.remove(index);
        for id in source.identifiers() {
            let key = normalize_name(id);
            if let Some(names) = self.keys.get_mut(&key) {
                names.retain(|n| *n != canonical);
                if names.is_empty() {
                    self.keys.remove(&key);
                }
            }
        }
        self.positions.remove(&canonical);
        for (i, s) in self.sources.iter().enumerate().skip(index) {
            self.positions.insert(s.name().to_owned(), i);
        }

        debug!(source = %canonical, "removed source");
        Ok(source)
    }

    /// Every currently free parameter, in registration order and model order
    /// within each source.
    #[must_use]
    pub fn free_parameters(&self) -> Vec<ParameterKey> {
        self.sources
            .iter()
            .flat_map(|s| {
                s.parameters()
                    .iter()
                    .filter(|p| p.free)
                    .map(|p| ParameterKey::new(s.name(), p.name.as_str()))
            })
            .collect()
    }

    /// Looks up a parameter by key.
    #[must_use]
    pub fn parameter(&self, key: &ParameterKey) -> Option<&Parameter> {
        self.get(&key.source)?.spectrum.parameter(&key.parameter)
    }

    /// Looks up a parameter by key, mutably.
    pub fn parameter_mut(&mut self, key: &ParameterKey) -> Option<&mut Parameter> {
        self.get_mut(&key.source)?.spectrum.parameter_mut(&key.parameter)
    }

    /// Sum of the known predicted counts over all sources.
    #[must_use]
    pub fn total_npred(&self) -> f64 {
        self.sources.iter().filter_map(|s| s.npred).sum()
    }

    /// Takes a checkpoint of all model state.
    #[must_use]
    pub fn parameter_state(&self) -> ParameterState {
        ParameterState {
            sources: self
                .sources
                .iter()
                .map(|s| {
                    let state = SourceState {
                        spectrum: s.spectrum.clone(),
                        ts: s.ts,
                        npred: s.npred,
                    };
                    (s.name().to_owned(), state)
                })
                .collect(),
            log_likelihood: self.log_likelihood,
            fit_quality: self.fit_quality,
        }
    }

    /// Restores a checkpoint taken with [`parameter_state`](Self::parameter_state).
    ///
    /// # Errors
    ///
    /// [`ResolutionError::NotFound`] if a checkpointed source has since been
    /// removed; nothing is restored in that case.
    pub fn restore_parameter_state(
        &mut self,
        state: &ParameterState,
    ) -> Result<(), ResolutionError> {
        let mut targets = Vec::with_capacity(state.sources.len());
        for (name, _) in &state.sources {
            let index = self
                .positions
                .get(name)
                .copied()
                .ok_or_else(|| ResolutionError::not_found(name.as_str()))?;
            targets.push(index);
        }
        for (index, (_, saved)) in targets.into_iter().zip(&state.sources) {
            let source = &mut self.sources[index];
            source.spectrum = saved.spectrum.clone();
            source.ts = saved.ts;
            source.npred = saved.npred;
        }
        self.log_likelihood = state.log_likelihood;
        self.fit_quality = state.fit_quality;
        Ok(())
    }

    /// Canonical name owning a normalized key.
    fn owner(&self, key: &str) -> Option<&str> {
        self.keys.get(key).and_then(|names| names.first()).map(String::as_str)
    }

    /// Appends a source and indexes its identifiers. Callers validate first.
    fn insert(&mut self, source: Source) {
        let canonical = source.name().to_owned();
        for id in source.identifiers() {
            let names = self.keys.entry(normalize_name(id)).or_default();
            if !names.contains(&canonical) {
                names.push(canonical.clone());
            }
        }
        self.positions.insert(canonical, self.sources.len());
        self.sources.push(source);
    }
}

fn galactic_diffuse(file: Utf8PathBuf) -> Source {
    let spectrum = SpectralModel {
        spectrum_type: SpectrumType::PowerLaw,
        parameters: vec![
            Parameter::new("Prefactor", 1.0, 0.1, 10.0, 1.0),
            Parameter::new("Index", 0.0, -1.0, 1.0, -1.0),
            Parameter::pinned("Scale", 1000.0, 1.0),
        ],
        file: None,
    };
    Source::diffuse(GALDIFF, SpatialModel::MapCube { file }, spectrum)
}

fn isotropic_diffuse(file: Utf8PathBuf) -> Source {
    Source::diffuse(ISODIFF, SpatialModel::Isotropic, SpectralModel::file_function(file))
}

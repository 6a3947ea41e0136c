//! Free/fixed bookkeeping for model parameters.
//!
//! A [`ParameterSelector`] is an immutable query over (source, parameter)
//! pairs. Its predicates are conjunctive and each is optional:
//!
//! - source name or alias (resolved through the registry)
//! - maximum distance from the ROI center (inclusive)
//! - minimum distance from the ROI center (exclusive)
//! - distance shape: great-circle (the default) or square, where the
//!   distance is the larger tangent-plane offset so `max_distance = d`
//!   covers an ROI-like `2d x 2d` box
//! - cuts on the last committed TS or npred, bounds inclusive; a source
//!   without the value fails the cut
//! - parameter filter: every parameter, explicit names, or the
//!   normalization / shape / index groups of each source's spectrum type
//!
//! [`ParameterControl::apply`] sets the matched parameters to the selector's
//! target state and reports how many actually changed, so applying the same
//! selector twice reports zero the second time. Only `free` flags are
//! touched.
//!
//! ```
//! use roi_core::{DiffuseModels, GALDIFF, Registry, SkyDir};
//! use roi_fit::{ParameterControl, ParameterSelector};
//!
//! let mut registry = Registry::new(SkyDir::new(0.0, 0.0), DiffuseModels::default());
//! let free_galdiff = ParameterSelector::new().name(GALDIFF).free();
//!
//! assert_eq!(registry.apply(&free_galdiff)?, 3);
//! assert_eq!(registry.apply(&free_galdiff)?, 0);
//! # Ok::<(), roi_fit::SelectionError>(())
//! ```

use roi_core::{CoordSys, GALDIFF, ISODIFF, ParameterKey, Registry, SkyDir, Source};
use tracing::debug;

use crate::error::SelectionError;

/// Which parameters of a matched source a selector covers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ParameterFilter {
    /// Every parameter.
    #[default]
    All,
    /// Parameters with these exact names.
    Names(Vec<String>),
    /// The normalization parameter.
    Norm,
    /// The shape parameters.
    Shape,
    /// The spectral index parameters.
    Index,
}

impl ParameterFilter {
    fn matches(&self, source: &Source, parameter: &str) -> bool {
        let ty = source.spectrum.spectrum_type;
        match self {
            Self::All => true,
            Self::Names(names) => names.iter().any(|n| n == parameter),
            Self::Norm => ty.norm_parameter() == parameter,
            Self::Shape => ty.shape_parameters().contains(&parameter),
            Self::Index => ty.index_parameters().contains(&parameter),
        }
    }
}

/// Fit result recorded on a source that a [`Cut`] can test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceAttribute {
    /// Test statistic.
    Ts,
    /// Predicted counts.
    Npred,
}

impl SourceAttribute {
    fn value(self, source: &Source) -> Option<f64> {
        match self {
            Self::Ts => source.ts,
            Self::Npred => source.npred,
        }
    }
}

/// Inclusive range on a [`SourceAttribute`]; an open end is unbounded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cut {
    /// Attribute tested.
    pub attribute: SourceAttribute,
    /// Lower bound.
    pub min: Option<f64>,
    /// Upper bound.
    pub max: Option<f64>,
}

impl Cut {
    /// Whether `source` passes. Missing values fail.
    #[must_use]
    pub fn passes(&self, source: &Source) -> bool {
        let Some(value) = self.attribute.value(source) else {
            return false;
        };
        self.min.is_none_or(|min| value >= min) && self.max.is_none_or(|max| value <= max)
    }
}

/// How distance from the ROI center is measured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DistanceShape {
    /// Great-circle separation.
    #[default]
    Circle,
    /// Larger of the two tangent-plane offsets in this coordinate system.
    Square(CoordSys),
}

impl DistanceShape {
    fn distance(self, source: &Source, center: &SkyDir) -> Option<f64> {
        match self {
            Self::Circle => source.distance_to(center),
            Self::Square(coordsys) => {
                let (x, y) = source.skydir?.tangent_offset(center, coordsys)?;
                Some(x.abs().max(y.abs()))
            }
        }
    }
}

/// Target state of a selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    /// Vary the parameters in fits.
    Free,
    /// Hold the parameters constant.
    Fix,
}

impl Target {
    /// Target for a `free` flag.
    #[inline]
    #[must_use]
    pub const fn from_free(free: bool) -> Self {
        if free { Self::Free } else { Self::Fix }
    }

    #[inline]
    const fn is_free(self) -> bool {
        matches!(self, Self::Free)
    }
}

/// An immutable query over (source, parameter) pairs.
///
/// Built with chained calls; an unset predicate is unconstrained.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSelector {
    name: Option<String>,
    max_distance: Option<f64>,
    min_distance: Option<f64>,
    shape: DistanceShape,
    cuts: Vec<Cut>,
    filter: ParameterFilter,
    target: Option<Target>,
}

impl ParameterSelector {
    /// Creates a selector matching every parameter of every source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts to the source with this name or alias.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Restricts to sources at most `degrees` from the ROI center.
    #[must_use]
    pub fn max_distance(mut self, degrees: f64) -> Self {
        self.max_distance = Some(degrees);
        self
    }

    /// Restricts to sources more than `degrees` from the ROI center.
    #[must_use]
    pub fn min_distance(mut self, degrees: f64) -> Self {
        self.min_distance = Some(degrees);
        self
    }

    /// Measures distances as tangent-plane box offsets in `coordsys`.
    #[must_use]
    pub fn square(self, coordsys: CoordSys) -> Self {
        self.shape(DistanceShape::Square(coordsys))
    }

    /// Sets how distances are measured.
    #[must_use]
    pub fn shape(mut self, shape: DistanceShape) -> Self {
        self.shape = shape;
        self
    }

    /// Adds an inclusive cut on `attribute`. Cuts are conjunctive.
    #[must_use]
    pub fn cut(mut self, attribute: SourceAttribute, min: Option<f64>, max: Option<f64>) -> Self {
        self.cuts.push(Cut { attribute, min, max });
        self
    }

    /// Restricts to parameters with these names.
    #[must_use]
    pub fn parameters<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filter = ParameterFilter::Names(names.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the parameter filter.
    #[must_use]
    pub fn filter(mut self, filter: ParameterFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Targets the free state.
    #[must_use]
    pub fn free(self) -> Self {
        self.target(Target::Free)
    }

    /// Targets the fixed state.
    #[must_use]
    pub fn fix(self) -> Self {
        self.target(Target::Fix)
    }

    /// Sets the target state.
    #[must_use]
    pub fn target(mut self, target: Target) -> Self {
        self.target = Some(target);
        self
    }

    /// Target state, if set.
    #[inline]
    #[must_use]
    pub fn target_state(&self) -> Option<Target> {
        self.target
    }

    fn distance_ok(&self, source: &Source, center: &SkyDir) -> bool {
        if self.max_distance.is_none() && self.min_distance.is_none() {
            return true;
        }
        let Some(distance) = self.shape.distance(source, center) else {
            return false;
        };
        self.max_distance.is_none_or(|max| distance <= max)
            && self.min_distance.is_none_or(|min| distance > min)
    }

    /// Sources matching the name, distance and cut predicates, in registry
    /// order.
    fn matched_sources<'r>(
        &self,
        registry: &'r Registry,
    ) -> Result<Vec<&'r Source>, SelectionError> {
        let center = registry.center();
        let candidates: Vec<&Source> = match &self.name {
            Some(name) => vec![registry.resolve(name)?],
            None => registry.iter().collect(),
        };
        Ok(candidates
            .into_iter()
            .filter(|s| self.distance_ok(s, &center))
            .filter(|s| self.cuts.iter().all(|cut| cut.passes(s)))
            .collect())
    }

    /// Evaluates the selector without mutating anything.
    ///
    /// # Errors
    ///
    /// - [`SelectionError::Resolution`] if the name does not resolve
    /// - [`SelectionError::UnknownParameter`] if a named parameter belongs to
    ///   none of the matched sources (or, when no source matched, to none of
    ///   the registry's sources)
    pub fn resolve(&self, registry: &Registry) -> Result<Vec<ParameterKey>, SelectionError> {
        let sources = self.matched_sources(registry)?;

        if let ParameterFilter::Names(names) = &self.filter {
            let checked: Vec<&Source> = if sources.is_empty() {
                registry.iter().collect()
            } else {
                sources.clone()
            };
            for name in names {
                if !checked.iter().any(|s| s.spectrum.has_parameter(name)) {
                    return Err(SelectionError::UnknownParameter {
                        parameter: name.clone(),
                        sources: checked.iter().map(|s| s.name().to_owned()).collect(),
                    });
                }
            }
        }

        Ok(sources
            .iter()
            .flat_map(|s| {
                s.parameters()
                    .iter()
                    .filter(|p| self.filter.matches(s, &p.name))
                    .map(|p| ParameterKey::new(s.name(), p.name.as_str()))
            })
            .collect())
    }
}

/// Free/fix operations on a registry.
pub trait ParameterControl {
    /// Sets every parameter matched by `selector` to its target state.
    ///
    /// Returns the number of parameters whose state changed. Nothing changes
    /// on error.
    ///
    /// # Errors
    ///
    /// [`SelectionError::MissingTarget`] if the selector has no target, and
    /// the errors of [`ParameterSelector::resolve`].
    fn apply(&mut self, selector: &ParameterSelector) -> Result<usize, SelectionError>;

    /// Frees or fixes parameters of one source.
    fn free_source(
        &mut self,
        name: &str,
        free: bool,
        filter: ParameterFilter,
    ) -> Result<usize, SelectionError> {
        let selector = ParameterSelector::new()
            .name(name)
            .filter(filter)
            .target(Target::from_free(free));
        self.apply(&selector)
    }

    /// Frees or fixes the normalization of one source.
    fn free_norm(&mut self, name: &str, free: bool) -> Result<usize, SelectionError> {
        self.free_source(name, free, ParameterFilter::Norm)
    }

    /// Frees or fixes the shape parameters of one source.
    fn free_shape(&mut self, name: &str, free: bool) -> Result<usize, SelectionError> {
        self.free_source(name, free, ParameterFilter::Shape)
    }

    /// Frees or fixes the index parameters of one source.
    fn free_index(&mut self, name: &str, free: bool) -> Result<usize, SelectionError> {
        self.free_source(name, free, ParameterFilter::Index)
    }

    /// Frees or fixes the normalizations of both diffuse sources.
    fn free_diffuse_norms(&mut self, free: bool) -> Result<usize, SelectionError> {
        Ok(self.free_norm(GALDIFF, free)? + self.free_norm(ISODIFF, free)?)
    }

    /// Fixes every parameter of every source.
    fn fix_all(&mut self) -> usize;
}

impl ParameterControl for Registry {
    fn apply(&mut self, selector: &ParameterSelector) -> Result<usize, SelectionError> {
        let target = selector.target.ok_or(SelectionError::MissingTarget)?;
        let keys = selector.resolve(self)?;

        let mut toggled = 0;
        for key in &keys {
            if let Some(par) = self.parameter_mut(key) {
                if par.set_free(target.is_free()) {
                    debug!(parameter = %key, free = par.free, "toggled parameter");
                    toggled += 1;
                }
            }
        }
        Ok(toggled)
    }

    fn fix_all(&mut self) -> usize {
        let mut toggled = 0;
        for source in self.iter_mut() {
            for par in &mut source.spectrum.parameters {
                if par.set_free(false) {
                    toggled += 1;
                }
            }
        }
        toggled
    }
}

//! Spectral model parameters.

use serde::{Deserialize, Serialize};

/// A single model parameter with its fit state.
///
/// Values and bounds are stored in the parameter's own units; the physical
/// value is `value * scale`. This is the representation the likelihood engine
/// works in, which keeps well-conditioned mantissas for quantities such as
/// flux prefactors of order `1e-12`.
///
/// New parameters are fixed.
///
/// # Examples
///
/// ```
/// use roi_core::Parameter;
///
/// let prefactor = Parameter::from_physical("Prefactor", 3.2e-11, 0.01, 100.0);
/// assert_eq!(prefactor.scale, 1e-11);
/// assert!((prefactor.true_value() - 3.2e-11).abs() < 1e-24);
/// assert!(!prefactor.free);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    /// Parameter name, unique within its spectral model.
    pub name: String,
    /// Current value in parameter units.
    #[serde(with = "crate::lossless")]
    pub value: f64,
    /// One-sigma error from the last committed fit, in parameter units.
    #[serde(default, with = "crate::lossless::option")]
    pub error: Option<f64>,
    /// Lower bound in parameter units.
    #[serde(with = "crate::lossless")]
    pub min: f64,
    /// Upper bound in parameter units.
    #[serde(with = "crate::lossless")]
    pub max: f64,
    /// Multiplier converting parameter units to physical units.
    #[serde(with = "crate::lossless")]
    pub scale: f64,
    /// Whether the parameter is varied during a fit.
    pub free: bool,
}

impl Parameter {
    /// Creates a fixed parameter, widening the bounds to contain `value`.
    #[must_use]
    pub fn new(name: impl Into<String>, value: f64, min: f64, max: f64, scale: f64) -> Self {
        Self {
            name: name.into(),
            value,
            error: None,
            min: min.min(value),
            max: max.max(value),
            scale,
            free: false,
        }
    }

    /// Creates a parameter from a physical value, choosing the scale as the
    /// power of ten closest to the value.
    ///
    /// Non-positive values keep a unit scale.
    #[must_use]
    pub fn from_physical(name: impl Into<String>, physical: f64, min: f64, max: f64) -> Self {
        let (value, scale) = split_scale(physical);
        Self::new(name, value, min, max, scale)
    }

    /// Creates a parameter pinned at `value` (both bounds equal to the value).
    #[must_use]
    pub fn pinned(name: impl Into<String>, value: f64, scale: f64) -> Self {
        Self::new(name, value, value, value, scale)
    }

    /// Physical value (`value * scale`).
    #[inline]
    #[must_use]
    pub fn true_value(&self) -> f64 {
        self.value * self.scale
    }

    /// Physical error, if an error has been committed.
    #[inline]
    #[must_use]
    pub fn true_error(&self) -> Option<f64> {
        self.error.map(|e| (e * self.scale).abs())
    }

    /// Sets the free flag and returns `true` if it changed.
    #[inline]
    pub fn set_free(&mut self, free: bool) -> bool {
        let changed = self.free != free;
        self.free = free;
        changed
    }

    /// Returns `true` if `value` lies within the bounds.
    #[inline]
    #[must_use]
    pub fn in_bounds(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    /// Describes the first inconsistency in the parameter's numeric state,
    /// or `None` if it is usable in a fit.
    ///
    /// Bounds may be infinite but not NaN, and `min` must not exceed `max`.
    /// The value and a committed error must be finite, the scale finite and
    /// non-zero.
    #[must_use]
    pub fn inconsistency(&self) -> Option<String> {
        if self.min.is_nan() || self.max.is_nan() {
            return Some(format!("bounds [{}, {}] contain NaN", self.min, self.max));
        }
        if self.min > self.max {
            return Some(format!("bounds are inverted: min {} > max {}", self.min, self.max));
        }
        if !self.value.is_finite() {
            return Some(format!("value {} is not finite", self.value));
        }
        if let Some(error) = self.error.filter(|e| !e.is_finite()) {
            return Some(format!("error {error} is not finite"));
        }
        if !self.scale.is_finite() || self.scale == 0.0 {
            return Some(format!("scale {} is not a finite non-zero number", self.scale));
        }
        None
    }
}

/// Splits a physical value into `(mantissa, scale)`.
fn split_scale(physical: f64) -> (f64, f64) {
    if physical > 0.0 && physical.is_finite() {
        #[allow(clippy::cast_possible_truncation)] // |exponent| < 400 for finite f64
        let exponent = (1.0 / physical).log10().round() as i32;
        // Dividing by an exact power of ten lands on the nearest f64 to 1e-n.
        let scale = if exponent >= 0 {
            1.0 / 10f64.powi(exponent)
        } else {
            10f64.powi(-exponent)
        };
        (physical / scale, scale)
    } else {
        (physical, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inconsistency() {
        let mut par = Parameter::new("Index", 2.0, 0.0, 5.0, -1.0);
        assert_eq!(par.inconsistency(), None);

        par.max = f64::INFINITY;
        par.min = f64::NEG_INFINITY;
        assert_eq!(par.inconsistency(), None);

        par.min = 5.0;
        par.max = 1.0;
        assert_eq!(par.inconsistency().unwrap(), "bounds are inverted: min 5 > max 1");

        par.max = f64::NAN;
        assert!(par.inconsistency().unwrap().contains("NaN"));

        let mut par = Parameter::new("Index", 2.0, 0.0, 5.0, 0.0);
        assert!(par.inconsistency().unwrap().starts_with("scale"));
        par.scale = 1.0;
        par.error = Some(f64::NAN);
        assert!(par.inconsistency().unwrap().starts_with("error"));
    }

    #[test]
    fn test_new_is_fixed_and_widens_bounds() {
        let par = Parameter::new("Index", 6.0, 0.0, 5.0, -1.0);
        assert!(!par.free);
        assert!(par.error.is_none());
        assert_eq!(par.max, 6.0);
        assert_eq!(par.min, 0.0);
    }

    #[test]
    fn test_from_physical_splits_scale() {
        let par = Parameter::from_physical("Prefactor", 4.5e-12, 0.01, 100.0);
        assert_eq!(par.scale, 1e-12);
        assert!((par.value - 4.5).abs() < 1e-12);
    }

    #[test]
    fn test_from_physical_non_positive_keeps_unit_scale() {
        let par = Parameter::from_physical("alpha", -0.3, -5.0, 5.0);
        assert_eq!(par.scale, 1.0);
        assert_eq!(par.value, -0.3);
    }

    #[test]
    fn test_true_value_and_error() {
        let mut par = Parameter::new("Index", 2.2, 0.0, 5.0, -1.0);
        par.error = Some(0.1);
        assert!((par.true_value() + 2.2).abs() < 1e-12);
        assert_eq!(par.true_error(), Some(0.1));
    }

    #[test]
    fn test_set_free_reports_change() {
        let mut par = Parameter::new("norm", 1.0, 0.01, 100.0, 1e-12);
        assert!(par.set_free(true));
        assert!(!par.set_free(true));
        assert!(par.set_free(false));
    }

    #[test]
    fn test_pinned() {
        let par = Parameter::pinned("Scale", 1000.0, 1.0);
        assert_eq!(par.min, 1000.0);
        assert_eq!(par.max, 1000.0);
        assert!(par.in_bounds(1000.0));
        assert!(!par.in_bounds(1000.1));
    }
}

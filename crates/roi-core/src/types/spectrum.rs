//! Spectral models and their parameter tables.
//!
//! Each [`SpectrumType`] carries a fixed, ordered parameter list with default
//! values and bounds, and classifies its parameters into the groups that
//! parameter selection works with:
//!
//! | type               | norm            | shape                         | index               |
//! |--------------------|-----------------|-------------------------------|---------------------|
//! | `ConstantValue`    | `Value`         |                               |                     |
//! | `PowerLaw`         | `Prefactor`     | `Index`                       | `Index`             |
//! | `PowerLaw2`        | `Integral`      | `Index`                       | `Index`             |
//! | `LogParabola`      | `norm`          | `alpha`, `beta`, `Eb`         | `alpha`, `beta`     |
//! | `PLSuperExpCutoff` | `Prefactor`     | `Index1`, `Index2`, `Cutoff`  | `Index1`, `Index2`  |
//! | `FileFunction`     | `Normalization` |                               |                     |

use std::fmt;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use super::Parameter;

/// Functional form of a source spectrum.
///
/// Variant names match the model names used by the likelihood engine's own
/// model files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpectrumType {
    /// Energy-independent scaling of a template.
    ConstantValue,
    /// `dN/dE = Prefactor (E / Scale)^Index`.
    #[default]
    PowerLaw,
    /// Power law normalized by its integral between two energies.
    PowerLaw2,
    /// `dN/dE = norm (E / Eb)^-(alpha + beta ln(E / Eb))`.
    LogParabola,
    /// Power law with a super-exponential cutoff.
    PLSuperExpCutoff,
    /// Tabulated spectrum read from a file, with a free normalization.
    FileFunction,
}

/// Default table entry: `(name, value, min, max, scale)`.
type ParDefault = (&'static str, f64, f64, f64, f64);

const CONSTANT_VALUE: &[ParDefault] = &[("Value", 1.0, 0.01, 100.0, 1.0)];

const POWER_LAW: &[ParDefault] = &[
    ("Prefactor", 1.0, 0.01, 100.0, 1e-12),
    ("Index", 2.0, 0.0, 5.0, -1.0),
    ("Scale", 1000.0, 30.0, 5e5, 1.0),
];

const POWER_LAW2: &[ParDefault] = &[
    ("Integral", 1.0, 0.01, 100.0, 1e-8),
    ("Index", 2.0, 0.0, 5.0, -1.0),
    ("LowerLimit", 100.0, 20.0, 1e6, 1.0),
    ("UpperLimit", 1e5, 20.0, 1e6, 1.0),
];

const LOG_PARABOLA: &[ParDefault] = &[
    ("norm", 1.0, 0.01, 100.0, 1e-12),
    ("alpha", 0.0, -5.0, 5.0, 1.0),
    ("beta", 0.0, -10.0, 10.0, 1.0),
    ("Eb", 1.0, 0.01, 10.0, 1000.0),
];

const PL_SUPER_EXP_CUTOFF: &[ParDefault] = &[
    ("Prefactor", 1.0, 0.01, 100.0, 1e-12),
    ("Index1", 2.0, 0.0, 5.0, -1.0),
    ("Scale", 1000.0, 30.0, 5e5, 1.0),
    ("Cutoff", 1.0, 0.01, 10.0, 1000.0),
    ("Index2", 1.0, 0.0, 2.0, 1.0),
];

const FILE_FUNCTION: &[ParDefault] = &[("Normalization", 1.0, 0.001, 1000.0, 1.0)];

impl SpectrumType {
    /// Every supported spectrum type.
    pub const ALL: [Self; 6] = [
        Self::ConstantValue,
        Self::PowerLaw,
        Self::PowerLaw2,
        Self::LogParabola,
        Self::PLSuperExpCutoff,
        Self::FileFunction,
    ];

    /// Returns the model name as used in model files.
    #[inline]
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::ConstantValue => "ConstantValue",
            Self::PowerLaw => "PowerLaw",
            Self::PowerLaw2 => "PowerLaw2",
            Self::LogParabola => "LogParabola",
            Self::PLSuperExpCutoff => "PLSuperExpCutoff",
            Self::FileFunction => "FileFunction",
        }
    }

    const fn defaults(self) -> &'static [ParDefault] {
        match self {
            Self::ConstantValue => CONSTANT_VALUE,
            Self::PowerLaw => POWER_LAW,
            Self::PowerLaw2 => POWER_LAW2,
            Self::LogParabola => LOG_PARABOLA,
            Self::PLSuperExpCutoff => PL_SUPER_EXP_CUTOFF,
            Self::FileFunction => FILE_FUNCTION,
        }
    }

    /// Ordered parameter names of this spectrum type.
    ///
    /// # Examples
    ///
    /// ```
    /// use roi_core::SpectrumType;
    ///
    /// let names: Vec<_> = SpectrumType::LogParabola.parameter_names().collect();
    /// assert_eq!(names, ["norm", "alpha", "beta", "Eb"]);
    /// ```
    pub fn parameter_names(self) -> impl Iterator<Item = &'static str> {
        self.defaults().iter().map(|(name, ..)| *name)
    }

    /// Default parameter table, all parameters fixed.
    #[must_use]
    pub fn default_parameters(self) -> Vec<Parameter> {
        self.defaults()
            .iter()
            .map(|&(name, value, min, max, scale)| Parameter::new(name, value, min, max, scale))
            .collect()
    }

    /// Name of the normalization parameter.
    #[inline]
    #[must_use]
    pub const fn norm_parameter(self) -> &'static str {
        match self {
            Self::ConstantValue => "Value",
            Self::PowerLaw | Self::PLSuperExpCutoff => "Prefactor",
            Self::PowerLaw2 => "Integral",
            Self::LogParabola => "norm",
            Self::FileFunction => "Normalization",
        }
    }

    /// Parameters that control the spectral shape.
    #[inline]
    #[must_use]
    pub const fn shape_parameters(self) -> &'static [&'static str] {
        match self {
            Self::PowerLaw | Self::PowerLaw2 => &["Index"],
            Self::LogParabola => &["alpha", "beta", "Eb"],
            Self::PLSuperExpCutoff => &["Index1", "Index2", "Cutoff"],
            Self::ConstantValue | Self::FileFunction => &[],
        }
    }

    /// Spectral index parameters (a subset of the shape parameters).
    #[inline]
    #[must_use]
    pub const fn index_parameters(self) -> &'static [&'static str] {
        match self {
            Self::PowerLaw | Self::PowerLaw2 => &["Index"],
            Self::LogParabola => &["alpha", "beta"],
            Self::PLSuperExpCutoff => &["Index1", "Index2"],
            Self::ConstantValue | Self::FileFunction => &[],
        }
    }
}

impl fmt::Display for SpectrumType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A spectrum type together with its current parameter values.
///
/// # Examples
///
/// ```
/// use roi_core::{SpectralModel, SpectrumType};
///
/// let mut model = SpectralModel::new(SpectrumType::PowerLaw);
/// assert!(model.set_true_value("Prefactor", 2e-11));
/// assert!(model.set_true_value("Index", -2.5));
///
/// let dnde = model.dnde(1000.0).unwrap();
/// assert!((dnde - 2e-11).abs() < 1e-24);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectralModel {
    /// Functional form.
    pub spectrum_type: SpectrumType,
    /// Parameters in the order defined by the spectrum type.
    pub parameters: Vec<Parameter>,
    /// Tabulated spectrum for [`SpectrumType::FileFunction`].
    pub file: Option<Utf8PathBuf>,
}

impl SpectralModel {
    /// Creates a model with the default parameter table.
    #[must_use]
    pub fn new(spectrum_type: SpectrumType) -> Self {
        Self {
            spectrum_type,
            parameters: spectrum_type.default_parameters(),
            file: None,
        }
    }

    /// Creates a file-function model reading its spectrum from `file`.
    #[must_use]
    pub fn file_function(file: impl Into<Utf8PathBuf>) -> Self {
        Self {
            file: Some(file.into()),
            ..Self::new(SpectrumType::FileFunction)
        }
    }

    /// Looks up a parameter by exact name.
    #[must_use]
    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Looks up a parameter by exact name, mutably.
    pub fn parameter_mut(&mut self, name: &str) -> Option<&mut Parameter> {
        self.parameters.iter_mut().find(|p| p.name == name)
    }

    /// Returns `true` if the model has a parameter called `name`.
    #[inline]
    #[must_use]
    pub fn has_parameter(&self, name: &str) -> bool {
        self.parameter(name).is_some()
    }

    /// Physical value of a parameter.
    #[must_use]
    pub fn true_value(&self, name: &str) -> Option<f64> {
        self.parameter(name).map(Parameter::true_value)
    }

    /// Sets a parameter from a physical value.
    ///
    /// Normalization parameters are rescaled to the nearest power of ten;
    /// other parameters keep their conventional scale. Bounds widen to contain
    /// the new value. Returns `false` if the parameter does not exist.
    pub fn set_true_value(&mut self, name: &str, physical: f64) -> bool {
        let is_norm = name == self.spectrum_type.norm_parameter();
        let Some(par) = self.parameter_mut(name) else {
            return false;
        };

        if is_norm && physical > 0.0 {
            let rescaled = Parameter::from_physical(name, physical, par.min, par.max);
            par.value = rescaled.value;
            par.scale = rescaled.scale;
        } else {
            par.value = physical / par.scale;
        }
        par.min = par.min.min(par.value);
        par.max = par.max.max(par.value);
        true
    }

    /// Number of free parameters.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.parameters.iter().filter(|p| p.free).count()
    }

    /// Differential flux `dN/dE` at `energy` (MeV), in the model's physical
    /// units.
    ///
    /// Returns `None` for tabulated spectra or when a required parameter is
    /// missing.
    #[must_use]
    pub fn dnde(&self, energy: f64) -> Option<f64> {
        let tv = |name| self.true_value(name);
        match self.spectrum_type {
            SpectrumType::ConstantValue => tv("Value"),
            SpectrumType::PowerLaw => {
                Some(tv("Prefactor")? * (energy / tv("Scale")?).powf(tv("Index")?))
            }
            SpectrumType::PowerLaw2 => {
                let integral = tv("Integral")?;
                let index = tv("Index")?;
                let (emin, emax) = (tv("LowerLimit")?, tv("UpperLimit")?);
                let gamma = index + 1.0;
                if gamma.abs() < 1e-9 {
                    Some(integral / (energy * (emax / emin).ln()))
                } else {
                    let span = emax.powf(gamma) - emin.powf(gamma);
                    Some(integral * gamma * energy.powf(index) / span)
                }
            }
            SpectrumType::LogParabola => {
                let x = energy / tv("Eb")?;
                Some(tv("norm")? * x.powf(-(tv("alpha")? + tv("beta")? * x.ln())))
            }
            SpectrumType::PLSuperExpCutoff => {
                let shape = (energy / tv("Scale")?).powf(tv("Index1")?);
                let cutoff = (-(energy / tv("Cutoff")?).powf(tv("Index2")?)).exp();
                Some(tv("Prefactor")? * shape * cutoff)
            }
            SpectrumType::FileFunction => None,
        }
    }
}

/// Integral of `prefactor (E / scale)^index` between `emin` and `emax`.
///
/// `index` is the physical (signed) index.
///
/// # Examples
///
/// ```
/// use roi_core::power_law_flux;
///
/// // A flat spectrum integrates to its width.
/// assert!((power_law_flux(1.0, 0.0, 1000.0, 100.0, 200.0) - 100.0).abs() < 1e-9);
/// ```
#[must_use]
pub fn power_law_flux(prefactor: f64, index: f64, scale: f64, emin: f64, emax: f64) -> f64 {
    let gamma = index + 1.0;
    if gamma.abs() < 1e-9 {
        prefactor * scale * (emax / emin).ln()
    } else {
        prefactor * scale / gamma * ((emax / scale).powf(gamma) - (emin / scale).powf(gamma))
    }
}

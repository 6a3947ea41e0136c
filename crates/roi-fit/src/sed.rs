//! Per-energy-bin spectral energy distribution.
//!
//! Each bin is an independent refit: the target's spectrum is swapped for a
//! power law with only its prefactor free, the fit is restricted to the bin,
//! and the registry is put back exactly as it was before the next bin starts.
//! A failed bin is recorded and the sequence moves on.
//!
//! After each bin fit the likelihood is profiled along the prefactor with
//! every other parameter held at its best-fit value. Asymmetric errors come
//! from the points where the profile drops by 0.5, the upper limit from the
//! drop matching the configured confidence. When the profile never drops far
//! enough, the upper limit falls back to the Gaussian `norm + z * sigma`.

use std::iter::FusedIterator;

use roi_core::{
    Parameter, ParameterKey, ParameterState, Registry, ResolutionError, SedConfig, SpectralModel,
    SpectrumType, power_law_flux,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::engine::{FitProblem, Objective};
use crate::error::{EngineError, FitError};
use crate::fitter::Fitter;
use crate::handle::RegistryHandle;
use crate::selector::{ParameterControl, ParameterFilter};

const PREFACTOR: &str = "Prefactor";

/// Fallback dN/dE at the bin center when the target's model cannot be
/// evaluated there (tabulated or non-positive spectra).
const FALLBACK_DNDE: f64 = 1e-12;

/// Predicted counts below which the profile spans four decades and starts
/// at zero.
const FEW_COUNTS: f64 = 10.0;

/// Profile points, zero excluded.
const PROFILE_POINTS: usize = 101;

/// Log-likelihood drop bounding the one-sigma interval.
const ONE_SIGMA_DLNL: f64 = 0.5;

/// One point of the prefactor likelihood profile.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProfilePoint {
    /// dN/dE at the bin center.
    pub dnde: f64,
    /// Integral flux over the bin.
    pub flux: f64,
    /// Log-likelihood relative to the profile maximum.
    pub delta_log_likelihood: f64,
}

/// Measurement in one successful bin. Fluxes in ph/cm²/s, dN/dE in
/// ph/cm²/s/MeV, E² dN/dE in MeV/cm²/s.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BinMeasurement {
    /// Integral flux over the bin.
    pub flux: f64,
    /// Symmetric one-sigma flux error from the fit.
    pub flux_err: Option<f64>,
    /// Lower one-sigma flux error from the profile.
    pub flux_err_lo: Option<f64>,
    /// Upper one-sigma flux error from the profile.
    pub flux_err_hi: Option<f64>,
    /// Flux upper limit at the configured confidence.
    pub flux_ul: Option<f64>,
    /// Differential flux at the bin center.
    pub dnde: f64,
    /// One-sigma error on `dnde`.
    pub dnde_err: Option<f64>,
    /// `E² dN/dE` at the bin center.
    pub e2dnde: f64,
    /// One-sigma error on `e2dnde`.
    pub e2dnde_err: Option<f64>,
    /// Lower one-sigma error on `e2dnde` from the profile.
    pub e2dnde_err_lo: Option<f64>,
    /// Upper one-sigma error on `e2dnde` from the profile.
    pub e2dnde_err_hi: Option<f64>,
    /// Upper limit on `e2dnde`.
    pub e2dnde_ul: Option<f64>,
    /// Test statistic against zero normalization.
    pub ts: f64,
    /// Predicted counts of the target in the bin, if the engine reports them.
    pub npred: Option<f64>,
    /// Log-likelihood of the bin fit.
    pub log_likelihood: f64,
    /// Fit quality code of the bin fit.
    pub fit_quality: u8,
    /// Prefactor likelihood profile, ascending in `dnde`.
    pub profile: Vec<ProfilePoint>,
}

/// Outcome of one bin.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BinOutcome {
    /// The bin fit converged.
    Measured(BinMeasurement),
    /// The bin fit failed; the registry was restored.
    Failed {
        /// Engine diagnostic code, `-1` for failures outside the engine.
        code: i32,
        /// Failure description.
        message: String,
    },
}

/// One energy bin of a SED.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SedBin {
    /// Lower edge in MeV.
    pub emin: f64,
    /// Upper edge in MeV.
    pub emax: f64,
    /// Logarithmic center in MeV.
    pub ectr: f64,
    /// What the bin fit produced.
    pub outcome: BinOutcome,
}

impl SedBin {
    /// The measurement, if the bin fit succeeded.
    #[must_use]
    pub fn measurement(&self) -> Option<&BinMeasurement> {
        match &self.outcome {
            BinOutcome::Measured(m) => Some(m),
            BinOutcome::Failed { .. } => None,
        }
    }

    /// Returns `true` if the bin fit failed.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, BinOutcome::Failed { .. })
    }
}

/// Bin edges and center, MeV.
#[derive(Debug, Clone, Copy)]
struct Bin {
    emin: f64,
    emax: f64,
    ectr: f64,
}

impl Bin {
    fn new(emin: f64, emax: f64) -> Self {
        Self {
            emin,
            emax,
            ectr: (emin * emax).sqrt(),
        }
    }
}

/// Extracts SEDs with one fitter and one SED configuration.
#[derive(Debug)]
pub struct SedExtractor<'f> {
    fitter: Fitter<'f>,
    config: SedConfig,
}

impl<'f> SedExtractor<'f> {
    /// Creates an extractor.
    ///
    /// # Errors
    ///
    /// [`FitError::InvalidSedConfig`] if `config` fails
    /// [`SedConfig::validate`].
    pub fn new(fitter: Fitter<'f>, config: SedConfig) -> Result<Self, FitError> {
        config
            .validate()
            .map_err(|e| FitError::InvalidSedConfig { reason: e.to_string() })?;
        Ok(Self { fitter, config })
    }

    /// Lazy sequence of bin results for `source` over `edges` (MeV).
    ///
    /// Nothing is fitted until the iterator is advanced. The configured
    /// binning is [`roi_core::AnalysisConfig::energy_edges`].
    ///
    /// # Errors
    ///
    /// [`FitError::InvalidEnergyBins`] unless `edges` holds at least two
    /// finite, positive, strictly increasing values;
    /// [`FitError::Resolution`] if `source` does not resolve.
    pub fn bins<'s>(
        &'s self,
        handle: &'s RegistryHandle,
        source: &str,
        edges: &[f64],
    ) -> Result<SedBins<'s, 'f>, FitError> {
        validate_edges(edges)?;
        let (name, model) = {
            let registry = handle.read();
            let target = registry.resolve(source)?;
            (target.name().to_owned(), target.spectrum.clone())
        };
        Ok(SedBins {
            extractor: self,
            handle,
            source: name,
            model,
            edges: edges.to_vec(),
            next: 0,
        })
    }

    /// Fits every bin and collects the results in order.
    ///
    /// # Errors
    ///
    /// As [`bins`](Self::bins). Failed bins are part of the result, not
    /// errors.
    pub fn run(
        &self,
        handle: &RegistryHandle,
        source: &str,
        edges: &[f64],
    ) -> Result<Vec<SedBin>, FitError> {
        let bins: Vec<SedBin> = self.bins(handle, source, edges)?.collect();
        let failed = bins.iter().filter(|b| b.is_failed()).count();
        info!(source, bins = bins.len(), failed, "SED complete");
        Ok(bins)
    }

    /// Replaces the target's spectrum with the bin power law and frees its
    /// prefactor. Returns the checkpoint to restore afterwards.
    fn prepare(
        &self,
        registry: &mut Registry,
        source: &str,
        model: &SpectralModel,
        bin: Bin,
    ) -> Result<ParameterState, FitError> {
        let checkpoint = registry.parameter_state();
        if let Err(error) = self.reconfigure(registry, source, model, bin) {
            registry.restore_parameter_state(&checkpoint)?;
            return Err(error);
        }
        Ok(checkpoint)
    }

    fn reconfigure(
        &self,
        registry: &mut Registry,
        source: &str,
        model: &SpectralModel,
        bin: Bin,
    ) -> Result<(), FitError> {
        registry.fix_all();
        let target = registry
            .get_mut(source)
            .ok_or_else(|| ResolutionError::not_found(source))?;
        target.spectrum = bin_power_law(model, self.config.bin_index, bin.ectr);
        let prefactor = ParameterFilter::Names(vec![PREFACTOR.to_owned()]);
        registry.free_source(source, true, prefactor)?;
        if self.config.free_diffuse {
            registry.free_diffuse_norms(true)?;
        }
        Ok(())
    }

    fn fit_bin(
        &self,
        handle: &RegistryHandle,
        source: &str,
        model: &SpectralModel,
        bin: Bin,
    ) -> SedBin {
        let Bin { emin, emax, ectr } = bin;
        let outcome = match self.measure(handle, source, model, bin) {
            Ok(m) => {
                debug!(source, emin, emax, flux = m.flux, ts = m.ts, "SED bin measured");
                BinOutcome::Measured(m)
            }
            Err(error) => {
                warn!(source, emin, emax, %error, "SED bin failed");
                BinOutcome::Failed {
                    code: error.code(),
                    message: error.to_string(),
                }
            }
        };
        SedBin {
            emin,
            emax,
            ectr,
            outcome,
        }
    }

    fn measure(
        &self,
        handle: &RegistryHandle,
        source: &str,
        model: &SpectralModel,
        bin: Bin,
    ) -> Result<BinMeasurement, FitError> {
        let checkpoint = self.prepare(&mut handle.write(), source, model, bin)?;
        let measured = self.fit_and_read(handle, source, bin);
        handle.write().restore_parameter_state(&checkpoint)?;
        measured
    }

    fn fit_and_read(
        &self,
        handle: &RegistryHandle,
        source: &str,
        bin: Bin,
    ) -> Result<BinMeasurement, FitError> {
        let options = self
            .fitter
            .options()
            .clone()
            .with_energy_range(bin.emin, bin.emax);
        let summary = self.fitter.with_options(options).fit(handle)?;

        let key = ParameterKey::new(source, PREFACTOR);
        let par = handle
            .read()
            .parameter(&key)
            .cloned()
            .ok_or_else(|| FitError::commit(format!("parameter {key} vanished after the fit")))?;
        let index = summary
            .problem
            .index_of(&key)
            .ok_or_else(|| FitError::commit(format!("parameter {key} was not fitted")))?;
        let npred = summary
            .result
            .npred
            .iter()
            .find(|(name, _)| name == source)
            .map(|&(_, n)| n);
        let objective = self.fitter.objective();
        let best = &summary.result.values;

        // Likelihood with the normalization pinned at zero.
        let mut null_values = best.clone();
        null_values[index] = 0.0;
        let null = objective.log_likelihood(&summary.problem, &null_values)?;
        let ts = (2.0 * (summary.result.log_likelihood - null)).max(0.0);

        let grid = profile_grid(par.value, par.error, npred);
        let scan = NormScan::run(objective, &summary.problem, best, index, grid)?;

        let photon_index = -self.config.bin_index;
        let flux_of = |dnde: f64| power_law_flux(dnde, photon_index, bin.ectr, bin.emin, bin.emax);
        let e2 = bin.ectr * bin.ectr;
        let dnde = par.true_value();
        let dnde_err = par.true_error();
        let err_hi = scan
            .crossing_above(ONE_SIGMA_DLNL)
            .map(|norm| norm * par.scale - dnde);
        let err_lo = scan
            .crossing_below(ONE_SIGMA_DLNL)
            .map(|norm| dnde - norm * par.scale);

        let z = probit(self.config.ul_confidence);
        let upper = scan
            .crossing_above(0.5 * z * z)
            .map(|norm| norm * par.scale)
            .or_else(|| dnde_err.map(|e| dnde.max(0.0) + z * e));

        Ok(BinMeasurement {
            flux: flux_of(dnde),
            flux_err: dnde_err.map(flux_of),
            flux_err_lo: err_lo.map(flux_of),
            flux_err_hi: err_hi.map(flux_of),
            flux_ul: upper.map(flux_of),
            dnde,
            dnde_err,
            e2dnde: e2 * dnde,
            e2dnde_err: dnde_err.map(|e| e2 * e),
            e2dnde_err_lo: err_lo.map(|e| e2 * e),
            e2dnde_err_hi: err_hi.map(|e| e2 * e),
            e2dnde_ul: upper.map(|u| e2 * u),
            ts,
            npred,
            log_likelihood: summary.result.log_likelihood,
            fit_quality: summary.result.quality,
            profile: scan.points(par.scale, flux_of),
        })
    }
}

/// Lazy, non-restartable sequence of SED bins.
///
/// Each call to `next` runs one bin fit against the registry.
#[derive(Debug)]
pub struct SedBins<'s, 'f> {
    extractor: &'s SedExtractor<'f>,
    handle: &'s RegistryHandle,
    source: String,
    model: SpectralModel,
    edges: Vec<f64>,
    next: usize,
}

impl Iterator for SedBins<'_, '_> {
    type Item = SedBin;

    fn next(&mut self) -> Option<SedBin> {
        let (&emin, &emax) = (self.edges.get(self.next)?, self.edges.get(self.next + 1)?);
        self.next += 1;
        let bin = Bin::new(emin, emax);
        Some(self.extractor.fit_bin(self.handle, &self.source, &self.model, bin))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.edges.len().saturating_sub(self.next + 1);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for SedBins<'_, '_> {}

impl FusedIterator for SedBins<'_, '_> {}

/// Log-likelihood along the target's prefactor (parameter units) with every
/// other parameter at its best-fit value.
#[derive(Debug)]
struct NormScan {
    norms: Vec<f64>,
    log_likelihood: Vec<f64>,
    peak: usize,
}

impl NormScan {
    fn run(
        objective: &dyn Objective,
        problem: &FitProblem,
        best: &[f64],
        index: usize,
        norms: Vec<f64>,
    ) -> Result<Self, EngineError> {
        let mut values = best.to_vec();
        let mut log_likelihood = Vec::with_capacity(norms.len());
        for &norm in &norms {
            values[index] = norm;
            log_likelihood.push(objective.log_likelihood(problem, &values)?);
        }
        // First maximum, ignoring NaN.
        let mut peak = 0;
        for (i, l) in log_likelihood.iter().enumerate() {
            if log_likelihood[peak].is_nan() || *l > log_likelihood[peak] {
                peak = i;
            }
        }
        Ok(Self {
            norms,
            log_likelihood,
            peak,
        })
    }

    fn drop_at(&self, i: usize) -> f64 {
        self.log_likelihood[self.peak] - self.log_likelihood[i]
    }

    /// Prefactor above the peak where the profile has dropped by `delta`.
    fn crossing_above(&self, delta: f64) -> Option<f64> {
        self.crossing(self.peak + 1..self.norms.len(), delta)
    }

    /// Prefactor below the peak where the profile has dropped by `delta`.
    fn crossing_below(&self, delta: f64) -> Option<f64> {
        self.crossing((0..self.peak).rev(), delta)
    }

    /// Walks away from the peak and interpolates linearly between the last
    /// point short of `delta` and the first point past it.
    fn crossing(&self, steps: impl Iterator<Item = usize>, delta: f64) -> Option<f64> {
        let mut prev = self.peak;
        for i in steps {
            let (near, far) = (self.drop_at(prev), self.drop_at(i));
            if far.is_nan() {
                return None;
            }
            if far >= delta {
                let t = (delta - near) / (far - near);
                return Some(self.norms[prev] + t * (self.norms[i] - self.norms[prev]));
            }
            prev = i;
        }
        None
    }

    fn points(&self, scale: f64, flux_of: impl Fn(f64) -> f64) -> Vec<ProfilePoint> {
        let peak = self.log_likelihood[self.peak];
        self.norms
            .iter()
            .zip(&self.log_likelihood)
            .map(|(&norm, &l)| ProfilePoint {
                dnde: norm * scale,
                flux: flux_of(norm * scale),
                delta_log_likelihood: l - peak,
            })
            .collect()
    }
}

/// Prefactor grid (parameter units, ascending) for the profile.
///
/// Well-measured bins get one decade either side of the fit. Faint bins, or
/// bins without predicted counts, get two decades either side of a center
/// pushed up by `1 / npred` plus the zero point.
fn profile_grid(value: f64, error: Option<f64>, npred: Option<f64>) -> Vec<f64> {
    let decades = |center: f64, half_width: f64| {
        (0..PROFILE_POINTS).map(move |i| {
            let t = i as f64 / (PROFILE_POINTS - 1) as f64;
            center * 10f64.powf(half_width * (2.0 * t - 1.0))
        })
    };
    if value > 0.0 && npred.is_some_and(|n| n >= FEW_COUNTS) {
        return decades(value, 1.0).collect();
    }
    let center = if value > 0.0 {
        value / npred.map_or(1.0, |n| n.clamp(0.01, 1.0))
    } else {
        error.filter(|e| *e > 0.0).unwrap_or(1.0)
    };
    std::iter::once(0.0).chain(decades(center, 2.0)).collect()
}

/// Power law standing in for `model` within one bin: prefactor at the
/// model's dN/dE at `ectr`, index and scale pinned.
fn bin_power_law(model: &SpectralModel, bin_index: f64, ectr: f64) -> SpectralModel {
    let dnde = model
        .dnde(ectr)
        .filter(|v| v.is_finite() && *v > 0.0)
        .unwrap_or(FALLBACK_DNDE);
    SpectralModel {
        spectrum_type: SpectrumType::PowerLaw,
        parameters: vec![
            Parameter::from_physical(PREFACTOR, dnde, 0.0, 1e5),
            Parameter::pinned("Index", bin_index, -1.0),
            Parameter::pinned("Scale", ectr, 1.0),
        ],
        file: None,
    }
}

fn validate_edges(edges: &[f64]) -> Result<(), FitError> {
    let invalid = |reason: String| Err(FitError::InvalidEnergyBins { reason });
    if edges.len() < 2 {
        return invalid(format!("need at least two edges, got {}", edges.len()));
    }
    if let Some(edge) = edges.iter().find(|e| !e.is_finite() || **e <= 0.0) {
        return invalid(format!("edge {edge} is not a positive energy"));
    }
    if let Some(pair) = edges.windows(2).find(|w| w[0] >= w[1]) {
        return invalid(format!("edges {} and {} are not increasing", pair[0], pair[1]));
    }
    Ok(())
}

/// Inverse of the standard normal CDF (Acklam's rational approximation,
/// relative error below 1.2e-9).
#[allow(clippy::unreadable_literal)]
fn probit(p: f64) -> f64 {
    const A: [f64; 6] = [
        -3.969683028665376e1,
        2.209460984245205e2,
        -2.759285104469687e2,
        1.383577518672690e2,
        -3.066479806614716e1,
        2.506628277459239,
    ];
    const B: [f64; 5] = [
        -5.447609879822406e1,
        1.615858368580409e2,
        -1.556989798598866e2,
        6.680131188771972e1,
        -1.328068155288572e1,
    ];
    const C: [f64; 6] = [
        -7.784894002430293e-3,
        -3.223964580411365e-1,
        -2.400758277161838,
        -2.549732539343734,
        4.374664141464968,
        2.938163982698783,
    ];
    const D: [f64; 4] = [
        7.784695709041462e-3,
        3.224671290700398e-1,
        2.445134137142996,
        3.754408661907416,
    ];
    const P_LOW: f64 = 0.02425;

    let tail = |q: f64| {
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    };
    if p < P_LOW {
        tail((-2.0 * p.ln()).sqrt())
    } else if p <= 1.0 - P_LOW {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        -tail((-2.0 * (1.0 - p).ln()).sqrt())
    }
}

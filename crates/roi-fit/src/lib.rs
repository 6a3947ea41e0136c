//! Fitting over an ROI [`Registry`](roi_core::Registry).
//!
//! - [`ParameterSelector`] and [`ParameterControl`] toggle free/fixed state
//! - [`Fitter`] runs the external engine and commits results as one
//!   validated transaction
//! - [`JointFitter`] fits several components with one engine call
//! - [`SedExtractor`] refits a source bin by bin
//!
//! The engine itself stays behind the [`Maximizer`] and [`Objective`]
//! traits.

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod engine;
pub mod error;
pub mod fitter;
pub mod handle;
pub mod joint;
pub mod sed;
pub mod selector;

pub use engine::{FitOptions, FitProblem, FitResult, Maximizer, Objective, QUALITY_GOOD};
pub use error::{EngineError, FitError, SelectionError};
pub use fitter::{FitSummary, Fitter};
pub use handle::{FitPhase, RegistryHandle};
pub use joint::{JointComponent, JointFitter, JointSummary};
pub use sed::{BinMeasurement, BinOutcome, ProfilePoint, SedBin, SedBins, SedExtractor};
pub use selector::{
    Cut, DistanceShape, ParameterControl, ParameterFilter, ParameterSelector, SourceAttribute,
    Target,
};

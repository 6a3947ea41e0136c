//! Domain types for ROI models.
//!
//! - [`sky`] - sky positions and coordinate systems
//! - [`parameter`] - spectral parameters and their free/fixed state
//! - [`spectrum`] - spectral model types and parameter tables
//! - [`spatial`] - spatial models
//! - [`source`] - sources combining the above
//!
//! All public types are re-exported here and at the crate root:
//!
//! ```
//! use roi_core::{Parameter, SkyDir, Source, SpectralModel, SpectrumType};
//! ```

mod parameter;
mod sky;
mod source;
mod spatial;
mod spectrum;

pub use parameter::Parameter;
pub use sky::{CoordSys, SkyDir};
pub use source::{Aliases, Source};
pub use spatial::SpatialModel;
pub use spectrum::{SpectralModel, SpectrumType, power_law_flux};

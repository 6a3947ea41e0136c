//! Core types, configuration and the source registry for ROI likelihood
//! analyses.
//!
//! This crate provides the foundational pieces used across the workspace:
//!
//! - Error types for registry, configuration and setup failures
//! - Configuration structures and component resolution
//! - Domain types ([`Source`], [`SpectralModel`], [`Parameter`], [`SkyDir`])
//! - The [`Registry`] with its normalized name index
//! - The [`Setup`] seam and the model-only [`ModelSetup`]
//! - Type aliases for `FxHashMap`/`FxHashSet`
//! - [`lossless`] serde adapters for floats that may be infinite

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod hash;
pub mod lossless;
pub mod name;
pub mod registry;
pub mod setup;
pub mod types;

pub use config::{
    AnalysisConfig, BinningConfig, ComponentConfig, FileIoConfig, ModelConfig, OptimizerConfig,
    ResolvedConfig, SedConfig, SelectionConfig, SourceSpec,
};
pub use error::{ConfigError, RegistrationError, RegistryError, ResolutionError, SetupError};
pub use hash::{FxHashMap, FxHashSet, fx_hash_map_with_capacity, fx_hash_set_with_capacity};
pub use name::normalize_name;
pub use registry::{DiffuseModels, GALDIFF, ISODIFF, ParameterKey, ParameterState, Registry};
pub use setup::{ModelSetup, Setup};
pub use types::{
    Aliases, CoordSys, Parameter, SkyDir, Source, SpatialModel, SpectralModel, SpectrumType,
    power_law_flux,
};

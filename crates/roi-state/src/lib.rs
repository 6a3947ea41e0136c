//! Checkpointing ROI analysis state.
//!
//! A [`Snapshot`] captures the resolved configuration and every source's
//! parameter state. It is written in two encodings that decode to equal
//! values (see [`codec`]) plus an XML source library for the external
//! engine. A [`Session`] ties a configuration to the registry built from it
//! and can be rebuilt from, or overlaid with, a snapshot file.

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod codec;
pub mod error;
pub mod model_xml;
pub mod session;
pub mod snapshot;

pub use codec::{Encoding, MAGIC, restore};
pub use error::{SerializationError, SessionError};
pub use session::{Session, SnapshotFiles, load_into, read_snapshot};
pub use snapshot::{FORMAT_VERSION, RoiSummary, SOFTWARE_VERSION, Snapshot};

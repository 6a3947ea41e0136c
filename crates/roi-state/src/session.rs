//! An analysis session: one configuration and the registry it owns.
//!
//! Sessions are explicit values. Whoever needs the registry gets the session
//! (or its [`RegistryHandle`]); there is no ambient "current analysis".

use camino::{Utf8Path, Utf8PathBuf};
use roi_core::{Registry, ResolvedConfig, Setup};
use roi_fit::RegistryHandle;
use tracing::{debug, info};

use crate::codec::{self, Encoding};
use crate::error::{SerializationError, SessionError};
use crate::model_xml;
use crate::snapshot::Snapshot;

/// Paths written by one [`Session::write`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFiles {
    /// `<base>.json`
    pub text: Utf8PathBuf,
    /// `<base>.bin`
    pub binary: Utf8PathBuf,
    /// `<base>.xml`, the source library (never read back).
    pub model: Utf8PathBuf,
}

impl SnapshotFiles {
    /// File names derived from `base`.
    #[must_use]
    pub fn for_base(base: &Utf8Path) -> Self {
        Self {
            text: with_suffix(base, Encoding::Text.extension()),
            binary: with_suffix(base, Encoding::Binary.extension()),
            model: with_suffix(base, "xml"),
        }
    }
}

/// Appends `.ext` without replacing an existing extension.
fn with_suffix(base: &Utf8Path, ext: &str) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{base}.{ext}"))
}

/// Configuration plus the registry built from it.
#[derive(Debug, Clone)]
pub struct Session {
    config: ResolvedConfig,
    registry: RegistryHandle,
}

impl Session {
    /// Wraps an already-built registry.
    #[must_use]
    pub fn new(config: ResolvedConfig, registry: Registry) -> Self {
        Self {
            config,
            registry: RegistryHandle::new(registry),
        }
    }

    /// Runs `setup` on `config` and wraps the result.
    pub fn setup(config: ResolvedConfig, setup: &dyn Setup) -> Result<Self, SessionError> {
        let registry = setup.setup(&config)?;
        Ok(Self::new(config, registry))
    }

    /// Rebuilds a session from a snapshot file.
    ///
    /// Setup is re-run from the embedded configuration and the snapshot's
    /// parameter state is overlaid onto the fresh registry. This is the slow
    /// path; use [`load`](Self::load) to reuse a registry.
    pub fn create(path: &Utf8Path, setup: &dyn Setup) -> Result<Self, SessionError> {
        let snapshot = read_snapshot(path)?;
        let mut registry = setup.setup(&snapshot.config)?;
        snapshot.overlay(&mut registry)?;
        info!(%path, sources = registry.len(), "session created from snapshot");
        Ok(Self::new(snapshot.config, registry))
    }

    /// Overlays a snapshot file onto this session's registry.
    ///
    /// The session configuration is kept; only parameter state and ROI
    /// aggregates change.
    pub fn load(&self, path: &Utf8Path) -> Result<Snapshot, SerializationError> {
        load_into(&mut self.registry.write(), path)
    }

    /// The resolved configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    /// Handle to the session's registry, for fits and parameter control.
    #[inline]
    #[must_use]
    pub fn handle(&self) -> &RegistryHandle {
        &self.registry
    }

    /// Captures the current state.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::capture(&self.registry.read(), &self.config)
    }

    /// Base path for a snapshot named `name` in the configured output
    /// directory.
    #[must_use]
    pub fn output_base(&self, name: &str) -> Utf8PathBuf {
        self.config.root().fileio.outdir.join(name)
    }

    /// Writes `<base>.json`, `<base>.bin` and `<base>.xml`.
    ///
    /// Missing parent directories are created. Existing files are
    /// overwritten.
    pub fn write(&self, base: &Utf8Path) -> Result<SnapshotFiles, SerializationError> {
        let (snapshot, xml) = {
            let registry = self.registry.read();
            (Snapshot::capture(&registry, &self.config), model_xml::render(&registry))
        };
        let files = SnapshotFiles::for_base(base);

        if let Some(parent) = base.parent().filter(|p| !p.as_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| SerializationError::io(parent, e))?;
        }
        write_file(&files.text, &codec::encode(&snapshot, Encoding::Text)?)?;
        write_file(&files.binary, &codec::encode(&snapshot, Encoding::Binary)?)?;
        write_file(&files.model, xml.as_bytes())?;

        info!(%base, sources = snapshot.sources.len(), "snapshot written");
        Ok(files)
    }
}

/// Reads and decodes a snapshot file in either encoding.
pub fn read_snapshot(path: &Utf8Path) -> Result<Snapshot, SerializationError> {
    let bytes = std::fs::read(path).map_err(|e| SerializationError::io(path, e))?;
    let encoding = Encoding::detect(&bytes);
    debug!(%path, %encoding, bytes = bytes.len(), "decoding snapshot");
    codec::decode(&bytes, encoding, path.as_str())
}

/// Overlays a snapshot file onto `registry`.
///
/// The file is fully decoded and checked against the registry before
/// anything is changed.
pub fn load_into(registry: &mut Registry, path: &Utf8Path) -> Result<Snapshot, SerializationError> {
    let snapshot = read_snapshot(path)?;
    snapshot.overlay(registry)?;
    info!(%path, sources = snapshot.sources.len(), "snapshot loaded");
    Ok(snapshot)
}

fn write_file(path: &Utf8Path, bytes: &[u8]) -> Result<(), SerializationError> {
    std::fs::write(path, bytes).map_err(|e| SerializationError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_files_keep_dotted_base() {
        let files = SnapshotFiles::for_base(Utf8Path::new("out/fit.v1"));
        assert_eq!(files.text, "out/fit.v1.json");
        assert_eq!(files.binary, "out/fit.v1.bin");
        assert_eq!(files.model, "out/fit.v1.xml");
    }

    #[test]
    fn test_read_missing_file_names_path() {
        let err = read_snapshot(Utf8Path::new("does/not/exist.bin")).unwrap_err();
        assert_eq!(err.path().map(|p| p.as_str()), Some("does/not/exist.bin"));
    }
}

//! Text and binary snapshot encodings.
//!
//! Both encodings carry the same [`Snapshot`]:
//!
//! - **Text**: pretty-printed JSON.
//! - **Binary**: an 8-byte header (`ROIS` followed by the format version as a
//!   little-endian `u32`) and a `bincode` body.
//!
//! [`restore`] tells them apart by the magic and checks the format version
//! before decoding the body, so a snapshot from a newer build is reported as
//! [`SerializationError::FormatVersion`] rather than as corruption.

use std::fmt;

use serde_json::Value;

use crate::error::SerializationError;
use crate::snapshot::{FORMAT_VERSION, Snapshot};

/// Leading bytes of a binary snapshot.
pub const MAGIC: [u8; 4] = *b"ROIS";

const HEADER_LEN: usize = 8;

/// A snapshot encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    /// Pretty-printed JSON.
    Text,
    /// Header plus `bincode` body.
    Binary,
}

impl Encoding {
    /// Both encodings, in the order files are written.
    pub const ALL: [Self; 2] = [Self::Text, Self::Binary];

    /// File extension of the encoding.
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Text => "json",
            Self::Binary => "bin",
        }
    }

    /// Detects the encoding of `bytes` from the binary magic.
    #[must_use]
    pub fn detect(bytes: &[u8]) -> Self {
        if bytes.starts_with(&MAGIC) {
            Self::Binary
        } else {
            Self::Text
        }
    }

    const fn label(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Binary => "binary",
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Encodes a snapshot.
pub fn encode(snapshot: &Snapshot, encoding: Encoding) -> Result<Vec<u8>, SerializationError> {
    match encoding {
        Encoding::Text => to_text(snapshot).map(String::into_bytes),
        Encoding::Binary => to_binary(snapshot),
    }
}

/// Encodes a snapshot as pretty JSON.
pub fn to_text(snapshot: &Snapshot) -> Result<String, SerializationError> {
    serde_json::to_string_pretty(snapshot).map_err(|e| SerializationError::Encode {
        encoding: Encoding::Text.label(),
        reason: e.to_string(),
    })
}

/// Encodes a snapshot in the binary format.
pub fn to_binary(snapshot: &Snapshot) -> Result<Vec<u8>, SerializationError> {
    let body = bincode::serialize(snapshot).map_err(|e| SerializationError::Encode {
        encoding: Encoding::Binary.label(),
        reason: e.to_string(),
    })?;
    let mut bytes = Vec::with_capacity(HEADER_LEN + body.len());
    bytes.extend_from_slice(&MAGIC);
    bytes.extend_from_slice(&snapshot.format_version.to_le_bytes());
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

/// Decodes a snapshot in either encoding.
///
/// # Errors
///
/// [`SerializationError::FormatVersion`] for snapshots newer than
/// [`FORMAT_VERSION`], [`SerializationError::Corrupt`] for anything that does
/// not decode or that carries inconsistent parameters (NaN or inverted
/// bounds, a non-finite value, error or scale).
pub fn restore(bytes: &[u8]) -> Result<Snapshot, SerializationError> {
    let encoding = Encoding::detect(bytes);
    decode(bytes, encoding, encoding.label())
}

/// Like [`restore`], naming `origin` (usually a file path) in errors.
pub(crate) fn decode(
    bytes: &[u8],
    encoding: Encoding,
    origin: &str,
) -> Result<Snapshot, SerializationError> {
    let snapshot = match encoding {
        Encoding::Text => decode_text(bytes, origin)?,
        Encoding::Binary => decode_binary(bytes, origin)?,
    };
    snapshot.validate(origin)?;
    Ok(snapshot)
}

fn decode_text(bytes: &[u8], origin: &str) -> Result<Snapshot, SerializationError> {
    let document: Value =
        serde_json::from_slice(bytes).map_err(|e| SerializationError::corrupt(origin, e))?;
    let version = document
        .get("format_version")
        .and_then(Value::as_u64)
        .ok_or_else(|| SerializationError::corrupt(origin, "missing format_version"))?;
    let version = u32::try_from(version).map_err(|_| {
        SerializationError::corrupt(origin, format!("format_version {version} out of range"))
    })?;
    check_version(version, origin)?;
    serde_json::from_value(document).map_err(|e| SerializationError::corrupt(origin, e))
}

fn decode_binary(bytes: &[u8], origin: &str) -> Result<Snapshot, SerializationError> {
    let Some((header, body)) = bytes.split_at_checked(HEADER_LEN) else {
        return Err(SerializationError::corrupt(origin, "truncated header"));
    };
    let mut version = [0; 4];
    version.copy_from_slice(&header[4..]);
    let version = u32::from_le_bytes(version);
    check_version(version, origin)?;

    let snapshot: Snapshot =
        bincode::deserialize(body).map_err(|e| SerializationError::corrupt(origin, e))?;
    if snapshot.format_version != version {
        return Err(SerializationError::corrupt(
            origin,
            format!(
                "header version {version} disagrees with body version {}",
                snapshot.format_version
            ),
        ));
    }
    Ok(snapshot)
}

fn check_version(version: u32, origin: &str) -> Result<(), SerializationError> {
    if version > FORMAT_VERSION {
        return Err(SerializationError::FormatVersion {
            found: version,
            supported: FORMAT_VERSION,
        });
    }
    if version == 0 {
        return Err(SerializationError::corrupt(origin, "format version 0"));
    }
    Ok(())
}

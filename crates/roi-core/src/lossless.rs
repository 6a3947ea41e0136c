//! Serde adapters that keep non-finite floats in human-readable formats.
//!
//! JSON has no literal for infinities or NaN: `serde_json` writes them as
//! `null` and then refuses to read `null` back as a float. Unbounded
//! parameters (`max = inf`) are ordinary, so in human-readable formats these
//! adapters write non-finite values as the strings `"inf"`, `"-inf"` and
//! `"nan"`, and accept either a number or one of those strings on input.
//! Compact formats see a plain `f64`.
//!
//! ```
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Bounds {
//!     #[serde(with = "roi_core::lossless")]
//!     max: f64,
//! }
//!
//! let json = serde_json::to_string(&Bounds { max: f64::INFINITY })?;
//! assert_eq!(json, r#"{"max":"inf"}"#);
//! let back: Bounds = serde_json::from_str(&json)?;
//! assert_eq!(back.max, f64::INFINITY);
//! # Ok::<(), serde_json::Error>(())
//! ```

use std::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

const INF: &str = "inf";
const NEG_INF: &str = "-inf";
const NAN: &str = "nan";

/// Serializes an `f64`, spelling non-finite values out in human-readable
/// formats.
///
/// # Errors
///
/// Whatever the serializer reports.
#[allow(clippy::trivially_copy_pass_by_ref)] // signature fixed by `#[serde(with)]`
pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    if serializer.is_human_readable() && !value.is_finite() {
        serializer.serialize_str(label(*value))
    } else {
        serializer.serialize_f64(*value)
    }
}

/// Deserializes an `f64` written by [`serialize`].
///
/// # Errors
///
/// Anything that is neither a number nor one of the non-finite labels.
pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    if deserializer.is_human_readable() {
        deserializer.deserialize_any(FloatVisitor)
    } else {
        f64::deserialize(deserializer)
    }
}

fn label(value: f64) -> &'static str {
    if value.is_nan() {
        NAN
    } else if value > 0.0 {
        INF
    } else {
        NEG_INF
    }
}

struct FloatVisitor;

impl Visitor<'_> for FloatVisitor {
    type Value = f64;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a number or one of \"{INF}\", \"{NEG_INF}\", \"{NAN}\"")
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<f64, E> {
        Ok(v)
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<f64, E> {
        Ok(v as f64)
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<f64, E> {
        Ok(v as f64)
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<f64, E> {
        match v {
            INF => Ok(f64::INFINITY),
            NEG_INF => Ok(f64::NEG_INFINITY),
            NAN => Ok(f64::NAN),
            _ => Err(E::invalid_value(de::Unexpected::Str(v), &self)),
        }
    }
}

/// `f64` carried through the adapter inside containers.
struct Lossless(f64);

impl Serialize for Lossless {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serialize(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for Lossless {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserialize(deserializer).map(Lossless)
    }
}

/// The same adapter for `Option<f64>`. Pair with `#[serde(default)]` so a
/// missing field still reads as `None`.
pub mod option {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::Lossless;

    /// Serializes an optional `f64`.
    ///
    /// # Errors
    ///
    /// Whatever the serializer reports.
    #[allow(clippy::ref_option)] // signature fixed by `#[serde(with)]`
    pub fn serialize<S: Serializer>(value: &Option<f64>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => serializer.serialize_some(&Lossless(*v)),
            None => serializer.serialize_none(),
        }
    }

    /// Deserializes an optional `f64`.
    ///
    /// # Errors
    ///
    /// As [`super::deserialize`].
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<Lossless>::deserialize(deserializer)?.map(|l| l.0))
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Sample {
        #[serde(with = "crate::lossless")]
        value: f64,
        #[serde(default, with = "crate::lossless::option")]
        error: Option<f64>,
    }

    #[test]
    fn test_text_spells_out_non_finite_values() {
        let sample = Sample {
            value: f64::NEG_INFINITY,
            error: Some(f64::INFINITY),
        };
        let json = serde_json::to_string(&sample).unwrap();
        assert_eq!(json, r#"{"value":"-inf","error":"inf"}"#);

        let back: Sample = serde_json::from_str(&json).unwrap();
        assert_eq!(back.value, f64::NEG_INFINITY);
        assert_eq!(back.error, Some(f64::INFINITY));

        let nan: Sample = serde_json::from_str(r#"{"value":"nan"}"#).unwrap();
        assert!(nan.value.is_nan());
        assert_eq!(nan.error, None);
    }

    #[test]
    fn test_finite_values_stay_numbers() {
        let json = serde_json::to_string(&Sample { value: 0.1, error: None }).unwrap();
        assert_eq!(json, r#"{"value":0.1,"error":null}"#);
        let back: Sample = serde_json::from_str(r#"{"value":3,"error":-2}"#).unwrap();
        assert_eq!(back.value, 3.0);
        assert_eq!(back.error, Some(-2.0));
    }

    #[test]
    fn test_unknown_label_is_rejected() {
        let err = serde_json::from_str::<Sample>(r#"{"value":"infinity"}"#).unwrap_err();
        assert!(err.to_string().contains("inf"));
    }
}

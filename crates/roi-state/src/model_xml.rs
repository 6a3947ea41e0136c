//! XML source library for the external engine.
//!
//! Written next to every snapshot for interoperability. It is never read
//! back; the snapshot is the only source of truth on reload.

use std::borrow::Cow;
use std::fmt::{self, Write};

use roi_core::{Parameter, Registry, Source, SpatialModel, SpectralModel};

/// Renders the registry as an XML source library.
///
/// # Examples
///
/// ```
/// use roi_core::{DiffuseModels, Registry, SkyDir};
///
/// let registry = Registry::new(SkyDir::new(0.0, 0.0), DiffuseModels::default());
/// let xml = roi_state::model_xml::render(&registry);
/// assert!(xml.contains(r#"<source name="galdiff" type="DiffuseSource">"#));
/// ```
#[must_use]
pub fn render(registry: &Registry) -> String {
    let mut out = String::new();
    // Writing into a String cannot fail.
    let _ = write_library(&mut out, registry);
    out
}

fn write_library(out: &mut String, registry: &Registry) -> fmt::Result {
    writeln!(out, r#"<?xml version="1.0" ?>"#)?;
    writeln!(out, r#"<source_library title="source library">"#)?;
    for source in registry.iter() {
        write_source(out, source)?;
    }
    writeln!(out, "</source_library>")
}

fn write_source(out: &mut String, source: &Source) -> fmt::Result {
    let kind = if source.is_diffuse() { "DiffuseSource" } else { "PointSource" };
    writeln!(out, r#"  <source name="{}" type="{kind}">"#, escape(source.name()))?;
    write_spectrum(out, &source.spectrum)?;
    write_spatial(out, source)?;
    writeln!(out, "  </source>")
}

fn write_spectrum(out: &mut String, spectrum: &SpectralModel) -> fmt::Result {
    write!(out, r#"    <spectrum type="{}""#, spectrum.spectrum_type)?;
    if let Some(file) = &spectrum.file {
        write!(out, r#" file="{}""#, escape(file.as_str()))?;
    }
    writeln!(out, ">")?;
    for par in &spectrum.parameters {
        write_parameter(out, par)?;
    }
    writeln!(out, "    </spectrum>")
}

fn write_spatial(out: &mut String, source: &Source) -> fmt::Result {
    write!(out, r#"    <spatialModel type="{}""#, source.spatial.function_name())?;
    if let Some(file) = source.spatial.file() {
        write!(out, r#" file="{}""#, escape(file.as_str()))?;
    }
    writeln!(out, ">")?;

    let mut parameters = Vec::with_capacity(3);
    if let Some(dir) = source.skydir {
        parameters.push(Parameter::new("RA", dir.ra, -360.0, 360.0, 1.0));
        parameters.push(Parameter::new("DEC", dir.dec, -90.0, 90.0, 1.0));
    }
    let shape = match &source.spatial {
        SpatialModel::RadialGaussian { width } => Some(("Sigma", *width, 0.001, 10.0)),
        SpatialModel::RadialDisk { width } => Some(("Radius", *width, 0.001, 10.0)),
        SpatialModel::SpatialMap { .. } => Some(("Prefactor", 1.0, 0.001, 1000.0)),
        SpatialModel::MapCube { .. } => Some(("Normalization", 1.0, 0.001, 1000.0)),
        SpatialModel::Isotropic => Some(("Value", 1.0, 0.0, 10.0)),
        SpatialModel::PointSource => None,
    };
    if let Some((name, value, min, max)) = shape {
        parameters.push(Parameter::new(name, value, min, max, 1.0));
    }
    for par in &parameters {
        write_parameter(out, par)?;
    }
    writeln!(out, "    </spatialModel>")
}

fn write_parameter(out: &mut String, par: &Parameter) -> fmt::Result {
    write!(
        out,
        r#"      <parameter name="{}" value="{}""#,
        escape(&par.name),
        par.value
    )?;
    if let Some(error) = par.error {
        write!(out, r#" error="{error}""#)?;
    }
    writeln!(
        out,
        r#" free="{}" min="{}" max="{}" scale="{}" />"#,
        u8::from(par.free),
        par.min,
        par.max,
        par.scale
    )
}

/// Escapes the five XML special characters in an attribute value.
fn escape(value: &str) -> Cow<'_, str> {
    if !value.contains(['&', '<', '>', '"', '\'']) {
        return Cow::Borrowed(value);
    }
    let mut escaped = String::with_capacity(value.len() + 8);
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    Cow::Owned(escaped)
}

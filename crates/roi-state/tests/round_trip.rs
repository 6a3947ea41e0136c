//! Snapshot round trips through files in both encodings.

use camino::{Utf8Path, Utf8PathBuf};
use roi_core::{ModelSetup, ParameterKey, ResolvedConfig, SetupError};
use roi_fit::{
    EngineError, FitOptions, FitProblem, FitResult, Fitter, Maximizer, Objective, ParameterControl,
    ParameterFilter,
};
use roi_state::{SerializationError, Session, SessionError, read_snapshot};
use serde_json::json;
use tempfile::TempDir;

/// Engine that nudges every free parameter and reports per-source npred.
struct Nudge;

impl Maximizer for Nudge {
    fn maximize(&self, problem: &FitProblem, _: &dyn Objective) -> Result<FitResult, EngineError> {
        let n = problem.len();
        let mut npred: Vec<(String, f64)> = Vec::new();
        for key in &problem.parameters {
            if !npred.iter().any(|(name, _)| *name == key.source) {
                npred.push((key.source.clone(), 17.3 * (npred.len() + 1) as f64));
            }
        }
        Ok(FitResult {
            converged: true,
            status: 0,
            quality: 3,
            log_likelihood: -1234.567_891_234,
            values: problem.initial.iter().map(|v| v * 1.1 + 0.0137).collect(),
            errors: (1..=n).map(|i| 0.01 * i as f64 / 3.0).collect(),
            covariance: Vec::new(),
            npred,
        })
    }
}

fn flat(_: &FitProblem, _: &[f64]) -> Result<f64, EngineError> {
    Ok(0.0)
}

fn config(extra_source: bool) -> ResolvedConfig {
    let mut sources = vec![
        json!({
            "name": "mkn421",
            "aliases": ["Mkn 421", "3FGL J1104.4+3812"],
            "ra": 166.1, "dec": 38.2,
            "spectrum_type": "LogParabola"
        }),
        json!({"name": "4FGL J1100.3+4020", "ra": 165.09, "dec": 40.34}),
    ];
    if extra_source {
        sources.push(json!({"name": "4FGL J1049.8+3837", "ra": 162.46, "dec": 38.63}));
    }
    ResolvedConfig::from_json(json!({
        "selection": {"target": "mkn421", "emin": 300.0},
        "model": {"sources": sources},
        "components": [{"selection": {"evtype": 8}}, {"selection": {"evtype": 16}}]
    }))
    .unwrap()
}

/// A session after one committed fit.
fn fitted_session(extra_source: bool) -> Session {
    let session = Session::setup(config(extra_source), &ModelSetup).unwrap();
    {
        let mut registry = session.handle().write();
        registry.free_diffuse_norms(true).unwrap();
        registry.free_source("Mkn 421", true, ParameterFilter::All).unwrap();
    }
    Fitter::new(&Nudge, &flat, FitOptions::default())
        .fit(session.handle())
        .unwrap();
    session
}

fn base(dir: &TempDir, name: &str) -> Utf8PathBuf {
    Utf8Path::from_path(dir.path()).unwrap().join(name)
}

#[test]
fn test_text_and_binary_decode_to_equal_snapshots() {
    let session = fitted_session(false);
    let dir = TempDir::new().unwrap();
    let files = session.write(&base(&dir, "fit0")).unwrap();

    let text = read_snapshot(&files.text).unwrap();
    let binary = read_snapshot(&files.binary).unwrap();
    assert_eq!(text, binary);
    assert_eq!(text, session.snapshot());
    assert_eq!(text.config.components().len(), 2);
    assert_eq!(text.roi.fit_quality, Some(3));
}

#[test]
fn test_unbounded_parameters_survive_both_encodings() {
    let session = fitted_session(false);
    {
        let mut registry = session.handle().write();
        let norm = ParameterKey::new("mkn421", "norm");
        let alpha = ParameterKey::new("mkn421", "alpha");
        registry.parameter_mut(&norm).unwrap().max = f64::INFINITY;
        registry.parameter_mut(&alpha).unwrap().min = f64::NEG_INFINITY;
    }
    let dir = TempDir::new().unwrap();
    let files = session.write(&base(&dir, "unbounded")).unwrap();

    let text = read_snapshot(&files.text).unwrap();
    let binary = read_snapshot(&files.binary).unwrap();
    assert_eq!(text, binary);
    assert_eq!(text, session.snapshot());
    let norm = text.source("mkn421").unwrap().spectrum.parameter("norm").unwrap();
    assert_eq!(norm.max, f64::INFINITY);

    let raw = std::fs::read_to_string(&files.text).unwrap();
    assert!(raw.contains(r#""max": "inf""#));
    assert!(raw.contains(r#""min": "-inf""#));
    assert!(!raw.contains(r#""max": null"#));
}

#[test]
fn test_inverted_bounds_in_file_are_corrupt() {
    let session = fitted_session(false);
    let dir = TempDir::new().unwrap();
    let files = session.write(&base(&dir, "fit0")).unwrap();

    let mut document: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&files.text).unwrap()).unwrap();
    let mkn421 = document["sources"]
        .as_array_mut()
        .unwrap()
        .iter_mut()
        .find(|s| s["name"] == "mkn421")
        .unwrap();
    mkn421["spectrum"]["parameters"][0]["min"] = json!(5.0);
    mkn421["spectrum"]["parameters"][0]["max"] = json!(1.0);
    std::fs::write(&files.text, serde_json::to_vec(&document).unwrap()).unwrap();

    let fresh = Session::setup(config(false), &ModelSetup).unwrap();
    let before = fresh.handle().read().parameter_state();
    let err = fresh.load(&files.text).unwrap_err();
    assert!(err.is_corrupt(), "{err}");
    assert!(err.to_string().contains("mkn421: parameter norm: bounds are inverted"));
    assert_eq!(fresh.handle().read().parameter_state(), before);
}

#[test]
fn test_create_reproduces_parameter_state() {
    let session = fitted_session(false);
    let expected = session.handle().read().parameter_state();
    let dir = TempDir::new().unwrap();
    let files = session.write(&base(&dir, "fit0")).unwrap();

    for path in [&files.text, &files.binary] {
        let restored = Session::create(path, &ModelSetup).unwrap();
        assert_eq!(restored.handle().read().parameter_state(), expected, "{path}");
        assert_eq!(restored.config(), session.config());
    }
}

#[test]
fn test_load_overlays_onto_existing_registry() {
    let session = fitted_session(false);
    let dir = TempDir::new().unwrap();
    let files = session.write(&base(&dir, "fit0")).unwrap();

    let fresh = Session::setup(config(false), &ModelSetup).unwrap();
    assert_ne!(
        fresh.handle().read().parameter_state(),
        session.handle().read().parameter_state()
    );
    fresh.load(&files.binary).unwrap();
    assert_eq!(
        fresh.handle().read().parameter_state(),
        session.handle().read().parameter_state()
    );
    // Aliases survive an overlay.
    assert_eq!(fresh.handle().read().resolve("3FGL J1104.4+3812").unwrap().name(), "mkn421");
}

#[test]
fn test_load_with_unknown_source_is_schema_mismatch() {
    let session = fitted_session(true);
    let dir = TempDir::new().unwrap();
    let files = session.write(&base(&dir, "fit0")).unwrap();

    let smaller = Session::setup(config(false), &ModelSetup).unwrap();
    let before = smaller.handle().read().parameter_state();
    let err = smaller.load(&files.text).unwrap_err();
    assert!(
        matches!(
            &err,
            SerializationError::SchemaMismatch { missing } if missing == &["4FGL J1049.8+3837"]
        ),
        "{err}"
    );
    assert_eq!(smaller.handle().read().parameter_state(), before);
}

#[test]
fn test_newer_format_version_is_rejected() {
    let session = fitted_session(false);
    let dir = TempDir::new().unwrap();
    let files = session.write(&base(&dir, "fit0")).unwrap();

    let mut document: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&files.text).unwrap()).unwrap();
    document["format_version"] = json!(2);
    std::fs::write(&files.text, serde_json::to_vec(&document).unwrap()).unwrap();
    let err = read_snapshot(&files.text).unwrap_err();
    assert!(matches!(err, SerializationError::FormatVersion { found: 2, supported: 1 }));

    let mut bytes = std::fs::read(&files.binary).unwrap();
    bytes[4..8].copy_from_slice(&2u32.to_le_bytes());
    std::fs::write(&files.binary, bytes).unwrap();
    let err = read_snapshot(&files.binary).unwrap_err();
    assert!(matches!(err, SerializationError::FormatVersion { found: 2, .. }));
}

#[test]
fn test_truncated_binary_is_corrupt_and_names_file() {
    let session = fitted_session(false);
    let dir = TempDir::new().unwrap();
    let files = session.write(&base(&dir, "fit0")).unwrap();

    let bytes = std::fs::read(&files.binary).unwrap();
    std::fs::write(&files.binary, &bytes[..bytes.len() / 2]).unwrap();
    let err = read_snapshot(&files.binary).unwrap_err();
    assert!(err.is_corrupt());
    assert!(err.to_string().contains(files.binary.as_str()));
}

#[test]
fn test_write_emits_model_library() {
    let session = fitted_session(false);
    let dir = TempDir::new().unwrap();
    let files = session.write(&base(&dir, "nested/fit0")).unwrap();

    let xml = std::fs::read_to_string(&files.model).unwrap();
    assert!(xml.contains(r#"<source name="mkn421" type="PointSource">"#));
    assert!(xml.contains(r#"<spectrum type="LogParabola">"#));
}

#[test]
fn test_create_propagates_setup_failure() {
    let session = fitted_session(false);
    let dir = TempDir::new().unwrap();
    let files = session.write(&base(&dir, "fit0")).unwrap();

    let failing = |_: &ResolvedConfig| -> Result<roi_core::Registry, SetupError> {
        Err(SetupError::Failed("livetime cube missing".to_owned()))
    };
    let err = Session::create(&files.binary, &failing).unwrap_err();
    assert!(matches!(err, SessionError::Setup(_)));
}

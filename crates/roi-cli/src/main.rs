//! CLI entry point for ROI analysis snapshots.
//!
//! # Usage
//!
//! ```bash
//! roi [OPTIONS] <COMMAND>
//!
//! # Show the resolved configuration, components included
//! roi config analysis.json
//!
//! # Build the ROI model and write the initial snapshot
//! roi setup analysis.json --output out/roi
//!
//! # Summarize a snapshot
//! roi show out/roi.bin
//!
//! # Check that the text and binary encodings agree
//! roi verify out/roi
//! ```

#![deny(clippy::all)]
#![warn(missing_docs)]

use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{WrapErr, eyre};
use roi_core::{ModelSetup, ResolvedConfig, SkyDir, Source};
use roi_state::{Encoding, Session, Snapshot, SnapshotFiles, codec, model_xml, read_snapshot};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// CLI ARGUMENT TYPES
// =============================================================================

/// Inspect, convert and verify ROI likelihood analysis snapshots.
#[derive(Parser)]
#[command(name = "roi", version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Command to execute.
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging (debug level).
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
}

/// Available subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Resolve a configuration file and print every component.
    Config {
        /// Configuration file (JSON).
        #[arg(env = "ROI_CONFIG")]
        config: Utf8PathBuf,
    },

    /// Build the ROI model from a configuration and write a snapshot.
    Setup {
        /// Configuration file (JSON).
        #[arg(env = "ROI_CONFIG")]
        config: Utf8PathBuf,

        /// Snapshot base path (defaults to `<fileio.outdir>/roi`).
        #[arg(short, long)]
        output: Option<Utf8PathBuf>,
    },

    /// Summarize the sources in a snapshot.
    Show {
        /// Snapshot file in either encoding.
        snapshot: Utf8PathBuf,

        /// Output format.
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },

    /// Resolve a source name or alias against a snapshot.
    Resolve {
        /// Snapshot file in either encoding.
        snapshot: Utf8PathBuf,

        /// Source name or alias.
        name: String,

        /// Also list sources within this many degrees of the match.
        #[arg(long)]
        radius: Option<f64>,
    },

    /// Check that `<base>.json` and `<base>.bin` decode to equal snapshots
    /// and overlay cleanly onto a freshly built ROI.
    Verify {
        /// Snapshot base path (without extension).
        base: Utf8PathBuf,
    },

    /// Re-encode a snapshot.
    Convert {
        /// Input snapshot in either encoding.
        input: Utf8PathBuf,

        /// Output file.
        output: Utf8PathBuf,

        /// Target encoding.
        #[arg(long, value_enum, default_value_t = TargetEncoding::Binary)]
        to: TargetEncoding,
    },

    /// Write the XML source library of a snapshot.
    ExportModel {
        /// Snapshot file in either encoding.
        snapshot: Utf8PathBuf,

        /// Output file (defaults to stdout).
        #[arg(short, long)]
        output: Option<Utf8PathBuf>,
    },
}

/// Summary output format.
#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Aligned text table.
    Table,
    /// JSON.
    Json,
}

/// Snapshot encoding selectable on the command line.
#[derive(Clone, Copy, ValueEnum)]
enum TargetEncoding {
    /// Pretty JSON.
    Text,
    /// Compact binary.
    Binary,
}

impl From<TargetEncoding> for Encoding {
    fn from(value: TargetEncoding) -> Self {
        match value {
            TargetEncoding::Text => Self::Text,
            TargetEncoding::Binary => Self::Binary,
        }
    }
}

// =============================================================================
// INITIALIZATION FUNCTIONS
// =============================================================================

/// Initializes the tracing subscriber for logging.
///
/// Respects `RUST_LOG` if set. Otherwise uses `debug` with `--verbose` and
/// `info` by default. Logs go to stderr so command output stays clean.
fn init_tracing(verbose: bool, no_color: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if verbose { "debug" } else { "info" };
        EnvFilter::new(level)
    });

    // Check if colors should be disabled (flag or NO_COLOR env var)
    let use_ansi = !no_color && std::env::var("NO_COLOR").is_err();

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .with_ansi(use_ansi)
                .with_writer(std::io::stderr),
        )
        .with(filter)
        .init();
}

/// Rebuilds the session a snapshot was taken from.
fn restore_session(path: &Utf8Path) -> color_eyre::Result<Session> {
    Session::create(path, &ModelSetup).wrap_err_with(|| format!("failed to restore {path}"))
}

// =============================================================================
// COMMAND IMPLEMENTATIONS
// =============================================================================

fn run_config(path: &Utf8Path) -> color_eyre::Result<()> {
    let config = ResolvedConfig::load(path)?;
    let text = serde_json::to_string_pretty(config.components())?;
    let mut out = std::io::stdout().lock();
    writeln!(out, "{text}")?;
    Ok(())
}

fn run_setup(path: &Utf8Path, output: Option<Utf8PathBuf>) -> color_eyre::Result<()> {
    let config = ResolvedConfig::load(path)?;
    let session = Session::setup(config, &ModelSetup)?;
    let base = output.unwrap_or_else(|| session.output_base("roi"));
    let files = session.write(&base)?;

    let mut out = std::io::stdout().lock();
    writeln!(out, "Sources: {}", session.handle().read().len())?;
    write_files(&mut out, &files)?;
    Ok(())
}

fn run_show(path: &Utf8Path, format: OutputFormat) -> color_eyre::Result<()> {
    let snapshot = read_snapshot(path)?;
    let rows: Vec<SourceRow<'_>> = snapshot
        .sources
        .iter()
        .map(|s| SourceRow::new(s, &snapshot.roi.center))
        .collect();

    let mut out = std::io::stdout().lock();
    match format {
        OutputFormat::Json => {
            writeln!(out, "{}", serde_json::to_string_pretty(&rows)?)?;
        }
        OutputFormat::Table => {
            write_roi_header(&mut out, &snapshot)?;
            write_table(&mut out, &rows)?;
        }
    }
    Ok(())
}

fn run_resolve(path: &Utf8Path, name: &str, radius: Option<f64>) -> color_eyre::Result<()> {
    let session = restore_session(path)?;
    let registry = session.handle().read();
    let source = registry.resolve(name)?;

    let mut out = std::io::stdout().lock();
    writeln!(out, "{}", source.name())?;
    for alias in source.aliases() {
        writeln!(out, "  alias: {alias}")?;
    }
    if let Some(radius) = radius {
        let nearby = registry.nearby(name, radius)?;
        writeln!(out, "Within {radius} deg: {}", nearby.len())?;
        for other in nearby.iter().filter(|o| o.name() != source.name()) {
            let separation = source
                .skydir
                .and_then(|dir| other.distance_to(&dir))
                .unwrap_or_default();
            writeln!(out, "  {:<24} {separation:>7.3}", other.name())?;
        }
    }
    Ok(())
}

fn run_verify(base: &Utf8Path) -> color_eyre::Result<()> {
    let files = SnapshotFiles::for_base(base);
    let text = read_snapshot(&files.text)?;
    let binary = read_snapshot(&files.binary)?;
    if text != binary {
        return Err(eyre!("{} and {} disagree", files.text, files.binary));
    }

    let session = restore_session(&files.binary)?;
    let rebuilt = session.snapshot();
    if rebuilt.sources != binary.sources {
        return Err(eyre!("overlay onto a fresh ROI does not reproduce {}", files.binary));
    }
    info!(%base, sources = binary.sources.len(), "snapshot verified");

    let mut out = std::io::stdout().lock();
    writeln!(
        out,
        "OK: {} sources, format version {}, written by {}",
        binary.sources.len(),
        binary.format_version,
        binary.software_version
    )?;
    Ok(())
}

fn run_convert(input: &Utf8Path, output: &Utf8Path, to: Encoding) -> color_eyre::Result<()> {
    let snapshot = read_snapshot(input)?;
    let bytes = codec::encode(&snapshot, to)?;
    std::fs::write(output, bytes).wrap_err_with(|| format!("failed to write {output}"))?;
    info!(%input, %output, encoding = %to, "snapshot converted");
    Ok(())
}

fn run_export_model(path: &Utf8Path, output: Option<Utf8PathBuf>) -> color_eyre::Result<()> {
    let session = restore_session(path)?;
    let xml = model_xml::render(&session.handle().read());
    if let Some(output) = output {
        std::fs::write(&output, xml).wrap_err_with(|| format!("failed to write {output}"))?;
        info!(path = %output, "model written");
    } else {
        let mut out = std::io::stdout().lock();
        write!(out, "{xml}")?;
    }
    Ok(())
}

// =============================================================================
// OUTPUT HELPERS
// =============================================================================

/// One line of the source summary.
#[derive(serde::Serialize)]
struct SourceRow<'a> {
    name: &'a str,
    spectrum: &'static str,
    spatial: &'static str,
    free: usize,
    offset: Option<f64>,
    ts: Option<f64>,
    npred: Option<f64>,
}

impl<'a> SourceRow<'a> {
    fn new(source: &'a Source, center: &SkyDir) -> Self {
        Self {
            name: source.name(),
            spectrum: source.spectrum.spectrum_type.name(),
            spatial: source.spatial.function_name(),
            free: source.spectrum.free_count(),
            offset: source.distance_to(center),
            ts: source.ts,
            npred: source.npred,
        }
    }
}

fn write_roi_header(out: &mut impl Write, snapshot: &Snapshot) -> std::io::Result<()> {
    let roi = &snapshot.roi;
    writeln!(out, "ROI center:      ({:.4}, {:.4})", roi.center.ra, roi.center.dec)?;
    writeln!(out, "Components:      {}", snapshot.config.components().len())?;
    match roi.log_likelihood {
        Some(loglike) => writeln!(out, "Log-likelihood:  {loglike:.3}")?,
        None => writeln!(out, "Log-likelihood:  (not fitted)")?,
    }
    if let Some(quality) = roi.fit_quality {
        writeln!(out, "Fit quality:     {quality}")?;
    }
    writeln!(out, "Total npred:     {:.1}", roi.npred)?;
    writeln!(out)
}

fn write_table(out: &mut impl Write, rows: &[SourceRow<'_>]) -> std::io::Result<()> {
    let width = rows.iter().map(|r| r.name.len()).max().unwrap_or(4).max(4);
    writeln!(
        out,
        "{:<width$}  {:<16}  {:<15}  {:>4}  {:>7}  {:>9}  {:>9}",
        "name", "spectrum", "spatial", "free", "offset", "ts", "npred"
    )?;
    for row in rows {
        writeln!(
            out,
            "{:<width$}  {:<16}  {:<15}  {:>4}  {:>7}  {:>9}  {:>9}",
            row.name,
            row.spectrum,
            row.spatial,
            row.free,
            optional(row.offset, 3),
            optional(row.ts, 2),
            optional(row.npred, 1),
        )?;
    }
    Ok(())
}

fn write_files(out: &mut impl Write, files: &SnapshotFiles) -> std::io::Result<()> {
    writeln!(out, "Wrote {}", files.text)?;
    writeln!(out, "Wrote {}", files.binary)?;
    writeln!(out, "Wrote {}", files.model)
}

fn optional(value: Option<f64>, precision: usize) -> String {
    value.map_or_else(|| "-".to_owned(), |v| format!("{v:.precision$}"))
}

// =============================================================================
// MAIN ENTRY POINT
// =============================================================================

/// Application entry point.
fn main() -> color_eyre::Result<()> {
    // 1. Install color-eyre FIRST (before any potential panics)
    color_eyre::install()?;

    // 2. Parse CLI arguments
    let cli = Cli::parse();

    // 3. Initialize tracing (handles --no-color for log output)
    init_tracing(cli.verbose, cli.no_color);

    // 4. Route to the command
    match cli.command {
        Commands::Config { config } => run_config(&config),
        Commands::Setup { config, output } => run_setup(&config, output),
        Commands::Show { snapshot, format } => run_show(&snapshot, format),
        Commands::Resolve {
            snapshot,
            name,
            radius,
        } => run_resolve(&snapshot, &name, radius),
        Commands::Verify { base } => run_verify(&base),
        Commands::Convert { input, output, to } => run_convert(&input, &output, to.into()),
        Commands::ExportModel { snapshot, output } => run_export_model(&snapshot, output),
    }
}

//! CLI entry point for the hark change listener.
//!
//! Watches one or more directories and prints every batch of changes,
//! either as aligned text or as one JSON object per line.
//!
//! # Usage
//!
//! ```bash
//! hark [OPTIONS] <DIR>...
//!
//! # Watch two trees, ignoring logs
//! hark app lib --ignore '\.log$'
//!
//! # Machine-readable output, polling every 500ms
//! hark src --json --force-polling --poll-interval 500
//!
//! # Load options from a JSON file, then override the debounce window
//! hark src --config hark.json --latency 50
//! ```

#![deny(clippy::all)]
#![warn(missing_docs)]

use std::io::Write;

use camino::Utf8PathBuf;
use clap::Parser;
use color_eyre::eyre::WrapErr;
use hark_core::{ChangeKind, Changes, ListenOptions, PollingFallbackMessage};
use hark_watcher::{BoxError, Listener, shutdown_token};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// CLI ARGUMENT TYPES
// =============================================================================

/// Watch directories and report modified, added, and removed files.
///
/// Changes are batched: a batch is printed once no new change has arrived
/// for the debounce window.
#[derive(Parser)]
#[command(name = "hark", version, about, long_about = None)]
struct Cli {
    /// Directories to watch.
    #[arg(required = true, value_name = "DIR")]
    dirs: Vec<Utf8PathBuf>,

    /// Load listener options from a JSON file. Flags override its values.
    #[arg(short, long, env = "HARK_CONFIG", value_name = "JSON")]
    config: Option<Utf8PathBuf>,

    /// Debounce window in milliseconds. Takes precedence over
    /// `--wait-for-delay`.
    #[arg(long, value_name = "MS")]
    latency: Option<u64>,

    /// Quiet period in milliseconds before a batch is delivered.
    #[arg(long, value_name = "MS")]
    wait_for_delay: Option<u64>,

    /// Use the polling backend even when a native one is available.
    #[arg(long)]
    force_polling: bool,

    /// Polling backend rescan interval in milliseconds.
    #[arg(long, value_name = "MS")]
    poll_interval: Option<u64>,

    /// Do not warn when falling back to polling.
    #[arg(long)]
    silent_fallback: bool,

    /// Additional ignore pattern (regular expression). Repeatable.
    #[arg(long, value_name = "REGEX")]
    ignore: Vec<String>,

    /// Only report files matching this pattern. Repeatable.
    #[arg(long, value_name = "REGEX")]
    only: Vec<String>,

    /// Replace every ignore pattern, built-in defaults included.
    ///
    /// Pass the flag without values to ignore nothing.
    #[arg(long, value_name = "REGEX", num_args = 0..)]
    replace_ignore: Option<Vec<String>>,

    /// Number of change workers.
    #[arg(long, value_name = "N")]
    workers: Option<usize>,

    /// Print one JSON object per batch.
    #[arg(long)]
    json: bool,

    /// Enable verbose logging (debug level).
    #[arg(short, long)]
    verbose: bool,

    /// Log every classified change (implies `--verbose`).
    #[arg(long)]
    debug: bool,

    /// Disable colored output.
    #[arg(long)]
    no_color: bool,
}

/// How batches are written to stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

// =============================================================================
// INITIALIZATION FUNCTIONS
// =============================================================================

/// Initializes the tracing subscriber for logging.
///
/// Respects the `RUST_LOG` environment variable if set. Otherwise, uses
/// `debug` level if `verbose` is set, or `info` level by default.
/// Logs go to stderr so stdout carries only batches.
fn init_tracing(verbose: bool, no_color: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if verbose { "debug" } else { "info" };
        EnvFilter::new(format!("{level},mio=warn,notify=warn"))
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

/// Builds [`ListenOptions`] from the config file (if any) and flags.
///
/// # Errors
///
/// Returns an error if the config file cannot be read or parsed.
fn build_options(cli: &Cli) -> color_eyre::Result<ListenOptions> {
    let mut options = match &cli.config {
        Some(path) => ListenOptions::from_json_file(path)
            .wrap_err_with(|| format!("Failed to load options from {path}"))?,
        None => ListenOptions::default(),
    };

    options.debug |= cli.debug;
    options.force_polling |= cli.force_polling;
    if let Some(ms) = cli.latency {
        options.latency_ms = Some(ms);
    }
    if let Some(ms) = cli.wait_for_delay {
        options.wait_for_delay_ms = ms;
    }
    if let Some(ms) = cli.poll_interval {
        options.poll_interval_ms = ms;
    }
    if let Some(workers) = cli.workers {
        options.workers = Some(workers);
    }
    if cli.silent_fallback {
        options.polling_fallback_message = PollingFallbackMessage::Silent;
    }

    if let Some(patterns) = &cli.replace_ignore {
        options.replace_ignore = Some(patterns.clone());
        options.ignore.clear();
        options.only.clear();
    }
    options.ignore.extend(cli.ignore.iter().cloned());
    if !cli.only.is_empty() {
        options.only.clone_from(&cli.only);
    }

    Ok(options)
}

// =============================================================================
// OUTPUT
// =============================================================================

/// Writes one batch to stdout.
///
/// A failed write (for instance a closed pipe) is returned so the listener
/// stops.
fn print_batch(
    format: OutputFormat,
    modified: &[String],
    added: &[String],
    removed: &[String],
) -> Result<(), BoxError> {
    let stdout = std::io::stdout();
    let mut handle = stdout.lock();
    let changes = Changes {
        modified: modified.to_vec(),
        added: added.to_vec(),
        removed: removed.to_vec(),
    };

    match format {
        OutputFormat::Json => {
            serde_json::to_writer(&mut handle, &changes)?;
            writeln!(handle)?;
        }
        OutputFormat::Text => {
            for kind in [ChangeKind::Modified, ChangeKind::Added, ChangeKind::Removed] {
                for path in changes.of_kind(kind) {
                    writeln!(handle, "{:<8}  {path}", kind.label())?;
                }
            }
        }
    }

    handle.flush()?;
    Ok(())
}

// =============================================================================
// MAIN ENTRY POINT
// =============================================================================

/// Application entry point.
#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    // 1. Install color-eyre FIRST (before any potential panics)
    color_eyre::install()?;

    // 2. Parse CLI arguments
    let cli = Cli::parse();

    // 3. Initialize tracing (handles --no-color for log output)
    init_tracing(cli.verbose || cli.debug, cli.no_color);

    // 4. Build the listener
    let options = build_options(&cli)?;
    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };
    let mut listener = Listener::new(&cli.dirs, options)?
        .with_callback(move |modified, added, removed| print_batch(format, modified, added, removed));

    // 5. Listen until Ctrl-C/SIGTERM or a fatal error
    listener.start(shutdown_token()).await?;
    info!(
        dirs = listener.directories().len(),
        backend = ?listener.backend(),
        "Listening, press Ctrl-C to stop"
    );
    listener.wait().await?;

    Ok(())
}

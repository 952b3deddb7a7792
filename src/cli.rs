//! CLI argument parsing for Zapline

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Output format for the run report
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable summary (default)
    Text,
    /// Full report as JSON
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "zapline")]
#[command(version)]
#[command(
    about = "Replay a scripted device through the adaptive zap verification engine",
    long_about = None
)]
pub struct Cli {
    /// Scenario TOML describing device and detector behavior per iteration
    #[arg(short, long, value_name = "FILE")]
    pub scenario: PathBuf,

    /// Engine configuration TOML (defaults apply when omitted)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Override the configured iteration count
    #[arg(short = 'n', long, value_name = "N")]
    pub iterations: Option<usize>,

    /// Skip the settle delay between stimulus and analysis
    #[arg(long)]
    pub no_settle: bool,

    /// Output format (text or json)
    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// Print per-iteration progress events to stderr
    #[arg(long)]
    pub progress: bool,

    /// Enable debug tracing output to stderr
    #[arg(long)]
    pub debug: bool,
}

//! CLI argument parsing for Dormilon

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Output format for the latency report
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text format (default)
    Text,
    /// JSON format for machine parsing
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "dormilon")]
#[command(version)]
#[command(about = "Attribute off-CPU latency to tasks, stacks, and wake sources", long_about = None)]
pub struct Cli {
    /// Process a saved trace file instead of sampling live
    #[arg(value_name = "FILE")]
    pub infile: Option<PathBuf>,

    /// Correlate sched_wakeup events to measure wake-to-run latency
    #[arg(short = 'w', long = "wakeups")]
    pub wakeups: bool,

    /// Stop a live session after this many seconds
    #[arg(short = 't', long = "time", value_name = "SECS")]
    pub time: Option<u64>,

    /// Only track tasks whose name contains this substring
    #[arg(short = 'n', long = "name", value_name = "SUBSTR")]
    pub name: Option<String>,

    /// Copy raw trace lines to a file while processing
    #[arg(short = 'o', long = "output", value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Merge tasks sharing a name into one bucket
    #[arg(short = 'g', long = "group")]
    pub group: bool,

    /// Live reporting window in seconds
    #[arg(long = "window", value_name = "SECS", default_value = "5")]
    pub window: u64,

    /// Output format (text or json)
    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// Enable debug logging to stderr
    #[arg(long = "debug")]
    pub debug: bool,

    /// Profile this command, scoping tracing to its lifetime (after --)
    #[arg(last = true)]
    pub command: Option<Vec<String>>,
}

//! dormilon-syslat: rank syscall latency from a saved trace file

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use dormilon::syscall::SyscallAnalyzer;
use dormilon::traceline::LineTokenizer;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "dormilon-syslat")]
#[command(version)]
#[command(about = "Rank syscalls by latency from a saved trace file", long_about = None)]
struct Cli {
    /// Trace file to process
    #[arg(value_name = "FILE")]
    infile: PathBuf,

    /// Enable debug logging to stderr
    #[arg(long = "debug")]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    if args.debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }

    let file = File::open(&args.infile)
        .with_context(|| format!("failed to open {}", args.infile.display()))?;

    let tokenizer = LineTokenizer::new();
    let mut analyzer = SyscallAnalyzer::new();
    for line in BufReader::new(file).lines() {
        let line = line.context("failed to read trace file")?;
        match tokenizer.parse_line(&line) {
            Some(rec) => analyzer.feed(&rec),
            None => debug!("no match for {:?}", line),
        }
    }
    if analyzer.mismatched_exits() > 0 {
        debug!("{} exits did not match their enter", analyzer.mismatched_exits());
    }

    let stdout = io::stdout();
    analyzer.render(&mut stdout.lock())?;
    Ok(())
}

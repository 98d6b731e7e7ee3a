use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use dormilon::{cli::Cli, ftrace::TraceFs, session, session::SessionConfig};
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.debug);

    if args.infile.is_some() && args.command.is_some() {
        anyhow::bail!("Cannot profile a command while replaying a trace file. Choose one.");
    }

    let config = SessionConfig {
        track_wakeups: args.wakeups,
        name_filter: args.name,
        group_by_comm: args.group,
        format: args.format,
        window: Duration::from_secs(args.window.max(1)),
        duration: args.time.map(Duration::from_secs),
        tee: args.output,
    };

    match args.infile {
        Some(infile) => session::replay_file(&infile, &config),
        None => {
            let tracefs = match TraceFs::locate() {
                Ok(tracefs) => tracefs,
                Err(e) => {
                    eprintln!("{}", e);
                    std::process::exit(1);
                }
            };
            session::run_live(&tracefs, &config, args.command)
        }
    }
}

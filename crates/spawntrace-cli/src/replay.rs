//! `spawntrace replay`: feed a recorded event log through the tracker.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use spawntrace_config::{log_cli_info, Config, ErrorPolicy};
use spawntrace_core::ReplayError;

use crate::report::{self, Format};

#[derive(Args, Debug)]
pub struct ReplayArgs {
    /// JSON-lines event log, one event per line
    #[arg(value_name = "FILE")]
    file: PathBuf,

    /// Override the configured error policy (abort | continue)
    #[arg(long)]
    on_error: Option<ErrorPolicy>,

    #[arg(long, value_enum, default_value_t = Format::Table)]
    format: Format,
}

pub fn run(config: &Config, args: ReplayArgs) -> Result<()> {
    let file = File::open(&args.file)
        .with_context(|| format!("Failed to open event log {}", args.file.display()))?;

    let dispatcher = crate::build_dispatcher(config, args.on_error);
    log_cli_info!(
        "Replaying events",
        path = tracing::field::display(args.file.display()),
        policy = tracing::field::display(dispatcher.tracker().policy())
    );

    let outcome = spawntrace_core::replay(BufReader::new(file), &dispatcher);

    // The report goes out even when the replay stopped early.
    let snapshot = dispatcher.tracker().snapshot();
    report::render(&mut io::stdout().lock(), &snapshot, &config.report, args.format)
        .context("Failed to write report")?;

    match outcome {
        Ok(stats) => {
            log_cli_info!(
                "Replay finished",
                lines = stats.lines,
                events = stats.events,
                rejected = stats.rejected
            );
            Ok(())
        }
        Err(e @ ReplayError::Tracker { .. }) => Err(anyhow::Error::new(e).context("Trace halted")),
        Err(e) => Err(e).with_context(|| format!("Failed to replay {}", args.file.display())),
    }
}

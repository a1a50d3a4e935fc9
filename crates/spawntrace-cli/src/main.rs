//! # spawntrace CLI
//!
//! Replays thread lifecycle event logs through the dependency tracker, or
//! runs a live traced workload, and prints the resulting dependency report.

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use spawntrace_config::logging::init_logging;
use spawntrace_config::{log_cli_error, Config, ErrorPolicy};
use spawntrace_core::{Dispatcher, Tracker};

mod demo;
mod replay;
mod report;

/// Thread spawn/start/terminate dependency tracer
#[derive(Parser)]
#[command(name = "spawntrace")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a JSON-lines event log and print the dependency report
    Replay(replay::ReplayArgs),

    /// Run a nested spawn tree on real threads and print its report
    Demo(demo::DemoArgs),

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration (files + environment)
    Show,
    /// Print the built-in defaults as TOML
    Default,
    /// Print the config file locations
    Path,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = spawntrace_config::config().clone();
    init_logging(config.logging.level);

    match cli.command {
        Commands::Replay(args) => replay::run(&config, args),
        Commands::Demo(args) => demo::run(&config, args),
        Commands::Config { command } => cmd_config(&config, command),
    }
}

/// Tracker + dispatcher for one run, with `on_error` overriding the
/// configured policy.
pub(crate) fn build_dispatcher(config: &Config, on_error: Option<ErrorPolicy>) -> Arc<Dispatcher> {
    let mut tracker_config = config.tracker.clone();
    if let Some(policy) = on_error {
        tracker_config.on_error = policy;
    }
    let tracker = Arc::new(Tracker::new(&tracker_config));
    let dispatcher = Dispatcher::new(tracker, &config.hooks).on_fatal(|snapshot| {
        log_cli_error!(
            "Trace halted, reporting partial snapshot",
            records = snapshot.rows.len(),
            faults = snapshot.faults.len()
        );
    });
    Arc::new(dispatcher)
}

fn cmd_config(config: &Config, command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Show => print!("{}", toml::to_string_pretty(config)?),
        ConfigCommands::Default => print!("{}", Config::default_toml()?),
        ConfigCommands::Path => {
            match Config::global_config_path() {
                Some(p) => println!("Global:  {}", p.display()),
                None => println!("Global:  (no home directory)"),
            }
            println!("Project: .spawntrace/config.toml");
        }
    }
    Ok(())
}

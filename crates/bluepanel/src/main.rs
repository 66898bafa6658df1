//! bluepanel - Bluetooth discovery and pairing backend
//!
//! Entry point for the `bluepanel` command. Without a subcommand it loads
//! and reports the configuration; `replay` drives the panel from a script.

mod replay;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};

use bluepanel_core::{Config, logging};

use crate::replay::{Replay, Script};

/// bluepanel - Bluetooth discovery and pairing backend
#[derive(Parser, Debug)]
#[command(name = "bluepanel", version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (uses XDG lookup if not specified)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Print example configuration and exit
    #[arg(long)]
    print_example_config: bool,

    /// Validate configuration and exit (returns non-zero on errors)
    #[arg(long)]
    check_config: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Drive the panel from a JSON script against a simulated service
    Replay {
        /// Script to run
        script: PathBuf,
        /// Print a JSON status snapshot after the last step
        #[arg(long)]
        status: bool,
    },
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize logging
    logging::init(args.verbose);

    // --print-example-config doesn't need a config
    if args.print_example_config {
        print!("{}", bluepanel_core::config::DEFAULT_CONFIG_TOML);
        return ExitCode::SUCCESS;
    }

    // If --config is specified, it must exist and be valid (no fallback)
    let load_result = match Config::find_and_load(args.config.as_deref()) {
        Ok(result) => result,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Some(ref source) = load_result.source {
        info!("Loaded configuration from {:?}", source);
    } else if load_result.used_defaults {
        warn!("Using default configuration (no config file found)");
    }

    let config = load_result.config;

    // Validate configuration (strict - fail on invalid values)
    if let Err(e) = config.validate() {
        eprintln!("Error: {}", e);
        return ExitCode::FAILURE;
    }
    for warning in config.warnings() {
        warn!("Config: {}", warning);
    }

    debug!("Configuration validated successfully");

    // --check-config: just validate and exit
    if args.check_config {
        if let Some(ref source) = load_result.source {
            println!("Configuration valid: {}", source.display());
        } else {
            println!("Configuration valid (using defaults)");
        }
        return ExitCode::SUCCESS;
    }

    match args.command {
        Some(Command::Replay { script, status }) => run_replay(&config, &script, status),
        None => {
            println!("{}", config.summary());
            ExitCode::SUCCESS
        }
    }
}

/// Run a replay script and print its transcript.
///
/// The transcript is printed even when a step fails, so the output shows
/// how far the script got.
fn run_replay(config: &Config, path: &std::path::Path, status: bool) -> ExitCode {
    let script = match Script::load(path) {
        Ok(script) => script,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut replay = Replay::new(config);
    let result = replay.run(&script);
    for line in replay.transcript() {
        println!("{}", line);
    }

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        return ExitCode::FAILURE;
    }

    if status {
        match serde_json::to_string_pretty(&replay.snapshot()) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("Error: {}", e);
                return ExitCode::FAILURE;
            }
        }
    }

    ExitCode::SUCCESS
}

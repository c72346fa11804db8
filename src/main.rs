//! taskwarden CLI entry point.

use std::collections::HashMap;

use clap::Parser;
use colored::Colorize;
use log::{info, LevelFilter};

use taskwarden::supervisor::{RunOutcome, Supervisor};
use taskwarden::task::ExecutionStatus;

mod cli;

use cli::Cli;

fn setup_logging(level: &str, include_timestamps: bool) {
    let level = level.parse::<LevelFilter>().unwrap_or(LevelFilter::Info);

    let mut builder = env_logger::Builder::from_default_env();
    builder.filter_level(level);
    if !include_timestamps {
        builder.format_timestamp(None);
    }
    builder.init();
}

fn main() {
    let cli = Cli::parse();
    let mut config = cli.into_config();

    // Environment values win over CLI values, so settings can be delivered
    // through the environment a scheduler injects.
    let process_env: HashMap<String, String> = std::env::vars().collect();
    config.apply_env(&process_env, false);

    setup_logging(&config.log.level, config.log.include_timestamps);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("{} failed to start the async runtime: {e}", "error:".red());
            std::process::exit(taskwarden::error::EXIT_CODE_GENERIC_ERROR);
        }
    };

    let outcome = runtime.block_on(async {
        let supervisor = match Supervisor::new(config) {
            Ok(supervisor) => supervisor,
            Err(e) => {
                eprintln!("{} {e}", "error:".red());
                std::process::exit(e.exit_code());
            }
        };
        supervisor.run().await
    });

    print_final_status(&outcome);
    info!("Exiting with code {}", outcome.exit_code);
    std::process::exit(outcome.exit_code);
}

fn print_final_status(outcome: &RunOutcome) {
    let (symbol, action) = match outcome.status {
        ExecutionStatus::Succeeded => ("✓".green(), "succeeded".to_string()),
        ExecutionStatus::TerminatedAfterTimeOut => {
            ("✗".red(), "timed out and was terminated".to_string())
        }
        ExecutionStatus::Stopped => ("!".yellow(), "was stopped".to_string()),
        ExecutionStatus::ExitedAfterMarkedDone => {
            ("✓".green(), "exited after being marked done".to_string())
        }
        ExecutionStatus::Abandoned => ("✗".red(), "could not be started".to_string()),
        _ => (
            "✗".red(),
            format!("failed with exit code {}", outcome.exit_code),
        ),
    };

    eprintln!(
        "{symbol} Task {action} after {} attempt{}.",
        outcome.attempt_count,
        if outcome.attempt_count == 1 { "" } else { "s" }
    );
}

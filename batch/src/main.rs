//! Batch runner: dispatch the agent over many independent task instances.

mod cli;
mod instances;
mod interrupt;
mod logging;
mod preds;
mod report;
mod run;

use std::path::PathBuf;

use agent::io::config::DEFAULT_CONFIG_PATH;
use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "batch", version, about = "Run the agent over a set of task instances")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every selected instance and record trajectories and predictions.
    Run(cli::RunArgs),
    /// Aggregate exit statuses and spend from an output directory.
    Summary {
        /// Output directory of a previous `batch run`.
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => cli::run_instances(args),
        Command::Summary { output } => {
            logging::init(None)?;
            cli::print_summary(&output)
        }
    }
}

// Ferry Worker
// Drives one triggering event through the configured job handlers

mod commands;
mod output;

use clap::{Parser, Subcommand};
use color_eyre::Result;

use commands::run::RunArgs;
use commands::validate::ValidateArgs;

#[derive(Parser, Debug)]
#[command(name = "ferry-worker")]
#[command(version, about = "Run ferry job handlers for a single event")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Handle the configured event and exit with the run's status
    Run(RunArgs),

    /// Check a handler file without contacting a cluster
    Validate(ValidateArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => commands::run::execute(args).await,
        Command::Validate(args) => commands::validate::execute(args),
    }
}

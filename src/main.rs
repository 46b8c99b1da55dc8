use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use donprice::core::log::init_logging;

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to optional configuration file
    #[arg(short, long, global = true)]
    config_path: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

impl From<Commands> for donprice::AppCommand {
    fn from(cmd: Commands) -> donprice::AppCommand {
        match cmd {
            Commands::Show { watch } => donprice::AppCommand::Show { watch },
            Commands::History => donprice::AppCommand::History,
            Commands::Setup => unreachable!("Setup command should be handled separately"),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create default configuration
    Setup,
    /// Display current prices per don with deltas and sources
    Show {
        /// Refresh every N seconds
        #[arg(short, long, value_name = "SECS")]
        watch: Option<u64>,
    },
    /// Display the daily per-don price history
    History,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    let result = match cli.command {
        Some(Commands::Setup) => donprice::cli::setup::setup(),
        Some(cmd) => donprice::run_command(cmd.into(), cli.config_path.as_deref()).await,
        None => {
            Cli::command().print_help()?;
            Ok(())
        }
    };

    if let Err(e) = &result {
        tracing::error!(error = %e, "Application failed");
    }
    result
}

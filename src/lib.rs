pub mod cli;
pub mod core;
pub mod providers;

use crate::core::config::AppConfig;
use crate::core::engine::PriceEngine;
use anyhow::Result;
use std::time::Duration;
use tracing::{debug, info};

pub enum AppCommand {
    /// Current board; `watch` refreshes every N seconds with one shared engine.
    Show { watch: Option<u64> },
    History,
}

pub async fn run_command(command: AppCommand, config_path: Option<&str>) -> Result<()> {
    info!("donprice starting...");

    let config = match config_path {
        Some(path) => AppConfig::load_from_path(path)?,
        None => AppConfig::load()?,
    };
    debug!("Loaded config: {config:#?}");

    let engine = PriceEngine::from_config(config);

    match command {
        AppCommand::Show { watch: None } => cli::show::run(&engine).await,
        AppCommand::Show {
            watch: Some(interval),
        } => {
            let interval = Duration::from_secs(interval.max(1));
            loop {
                cli::show::run(&engine).await?;
                cli::ui::print_separator();
                tokio::time::sleep(interval).await;
            }
        }
        AppCommand::History => cli::history::run(&engine).await,
    }
}

//! The binary entry point for the tether online content service.

mod app;
mod platform;

use std::process::ExitCode;

use clap::Parser;
use tether_config::{CliArgs, Config};

use crate::app::AppError;
use crate::platform::ServerDirs;

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();

    let (dirs, config) = match load(&args) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Failed to start tether-server: {e}");
            return ExitCode::FAILURE;
        }
    };

    tether_log::init_logging(
        Some(&dirs.log_dir),
        config.debug.log_to_file,
        Some(&config),
    );
    tracing::info!("Config directory: {}", dirs.config_dir.display());

    match app::run(&config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn load(args: &CliArgs) -> Result<(ServerDirs, Config), AppError> {
    let dirs = match &args.config {
        Some(dir) => ServerDirs::from_config_dir(dir),
        None => ServerDirs::resolve()?,
    };
    dirs.create_dirs()?;

    let mut config = Config::load_or_create(&dirs.config_dir)?;
    config.apply_cli_overrides(args);
    Ok((dirs, config))
}

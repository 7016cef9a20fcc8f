mod check;
mod cli;
mod config;
mod error;
mod filter;
pub(crate) mod git;
mod logging;
mod notebook;
mod pktline;
mod process;
mod render;

pub(crate) use error::{AppError, AppResult};

use std::io::IsTerminal;
use std::process::ExitCode;

use clap::{ColorChoice, Parser};
use tracing::error;

use crate::cli::{Cli, GetVerbosity};
use crate::config::Config;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let ansi = match cli.color {
        ColorChoice::Always => true,
        ColorChoice::Never => false,
        ColorChoice::Auto => std::io::stderr().is_terminal(),
    };

    // Filters still run with defaults when the config file is broken.
    let (config, config_err) = match Config::load() {
        Ok(config) => (config, None),
        Err(e) => (Config::default(), Some(e)),
    };

    if let Err(e) = logging::setup_logger(
        cli.cmd.get_verbosity().tracing_level_filter(),
        ansi,
        config.log_file.as_deref(),
    ) {
        eprintln!("Failed to initialize logger: {e}");
        return ExitCode::FAILURE;
    }
    if let Some(e) = config_err {
        error!("Ignoring configuration: {e}");
    }

    match cli.cmd.run(&config).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

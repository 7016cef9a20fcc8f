use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use nbclean_dirs::DirType;
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::time::LocalTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::AppResult;

/// Overrides the level picked with `-v`/`-q`, using `EnvFilter` directives.
pub const LOG_ENV: &str = "NBCLEAN_LOG";

/// Install the global subscriber. Everything goes to stderr; stdout is
/// reserved for filter output. With `log_file`, records are appended there too;
/// a relative `log_file` lives in the state directory.
pub fn setup_logger(level: LevelFilter, ansi: bool, log_file: Option<&Path>) -> AppResult<()> {
    let indicatif_layer = IndicatifLayer::new();

    let env_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .with_env_var(LOG_ENV)
        .from_env_lossy();

    let fmt = fmt::layer()
        .with_ansi(ansi)
        .with_target(cfg!(debug_assertions))
        .with_file(cfg!(debug_assertions))
        .with_line_number(cfg!(debug_assertions))
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_writer(indicatif_layer.get_stderr_writer())
        .compact();

    let file_layer = match log_file {
        Some(path) => {
            let path = if path.is_relative() {
                DirType::State.ensure_dir()?.join(path)
            } else {
                path.to_path_buf()
            };
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_timer(LocalTime::rfc_3339())
                    .with_target(true)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(fmt)
        .with(file_layer)
        .with(indicatif_layer)
        .with(env_filter)
        .init();
    Ok(())
}

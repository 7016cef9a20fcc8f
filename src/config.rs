use std::path::{Path, PathBuf};

use nbclean_dirs::DirType;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::AppResult;
use crate::filter::CleanOptions;
use crate::git::install::Driver;

/// Environment variable pointing at an alternative config file.
pub const CONFIG_ENV: &str = "NBCLEAN_CONFIG";

pub const DEFAULT_FILTER_NAME: &str = "strip-notebook-output";
pub const DEFAULT_PATTERN: &str = "*.ipynb";

/// Settings read from `config.json`. Command line flags override them.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, PartialEq, Eq)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct Config {
    /// Name the filter is registered under in git config and attributes
    pub filter_name: String,
    /// Attribute pattern routed through the filter
    pub pattern: String,
    /// Command written as the filter's clean action
    pub driver: Driver,
    /// How notebooks are cleaned
    pub clean: CleanOptions,
    /// Also append log records to this file
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            filter_name: DEFAULT_FILTER_NAME.to_string(),
            pattern: DEFAULT_PATTERN.to_string(),
            driver: Driver::default(),
            clean: CleanOptions::default(),
            log_file: None,
        }
    }
}

impl Config {
    /// Location of the config file: `$NBCLEAN_CONFIG`, else the XDG config dir.
    pub fn path() -> AppResult<PathBuf> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) if !path.is_empty() => Ok(PathBuf::from(path)),
            _ => Ok(DirType::Config.file("config.json")?),
        }
    }

    /// Load the config file, falling back to defaults when there is none.
    pub fn load() -> AppResult<Self> {
        Self::load_from(&Self::path()?)
    }

    pub fn load_from(path: &Path) -> AppResult<Self> {
        let content = match std::fs::read(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        let mut de = serde_json::Deserializer::from_slice(&content);
        let config = serde_path_to_error::deserialize(&mut de)?;
        de.end()?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn schema() -> serde_json::Value {
        serde_json::to_value(schemars::schema_for!(Config)).unwrap_or_default()
    }
}

use std::fmt::Display;
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use git2::{Config, ErrorCode, Repository};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{AppError, AppResult};
use crate::filter::CleanOptions;
use crate::git::attributes::{Attributes, AttributesTarget};

/// Query that mirrors the builtin filter with jq.
pub const JQ_EXPRESSION: &str = ".cells[].outputs = [] | .cells[].execution_count = null";

/// The nbconvert invocation that clears outputs while streaming a notebook.
pub const NBCONVERT_COMMAND: &str = "jupyter nbconvert --ClearOutputPreprocessor.enabled=True --to=notebook --stdin --stdout --log-level=ERROR";

/// Program that git runs as the clean action.
#[derive(
    ValueEnum, Serialize, Deserialize, JsonSchema, Clone, Copy, Debug, Default, PartialEq, Eq,
)]
#[serde(rename_all = "kebab-case")]
pub enum Driver {
    /// This binary
    #[default]
    Builtin,
    /// `jupyter nbconvert` with output clearing enabled
    Nbconvert,
    /// `jq` with a query that empties outputs and execution counts
    Jq,
}

/// Git configuration file that receives the filter definition.
#[derive(ValueEnum, Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ConfigLevel {
    /// `.git/config` of the repository
    #[default]
    Local,
    /// The user's global git configuration
    Global,
}

impl Display for ConfigLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigLevel::Local => write!(f, "local"),
            ConfigLevel::Global => write!(f, "global"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InstallOptions {
    pub name: String,
    pub pattern: String,
    pub driver: Driver,
    pub level: ConfigLevel,
    pub attributes: AttributesTarget,
    /// Also register the long-running `process` command (builtin driver only).
    pub process: bool,
    pub required: bool,
    pub clean: CleanOptions,
    /// Path of the binary to call for the builtin driver.
    pub exe: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstallReport {
    pub name: String,
    pub level: ConfigLevel,
    pub clean: String,
    pub process: Option<String>,
    pub required: bool,
    pub attributes_path: PathBuf,
    pub attributes_changed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct UninstallReport {
    pub name: String,
    pub keys_removed: Vec<String>,
    pub attributes_path: PathBuf,
    pub attributes_removed: usize,
}

/// Effective filter configuration as git would see it.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct FilterStatus {
    pub name: String,
    pub clean: Option<String>,
    pub smudge: Option<String>,
    pub process: Option<String>,
    pub required: bool,
    pub attributes: Vec<AttributeSource>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AttributeSource {
    pub path: PathBuf,
    pub lines: Vec<String>,
}

impl FilterStatus {
    pub fn is_installed(&self) -> bool {
        (self.clean.is_some() || self.process.is_some()) && !self.attributes.is_empty()
    }
}

const FILTER_KEYS: [&str; 4] = ["clean", "smudge", "process", "required"];

fn key(name: &str, field: &str) -> String {
    format!("filter.{name}.{field}")
}

/// Quote `arg` for `sh`, leaving plain words alone.
pub fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

fn value_name<T: ValueEnum>(value: &T) -> String {
    value
        .to_possible_value()
        .map(|v| v.get_name().to_string())
        .unwrap_or_default()
}

fn builtin_args(clean: &CleanOptions) -> String {
    format!(
        "--scope {} --style {} --on-error {}",
        value_name(&clean.scope),
        value_name(&clean.style),
        value_name(&clean.on_error)
    )
}

/// The `filter.<name>.clean` command for a driver.
pub fn clean_command(driver: Driver, exe: &Path, clean: &CleanOptions) -> String {
    match driver {
        Driver::Builtin => format!(
            "{} clean {} --pathname %f",
            shell_quote(&exe.to_string_lossy()),
            builtin_args(clean)
        ),
        Driver::Nbconvert => NBCONVERT_COMMAND.to_string(),
        Driver::Jq => format!("jq {}", shell_quote(JQ_EXPRESSION)),
    }
}

/// The `filter.<name>.process` command for the builtin driver.
pub fn process_command(exe: &Path, clean: &CleanOptions) -> String {
    format!(
        "{} process {}",
        shell_quote(&exe.to_string_lossy()),
        builtin_args(clean)
    )
}

fn open_config(repo: &Repository, level: ConfigLevel) -> AppResult<Config> {
    match level {
        ConfigLevel::Local => Ok(repo.config()?.open_level(git2::ConfigLevel::Local)?),
        ConfigLevel::Global => {
            let path = match Config::find_global() {
                Ok(path) => path,
                // No global file yet: libgit2 creates it on first write.
                Err(_) => std::env::home_dir()
                    .map(|home| home.join(".gitconfig"))
                    .ok_or_else(|| AppError::Other("unable to locate a home directory".into()))?,
            };
            debug!("Using global git config at {}", path.display());
            Ok(Config::open(&path)?)
        }
    }
}

fn remove_key(config: &mut Config, key: &str) -> AppResult<bool> {
    match config.remove(key) {
        Ok(()) => Ok(true),
        Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Register the clean filter and map `opts.pattern` to it.
///
/// No smudge action is written: checkouts get the stored bytes as they are.
#[tracing::instrument(name = "Installing filter", level = "info", skip(repo, opts), fields(name = %opts.name))]
pub fn install(repo: &Repository, opts: &InstallOptions) -> AppResult<InstallReport> {
    if opts.process && opts.driver != Driver::Builtin {
        return Err(AppError::Other(
            "the process protocol is only available with the builtin driver".into(),
        ));
    }

    let mut config = open_config(repo, opts.level)?;
    let clean = clean_command(opts.driver, &opts.exe, &opts.clean);
    config.set_str(&key(&opts.name, "clean"), &clean)?;

    let process = if opts.process {
        let command = process_command(&opts.exe, &opts.clean);
        config.set_str(&key(&opts.name, "process"), &command)?;
        Some(command)
    } else {
        remove_key(&mut config, &key(&opts.name, "process"))?;
        None
    };

    if opts.required {
        config.set_bool(&key(&opts.name, "required"), true)?;
    } else {
        remove_key(&mut config, &key(&opts.name, "required"))?;
    }

    let attributes_path = opts.attributes.path(repo)?;
    let mut attributes = Attributes::load(&attributes_path)?;
    let attributes_changed = attributes.ensure_filter(&opts.pattern, &opts.name);
    if attributes_changed {
        attributes.save(&attributes_path)?;
    }

    info!(
        "Filter `{}` installed in {} config, `{}` mapped in {}",
        opts.name,
        opts.level,
        opts.pattern,
        attributes_path.display()
    );
    Ok(InstallReport {
        name: opts.name.clone(),
        level: opts.level,
        clean,
        process,
        required: opts.required,
        attributes_path,
        attributes_changed,
    })
}

/// Remove the filter definition and its attribute mappings.
#[tracing::instrument(name = "Removing filter", level = "info", skip(repo))]
pub fn uninstall(
    repo: &Repository,
    name: &str,
    level: ConfigLevel,
    target: AttributesTarget,
) -> AppResult<UninstallReport> {
    let mut config = open_config(repo, level)?;
    let mut keys_removed = Vec::new();
    for field in FILTER_KEYS {
        let key = key(name, field);
        if remove_key(&mut config, &key)? {
            keys_removed.push(key);
        }
    }

    let attributes_path = target.path(repo)?;
    let mut attributes = Attributes::load(&attributes_path)?;
    let attributes_removed = attributes.remove_filter(name);
    if attributes_removed > 0 {
        attributes.save(&attributes_path)?;
    }

    Ok(UninstallReport {
        name: name.to_string(),
        keys_removed,
        attributes_path,
        attributes_removed,
    })
}

/// Read back the filter definition and every attributes file that mentions
/// the filter. Without a `level` the merged configuration is used.
#[tracing::instrument(level = "debug", skip(repo))]
pub fn status(
    repo: &Repository,
    name: &str,
    level: Option<ConfigLevel>,
) -> AppResult<FilterStatus> {
    let mut config = match level {
        Some(level) => open_config(repo, level)?,
        None => repo.config()?,
    };
    let config = config.snapshot()?;
    let get = |field: &str| config.get_string(&key(name, field)).ok();

    let mut attributes = Vec::new();
    for target in [AttributesTarget::Worktree, AttributesTarget::Info] {
        let Ok(path) = target.path(repo) else {
            continue;
        };
        let lines = Attributes::load(&path)?.lines_for(name);
        if !lines.is_empty() {
            attributes.push(AttributeSource { path, lines });
        }
    }

    Ok(FilterStatus {
        name: name.to_string(),
        clean: get("clean"),
        smudge: get("smudge"),
        process: get("process"),
        required: config.get_bool(&key(name, "required")).unwrap_or(false),
        attributes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notebook::StripScope;
    use crate::render::OutputStyle;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn repo() -> (TempDir, Repository) {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        (dir, repo)
    }

    fn options(driver: Driver) -> InstallOptions {
        InstallOptions {
            name: "strip".to_string(),
            pattern: "*.ipynb".to_string(),
            driver,
            level: ConfigLevel::Local,
            attributes: AttributesTarget::Worktree,
            process: false,
            required: false,
            clean: CleanOptions::default(),
            exe: PathBuf::from("/opt/nb tools/nbclean"),
        }
    }

    #[test]
    fn quoting_only_wraps_when_needed() {
        assert_eq!(shell_quote("/usr/bin/nbclean"), "/usr/bin/nbclean");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn builtin_command_carries_options() {
        let clean = CleanOptions {
            scope: StripScope::AllCells,
            style: OutputStyle::Jq,
            ..CleanOptions::default()
        };
        assert_eq!(
            clean_command(Driver::Builtin, Path::new("/bin/nbclean"), &clean),
            "/bin/nbclean clean --scope all-cells --style jq --on-error passthrough --pathname %f"
        );
        assert_eq!(
            clean_command(Driver::Jq, Path::new("unused"), &clean),
            "jq '.cells[].outputs = [] | .cells[].execution_count = null'"
        );
    }

    #[test]
    fn install_writes_config_and_attributes() {
        let (dir, repo) = repo();
        let report = install(&repo, &options(Driver::Builtin)).unwrap();
        assert!(report.attributes_changed);
        assert!(report.clean.starts_with("'/opt/nb tools/nbclean' clean"));

        let status = status(&repo, "strip", None).unwrap();
        assert!(status.is_installed());
        assert_eq!(status.clean.as_deref(), Some(report.clean.as_str()));
        assert_eq!(status.smudge, None);
        assert!(!status.required);
        let local = super::status(&repo, "strip", Some(ConfigLevel::Local)).unwrap();
        assert_eq!(local.clean, status.clean);
        assert_eq!(
            std::fs::read_to_string(dir.path().join(".gitattributes")).unwrap(),
            "*.ipynb filter=strip\n"
        );

        let again = install(&repo, &options(Driver::Builtin)).unwrap();
        assert!(!again.attributes_changed);
    }

    #[test]
    fn attribute_lookup_routes_notebooks_only() {
        let (_dir, repo) = repo();
        install(&repo, &options(Driver::Nbconvert)).unwrap();
        let flags = git2::AttrCheckFlags::FILE_THEN_INDEX;
        assert_eq!(
            repo.get_attr(Path::new("deep/dir/a.ipynb"), "filter", flags)
                .unwrap(),
            Some("strip")
        );
        assert_eq!(
            repo.get_attr(Path::new("a.py"), "filter", flags).unwrap(),
            None
        );
    }

    #[test]
    fn process_mode_requires_builtin_driver() {
        let (_dir, repo) = repo();
        let mut opts = options(Driver::Jq);
        opts.process = true;
        assert!(install(&repo, &opts).is_err());

        let mut opts = options(Driver::Builtin);
        opts.process = true;
        opts.required = true;
        let report = install(&repo, &opts).unwrap();
        assert!(report.process.unwrap().contains(" process --scope code-cells"));
        let status = status(&repo, "strip", None).unwrap();
        assert!(status.required);
        assert!(status.process.is_some());
    }

    #[test]
    fn uninstall_removes_everything_it_added() {
        let (dir, repo) = repo();
        let mut opts = options(Driver::Builtin);
        opts.attributes = AttributesTarget::Info;
        opts.required = true;
        install(&repo, &opts).unwrap();

        let report = uninstall(&repo, "strip", ConfigLevel::Local, AttributesTarget::Info).unwrap();
        assert_eq!(
            report.keys_removed,
            ["filter.strip.clean", "filter.strip.required"]
        );
        assert_eq!(report.attributes_removed, 1);

        let status = status(&repo, "strip", None).unwrap();
        assert_eq!(
            status,
            FilterStatus {
                name: "strip".to_string(),
                ..FilterStatus::default()
            }
        );
        assert!(!dir.path().join(".git/info/attributes").exists());
    }
}

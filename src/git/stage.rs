//! Staging through the configured clean filter.
//!
//! libgit2 never runs external filter drivers, so files added through it would
//! land in the index with their outputs intact. This module does what
//! `git add` does for a filtered path: look up the `filter` attribute, pipe
//! the working file through `filter.<name>.clean` (or the long-running
//! `process` command) and store whatever comes out. When the command cannot
//! be run or exits unsuccessfully, the original bytes are stored instead,
//! unless the filter is marked `required`.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;

use git2::{AttrCheckFlags, AttrValue, IndexEntry, IndexTime, Oid, Repository};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::{AppError, AppResult};
use crate::git::install::shell_quote;
use crate::process::{ProcessError, SpawnedFilter};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum StageOutcome {
    /// No filter applies to the path.
    Unfiltered,
    Filtered { filter: String },
    /// The filter failed and the original content was stored.
    FellBack { filter: String, reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub path: PathBuf,
    #[serde(flatten)]
    pub outcome: StageOutcome,
    pub blob: String,
    pub size: usize,
}

/// Filter definition looked up from the merged git configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Driver {
    clean: Option<String>,
    process: Option<String>,
    required: bool,
}

impl Driver {
    fn lookup(repo: &Repository, name: &str) -> AppResult<Self> {
        let config = repo.config()?.snapshot()?;
        Ok(Self {
            clean: config.get_string(&format!("filter.{name}.clean")).ok(),
            process: config.get_string(&format!("filter.{name}.process")).ok(),
            required: config
                .get_bool(&format!("filter.{name}.required"))
                .unwrap_or(false),
        })
    }
}

/// Name of the filter the attributes assign to `path`, if any.
fn filter_for(repo: &Repository, path: &Path) -> AppResult<Option<String>> {
    let value = repo.get_attr_bytes(path, "filter", AttrCheckFlags::FILE_THEN_INDEX)?;
    Ok(match AttrValue::from_bytes(value) {
        AttrValue::Bytes(name) => Some(String::from_utf8_lossy(name).into_owned()),
        AttrValue::String(name) => Some(name.to_string()),
        _ => None,
    })
}

/// Turn a user supplied path into one relative to the working tree.
fn relative_to(workdir: &Path, path: &Path) -> AppResult<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    let workdir = workdir.canonicalize()?;
    let parent = joined
        .parent()
        .map(Path::canonicalize)
        .transpose()?
        .unwrap_or_else(|| joined.clone());
    let file = joined
        .file_name()
        .ok_or_else(|| AppError::Other(format!("{} does not name a file", path.display())))?;
    parent
        .join(file)
        .strip_prefix(&workdir)
        .map(Path::to_path_buf)
        .map_err(|_| {
            AppError::Other(format!(
                "{} is outside the working tree {}",
                path.display(),
                workdir.display()
            ))
        })
}

/// Index path with forward slashes.
fn index_path(rel: &Path) -> AppResult<Vec<u8>> {
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str().ok_or_else(|| {
                AppError::Other(format!("{} is not valid UTF-8", rel.display()))
            })?),
            _ => {
                return Err(AppError::Other(format!(
                    "{} is not a plain relative path",
                    rel.display()
                )));
            }
        }
    }
    Ok(parts.join("/").into_bytes())
}

#[cfg(unix)]
fn file_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    if meta.permissions().mode() & 0o111 != 0 {
        0o100755
    } else {
        0o100644
    }
}

#[cfg(not(unix))]
fn file_mode(_meta: &std::fs::Metadata) -> u32 {
    0o100644
}

/// Run a one-shot clean command the way git does: through `sh`, with `%f`
/// replaced by the quoted path and the content on stdin.
#[tracing::instrument(level = "debug", skip(workdir, content))]
async fn run_clean_command(
    command: &str,
    rel: &Path,
    workdir: &Path,
    content: &[u8],
) -> Result<Vec<u8>, String> {
    let command = command.replace("%f", &shell_quote(&rel.to_string_lossy()));
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(&command)
        .current_dir(workdir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("unable to start `{command}`: {e}"))?;

    // Feed stdin from its own task so a filter that writes before it has
    // read everything cannot deadlock against us.
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| "filter stdin is unavailable".to_string())?;
    let input = content.to_vec();
    let feeder = tokio::spawn(async move {
        let result = stdin.write_all(&input).await;
        drop(stdin);
        result
    });

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| format!("`{command}` failed: {e}"))?;
    let fed = feeder
        .await
        .map_err(|e| format!("stdin writer for `{command}` failed: {e}"))?;

    if !output.status.success() {
        return Err(format!("`{command}` exited with {}", output.status));
    }
    if let Err(e) = fed
        && e.kind() != std::io::ErrorKind::BrokenPipe
    {
        return Err(format!("unable to write to `{command}`: {e}"));
    }
    Ok(output.stdout)
}

/// Stage `paths` (relative to the current directory or absolute) into the
/// index of `repo`, applying the configured clean filters.
#[tracing::instrument(name = "Staging files", level = "info", skip(repo))]
pub async fn stage_paths(repo: &Repository, paths: &[PathBuf]) -> AppResult<Vec<StageReport>> {
    let workdir = repo
        .workdir()
        .ok_or_else(|| AppError::BareRepository(repo.path().display().to_string()))?
        .to_path_buf();
    let mut index = repo.index()?;
    let mut processes: HashMap<String, SpawnedFilter> = HashMap::new();
    let mut reports = Vec::with_capacity(paths.len());

    for path in paths {
        let rel = relative_to(&workdir, path)?;
        let abs = workdir.join(&rel);
        let original = tokio::fs::read(&abs).await?;
        let meta = tokio::fs::metadata(&abs).await?;

        let (content, outcome) = match filter_for(repo, &rel)? {
            None => (original, StageOutcome::Unfiltered),
            Some(name) => {
                let driver = Driver::lookup(repo, &name)?;
                let pathname = rel.to_string_lossy().into_owned();
                let result = if let Some(command) = &driver.process {
                    if !processes.contains_key(&name) {
                        match SpawnedFilter::spawn(command, &workdir).await {
                            Ok(filter) => {
                                processes.insert(name.clone(), filter);
                            }
                            Err(e) => warn!("Unable to start filter process `{name}`: {e}"),
                        }
                    }
                    match processes.get_mut(&name) {
                        Some(filter) => match filter.clean(&pathname, &original).await {
                            Ok(filtered) => Ok(filtered),
                            Err(e @ ProcessError::Status { .. }) => Err(e.to_string()),
                            Err(e) => {
                                // Out of step with the protocol: kill it, the next path respawns.
                                debug!("Dropping filter process `{name}` after {e}");
                                processes.remove(&name);
                                Err(e.to_string())
                            }
                        },
                        None => Err(format!("filter process `{command}` is unavailable")),
                    }
                } else if let Some(command) = &driver.clean {
                    run_clean_command(command, &rel, &workdir, &original).await
                } else if driver.required {
                    Err(format!("filter `{name}` has no clean or process command"))
                } else {
                    // Attribute names a filter nobody defined: git stores the file as is.
                    debug!("Filter `{name}` is not configured, staging {pathname} as is");
                    Ok(original.clone())
                };

                match result {
                    Ok(filtered) if driver.clean.is_some() || driver.process.is_some() => {
                        (filtered, StageOutcome::Filtered { filter: name })
                    }
                    Ok(unchanged) => (unchanged, StageOutcome::Unfiltered),
                    Err(reason) if driver.required => {
                        return Err(AppError::RequiredFilter {
                            name,
                            path: pathname,
                            reason,
                        });
                    }
                    Err(reason) => {
                        warn!("Filter `{name}` failed for {pathname}, staging it unfiltered: {reason}");
                        (
                            original,
                            StageOutcome::FellBack {
                                filter: name,
                                reason,
                            },
                        )
                    }
                }
            }
        };

        let entry = IndexEntry {
            ctime: IndexTime::new(0, 0),
            mtime: IndexTime::new(0, 0),
            dev: 0,
            ino: 0,
            mode: file_mode(&meta),
            uid: 0,
            gid: 0,
            file_size: 0,
            id: Oid::zero(),
            flags: 0,
            flags_extended: 0,
            path: index_path(&rel)?,
        };
        index.add_frombuffer(&entry, &content)?;
        let blob = index
            .get_path(&rel, 0)
            .map(|e| e.id.to_string())
            .unwrap_or_default();
        info!("Staged {} ({:?})", rel.display(), outcome);
        reports.push(StageReport {
            path: rel,
            outcome,
            blob,
            size: content.len(),
        });
    }

    index.write()?;
    for (name, filter) in processes {
        match filter.finish().await {
            Ok(status) if !status.success() => warn!("Filter process `{name}` exited with {status}"),
            Ok(_) => {}
            Err(e) => warn!("Filter process `{name}` did not shut down cleanly: {e}"),
        }
    }
    Ok(reports)
}

/// Bytes stored in the index for `path`.
pub fn read_staged(repo: &Repository, path: &Path) -> AppResult<Vec<u8>> {
    let workdir = repo
        .workdir()
        .ok_or_else(|| AppError::BareRepository(repo.path().display().to_string()))?;
    let rel = relative_to(workdir, path)?;
    let index = repo.index()?;
    let entry = index
        .get_path(&rel, 0)
        .ok_or_else(|| AppError::Other(format!("{} is not staged", rel.display())))?;
    Ok(repo.find_blob(entry.id)?.content().to_vec())
}

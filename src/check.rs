use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};
use serde::Serialize;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::AppResult;
use crate::notebook::{Inspection, Notebook, StripScope};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum CheckStatus {
    Clean,
    Dirty(Inspection),
    Unreadable { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckEntry {
    pub path: PathBuf,
    #[serde(flatten)]
    pub status: CheckStatus,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CheckReport {
    pub entries: Vec<CheckEntry>,
}

impl CheckReport {
    pub fn dirty(&self) -> impl Iterator<Item = &CheckEntry> {
        self.entries
            .iter()
            .filter(|e| matches!(e.status, CheckStatus::Dirty(_)))
    }

    pub fn unreadable(&self) -> impl Iterator<Item = &CheckEntry> {
        self.entries
            .iter()
            .filter(|e| matches!(e.status, CheckStatus::Unreadable { .. }))
    }

    pub fn is_clean(&self) -> bool {
        self.dirty().next().is_none()
    }
}

/// Glob matched the way attribute patterns are: against the file name, or
/// against the path relative to the walk root when the pattern has a slash.
struct Selector {
    pattern: Pattern,
    anchored: bool,
}

impl Selector {
    fn new(pattern: &str) -> AppResult<Self> {
        Ok(Self {
            anchored: pattern.contains('/'),
            pattern: Pattern::new(pattern.trim_start_matches('/'))?,
        })
    }

    fn matches(&self, root: &Path, path: &Path) -> bool {
        let opts = MatchOptions {
            require_literal_separator: true,
            ..MatchOptions::new()
        };
        if self.anchored {
            path.strip_prefix(root)
                .is_ok_and(|rel| self.pattern.matches_path_with(rel, opts))
        } else {
            path.file_name()
                .is_some_and(|name| self.pattern.matches_with(&name.to_string_lossy(), opts))
        }
    }
}

fn inspect_file(path: &Path, scope: StripScope) -> CheckStatus {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => return CheckStatus::Unreadable { reason: e.to_string() },
    };
    match Notebook::parse(&bytes) {
        Ok(nb) => {
            let inspection = nb.inspect(scope);
            if inspection.is_clean() {
                CheckStatus::Clean
            } else {
                CheckStatus::Dirty(inspection)
            }
        }
        Err(e) => CheckStatus::Unreadable { reason: e.to_string() },
    }
}

/// Inspect every notebook under `paths`. Files named directly are always
/// checked; directories are walked and filtered by `pattern`.
#[tracing::instrument(name = "Checking notebooks", level = "info", skip(paths))]
pub fn check(paths: &[PathBuf], pattern: &str, scope: StripScope) -> AppResult<CheckReport> {
    let selector = Selector::new(pattern)?;
    let mut report = CheckReport::default();

    for root in paths {
        if root.is_file() {
            report.entries.push(CheckEntry {
                path: root.clone(),
                status: inspect_file(root, scope),
            });
            continue;
        }
        let walker = WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.file_name() != ".git");
        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() || !selector.matches(root, entry.path()) {
                continue;
            }
            let status = inspect_file(entry.path(), scope);
            match &status {
                CheckStatus::Dirty(i) => debug!(
                    "{} has {} outputs and {} execution counts",
                    entry.path().display(),
                    i.outputs,
                    i.counts
                ),
                CheckStatus::Unreadable { reason } => {
                    warn!("Skipping {}: {reason}", entry.path().display())
                }
                CheckStatus::Clean => {}
            }
            report.entries.push(CheckEntry {
                path: entry.into_path(),
                status,
            });
        }
    }
    Ok(report)
}

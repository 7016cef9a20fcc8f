use std::fmt::Display;
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use git2::Repository;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{AppError, AppResult};

/// Which attributes file carries the pattern-to-filter mapping.
#[derive(ValueEnum, Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AttributesTarget {
    /// `.gitattributes` at the root of the working tree, shared through commits
    #[default]
    Worktree,
    /// `.git/info/attributes`, private to this clone
    Info,
}

impl AttributesTarget {
    pub fn path(&self, repo: &Repository) -> AppResult<PathBuf> {
        match self {
            AttributesTarget::Worktree => repo
                .workdir()
                .map(|dir| dir.join(".gitattributes"))
                .ok_or_else(|| AppError::BareRepository(repo.path().display().to_string())),
            AttributesTarget::Info => Ok(repo.path().join("info").join("attributes")),
        }
    }
}

impl Display for AttributesTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttributesTarget::Worktree => write!(f, "worktree"),
            AttributesTarget::Info => write!(f, "info"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    /// Blank lines, comments and macro definitions are kept as written.
    Verbatim(String),
    Mapping { pattern: String, attrs: Vec<String> },
}

impl Line {
    fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with("[attr]") {
            return Line::Verbatim(raw.to_string());
        }
        let (pattern, rest) = split_pattern(trimmed);
        Line::Mapping {
            pattern: pattern.to_string(),
            attrs: rest.split_whitespace().map(str::to_string).collect(),
        }
    }

    fn has_filter(&self, name: &str) -> bool {
        match self {
            Line::Mapping { attrs, .. } => attrs.iter().any(|a| is_filter_attr(a, name)),
            Line::Verbatim(_) => false,
        }
    }
}

impl Display for Line {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Line::Verbatim(raw) => write!(f, "{raw}"),
            Line::Mapping { pattern, attrs } if attrs.is_empty() => write!(f, "{pattern}"),
            Line::Mapping { pattern, attrs } => write!(f, "{pattern} {}", attrs.join(" ")),
        }
    }
}

/// Quoted patterns (`"with space.ipynb" filter=x`) keep their quotes.
fn split_pattern(line: &str) -> (&str, &str) {
    if line.starts_with('"') {
        let mut escaped = false;
        for (i, ch) in line.char_indices().skip(1) {
            match ch {
                '\\' if !escaped => escaped = true,
                '"' if !escaped => return (&line[..=i], &line[i + 1..]),
                _ => escaped = false,
            }
        }
    }
    match line.find(char::is_whitespace) {
        Some(i) => (&line[..i], &line[i..]),
        None => (line, ""),
    }
}

fn filter_attr(name: &str) -> String {
    format!("filter={name}")
}

fn is_filter_attr(attr: &str, name: &str) -> bool {
    attr.strip_prefix("filter=") == Some(name)
}

/// An attributes file, editable line by line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes {
    lines: Vec<Line>,
    /// Files written with CRLF endings are saved with CRLF again.
    crlf: bool,
}

impl Attributes {
    pub fn parse(content: &str) -> Self {
        Self {
            lines: content.lines().map(Line::parse).collect(),
            crlf: content.contains("\r\n"),
        }
    }

    /// Read `path`, treating a missing file as empty.
    pub fn load(path: &Path) -> AppResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(Self::parse(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write to `path`. A file left without any lines is removed.
    pub fn save(&self, path: &Path) -> AppResult<()> {
        if self.lines.is_empty() {
            match std::fs::remove_file(path) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
                _ => return Ok(()),
            }
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_string())?;
        debug!("Wrote attributes to {}", path.display());
        Ok(())
    }

    /// Map `pattern` to the filter `name`. Returns whether anything changed.
    pub fn ensure_filter(&mut self, pattern: &str, name: &str) -> bool {
        let wanted = filter_attr(name);
        for line in &mut self.lines {
            let Line::Mapping { pattern: p, attrs } = line else {
                continue;
            };
            if p.as_str() != pattern {
                continue;
            }
            if attrs.contains(&wanted) {
                return false;
            }
            // Same pattern bound to some other filter: rebind it.
            if let Some(attr) = attrs
                .iter_mut()
                .find(|a| a.starts_with("filter=") || a.as_str() == "-filter")
            {
                *attr = wanted;
                return true;
            }
        }
        self.lines.push(Line::Mapping {
            pattern: pattern.to_string(),
            attrs: vec![wanted],
        });
        true
    }

    /// Drop every `filter=<name>` attribute, and lines left with nothing else.
    /// Returns the number of attributes removed.
    pub fn remove_filter(&mut self, name: &str) -> usize {
        let mut removed = 0;
        self.lines.retain_mut(|line| match line {
            Line::Verbatim(_) => true,
            Line::Mapping { attrs, .. } => {
                let before = attrs.len();
                attrs.retain(|a| !is_filter_attr(a, name));
                removed += before - attrs.len();
                before == attrs.len() || !attrs.is_empty()
            }
        });
        removed
    }

    /// Rendered lines that route files through the filter `name`.
    pub fn lines_for(&self, name: &str) -> Vec<String> {
        self.lines
            .iter()
            .filter(|line| line.has_filter(name))
            .map(Line::to_string)
            .collect()
    }
}

impl Display for Attributes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let newline = if self.crlf { "\r\n" } else { "\n" };
        for line in &self.lines {
            write!(f, "{line}{newline}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn appends_mapping_once() {
        let mut attrs = Attributes::parse("# notebooks\n*.png binary\n");
        assert!(attrs.ensure_filter("*.ipynb", "strip"));
        assert!(!attrs.ensure_filter("*.ipynb", "strip"));
        assert_eq!(
            attrs.to_string(),
            "# notebooks\n*.png binary\n*.ipynb filter=strip\n"
        );
    }

    #[test]
    fn crlf_endings_are_kept() {
        let mut attrs = Attributes::parse("# keep\r\n*.png binary\r\n");
        assert!(attrs.ensure_filter("*.ipynb", "strip"));
        assert_eq!(
            attrs.to_string(),
            "# keep\r\n*.png binary\r\n*.ipynb filter=strip\r\n"
        );
        assert_eq!(attrs.lines_for("strip"), ["*.ipynb filter=strip"]);
    }

    #[test]
    fn rebinds_pattern_with_other_filter() {
        let mut attrs = Attributes::parse("*.ipynb filter=old diff=jupyter\n");
        assert!(attrs.ensure_filter("*.ipynb", "strip"));
        assert_eq!(attrs.to_string(), "*.ipynb filter=strip diff=jupyter\n");
    }

    #[test]
    fn removal_keeps_unrelated_attributes() {
        let mut attrs =
            Attributes::parse("*.ipynb filter=strip diff=jupyter\n*.nb filter=strip\n\n# end\n");
        assert_eq!(attrs.remove_filter("strip"), 2);
        assert_eq!(attrs.to_string(), "*.ipynb diff=jupyter\n\n# end\n");
        assert_eq!(attrs.remove_filter("strip"), 0);
    }

    #[test]
    fn quoted_patterns_stay_whole() {
        let attrs = Attributes::parse("\"my notes.ipynb\" filter=strip\n");
        assert_eq!(attrs.lines_for("strip"), ["\"my notes.ipynb\" filter=strip"]);
        assert!(attrs.lines_for("other").is_empty());
    }

    #[test]
    fn save_removes_emptied_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".gitattributes");
        let mut attrs = Attributes::default();
        attrs.ensure_filter("*.ipynb", "strip");
        attrs.save(&path).unwrap();
        assert_eq!(Attributes::load(&path).unwrap(), attrs);

        attrs.remove_filter("strip");
        attrs.save(&path).unwrap();
        assert!(!path.exists());
        assert_eq!(Attributes::load(&path).unwrap(), Attributes::default());
    }
}

use std::env;
use std::ffi::OsString;
use std::fmt::Display;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DirError {
    #[error("Directory not found: {0}")]
    DirNotFound(String),
    #[error("IO Error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type DirResult<T> = Result<T, DirError>;

/// Application name used to namespace directories.
pub static APP_NAME: &str = "nbclean";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirType {
    Config,
    State,
}

impl Display for DirType {
    /// Pretty-print the default directory path hint for this dir type.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DirType::Config => write!(f, "~/.config/")?,
            DirType::State => write!(f, "~/.local/state/")?,
        };
        write!(f, "{}", APP_NAME)
    }
}

impl DirType {
    /// XDG environment variable key for this directory type.
    fn xdg_key(&self) -> &'static str {
        match self {
            DirType::Config => "XDG_CONFIG_HOME",
            DirType::State => "XDG_STATE_HOME",
        }
    }

    /// Relative default path under HOME when XDG is not set.
    fn rel_path(&self) -> &'static str {
        match self {
            DirType::Config => ".config",
            DirType::State => ".local/state",
        }
    }

    /// Resolve the directory path from XDG or fallback environment hints.
    pub fn get_dir(&self) -> DirResult<PathBuf> {
        self.resolve_with(|key| env::var_os(key), env::home_dir)
    }

    /// Resolution against an injected environment.
    fn resolve_with<E, H>(&self, var: E, home: H) -> DirResult<PathBuf>
    where
        E: Fn(&str) -> Option<OsString>,
        H: FnOnce() -> Option<PathBuf>,
    {
        // Empty XDG variables count as unset.
        if let Some(dir) = var(self.xdg_key()).filter(|d| !d.is_empty()) {
            Ok(PathBuf::from(dir).join(APP_NAME))
        } else if let Some(home_dir) = home() {
            Ok(home_dir.join(self.rel_path()).join(APP_NAME))
        } else if let Some(home) = var("HOME") {
            Ok(PathBuf::from(home).join(self.rel_path()).join(APP_NAME))
        } else if let Some(userprofile) = var("USERPROFILE") {
            Ok(PathBuf::from(userprofile)
                .join(self.rel_path())
                .join(APP_NAME))
        } else {
            Err(DirError::DirNotFound(self.to_string()))
        }
    }

    /// Path of a named file inside this directory. The directory is not created.
    pub fn file<P: AsRef<Path>>(&self, name: P) -> DirResult<PathBuf> {
        Ok(self.get_dir()?.join(name))
    }

    /// Ensure the directory exists, creating it if needed.
    pub fn ensure_dir(&self) -> DirResult<PathBuf> {
        let dir = self.get_dir()?;
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> HashMap<String, OsString> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), OsString::from(v)))
            .collect()
    }

    #[test]
    fn xdg_variable_wins() {
        let vars = env_of(&[("XDG_CONFIG_HOME", "/xdg/config"), ("HOME", "/home/u")]);
        let dir = DirType::Config
            .resolve_with(|k| vars.get(k).cloned(), || Some(PathBuf::from("/home/u")))
            .unwrap();
        assert_eq!(dir, PathBuf::from("/xdg/config/nbclean"));
    }

    #[test]
    fn empty_xdg_variable_falls_back_to_home() {
        let vars = env_of(&[("XDG_STATE_HOME", "")]);
        let dir = DirType::State
            .resolve_with(|k| vars.get(k).cloned(), || Some(PathBuf::from("/home/u")))
            .unwrap();
        assert_eq!(dir, PathBuf::from("/home/u/.local/state/nbclean"));
    }

    #[test]
    fn userprofile_is_last_resort() {
        let vars = env_of(&[("USERPROFILE", "C:/Users/u")]);
        let dir = DirType::State
            .resolve_with(|k| vars.get(k).cloned(), || None)
            .unwrap();
        assert_eq!(dir, PathBuf::from("C:/Users/u/.local/state/nbclean"));
    }

    #[test]
    fn missing_everything_is_an_error() {
        let err = DirType::Config
            .resolve_with(|_| None, || None)
            .unwrap_err();
        assert!(matches!(err, DirError::DirNotFound(ref hint) if hint == "~/.config/nbclean"));
    }
}

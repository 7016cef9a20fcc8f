use thiserror::Error;

use crate::filter::FilterError;
use crate::notebook::NotebookError;
use crate::pktline::PktLineError;
use crate::process::ProcessError;

/// Unified application error type to simplify bubbling errors through async flows.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Errored while handling a file. {0}")]
    Io(#[from] std::io::Error),
    #[error("Error from git. {0}")]
    Git(#[from] git2::Error),
    #[error("Error serializing json. {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("Error reading the configuration file. {0}")]
    Config(#[from] serde_path_to_error::Error<serde_json::Error>),
    #[error("{0}")]
    Notebook(#[from] NotebookError),
    #[error("{0}")]
    Filter(#[from] FilterError),
    #[error("Error in the filter protocol. {0}")]
    Protocol(#[from] PktLineError),
    #[error("{0}")]
    Process(#[from] ProcessError),
    #[error("Invalid glob pattern. {0}")]
    Pattern(#[from] glob::PatternError),
    #[error("Error walking the directory tree. {0}")]
    Walk(#[from] walkdir::Error),
    #[error("Runtime error. {0}")]
    TokioJoin(#[from] tokio::task::JoinError),
    #[error("Directory not found error. {0}")]
    Dirs(#[from] nbclean_dirs::DirError),
    #[error("Filter `{name}` failed for {path} and is marked as required. {reason}")]
    RequiredFilter {
        name: String,
        path: String,
        reason: String,
    },
    #[error("Repository has no working directory: {0}")]
    BareRepository(String),
    #[error("{0}")]
    Other(String),
}

/// Convenience alias for results that bubble `AppError`.
pub type AppResult<T> = Result<T, AppError>;

use clap::ValueEnum;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::notebook::{Notebook, NotebookError, StripReport, StripScope};
use crate::render::{OutputStyle, render};

#[derive(Error, Debug)]
pub enum FilterError {
    #[error("Unable to clean {pathname}. {source}")]
    Rejected {
        pathname: String,
        #[source]
        source: NotebookError,
    },
    #[error("Unable to serialize the cleaned notebook. {0}")]
    Render(#[from] serde_json::Error),
    #[error("Filter stream error. {0}")]
    Io(#[from] std::io::Error),
}

pub type FilterResult<T> = Result<T, FilterError>;

/// What the clean filter does with input it cannot parse as a notebook.
#[derive(
    ValueEnum, Serialize, Deserialize, JsonSchema, Clone, Copy, Debug, Default, PartialEq, Eq,
)]
#[serde(rename_all = "kebab-case")]
pub enum OnError {
    /// Emit the input unchanged and exit successfully
    #[default]
    Passthrough,
    /// Exit with an error so git decides what to store
    Fail,
}

/// Knobs shared by every entry point that cleans notebooks.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct CleanOptions {
    pub scope: StripScope,
    pub style: OutputStyle,
    pub on_error: OnError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanOutcome {
    Cleaned { bytes: Vec<u8>, report: StripReport },
    Passthrough { bytes: Vec<u8>, reason: String },
}

impl CleanOutcome {
    pub fn bytes(&self) -> &[u8] {
        match self {
            CleanOutcome::Cleaned { bytes, .. } | CleanOutcome::Passthrough { bytes, .. } => bytes,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            CleanOutcome::Cleaned { bytes, .. } | CleanOutcome::Passthrough { bytes, .. } => bytes,
        }
    }
}

/// Strip a notebook held in memory.
///
/// `pathname` is only used for diagnostics; git hands it over through `%f`
/// or the process protocol when available.
#[tracing::instrument(level = "debug", skip(input, opts), fields(len = input.len()))]
pub fn clean(
    input: &[u8],
    opts: &CleanOptions,
    pathname: Option<&str>,
) -> FilterResult<CleanOutcome> {
    let pathname = pathname.unwrap_or("<stdin>");

    // Newly added empty files reach the filter as empty input.
    if input.is_empty() {
        debug!("Empty input for {pathname}, nothing to clean");
        return Ok(CleanOutcome::Passthrough {
            bytes: Vec::new(),
            reason: "empty input".to_string(),
        });
    }

    let mut notebook = match Notebook::parse(input) {
        Ok(nb) => nb,
        Err(source) => {
            return match opts.on_error {
                OnError::Passthrough => {
                    warn!("Passing {pathname} through unchanged: {source}");
                    Ok(CleanOutcome::Passthrough {
                        bytes: input.to_vec(),
                        reason: source.to_string(),
                    })
                }
                OnError::Fail => Err(FilterError::Rejected {
                    pathname: pathname.to_string(),
                    source,
                }),
            };
        }
    };

    let report = notebook.strip(opts.scope);
    let bytes = render(notebook.as_value(), opts.style)?;
    info!(
        nbformat = ?notebook.nbformat(),
        "Cleaned {pathname}: {} outputs removed, {} execution counts cleared",
        report.outputs_removed,
        report.counts_cleared
    );
    Ok(CleanOutcome::Cleaned { bytes, report })
}

/// Checkout side of the filter. Nothing is restored, content passes through.
pub fn smudge(input: &[u8]) -> Vec<u8> {
    input.to_vec()
}

/// Read all of `reader`, clean it and write the result to `writer`.
pub async fn run_clean<R, W>(
    mut reader: R,
    mut writer: W,
    opts: &CleanOptions,
    pathname: Option<&str>,
) -> FilterResult<CleanOutcome>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut input = Vec::new();
    reader.read_to_end(&mut input).await?;
    let outcome = clean(&input, opts, pathname)?;
    writer.write_all(outcome.bytes()).await?;
    writer.flush().await?;
    Ok(outcome)
}

/// Copy `reader` to `writer` untouched.
pub async fn run_smudge<R, W>(mut reader: R, mut writer: W) -> FilterResult<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = tokio::io::copy(&mut reader, &mut writer).await?;
    writer.flush().await?;
    debug!("Smudge passed {copied} bytes through");
    Ok(copied)
}

//! Git's long-running filter protocol (version 2).
//!
//! With `filter.<name>.process` configured, git starts the filter once and
//! sends every file of a command through the same pipe pair instead of
//! spawning one process per file. The server side here answers `clean` and
//! `smudge` requests; the client side is used when staging through libgit2.

use std::path::Path;
use std::process::{ExitStatus, Stdio};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use crate::filter::{CleanOptions, clean, smudge};
use crate::pktline::{PktLineError, PktReader, PktWriter};

const CLIENT_WELCOME: &str = "git-filter-client";
const SERVER_WELCOME: &str = "git-filter-server";
const VERSION: &str = "version=2";
const SUPPORTED: [&str; 2] = ["clean", "smudge"];

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error(transparent)]
    PktLine(#[from] PktLineError),
    #[error("Filter handshake failed: {0}")]
    Handshake(String),
    #[error("Filter process does not support `{0}`")]
    Unsupported(String),
    #[error("Filter process answered `{status}` for {pathname}")]
    Status { status: String, pathname: String },
    #[error("Unable to start filter process `{command}`. {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Filter process IO error. {0}")]
    Io(#[from] std::io::Error),
}

pub type ProcessResult<T> = Result<T, ProcessError>;

/// Counters reported once git closes the pipe.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ServeStats {
    pub cleaned: usize,
    pub smudged: usize,
    pub failed: usize,
}

/// One request as sent by git: a key/value header list followed by content.
#[derive(Debug, Default)]
struct Request {
    command: String,
    pathname: Option<String>,
}

impl Request {
    fn from_lines(lines: &[String]) -> Self {
        let mut request = Request::default();
        for line in lines {
            match line.split_once('=') {
                Some(("command", value)) => request.command = value.to_string(),
                Some(("pathname", value)) => request.pathname = Some(value.to_string()),
                // `ref`, `treeish`, `blob`, `can-delay` and friends carry nothing we use.
                _ => debug!("Ignoring request header `{line}`"),
            }
        }
        request
    }
}

/// Answer filter requests on `reader`/`writer` until git closes the stream.
#[tracing::instrument(name = "Serving filter process", level = "info", skip_all)]
pub async fn serve<R, W>(reader: R, writer: W, opts: &CleanOptions) -> ProcessResult<ServeStats>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = PktReader::new(reader);
    let mut writer = PktWriter::new(writer);

    let welcome = reader.expect_text_list().await?;
    if welcome.first().map(String::as_str) != Some(CLIENT_WELCOME) {
        return Err(ProcessError::Handshake(format!(
            "expected `{CLIENT_WELCOME}`, got {welcome:?}"
        )));
    }
    if !welcome.iter().any(|line| line == VERSION) {
        return Err(ProcessError::Handshake(format!(
            "client does not offer {VERSION}: {welcome:?}"
        )));
    }
    writer.write_text_list(&[SERVER_WELCOME, VERSION]).await?;
    writer.flush().await?;

    let offered = reader.expect_text_list().await?;
    let agreed: Vec<&str> = offered
        .iter()
        .filter_map(|line| line.strip_prefix("capability="))
        .filter(|cap| SUPPORTED.contains(cap))
        .collect();
    let caps: Vec<String> = agreed.iter().map(|cap| format!("capability={cap}")).collect();
    writer.write_text_list(&caps).await?;
    writer.flush().await?;
    debug!(?agreed, "Filter handshake complete");

    let mut stats = ServeStats::default();
    while let Some(headers) = reader.read_text_list().await? {
        let request = Request::from_lines(&headers);
        let content = reader.read_content().await?;
        let pathname = request.pathname.as_deref();

        let response = if !agreed.contains(&request.command.as_str()) {
            warn!("Unsupported filter command `{}`", request.command);
            None
        } else if request.command == "clean" {
            match clean(&content, opts, pathname) {
                Ok(outcome) => Some(outcome.into_bytes()),
                Err(e) => {
                    warn!("{e}");
                    None
                }
            }
        } else {
            Some(smudge(&content))
        };

        match response {
            Some(bytes) => {
                writer.write_text_list(&["status=success"]).await?;
                writer.write_content(&bytes).await?;
                // Empty trailing list keeps the status.
                writer.write_flush().await?;
                if request.command == "clean" {
                    stats.cleaned += 1;
                } else {
                    stats.smudged += 1;
                }
            }
            None => {
                writer.write_text_list(&["status=error"]).await?;
                stats.failed += 1;
            }
        }
        writer.flush().await?;
    }

    info!(
        "Filter process done: {} cleaned, {} smudged, {} failed",
        stats.cleaned, stats.smudged, stats.failed
    );
    Ok(stats)
}

/// The git side of the protocol.
#[derive(Debug)]
pub struct ProcessClient<R, W> {
    reader: PktReader<R>,
    writer: PktWriter<W>,
    capabilities: Vec<String>,
}

impl<R, W> ProcessClient<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub async fn handshake(reader: R, writer: W) -> ProcessResult<Self> {
        let mut reader = PktReader::new(reader);
        let mut writer = PktWriter::new(writer);

        writer.write_text_list(&[CLIENT_WELCOME, VERSION]).await?;
        writer.flush().await?;
        let welcome = reader.expect_text_list().await?;
        if welcome.first().map(String::as_str) != Some(SERVER_WELCOME)
            || !welcome.iter().any(|line| line == VERSION)
        {
            return Err(ProcessError::Handshake(format!(
                "unexpected server welcome {welcome:?}"
            )));
        }

        let offered: Vec<String> = SUPPORTED
            .iter()
            .map(|cap| format!("capability={cap}"))
            .collect();
        writer.write_text_list(&offered).await?;
        writer.flush().await?;
        let capabilities = reader
            .expect_text_list()
            .await?
            .iter()
            .filter_map(|line| line.strip_prefix("capability="))
            .map(str::to_string)
            .collect();

        Ok(Self {
            reader,
            writer,
            capabilities,
        })
    }

    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|cap| cap == capability)
    }

    /// Send one file and return the filtered content.
    pub async fn request(
        &mut self,
        command: &str,
        pathname: &str,
        content: &[u8],
    ) -> ProcessResult<Vec<u8>> {
        if !self.supports(command) {
            return Err(ProcessError::Unsupported(command.to_string()));
        }

        self.writer
            .write_text_list(&[format!("command={command}"), format!("pathname={pathname}")])
            .await?;
        self.writer.write_content(content).await?;
        self.writer.flush().await?;

        let status = status_of(&self.reader.expect_text_list().await?);
        if status.as_deref() != Some("success") {
            return Err(ProcessError::Status {
                status: status.unwrap_or_else(|| "<none>".to_string()),
                pathname: pathname.to_string(),
            });
        }

        let filtered = self.reader.read_content().await?;
        // The filter may revise its status after the content.
        if let Some(late) = status_of(&self.reader.expect_text_list().await?)
            && late != "success"
        {
            return Err(ProcessError::Status {
                status: late,
                pathname: pathname.to_string(),
            });
        }
        Ok(filtered)
    }

    pub fn into_parts(self) -> (R, W) {
        (self.reader.into_inner(), self.writer.into_inner())
    }
}

fn status_of(lines: &[String]) -> Option<String> {
    lines
        .iter()
        .rev()
        .find_map(|line| line.strip_prefix("status="))
        .map(str::to_string)
}

/// A filter process started from a configured `filter.<name>.process` command.
#[derive(Debug)]
pub struct SpawnedFilter {
    child: Child,
    client: ProcessClient<ChildStdout, ChildStdin>,
}

impl SpawnedFilter {
    #[tracing::instrument(name = "Starting filter process", level = "debug", skip(cwd))]
    pub async fn spawn(command: &str, cwd: &Path) -> ProcessResult<Self> {
        let spawn_err = |source| ProcessError::Spawn {
            command: command.to_string(),
            source,
        };
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_err)?;

        let (Some(stdout), Some(stdin)) = (child.stdout.take(), child.stdin.take()) else {
            return Err(ProcessError::Handshake(
                "filter process pipes are unavailable".to_string(),
            ));
        };
        let client = ProcessClient::handshake(stdout, stdin).await?;
        Ok(Self { child, client })
    }

    pub async fn clean(&mut self, pathname: &str, content: &[u8]) -> ProcessResult<Vec<u8>> {
        self.client.request("clean", pathname, content).await
    }

    /// Close the pipe and wait for the process to exit.
    pub async fn finish(self) -> ProcessResult<ExitStatus> {
        let SpawnedFilter { mut child, client } = self;
        let (stdout, stdin) = client.into_parts();
        drop(stdin);
        drop(stdout);
        Ok(child.wait().await?)
    }
}

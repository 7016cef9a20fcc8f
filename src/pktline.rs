//! Git pkt-line framing.
//!
//! Every packet starts with four lowercase hex digits holding the total packet
//! length, header included. `0000` is a flush packet that ends a list.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Largest packet git produces or accepts, header included.
pub const MAX_PACKET_LEN: usize = 65520;
/// Largest payload that fits in one packet.
pub const MAX_PAYLOAD_LEN: usize = MAX_PACKET_LEN - 4;

const FLUSH: &[u8; 4] = b"0000";

#[derive(Error, Debug)]
pub enum PktLineError {
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid pkt-line header {0:?}")]
    InvalidHeader(String),
    #[error("Invalid pkt-line length {0}")]
    InvalidLength(usize),
    #[error("Stream ended in the middle of a packet")]
    UnexpectedEof,
    #[error("Payload of {0} bytes does not fit in a single packet")]
    Oversized(usize),
}

pub type PktResult<T> = Result<T, PktLineError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Flush,
    Data(Vec<u8>),
}

#[derive(Debug)]
pub struct PktReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> PktReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Next packet, or `None` when the stream ends cleanly between packets.
    pub async fn read_packet(&mut self) -> PktResult<Option<Packet>> {
        let mut header = [0u8; 4];
        let mut filled = 0;
        while filled < header.len() {
            let n = self.inner.read(&mut header[filled..]).await?;
            if n == 0 {
                return if filled == 0 {
                    Ok(None)
                } else {
                    Err(PktLineError::UnexpectedEof)
                };
            }
            filled += n;
        }

        let len = parse_header(&header)?;
        if len == 0 {
            trace!("pkt-line flush");
            return Ok(Some(Packet::Flush));
        }

        let mut payload = vec![0u8; len - 4];
        self.inner
            .read_exact(&mut payload)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => PktLineError::UnexpectedEof,
                _ => PktLineError::Io(e),
            })?;
        trace!("pkt-line data ({} bytes)", payload.len());
        Ok(Some(Packet::Data(payload)))
    }

    /// Text packets up to the next flush, each stripped of its trailing newline.
    ///
    /// Returns `None` when the stream ends before the first packet of the list.
    pub async fn read_text_list(&mut self) -> PktResult<Option<Vec<String>>> {
        let mut lines = Vec::new();
        loop {
            match self.read_packet().await? {
                None if lines.is_empty() => return Ok(None),
                None => return Err(PktLineError::UnexpectedEof),
                Some(Packet::Flush) => return Ok(Some(lines)),
                Some(Packet::Data(data)) => lines.push(text_of(data)),
            }
        }
    }

    /// Same as [`Self::read_text_list`], but a closed stream is an error.
    pub async fn expect_text_list(&mut self) -> PktResult<Vec<String>> {
        self.read_text_list()
            .await?
            .ok_or(PktLineError::UnexpectedEof)
    }

    /// Concatenated payload of data packets up to the next flush.
    pub async fn read_content(&mut self) -> PktResult<Vec<u8>> {
        let mut content = Vec::new();
        loop {
            match self.read_packet().await? {
                None => return Err(PktLineError::UnexpectedEof),
                Some(Packet::Flush) => return Ok(content),
                Some(Packet::Data(data)) => content.extend_from_slice(&data),
            }
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

#[derive(Debug)]
pub struct PktWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> PktWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write_data(&mut self, payload: &[u8]) -> PktResult<()> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(PktLineError::Oversized(payload.len()));
        }
        let header = format!("{:04x}", payload.len() + 4);
        self.inner.write_all(header.as_bytes()).await?;
        self.inner.write_all(payload).await?;
        Ok(())
    }

    /// Write `line` followed by a newline as one packet.
    pub async fn write_text(&mut self, line: &str) -> PktResult<()> {
        let mut payload = Vec::with_capacity(line.len() + 1);
        payload.extend_from_slice(line.as_bytes());
        payload.push(b'\n');
        self.write_data(&payload).await
    }

    pub async fn write_flush(&mut self) -> PktResult<()> {
        self.inner.write_all(FLUSH).await?;
        Ok(())
    }

    /// Write each line as a text packet, then a flush.
    pub async fn write_text_list<S: AsRef<str>>(&mut self, lines: &[S]) -> PktResult<()> {
        for line in lines {
            self.write_text(line.as_ref()).await?;
        }
        self.write_flush().await
    }

    /// Split `content` over as many packets as needed, then a flush.
    pub async fn write_content(&mut self, content: &[u8]) -> PktResult<()> {
        for chunk in content.chunks(MAX_PAYLOAD_LEN) {
            self.write_data(chunk).await?;
        }
        self.write_flush().await
    }

    pub async fn flush(&mut self) -> PktResult<()> {
        self.inner.flush().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

fn parse_header(header: &[u8; 4]) -> PktResult<usize> {
    let text = std::str::from_utf8(header)
        .map_err(|_| PktLineError::InvalidHeader(String::from_utf8_lossy(header).into_owned()))?;
    let len = usize::from_str_radix(text, 16)
        .map_err(|_| PktLineError::InvalidHeader(text.to_string()))?;
    match len {
        0 => Ok(0),
        1..=3 => Err(PktLineError::InvalidLength(len)),
        n if n > MAX_PACKET_LEN => Err(PktLineError::InvalidLength(n)),
        n => Ok(n),
    }
}

fn text_of(mut data: Vec<u8>) -> String {
    if data.last() == Some(&b'\n') {
        data.pop();
    }
    String::from_utf8_lossy(&data).into_owned()
}

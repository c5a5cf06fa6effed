//! Wire protocol for daemon communication
//!
//! Frames are a 4-byte big-endian length followed by a msgpack body.

use crate::error::{ErrorKind, SandpitError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame either side will accept
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Request types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    /// Create or reuse the session's sandbox
    Start { session: String },
    /// Run code in the session's sandbox
    Execute { session: String, code: String },
    /// Check code with the static checker
    Lint { session: String, code: String },
    /// Destroy the session's sandbox
    Stop { session: String },
    /// Save editor tabs (file name -> text) into the sandbox
    SaveTabs {
        session: String,
        tabs: BTreeMap<String, String>,
    },
    /// Get registry status
    Status,
    /// Ping
    Ping,
}

/// Response types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    Started,
    /// Script output split into its document block and text
    Executed { html: Option<String>, text: String },
    /// Checker report, possibly empty
    Linted { report: String },
    Stopped,
    TabsSaved,
    /// Registry status
    Status { sessions: usize },
    /// Pong
    Pong,
    /// Error
    Error { kind: ErrorKind, message: String },
}

impl Response {
    #[must_use]
    pub fn from_error(error: &SandpitError) -> Self {
        Self::Error {
            kind: error.kind(),
            message: error.message(),
        }
    }
}

impl From<SandpitError> for Response {
    fn from(error: SandpitError) -> Self {
        Self::from_error(&error)
    }
}

/// Encode a message to msgpack
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, rmp_serde::encode::Error> {
    rmp_serde::to_vec_named(msg)
}

/// Decode a message from msgpack
pub fn decode<'a, T: Deserialize<'a>>(data: &'a [u8]) -> Result<T, rmp_serde::decode::Error> {
    rmp_serde::from_slice(data)
}

/// Read one frame; `None` on a clean end of stream
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

/// Write one frame and flush
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> std::io::Result<()> {
    let len = u32::try_from(body.len())
        .ok()
        .filter(|len| *len as usize <= MAX_FRAME_LEN)
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame too large"))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await
}

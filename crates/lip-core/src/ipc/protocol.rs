//! Shared protocol types and framing.
//!
//! Defines the wire format: 4-byte big-endian length prefix followed by a
//! UTF-8 JSON payload holding a [`Request`] or a [`Response`].
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```

use crate::config::ProtocolConfig;
use crate::{LipError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::warn;

/// Control flags carried by a request.
///
/// With no flag set the request is a plain call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestFlags {
    /// Ask the server to stop accepting connections and release its endpoint.
    pub exit: bool,
    /// Ask for the names of the functions served behind the endpoint.
    pub list: bool,
    /// Ask for the docstring of the served function.
    pub docstring: bool,
}

/// A single request sent to a function server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Request {
    /// Target function. `None` addresses whatever the endpoint serves.
    pub function: Option<String>,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub flags: RequestFlags,
}

impl Request {
    /// Create a call request.
    pub fn call(function: impl Into<String>, args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self {
            function: Some(function.into()),
            args,
            kwargs,
            flags: RequestFlags::default(),
        }
    }

    /// Create a docstring query.
    pub fn docstring(function: impl Into<String>) -> Self {
        Self {
            function: Some(function.into()),
            flags: RequestFlags {
                docstring: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Create a directory listing query.
    pub fn list() -> Self {
        Self {
            flags: RequestFlags {
                list: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Create a graceful shutdown request.
    pub fn exit() -> Self {
        Self {
            flags: RequestFlags {
                exit: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// Failure description carried by an error response.
///
/// This is also the error type served functions return: `kind` names the
/// failure category, `message` the human-readable detail.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ErrorDescriptor {
    pub kind: String,
    pub message: String,
}

impl ErrorDescriptor {
    /// The requested function is not served here. The message is its name.
    pub const NOT_FOUND: &'static str = "NotFound";
    /// Arguments did not bind to the declared signature.
    pub const INVALID_ARGUMENTS: &'static str = "InvalidArguments";
    /// The server stopped before the request completed.
    pub const TERMINATED: &'static str = "Terminated";
    /// The served function panicked.
    pub const PANIC: &'static str = "Panic";
    /// The result does not fit in one frame.
    pub const RESULT_TOO_LARGE: &'static str = "ResultTooLarge";
    pub const PROTOCOL: &'static str = "ProtocolError";
    pub const INTERNAL: &'static str = "InternalError";

    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Shorthand for an `InvalidArguments` failure.
    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_ARGUMENTS, message)
    }

    /// Shorthand for a `ResultTooLarge` failure of an encoded size.
    pub fn result_too_large(size: usize) -> Self {
        Self::new(
            Self::RESULT_TOO_LARGE,
            format!(
                "result of {} bytes exceeds maximum {}",
                size,
                ProtocolConfig::MAX_MESSAGE_SIZE
            ),
        )
    }
}

/// Reply to a [`Request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Response {
    Ok { result: Value },
    Error { error: ErrorDescriptor },
}

impl Response {
    /// Create a success response.
    pub fn success(result: Value) -> Self {
        Response::Ok { result }
    }

    /// Create an error response.
    pub fn error(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Response::Error {
            error: ErrorDescriptor::new(kind, message),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok { .. })
    }

    /// The `ResultTooLarge` failure to send instead, if this response cannot
    /// be framed. Measures the encoding without buffering it.
    pub fn oversize_error(&self) -> Option<ErrorDescriptor> {
        let size = encoded_len(self).ok()?;
        (size > ProtocolConfig::MAX_MESSAGE_SIZE).then(|| ErrorDescriptor::result_too_large(size))
    }

    /// Turn the response into the caller-facing result.
    pub fn into_result(self) -> Result<Value> {
        match self {
            Response::Ok { result } => Ok(result),
            Response::Error { error } => Err(error.into()),
        }
    }
}

impl From<ErrorDescriptor> for Response {
    fn from(error: ErrorDescriptor) -> Self {
        Response::Error { error }
    }
}

/// Read a length-prefixed frame from an async reader.
///
/// Frame format: `[4-byte BE u32 length][payload bytes]`
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > ProtocolConfig::MAX_MESSAGE_SIZE {
        return Err(LipError::Protocol {
            message: format!(
                "Message size {} exceeds maximum {}",
                len,
                ProtocolConfig::MAX_MESSAGE_SIZE
            ),
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            LipError::Protocol {
                message: format!("Connection closed inside a {} byte frame", len),
            }
        } else {
            e.into()
        }
    })?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
///
/// Frame format: `[4-byte BE u32 length][payload bytes]`
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > ProtocolConfig::MAX_MESSAGE_SIZE {
        return Err(LipError::Protocol {
            message: format!(
                "Message size {} exceeds maximum {}",
                payload.len(),
                ProtocolConfig::MAX_MESSAGE_SIZE
            ),
        });
    }

    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Decode a request payload. Any failure is a protocol error.
pub fn decode_request(payload: &[u8]) -> Result<Request> {
    serde_json::from_slice(payload).map_err(|e| LipError::Protocol {
        message: format!("Invalid request payload: {}", e),
    })
}

/// Decode a response payload. Any failure is a protocol error.
pub fn decode_response(payload: &[u8]) -> Result<Response> {
    serde_json::from_slice(payload).map_err(|e| LipError::Protocol {
        message: format!("Invalid response payload: {}", e),
    })
}

/// Encoded JSON size of `message` in bytes.
pub fn encoded_len<T: Serialize>(message: &T) -> Result<usize> {
    let mut counter = ByteCounter(0);
    serde_json::to_writer(&mut counter, message)?;
    Ok(counter.0)
}

struct ByteCounter(usize);

impl std::io::Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Encode a response for the wire.
///
/// A response too large to frame is replaced by a `ResultTooLarge` error, so
/// the client always gets an answer it can attribute to the server.
pub fn encode_response(response: &Response) -> Result<Vec<u8>> {
    let bytes = serde_json::to_vec(response)?;
    if bytes.len() <= ProtocolConfig::MAX_MESSAGE_SIZE {
        return Ok(bytes);
    }
    warn!("Response of {} bytes does not fit in a frame", bytes.len());
    let fallback = Response::from(ErrorDescriptor::result_too_large(bytes.len()));
    Ok(serde_json::to_vec(&fallback)?)
}

/// Serialize and frame a message in one step.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let bytes = serde_json::to_vec(message)?;
    write_frame(writer, &bytes).await
}

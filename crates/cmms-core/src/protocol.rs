//! Wire types and framing.
//!
//! Every logical message is a header frame followed by a body frame. A frame is
//! a 4-byte big-endian length prefix followed by a UTF-8 JSON payload.
//!
//! ```text
//! [u32 BE: len][header JSON] [u32 BE: len][body JSON]
//! ```
//!
//! Sequence number zero is reserved for server push. Inbound response headers
//! are classified into [`Inbound`] once, at the edge, so nothing downstream
//! inspects the raw sequence field.

use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Sequence number carried by every push header.
pub const PUSH_SEQ: u64 = 0;

/// Header preceding every request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeader {
    pub service_method: String,
    pub seq: u64,
}

impl RequestHeader {
    pub fn new(service_method: impl Into<String>, seq: u64) -> Self {
        Self {
            service_method: service_method.into(),
            seq,
        }
    }
}

/// Header preceding every response or push body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHeader {
    pub service_method: String,
    pub seq: u64,
    /// Explicit push marker. Peers that predate it only send `seq == 0`.
    #[serde(default)]
    pub push: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseHeader {
    /// Header for a successful reply.
    pub fn reply(service_method: impl Into<String>, seq: u64) -> Self {
        Self {
            service_method: service_method.into(),
            seq,
            push: false,
            error: None,
        }
    }

    /// Header for a reply whose call failed on the server.
    pub fn failed(service_method: impl Into<String>, seq: u64, error: impl Into<String>) -> Self {
        Self {
            service_method: service_method.into(),
            seq,
            push: false,
            error: Some(error.into()),
        }
    }

    /// Header for an unsolicited push.
    pub fn push(service_method: impl Into<String>) -> Self {
        Self {
            service_method: service_method.into(),
            seq: PUSH_SEQ,
            push: true,
            error: None,
        }
    }

    /// Classify this header as a reply or a push.
    ///
    /// A header is a push when it says so, or when it carries the reserved
    /// sequence number regardless of its method name.
    pub fn classify(self) -> Inbound {
        if self.push || self.seq == PUSH_SEQ {
            Inbound::Push {
                method: self.service_method,
            }
        } else {
            Inbound::Reply {
                seq: self.seq,
                method: self.service_method,
                error: self.error,
            }
        }
    }
}

/// A classified inbound response header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Answer to the pending call numbered `seq`.
    Reply {
        seq: u64,
        method: String,
        error: Option<String>,
    },
    /// Unsolicited notification; `method` names the event that fired.
    Push { method: String },
}

/// Logical session id assigned by the server at first contact.
///
/// Ids start at 1; zero means "not yet assigned" on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(u64);

impl ChannelId {
    /// Wrap a raw id. Returns `None` for the unassigned value zero.
    pub fn new(id: u64) -> Option<Self> {
        (id != 0).then_some(Self(id))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ChannelId {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        let id: u64 = s.trim().parse().map_err(|_| TransportError::Decode {
            message: format!("invalid channel id {:?}", s),
        })?;
        ChannelId::new(id).ok_or_else(|| TransportError::Decode {
            message: "channel id 0 is unassigned".to_string(),
        })
    }
}

/// A complete response or push, queued for a connection's writer.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseFrame {
    pub header: ResponseHeader,
    pub body: serde_json::Value,
}

impl ResponseFrame {
    pub fn reply(service_method: impl Into<String>, seq: u64, body: serde_json::Value) -> Self {
        Self {
            header: ResponseHeader::reply(service_method, seq),
            body,
        }
    }

    /// Error replies carry a `null` body.
    pub fn failed(service_method: impl Into<String>, seq: u64, error: impl Into<String>) -> Self {
        Self {
            header: ResponseHeader::failed(service_method, seq, error),
            body: serde_json::Value::Null,
        }
    }

    pub fn push(service_method: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            header: ResponseHeader::push(service_method),
            body: serde_json::Value::String(payload.into()),
        }
    }
}

/// Handshake request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingRequest {
    pub msg: String,
}

/// Handshake reply body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingReply {
    pub msg: String,
}

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed connection between frames).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > TransportConfig::MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge {
            size: len,
            max: TransportConfig::MAX_FRAME_SIZE,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame without flushing.
///
/// Callers flush once a complete header/body pair has been written.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > TransportConfig::MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge {
            size: payload.len(),
            max: TransportConfig::MAX_FRAME_SIZE,
        });
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    Ok(())
}

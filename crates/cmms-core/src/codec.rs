//! Stateful header/body codec.
//!
//! [`CodecWriter`] emits one header and one body as two consecutive frames and
//! flushes once, after both. [`CodecReader`] reads a header, remembers what kind
//! of body follows it, and decodes that body on the next read.
//!
//! A frame whose JSON is followed by trailing bytes is treated as framing noise:
//! it is discarded and the next frame is decoded instead, at most
//! `max_noise_retries` times per value. Any other decode failure is fatal.

use crate::error::{Result, TransportError};
use crate::protocol::{read_frame, write_frame, Inbound, RequestHeader, ResponseHeader};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::warn;

/// Body of an inbound response, decoded according to its header.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    /// Result value of a call; the caller deserializes it into its own type.
    Reply(Value),
    /// Textual payload of a push.
    Push(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyKind {
    Request,
    Reply,
    Push,
}

/// Write half of the codec.
pub struct CodecWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> CodecWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write a request header and its body, then flush.
    pub async fn write_request<B: Serialize + ?Sized>(
        &mut self,
        header: &RequestHeader,
        body: &B,
    ) -> Result<()> {
        let header = encode("request header", header)?;
        let body = encode("request body", body)?;
        self.write_pair(&header, &body).await
    }

    /// Write a response (or push) header and its body, then flush.
    pub async fn write_response<B: Serialize + ?Sized>(
        &mut self,
        header: &ResponseHeader,
        body: &B,
    ) -> Result<()> {
        let header = encode("response header", header)?;
        let body = encode("response body", body)?;
        self.write_pair(&header, &body).await
    }

    /// Shut down the underlying writer.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await.map_err(write_error)
    }

    async fn write_pair(&mut self, header: &[u8], body: &[u8]) -> Result<()> {
        write_frame(&mut self.writer, header)
            .await
            .map_err(write_error)?;
        write_frame(&mut self.writer, body)
            .await
            .map_err(write_error)?;
        self.writer.flush().await.map_err(write_error)
    }
}

/// Read half of the codec.
pub struct CodecReader<R> {
    reader: R,
    expect: Option<BodyKind>,
    max_noise_retries: u32,
}

impl<R: AsyncRead + Unpin> CodecReader<R> {
    pub fn new(reader: R, max_noise_retries: u32) -> Self {
        Self {
            reader,
            expect: None,
            max_noise_retries,
        }
    }

    /// Read and classify the next response header.
    ///
    /// Returns `None` when the peer closed the stream between messages.
    pub async fn read_response_header(&mut self) -> Result<Option<Inbound>> {
        self.ensure_no_pending_body()?;
        let header: ResponseHeader = match self.read_value().await? {
            Some(header) => header,
            None => return Ok(None),
        };
        let inbound = header.classify();
        self.expect = Some(match inbound {
            Inbound::Reply { .. } => BodyKind::Reply,
            Inbound::Push { .. } => BodyKind::Push,
        });
        Ok(Some(inbound))
    }

    /// Decode the body announced by the last response header.
    pub async fn read_response_body(&mut self) -> Result<ResponseBody> {
        match self.expect.take() {
            Some(BodyKind::Reply) => Ok(ResponseBody::Reply(self.read_body().await?)),
            Some(BodyKind::Push) => Ok(ResponseBody::Push(push_payload(self.read_body().await?))),
            other => Err(TransportError::Decode {
                message: format!("response body read out of order (expected {:?})", other),
            }),
        }
    }

    /// Read the next request header.
    ///
    /// Returns `None` when the peer closed the stream between messages.
    pub async fn read_request_header(&mut self) -> Result<Option<RequestHeader>> {
        self.ensure_no_pending_body()?;
        let header: Option<RequestHeader> = self.read_value().await?;
        if header.is_some() {
            self.expect = Some(BodyKind::Request);
        }
        Ok(header)
    }

    /// Decode the body announced by the last request header.
    pub async fn read_request_body(&mut self) -> Result<Value> {
        match self.expect.take() {
            Some(BodyKind::Request) => self.read_body().await,
            other => Err(TransportError::Decode {
                message: format!("request body read out of order (expected {:?})", other),
            }),
        }
    }

    fn ensure_no_pending_body(&self) -> Result<()> {
        match self.expect {
            None => Ok(()),
            Some(kind) => Err(TransportError::Decode {
                message: format!("header read while a {:?} body is pending", kind),
            }),
        }
    }

    async fn read_body(&mut self) -> Result<Value> {
        self.read_value()
            .await?
            .ok_or_else(|| TransportError::Decode {
                message: "stream closed between header and body".to_string(),
            })
    }

    async fn read_value<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        let mut retries = 0;
        loop {
            let frame = match read_frame(&mut self.reader).await {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(None),
                Err(e @ TransportError::FrameTooLarge { .. }) => return Err(e),
                Err(e) => {
                    return Err(TransportError::Decode {
                        message: e.to_string(),
                    })
                }
            };

            match serde_json::from_slice::<T>(&frame) {
                Ok(value) => return Ok(Some(value)),
                Err(e) if is_trailing_noise(&e) && retries < self.max_noise_retries => {
                    retries += 1;
                    warn!(retries, "Discarding frame with trailing data: {}", e);
                }
                Err(e) => {
                    return Err(TransportError::Decode {
                        message: e.to_string(),
                    })
                }
            }
        }
    }
}

fn encode<T: Serialize + ?Sized>(what: &str, value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| TransportError::Encode {
        message: format!("{}: {}", what, e),
    })
}

fn write_error(err: impl std::fmt::Display) -> TransportError {
    TransportError::Write {
        message: err.to_string(),
    }
}

fn is_trailing_noise(err: &serde_json::Error) -> bool {
    err.is_syntax() && err.to_string().starts_with("trailing characters")
}

/// Push payloads are strings; anything else is passed on as its JSON text.
fn push_payload(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

//! Duplex RPC client.
//!
//! One stream carries many concurrent calls plus server pushes. Writes are
//! serialized behind a tokio `Mutex` so each header/body pair lands on the
//! wire contiguously; a single reader task owns the read half and routes every
//! inbound message either to the call it answers or to the push registry.
//!
//! # Thread Safety
//!
//! `RpcClient` is `Send + Sync`. Share it behind an `Arc` to issue calls from
//! several tasks at once; replies may arrive in any order.

use crate::cancel::CancellationToken;
use crate::codec::{CodecReader, CodecWriter, ResponseBody};
use crate::config::{ClientConfig, TransportConfig};
use crate::demux::{CallResult, PendingCalls, Routed, SequenceAllocator};
use crate::dispatch::{PushHandler, PushRegistry};
use crate::error::{Result, TransportError};
use crate::lifecycle::{ConnectionState, CountdownHandle, Lifecycle, LogoutHooks};
use crate::protocol::{ChannelId, PingRequest, RequestHeader};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Body of the bootstrap call. Its only job is to consume sequence 1.
const HANDSHAKE_GREETING: &str = "Use up the first msg";

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Builder for [`RpcClient`].
pub struct ClientBuilder {
    config: ClientConfig,
    pushes: Arc<PushRegistry>,
    hooks: LogoutHooks,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
            pushes: Arc::new(PushRegistry::new()),
            hooks: LogoutHooks::none(),
        }
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Use an existing push registry, e.g. one shared with a previous connection.
    pub fn push_registry(mut self, pushes: Arc<PushRegistry>) -> Self {
        self.pushes = pushes;
        self
    }

    /// Register a push handler before any push can arrive.
    pub fn on_push(self, method: impl Into<String>, handler: impl PushHandler) -> Self {
        self.pushes.register(method, handler);
        self
    }

    /// Callbacks run by the forced-logout countdown.
    pub fn logout_hooks(mut self, hooks: LogoutHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Dial `addr` over TCP and complete the handshake.
    pub async fn connect(self, addr: &str) -> Result<RpcClient> {
        let lifecycle = Lifecycle::new(&self.config, self.hooks.clone());
        lifecycle.transition(ConnectionState::Connecting);

        let dial = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr)).await;
        let stream = match dial {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(dial_failed(&lifecycle, addr, e.to_string())),
            Err(_) => {
                let message = format!("timed out after {:?}", self.config.connect_timeout);
                return Err(dial_failed(&lifecycle, addr, message));
            }
        };

        debug!("RPC client connected to {}", addr);
        let (reader, writer) = stream.into_split();
        self.establish(Box::new(reader), Box::new(writer), addr.to_string(), lifecycle)
            .await
    }

    /// Run the transport over an already-open stream.
    pub async fn connect_stream<S>(self, stream: S, peer: impl Into<String>) -> Result<RpcClient>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let lifecycle = Lifecycle::new(&self.config, self.hooks.clone());
        let (reader, writer) = tokio::io::split(stream);
        self.establish(Box::new(reader), Box::new(writer), peer.into(), lifecycle)
            .await
    }

    async fn establish(
        self,
        reader: BoxReader,
        writer: BoxWriter,
        peer: String,
        lifecycle: Lifecycle,
    ) -> Result<RpcClient> {
        lifecycle.transition(ConnectionState::Handshaking);

        let (channel, _) = watch::channel(None);
        let inner = Arc::new(ClientInner {
            writer: Mutex::new(CodecWriter::new(writer)),
            pending: PendingCalls::new(),
            seqs: SequenceAllocator::new(),
            pushes: self.pushes,
            channel,
            handshake_seq: AtomicU64::new(0),
            lifecycle,
            shutdown: CancellationToken::new(),
            peer,
        });

        let codec = CodecReader::new(reader, self.config.max_noise_retries);
        let reader_task = tokio::spawn(reader_loop(inner.clone(), codec));
        let client = RpcClient { inner, reader_task };

        let timeout = self.config.handshake_timeout;
        let outcome = match tokio::time::timeout(timeout, client.handshake()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(TransportError::Handshake {
                message: format!("no channel announced within {:?}", timeout),
            }),
        };

        match outcome {
            Ok(channel) => {
                client.inner.lifecycle.transition(ConnectionState::Ready);
                if client.state() != ConnectionState::Ready {
                    return Err(TransportError::Handshake {
                        message: "connection failed during handshake".to_string(),
                    });
                }
                info!(peer = %client.inner.peer, %channel, "RPC client ready");
                Ok(client)
            }
            Err(e) => {
                client.inner.fail(&e).await;
                Err(e)
            }
        }
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn dial_failed(lifecycle: &Lifecycle, addr: &str, message: String) -> TransportError {
    let err = TransportError::Dial {
        addr: addr.to_string(),
        message,
    };
    lifecycle.fail(&err.to_string());
    err
}

struct ClientInner {
    writer: Mutex<CodecWriter<BoxWriter>>,
    pending: PendingCalls,
    seqs: SequenceAllocator,
    pushes: Arc<PushRegistry>,
    channel: watch::Sender<Option<ChannelId>>,
    /// Sequence of the bootstrap call, or 0 before it is issued.
    handshake_seq: AtomicU64,
    lifecycle: Lifecycle,
    /// Stops the reader once the connection failed or closed.
    shutdown: CancellationToken,
    peer: String,
}

impl ClientInner {
    /// Register a call and write its request.
    async fn issue<P: Serialize + ?Sized>(
        &self,
        method: &str,
        params: &P,
    ) -> Result<oneshot::Receiver<CallResult>> {
        let seq = self.seqs.next()?;
        self.issue_with(seq, method, params).await
    }

    async fn issue_with<P: Serialize + ?Sized>(
        &self,
        seq: u64,
        method: &str,
        params: &P,
    ) -> Result<oneshot::Receiver<CallResult>> {
        let rx = self.pending.register(seq, method).await?;

        let header = RequestHeader::new(method, seq);
        let written = self.writer.lock().await.write_request(&header, params).await;
        if let Err(e) = written {
            self.fail(&e).await;
            return Err(e);
        }
        Ok(rx)
    }

    /// Read one inbound message. Returns false on clean end of stream.
    async fn read_one(&self, codec: &mut CodecReader<BoxReader>) -> Result<bool> {
        let inbound = match codec.read_response_header().await? {
            Some(inbound) => inbound,
            None => return Ok(false),
        };

        match self.pending.route(inbound).await? {
            Routed::Reply { call, error } => {
                let body = match codec.read_response_body().await {
                    Ok(body) => body,
                    Err(e) => {
                        call.complete(Err(e.to_connection_failed()));
                        return Err(e);
                    }
                };
                let result = match (error, body) {
                    (Some(message), _) => Err(TransportError::Remote {
                        method: call.method().to_string(),
                        message,
                    }),
                    (None, ResponseBody::Reply(value)) => Ok(value),
                    (None, ResponseBody::Push(text)) => Ok(Value::String(text)),
                };
                call.complete(result);
            }
            Routed::Push { method } => {
                let payload = match codec.read_response_body().await? {
                    ResponseBody::Push(payload) => payload,
                    ResponseBody::Reply(value) => value.to_string(),
                };
                if method == TransportConfig::CHANNEL_ANNOUNCE_METHOD {
                    self.observe_channel(&payload).await;
                }
                self.pushes.deliver(&method, &payload);
            }
            Routed::Late { seq, method } => {
                codec.read_response_body().await?;
                debug!(seq, method = %method, "Discarded late reply to push-resolved call");
            }
        }
        Ok(true)
    }

    /// Record the first channel announcement; later different ids are ignored.
    ///
    /// The first announcement also answers the bootstrap call, which is
    /// resolved before the channel is published. Only the reader task writes
    /// the channel.
    async fn observe_channel(&self, payload: &str) {
        let channel: ChannelId = match payload.parse() {
            Ok(channel) => channel,
            Err(e) => {
                warn!("Ignoring channel announcement {:?}: {}", payload, e);
                return;
            }
        };
        let unassigned = self.channel.borrow().is_none();
        if unassigned {
            self.complete_handshake(payload).await;
        }
        self.channel.send_if_modified(|current| match current {
            None => {
                info!(%channel, "Channel assigned");
                *current = Some(channel);
                true
            }
            Some(existing) if *existing == channel => false,
            Some(existing) => {
                warn!(%existing, announced = %channel, "Ignoring second channel announcement");
                false
            }
        });
    }

    /// The announcement answers the bootstrap call.
    async fn complete_handshake(&self, payload: &str) {
        let seq = self.handshake_seq.load(Ordering::SeqCst);
        if seq == 0 {
            return;
        }
        if let Some(call) = self.pending.resolve_by_push(seq).await {
            call.complete(Ok(Value::String(payload.to_string())));
        }
    }

    /// Latch the failure and tear the connection down.
    ///
    /// The reader stops, every pending call fails and the write half is shut
    /// down, whichever side the error came from.
    async fn fail(&self, err: &TransportError) {
        let reason = match err {
            TransportError::ConnectionFailed { reason } => reason.clone(),
            other => other.to_string(),
        };
        if !self.lifecycle.fail(&reason) {
            return;
        }
        self.shutdown.cancel();
        let failed = self
            .pending
            .fail_all(&reason, || TransportError::ConnectionFailed {
                reason: reason.clone(),
            })
            .await;
        if failed > 0 {
            warn!(failed, "Failed pending calls after transport error");
        }
        if let Err(e) = self.writer.lock().await.shutdown().await {
            debug!(peer = %self.peer, "Error shutting down failed RPC stream: {}", e);
        }
    }
}

async fn reader_loop(inner: Arc<ClientInner>, mut codec: CodecReader<BoxReader>) {
    let err = loop {
        let read = tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => {
                debug!(peer = %inner.peer, "RPC reader stopped by teardown");
                return;
            }
            read = inner.read_one(&mut codec) => read,
        };
        match read {
            Ok(true) => continue,
            Ok(false) => {
                break TransportError::ConnectionFailed {
                    reason: "stream closed by peer".to_string(),
                }
            }
            Err(e) => break e,
        }
    };
    debug!(peer = %inner.peer, "RPC reader stopped: {}", err);
    inner.fail(&err).await;
}

/// Client end of a multiplexed duplex RPC connection.
pub struct RpcClient {
    inner: Arc<ClientInner>,
    reader_task: JoinHandle<()>,
}

impl RpcClient {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Dial `addr` with default settings.
    pub async fn connect(addr: &str) -> Result<Self> {
        ClientBuilder::new().connect(addr).await
    }

    /// Issue the bootstrap call and wait for the channel announcement.
    ///
    /// The bootstrap reply itself is not awaited; the server may answer it
    /// only through the announcement push.
    async fn handshake(&self) -> Result<ChannelId> {
        let mut channel_rx = self.inner.channel.subscribe();
        let mut state_rx = self.inner.lifecycle.subscribe();

        let greeting = PingRequest {
            msg: HANDSHAKE_GREETING.to_string(),
        };
        // Recorded before the request is written so the announcement can find it.
        let seq = self.inner.seqs.next()?;
        self.inner.handshake_seq.store(seq, Ordering::SeqCst);
        let _reply = self
            .inner
            .issue_with(seq, TransportConfig::HANDSHAKE_METHOD, &greeting)
            .await?;

        tokio::select! {
            announced = channel_rx.wait_for(Option::is_some) => {
                announced
                    .ok()
                    .and_then(|channel| *channel)
                    .ok_or_else(|| TransportError::Handshake {
                        message: "channel watch closed".to_string(),
                    })
            }
            _ = state_rx.wait_for(|state| *state == ConnectionState::Failed) => {
                Err(TransportError::Handshake {
                    message: "connection failed during handshake".to_string(),
                })
            }
        }
    }

    /// Call `method` and deserialize its result.
    pub async fn call<P, R>(&self, method: &str, params: &P) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let value = self.call_value(method, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Call `method` and return its raw result value.
    ///
    /// Suspends until the reply arrives or the connection fails. There is no
    /// per-call timeout at this layer.
    pub async fn call_value<P: Serialize + ?Sized>(&self, method: &str, params: &P) -> Result<Value> {
        match self.state() {
            ConnectionState::Ready => {}
            ConnectionState::Failed => {
                return Err(TransportError::ConnectionFailed {
                    reason: "connection has already failed".to_string(),
                })
            }
            ConnectionState::Disconnected => return Err(TransportError::Closed),
            state => {
                return Err(TransportError::NotReady {
                    state: state.to_string(),
                })
            }
        }

        let rx = self.inner.issue(method, params).await?;
        rx.await.unwrap_or_else(|_| {
            Err(TransportError::ConnectionFailed {
                reason: "reply slot dropped".to_string(),
            })
        })
    }

    /// Call `method` with this connection's channel id stamped into `params`.
    ///
    /// `null` becomes the bare channel id; objects gain a `channel` field;
    /// anything else is wrapped as `{"channel": id, "params": value}`.
    pub async fn call_on_channel<R: DeserializeOwned>(&self, method: &str, params: Value) -> Result<R> {
        let channel = self.channel().ok_or_else(|| TransportError::NotReady {
            state: self.state().to_string(),
        })?;
        let payload = with_channel(channel, params);
        self.call(method, &payload).await
    }

    /// Channel id announced by the server, once known.
    pub fn channel(&self) -> Option<ChannelId> {
        *self.inner.channel.borrow()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lifecycle.state()
    }

    /// Observe state transitions, including the one-shot move to `Failed`.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.lifecycle.subscribe()
    }

    pub fn pushes(&self) -> &Arc<PushRegistry> {
        &self.inner.pushes
    }

    /// Register a push handler. Returns true when it replaced another.
    pub fn on_push(&self, method: impl Into<String>, handler: impl PushHandler) -> bool {
        self.inner.pushes.register(method, handler)
    }

    /// Number of calls still waiting for a reply.
    pub async fn pending_calls(&self) -> usize {
        self.inner.pending.len().await
    }

    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    /// Stop a running forced-logout countdown.
    pub fn cancel_logout(&self) -> bool {
        self.inner.lifecycle.cancel_countdown()
    }

    /// Take ownership of the forced-logout countdown, if one is running.
    pub fn take_logout_countdown(&self) -> Option<CountdownHandle> {
        self.inner.lifecycle.take_countdown()
    }

    /// Close the connection from this side.
    ///
    /// Pending calls fail with [`TransportError::Closed`]. No logout countdown
    /// runs for an application-initiated close.
    pub async fn close(&self) {
        if !self.inner.lifecycle.close() {
            return;
        }
        self.inner.shutdown.cancel();
        self.reader_task.abort();
        let failed = self
            .inner
            .pending
            .fail_all("closed by client", || TransportError::Closed)
            .await;
        if let Err(e) = self.inner.writer.lock().await.shutdown().await {
            debug!("Error shutting down RPC stream: {}", e);
        }
        debug!(failed, peer = %self.inner.peer, "RPC client closed");
    }
}

/// Dropping the client stops its reader; the stream closes once the reader
/// task has released it. A logout countdown that is already running is not
/// owned by the client and still ends the session. Take it with
/// [`RpcClient::take_logout_countdown`] or stop it with
/// [`RpcClient::cancel_logout`] first if that is not wanted.
impl Drop for RpcClient {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
        self.reader_task.abort();
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("peer", &self.inner.peer)
            .field("channel", &self.channel())
            .field("state", &self.state())
            .finish()
    }
}

fn with_channel(channel: ChannelId, params: Value) -> Value {
    match params {
        Value::Null => Value::from(channel.get()),
        Value::Object(mut map) => {
            map.insert("channel".to_string(), Value::from(channel.get()));
            Value::Object(map)
        }
        other => serde_json::json!({ "channel": channel.get(), "params": other }),
    }
}

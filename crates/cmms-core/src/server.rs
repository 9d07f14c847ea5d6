//! TCP server end of the duplex RPC transport.
//!
//! Accepts connections, assigns each a channel id, and dispatches every call
//! to an [`RpcDispatch`] implementation on its own task, so a slow call never
//! blocks the replies or pushes queued behind it.
//!
//! # Thread Safety
//!
//! Each connection runs a reader loop and a writer task. The writer drains an
//! unbounded queue of complete [`ResponseFrame`]s; replies, the channel
//! announcement and pushes from other tasks all go through that queue, so
//! frames are never interleaved on the wire.

use crate::codec::{CodecReader, CodecWriter};
use crate::config::{ServerConfig, TransportConfig};
use crate::error::{Result, TransportError};
use crate::protocol::{ChannelId, PingReply, PingRequest, RequestHeader, ResponseFrame};
use crate::session::{ChannelRegistry, OutboundTx, SessionState};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// What a handler knows about the call it is serving.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Channel of the connection the call arrived on.
    pub connection: ChannelId,
    /// Session of the channel the call declares, or of `connection`.
    pub session: SessionState,
    pub channels: Arc<ChannelRegistry>,
}

/// Trait for dispatching inbound calls to application handlers.
#[async_trait::async_trait]
pub trait RpcDispatch: Send + Sync + 'static {
    /// Handle `method` and return its result value.
    ///
    /// An error is sent back in the reply header and fails only this call.
    async fn dispatch(&self, ctx: &CallContext, method: &str, params: Value) -> Result<Value>;
}

/// Handle to a running server. Dropping shuts down the server.
pub struct RpcServerHandle {
    pub addr: SocketAddr,
    pub port: u16,
    channels: Arc<ChannelRegistry>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl RpcServerHandle {
    /// Get the address the server is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn channels(&self) -> &Arc<ChannelRegistry> {
        &self.channels
    }

    /// Push `payload` to one channel.
    pub fn push(&self, channel: ChannelId, method: &str, payload: &str) -> Result<()> {
        self.channels.push(channel, method, payload)
    }

    /// Push `payload` to every connected channel.
    pub fn broadcast(&self, method: &str, payload: &str) -> usize {
        self.channels.broadcast(method, payload)
    }

    /// Shut down the server gracefully.
    ///
    /// Stops accepting new connections and signals all active connection
    /// handlers to close.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }
}

impl Drop for RpcServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Server that listens for client connections.
pub struct RpcServer;

impl RpcServer {
    /// Start the server on a random local port with default settings.
    pub async fn start<D: RpcDispatch>(dispatch: Arc<D>) -> Result<RpcServerHandle> {
        Self::bind("127.0.0.1:0", dispatch, ServerConfig::default()).await
    }

    /// Start the server on `addr`.
    ///
    /// The server runs in background tokio tasks until the returned handle is
    /// shut down or dropped.
    pub async fn bind<D: RpcDispatch>(
        addr: &str,
        dispatch: Arc<D>,
        config: ServerConfig,
    ) -> Result<RpcServerHandle> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let port = addr.port();

        info!("RPC server listening on {}", addr);

        let channels = Arc::new(ChannelRegistry::new());
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            dispatch,
            channels.clone(),
            config,
            shutdown_rx,
            conn_shutdown_rx,
        ));

        Ok(RpcServerHandle {
            addr,
            port,
            channels,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop<D: RpcDispatch>(
        listener: TcpListener,
        dispatch: Arc<D>,
        channels: Arc<ChannelRegistry>,
        config: ServerConfig,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
    ) {
        let active_connections = Arc::new(AtomicUsize::new(0));
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("RPC server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let current = active_connections.load(Ordering::Relaxed);
                            if current >= config.max_connections {
                                warn!(
                                    "Rejecting RPC connection from {}: at max capacity ({})",
                                    peer_addr,
                                    config.max_connections
                                );
                                continue;
                            }

                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let dispatch = dispatch.clone();
                            let channels = channels.clone();
                            let conns = active_connections.clone();
                            let conn_shutdown = conn_shutdown_rx.clone();
                            let max_noise_retries = config.max_noise_retries;

                            tokio::spawn(async move {
                                debug!("RPC connection from {}", peer_addr);
                                if let Err(e) = Self::handle_connection(
                                    stream,
                                    dispatch,
                                    channels,
                                    max_noise_retries,
                                    conn_shutdown,
                                )
                                .await
                                {
                                    debug!("RPC connection {} ended: {}", peer_addr, e);
                                }
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("RPC accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection<D: RpcDispatch>(
        stream: TcpStream,
        dispatch: Arc<D>,
        channels: Arc<ChannelRegistry>,
        max_noise_retries: u32,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<()> {
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        Self::serve_connection(reader, writer, dispatch, channels, max_noise_retries, shutdown_rx)
            .await
    }

    /// Serve one already-open stream until the peer leaves or shutdown is signalled.
    ///
    /// The connection is registered in `channels` for its lifetime.
    pub async fn serve_connection<R, W, D>(
        reader: R,
        writer: W,
        dispatch: Arc<D>,
        channels: Arc<ChannelRegistry>,
        max_noise_retries: u32,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
        D: RpcDispatch,
    {
        let (outbound, queue) = mpsc::unbounded_channel();
        let channel = channels.open(outbound.clone())?;
        tokio::spawn(write_loop(writer, queue, channel));

        let mut codec = CodecReader::new(reader, max_noise_retries);
        let result = loop {
            let header = tokio::select! {
                result = codec.read_request_header() => match result {
                    Ok(Some(header)) => header,
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                },
                _ = shutdown_rx.changed() => break Ok(()),
            };
            let params = match codec.read_request_body().await {
                Ok(params) => params,
                Err(e) => break Err(e),
            };

            if header.service_method == TransportConfig::HANDSHAKE_METHOD {
                announce_channel(channel, &header, params, &outbound);
                continue;
            }

            let ctx = CallContext {
                connection: channel,
                session: channels.resolve_call(&params, channel),
                channels: channels.clone(),
            };
            tokio::spawn(run_call(dispatch.clone(), ctx, header, params, outbound.clone()));
        };

        channels.close(channel);
        result
    }
}

/// Answer the bootstrap call: push the channel id, then reply.
fn announce_channel(channel: ChannelId, header: &RequestHeader, params: Value, outbound: &OutboundTx) {
    let greeting = serde_json::from_value::<PingRequest>(params)
        .map(|req| req.msg)
        .unwrap_or_default();
    debug!(%channel, greeting = %greeting, "Handshake");

    let announce = ResponseFrame::push(TransportConfig::CHANNEL_ANNOUNCE_METHOD, channel.to_string());
    let reply = serde_json::to_value(PingReply { msg: greeting })
        .map(|body| ResponseFrame::reply(&header.service_method, header.seq, body))
        .unwrap_or_else(|e| ResponseFrame::failed(&header.service_method, header.seq, e.to_string()));

    if outbound.send(announce).is_err() || outbound.send(reply).is_err() {
        debug!(%channel, "Writer gone before handshake reply");
    }
}

async fn run_call<D: RpcDispatch>(
    dispatch: Arc<D>,
    ctx: CallContext,
    header: RequestHeader,
    params: Value,
    outbound: OutboundTx,
) {
    let start = Instant::now();
    let method = header.service_method;
    // Run the handler on its own task so a panic still gets a reply.
    let handler = {
        let ctx = ctx.clone();
        let method = method.clone();
        tokio::spawn(async move { dispatch.dispatch(&ctx, &method, params).await })
    };
    let result = match handler.await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(TransportError::call("handler panicked")),
        Err(_) => Err(TransportError::call("handler cancelled")),
    };
    let elapsed_ms = start.elapsed().as_millis() as u64;

    let session = &ctx.session;
    let frame = match result {
        Ok(body) => {
            info!(
                method = %method,
                channel = %session.channel,
                user_id = ?session.user_id,
                username = %session.username,
                role = %session.role,
                elapsed_ms,
                "RPC call"
            );
            ResponseFrame::reply(method, header.seq, body)
        }
        Err(e) => {
            warn!(
                method = %method,
                channel = %session.channel,
                user_id = ?session.user_id,
                username = %session.username,
                role = %session.role,
                elapsed_ms,
                error = %e,
                "RPC call failed"
            );
            ResponseFrame::failed(method, header.seq, e.to_string())
        }
    };

    if outbound.send(frame).is_err() {
        debug!(channel = %ctx.connection, "Connection gone before reply");
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    writer: W,
    mut queue: mpsc::UnboundedReceiver<ResponseFrame>,
    channel: ChannelId,
) {
    let mut codec = CodecWriter::new(writer);
    while let Some(frame) = queue.recv().await {
        if let Err(e) = codec.write_response(&frame.header, &frame.body).await {
            debug!(%channel, "RPC write failed: {}", e);
            return;
        }
    }
    if let Err(e) = codec.shutdown().await {
        debug!(%channel, "RPC stream shutdown failed: {}", e);
    }
}

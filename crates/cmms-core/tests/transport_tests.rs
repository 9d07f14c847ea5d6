//! Integration tests for the duplex RPC transport.
//!
//! Most tests drive an `RpcClient` against a scripted peer over an in-memory
//! duplex pipe, writing raw frames so ordering, noise and desync cases can be
//! staged exactly. The last group runs a real `RpcServer` over loopback TCP.

use cmms_core::codec::CodecReader;
use cmms_core::protocol::{write_frame, PingReply};
use cmms_core::{
    CallContext, ChannelId, ClientConfig, ConnectionState, LogoutHooks, RequestHeader,
    ResponseHeader, RpcClient, RpcDispatch, RpcServer, TransportConfig, TransportError,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

/// Scripted server end of a duplex pipe.
struct Peer {
    reader: CodecReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl Peer {
    fn pair() -> (DuplexStream, Self) {
        let (client_io, server_io) = tokio::io::duplex(256 * 1024);
        let (reader, writer) = tokio::io::split(server_io);
        let peer = Self {
            reader: CodecReader::new(reader, 1),
            writer,
        };
        (client_io, peer)
    }

    async fn read_call(&mut self) -> (RequestHeader, Value) {
        let header = self.reader.read_request_header().await.unwrap().unwrap();
        let body = self.reader.read_request_body().await.unwrap();
        (header, body)
    }

    async fn frames(&mut self, frames: &[Vec<u8>]) {
        for frame in frames {
            write_frame(&mut self.writer, frame).await.unwrap();
        }
        self.writer.flush().await.unwrap();
    }

    async fn send(&mut self, header: &ResponseHeader, body: &Value) {
        let header = serde_json::to_vec(header).unwrap();
        let body = serde_json::to_vec(body).unwrap();
        self.frames(&[header, body]).await;
    }

    async fn reply(&mut self, method: &str, seq: u64, body: Value) {
        self.send(&ResponseHeader::reply(method, seq), &body).await;
    }

    async fn push(&mut self, method: &str, payload: &str) {
        self.send(&ResponseHeader::push(method), &json!(payload)).await;
    }

    async fn handshake(&mut self, channel: &str) {
        let (header, _) = self.read_call().await;
        assert_eq!(header.service_method, TransportConfig::HANDSHAKE_METHOD);
        assert_eq!(header.seq, 1);
        self.push(TransportConfig::CHANNEL_ANNOUNCE_METHOD, channel).await;
        let reply = serde_json::to_value(PingReply {
            msg: "pong".to_string(),
        })
        .unwrap();
        self.reply(&header.service_method, header.seq, reply).await;
    }
}

struct Recorder {
    logouts: Arc<AtomicUsize>,
    ticks: Arc<Mutex<Vec<u32>>>,
}

impl Recorder {
    fn new() -> (Self, LogoutHooks) {
        let logouts = Arc::new(AtomicUsize::new(0));
        let ticks = Arc::new(Mutex::new(Vec::new()));
        let (l, t) = (logouts.clone(), ticks.clone());
        let hooks = LogoutHooks::new(move || {
            l.fetch_add(1, Ordering::SeqCst);
        })
        .with_tick(move |remaining| t.lock().unwrap().push(remaining));
        (Self { logouts, ticks }, hooks)
    }
}

async fn connect(peer: &mut Peer, io: DuplexStream, hooks: LogoutHooks) -> RpcClient {
    let (client, ()) = tokio::join!(
        RpcClient::builder()
            .logout_hooks(hooks)
            .connect_stream(io, "duplex"),
        peer.handshake("42")
    );
    client.unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_channel_call_push_then_stream_failure() {
    let (io, mut peer) = Peer::pair();
    let (recorder, hooks) = Recorder::new();
    let client = Arc::new(connect(&mut peer, io, hooks).await);
    assert_eq!(client.channel().map(ChannelId::get), Some(42));

    // seq 2 answered with R
    let params = json!({"channel": 42});
    let (result, ()) = tokio::join!(client.call_value("X.Y", &params), async {
        let (header, _) = peer.read_call().await;
        assert_eq!(header.seq, 2);
        peer.reply("X.Y", 2, json!("R")).await;
    });
    assert_eq!(result.unwrap(), json!("R"));

    // A push leaves the pending table alone
    let (notices_tx, mut notices) = mpsc::unbounded_channel();
    client.on_push("Notice", move |_: &str, payload: &str| {
        let _ = notices_tx.send(payload.to_string());
    });
    let slow = tokio::spawn({
        let client = client.clone();
        async move { client.call_value("Slow.Op", &json!({"channel": 42})).await }
    });
    peer.read_call().await;
    assert_eq!(client.pending_calls().await, 1);

    peer.push("Notice", "hello").await;
    assert_eq!(notices.recv().await.unwrap(), "hello");
    assert_eq!(client.pending_calls().await, 1);

    // Stream closes: the pending call fails, then the logout fires once
    drop(peer);
    assert!(matches!(
        slow.await.unwrap(),
        Err(TransportError::ConnectionFailed { .. })
    ));
    assert_eq!(client.state(), ConnectionState::Failed);
    assert_eq!(recorder.logouts.load(Ordering::SeqCst), 0);

    let countdown = client.take_logout_countdown().unwrap();
    assert!(countdown.wait().await);
    assert_eq!(recorder.logouts.load(Ordering::SeqCst), 1);
    assert_eq!(*recorder.ticks.lock().unwrap(), vec![3, 2, 1]);

    tokio::time::advance(Duration::from_secs(30)).await;
    assert_eq!(recorder.logouts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_out_of_order_replies_match_by_seq() {
    let (io, mut peer) = Peer::pair();
    let client = connect(&mut peer, io, LogoutHooks::none()).await;

    let params = [json!({"id": 1}), json!({"id": 2}), json!({"id": 3})];
    let (a, b, c, ()) = tokio::join!(
        client.call_value("Site.Get", &params[0]),
        client.call_value("Machine.Get", &params[1]),
        client.call_value("Part.Get", &params[2]),
        async {
            let mut calls = Vec::new();
            for _ in 0..3 {
                calls.push(peer.read_call().await);
            }
            for (header, body) in calls.into_iter().rev() {
                peer.reply(&header.service_method, header.seq, json!({"echo": body["id"]}))
                    .await;
            }
        }
    );

    assert_eq!(a.unwrap(), json!({"echo": 1}));
    assert_eq!(b.unwrap(), json!({"echo": 2}));
    assert_eq!(c.unwrap(), json!({"echo": 3}));
    assert_eq!(client.pending_calls().await, 0);
}

#[tokio::test]
async fn test_push_with_colliding_method_never_completes_call() {
    let (io, mut peer) = Peer::pair();
    let client = connect(&mut peer, io, LogoutHooks::none()).await;

    let (pushes_tx, mut pushes) = mpsc::unbounded_channel();
    client.on_push("User.List", move |method: &str, payload: &str| {
        let _ = pushes_tx.send((method.to_string(), payload.to_string()));
    });

    let params = json!(42);
    let (result, ()) = tokio::join!(client.call_value("User.List", &params), async {
        let (header, _) = peer.read_call().await;
        // seq 0 with the pending call's method name
        peer.send(&ResponseHeader::reply("User.List", 0), &json!("refresh"))
            .await;
        peer.reply("User.List", header.seq, json!(["steve"])).await;
    });

    assert_eq!(result.unwrap(), json!(["steve"]));
    assert_eq!(
        pushes.recv().await.unwrap(),
        ("User.List".to_string(), "refresh".to_string())
    );
}

#[tokio::test]
async fn test_concurrent_calls_fail_together() {
    let (io, mut peer) = Peer::pair();
    let client = connect(&mut peer, io, LogoutHooks::none()).await;
    const CALLS: usize = 16;

    let params: Vec<Value> = (0..CALLS).map(|i| json!({ "id": i })).collect();
    let calls = params.iter().map(|p| client.call_value("Event.Get", p));
    let (results, ()) = tokio::join!(futures::future::join_all(calls), async move {
        for _ in 0..CALLS {
            peer.read_call().await;
        }
        drop(peer);
    });

    assert_eq!(results.len(), CALLS);
    for result in results {
        assert!(matches!(result, Err(TransportError::ConnectionFailed { .. })));
    }
    assert_eq!(client.pending_calls().await, 0);
    assert!(client.cancel_logout());
}

#[tokio::test]
async fn test_unknown_seq_fails_connection() {
    let (io, mut peer) = Peer::pair();
    let client = connect(&mut peer, io, LogoutHooks::none()).await;

    let params = Value::Null;
    let (result, ()) = tokio::join!(client.call_value("X.Y", &params), async {
        peer.read_call().await;
        peer.reply("X.Y", 99, json!("stray")).await;
    });

    match result {
        Err(TransportError::ConnectionFailed { reason }) => {
            assert!(reason.contains("seq 99"), "unexpected reason: {}", reason);
        }
        other => panic!("Expected connection failure, got: {:?}", other),
    }
    assert_eq!(client.state(), ConnectionState::Failed);
    assert!(client.cancel_logout());
}

#[tokio::test]
async fn test_single_noise_frame_is_skipped() {
    let (io, mut peer) = Peer::pair();
    let client = connect(&mut peer, io, LogoutHooks::none()).await;

    let params = Value::Null;
    let (result, ()) = tokio::join!(client.call_value("X.Y", &params), async {
        let (header, _) = peer.read_call().await;
        let noise = br#"{"service_method":"X.Y","seq":0} extra"#.to_vec();
        let real = serde_json::to_vec(&ResponseHeader::reply("X.Y", header.seq)).unwrap();
        peer.frames(&[noise, real, b"\"ok\"".to_vec()]).await;
    });

    assert_eq!(result.unwrap(), json!("ok"));
    assert_eq!(client.state(), ConnectionState::Ready);
}

#[tokio::test]
async fn test_repeated_noise_is_fatal() {
    let (io, mut peer) = Peer::pair();
    let client = connect(&mut peer, io, LogoutHooks::none()).await;

    let params = Value::Null;
    let (result, ()) = tokio::join!(client.call_value("X.Y", &params), async {
        peer.read_call().await;
        let noise = br#"{"service_method":"X.Y","seq":0} extra"#.to_vec();
        peer.frames(&[noise.clone(), noise]).await;
    });

    assert!(matches!(result, Err(TransportError::ConnectionFailed { .. })));
    assert_eq!(client.state(), ConnectionState::Failed);
    assert!(client.cancel_logout());
}

#[tokio::test]
async fn test_dial_error_is_returned() {
    // Bind then drop to get a port with nothing listening.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = RpcClient::connect(&addr.to_string()).await;
    assert!(matches!(result, Err(TransportError::Dial { .. })));
}

struct SessionDispatch;

#[async_trait::async_trait]
impl RpcDispatch for SessionDispatch {
    async fn dispatch(
        &self,
        ctx: &CallContext,
        method: &str,
        params: Value,
    ) -> cmms_core::Result<Value> {
        match method {
            "Login.Login" => {
                let username = params["username"].as_str().unwrap_or_default();
                let session = ctx
                    .channels
                    .login(ctx.session.channel, 12, username, "Admin")?;
                Ok(serde_json::to_value(session)?)
            }
            "Login.Whoami" => Ok(json!({
                "username": ctx.session.username,
                "admin": ctx.session.is_admin(),
            })),
            "Login.Logout" => Ok(json!(ctx.channels.logout(ctx.session.channel))),
            "Util.Backup" if !ctx.session.is_admin() => Err(TransportError::call("admin only")),
            "Util.Backup" => Ok(json!("backup complete")),
            _ => Err(TransportError::call(format!("unknown method {}", method))),
        }
    }
}

#[tokio::test]
async fn test_end_to_end_over_tcp() {
    let mut server = RpcServer::start(Arc::new(SessionDispatch)).await.unwrap();

    let (notices_tx, mut notices) = mpsc::unbounded_channel();
    let client = RpcClient::builder()
        .on_push("Notice", move |_: &str, payload: &str| {
            let _ = notices_tx.send(payload.to_string());
        })
        .connect(&server.addr().to_string())
        .await
        .unwrap();
    let channel = client.channel().unwrap();
    assert_eq!(server.channels().len(), 1);

    let denied = client
        .call_on_channel::<Value>("Util.Backup", Value::Null)
        .await;
    assert!(matches!(
        denied,
        Err(TransportError::Remote { ref message, .. }) if message == "admin only"
    ));

    let session: Value = client
        .call_on_channel("Login.Login", json!({"username": "steve"}))
        .await
        .unwrap();
    assert_eq!(session["username"], "steve");

    let whoami: Value = client
        .call_on_channel("Login.Whoami", Value::Null)
        .await
        .unwrap();
    assert_eq!(whoami, json!({"username": "steve", "admin": true}));

    let backup: String = client
        .call_on_channel("Util.Backup", Value::Null)
        .await
        .unwrap();
    assert_eq!(backup, "backup complete");

    server.push(channel, "Notice", "machine 4 stopped").unwrap();
    assert_eq!(notices.recv().await.unwrap(), "machine 4 stopped");
    assert_eq!(server.broadcast("Notice", "shift change"), 1);
    assert_eq!(notices.recv().await.unwrap(), "shift change");

    let logged_out: bool = client
        .call_on_channel("Login.Logout", Value::Null)
        .await
        .unwrap();
    assert!(logged_out);

    client.close().await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    server.shutdown();
}

#[tokio::test]
async fn test_server_shutdown_forces_logout() {
    let mut server = RpcServer::start(Arc::new(SessionDispatch)).await.unwrap();
    let (recorder, hooks) = Recorder::new();
    let config = ClientConfig {
        logout_interval: Duration::from_millis(5),
        ..ClientConfig::default()
    };

    let client = RpcClient::builder()
        .config(config)
        .logout_hooks(hooks)
        .connect(&server.addr().to_string())
        .await
        .unwrap();
    let mut state = client.watch_state();

    server.shutdown();
    state
        .wait_for(|s| *s == ConnectionState::Failed)
        .await
        .unwrap();

    let countdown = client.take_logout_countdown().unwrap();
    assert!(countdown.wait().await);
    assert_eq!(recorder.logouts.load(Ordering::SeqCst), 1);
    assert_eq!(*recorder.ticks.lock().unwrap(), vec![3, 2, 1]);
}

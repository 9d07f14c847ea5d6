//! Integration tests for the cmms-rpc binary.
//!
//! These tests spawn `cmms-rpc serve`, read the port it prints, and talk to it
//! with the library client over real TCP.

use cmms_core::{ConnectionState, RpcClient, TransportError};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;

struct ServerProcess {
    child: tokio::process::Child,
    port: u16,
}

impl ServerProcess {
    fn addr(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    async fn stop(mut self) {
        let _ = self.child.kill().await;
        let _ = self.child.wait().await;
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        let _ = self.child.start_kill();
    }
}

fn binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_cmms-rpc"))
}

/// Start `cmms-rpc serve` and wait for it to print its port.
async fn start_server(extra_args: &[&str]) -> Result<ServerProcess, String> {
    let mut child = tokio::process::Command::new(binary())
        .arg("serve")
        .arg("--host")
        .arg("127.0.0.1")
        .arg("--port")
        .arg("0")
        .args(extra_args)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("failed to spawn cmms-rpc: {e}"))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "failed to capture stdout".to_string())?;
    let mut lines = tokio::io::BufReader::new(stdout).lines();

    let port = tokio::time::timeout(Duration::from_secs(20), async {
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(value) = line.strip_prefix("RPC_PORT=") {
                return value.trim().parse::<u16>().ok();
            }
        }
        None
    })
    .await
    .map_err(|_| "timed out waiting for RPC_PORT".to_string())?
    .ok_or_else(|| "server exited without printing RPC_PORT".to_string())?;

    Ok(ServerProcess { child, port })
}

#[tokio::test]
async fn test_login_whoami_and_sessions() {
    let server = start_server(&[]).await.unwrap();
    let client = RpcClient::connect(&server.addr()).await.unwrap();
    let channel = client.channel().unwrap();

    let pong: String = client.call_on_channel("Util.Ping", Value::Null).await.unwrap();
    assert_eq!(pong, "pong");

    let denied = client
        .call_on_channel::<Value>("Util.Sessions", Value::Null)
        .await;
    assert!(matches!(denied, Err(TransportError::Remote { .. })));

    let session: Value = client
        .call_on_channel("Login.Login", json!({"username": "steve", "role": "Admin"}))
        .await
        .unwrap();
    assert_eq!(session["channel"], json!(channel.get()));

    let me: Value = client
        .call_on_channel("Login.Whoami", Value::Null)
        .await
        .unwrap();
    assert_eq!(me["username"], "steve");

    let sessions: Vec<Value> = client
        .call_on_channel("Util.Sessions", Value::Null)
        .await
        .unwrap();
    assert_eq!(sessions.len(), 1);

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn test_notice_broadcast_reaches_client() {
    let server = start_server(&["--notice-interval", "1"]).await.unwrap();

    let (tx, mut notices) = mpsc::unbounded_channel();
    let client = RpcClient::builder()
        .on_push("Notice", move |_: &str, payload: &str| {
            let _ = tx.send(payload.to_string());
        })
        .connect(&server.addr())
        .await
        .unwrap();

    let notice = tokio::time::timeout(Duration::from_secs(10), notices.recv())
        .await
        .expect("notice should arrive")
        .unwrap();
    assert!(notice.starts_with("notice "));

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn test_server_exit_fails_client() {
    let server = start_server(&[]).await.unwrap();
    let client = RpcClient::connect(&server.addr()).await.unwrap();
    let mut state = client.watch_state();

    server.stop().await;

    tokio::time::timeout(
        Duration::from_secs(10),
        state.wait_for(|s| *s == ConnectionState::Failed),
    )
    .await
    .expect("client should observe the failure")
    .unwrap();
    assert!(client.cancel_logout());
}

#[tokio::test]
async fn test_call_subcommand_prints_result() {
    let server = start_server(&[]).await.unwrap();

    let output = tokio::process::Command::new(binary())
        .arg("call")
        .arg("--addr")
        .arg(server.addr())
        .arg("--method")
        .arg("Util.Echo")
        .arg("--params")
        .arg(r#"{"text": "hello"}"#)
        .stderr(Stdio::null())
        .output()
        .await
        .unwrap();

    assert!(output.status.success());
    let printed: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(printed["text"], "hello");
    assert!(printed["channel"].as_u64().unwrap() >= 1);

    server.stop().await;
}

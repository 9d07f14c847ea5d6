//! `call` subcommand: one call on a fresh connection.

use anyhow::{Context, Result};
use cmms_core::{LogoutHooks, PushRegistry, RpcClient, TransportConfig};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub async fn run(addr: &str, method: &str, params: &str, listen: u64) -> Result<()> {
    let params: Value = serde_json::from_str(params)
        .with_context(|| format!("invalid --params JSON: {}", params))?;

    let pushes = Arc::new(PushRegistry::new());
    pushes.set_default(|method: &str, payload: &str| println!("PUSH {} {}", method, payload));
    pushes.register(
        TransportConfig::CHANNEL_ANNOUNCE_METHOD,
        |_: &str, payload: &str| debug!(channel = payload, "Channel announced"),
    );

    let hooks = LogoutHooks::new(|| warn!("Session ended"))
        .with_tick(|remaining| warn!("Logging out in {}", remaining));

    let client = RpcClient::builder()
        .push_registry(pushes)
        .logout_hooks(hooks)
        .connect(addr)
        .await
        .with_context(|| format!("failed to connect to {}", addr))?;

    if let Some(channel) = client.channel() {
        info!(%channel, "Connected to {}", addr);
    }

    let result: Value = client.call_on_channel(method, params).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    if listen > 0 {
        tokio::time::sleep(Duration::from_secs(listen)).await;
    }

    client.close().await;
    Ok(())
}

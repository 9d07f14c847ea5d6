//! `serve` subcommand: run the demo server until Ctrl-C.

use crate::handlers::DemoDispatch;
use anyhow::{Context, Result};
use cmms_core::{ChannelRegistry, RpcServer, ServerConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Push method used for periodic notices.
pub const NOTICE_METHOD: &str = "Notice";

pub async fn run(host: &str, port: u16, notice_interval: Option<u64>) -> Result<()> {
    info!("Starting CMMS RPC server");

    let addr = format!("{}:{}", host, port);
    let mut handle = RpcServer::bind(&addr, Arc::new(DemoDispatch), ServerConfig::default())
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    // Print port for callers to read (intentional stdout)
    println!("RPC_PORT={}", handle.port);

    info!("RPC server running on {}", handle.addr());

    let notices = notice_interval.filter(|secs| *secs > 0).map(|secs| {
        tokio::spawn(broadcast_notices(
            handle.channels().clone(),
            Duration::from_secs(secs),
        ))
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");

    if let Some(task) = notices {
        task.abort();
    }
    handle.shutdown();
    Ok(())
}

async fn broadcast_notices(channels: Arc<ChannelRegistry>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    // The first tick completes immediately.
    ticker.tick().await;

    let mut count: u64 = 0;
    loop {
        ticker.tick().await;
        count += 1;
        let delivered = channels.broadcast(NOTICE_METHOD, &format!("notice {}", count));
        debug!(count, delivered, "Broadcast notice");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn test_notices_reach_every_channel() {
        let channels = Arc::new(ChannelRegistry::new());
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        channels.open(tx_a).unwrap();
        channels.open(tx_b).unwrap();

        let task = tokio::spawn(broadcast_notices(channels, Duration::from_secs(5)));

        let first = rx_a.recv().await.unwrap();
        assert_eq!(first.header.service_method, NOTICE_METHOD);
        assert_eq!(first.body, serde_json::json!("notice 1"));
        assert_eq!(rx_b.recv().await.unwrap().body, serde_json::json!("notice 1"));
        assert_eq!(rx_a.recv().await.unwrap().body, serde_json::json!("notice 2"));

        task.abort();
    }
}

//! Centralized configuration for the transport.
//!
//! Compile-time constants live on [`TransportConfig`]; the runtime knobs that
//! tests and embedders override are [`ClientConfig`] and [`ServerConfig`].

use std::time::Duration;

/// Transport-level constants.
pub struct TransportConfig;

impl TransportConfig {
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
    pub const MAX_CONNECTIONS: usize = 256;

    // Forced logout after a fatal transport failure
    pub const LOGOUT_COUNTDOWN_TICKS: u32 = 3;
    pub const LOGOUT_TICK_INTERVAL: Duration = Duration::from_secs(1);

    /// Re-decode attempts allowed per value when a frame carries trailing data.
    pub const MAX_NOISE_RETRIES: u32 = 1;

    /// Method of the bootstrap call issued on every new connection.
    pub const HANDSHAKE_METHOD: &'static str = "PingRPC.Ping";
    /// Push method whose payload announces the connection's channel id.
    pub const CHANNEL_ANNOUNCE_METHOD: &'static str = "Ping";
}

/// Runtime options for [`crate::RpcClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Upper bound on opening the stream.
    pub connect_timeout: Duration,
    /// Upper bound on waiting for the channel announcement.
    pub handshake_timeout: Duration,
    /// Countdown ticks between a fatal failure and the forced logout.
    pub logout_ticks: u32,
    /// Interval between countdown ticks.
    pub logout_interval: Duration,
    pub max_noise_retries: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: TransportConfig::CONNECT_TIMEOUT,
            handshake_timeout: TransportConfig::HANDSHAKE_TIMEOUT,
            logout_ticks: TransportConfig::LOGOUT_COUNTDOWN_TICKS,
            logout_interval: TransportConfig::LOGOUT_TICK_INTERVAL,
            max_noise_retries: TransportConfig::MAX_NOISE_RETRIES,
        }
    }
}

/// Runtime options for [`crate::RpcServer`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub max_connections: usize,
    pub max_noise_retries: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: TransportConfig::MAX_CONNECTIONS,
            max_noise_retries: TransportConfig::MAX_NOISE_RETRIES,
        }
    }
}

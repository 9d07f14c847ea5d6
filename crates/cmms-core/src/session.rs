//! Server-side channel registry.
//!
//! Every accepted connection is assigned a [`ChannelId`] and an outbound queue.
//! Handlers resolve a call's declared channel to the [`SessionState`] of the
//! user behind it, and push or broadcast through the same queues the replies
//! use, so a push is never interleaved inside another message.

use crate::error::{Result, TransportError};
use crate::protocol::{ChannelId, ResponseFrame};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Role name granting administrative calls.
pub const ADMIN_ROLE: &str = "Admin";

/// Sending half of a connection's outbound queue.
pub type OutboundTx = mpsc::UnboundedSender<ResponseFrame>;

/// Who is behind a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub channel: ChannelId,
    pub user_id: Option<i64>,
    pub username: String,
    pub role: String,
    pub opened_at: DateTime<Utc>,
}

impl SessionState {
    /// A channel nobody has logged in on.
    pub fn anonymous(channel: ChannelId) -> Self {
        Self {
            channel,
            user_id: None,
            username: String::new(),
            role: String::new(),
            opened_at: Utc::now(),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some()
    }

    pub fn is_admin(&self) -> bool {
        self.is_authenticated() && self.role == ADMIN_ROLE
    }
}

/// Extract the channel a call declares in its payload.
///
/// Accepts a bare integer payload, or an object carrying `channel` (or
/// `Channel`). Zero and anything else yield `None`.
pub fn declared_channel(params: &Value) -> Option<ChannelId> {
    let raw = match params {
        Value::Number(n) => n.as_u64(),
        Value::Object(map) => map
            .get("channel")
            .or_else(|| map.get("Channel"))
            .and_then(Value::as_u64),
        _ => None,
    };
    raw.and_then(ChannelId::new)
}

struct ChannelEntry {
    session: SessionState,
    outbound: OutboundTx,
}

/// Live channels of one server, keyed by id.
pub struct ChannelRegistry {
    next_id: AtomicU64,
    channels: RwLock<HashMap<ChannelId, ChannelEntry>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Assign the next channel id to a connection whose writer drains `outbound`.
    pub fn open(&self, outbound: OutboundTx) -> Result<ChannelId> {
        let raw = self
            .next_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_add(1))
            .map_err(|_| TransportError::SequenceExhausted)?;
        let channel = ChannelId::new(raw).ok_or(TransportError::SequenceExhausted)?;

        self.channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                channel,
                ChannelEntry {
                    session: SessionState::anonymous(channel),
                    outbound,
                },
            );
        debug!(%channel, "Channel opened");
        Ok(channel)
    }

    /// Drop a channel once its connection is gone.
    pub fn close(&self, channel: ChannelId) -> Option<SessionState> {
        let removed = self
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&channel)
            .map(|entry| entry.session);
        if let Some(session) = &removed {
            info!(
                %channel,
                user_id = ?session.user_id,
                username = %session.username,
                "Channel closed"
            );
        }
        removed
    }

    /// Session behind `channel`; anonymous when the channel is unknown.
    pub fn resolve(&self, channel: ChannelId) -> SessionState {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&channel)
            .map(|entry| entry.session.clone())
            .unwrap_or_else(|| SessionState::anonymous(channel))
    }

    /// Session for a call payload, falling back to the connection's own channel.
    pub fn resolve_call(&self, params: &Value, connection: ChannelId) -> SessionState {
        self.resolve(declared_channel(params).unwrap_or(connection))
    }

    /// Bind a user to `channel`.
    pub fn login(
        &self,
        channel: ChannelId,
        user_id: i64,
        username: impl Into<String>,
        role: impl Into<String>,
    ) -> Result<SessionState> {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        let entry = channels
            .get_mut(&channel)
            .ok_or(TransportError::UnknownChannel {
                channel: channel.get(),
            })?;
        entry.session.user_id = Some(user_id);
        entry.session.username = username.into();
        entry.session.role = role.into();
        info!(
            %channel,
            user_id,
            username = %entry.session.username,
            role = %entry.session.role,
            "Login"
        );
        Ok(entry.session.clone())
    }

    /// Clear the user bound to `channel`. Returns false if nobody was logged in.
    pub fn logout(&self, channel: ChannelId) -> bool {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        match channels.get_mut(&channel) {
            Some(entry) if entry.session.is_authenticated() => {
                info!(%channel, username = %entry.session.username, "Logout");
                let opened_at = entry.session.opened_at;
                entry.session = SessionState {
                    opened_at,
                    ..SessionState::anonymous(channel)
                };
                true
            }
            _ => false,
        }
    }

    /// Queue a push for one channel.
    pub fn push(&self, channel: ChannelId, method: &str, payload: &str) -> Result<()> {
        let outbound = self
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&channel)
            .map(|entry| entry.outbound.clone())
            .ok_or(TransportError::UnknownChannel {
                channel: channel.get(),
            })?;
        outbound
            .send(ResponseFrame::push(method, payload))
            .map_err(|_| TransportError::Closed)
    }

    /// Queue a push for every live channel. Returns how many accepted it.
    pub fn broadcast(&self, method: &str, payload: &str) -> usize {
        let targets: Vec<OutboundTx> = self
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|entry| entry.outbound.clone())
            .collect();

        let delivered = targets
            .iter()
            .filter(|tx| tx.send(ResponseFrame::push(method, payload)).is_ok())
            .count();
        debug!(method, delivered, "Broadcast");
        delivered
    }

    /// Snapshot of every live session, ordered by channel.
    pub fn sessions(&self) -> Vec<SessionState> {
        let mut sessions: Vec<SessionState> = self
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|entry| entry.session.clone())
            .collect();
        sessions.sort_by_key(|s| s.channel);
        sessions
    }

    pub fn len(&self) -> usize {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("channels", &self.len())
            .finish()
    }
}

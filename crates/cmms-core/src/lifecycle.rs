//! Connection lifecycle and forced logout.
//!
//! ```text
//! Disconnected -> Connecting -> Handshaking -> Ready -> Failed
//!                      |              |
//!                      +--> Failed <--+
//! ```
//!
//! Entering `Failed` is one-shot. It starts a [`LogoutCountdown`] that reports
//! each remaining tick and then ends the application session. The transport is
//! never healed in place; recovery means a fresh connection and a fresh login.

use crate::cancel::CancellationToken;
use crate::config::ClientConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No stream, or closed by the application.
    Disconnected,
    /// Dialing the stream.
    Connecting,
    /// Stream open, waiting for the channel announcement.
    Handshaking,
    /// Channel known; calls may be issued.
    Ready,
    /// Unrecoverable transport failure.
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "DISCONNECTED"),
            ConnectionState::Connecting => write!(f, "CONNECTING"),
            ConnectionState::Handshaking => write!(f, "HANDSHAKING"),
            ConnectionState::Ready => write!(f, "READY"),
            ConnectionState::Failed => write!(f, "FAILED"),
        }
    }
}

type TickFn = Arc<dyn Fn(u32) + Send + Sync>;
type LogoutFn = Arc<dyn Fn() + Send + Sync>;

/// Callbacks run by the logout countdown.
#[derive(Clone)]
pub struct LogoutHooks {
    on_tick: Option<TickFn>,
    on_logout: Option<LogoutFn>,
}

impl LogoutHooks {
    /// Hooks that end the session through `on_logout`.
    pub fn new(on_logout: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            on_tick: None,
            on_logout: Some(Arc::new(on_logout)),
        }
    }

    /// Hooks that only log.
    pub fn none() -> Self {
        Self {
            on_tick: None,
            on_logout: None,
        }
    }

    /// Also report each remaining tick (3, 2, 1 by default).
    pub fn with_tick(mut self, on_tick: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.on_tick = Some(Arc::new(on_tick));
        self
    }
}

impl Default for LogoutHooks {
    fn default() -> Self {
        Self::none()
    }
}

impl std::fmt::Debug for LogoutHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogoutHooks")
            .field("on_tick", &self.on_tick.is_some())
            .field("on_logout", &self.on_logout.is_some())
            .finish()
    }
}

/// Handle to a running countdown.
#[derive(Debug)]
pub struct CountdownHandle {
    token: CancellationToken,
    task: JoinHandle<bool>,
}

impl CountdownHandle {
    /// Stop the countdown before it ends the session.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the countdown to end. Returns true if the logout hook ran.
    pub async fn wait(self) -> bool {
        self.task.await.unwrap_or(false)
    }
}

/// Delayed, cancellable forced logout.
pub struct LogoutCountdown;

impl LogoutCountdown {
    /// Spawn a countdown of `ticks` steps spaced `interval` apart.
    pub fn start(ticks: u32, interval: Duration, hooks: LogoutHooks) -> CountdownHandle {
        let token = CancellationToken::new();
        let task = tokio::spawn(Self::run(ticks, interval, hooks, token.clone()));
        CountdownHandle { token, task }
    }

    async fn run(ticks: u32, interval: Duration, hooks: LogoutHooks, token: CancellationToken) -> bool {
        warn!("Connection has expired, logging out in {} ticks", ticks);

        for remaining in (1..=ticks).rev() {
            warn!(remaining, "Logging out in {}", remaining);
            if let Some(on_tick) = &hooks.on_tick {
                on_tick(remaining);
            }
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Logout countdown cancelled");
                    return false;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }

        if token.check().is_err() {
            return false;
        }

        warn!("Session ended after transport failure");
        if let Some(on_logout) = &hooks.on_logout {
            on_logout();
        }
        true
    }
}

/// State machine and failure latch for one client connection.
pub struct Lifecycle {
    state: watch::Sender<ConnectionState>,
    finished: AtomicBool,
    countdown: Mutex<Option<CountdownHandle>>,
    hooks: LogoutHooks,
    logout_ticks: u32,
    logout_interval: Duration,
}

impl Lifecycle {
    pub fn new(config: &ClientConfig, hooks: LogoutHooks) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            state,
            finished: AtomicBool::new(false),
            countdown: Mutex::new(None),
            hooks,
            logout_ticks: config.logout_ticks,
            logout_interval: config.logout_interval,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Move to `next` unless the connection already failed or closed.
    pub fn transition(&self, next: ConnectionState) {
        if self.finished.load(Ordering::SeqCst) {
            return;
        }
        let prev = self.state.send_replace(next);
        debug!("Connection state {} -> {}", prev, next);
    }

    /// Enter `Failed`, starting the logout countdown if a session was live.
    ///
    /// Failures before `Ready` are reported to the caller of `connect`
    /// instead. Only the first call has any effect; returns whether this call did.
    pub fn fail(&self, reason: &str) -> bool {
        if self.finished.swap(true, Ordering::SeqCst) {
            return false;
        }
        let prev = self.state.send_replace(ConnectionState::Failed);
        warn!("Connection failed in state {}: {}", prev, reason);
        if prev != ConnectionState::Ready {
            return true;
        }

        let handle = LogoutCountdown::start(
            self.logout_ticks,
            self.logout_interval,
            self.hooks.clone(),
        );
        *self.countdown.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        true
    }

    /// Application-initiated close: no countdown, no logout.
    ///
    /// Returns false if the connection had already failed or closed.
    pub fn close(&self) -> bool {
        if self.finished.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.state.send_replace(ConnectionState::Disconnected);
        info!("Connection closed");
        true
    }

    /// Cancel a running logout countdown. Returns true if one was cancelled.
    pub fn cancel_countdown(&self) -> bool {
        match self
            .countdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            Some(handle) if !handle.is_finished() => {
                handle.cancel();
                true
            }
            _ => false,
        }
    }

    /// Take the countdown handle, if the connection has failed.
    pub fn take_countdown(&self) -> Option<CountdownHandle> {
        self.countdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("state", &self.state())
            .field("logout_ticks", &self.logout_ticks)
            .finish()
    }
}

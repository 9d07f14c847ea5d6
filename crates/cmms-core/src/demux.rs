//! Sequence demultiplexing.
//!
//! Outgoing calls are numbered by [`SequenceAllocator`] starting at 1; zero is
//! reserved for push. [`PendingCalls`] holds every call still waiting for a
//! reply and routes each classified inbound header either to the call it
//! answers or to the push path.

use crate::error::{Result, TransportError};
use crate::protocol::{Inbound, PUSH_SEQ};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{oneshot, Mutex};
use tracing::debug;

/// Outcome delivered to a suspended caller.
pub type CallResult = Result<Value>;

/// Hands out call sequence numbers, monotonically, never zero.
#[derive(Debug)]
pub struct SequenceAllocator {
    next: AtomicU64,
}

impl SequenceAllocator {
    pub fn new() -> Self {
        Self::starting_at(PUSH_SEQ + 1)
    }

    pub(crate) fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first.max(PUSH_SEQ + 1)),
        }
    }

    /// Allocate the next sequence number.
    ///
    /// Fails instead of wrapping back to the reserved value.
    pub fn next(&self) -> Result<u64> {
        self.next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_add(1))
            .map_err(|_| TransportError::SequenceExhausted)
    }
}

impl Default for SequenceAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// An issued call awaiting its reply.
#[derive(Debug)]
pub struct PendingCall {
    seq: u64,
    method: String,
    tx: oneshot::Sender<CallResult>,
}

impl PendingCall {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Resolve the call. A caller that already went away is ignored.
    pub fn complete(self, result: CallResult) {
        if self.tx.send(result).is_err() {
            debug!(seq = self.seq, method = %self.method, "Caller dropped before reply");
        }
    }
}

/// Where an inbound header routes its body.
#[derive(Debug)]
pub enum Routed {
    /// The body answers this call; `error` is the server-reported failure, if any.
    Reply {
        call: PendingCall,
        error: Option<String>,
    },
    /// The body is a push payload for `method`.
    Push { method: String },
    /// Late reply to a call already resolved through the push path; discard the body.
    Late { seq: u64, method: String },
}

#[derive(Debug, Default)]
struct PendingState {
    calls: HashMap<u64, PendingCall>,
    /// Calls resolved by a push whose own reply may still arrive once.
    answered_by_push: HashSet<u64>,
    /// Set once the connection failed or closed; rejects further registration.
    closed: Option<String>,
}

/// Table of in-flight calls for one connection.
#[derive(Debug, Default)]
pub struct PendingCalls {
    state: Mutex<PendingState>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call before its request is written.
    pub async fn register(
        &self,
        seq: u64,
        method: impl Into<String>,
    ) -> Result<oneshot::Receiver<CallResult>> {
        if seq == PUSH_SEQ {
            return Err(TransportError::Config {
                message: "sequence 0 is reserved for push".to_string(),
            });
        }

        let mut state = self.state.lock().await;
        if let Some(reason) = &state.closed {
            return Err(TransportError::ConnectionFailed {
                reason: reason.clone(),
            });
        }

        let (tx, rx) = oneshot::channel();
        let method = method.into();
        if state.calls.contains_key(&seq) {
            return Err(TransportError::Config {
                message: format!("sequence {} is already pending", seq),
            });
        }
        state.calls.insert(seq, PendingCall { seq, method, tx });
        Ok(rx)
    }

    /// Route a classified inbound header.
    ///
    /// A reply whose sequence number matches no pending call means the stream
    /// is desynchronized and is reported as a protocol violation.
    pub async fn route(&self, inbound: Inbound) -> Result<Routed> {
        match inbound {
            Inbound::Push { method } => Ok(Routed::Push { method }),
            Inbound::Reply { seq, method, error } => {
                let mut state = self.state.lock().await;
                match state.calls.remove(&seq) {
                    Some(call) => Ok(Routed::Reply { call, error }),
                    None if state.answered_by_push.remove(&seq) => Ok(Routed::Late { seq, method }),
                    None => Err(TransportError::ProtocolViolation { seq, method }),
                }
            }
        }
    }

    /// Take a call out of the table so a push can resolve it.
    ///
    /// One later reply carrying the same sequence number routes as
    /// [`Routed::Late`] instead of a protocol violation.
    pub async fn resolve_by_push(&self, seq: u64) -> Option<PendingCall> {
        let mut state = self.state.lock().await;
        let call = state.calls.remove(&seq)?;
        state.answered_by_push.insert(seq);
        Some(call)
    }

    /// Fail every pending call and reject future registrations.
    ///
    /// Draining happens under one lock acquisition so no caller is left
    /// suspended. Returns the number of calls failed.
    pub async fn fail_all(&self, reason: &str, make_err: impl Fn() -> TransportError) -> usize {
        let drained: Vec<PendingCall> = {
            let mut state = self.state.lock().await;
            if state.closed.is_none() {
                state.closed = Some(reason.to_string());
            }
            state.calls.drain().map(|(_, call)| call).collect()
        };

        let count = drained.len();
        for call in drained {
            debug!(seq = call.seq, method = %call.method, "Failing pending call");
            call.complete(Err(make_err()));
        }
        count
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.calls.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed.is_some()
    }
}

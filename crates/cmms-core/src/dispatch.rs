//! Push handler registry.
//!
//! Maps a push method name to the handler that last registered for it.
//! Unregistered names fall through to a default handler, which logs and
//! ignores unless replaced.
//!
//! Delivery runs on the connection's reader task. Handlers must return
//! promptly and hand long work to a separately spawned task; a slow handler
//! stalls every reply behind it.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Receiver of push notifications.
pub trait PushHandler: Send + Sync + 'static {
    fn handle(&self, method: &str, payload: &str);
}

impl<F> PushHandler for F
where
    F: Fn(&str, &str) + Send + Sync + 'static,
{
    fn handle(&self, method: &str, payload: &str) {
        self(method, payload)
    }
}

/// Default handler: log and drop.
fn log_unhandled(method: &str, payload: &str) {
    debug!(method, payload, "Unhandled push");
}

/// Which handler a push was delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Registered,
    Default,
}

/// Registry of push handlers keyed by method name.
pub struct PushRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn PushHandler>>>,
    fallback: RwLock<Arc<dyn PushHandler>>,
}

impl PushRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            fallback: RwLock::new(Arc::new(log_unhandled) as Arc<dyn PushHandler>),
        }
    }

    /// Register `handler` for `method`. Last registration wins.
    ///
    /// Returns true when an earlier handler was replaced.
    pub fn register(&self, method: impl Into<String>, handler: impl PushHandler) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(method.into(), Arc::new(handler))
            .is_some()
    }

    /// Remove the handler for `method`, if any.
    pub fn unregister(&self, method: &str) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(method)
            .is_some()
    }

    /// Replace the handler used for unregistered method names.
    pub fn set_default(&self, handler: impl PushHandler) {
        *self.fallback.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(handler);
    }

    pub fn is_registered(&self, method: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(method)
    }

    /// Deliver one push, synchronously, to the matching handler.
    pub fn deliver(&self, method: &str, payload: &str) -> Delivery {
        // Clone the handler out so no lock is held while it runs; a handler
        // may register or unregister others.
        let registered = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(method)
            .cloned();

        match registered {
            Some(handler) => {
                handler.handle(method, payload);
                Delivery::Registered
            }
            None => {
                let fallback = self
                    .fallback
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                fallback.handle(method, payload);
                Delivery::Default
            }
        }
    }
}

impl Default for PushRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PushRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let methods: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        f.debug_struct("PushRegistry")
            .field("methods", &methods)
            .finish()
    }
}

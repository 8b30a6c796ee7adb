//! WebSocket subscription bookkeeping.
//!
//! Tracks live `eth_subscribe` subscriptions by their node-assigned id and
//! routes `eth_subscription` notifications to each subscriber's sink.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use evmrpc_core::error::TransportError;
use evmrpc_core::subscription::ErrSender;

/// A unique subscription ID returned by `eth_subscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub String);

impl From<String> for SubscriptionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-subscription routing state.
struct SubscriptionEntry {
    /// Channel to forward incoming notifications to the subscriber.
    sink: mpsc::Sender<Value>,
    /// Error signal of the subscription; dropping it closes the signal.
    err: ErrSender<TransportError>,
}

/// Outcome of routing one notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Delivered,
    /// No subscription with that id (already unsubscribed).
    Unknown,
    /// The subscriber is gone or fell behind; the entry was removed and the
    /// node-side subscription should be cancelled.
    Dropped,
}

/// Routes notifications to live subscriptions.
#[derive(Clone, Default)]
pub struct SubscriptionManager {
    entries: Arc<Mutex<HashMap<SubscriptionId, SubscriptionEntry>>>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SubscriptionId, SubscriptionEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a confirmed subscription.
    pub fn register(
        &self,
        id: SubscriptionId,
        sink: mpsc::Sender<Value>,
        err: ErrSender<TransportError>,
    ) {
        self.lock().insert(id, SubscriptionEntry { sink, err });
    }

    /// Forward an incoming notification to the correct subscription.
    ///
    /// Never blocks: a subscriber whose buffer is full is failed with a
    /// queue-overflow error and dropped.
    pub fn dispatch(&self, id: &SubscriptionId, message: Value) -> Dispatch {
        let mut entries = self.lock();
        let Some(entry) = entries.get(id) else {
            return Dispatch::Unknown;
        };
        match entry.sink.try_send(message) {
            Ok(()) => Dispatch::Delivered,
            Err(TrySendError::Full(_)) => {
                if let Some(entry) = entries.remove(id) {
                    entry
                        .err
                        .send(TransportError::WebSocket("subscription queue overflow".into()));
                }
                Dispatch::Dropped
            }
            Err(TrySendError::Closed(_)) => {
                entries.remove(id);
                Dispatch::Dropped
            }
        }
    }

    /// Remove a subscription (e.g. after `eth_unsubscribe`). Closes its
    /// error signal.
    pub fn remove(&self, id: &SubscriptionId) -> bool {
        self.lock().remove(id).is_some()
    }

    /// Fail every subscription with an error built by `err` and forget them.
    pub fn fail_all(&self, err: impl Fn() -> TransportError) {
        let drained: Vec<SubscriptionEntry> = self.lock().drain().map(|(_, e)| e).collect();
        for entry in drained {
            entry.err.send(err());
        }
    }

    /// Number of active subscriptions.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if there are no active subscriptions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//! Pending-call tracker
//!
//! Caller-side bookkeeping for outbound requests awaiting a response.
//! Each call registers its integer id and gets back a oneshot receiver;
//! the matching inbound response settles it. Timeouts are applied by the
//! caller wrapping the receiver, which cleans its own entry up on expiry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::protocol::ErrorObject;

/// Why a pending call failed
#[derive(Debug, Clone, thiserror::Error)]
pub enum CallError {
    /// No response arrived within the method call timeout
    #[error("method call timeout")]
    Timeout,

    /// The call never completed: not connected, buffer full, or the
    /// connection went away while the call was in flight
    #[error("rejected / {0}")]
    Rejected(String),

    /// The peer answered with an error response
    #[error("remote error: {0}")]
    Remote(ErrorObject),

    /// The outbound envelope could not be serialized
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Completion value delivered to a pending call
pub type CallOutcome = Result<Value, CallError>;

/// Tracker mapping outbound request ids to their completions
#[derive(Clone, Default)]
pub struct PendingCalls {
    inner: Arc<Mutex<HashMap<u64, oneshot::Sender<CallOutcome>>>>,
}

impl PendingCalls {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending call and return its completion receiver
    pub fn register(&self, id: u64) -> oneshot::Receiver<CallOutcome> {
        let (sender, receiver) = oneshot::channel();
        self.lock().insert(id, sender);
        receiver
    }

    /// Settle a pending call; returns false when the id is unknown
    pub fn settle(&self, id: u64, outcome: CallOutcome) -> bool {
        match self.lock().remove(&id) {
            Some(sender) => {
                if sender.send(outcome).is_err() {
                    debug!(id, "pending call receiver dropped");
                }
                true
            }
            None => false,
        }
    }

    /// Drop a pending call without completing it (timeout cleanup)
    pub fn remove(&self, id: u64) {
        self.lock().remove(&id);
    }

    /// Fail every pending call and clear the table
    pub fn reject_all(&self, reason: &str) {
        let drained: Vec<_> = self.lock().drain().collect();
        for (id, sender) in drained {
            debug!(id, reason, "rejecting pending call");
            let _ = sender.send(Err(CallError::Rejected(reason.to_string())));
        }
    }

    /// Number of calls currently pending
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<CallOutcome>>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

//! Testing utilities and mock implementations
//!
//! Provides a mock engine peer that records everything the engine sends
//! and emits, for driving the message engine without a live socket.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::codec::Frame;
use crate::engine::{EngineEvent, EnginePeer};

/// Mock peer recording sent frames and emitted events
#[derive(Clone, Default)]
pub struct MockPeer {
    sent: Arc<Mutex<Vec<Frame>>>,
    events: Arc<Mutex<Vec<EngineEvent>>>,
}

impl MockPeer {
    /// Create a new mock peer
    pub fn new() -> Self {
        Self::default()
    }

    /// All frames sent through this peer, in order
    pub fn sent_frames(&self) -> Vec<Frame> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// All events emitted on this peer, in order
    pub fn events(&self) -> Vec<EngineEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Drop recorded frames and events
    pub fn clear(&self) {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

#[async_trait]
impl EnginePeer for MockPeer {
    async fn send_frame(&self, frame: Frame) {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).push(frame);
    }

    fn emit(&self, event: EngineEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}

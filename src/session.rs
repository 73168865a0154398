//! Server-side session
//!
//! One connected peer as seen by the server: a stable id, room
//! membership, a user-data scratch map, and the heartbeat pong state.
//! The session feeds frames to a writer task owning the socket sink;
//! sends after close are silent no-ops.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::codec::Frame;
use crate::engine::{EngineEvent, EnginePeer};
use crate::events::{ServerEvent, SessionEvent};
use crate::protocol::Notification;
use crate::server::ServerError;

/// Heartbeat pong state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PongState {
    /// No ping issued yet
    Init,
    /// Ping sent, pong not yet observed
    Pending,
    /// Last pong observed at this many milliseconds past the server epoch
    At(u64),
}

struct SessionState {
    rooms: HashSet<String>,
    data: HashMap<String, Value>,
    last_pong: PongState,
}

struct SessionInner {
    id: Uuid,
    outbound: mpsc::UnboundedSender<Message>,
    open: AtomicBool,
    state: Mutex<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    server_events: broadcast::Sender<ServerEvent>,
    cancel: CancellationToken,
}

/// Handle to one connected peer; cheap to clone
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Session {
    pub(crate) fn new(
        outbound: mpsc::UnboundedSender<Message>,
        server_events: broadcast::Sender<ServerEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(SessionInner {
                id: Uuid::new_v4(),
                outbound,
                open: AtomicBool::new(true),
                state: Mutex::new(SessionState {
                    rooms: HashSet::new(),
                    data: HashMap::new(),
                    last_pong: PongState::Init,
                }),
                events,
                server_events,
                cancel,
            }),
        }
    }

    /// Stable session id, unique within the server instance
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Whether the underlying transport is still open
    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    /// Subscribe to this session's events
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Send a frame; silently does nothing once the transport is closed
    pub fn send(&self, frame: Frame) {
        if !self.is_open() {
            trace!(id = %self.inner.id, "dropping send on closed session");
            return;
        }
        let _ = self.inner.outbound.send(frame.into_message());
    }

    /// Send a raw payload, choosing text or binary modality
    pub fn send_raw(&self, data: impl Into<String>, binary: bool) {
        self.send(Frame::from_payload(data.into(), binary));
    }

    /// Send a notification envelope to this peer
    pub fn notify(&self, method: impl Into<String>, params: Option<Value>) -> Result<(), ServerError> {
        let payload = serde_json::to_string(&Notification::new(method, params))?;
        self.send(Frame::Text(payload));
        Ok(())
    }

    /// Join a room; returns true iff the session was newly added
    pub fn join_to(&self, room: impl Into<String>) -> bool {
        if !self.is_open() {
            return false;
        }
        self.state().rooms.insert(room.into())
    }

    /// Leave a room; returns true iff the session was a member
    pub fn leave_from(&self, room: &str) -> bool {
        self.state().rooms.remove(room)
    }

    /// Leave every room; returns true iff at least one was left
    pub fn leave_from_all(&self) -> bool {
        let mut state = self.state();
        let any = !state.rooms.is_empty();
        state.rooms.clear();
        any
    }

    /// Whether the session is a member of the given room
    pub fn in_room(&self, room: &str) -> bool {
        self.state().rooms.contains(room)
    }

    /// Snapshot of the rooms this session belongs to
    pub fn rooms(&self) -> Vec<String> {
        self.state().rooms.iter().cloned().collect()
    }

    /// Store a user-data value under a key
    pub fn set_data(&self, key: impl Into<String>, value: Value) {
        self.state().data.insert(key.into(), value);
    }

    /// Read a user-data value
    pub fn data(&self, key: &str) -> Option<Value> {
        self.state().data.get(key).cloned()
    }

    /// Remove a user-data value, returning it
    pub fn remove_data(&self, key: &str) -> Option<Value> {
        self.state().data.remove(key)
    }

    /// Polite close handshake
    pub fn close(&self, code: Option<u16>, reason: Option<String>) {
        if !self.is_open() {
            return;
        }
        let frame = code.map(|code| CloseFrame {
            code: CloseCode::from(code),
            reason: reason.unwrap_or_default().into(),
        });
        let _ = self.inner.outbound.send(Message::Close(frame));
    }

    /// Abortive close: drop the transport without a handshake
    pub fn terminate(&self) {
        debug!(id = %self.inner.id, "terminating session");
        self.inner.cancel.cancel();
    }

    // ========================================================================
    // Server-internal heartbeat and lifecycle hooks
    // ========================================================================

    /// Record a pong observed at `now_ms` past the server epoch
    pub(crate) fn note_pong(&self, now_ms: u64) {
        self.state().last_pong = PongState::At(now_ms);
    }

    /// One heartbeat tick for this session
    ///
    /// Returns false when the session missed its pong window and must be
    /// terminated; otherwise marks the pong pending and issues a ping.
    pub(crate) fn heartbeat_tick(&self, deadline_ms: u64) -> bool {
        {
            let mut state = self.state();
            match state.last_pong {
                PongState::Pending => return false,
                PongState::At(at_ms) if at_ms > deadline_ms => return false,
                _ => state.last_pong = PongState::Pending,
            }
        }
        if self.is_open() {
            let _ = self.inner.outbound.send(Message::Ping(Vec::new()));
        }
        true
    }

    /// Tear down after the transport closed: no further sends succeed,
    /// rooms and data are cleared, the close event fires
    pub(crate) fn mark_closed(&self) {
        if self.inner.open.swap(false, Ordering::SeqCst) {
            {
                let mut state = self.state();
                state.rooms.clear();
                state.data.clear();
            }
            self.inner.cancel.cancel();
            let _ = self.inner.events.send(SessionEvent::Close);
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl EnginePeer for Session {
    async fn send_frame(&self, frame: Frame) {
        self.send(frame);
    }

    fn emit(&self, event: EngineEvent) {
        match event {
            EngineEvent::Response(response) => {
                trace!(id = %self.inner.id, ?response, "inbound response");
            }
            EngineEvent::MethodResponse(response) => {
                // The server issues no outbound calls; nothing to correlate.
                debug!(id = %self.inner.id, ?response, "unmatched method response");
            }
            EngineEvent::ErrorResponse(response) => {
                let _ = self
                    .inner
                    .events
                    .send(SessionEvent::ErrorResponse(response.clone()));
                let _ = self.inner.server_events.send(ServerEvent::ErrorResponse {
                    session: self.clone(),
                    response,
                });
            }
            EngineEvent::NotificationError(error) => {
                let _ = self
                    .inner
                    .events
                    .send(SessionEvent::NotificationError(error.clone()));
                let _ = self
                    .inner
                    .server_events
                    .send(ServerEvent::NotificationError {
                        session: self.clone(),
                        error,
                    });
            }
        }
    }
}

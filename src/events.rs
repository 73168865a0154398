//! Endpoint event surface
//!
//! Typed publish/subscribe payloads observable by embedders, delivered
//! over `tokio::sync::broadcast` channels. One variant per event; no
//! inheritance, no dynamic dispatch.

use std::net::SocketAddr;

use serde_json::Value;

use crate::protocol::ErrorObject;
use crate::session::Session;

/// The HTTP upgrade request a connection arrived with
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// Peer socket address
    pub peer_addr: SocketAddr,
    /// Request URI, including any query string the client appended
    pub uri: String,
    /// Request headers in arrival order
    pub headers: Vec<(String, String)>,
}

/// Server-level events
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// The underlying listener is bound and accepting
    Listening,
    /// A new session was registered
    Connection {
        session: Session,
        request: ConnectRequest,
    },
    /// Transport-level error (accept or handshake failure)
    Error(String),
    /// A session received an error response with a null id
    ErrorResponse { session: Session, response: Value },
    /// A notification this server sent failed on the peer
    NotificationError {
        session: Session,
        error: ErrorObject,
    },
}

/// Per-session events
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The underlying transport closed
    Close,
    /// This session received an error response with a null id
    ErrorResponse(Value),
    /// A notification sent through this session failed on the peer
    NotificationError(ErrorObject),
}

/// Client-level events
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A connection attempt started
    Connecting,
    /// The first connection is open
    Connected,
    /// The connection closed for good; carries the close code and reason
    Disconnect { code: u16, reason: String },
    /// The client reached its terminal state
    Close,
    /// A reconnection attempt is about to be made
    Reconnecting(u32),
    /// A reconnection attempt failed
    ReconnectError(String),
    /// Reconnection attempts are exhausted
    ReconnectFailed,
    /// A reconnection attempt succeeded
    Reconnected(u32),
    /// The client received an error response with a null id
    ErrorResponse(Value),
    /// A notification this client sent failed on the peer
    NotificationError(ErrorObject),
    /// A response arrived that matches no pending call
    UnknownResponse(Value),
    /// Transport-level error
    Error(String),
}

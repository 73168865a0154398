//! Bidirectional JSON-RPC 2.0 over WebSocket
//!
//! Either peer of a connection is both caller and callee: it can issue
//! requests and notifications, and it can register method handlers that
//! answer the other side. The crate is layered so each concern stays
//! testable on its own:
//!
//! - **Protocol**: JSON-RPC 2.0 envelope types and the error catalogue
//! - **Codec**: frame decode/encode, batching, text/binary modality
//! - **Engine**: the symmetric parse/validate/classify/dispatch core
//! - **Server**: session table, rooms, fan-out, heartbeat
//! - **Client**: reconnection state machine, call timeouts, buffering
//! - **Logging**: optional tracing-subscriber install driven by the
//!   endpoint configs (`with_logging`) or [`logging::init_logging`]
//
// Example usage:
//
// ```rust
// use wsrpc::{Server, ServerConfig, Client, ClientConfig};
// use serde_json::json;
//
// // Server side
// let server = Server::new(ServerConfig::default().with_bind_addr("127.0.0.1:4000"));
// server.register("sum", |_session, params| async move {
//     let total: i64 = params
//         .and_then(|p| p.as_array().map(|a| a.iter().filter_map(|v| v.as_i64()).sum()))
//         .unwrap_or(0);
//     Ok(json!(total))
// });
// server.open().await?;
//
// // Client side
// let client = Client::new("ws://127.0.0.1:4000", ClientConfig::default());
// let total = client.call("sum", Some(json!([1, 2, 3]))).await?;
// ```

pub mod backoff;
pub mod client;
pub mod codec;
pub mod engine;
pub mod events;
pub mod logging;
pub mod pending;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod testing;

// Re-export main types for convenience
pub use client::{Client, ClientConfig, ClientState};
pub use codec::Frame;
pub use engine::{Engine, EngineEvent, EnginePeer, VersionCheck};
pub use events::{ClientEvent, ConnectRequest, ServerEvent, SessionEvent};
pub use logging::{LogConfig, LoggingError, init_logging};
pub use pending::{CallError, PendingCalls};
pub use protocol::{ErrorCode, ErrorObject, Notification, Request, Response};
pub use registry::{HandlerError, HandlerResult, MethodRegistry};
pub use server::{Server, ServerConfig, ServerError};
pub use session::Session;

//! Message-pair engine
//!
//! The shared parser/dispatcher used identically by server and client.
//! Given an inbound frame it decodes the payload, validates and classifies
//! each envelope, dispatches registered handlers, correlates responses,
//! and sends back zero or more response envelopes in the frame's modality.
//!
//! The engine is polymorphic over the peer's capability set — send a frame,
//! surface an event — so one implementation serves both endpoints.

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::codec::{self, Frame};
use crate::protocol::{self, ErrorCode, ErrorObject};
use crate::registry::{HandlerError, MethodRegistry};

// ============================================================================
// Version Check
// ============================================================================

/// Policy for the `jsonrpc` version field, applied uniformly to every
/// envelope including responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionCheck {
    /// Require `jsonrpc` to be exactly "2.0"
    #[default]
    Strict,
    /// Allow the field to be omitted, but reject any other value
    Loose,
    /// Skip the check entirely
    Ignore,
}

// ============================================================================
// Engine Events
// ============================================================================

/// Events surfaced while processing a frame
///
/// Each endpoint maps these onto its public event surface: the client
/// routes `MethodResponse` into its pending-call tracker, the server logs
/// and re-emits the error events per session.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Any inbound envelope classified as a response
    Response(Value),
    /// A response with a non-null id, answering an outbound call
    MethodResponse(Value),
    /// A response with a null id carrying an error object
    ErrorResponse(Value),
    /// A null-id error outside the parse/invalid-request band, reporting
    /// a failed notification this endpoint sent earlier
    NotificationError(ErrorObject),
}

/// Capability set the engine needs from a peer
#[async_trait]
pub trait EnginePeer: Clone + Send + Sync + 'static {
    /// Send a frame back to the peer; must be a no-op once the
    /// underlying connection is closed
    async fn send_frame(&self, frame: Frame);

    /// Surface an engine event on the endpoint
    fn emit(&self, event: EngineEvent);
}

// ============================================================================
// Engine
// ============================================================================

/// The symmetric parse/validate/classify/dispatch engine
pub struct Engine<P: EnginePeer> {
    registry: MethodRegistry<P>,
    version_check: VersionCheck,
}

impl<P: EnginePeer> Clone for Engine<P> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            version_check: self.version_check,
        }
    }
}

impl<P: EnginePeer> Engine<P> {
    /// Create an engine over a method registry
    pub fn new(registry: MethodRegistry<P>, version_check: VersionCheck) -> Self {
        Self {
            registry,
            version_check,
        }
    }

    /// Process one inbound frame and send back any responses it produces
    ///
    /// Batch items are processed sequentially so the response array order
    /// matches the request order.
    pub async fn handle(&self, peer: &P, frame: Frame) {
        let binary = frame.is_binary();
        trace!(bytes = frame.len(), binary, "inbound frame");

        let inbound = match codec::decode(&frame) {
            Ok(inbound) => inbound,
            Err(error) => {
                let reply = protocol::error_response(&Value::Null, &error);
                if let Some(frame) = codec::encode(vec![reply], false, binary) {
                    peer.send_frame(frame).await;
                }
                return;
            }
        };

        let batch = inbound.batch;
        let mut responses = Vec::with_capacity(inbound.items.len());
        for item in inbound.items {
            if let Some(response) = self.process_one(peer, item).await {
                responses.push(response);
            }
        }

        if let Some(frame) = codec::encode(responses, batch, binary) {
            peer.send_frame(frame).await;
        }
    }

    /// Validate, classify, and dispatch a single envelope
    ///
    /// Returns the response envelope to send, or `None` when the item
    /// produces no reply (responses, and notifications past validation).
    async fn process_one(&self, peer: &P, item: Value) -> Option<Value> {
        // Non-objects cannot carry an id at all.
        let Some(obj) = item.as_object() else {
            return Some(protocol::error_response(
                &Value::Null,
                &ErrorObject::new(ErrorCode::InvalidRequest),
            ));
        };

        // The id any reply is built with: the item's own id, null when absent.
        let req_id = obj.get("id").cloned();
        let reply_id = req_id.clone().unwrap_or(Value::Null);

        if !self.version_ok(obj) {
            return Some(protocol::error_response(
                &reply_id,
                &ErrorObject::new(ErrorCode::InvalidRequest).with_data("Invalid JSON-RPC Version"),
            ));
        }

        if protocol::is_response(&item) {
            return self.process_response(peer, &item, obj);
        }

        self.process_call(peer, obj, req_id, reply_id).await
    }

    /// Handle an envelope classified as a response
    fn process_response(
        &self,
        peer: &P,
        item: &Value,
        obj: &Map<String, Value>,
    ) -> Option<Value> {
        peer.emit(EngineEvent::Response(item.clone()));

        // `id` is present by classification; only its nullness matters here.
        let id = obj.get("id").cloned().unwrap_or(Value::Null);
        if !id.is_null() {
            // No reply to a reply.
            peer.emit(EngineEvent::MethodResponse(item.clone()));
            return None;
        }

        let Some(error_value) = obj.get("error") else {
            // Null id and no error field: InvalidRequest-shaped garbage.
            return Some(protocol::error_response(
                &Value::Null,
                &ErrorObject::new(ErrorCode::InvalidRequest),
            ));
        };

        peer.emit(EngineEvent::ErrorResponse(item.clone()));

        // Parse and invalid-request errors are absorbed: that peer already
        // knows it sent us something broken.
        let code = error_value.get("code").and_then(Value::as_i64);
        let absorbed = matches!(
            code,
            Some(c) if c == ErrorCode::ParseError as i64 || c == ErrorCode::InvalidRequest as i64
        );
        if !absorbed {
            let error = ErrorObject::from_value(error_value).unwrap_or_else(|| {
                ErrorObject::new(ErrorCode::InternalError).with_data(error_value.clone())
            });
            peer.emit(EngineEvent::NotificationError(error));
        }

        None
    }

    /// Handle an envelope classified as a call (request or notification)
    async fn process_call(
        &self,
        peer: &P,
        obj: &Map<String, Value>,
        req_id: Option<Value>,
        reply_id: Value,
    ) -> Option<Value> {
        let method = match obj.get("method") {
            Some(Value::String(name)) if !name.is_empty() => name.clone(),
            None | Some(Value::String(_)) => {
                return Some(protocol::error_response(
                    &reply_id,
                    &ErrorObject::new(ErrorCode::MethodNotFound).with_data("Method not specified"),
                ));
            }
            Some(_) => {
                return Some(protocol::error_response(
                    &reply_id,
                    &ErrorObject::new(ErrorCode::InvalidRequest)
                        .with_data("Invalid type of method name"),
                ));
            }
        };

        // Params must be an object or array when given; null counts as absent.
        let params = match obj.get("params") {
            None | Some(Value::Null) => None,
            Some(value @ (Value::Object(_) | Value::Array(_))) => Some(value.clone()),
            Some(_) => {
                return Some(protocol::error_response(
                    &reply_id,
                    &ErrorObject::new(ErrorCode::InvalidRequest),
                ));
            }
        };

        let Some(handler) = self.registry.get(&method) else {
            return Some(protocol::error_response(
                &reply_id,
                &ErrorObject::new(ErrorCode::MethodNotFound),
            ));
        };

        trace!(method = %method, "dispatching handler");
        let outcome = handler(peer.clone(), params).await;

        if req_id.is_none() {
            // Notification: discard the result, drop any handler failure.
            if let Err(error) = outcome {
                debug!(method = %method, error = %error, "notification handler failed");
            }
            return None;
        }

        match outcome {
            Ok(result) => Some(protocol::success_response(&reply_id, result)),
            Err(HandlerError::Rpc(error)) => Some(protocol::error_response(&reply_id, &error)),
            Err(HandlerError::Failure { kind, detail }) => Some(protocol::error_response(
                &reply_id,
                &ErrorObject::new(ErrorCode::ServerError)
                    .with_message(kind)
                    .with_data(detail),
            )),
        }
    }

    fn version_ok(&self, obj: &Map<String, Value>) -> bool {
        match self.version_check {
            VersionCheck::Ignore => true,
            VersionCheck::Strict => {
                obj.get("jsonrpc").and_then(Value::as_str) == Some(protocol::VERSION)
            }
            VersionCheck::Loose => match obj.get("jsonrpc") {
                None => true,
                Some(value) => value.as_str() == Some(protocol::VERSION),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockPeer;
    use serde_json::json;

    fn engine(version_check: VersionCheck) -> (Engine<MockPeer>, MethodRegistry<MockPeer>) {
        let registry = MethodRegistry::new();
        (Engine::new(registry.clone(), version_check), registry)
    }

    fn text(frame: &Frame) -> Value {
        match frame {
            Frame::Text(text) => serde_json::from_str(text).unwrap(),
            Frame::Binary(bytes) => serde_json::from_slice(bytes).unwrap(),
        }
    }

    #[tokio::test]
    async fn parse_error_replies_with_null_id() {
        let (engine, _) = engine(VersionCheck::Strict);
        let peer = MockPeer::new();

        engine.handle(&peer, Frame::Text("@@@@@".into())).await;

        let sent = peer.sent_frames();
        assert_eq!(sent.len(), 1);
        let reply = text(&sent[0]);
        assert_eq!(reply["error"]["code"], json!(-32700));
        assert_eq!(reply["id"], Value::Null);
    }

    #[tokio::test]
    async fn empty_object_fails_version_check() {
        let (engine, _) = engine(VersionCheck::Strict);
        let peer = MockPeer::new();

        engine.handle(&peer, Frame::Text("{}".into())).await;

        let reply = text(&peer.sent_frames()[0]);
        assert_eq!(reply["error"]["code"], json!(-32600));
        assert_eq!(reply["id"], Value::Null);
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let (engine, _) = engine(VersionCheck::Strict);
        let peer = MockPeer::new();

        let frame = Frame::Text(r#"{"jsonrpc":"2.0","method":"myMethod","id":1}"#.into());
        engine.handle(&peer, frame).await;

        let reply = text(&peer.sent_frames()[0]);
        assert_eq!(reply["error"]["code"], json!(-32601));
        assert_eq!(reply["error"]["message"], json!("Method not found"));
        assert_eq!(reply["id"], json!(1));
    }

    #[tokio::test]
    async fn registered_method_returns_result() {
        let (engine, registry) = engine(VersionCheck::Strict);
        registry.register("myMethod", |_peer, _params| async {
            Ok(json!({"a": ["the return value"]}))
        });
        let peer = MockPeer::new();

        let frame = Frame::Text(r#"{"jsonrpc":"2.0","method":"myMethod","id":3}"#.into());
        engine.handle(&peer, frame).await;

        let reply = text(&peer.sent_frames()[0]);
        assert_eq!(reply["result"], json!({"a": ["the return value"]}));
        assert_eq!(reply["id"], json!(3));
    }

    #[tokio::test]
    async fn missing_method_is_not_specified() {
        let (engine, _) = engine(VersionCheck::Strict);
        let peer = MockPeer::new();

        let frame = Frame::Text(r#"{"jsonrpc":"2.0","id":1}"#.into());
        engine.handle(&peer, frame).await;

        let reply = text(&peer.sent_frames()[0]);
        assert_eq!(reply["error"]["code"], json!(-32601));
        assert_eq!(reply["error"]["data"], json!("Method not specified"));
    }

    #[tokio::test]
    async fn non_string_method_is_invalid_request() {
        let (engine, _) = engine(VersionCheck::Strict);
        let peer = MockPeer::new();

        let frame = Frame::Text(r#"{"jsonrpc":"2.0","method":42,"id":1}"#.into());
        engine.handle(&peer, frame).await;

        let reply = text(&peer.sent_frames()[0]);
        assert_eq!(reply["error"]["code"], json!(-32600));
        assert_eq!(reply["error"]["data"], json!("Invalid type of method name"));
    }

    #[tokio::test]
    async fn scalar_params_are_rejected_and_array_params_allowed() {
        let (engine, registry) = engine(VersionCheck::Strict);
        registry.register("echo", |_peer, params| async move {
            Ok(params.unwrap_or(Value::Null))
        });
        let peer = MockPeer::new();

        let bad = Frame::Text(r#"{"jsonrpc":"2.0","method":"echo","params":5,"id":1}"#.into());
        engine.handle(&peer, bad).await;
        assert_eq!(text(&peer.sent_frames()[0])["error"]["code"], json!(-32600));

        let good = Frame::Text(r#"{"jsonrpc":"2.0","method":"echo","params":[5],"id":2}"#.into());
        engine.handle(&peer, good).await;
        assert_eq!(text(&peer.sent_frames()[1])["result"], json!([5]));
    }

    #[tokio::test]
    async fn null_params_count_as_absent() {
        let (engine, registry) = engine(VersionCheck::Strict);
        registry.register("probe", |_peer, params| async move {
            Ok(json!(params.is_none()))
        });
        let peer = MockPeer::new();

        let frame =
            Frame::Text(r#"{"jsonrpc":"2.0","method":"probe","params":null,"id":1}"#.into());
        engine.handle(&peer, frame).await;
        assert_eq!(text(&peer.sent_frames()[0])["result"], json!(true));
    }

    #[tokio::test]
    async fn handler_failure_becomes_server_error() {
        let (engine, registry) = engine(VersionCheck::Strict);
        registry.register("boom", |_peer, _params| async {
            Err(HandlerError::failure("TypeError", "cannot read x"))
        });
        let peer = MockPeer::new();

        let frame = Frame::Text(r#"{"jsonrpc":"2.0","method":"boom","id":1}"#.into());
        engine.handle(&peer, frame).await;

        let reply = text(&peer.sent_frames()[0]);
        assert_eq!(reply["error"]["code"], json!(-32000));
        assert_eq!(reply["error"]["message"], json!("TypeError"));
        assert_eq!(reply["error"]["data"], json!("cannot read x"));
    }

    #[tokio::test]
    async fn handler_rpc_error_passes_through() {
        let (engine, registry) = engine(VersionCheck::Strict);
        registry.register("strict", |_peer, _params| async {
            Err(ErrorObject::new(ErrorCode::InvalidParams).into())
        });
        let peer = MockPeer::new();

        let frame = Frame::Text(r#"{"jsonrpc":"2.0","method":"strict","id":1}"#.into());
        engine.handle(&peer, frame).await;

        let reply = text(&peer.sent_frames()[0]);
        assert_eq!(reply["error"]["code"], json!(-32602));
        assert_eq!(reply["error"]["message"], json!("Invalid params"));
    }

    #[tokio::test]
    async fn notification_handler_failure_produces_no_reply() {
        let (engine, registry) = engine(VersionCheck::Strict);
        registry.register("boom", |_peer, _params| async {
            Err(HandlerError::failure("TypeError", "nope"))
        });
        let peer = MockPeer::new();

        let frame = Frame::Text(r#"{"jsonrpc":"2.0","method":"boom"}"#.into());
        engine.handle(&peer, frame).await;

        assert!(peer.sent_frames().is_empty());
    }

    #[tokio::test]
    async fn notification_with_unknown_method_replies_with_null_id() {
        let (engine, _) = engine(VersionCheck::Strict);
        let peer = MockPeer::new();

        let frame = Frame::Text(r#"{"jsonrpc":"2.0","method":"myMethod"}"#.into());
        engine.handle(&peer, frame).await;

        let reply = text(&peer.sent_frames()[0]);
        assert_eq!(reply["error"]["code"], json!(-32601));
        assert_eq!(reply["id"], Value::Null);
    }

    #[tokio::test]
    async fn batch_preserves_order_and_skips_notifications() {
        let (engine, registry) = engine(VersionCheck::Strict);
        registry.register("echo", |_peer, params| async move {
            Ok(params.unwrap_or(Value::Null))
        });
        let peer = MockPeer::new();

        let frame = Frame::Text(
            r#"[
                {"jsonrpc":"2.0","method":"echo","params":[1],"id":10},
                {"jsonrpc":"2.0","method":"echo","params":[2]},
                {"jsonrpc":"2.0","method":"echo","params":[3],"id":11}
            ]"#
            .into(),
        );
        engine.handle(&peer, frame).await;

        let reply = text(&peer.sent_frames()[0]);
        let items = reply.as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["id"], json!(10));
        assert_eq!(items[1]["id"], json!(11));
    }

    #[tokio::test]
    async fn all_notification_batch_gets_no_reply() {
        let (engine, registry) = engine(VersionCheck::Strict);
        registry.register("fire", |_peer, _params| async { Ok(Value::Null) });
        let peer = MockPeer::new();

        let frame = Frame::Text(
            r#"[{"jsonrpc":"2.0","method":"fire"},{"jsonrpc":"2.0","method":"fire"}]"#.into(),
        );
        engine.handle(&peer, frame).await;

        assert!(peer.sent_frames().is_empty());
    }

    #[tokio::test]
    async fn empty_batch_is_invalid_request() {
        let (engine, _) = engine(VersionCheck::Strict);
        let peer = MockPeer::new();

        engine.handle(&peer, Frame::Text("[]".into())).await;

        let reply = text(&peer.sent_frames()[0]);
        assert_eq!(reply["error"]["code"], json!(-32600));
        assert_eq!(reply["error"]["data"], json!("Empty Array"));
        assert_eq!(reply["id"], Value::Null);
    }

    #[tokio::test]
    async fn non_object_batch_item_is_invalid_request() {
        let (engine, _) = engine(VersionCheck::Strict);
        let peer = MockPeer::new();

        engine.handle(&peer, Frame::Text("[1]".into())).await;

        let reply = text(&peer.sent_frames()[0]);
        assert_eq!(reply[0]["error"]["code"], json!(-32600));
        assert_eq!(reply[0]["id"], Value::Null);
    }

    #[tokio::test]
    async fn binary_request_gets_binary_reply() {
        let (engine, registry) = engine(VersionCheck::Strict);
        registry.register("m", |_peer, _params| async { Ok(json!(1)) });
        let peer = MockPeer::new();

        let frame = Frame::Binary(br#"{"jsonrpc":"2.0","method":"m","id":1}"#.to_vec());
        engine.handle(&peer, frame).await;

        assert!(peer.sent_frames()[0].is_binary());
    }

    #[tokio::test]
    async fn loose_mode_allows_omitted_version_only() {
        let (engine, registry) = engine(VersionCheck::Loose);
        registry.register("m", |_peer, _params| async { Ok(json!(1)) });
        let peer = MockPeer::new();

        let omitted = Frame::Text(r#"{"method":"m","id":1}"#.into());
        engine.handle(&peer, omitted).await;
        assert_eq!(text(&peer.sent_frames()[0])["result"], json!(1));

        let wrong = Frame::Text(r#"{"jsonrpc":"1.0","method":"m","id":2}"#.into());
        engine.handle(&peer, wrong).await;
        let reply = text(&peer.sent_frames()[1]);
        assert_eq!(reply["error"]["code"], json!(-32600));
        assert_eq!(reply["error"]["data"], json!("Invalid JSON-RPC Version"));
    }

    #[tokio::test]
    async fn ignore_mode_skips_the_check() {
        let (engine, registry) = engine(VersionCheck::Ignore);
        registry.register("m", |_peer, _params| async { Ok(json!(1)) });
        let peer = MockPeer::new();

        let frame = Frame::Text(r#"{"jsonrpc":"0.1","method":"m","id":1}"#.into());
        engine.handle(&peer, frame).await;
        assert_eq!(text(&peer.sent_frames()[0])["result"], json!(1));
    }

    #[tokio::test]
    async fn response_with_id_emits_method_response_and_no_reply() {
        let (engine, _) = engine(VersionCheck::Strict);
        let peer = MockPeer::new();

        let frame = Frame::Text(r#"{"jsonrpc":"2.0","result":"ok","id":4}"#.into());
        engine.handle(&peer, frame).await;

        assert!(peer.sent_frames().is_empty());
        let events = peer.events();
        assert!(
            events
                .iter()
                .any(|e| matches!(e, EngineEvent::MethodResponse(_)))
        );
    }

    #[tokio::test]
    async fn null_id_error_outside_band_emits_notification_error() {
        let (engine, _) = engine(VersionCheck::Strict);
        let peer = MockPeer::new();

        let frame = Frame::Text(
            r#"{"jsonrpc":"2.0","error":{"code":-32601,"message":"Method not found"},"id":null}"#
                .into(),
        );
        engine.handle(&peer, frame).await;

        assert!(peer.sent_frames().is_empty());
        let errors: Vec<_> = peer
            .events()
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::NotificationError(err) => Some(err),
                _ => None,
            })
            .collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, -32601);
    }

    #[tokio::test]
    async fn null_id_parse_error_is_absorbed() {
        let (engine, _) = engine(VersionCheck::Strict);
        let peer = MockPeer::new();

        let frame = Frame::Text(
            r#"{"jsonrpc":"2.0","error":{"code":-32700,"message":"Parse error"},"id":null}"#.into(),
        );
        engine.handle(&peer, frame).await;

        assert!(peer.sent_frames().is_empty());
        assert!(
            !peer
                .events()
                .iter()
                .any(|e| matches!(e, EngineEvent::NotificationError(_)))
        );
        assert!(
            peer.events()
                .iter()
                .any(|e| matches!(e, EngineEvent::ErrorResponse(_)))
        );
    }

    #[tokio::test]
    async fn null_id_response_without_error_is_garbage() {
        let (engine, _) = engine(VersionCheck::Strict);
        let peer = MockPeer::new();

        let frame = Frame::Text(r#"{"jsonrpc":"2.0","result":"ok","id":null}"#.into());
        engine.handle(&peer, frame).await;

        let reply = text(&peer.sent_frames()[0]);
        assert_eq!(reply["error"]["code"], json!(-32600));
        assert_eq!(reply["id"], Value::Null);
    }
}

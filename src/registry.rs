//! Method registry
//!
//! Maps method names to async handler closures on an endpoint. Handlers
//! receive the peer they were invoked for plus the call's params and
//! return a result value or a failure that the engine converts into a
//! wire error response.

use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use crate::protocol::ErrorObject;

/// Failure raised by a method handler
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// A well-formed JSON-RPC error object, sent on the wire as-is
    #[error("{0}")]
    Rpc(ErrorObject),

    /// Any other failure; becomes a `ServerError` response whose message
    /// is the failure kind and whose data is the failure detail
    #[error("{kind}: {detail}")]
    Failure { kind: String, detail: String },
}

impl HandlerError {
    /// Build a generic failure from a kind and detail
    pub fn failure(kind: impl Into<String>, detail: impl Into<String>) -> Self {
        HandlerError::Failure {
            kind: kind.into(),
            detail: detail.into(),
        }
    }
}

impl From<ErrorObject> for HandlerError {
    fn from(error: ErrorObject) -> Self {
        HandlerError::Rpc(error)
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(error: serde_json::Error) -> Self {
        HandlerError::failure("SerializationError", error.to_string())
    }
}

/// Outcome of a method handler
pub type HandlerResult = Result<Value, HandlerError>;

/// Boxed handler future
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// Type alias for a registered handler to reduce complexity
type Handler<P> = Arc<dyn Fn(P, Option<Value>) -> HandlerFuture + Send + Sync>;

/// Registry of method handlers for one endpoint
///
/// Lookups clone the handler out of the lock before invoking it, so the
/// mapping may be mutated while a dispatch is in flight; each lookup
/// observes either the old or the new mapping.
pub struct MethodRegistry<P> {
    methods: Arc<RwLock<HashMap<String, Handler<P>>>>,
}

impl<P> Clone for MethodRegistry<P> {
    fn clone(&self) -> Self {
        Self {
            methods: Arc::clone(&self.methods),
        }
    }
}

impl<P: Send + 'static> Default for MethodRegistry<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Send + 'static> MethodRegistry<P> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            methods: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a handler, replacing any previous one under the same name
    pub fn register<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(P, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let boxed: Handler<P> = Arc::new(move |peer, params| -> HandlerFuture {
            Box::pin(handler(peer, params))
        });
        self.methods
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(method.into(), boxed);
    }

    /// Remove a handler; returns true iff one was registered
    pub fn unregister(&self, method: &str) -> bool {
        self.methods
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(method)
            .is_some()
    }

    /// Remove every handler
    pub fn clear(&self) {
        self.methods
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Whether a handler is registered under this name
    pub fn contains(&self, method: &str) -> bool {
        self.methods
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(method)
    }

    /// Look up a handler by name
    pub(crate) fn get(&self, method: &str) -> Option<Handler<P>> {
        self.methods
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(method)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn register_and_invoke() {
        let registry: MethodRegistry<()> = MethodRegistry::new();
        registry.register("sum", |_peer, params| async move {
            let nums = params.unwrap_or(Value::Null);
            let total: i64 = nums
                .as_array()
                .map(|a| a.iter().filter_map(Value::as_i64).sum())
                .unwrap_or(0);
            Ok(json!(total))
        });

        let handler = registry.get("sum").unwrap();
        let result = handler((), Some(json!([1, 2, 3]))).await.unwrap();
        assert_eq!(result, json!(6));
    }

    #[tokio::test]
    async fn replacement_is_allowed() {
        let registry: MethodRegistry<()> = MethodRegistry::new();
        registry.register("m", |_, _| async { Ok(json!("first")) });
        registry.register("m", |_, _| async { Ok(json!("second")) });

        let handler = registry.get("m").unwrap();
        assert_eq!(handler((), None).await.unwrap(), json!("second"));
    }

    #[test]
    fn unregister_and_clear() {
        let registry: MethodRegistry<()> = MethodRegistry::new();
        registry.register("a", |_, _| async { Ok(Value::Null) });
        registry.register("b", |_, _| async { Ok(Value::Null) });

        assert!(registry.unregister("a"));
        assert!(!registry.unregister("a"));
        assert!(registry.contains("b"));

        registry.clear();
        assert!(!registry.contains("b"));
    }
}

//! Handler registry
//!
//! Maps server-initiated methods to handlers. Notifications fan out to
//! every registered handler in registration order; requests have exactly
//! one responder. The mutable registry is consumed into a sealed,
//! lock-free form before the handshake, so registration after the wire
//! is live is unrepresentable.

use crate::jsonrpc::ErrorObject;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Error produced by a handler, reported back to the server as a
/// JSON-RPC error object when the handler was answering a request
#[derive(Debug, Clone)]
pub struct HandlerError {
    pub code: i32,
    pub message: String,
}

impl HandlerError {
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: ErrorObject::INVALID_PARAMS,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: ErrorObject::INTERNAL_ERROR,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "handler error {}: {}", self.code, self.message)
    }
}

/// Type-erased notification handler
pub type NotificationHandler =
    Arc<dyn Fn(Option<Value>) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// Type-erased request handler
pub type RequestHandler =
    Arc<dyn Fn(Option<Value>) -> BoxFuture<'static, Result<Value, HandlerError>> + Send + Sync>;

/// Error types for handler registration
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("a request handler for {0} is already registered")]
    DuplicateRequestHandler(String),
}

/// Mutable registry, populated by feature modules before the handshake
#[derive(Default)]
pub struct HandlerRegistry {
    notifications: HashMap<String, Vec<NotificationHandler>>,
    requests: HashMap<String, RequestHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a raw notification handler; handlers for the same method
    /// fan out in registration order
    pub fn on_notification_raw(&mut self, method: &str, handler: NotificationHandler) {
        self.notifications
            .entry(method.to_string())
            .or_default()
            .push(handler);
    }

    /// Register a raw request handler; at most one per method
    pub fn on_request_raw(
        &mut self,
        method: &str,
        handler: RequestHandler,
    ) -> Result<(), RegistryError> {
        if self.requests.contains_key(method) {
            return Err(RegistryError::DuplicateRequestHandler(method.to_string()));
        }
        self.requests.insert(method.to_string(), handler);
        Ok(())
    }

    /// Register a notification handler with typed parameter decoding
    pub fn on_notification<P, F, Fut>(&mut self, method: &str, handler: F)
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.on_notification_raw(
            method,
            Arc::new(move |params: Option<Value>| {
                let handler = Arc::clone(&handler);
                Box::pin(async move {
                    let params: P = serde_json::from_value(params.unwrap_or(Value::Null))
                        .map_err(|e| HandlerError::invalid_params(e.to_string()))?;
                    handler(params).await
                })
            }),
        );
    }

    /// Register a request handler with typed parameter decoding and
    /// result encoding
    pub fn on_request<P, R, F, Fut>(&mut self, method: &str, handler: F) -> Result<(), RegistryError>
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.on_request_raw(
            method,
            Arc::new(move |params: Option<Value>| {
                let handler = Arc::clone(&handler);
                Box::pin(async move {
                    let params: P = serde_json::from_value(params.unwrap_or(Value::Null))
                        .map_err(|e| HandlerError::invalid_params(e.to_string()))?;
                    let result = handler(params).await?;
                    serde_json::to_value(result)
                        .map_err(|e| HandlerError::internal(e.to_string()))
                })
            }),
        )
    }

    /// Freeze the registry for lock-free lookup
    pub fn seal(self) -> SealedRegistry {
        SealedRegistry {
            notifications: self.notifications,
            requests: self.requests,
        }
    }
}

/// Immutable registry shared by every binding of a session
#[derive(Default)]
pub struct SealedRegistry {
    notifications: HashMap<String, Vec<NotificationHandler>>,
    requests: HashMap<String, RequestHandler>,
}

impl SealedRegistry {
    pub fn notification_handlers(&self, method: &str) -> Option<&[NotificationHandler]> {
        self.notifications.get(method).map(Vec::as_slice)
    }

    pub fn request_handler(&self, method: &str) -> Option<&RequestHandler> {
        self.requests.get(method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_notification_fan_out_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            registry.on_notification("test/event", move |_: Value| {
                let order = Arc::clone(&order);
                async move {
                    order.lock().unwrap().push(tag);
                    Ok(())
                }
            });
        }

        let sealed = registry.seal();
        let handlers = sealed.notification_handlers("test/event").unwrap();
        assert_eq!(handlers.len(), 3);

        for handler in handlers {
            handler(Some(Value::Null)).await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_single_request_handler_per_method() {
        let mut registry = HandlerRegistry::new();

        registry
            .on_request("test/ask", |_: Value| async { Ok(serde_json::json!(1)) })
            .unwrap();

        let result = registry.on_request("test/ask", |_: Value| async { Ok(serde_json::json!(2)) });

        assert!(matches!(
            result,
            Err(RegistryError::DuplicateRequestHandler(_))
        ));
    }

    #[tokio::test]
    async fn test_typed_decode_failure_is_invalid_params() {
        let mut registry = HandlerRegistry::new();
        registry
            .on_request("test/typed", |n: u64| async move { Ok(n + 1) })
            .unwrap();

        let sealed = registry.seal();
        let handler = sealed.request_handler("test/typed").unwrap();

        let err = handler(Some(serde_json::json!("not a number")))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorObject::INVALID_PARAMS);

        let ok = handler(Some(serde_json::json!(41))).await.unwrap();
        assert_eq!(ok, serde_json::json!(42));
    }

    #[test]
    fn test_unknown_method_lookup() {
        let sealed = HandlerRegistry::new().seal();
        assert!(sealed.notification_handlers("nope").is_none());
        assert!(sealed.request_handler("nope").is_none());
    }
}

//! Handler registry
//!
//! Maps method names to async handlers. Typed registration narrows raw JSON
//! params into the handler's parameter type at this boundary, so handler
//! code never sees an undecoded payload.

use crate::connection::Connection;
use crate::error::ProtocolError;
use crate::protocol::{Notification, Request, decode_params};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Handler for a request; its outcome becomes the response
pub type MethodHandler =
    Arc<dyn Fn(Connection, Option<Value>) -> BoxFuture<'static, Result<Value, ProtocolError>> + Send + Sync>;

/// Handler for a notification; errors are logged, never answered
pub type NotificationHandler =
    Arc<dyn Fn(Connection, Option<Value>) -> BoxFuture<'static, Result<(), ProtocolError>> + Send + Sync>;

/// A message the peer sent that needs dispatching
#[derive(Debug, Clone)]
pub enum InboundMessage {
    Request(Request),
    Notification(Notification),
}

impl InboundMessage {
    pub fn method(&self) -> &str {
        match self {
            Self::Request(req) => &req.method,
            Self::Notification(n) => &n.method,
        }
    }
}

/// Method name to handler table
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    methods: HashMap<String, MethodHandler>,
    notifications: HashMap<String, NotificationHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed request handler.
    ///
    /// Params that do not decode into `P` are answered with invalid params
    /// (-32602) without invoking the handler.
    pub fn register_method<P, R, F, Fut>(&mut self, method: impl Into<String>, handler: F) -> &mut Self
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(Connection, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ProtocolError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.register_raw_method(method, move |conn, params| {
            let handler = Arc::clone(&handler);
            async move {
                let params: P = decode_params(params)?;
                let result = handler(conn, params).await?;
                serde_json::to_value(result).map_err(|e| {
                    ProtocolError::internal_error().with_data(json!({ "reason": e.to_string() }))
                })
            }
        })
    }

    /// Register a request handler over raw params
    pub fn register_raw_method<F, Fut>(&mut self, method: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Connection, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ProtocolError>> + Send + 'static,
    {
        let handler: MethodHandler = Arc::new(move |conn, params| handler(conn, params).boxed());
        self.methods.insert(method.into(), handler);
        self
    }

    /// Register a typed notification handler
    pub fn register_notification<P, F, Fut>(&mut self, method: impl Into<String>, handler: F) -> &mut Self
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(Connection, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ProtocolError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.register_raw_notification(method, move |conn, params| {
            let handler = Arc::clone(&handler);
            async move {
                let params: P = decode_params(params)?;
                handler(conn, params).await
            }
        })
    }

    /// Register a notification handler over raw params
    pub fn register_raw_notification<F, Fut>(&mut self, method: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Connection, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ProtocolError>> + Send + 'static,
    {
        let handler: NotificationHandler = Arc::new(move |conn, params| handler(conn, params).boxed());
        self.notifications.insert(method.into(), handler);
        self
    }

    /// Whether a request or notification handler exists for `method`
    pub fn contains(&self, method: &str) -> bool {
        self.methods.contains_key(method) || self.notifications.contains_key(method)
    }

    /// Registered method names, sorted
    pub fn methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .methods
            .keys()
            .chain(self.notifications.keys())
            .cloned()
            .collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty() && self.notifications.is_empty()
    }

    /// Run the handler for one inbound message.
    ///
    /// Returns the response outcome for requests and `None` for
    /// notifications. A panicking handler is reported as an internal error.
    pub async fn handle(
        &self,
        conn: &Connection,
        message: InboundMessage,
    ) -> Option<Result<Value, ProtocolError>> {
        match message {
            InboundMessage::Request(req) => {
                let Some(handler) = self.methods.get(&req.method) else {
                    debug!(method = %req.method, id = %req.id, "no handler for request");
                    return Some(Err(ProtocolError::method_not_found(&req.method)));
                };

                let outcome = AssertUnwindSafe(handler(conn.clone(), req.params))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        error!(method = %req.method, id = %req.id, "request handler panicked");
                        Err(ProtocolError::internal_error())
                    });
                Some(outcome)
            }
            InboundMessage::Notification(n) => {
                let Some(handler) = self.notifications.get(&n.method) else {
                    debug!(method = %n.method, "ignoring unhandled notification");
                    return None;
                };

                match AssertUnwindSafe(handler(conn.clone(), n.params))
                    .catch_unwind()
                    .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(method = %n.method, error = %e, "notification handler failed"),
                    Err(_) => error!(method = %n.method, "notification handler panicked"),
                }
                None
            }
        }
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("methods", &self.methods())
            .finish()
    }
}

//! The contract between the server core and the method provider.
//!
//! A [`Bridge`] exposes the callable method table and, optionally, an
//! [`EventSchema`] that vets outbound event payloads. Handlers receive a
//! [`CallContext`] through which they can publish events back to
//! subscribers without knowing anything about connections.

use std::sync::Arc;

use async_trait::async_trait;
use courier_core::ids::ConnectionId;
use serde_json::{Map, Value};

use crate::errors::RpcError;
use crate::types::{JsonRpcRequest, Params};

/// Trait implemented by every RPC method handler.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    /// Execute the handler with the given params and context.
    async fn handle(&self, params: Option<Params>, ctx: &CallContext) -> Result<Value, RpcError>;
}

/// Validates event payloads before they are framed.
#[cfg_attr(test, mockall::automock)]
pub trait EventSchema: Send + Sync {
    /// Reject `params` that do not fit the schema of `event_id`.
    fn verify_event_params(&self, event_id: &str, params: &Map<String, Value>) -> Result<(), RpcError>;
}

/// Method table provider.
pub trait Bridge: Send + Sync {
    /// Every exposed method with its name.
    fn methods(&self) -> Vec<(String, Arc<dyn MethodHandler>)>;

    /// Resolve `method`, failing with [`RpcError::MethodNotFound`].
    fn dispatch(&self, method: &str) -> Result<Arc<dyn MethodHandler>, RpcError>;

    /// Schema for outbound events, if the bridge defines one.
    fn event_schema(&self) -> Option<Arc<dyn EventSchema>> {
        None
    }
}

/// Sink for events raised by handlers.
pub trait EventPublisher: Send + Sync {
    /// Publish `event_id` with `params` to every subscriber of `destination`.
    ///
    /// Returns the number of subscribers the event was queued for.
    fn publish(
        &self,
        destination: &str,
        event_id: &str,
        params: Map<String, Value>,
    ) -> Result<usize, RpcError>;
}

/// Publisher that drops everything. Used where no subscribers can exist.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullPublisher;

impl EventPublisher for NullPublisher {
    fn publish(&self, _: &str, _: &str, _: Map<String, Value>) -> Result<usize, RpcError> {
        Ok(0)
    }
}

/// Per-call context handed to handlers.
#[derive(Clone)]
pub struct CallContext {
    /// Connection the request arrived on, if any.
    pub connection_id: Option<ConnectionId>,
    /// Event publisher of the hosting server.
    pub publisher: Arc<dyn EventPublisher>,
}

impl CallContext {
    /// Context for a call arriving on `connection_id`.
    pub fn new(connection_id: Option<ConnectionId>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            connection_id,
            publisher,
        }
    }

    /// Context with no connection and a [`NullPublisher`].
    pub fn detached() -> Self {
        Self::new(None, Arc::new(NullPublisher))
    }
}

impl std::fmt::Debug for CallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallContext")
            .field("connection_id", &self.connection_id)
            .finish_non_exhaustive()
    }
}

/// Validate `params` against `schema` and build the event notification.
pub fn build_event(
    schema: Option<&dyn EventSchema>,
    event_id: &str,
    params: Map<String, Value>,
) -> Result<JsonRpcRequest, RpcError> {
    if let Some(schema) = schema {
        schema.verify_event_params(event_id, &params)?;
    }
    Ok(JsonRpcRequest::event(event_id, params))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use mockall::predicate::eq;
    use serde_json::json;

    fn params() -> Map<String, Value> {
        let mut map = Map::new();
        let _ = map.insert("status".into(), json!("Up"));
        map
    }

    #[test]
    fn build_event_consults_schema() {
        let mut schema = MockEventSchema::new();
        let _ = schema
            .expect_verify_event_params()
            .with(eq("|virt|VM_status|a"), eq(params()))
            .times(1)
            .returning(|_, _| Ok(()));

        let event = build_event(Some(&schema), "|virt|VM_status|a", params()).unwrap();
        assert_eq!(event.method, "|virt|VM_status|a");
        assert!(event.is_notification());
    }

    #[test]
    fn build_event_propagates_schema_rejection() {
        let mut schema = MockEventSchema::new();
        let _ = schema
            .expect_verify_event_params()
            .returning(|_, _| Err(RpcError::invalid_params("bad status")));

        let err = build_event(Some(&schema), "evt", params()).unwrap_err();
        assert_matches!(err, RpcError::InvalidParams { .. });
    }

    #[test]
    fn build_event_without_schema() {
        let event = build_event(None, "evt", Map::new()).unwrap();
        let named = event.params.unwrap();
        assert!(named.get(0, "notify_time").is_some());
    }

    #[test]
    fn null_publisher_reaches_nobody() {
        let ctx = CallContext::detached();
        assert_eq!(ctx.publisher.publish("t", "e", Map::new()).unwrap(), 0);
        assert!(ctx.connection_id.is_none());
    }
}

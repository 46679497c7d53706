//! Event publishing from handlers and embedders to subscribers.

use std::sync::Arc;

use bytes::Bytes;
use courier_core::constants::JSON_CONTENT_TYPE;
use courier_rpc::bridge::build_event;
use courier_rpc::{EventPublisher, EventSchema, RpcError, codec};
use serde_json::{Map, Value};
use tracing::debug;

use crate::subscriptions::SubscriptionRegistry;

/// [`EventPublisher`] that validates events against the bridge schema and
/// fans them out through the subscription table.
pub struct ServerPublisher {
    subscriptions: Arc<SubscriptionRegistry>,
    schema: Option<Arc<dyn EventSchema>>,
}

impl ServerPublisher {
    /// Create a publisher over `subscriptions`.
    pub fn new(subscriptions: Arc<SubscriptionRegistry>, schema: Option<Arc<dyn EventSchema>>) -> Self {
        Self {
            subscriptions,
            schema,
        }
    }
}

impl EventPublisher for ServerPublisher {
    fn publish(
        &self,
        destination: &str,
        event_id: &str,
        params: Map<String, Value>,
    ) -> Result<usize, RpcError> {
        let event = build_event(self.schema.as_deref(), event_id, params)?;
        let body = codec::encode_request(&event)
            .map_err(|e| RpcError::internal(format!("failed to encode event: {e}")))?;
        let delivered = self
            .subscriptions
            .publish(destination, &Bytes::from(body), Some(JSON_CONTENT_TYPE));
        debug!(destination, event_id, delivered, "event published");
        Ok(delivered)
    }
}

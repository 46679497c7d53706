//! Demo bridge served by `courier serve`.
//!
//! | method          | params                               | result                      |
//! |-----------------|--------------------------------------|-----------------------------|
//! | `echo`          | `[text]` / `{text}`                  | `text`                      |
//! | `ping`          | none                                 | `true`                      |
//! | `send_event`    | `{event_id, destination?, payload?}` | subscribers reached         |
//! | `slow_response` | `[ms]` / `{ms}`                      | `"done"` after `ms` millis  |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_rpc::{CallContext, EventSchema, MethodHandler, MethodRegistry, Params, RpcError};
use serde_json::{Map, Value, json};

/// Destination `send_event` publishes to when none is given.
pub const DEFAULT_EVENT_DESTINATION: &str = "jms.topic.courier_events";

const DEFAULT_SLOW_RESPONSE_MS: u64 = 2_000;

struct Echo;

#[async_trait]
impl MethodHandler for Echo {
    async fn handle(&self, params: Option<Params>, _: &CallContext) -> Result<Value, RpcError> {
        params
            .as_ref()
            .and_then(|p| p.get(0, "text"))
            .cloned()
            .ok_or_else(|| RpcError::invalid_params("missing required parameter: text"))
    }
}

struct Ping;

#[async_trait]
impl MethodHandler for Ping {
    async fn handle(&self, _: Option<Params>, _: &CallContext) -> Result<Value, RpcError> {
        Ok(Value::Bool(true))
    }
}

struct SendEvent;

#[async_trait]
impl MethodHandler for SendEvent {
    async fn handle(&self, params: Option<Params>, ctx: &CallContext) -> Result<Value, RpcError> {
        let params = params.ok_or_else(|| RpcError::invalid_params("missing required parameter: event_id"))?;
        let event_id = params
            .get(0, "event_id")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params("event_id must be a string"))?;
        let destination = params
            .get(1, "destination")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_EVENT_DESTINATION);
        let payload = match params.get(2, "payload") {
            Some(Value::Object(map)) => map.clone(),
            Some(_) => return Err(RpcError::invalid_params("payload must be an object")),
            None => Map::new(),
        };

        let reached = ctx.publisher.publish(destination, event_id, payload)?;
        tracing::debug!(destination, event_id, reached, "demo event sent");
        Ok(json!(reached))
    }
}

struct SlowResponse;

#[async_trait]
impl MethodHandler for SlowResponse {
    async fn handle(&self, params: Option<Params>, _: &CallContext) -> Result<Value, RpcError> {
        let ms = match params.as_ref().and_then(|p| p.get(0, "ms")) {
            Some(value) => value
                .as_u64()
                .ok_or_else(|| RpcError::invalid_params("ms must be a non-negative integer"))?,
            None => DEFAULT_SLOW_RESPONSE_MS,
        };
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(json!("done"))
    }
}

/// Event ids are dotted names such as `vm.status`.
struct DottedEventIds;

impl EventSchema for DottedEventIds {
    fn verify_event_params(&self, event_id: &str, _: &Map<String, Value>) -> Result<(), RpcError> {
        let valid = event_id
            .split('.')
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
        if valid {
            Ok(())
        } else {
            Err(RpcError::invalid_params(format!("invalid event id: {event_id:?}")))
        }
    }
}

/// Registry with every demo method and the event-id schema.
pub fn registry() -> MethodRegistry {
    let mut registry = MethodRegistry::new();
    registry.register("echo", Echo);
    registry.register("ping", Ping);
    registry.register("send_event", SendEvent);
    registry.register("slow_response", SlowResponse);
    registry.set_event_schema(Arc::new(DottedEventIds));
    registry
}

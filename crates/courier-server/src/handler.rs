//! Frame routing for established connections and the RPC request path.
//!
//! Frame handling itself never waits on a method body: RPC bodies are
//! spawned onto the request tracker and run through the dispatcher, so the
//! reader loop goes straight back to the socket.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use courier_core::constants::JSON_CONTENT_TYPE;
use courier_core::ids::{ConnectionId, MessageId};
use courier_rpc::codec::{self, Members, Message};
use courier_rpc::{CallContext, Id, JsonRpcRequest, JsonRpcResponse, RpcError};
use courier_stomp::{Command, Frame, headers};
use futures::future::join_all;
use metrics::{counter, histogram};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::connection::Connection;
use crate::context::ServerContext;
use crate::executor::DispatchTask;
use crate::metrics::{RPC_ERRORS_TOTAL, RPC_REQUEST_DURATION_SECONDS, RPC_REQUESTS_TOTAL};

/// What the reader loop does after a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Control {
    /// Keep reading.
    Continue,
    /// Stop reading; the connection is closing.
    Close,
}

/// Route one inbound frame.
pub(crate) fn handle_frame(ctx: &Arc<ServerContext>, conn: &Arc<Connection>, frame: Frame) -> Control {
    let control = match frame.command {
        Command::Heartbeat => return Control::Continue,
        Command::Send => handle_send(ctx, conn, &frame),
        Command::Subscribe => handle_subscribe(ctx, conn, &frame),
        Command::Unsubscribe => handle_unsubscribe(ctx, conn, &frame),
        Command::Disconnect => {
            debug!(conn_id = %conn.id, "client disconnecting");
            acknowledge(conn, &frame);
            conn.close();
            return Control::Close;
        }
        Command::Connect => Err("already connected".to_owned()),
        other => Err(format!("unexpected {other} frame from client")),
    };

    match control {
        Ok(()) => {
            acknowledge(conn, &frame);
            Control::Continue
        }
        Err(reason) => {
            protocol_error(conn, &reason);
            Control::Close
        }
    }
}

/// Report a protocol violation and close the connection.
pub(crate) fn protocol_error(conn: &Connection, reason: &str) {
    warn!(conn_id = %conn.id, reason, "protocol error, closing connection");
    let _ = conn.send(Frame::error(reason));
    conn.close();
}

fn acknowledge(conn: &Connection, frame: &Frame) {
    if let Some(receipt) = frame.receipt() {
        let _ = conn.send(Frame::receipt_for(receipt));
    }
}

fn handle_send(ctx: &Arc<ServerContext>, conn: &Arc<Connection>, frame: &Frame) -> Result<(), String> {
    let destination = frame
        .destination()
        .ok_or_else(|| "SEND frame requires a destination header".to_owned())?;

    if destination == ctx.config.request_destination {
        let reply_to = frame
            .headers
            .get(headers::REPLY_TO)
            .unwrap_or(&ctx.config.response_destination)
            .to_owned();
        spawn_request(ctx, conn, frame.body.clone().unwrap_or_default(), reply_to);
    } else {
        let body = frame.body.clone().unwrap_or_default();
        let content_type = frame.headers.get(headers::CONTENT_TYPE);
        let delivered = ctx.subscriptions.publish(destination, &body, content_type);
        debug!(conn_id = %conn.id, destination, delivered, "forwarded message");
    }
    Ok(())
}

fn handle_subscribe(ctx: &Arc<ServerContext>, conn: &Arc<Connection>, frame: &Frame) -> Result<(), String> {
    let destination = frame
        .destination()
        .ok_or_else(|| "SUBSCRIBE frame requires a destination header".to_owned())?;
    let id = frame
        .headers
        .get(headers::ID)
        .ok_or_else(|| "SUBSCRIBE frame requires an id header".to_owned())?;
    let _ = ctx.subscriptions.subscribe(destination, conn, id);
    Ok(())
}

fn handle_unsubscribe(ctx: &Arc<ServerContext>, conn: &Arc<Connection>, frame: &Frame) -> Result<(), String> {
    let id = frame
        .headers
        .get(headers::ID)
        .ok_or_else(|| "UNSUBSCRIBE frame requires an id header".to_owned())?;
    if ctx.subscriptions.unsubscribe(&conn.id, id).is_none() {
        debug!(conn_id = %conn.id, subscription_id = id, "unsubscribe for unknown subscription");
    }
    Ok(())
}

fn spawn_request(ctx: &Arc<ServerContext>, conn: &Arc<Connection>, body: Bytes, reply_to: String) {
    let task_ctx = Arc::clone(ctx);
    let conn = Arc::clone(conn);
    let _ = ctx.requests.spawn(async move {
        let Some(reply) = process_body(&task_ctx, Some(conn.id.clone()), &body).await else {
            return;
        };
        let frame = Frame::new(Command::Message)
            .header(headers::DESTINATION, reply_to.as_str())
            .header(headers::MESSAGE_ID, MessageId::new().into_inner())
            .header(headers::CONTENT_TYPE, JSON_CONTENT_TYPE)
            .with_body(reply);
        if !conn.deliver(frame).await {
            warn!(conn_id = %conn.id, destination = %reply_to, "connection closed before response could be sent");
        }
    });
}

/// Decode a request body, run every call in it, and encode the reply.
///
/// Batch members are handled independently: a malformed member gets an
/// InvalidRequest entry at its position while the others still run.
///
/// Returns `None` when nothing must be sent back: a lone notification, a
/// batch of notifications, or a stray response.
pub(crate) async fn process_body(
    ctx: &ServerContext,
    connection_id: Option<ConnectionId>,
    body: &[u8],
) -> Option<Bytes> {
    let members = match codec::decode_members(body) {
        Ok(members) => members,
        Err(err) => {
            warn!(error = %err, "rejecting undecodable request body");
            return encode(codec::encode_response(&err.to_response()));
        }
    };

    match members {
        Members::Single(Message::Request(request)) => {
            let response = process_request(ctx, connection_id, request).await?;
            encode(codec::encode_response(&response))
        }
        Members::Single(Message::Response(response)) => {
            debug!(id = ?response.id, "ignoring response sent to the request destination");
            None
        }
        Members::Batch(members) => {
            let calls = members.into_iter().map(|member| {
                let connection_id = connection_id.clone();
                async move {
                    match member {
                        Ok(Message::Request(request)) => process_request(ctx, connection_id, request).await,
                        Ok(Message::Response(_)) => None,
                        Err(err) => {
                            warn!(error = %err, "rejecting malformed batch member");
                            Some(err.to_response())
                        }
                    }
                }
            });
            let responses = join_all(calls).await.into_iter().flatten().collect();
            encode(codec::encode_batch_responses(responses).map(|body| body.unwrap_or_default()))
        }
    }
}

fn encode(result: Result<Vec<u8>, serde_json::Error>) -> Option<Bytes> {
    match result {
        Ok(body) if body.is_empty() => None,
        Ok(body) => Some(Bytes::from(body)),
        Err(e) => {
            error!(error = %e, "failed to encode response");
            None
        }
    }
}

/// Run one call through the dispatcher. Notifications run too but yield no
/// response.
async fn process_request(
    ctx: &ServerContext,
    connection_id: Option<ConnectionId>,
    request: JsonRpcRequest,
) -> Option<JsonRpcResponse> {
    let JsonRpcRequest { method, params, id, .. } = request;
    counter!(RPC_REQUESTS_TOTAL, "method" => method.clone()).increment(1);
    debug!(method = %method, id = ?id, "dispatching request");

    let bridge = Arc::clone(&ctx.bridge);
    let call_ctx = CallContext::new(connection_id, ctx.event_publisher());
    let name = method.clone();
    let task = DispatchTask::new(method.clone(), async move {
        let handler = bridge.dispatch(&name)?;
        handler.handle(params, &call_ctx).await
    });

    let started = Instant::now();
    let result = match ctx.dispatcher.dispatch(task, ctx.config.executor.task_timeout()) {
        Ok(handle) => handle.outcome().await.into_result(),
        Err(rejected) => Err(rejected.to_rpc_error()),
    };
    histogram!(RPC_REQUEST_DURATION_SECONDS, "method" => method.clone())
        .record(started.elapsed().as_secs_f64());

    if let Err(err) = &result {
        counter!(RPC_ERRORS_TOTAL, "method" => method.clone(), "code" => err.code().to_string())
            .increment(1);
        debug!(method = %method, id = ?id, error = %err, "request failed");
    }

    let id = id?;
    Some(into_response(id, result))
}

fn into_response(id: Id, result: Result<Value, RpcError>) -> JsonRpcResponse {
    match result {
        Ok(Value::Null) => JsonRpcResponse::success(Some(id), Value::Bool(true)),
        Ok(value) => JsonRpcResponse::success(Some(id), value),
        Err(err) => JsonRpcResponse::error(Some(id), err.to_error_body()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::connection::{Outbound, test_connection};
    use crate::executor::{Executor, ExecutorError, MockTaskDispatcher};
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use courier_rpc::{MethodHandler, MethodRegistry, Params, errors};
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Echo;

    #[async_trait]
    impl MethodHandler for Echo {
        async fn handle(&self, params: Option<Params>, _: &CallContext) -> Result<Value, RpcError> {
            Ok(params.and_then(|p| p.get(0, "text").cloned()).unwrap_or(Value::Null))
        }
    }

    fn context_with(dispatcher: Arc<dyn crate::executor::TaskDispatcher>) -> Arc<ServerContext> {
        let mut registry = MethodRegistry::new();
        registry.register("echo", Echo);
        Arc::new(ServerContext::new(ServerConfig::default(), Arc::new(registry), dispatcher))
    }

    fn context() -> Arc<ServerContext> {
        context_with(Arc::new(Executor::new(crate::config::ExecutorConfig::default())))
    }

    async fn reply(ctx: &ServerContext, body: &str) -> Option<Value> {
        process_body(ctx, None, body.as_bytes())
            .await
            .map(|b| serde_json::from_slice(&b).unwrap())
    }

    fn next_frame(rx: &mut mpsc::Receiver<Outbound>) -> Frame {
        match rx.try_recv() {
            Ok(Outbound::Frame(frame)) => frame,
            other => panic!("expected a frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn echo_returns_argument() {
        let ctx = context();
        let v = reply(&ctx, r#"{"jsonrpc":"2.0","method":"echo","params":["hello"],"id":"X"}"#)
            .await
            .unwrap();
        assert_eq!(v, json!({"jsonrpc": "2.0", "result": "hello", "id": "X"}));
    }

    #[tokio::test]
    async fn null_result_reported_as_true() {
        let ctx = context();
        let v = reply(&ctx, r#"{"jsonrpc":"2.0","method":"echo","id":1}"#).await.unwrap();
        assert_eq!(v["result"], json!(true));
    }

    #[tokio::test]
    async fn unknown_method() {
        let ctx = context();
        let v = reply(&ctx, r#"{"jsonrpc":"2.0","method":"nope","id":"Y"}"#).await.unwrap();
        assert_eq!(v["error"]["code"], json!(errors::METHOD_NOT_FOUND));
        assert_eq!(v["id"], json!("Y"));
    }

    #[tokio::test]
    async fn notification_yields_nothing() {
        let ctx = context();
        assert!(reply(&ctx, r#"{"jsonrpc":"2.0","method":"echo","params":["x"]}"#).await.is_none());
    }

    #[tokio::test]
    async fn parse_error_has_null_id() {
        let ctx = context();
        let v = reply(&ctx, "{oops").await.unwrap();
        assert_eq!(v["error"]["code"], json!(errors::PARSE_ERROR));
        assert_eq!(v["id"], Value::Null);
    }

    #[tokio::test]
    async fn batch_preserves_order_and_skips_notifications() {
        let ctx = context();
        let v = reply(
            &ctx,
            r#"[
                {"jsonrpc":"2.0","method":"echo","params":["a"],"id":1},
                {"jsonrpc":"2.0","method":"echo","params":["n"]},
                {"jsonrpc":"2.0","method":"nope","id":2},
                {"jsonrpc":"2.0","method":"echo","params":["c"],"id":3}
            ]"#,
        )
        .await
        .unwrap();
        let items = v.as_array().unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0]["result"], json!("a"));
        assert_eq!(items[1]["error"]["code"], json!(errors::METHOD_NOT_FOUND));
        assert_eq!(items[2]["id"], json!(3));
    }

    #[tokio::test]
    async fn malformed_batch_member_does_not_stop_the_rest() {
        let ctx = context();
        let v = reply(
            &ctx,
            r#"[
                {"jsonrpc":"2.0","method":"echo","params":["a"],"id":1},
                7,
                {"jsonrpc":"1.0","method":"echo","params":["b"],"id":2},
                {"jsonrpc":"2.0","method":"echo","params":["c"],"id":3}
            ]"#,
        )
        .await
        .unwrap();
        let items = v.as_array().unwrap();
        assert_eq!(items.len(), 4);
        assert_eq!(items[0], json!({"jsonrpc": "2.0", "result": "a", "id": 1}));
        assert_eq!(items[1]["error"]["code"], json!(errors::INVALID_REQUEST));
        assert_eq!(items[1]["id"], Value::Null);
        assert_eq!(items[2]["error"]["code"], json!(errors::INVALID_REQUEST));
        assert_eq!(items[2]["id"], json!(2));
        assert_eq!(items[3], json!({"jsonrpc": "2.0", "result": "c", "id": 3}));
    }

    #[tokio::test]
    async fn batch_of_notifications_yields_nothing() {
        let ctx = context();
        assert!(reply(&ctx, r#"[{"jsonrpc":"2.0","method":"echo"}]"#).await.is_none());
    }

    #[tokio::test]
    async fn rejected_dispatch_is_internal_error() {
        let mut dispatcher = MockTaskDispatcher::new();
        let _ = dispatcher
            .expect_dispatch()
            .returning(|_, _| Err(ExecutorError::ResourceExhausted { capacity: 0 }));
        let ctx = context_with(Arc::new(dispatcher));

        let v = reply(&ctx, r#"{"jsonrpc":"2.0","method":"echo","params":["x"],"id":5}"#)
            .await
            .unwrap();
        assert_eq!(v["error"]["code"], json!(errors::INTERNAL_ERROR));
        assert_eq!(v["error"]["data"]["reason"], json!("resource_exhausted"));
    }

    #[tokio::test]
    async fn subscribe_with_receipt() {
        let ctx = context();
        let (conn, mut rx) = test_connection(8);
        let frame = Frame::new(Command::Subscribe)
            .header(headers::DESTINATION, "events")
            .header(headers::ID, "s1")
            .header(headers::RECEIPT, "r-1");

        assert_eq!(handle_frame(&ctx, &conn, frame), Control::Continue);
        assert_eq!(ctx.subscriptions.subscriber_count("events"), 1);
        let receipt = next_frame(&mut rx);
        assert_eq!(receipt.command, Command::Receipt);
        assert_eq!(receipt.headers.get(headers::RECEIPT_ID), Some("r-1"));
    }

    #[tokio::test]
    async fn send_to_other_destination_is_forwarded() {
        let ctx = context();
        let (publisher, _rx_pub) = test_connection(8);
        let (subscriber, mut rx_sub) = test_connection(8);
        assert!(ctx.subscriptions.subscribe("chat", &subscriber, "s"));

        let frame = Frame::new(Command::Send)
            .header(headers::DESTINATION, "chat")
            .header(headers::CONTENT_TYPE, "text/plain")
            .with_body(&b"hi"[..]);
        assert_eq!(handle_frame(&ctx, &publisher, frame), Control::Continue);

        let delivered = next_frame(&mut rx_sub);
        assert_eq!(delivered.body_bytes(), b"hi");
        assert_eq!(delivered.headers.get(headers::CONTENT_TYPE), Some("text/plain"));
    }

    #[tokio::test]
    async fn rpc_response_goes_to_reply_to() {
        let ctx = context();
        let (conn, mut rx) = test_connection(8);
        let frame = Frame::new(Command::Send)
            .header(headers::DESTINATION, ctx.config.request_destination.as_str())
            .header(headers::REPLY_TO, "my.replies")
            .with_body(&br#"{"jsonrpc":"2.0","method":"echo","params":["x"],"id":1}"#[..]);
        assert_eq!(handle_frame(&ctx, &conn, frame), Control::Continue);

        ctx.requests.close();
        ctx.requests.wait().await;

        let response = next_frame(&mut rx);
        assert_eq!(response.command, Command::Message);
        assert_eq!(response.destination(), Some("my.replies"));
        assert_eq!(response.headers.get(headers::CONTENT_TYPE), Some(JSON_CONTENT_TYPE));
        let v: Value = serde_json::from_slice(response.body_bytes()).unwrap();
        assert_eq!(v["result"], json!("x"));
    }

    #[tokio::test]
    async fn send_without_destination_is_protocol_error() {
        let ctx = context();
        let (conn, mut rx) = test_connection(8);
        assert_eq!(handle_frame(&ctx, &conn, Frame::new(Command::Send)), Control::Close);
        assert_eq!(next_frame(&mut rx).command, Command::Error);
        assert_matches!(rx.try_recv(), Ok(Outbound::Close));
    }

    #[tokio::test]
    async fn disconnect_acknowledges_then_closes() {
        let ctx = context();
        let (conn, mut rx) = test_connection(8);
        let frame = Frame::new(Command::Disconnect).header(headers::RECEIPT, "bye");
        assert_eq!(handle_frame(&ctx, &conn, frame), Control::Close);
        assert_eq!(next_frame(&mut rx).headers.get(headers::RECEIPT_ID), Some("bye"));
        assert_matches!(rx.try_recv(), Ok(Outbound::Close));
    }

    #[tokio::test]
    async fn second_connect_is_rejected() {
        let ctx = context();
        let (conn, mut rx) = test_connection(8);
        assert_eq!(handle_frame(&ctx, &conn, Frame::new(Command::Connect)), Control::Close);
        assert_eq!(next_frame(&mut rx).command, Command::Error);
    }
}

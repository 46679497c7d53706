//! [`RpcClient`] and the supervisor task owning its connection.
//!
//! The supervisor is the only task touching the socket. Callers hand it
//! frames through a bounded outbox and wait on per-call oneshots, so a slow
//! caller never stalls frame I/O and a call timeout only abandons the wait.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use courier_core::constants::JSON_CONTENT_TYPE;
use courier_core::ids::{CorrelationId, SubscriptionId};
use courier_rpc::codec::{self, Envelope, Message};
use courier_rpc::{Id, JsonRpcRequest, JsonRpcResponse, Params};
use courier_stomp::{Command, Frame, StompError, headers};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::ClientConfig;
use crate::connector::{Session, connect};
use crate::errors::{ClientError, Result};
use crate::pending::PendingCalls;
use crate::subscription::{Subscription, SubscriptionTable};

/// Frames buffered between callers and the supervisor.
const OUTBOX_CAPACITY: usize = 1024;

/// Connection state as seen by callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientState {
    /// A session is open.
    Connected,
    /// The session was lost and reconnect attempts are running. Calls are
    /// queued until a new session opens.
    Reconnecting,
    /// Reconnect attempts are exhausted. Every call fails with
    /// [`ClientError::Disconnected`].
    Disconnected,
    /// [`RpcClient::close`] was called.
    Closed,
}

struct Shared {
    config: ClientConfig,
    pending: PendingCalls,
    subscriptions: SubscriptionTable,
    receipts: DashMap<String, oneshot::Sender<()>>,
    state: watch::Sender<ClientState>,
    reconnect_attempts: AtomicU32,
    cancel: CancellationToken,
}

impl Shared {
    fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ClientState) {
        let _ = self.state.send_replace(state);
    }

    /// Error for a caller arriving after the connection is gone.
    fn terminal_error(&self) -> ClientError {
        match self.state() {
            ClientState::Closed => ClientError::Closed,
            _ => ClientError::Disconnected,
        }
    }

    fn handle_inbound(&self, frame: Frame) -> std::result::Result<(), String> {
        match frame.command {
            Command::Heartbeat => {}
            Command::Message => self.handle_message(&frame),
            Command::Receipt => {
                if let Some(id) = frame.headers.get(headers::RECEIPT_ID) {
                    if let Some((_, tx)) = self.receipts.remove(id) {
                        let _ = tx.send(());
                    }
                }
            }
            Command::Error => {
                let message = frame.headers.get(headers::MESSAGE).unwrap_or("unspecified");
                return Err(format!("server error: {message}"));
            }
            other => debug!(command = %other, "ignoring unexpected frame"),
        }
        Ok(())
    }

    fn handle_message(&self, frame: &Frame) {
        let body = frame.body.clone().unwrap_or_default();
        if let Some(subscription) = frame.headers.get(headers::SUBSCRIPTION) {
            let _ = self
                .subscriptions
                .deliver(&SubscriptionId::from(subscription.to_owned()), &body);
            return;
        }
        match codec::decode(&body) {
            Ok(Envelope::Single(message)) => self.complete(message),
            Ok(Envelope::Batch(messages)) => {
                for message in messages {
                    self.complete(message);
                }
            }
            Err(e) => warn!(error = %e, "undecodable response body"),
        }
    }

    fn complete(&self, message: Message) {
        match message {
            Message::Response(response) => {
                let _ = self.pending.complete(response);
            }
            Message::Request(request) => {
                debug!(method = %request.method, "ignoring request outside a subscription");
            }
        }
    }
}

/// STOMP JSON-RPC client.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct RpcClient {
    shared: Arc<Shared>,
    outbox: mpsc::Sender<Frame>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl RpcClient {
    /// Connect and start the supervisor. The first connection is not retried.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let session = connect(&config).await?;
        info!(host = %config.host, port = config.port, "connected");

        let (outbox, queued) = mpsc::channel(OUTBOX_CAPACITY);
        let (state, _) = watch::channel(ClientState::Connected);
        let shared = Arc::new(Shared {
            config,
            pending: PendingCalls::new(),
            subscriptions: SubscriptionTable::new(),
            receipts: DashMap::new(),
            state,
            reconnect_attempts: AtomicU32::new(0),
            cancel: CancellationToken::new(),
        });
        let supervisor = tokio::spawn(supervise(Arc::clone(&shared), session, queued));

        Ok(Self {
            shared,
            outbox,
            supervisor: Mutex::new(Some(supervisor)),
        })
    }

    /// Client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Current connection state.
    pub fn state(&self) -> ClientState {
        self.shared.state()
    }

    /// Wait until the client reaches `state`.
    pub async fn wait_for_state(&self, state: ClientState) {
        let mut rx = self.shared.state.subscribe();
        let _ = rx.wait_for(|current| *current == state).await;
    }

    /// Reconnect attempts made since the client was created.
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.reconnect_attempts.load(Ordering::Relaxed)
    }

    /// Calls awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.shared.pending.len()
    }

    /// Send `request` and wait up to `timeout` for its response.
    ///
    /// A request without an id is given a fresh one. On timeout the call is
    /// forgotten and a later response for it is dropped.
    #[instrument(skip_all, fields(method = %request.method))]
    pub async fn call(
        &self,
        mut request: JsonRpcRequest,
        timeout: Duration,
    ) -> Result<JsonRpcResponse> {
        let id = request.id.get_or_insert_with(Id::generate).clone();
        let body = codec::encode_request(&request)?;
        // Registered before `enqueue` reads the state: the supervisor sets the
        // final state before `fail_all`, so this entry is either failed there
        // or the state check below rejects the call.
        let rx = self.shared.pending.register(id.clone());

        let outcome = tokio::time::timeout(timeout, async {
            self.enqueue(self.request_frame(body)).await?;
            rx.await.unwrap_or_else(|_| Err(self.shared.terminal_error()))
        })
        .await;

        match outcome {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                let _ = self.shared.pending.remove(&id);
                Err(e)
            }
            Err(_) => {
                let _ = self.shared.pending.remove(&id);
                debug!(%id, ?timeout, "call timed out");
                Err(ClientError::NoResponse { timeout })
            }
        }
    }

    /// Call `method` with the configured timeout and return its result.
    ///
    /// An error response becomes [`ClientError::Rpc`].
    pub async fn call_method(&self, method: &str, params: Option<Params>) -> Result<Value> {
        let request = JsonRpcRequest::call(method, params, Id::generate());
        let response = self.call(request, self.shared.config.call_timeout()).await?;
        response.into_result().map_err(ClientError::Rpc)
    }

    /// Send `requests` as one batch and wait for every call in it.
    ///
    /// Responses are returned in request order. Notifications in the batch
    /// get no response and are skipped.
    pub async fn call_batch(
        &self,
        requests: Vec<JsonRpcRequest>,
        timeout: Duration,
    ) -> Result<Vec<JsonRpcResponse>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<Id> = requests.iter().filter_map(|r| r.id.clone()).collect();
        let envelope = Envelope::Batch(requests.into_iter().map(Message::Request).collect());
        let body = codec::encode(&envelope)?;
        let receivers: Vec<_> = ids
            .iter()
            .map(|id| self.shared.pending.register(id.clone()))
            .collect();

        let outcome = tokio::time::timeout(timeout, async {
            self.enqueue(self.request_frame(body)).await?;
            let mut responses = Vec::with_capacity(receivers.len());
            for rx in receivers {
                responses.push(rx.await.unwrap_or_else(|_| Err(self.shared.terminal_error()))?);
            }
            Ok::<_, ClientError>(responses)
        })
        .await;

        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(ClientError::NoResponse { timeout }),
        };
        if result.is_err() {
            for id in &ids {
                let _ = self.shared.pending.remove(id);
            }
        }
        result
    }

    /// Send a notification. No response is expected.
    pub async fn notify(&self, method: &str, params: Option<Params>) -> Result<()> {
        let body = codec::encode_request(&JsonRpcRequest::notification(method, params))?;
        self.enqueue(self.request_frame(body)).await
    }

    /// Publish event `event_id` to the subscribers of `destination`.
    pub async fn send_event(
        &self,
        destination: &str,
        event_id: &str,
        params: Map<String, Value>,
    ) -> Result<()> {
        let body = codec::encode_request(&JsonRpcRequest::event(event_id, params))?;
        let frame = Frame::new(Command::Send)
            .header(headers::DESTINATION, destination)
            .header(headers::CONTENT_TYPE, JSON_CONTENT_TYPE)
            .with_body(body);
        self.enqueue(frame).await
    }

    /// Subscribe to `destination`. Returns once the server confirmed it.
    pub async fn subscribe(&self, destination: &str) -> Result<Subscription> {
        let subscription = self.shared.subscriptions.insert(destination);
        let frame = subscribe_frame(subscription.id(), destination);
        if let Err(e) = self.send_with_receipt(frame).await {
            let _ = self.shared.subscriptions.remove(subscription.id());
            return Err(e);
        }
        debug!(destination, subscription = %subscription.id(), "subscribed");
        Ok(subscription)
    }

    /// Stop a subscription. Events already queued for it are discarded.
    pub async fn unsubscribe(&self, subscription: Subscription) -> Result<()> {
        let id = subscription.id().clone();
        let _ = self.shared.subscriptions.remove(&id);
        drop(subscription);
        let frame = Frame::new(Command::Unsubscribe).header(headers::ID, id.as_str());
        self.send_with_receipt(frame).await
    }

    /// Disconnect and stop the supervisor. Pending calls fail with
    /// [`ClientError::Closed`].
    pub async fn close(&self) {
        self.shared.cancel.cancel();
        let supervisor = self.supervisor.lock().take();
        if let Some(supervisor) = supervisor {
            let _ = supervisor.await;
        }
    }

    fn request_frame(&self, body: Vec<u8>) -> Frame {
        let config = &self.shared.config;
        Frame::new(Command::Send)
            .header(headers::DESTINATION, config.request_destination.as_str())
            .header(headers::REPLY_TO, config.response_destination.as_str())
            .header(headers::CONTENT_TYPE, JSON_CONTENT_TYPE)
            .with_body(body)
    }

    async fn enqueue(&self, frame: Frame) -> Result<()> {
        match self.shared.state() {
            ClientState::Connected | ClientState::Reconnecting => {}
            ClientState::Disconnected | ClientState::Closed => {
                return Err(self.shared.terminal_error());
            }
        }
        self.outbox
            .send(frame)
            .await
            .map_err(|_| self.shared.terminal_error())
    }

    async fn send_with_receipt(&self, frame: Frame) -> Result<()> {
        let receipt = CorrelationId::new().into_inner();
        let (tx, rx) = oneshot::channel();
        let _ = self.shared.receipts.insert(receipt.clone(), tx);

        let timeout = self.shared.config.call_timeout();
        let outcome = tokio::time::timeout(timeout, async {
            self.enqueue(frame.header(headers::RECEIPT, receipt.as_str())).await?;
            rx.await.map_err(|_| self.shared.terminal_error())
        })
        .await;

        let _ = self.shared.receipts.remove(&receipt);
        outcome.unwrap_or(Err(ClientError::NoResponse { timeout }))
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("host", &self.shared.config.host)
            .field("port", &self.shared.config.port)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn subscribe_frame(id: &SubscriptionId, destination: &str) -> Frame {
    Frame::new(Command::Subscribe)
        .header(headers::DESTINATION, destination)
        .header(headers::ID, id.as_str())
        .header("ack", "auto")
}

// ─────────────────────────────────────────────────────────────────────────────
// Supervisor
// ─────────────────────────────────────────────────────────────────────────────

enum SessionEnd {
    /// Closed locally.
    Closed,
    /// Lost; worth reconnecting.
    Lost(String),
}

async fn supervise(shared: Arc<Shared>, mut session: Session, mut outbox: mpsc::Receiver<Frame>) {
    loop {
        match run_session(&shared, &mut session, &mut outbox).await {
            SessionEnd::Closed => {
                shared.set_state(ClientState::Closed);
                break;
            }
            SessionEnd::Lost(reason) => {
                warn!(%reason, pending = shared.pending.len(), "connection lost");
                shared.set_state(ClientState::Reconnecting);
                match reconnect(&shared).await {
                    Some(next) => {
                        session = next;
                        shared.set_state(ClientState::Connected);
                    }
                    None if shared.cancel.is_cancelled() => {
                        shared.set_state(ClientState::Closed);
                        break;
                    }
                    None => {
                        warn!(
                            attempts = shared.reconnect_attempts.load(Ordering::Relaxed),
                            "giving up on reconnecting"
                        );
                        shared.set_state(ClientState::Disconnected);
                        break;
                    }
                }
            }
        }
    }

    // State is final before anyone is failed, so late callers see it.
    let failed = shared.pending.fail_all(|| shared.terminal_error());
    shared.receipts.clear();
    outbox.close();
    debug!(failed, state = ?shared.state(), "supervisor stopped");
}

async fn run_session(
    shared: &Shared,
    session: &mut Session,
    outbox: &mut mpsc::Receiver<Frame>,
) -> SessionEnd {
    let Session { transport, timing } = session;
    let mut heartbeat = timing.send_every.map(|every| {
        let mut interval = tokio::time::interval_at(Instant::now() + every, every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });
    let mut last_received = Instant::now();

    loop {
        let deadline = timing.receive_within.map(|within| last_received + within);
        tokio::select! {
            () = shared.cancel.cancelled() => {
                let _ = transport.send(Frame::new(Command::Disconnect)).await;
                let _ = transport.close().await;
                return SessionEnd::Closed;
            }
            () = sleep_until(deadline) => {
                return SessionEnd::Lost("no traffic from server within heart-beat interval".into());
            }
            inbound = transport.next() => match inbound {
                Some(Ok(frame)) => {
                    last_received = Instant::now();
                    if let Err(reason) = shared.handle_inbound(frame) {
                        return SessionEnd::Lost(reason);
                    }
                }
                Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                None => return SessionEnd::Lost("server closed the connection".into()),
            },
            outbound = outbox.recv() => match outbound {
                Some(frame) => {
                    if let Err(e) = transport.send(frame).await {
                        return SessionEnd::Lost(e.to_string());
                    }
                    if let Some(interval) = heartbeat.as_mut() {
                        interval.reset();
                    }
                }
                None => return SessionEnd::Closed,
            },
            () = tick(&mut heartbeat) => {
                if let Err(e) = transport.send(Frame::heartbeat()).await {
                    return SessionEnd::Lost(e.to_string());
                }
            }
        }
    }
}

async fn reconnect(shared: &Shared) -> Option<Session> {
    let retry = shared.config.retry();
    let mut attempt = 0;
    while retry.allows(attempt) {
        let delay = retry.delay_for(attempt);
        tokio::select! {
            () = shared.cancel.cancelled() => return None,
            () = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
        let _ = shared.reconnect_attempts.fetch_add(1, Ordering::Relaxed);

        match connect(&shared.config).await {
            Ok(mut session) => match restore_subscriptions(shared, &mut session).await {
                Ok(restored) => {
                    info!(attempt, restored, "reconnected");
                    return Some(session);
                }
                Err(e) => warn!(attempt, error = %e, "failed to restore subscriptions"),
            },
            Err(e) => warn!(attempt, error = %e, "reconnect attempt failed"),
        }
    }
    None
}

async fn restore_subscriptions(
    shared: &Shared,
    session: &mut Session,
) -> std::result::Result<usize, StompError> {
    let active = shared.subscriptions.active();
    for (id, destination) in &active {
        session.transport.feed(subscribe_frame(id, destination)).await?;
    }
    session.transport.flush().await?;
    Ok(active.len())
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            let _ = interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_stomp::{FramedTransport, framed};
    use serde_json::json;
    use tokio::net::TcpListener;

    async fn accept_session(listener: &TcpListener) -> FramedTransport {
        let (socket, _) = listener.accept().await.unwrap();
        let mut transport = framed(socket, 1024 * 1024);
        let connect = transport.next().await.unwrap().unwrap();
        assert_eq!(connect.command, Command::Connect);
        transport
            .send(Frame::new(Command::Connected).header(headers::VERSION, "1.2"))
            .await
            .unwrap();
        transport
    }

    async fn client_for(listener: &TcpListener) -> RpcClient {
        let port = listener.local_addr().unwrap().port();
        let config = ClientConfig {
            nr_retries: 0,
            call_timeout_ms: 2_000,
            ..ClientConfig::new("127.0.0.1", port)
        };
        RpcClient::connect(config).await.unwrap()
    }

    #[tokio::test]
    async fn call_sends_to_request_destination_with_reply_to() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (client, mut server) = tokio::join!(client_for(&listener), accept_session(&listener));

        let call = tokio::spawn(async move {
            let params = Params::Positional(vec![json!("hi")]);
            let result = client.call_method("echo", Some(params)).await;
            (client, result)
        });

        let send = server.next().await.unwrap().unwrap();
        assert_eq!(send.command, Command::Send);
        assert_eq!(send.destination(), Some("jms.topic.vdsm_requests"));
        assert_eq!(send.headers.get(headers::REPLY_TO), Some("jms.topic.vdsm_responses"));
        let request: JsonRpcRequest = serde_json::from_slice(send.body_bytes()).unwrap();
        assert_eq!(request.method, "echo");

        let response = JsonRpcResponse::success(request.id, json!("hi"));
        server
            .send(
                Frame::new(Command::Message)
                    .header(headers::DESTINATION, "jms.topic.vdsm_responses")
                    .with_body(codec::encode_response(&response).unwrap()),
            )
            .await
            .unwrap();

        let (client, result) = call.await.unwrap();
        assert_eq!(result.unwrap(), json!("hi"));
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn unanswered_call_times_out_and_is_forgotten() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (client, _server) = tokio::join!(client_for(&listener), accept_session(&listener));

        let request = JsonRpcRequest::call("slow", None, 1_i64);
        let err = client.call(request, Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, ClientError::NoResponse { .. }));
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn close_fails_pending_calls_with_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (client, mut server) = tokio::join!(client_for(&listener), accept_session(&listener));
        let client = Arc::new(client);

        let caller = Arc::clone(&client);
        let call = tokio::spawn(async move {
            caller
                .call(JsonRpcRequest::call("slow", None, 1_i64), Duration::from_secs(5))
                .await
        });
        let _ = server.next().await.unwrap().unwrap();

        client.close().await;
        assert_eq!(client.state(), ClientState::Closed);
        assert!(matches!(call.await.unwrap(), Err(ClientError::Closed)));

        let disconnect = server.next().await.unwrap().unwrap();
        assert_eq!(disconnect.command, Command::Disconnect);
        assert!(matches!(client.notify("x", None).await, Err(ClientError::Closed)));
    }

    #[tokio::test]
    async fn error_frame_drops_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (client, mut server) = tokio::join!(client_for(&listener), accept_session(&listener));
        server.send(Frame::error("boom")).await.unwrap();

        client.wait_for_state(ClientState::Disconnected).await;
        assert_eq!(client.reconnect_attempts(), 0);
        assert!(matches!(client.call_method("echo", None).await, Err(ClientError::Disconnected)));
    }
}

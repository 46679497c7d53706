//! Connection lifecycle: handshake, frame loop, liveness, cleanup.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use courier_core::constants::STOMP_VERSION;
use courier_stomp::{
    Command, Frame, FramedTransport, HeartBeat, StompError, Transport, framed, headers,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::connection::{Connection, ConnectionState, Outbound};
use crate::context::ServerContext;
use crate::handler::{Control, handle_frame, protocol_error};
use crate::heartbeat::run_heartbeat_sender;
use crate::metrics::{
    CONNECTION_DURATION_SECONDS, CONNECTIONS_ACTIVE, CONNECTIONS_TOTAL, DISCONNECTIONS_TOTAL,
    FRAMES_RECEIVED_TOTAL,
};

/// How long the writer gets to flush queued frames once the reader stops.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Why the frame loop ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CloseReason {
    Disconnect,
    PeerClosed,
    HeartbeatTimeout,
    ProtocolError,
    TransportError,
    Shutdown,
}

impl CloseReason {
    fn as_str(self) -> &'static str {
        match self {
            Self::Disconnect => "disconnect",
            Self::PeerClosed => "peer_closed",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::ProtocolError => "protocol_error",
            Self::TransportError => "transport_error",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Serve one accepted transport until it closes.
///
/// 1. Waits (bounded by the handshake timeout) for CONNECT and answers CONNECTED
/// 2. Spawns the writer and, if negotiated, the heart-beat sender
/// 3. Reads frames until DISCONNECT, error, heart-beat timeout or shutdown
/// 4. Releases subscriptions and flushes the writer
#[instrument(skip_all, fields(peer = %peer))]
pub(crate) async fn run_session(ctx: Arc<ServerContext>, transport: Transport, peer: SocketAddr) {
    let mut framed = framed(transport, ctx.config.max_frame_size);

    let negotiated = match tokio::time::timeout(ctx.config.handshake_timeout(), handshake(&mut framed)).await {
        Ok(Ok(heartbeat)) => heartbeat,
        Ok(Err(reason)) => {
            reject(&mut framed, &reason).await;
            return;
        }
        Err(_) => {
            reject(&mut framed, "handshake timed out").await;
            return;
        }
    };

    let (tx, rx) = mpsc::channel(ctx.config.send_queue_size);
    let conn = Arc::new(Connection::new(peer, tx, ctx.shutdown.child_token()));
    conn.set_state(ConnectionState::Connected);
    let _ = ctx.connections.insert(conn.id.clone(), Arc::clone(&conn));

    info!(conn_id = %conn.id, heart_beat = %negotiated, "client connected");
    counter!(CONNECTIONS_TOTAL).increment(1);
    gauge!(CONNECTIONS_ACTIVE).increment(1.0);

    let (sink, stream) = framed.split();
    let writer = tokio::spawn(run_writer(Arc::clone(&conn), sink, rx));
    let heartbeat = negotiated
        .send_interval()
        .map(|interval| tokio::spawn(run_heartbeat_sender(Arc::clone(&conn), interval)));

    let reason = read_loop(&ctx, &conn, stream, negotiated.receive_interval()).await;

    // Cleanup
    info!(conn_id = %conn.id, reason = reason.as_str(), "client disconnected");
    let removed = ctx.subscriptions.remove_connection(&conn.id);
    let _ = ctx.connections.remove(&conn.id);
    conn.close();
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        warn!(conn_id = %conn.id, "writer did not drain in time");
    }
    conn.abort();
    if let Some(heartbeat) = heartbeat {
        let _ = heartbeat.await;
    }
    conn.set_state(ConnectionState::Closed);

    debug!(conn_id = %conn.id, subscriptions = removed, dropped = conn.drop_count(), "session released");
    counter!(DISCONNECTIONS_TOTAL, "reason" => reason.as_str()).increment(1);
    gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(CONNECTION_DURATION_SECONDS).record(conn.age().as_secs_f64());
}

/// Wait for CONNECT and answer CONNECTED. Returns the heart-beat pair from
/// the server's point of view: `cx` is how often it sends, `cy` how long it
/// tolerates silence.
async fn handshake(framed: &mut FramedTransport) -> Result<HeartBeat, String> {
    let connect = loop {
        match framed.next().await {
            Some(Ok(frame)) if frame.is_heartbeat() => {}
            Some(Ok(frame)) if frame.command == Command::Connect => break frame,
            Some(Ok(frame)) => return Err(format!("expected CONNECT, got {}", frame.command)),
            Some(Err(e)) => return Err(e.to_string()),
            None => return Err("connection closed before CONNECT".to_owned()),
        }
    };

    if let Some(versions) = connect.headers.get(headers::ACCEPT_VERSION) {
        if !versions.split(',').any(|v| v.trim() == STOMP_VERSION) {
            return Err(format!("unsupported protocol version(s) {versions}"));
        }
    }

    let requested = match connect.headers.get(headers::HEART_BEAT) {
        Some(raw) => raw.parse::<HeartBeat>().map_err(|e| e.to_string())?,
        None => HeartBeat::default(),
    };
    let reply = requested.server_reply();

    let connected = Frame::new(Command::Connected)
        .header(headers::VERSION, STOMP_VERSION)
        .header(headers::HEART_BEAT, reply.to_string());
    framed.send(connected).await.map_err(|e| e.to_string())?;

    if let Some(receipt) = connect.receipt() {
        framed
            .send(Frame::receipt_for(receipt))
            .await
            .map_err(|e| e.to_string())?;
    }
    Ok(reply)
}

async fn reject(framed: &mut FramedTransport, reason: &str) {
    warn!(reason, "rejecting connection during handshake");
    counter!(DISCONNECTIONS_TOTAL, "reason" => "handshake").increment(1);
    let _ = framed.send(Frame::error(reason)).await;
    let _ = framed.close().await;
}

async fn read_loop(
    ctx: &Arc<ServerContext>,
    conn: &Arc<Connection>,
    mut stream: SplitStream<FramedTransport>,
    deadline: Option<Duration>,
) -> CloseReason {
    let cancel = conn.cancel_token().clone();
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => return CloseReason::Shutdown,
            next = next_frame(&mut stream, deadline) => next,
        };

        match next {
            Ok(Some(Ok(frame))) => {
                conn.mark_received();
                counter!(FRAMES_RECEIVED_TOTAL, "command" => frame.command.as_str()).increment(1);
                let is_disconnect = frame.command == Command::Disconnect;
                if handle_frame(ctx, conn, frame) == Control::Close {
                    return if is_disconnect {
                        CloseReason::Disconnect
                    } else {
                        CloseReason::ProtocolError
                    };
                }
            }
            Ok(Some(Err(e))) => return frame_error(conn, &e),
            Ok(None) => return CloseReason::PeerClosed,
            Err(_) => {
                warn!(conn_id = %conn.id, ?deadline, "no traffic from client within heart-beat window");
                return CloseReason::HeartbeatTimeout;
            }
        }
    }
}

async fn next_frame(
    stream: &mut SplitStream<FramedTransport>,
    deadline: Option<Duration>,
) -> Result<Option<Result<Frame, StompError>>, tokio::time::error::Elapsed> {
    match deadline {
        Some(deadline) => tokio::time::timeout(deadline, stream.next()).await,
        None => Ok(stream.next().await),
    }
}

fn frame_error(conn: &Connection, error: &StompError) -> CloseReason {
    if error.is_protocol_violation() {
        protocol_error(conn, &error.to_string());
        CloseReason::ProtocolError
    } else {
        debug!(conn_id = %conn.id, error = %error, "transport error");
        CloseReason::TransportError
    }
}

async fn run_writer(
    conn: Arc<Connection>,
    mut sink: SplitSink<FramedTransport, Frame>,
    mut rx: mpsc::Receiver<Outbound>,
) {
    let cancel = conn.cancel_token().clone();
    loop {
        let item = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            item = rx.recv() => item,
        };
        match item {
            Some(Outbound::Frame(frame)) => {
                if let Err(e) = sink.send(frame).await {
                    debug!(conn_id = %conn.id, error = %e, "write failed");
                    break;
                }
                conn.mark_sent();
            }
            Some(Outbound::Close) | None => break,
        }
    }
    let _ = sink.close().await;
    cancel.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecutorConfig, ServerConfig};
    use crate::executor::Executor;
    use assert_matches::assert_matches;
    use courier_rpc::MethodRegistry;
    use tokio::io::DuplexStream;

    fn context(config: ServerConfig) -> Arc<ServerContext> {
        let executor = Arc::new(Executor::new(ExecutorConfig::default()));
        Arc::new(ServerContext::new(config, Arc::new(MethodRegistry::new()), executor))
    }

    fn start(ctx: &Arc<ServerContext>) -> (FramedTransport, tokio::task::JoinHandle<()>) {
        let (client, server): (DuplexStream, DuplexStream) = tokio::io::duplex(4096);
        let peer = SocketAddr::from(([127, 0, 0, 1], 50000));
        let task = tokio::spawn(run_session(Arc::clone(ctx), Box::new(server), peer));
        (framed(client, 1 << 20), task)
    }

    async fn recv(client: &mut FramedTransport) -> Frame {
        loop {
            let frame = client.next().await.unwrap().unwrap();
            if !frame.is_heartbeat() {
                return frame;
            }
        }
    }

    #[tokio::test]
    async fn connect_negotiates_heartbeat() {
        let ctx = context(ServerConfig::default());
        let (mut client, task) = start(&ctx);

        client
            .send(
                Frame::new(Command::Connect)
                    .header(headers::ACCEPT_VERSION, "1.2")
                    .header(headers::HEART_BEAT, "12000,24000"),
            )
            .await
            .unwrap();
        let connected = recv(&mut client).await;
        assert_eq!(connected.command, Command::Connected);
        assert_eq!(connected.headers.get(headers::VERSION), Some("1.2"));
        assert_eq!(connected.headers.get(headers::HEART_BEAT), Some("24000,12000"));

        client
            .send(Frame::new(Command::Disconnect).header(headers::RECEIPT, "r"))
            .await
            .unwrap();
        let receipt = recv(&mut client).await;
        assert_eq!(receipt.headers.get(headers::RECEIPT_ID), Some("r"));
        task.await.unwrap();
        assert!(ctx.connections.is_empty());
    }

    #[tokio::test]
    async fn non_connect_first_frame_is_rejected() {
        let ctx = context(ServerConfig::default());
        let (mut client, task) = start(&ctx);

        client
            .send(Frame::new(Command::Send).header(headers::DESTINATION, "x"))
            .await
            .unwrap();
        let error = recv(&mut client).await;
        assert_eq!(error.command, Command::Error);
        assert!(error.headers.get(headers::MESSAGE).unwrap().contains("expected CONNECT"));
        task.await.unwrap();
    }

    #[tokio::test]
    async fn unsupported_version_is_rejected() {
        let ctx = context(ServerConfig::default());
        let (mut client, task) = start(&ctx);

        client
            .send(Frame::new(Command::Connect).header(headers::ACCEPT_VERSION, "1.0,1.1"))
            .await
            .unwrap();
        assert_eq!(recv(&mut client).await.command, Command::Error);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_times_out() {
        let ctx = context(ServerConfig {
            handshake_timeout_ms: 100,
            ..ServerConfig::default()
        });
        let (mut client, task) = start(&ctx);

        let error = recv(&mut client).await;
        assert_eq!(error.command, Command::Error);
        assert_eq!(error.headers.get(headers::MESSAGE), Some("handshake timed out"));
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn silent_client_times_out() {
        let ctx = context(ServerConfig::default());
        let (mut client, task) = start(&ctx);

        client
            .send(Frame::new(Command::Connect).header(headers::HEART_BEAT, "1000,0"))
            .await
            .unwrap();
        assert_eq!(recv(&mut client).await.command, Command::Connected);

        tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .expect("session should end after the heart-beat window")
            .unwrap();
        assert!(ctx.connections.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn server_sends_heartbeats_when_asked() {
        let ctx = context(ServerConfig::default());
        let (mut client, _task) = start(&ctx);

        client
            .send(Frame::new(Command::Connect).header(headers::HEART_BEAT, "0,1000"))
            .await
            .unwrap();
        let connected = client.next().await.unwrap().unwrap();
        assert_eq!(connected.command, Command::Connected);

        let beat = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(beat.is_heartbeat());
    }

    #[tokio::test]
    async fn malformed_frame_closes_with_error() {
        use tokio::io::AsyncWriteExt;

        let ctx = context(ServerConfig::default());
        let (client, server) = tokio::io::duplex(4096);
        let peer = SocketAddr::from(([127, 0, 0, 1], 50001));
        let task = tokio::spawn(run_session(Arc::clone(&ctx), Box::new(server), peer));

        let mut client = framed(client, 1 << 20);
        client.send(Frame::new(Command::Connect)).await.unwrap();
        assert_eq!(recv(&mut client).await.command, Command::Connected);

        client.get_mut().write_all(b"BOGUS\n\n\0").await.unwrap();
        let error = recv(&mut client).await;
        assert_eq!(error.command, Command::Error);
        task.await.unwrap();
        assert_matches!(client.next().await, None);
    }
}

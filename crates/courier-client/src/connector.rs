//! Opening a STOMP session: TCP, optional TLS, CONNECT/CONNECTED.

use std::time::Duration;

use courier_core::constants::STOMP_VERSION;
use courier_stomp::{Command, Frame, FramedTransport, HeartBeat, Transport, framed, headers};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tracing::{debug, instrument};

use crate::config::ClientConfig;
use crate::errors::{ClientError, Result};

/// An open session and its negotiated heart-beat timing.
pub(crate) struct Session {
    pub transport: FramedTransport,
    pub timing: Timing,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("timing", &self.timing)
            .finish_non_exhaustive()
    }
}

/// Heart-beat timing of one session, from the client's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Timing {
    /// How often to emit a heart-beat when idle.
    pub send_every: Option<Duration>,
    /// Silence from the server after which the connection is lost.
    pub receive_within: Option<Duration>,
}

impl Timing {
    /// Combine what the client wants with what the server answered.
    ///
    /// A direction is active only when both sides enable it. The client sends
    /// at its configured rate, which is within what it promised, and
    /// tolerates silence up to its configured incoming interval, which is
    /// longer than what it asked the server for.
    pub fn negotiate(config: &ClientConfig, server: HeartBeat) -> Self {
        let send_every = (config.outgoing_heartbeat_ms > 0 && server.cy > 0)
            .then(|| Duration::from_millis(config.outgoing_heartbeat_ms));
        let receive_within = (config.incoming_heartbeat_ms > 0 && server.cx > 0)
            .then(|| Duration::from_millis(config.incoming_heartbeat_ms.max(server.cx)));
        Self {
            send_every,
            receive_within,
        }
    }
}

/// Open a session to the configured server within the connect timeout.
#[instrument(skip_all, fields(host = %config.host, port = config.port, secure = config.secure))]
pub(crate) async fn connect(config: &ClientConfig) -> Result<Session> {
    let deadline = config.connect_timeout();
    tokio::time::timeout(deadline, open(config))
        .await
        .map_err(|_| ClientError::Handshake(format!("no CONNECTED within {deadline:?}")))?
}

async fn open(config: &ClientConfig) -> Result<Session> {
    let tcp = TcpStream::connect((config.host.as_str(), config.port)).await?;
    tcp.set_nodelay(true)?;

    let stream: Transport = if config.secure {
        let tls = config.tls.as_ref().ok_or_else(|| {
            ClientError::Tls("secure connection requested without TLS settings".into())
        })?;
        let stream = tls
            .connector()
            .connect(tls.server_name(), tcp)
            .await
            .map_err(|e| ClientError::Tls(e.to_string()))?;
        Box::new(stream)
    } else {
        Box::new(tcp)
    };

    let mut transport = framed(stream, config.max_frame_size);
    let advertised = config.advertised_heartbeat();
    transport
        .send(
            Frame::new(Command::Connect)
                .header(headers::ACCEPT_VERSION, STOMP_VERSION)
                .header(headers::HOST, config.host.as_str())
                .header(headers::HEART_BEAT, advertised.to_string()),
        )
        .await?;

    let server = await_connected(&mut transport).await?;
    let timing = Timing::negotiate(config, server);
    debug!(%advertised, %server, ?timing, "session established");
    Ok(Session { transport, timing })
}

async fn await_connected(transport: &mut FramedTransport) -> Result<HeartBeat> {
    loop {
        let frame = match transport.next().await {
            Some(frame) => frame?,
            None => {
                return Err(ClientError::Handshake(
                    "connection closed before CONNECTED".into(),
                ));
            }
        };
        match frame.command {
            Command::Heartbeat => {}
            Command::Connected => {
                return match frame.headers.get(headers::HEART_BEAT) {
                    Some(value) => Ok(value.parse()?),
                    None => Ok(HeartBeat::default()),
                };
            }
            Command::Error => {
                let message = frame.headers.get(headers::MESSAGE).unwrap_or("connection refused");
                return Err(ClientError::Broker(message.to_owned()));
            }
            other => {
                return Err(ClientError::Handshake(format!("expected CONNECTED, got {other}")));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tokio::net::TcpListener;

    fn config(port: u16) -> ClientConfig {
        ClientConfig {
            outgoing_heartbeat_ms: 10_000,
            incoming_heartbeat_ms: 30_000,
            connect_timeout_ms: 2_000,
            ..ClientConfig::new("127.0.0.1", port)
        }
    }

    /// Accept one connection, read CONNECT, answer with `reply`.
    async fn fake_server(reply: Frame) -> (u16, tokio::task::JoinHandle<Frame>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let task = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut transport = framed(socket, 1024 * 1024);
            let connect = transport.next().await.unwrap().unwrap();
            transport.send(reply).await.unwrap();
            connect
        });
        (port, task)
    }

    #[test]
    fn negotiate_requires_both_sides() {
        let cfg = config(1);
        let timing = Timing::negotiate(&cfg, HeartBeat::new(24_000, 12_000));
        assert_eq!(timing.send_every, Some(Duration::from_millis(10_000)));
        assert_eq!(timing.receive_within, Some(Duration::from_millis(30_000)));

        let silent = Timing::negotiate(&cfg, HeartBeat::new(0, 0));
        assert_eq!(silent.send_every, None);
        assert_eq!(silent.receive_within, None);
    }

    #[test]
    fn negotiate_disabled_locally() {
        let cfg = ClientConfig {
            outgoing_heartbeat_ms: 0,
            incoming_heartbeat_ms: 0,
            ..ClientConfig::default()
        };
        let timing = Timing::negotiate(&cfg, HeartBeat::new(5_000, 5_000));
        assert_eq!(timing.send_every, None);
        assert_eq!(timing.receive_within, None);
    }

    #[tokio::test]
    async fn connect_advertises_version_and_heartbeat() {
        let reply = Frame::new(Command::Connected)
            .header(headers::VERSION, STOMP_VERSION)
            .header(headers::HEART_BEAT, "24000,12000");
        let (port, server) = fake_server(reply).await;

        let session = connect(&config(port)).await.unwrap();
        assert_eq!(session.timing.receive_within, Some(Duration::from_millis(30_000)));

        let connect_frame = server.await.unwrap();
        assert_eq!(connect_frame.command, Command::Connect);
        assert_eq!(connect_frame.headers.get(headers::ACCEPT_VERSION), Some("1.2"));
        assert_eq!(connect_frame.headers.get(headers::HEART_BEAT), Some("12000,24000"));
    }

    #[tokio::test]
    async fn error_frame_is_broker_error() {
        let (port, _server) = fake_server(Frame::error("unsupported version")).await;
        assert_matches!(
            connect(&config(port)).await,
            Err(ClientError::Broker(m)) if m == "unsupported version"
        );
    }

    #[tokio::test]
    async fn unexpected_frame_is_handshake_error() {
        let (port, _server) = fake_server(Frame::receipt_for("r-1")).await;
        assert_matches!(connect(&config(port)).await, Err(ClientError::Handshake(_)));
    }

    #[tokio::test]
    async fn refused_connection_is_io_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert_matches!(connect(&config(port)).await, Err(ClientError::Io(_)));
    }

    #[tokio::test]
    async fn secure_without_tls_settings_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let cfg = ClientConfig {
            secure: true,
            ..config(port)
        };
        assert_matches!(connect(&cfg).await, Err(ClientError::Tls(_)));
    }
}

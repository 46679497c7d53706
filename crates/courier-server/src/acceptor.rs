//! TCP listener accepting connections and handing them to sessions.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use courier_stomp::Transport;
use metrics::counter;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::ServerContext;
use crate::errors::{Result, ServerError};
use crate::metrics::ACCEPT_ERRORS_TOTAL;
use crate::session::run_session;

/// Pause after a failed `accept()` so a persistent error (e.g. fd
/// exhaustion) does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// A running listener.
#[derive(Debug)]
pub struct AcceptorHandle {
    local_addr: SocketAddr,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl AcceptorHandle {
    /// Address actually bound (useful with port `0`).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Close the listening socket. Established connections are unaffected.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Whether [`stop`](Self::stop) was called (or the server shut down).
    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Stop and wait until the listening socket is released.
    pub async fn stop_and_wait(self) {
        self.stop.cancel();
        let _ = self.task.await;
    }
}

/// Bind `addr` and start accepting. Bind failures are returned, not retried.
pub(crate) async fn bind(
    ctx: Arc<ServerContext>,
    addr: &str,
    tls: Option<TlsAcceptor>,
) -> Result<AcceptorHandle> {
    let listener = TcpListener::bind(addr).await.map_err(|source| ServerError::Bind {
        addr: addr.to_owned(),
        source,
    })?;
    let local_addr = listener.local_addr()?;
    info!(%local_addr, tls = tls.is_some(), "listening");

    let stop = ctx.acceptors.child_token();
    let task = tokio::spawn(accept_loop(ctx, listener, tls, stop.clone()));
    Ok(AcceptorHandle {
        local_addr,
        stop,
        task,
    })
}

async fn accept_loop(
    ctx: Arc<ServerContext>,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    stop: CancellationToken,
) {
    let local_addr = listener.local_addr().ok();
    loop {
        let accepted = tokio::select! {
            () = stop.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                debug!(%peer, "accepted connection");
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(%peer, error = %e, "failed to set TCP_NODELAY");
                }
                spawn_connection(&ctx, stream, peer, tls.clone());
            }
            Err(e) => {
                counter!(ACCEPT_ERRORS_TOTAL).increment(1);
                warn!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
    drop(listener);
    info!(?local_addr, "acceptor stopped");
}

fn spawn_connection(ctx: &Arc<ServerContext>, stream: TcpStream, peer: SocketAddr, tls: Option<TlsAcceptor>) {
    let session_ctx = Arc::clone(ctx);
    let _ = ctx.sessions.spawn(async move {
        let transport: Transport = match tls {
            Some(acceptor) => {
                let upgrade = tokio::time::timeout(session_ctx.config.handshake_timeout(), acceptor.accept(stream));
                match upgrade.await {
                    Ok(Ok(tls_stream)) => Box::new(tls_stream),
                    Ok(Err(e)) => {
                        warn!(%peer, error = %e, "TLS handshake failed");
                        return;
                    }
                    Err(_) => {
                        warn!(%peer, "TLS handshake timed out");
                        return;
                    }
                }
            }
            None => Box::new(stream),
        };
        run_session(session_ctx, transport, peer).await;
    });
}

//! The RPC server: listeners, dispatch and event publishing behind one handle.

use std::sync::Arc;
use std::time::Duration;

use courier_rpc::{Bridge, EventPublisher, RpcError};
use serde_json::{Map, Value};
use tracing::info;

use crate::acceptor::{AcceptorHandle, bind};
use crate::config::ServerConfig;
use crate::context::ServerContext;
use crate::errors::Result;
use crate::executor::{Executor, TaskDispatcher};
use crate::shutdown::ShutdownCoordinator;
use crate::tls::TlsConfig;

/// Time given to sessions to flush and release after connections are cancelled.
const SESSION_RELEASE_TIMEOUT: Duration = Duration::from_secs(10);

/// STOMP-framed JSON-RPC server.
pub struct RpcServer {
    ctx: Arc<ServerContext>,
    executor: Option<Arc<Executor>>,
    coordinator: ShutdownCoordinator,
}

impl RpcServer {
    /// Create a server dispatching into `bridge` through its own bounded
    /// executor. Must be called inside a Tokio runtime.
    pub fn new(config: ServerConfig, bridge: Arc<dyn Bridge>) -> Self {
        let executor = Arc::new(Executor::new(config.executor.clone()));
        let dispatcher = Arc::clone(&executor) as Arc<dyn TaskDispatcher>;
        let mut server = Self::with_dispatcher(config, bridge, dispatcher);
        server.executor = Some(executor);
        server
    }

    /// Create a server running method bodies on `dispatcher`.
    pub fn with_dispatcher(
        config: ServerConfig,
        bridge: Arc<dyn Bridge>,
        dispatcher: Arc<dyn TaskDispatcher>,
    ) -> Self {
        let ctx = Arc::new(ServerContext::new(config, bridge, dispatcher));
        let coordinator = ShutdownCoordinator::new(ctx.shutdown.clone());
        Self {
            ctx,
            executor: None,
            coordinator,
        }
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.ctx.config
    }

    /// Listen on the configured `host:port`.
    pub async fn listen(&self) -> Result<AcceptorHandle> {
        self.listen_on(&self.ctx.config.bind_addr()).await
    }

    /// Listen on `addr` without TLS.
    pub async fn listen_on(&self, addr: &str) -> Result<AcceptorHandle> {
        bind(Arc::clone(&self.ctx), addr, None).await
    }

    /// Listen on `addr`, upgrading every connection to TLS before CONNECT.
    pub async fn listen_tls(&self, addr: &str, tls: &TlsConfig) -> Result<AcceptorHandle> {
        bind(Arc::clone(&self.ctx), addr, Some(tls.acceptor())).await
    }

    /// Stop every listener. Established connections keep running.
    pub fn stop_acceptors(&self) {
        self.ctx.acceptors.cancel();
    }

    /// Publish event `event_id` to the subscribers of `destination`.
    ///
    /// The payload is checked against the bridge's event schema first and
    /// stamped with `notify_time`. Returns the number of subscribers reached.
    pub fn notify(
        &self,
        event_id: &str,
        destination: &str,
        params: Map<String, Value>,
    ) -> std::result::Result<usize, RpcError> {
        self.ctx.publisher.publish(destination, event_id, params)
    }

    /// Publisher handing events to this server's subscribers.
    pub fn publisher(&self) -> Arc<dyn EventPublisher> {
        self.ctx.event_publisher()
    }

    /// Established connections.
    pub fn connection_count(&self) -> usize {
        self.ctx.connections.len()
    }

    /// Subscribers on `destination`.
    pub fn subscriber_count(&self, destination: &str) -> usize {
        self.ctx.subscriptions.subscriber_count(destination)
    }

    /// Whether [`shutdown`](Self::shutdown) has started.
    pub fn is_shutting_down(&self) -> bool {
        self.coordinator.is_shutting_down()
    }

    /// Stop accepting, let in-flight requests finish within the configured
    /// grace period, then close every connection.
    pub async fn shutdown(&self) {
        let grace = self.ctx.config.shutdown_grace();
        info!(?grace, connections = self.connection_count(), "shutting down");

        self.stop_acceptors();
        let _ = self.coordinator.drain("requests", &self.ctx.requests, grace).await;
        if let Some(executor) = &self.executor {
            executor.shutdown(grace).await;
        }

        self.coordinator.shutdown();
        let _ = self
            .coordinator
            .drain("sessions", &self.ctx.sessions, SESSION_RELEASE_TIMEOUT)
            .await;
        info!("shutdown complete");
    }
}

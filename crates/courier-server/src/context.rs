//! State shared by the acceptors, sessions and request tasks of one server.

use std::sync::Arc;

use courier_core::ids::ConnectionId;
use courier_rpc::{Bridge, EventPublisher};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::executor::TaskDispatcher;
use crate::publisher::ServerPublisher;
use crate::subscriptions::SubscriptionRegistry;

/// Everything a session needs to serve a connection.
pub(crate) struct ServerContext {
    pub config: ServerConfig,
    pub bridge: Arc<dyn Bridge>,
    pub dispatcher: Arc<dyn TaskDispatcher>,
    pub subscriptions: Arc<SubscriptionRegistry>,
    pub publisher: Arc<ServerPublisher>,
    pub connections: DashMap<ConnectionId, Arc<Connection>>,
    /// In-flight RPC request tasks.
    pub requests: TaskTracker,
    /// Per-connection session tasks.
    pub sessions: TaskTracker,
    /// Parent of every acceptor and connection token.
    pub shutdown: CancellationToken,
    /// Parent of every acceptor token; cancelled first at shutdown.
    pub acceptors: CancellationToken,
}

impl ServerContext {
    pub fn new(config: ServerConfig, bridge: Arc<dyn Bridge>, dispatcher: Arc<dyn TaskDispatcher>) -> Self {
        let subscriptions = Arc::new(SubscriptionRegistry::new());
        let publisher = Arc::new(ServerPublisher::new(
            Arc::clone(&subscriptions),
            bridge.event_schema(),
        ));
        let shutdown = CancellationToken::new();
        Self {
            config,
            bridge,
            dispatcher,
            subscriptions,
            publisher,
            connections: DashMap::new(),
            requests: TaskTracker::new(),
            sessions: TaskTracker::new(),
            acceptors: shutdown.child_token(),
            shutdown,
        }
    }

    /// The publisher as handed to handlers.
    pub fn event_publisher(&self) -> Arc<dyn EventPublisher> {
        Arc::clone(&self.publisher) as Arc<dyn EventPublisher>
    }
}

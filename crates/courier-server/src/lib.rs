//! # courier-server
//!
//! STOMP-framed JSON-RPC server.
//!
//! - [`acceptor`]: TCP (optionally TLS) listeners feeding connection sessions
//! - [`connection`]: per-connection send queue, lifecycle state, activity timestamps
//! - [`executor`]: bounded worker pool with exact, non-blocking admission
//! - [`subscriptions`]: destination fan-out to subscribed connections
//! - [`server`]: [`RpcServer`], tying listeners, dispatch and publishing together
//! - Graceful shutdown via `CancellationToken` and `TaskTracker`

#![deny(unsafe_code)]

pub mod acceptor;
pub mod config;
pub mod connection;
pub mod errors;
pub mod executor;
pub mod heartbeat;
pub mod metrics;
pub mod publisher;
pub mod server;
pub mod shutdown;
pub mod subscriptions;
pub mod tls;

mod context;
mod handler;
mod session;

pub use acceptor::AcceptorHandle;
pub use config::{ExecutorConfig, ServerConfig};
pub use errors::{Result, ServerError};
pub use executor::{DispatchTask, Executor, ExecutorError, TaskDispatcher, TaskHandle, TaskOutcome};
pub use server::RpcServer;
pub use tls::TlsConfig;

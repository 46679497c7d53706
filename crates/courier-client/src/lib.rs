//! # courier-client
//!
//! Client side of the STOMP-framed JSON-RPC protocol.
//!
//! - [`RpcClient`]: calls, batches, notifications, subscriptions
//! - [`ClientConfig`]: target, heart-beat preferences, reconnect policy, TLS
//! - [`PendingCalls`]: correlation of responses to waiting callers
//! - [`Subscription`]: ordered event stream for one destination
//!
//! A lost connection is retried up to `nr_retries` times with the same
//! heart-beat negotiation; live subscriptions are re-issued on every new
//! session. When retries are exhausted every waiting call fails with
//! [`ClientError::Disconnected`].

#![deny(unsafe_code)]

pub mod client;
pub mod config;
pub mod errors;
pub mod pending;
pub mod subscription;

mod connector;

pub use client::{ClientState, RpcClient};
pub use config::{ClientConfig, ClientTls};
pub use errors::{ClientError, Result};
pub use pending::PendingCalls;
pub use subscription::{ClientEvent, Subscription, SubscriptionTable};

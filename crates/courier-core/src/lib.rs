//! # courier-core
//!
//! Foundation crate shared by every Courier layer:
//!
//! - [`ids`]: branded ID newtypes (connections, subscriptions, messages)
//! - [`constants`]: protocol defaults (destinations, heart-beat intervals)
//! - [`retry`]: reconnect backoff math
//! - [`logging`]: `tracing` subscriber initialization

#![deny(unsafe_code)]

pub mod constants;
pub mod ids;
pub mod logging;
pub mod retry;

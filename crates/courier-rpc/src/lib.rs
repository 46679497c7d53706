//! # courier-rpc
//!
//! JSON-RPC 2.0 layer carried inside frame bodies.
//!
//! - [`types`]: requests, responses, error bodies, correlation ids
//! - [`errors`]: wire error codes and the handler error type
//! - [`codec`]: body ⇄ envelope (single or batch) conversion
//! - [`bridge`]: the method table / event schema contract the server dispatches into
//! - [`registry`]: an in-memory [`bridge::Bridge`] built from registered handlers

#![deny(unsafe_code)]

pub mod bridge;
pub mod codec;
pub mod errors;
pub mod registry;
pub mod types;

pub use bridge::{Bridge, CallContext, EventPublisher, EventSchema, MethodHandler};
pub use codec::{Envelope, EnvelopeError, Members, Message};
pub use errors::RpcError;
pub use registry::MethodRegistry;
pub use types::{Id, JsonRpcRequest, JsonRpcResponse, Outcome, Params, RpcErrorBody};

//! # courier-stomp
//!
//! STOMP 1.2 transport framing for Courier.
//!
//! - [`Frame`] / [`Command`] / [`Headers`]: the in-memory frame model
//! - [`FrameCodec`]: resumable streaming decoder and encoder for
//!   [`tokio_util::codec::Framed`]
//! - [`HeartBeat`]: `heart-beat` header negotiation
//! - [`Transport`]: type-erased byte stream (plain TCP or TLS)

#![deny(unsafe_code)]

pub mod codec;
pub mod errors;
pub mod frame;
pub mod heartbeat;
pub mod transport;

pub use codec::FrameCodec;
pub use errors::{Result, StompError};
pub use frame::{Command, Frame, Headers, headers};
pub use heartbeat::HeartBeat;
pub use transport::{AsyncStream, FramedTransport, Transport, framed};

//! Type-erased connection stream.
//!
//! Plain TCP and TLS streams are boxed into one [`Transport`] type so the
//! connection logic above the codec is written once.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use crate::codec::FrameCodec;

/// Any bidirectional byte stream a frame codec can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Boxed byte stream.
pub type Transport = Box<dyn AsyncStream>;

/// A transport wrapped in the frame codec.
pub type FramedTransport = Framed<Transport, FrameCodec>;

/// Wrap `stream` in a frame codec with the given size limit.
pub fn framed<S: AsyncStream + 'static>(stream: S, max_frame_size: usize) -> FramedTransport {
    Framed::new(Box::new(stream), FrameCodec::new(max_frame_size))
}

//! Streaming frame codec.
//!
//! The decoder keeps a resumable cursor: command and header lines are
//! consumed from the buffer one complete line at a time and kept in the
//! decoder state, so a frame split across arbitrary reads is assembled
//! without re-scanning and a header is never half-consumed. `Ok(None)`
//! means "incomplete, feed more bytes".

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use courier_core::constants::DEFAULT_MAX_FRAME_SIZE;

use crate::errors::{Result, StompError};
use crate::frame::{Command, Frame, Headers, escape_header, headers, unescape_header};

const EOL: u8 = b'\n';
const NUL: u8 = 0;

#[derive(Debug, Default)]
enum DecodeState {
    #[default]
    Command,
    Headers {
        command: Command,
        headers: Headers,
        consumed: usize,
    },
    Body {
        command: Command,
        headers: Headers,
        consumed: usize,
        content_length: Option<usize>,
    },
}

/// STOMP frame codec for [`tokio_util::codec::Framed`].
#[derive(Debug)]
pub struct FrameCodec {
    max_frame_size: usize,
    state: DecodeState,
}

impl FrameCodec {
    /// Create a codec rejecting frames larger than `max_frame_size` bytes.
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            state: DecodeState::Command,
        }
    }

    /// Configured frame size limit.
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    fn check_size(&self, size: usize) -> Result<()> {
        if size > self.max_frame_size {
            tracing::warn!(size, limit = self.max_frame_size, "frame exceeds size limit");
            return Err(StompError::FrameTooLarge {
                size,
                limit: self.max_frame_size,
            });
        }
        Ok(())
    }

    fn decode_inner(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        loop {
            match std::mem::take(&mut self.state) {
                DecodeState::Command => {
                    let Some(line) = take_line(src) else {
                        self.check_size(src.len())?;
                        return Ok(None);
                    };
                    let consumed = line.len() + 1;
                    let text = line_str(&line)?;
                    if text.is_empty() {
                        return Ok(Some(Frame::heartbeat()));
                    }
                    let command = Command::parse(text)
                        .ok_or_else(|| StompError::UnknownCommand(text.to_owned()))?;
                    self.state = DecodeState::Headers {
                        command,
                        headers: Headers::new(),
                        consumed,
                    };
                }
                DecodeState::Headers {
                    command,
                    mut headers,
                    mut consumed,
                } => {
                    let Some(line) = take_line(src) else {
                        self.check_size(consumed + src.len())?;
                        self.state = DecodeState::Headers {
                            command,
                            headers,
                            consumed,
                        };
                        return Ok(None);
                    };
                    consumed += line.len() + 1;
                    self.check_size(consumed)?;
                    let text = line_str(&line)?;
                    if text.is_empty() {
                        let content_length = match headers.get(headers::CONTENT_LENGTH) {
                            Some(raw) => {
                                let len = raw
                                    .trim()
                                    .parse::<usize>()
                                    .map_err(|_| StompError::InvalidContentLength(raw.to_owned()))?;
                                self.check_size(consumed + len)?;
                                Some(len)
                            }
                            None => None,
                        };
                        self.state = DecodeState::Body {
                            command,
                            headers,
                            consumed,
                            content_length,
                        };
                        continue;
                    }
                    let (key, value) = text
                        .split_once(':')
                        .ok_or_else(|| StompError::MalformedHeader(text.to_owned()))?;
                    let key = unescape_header(key)?;
                    let value = unescape_header(value)?;
                    let _ = headers.insert_if_absent(key.into_owned(), value.into_owned());
                    self.state = DecodeState::Headers {
                        command,
                        headers,
                        consumed,
                    };
                }
                DecodeState::Body {
                    command,
                    headers,
                    consumed,
                    content_length,
                } => {
                    let body_len = match content_length {
                        Some(len) => {
                            if src.len() <= len {
                                src.reserve(len + 1 - src.len());
                                self.state = DecodeState::Body {
                                    command,
                                    headers,
                                    consumed,
                                    content_length,
                                };
                                return Ok(None);
                            }
                            if src[len] != NUL {
                                return Err(StompError::MissingTerminator);
                            }
                            len
                        }
                        None => {
                            let Some(pos) = src.iter().position(|b| *b == NUL) else {
                                self.check_size(consumed + src.len())?;
                                self.state = DecodeState::Body {
                                    command,
                                    headers,
                                    consumed,
                                    content_length,
                                };
                                return Ok(None);
                            };
                            self.check_size(consumed + pos)?;
                            pos
                        }
                    };
                    let body = src.split_to(body_len).freeze();
                    src.advance(1);
                    return Ok(Some(Frame {
                        command,
                        headers,
                        body: (!body.is_empty()).then_some(body),
                    }));
                }
            }
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

/// Split one line (without its `\n`) off the front of `src`.
fn take_line(src: &mut BytesMut) -> Option<Bytes> {
    let pos = src.iter().position(|b| *b == EOL)?;
    let line = src.split_to(pos).freeze();
    src.advance(1);
    Some(line)
}

/// Decode a line as UTF-8, dropping a trailing `\r`.
fn line_str(line: &[u8]) -> Result<&str> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    std::str::from_utf8(line).map_err(|_| StompError::InvalidUtf8)
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = StompError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        let result = self.decode_inner(src);
        if result.is_err() {
            self.state = DecodeState::Command;
        }
        result
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        let mid_frame = !matches!(self.state, DecodeState::Command);
        if buf.is_empty() && !mid_frame {
            Ok(None)
        } else {
            Err(StompError::Truncated(buf.len()))
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = StompError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let size = encoded_len(&frame);
        self.check_size(size)?;
        dst.reserve(size);
        write_frame(&frame, dst);
        Ok(())
    }
}

/// Serialize `frame` into `dst`.
///
/// `content-length` is always recomputed from the body.
pub fn write_frame(frame: &Frame, dst: &mut BytesMut) {
    if frame.is_heartbeat() {
        dst.put_u8(EOL);
        return;
    }
    dst.put_slice(frame.command.as_str().as_bytes());
    dst.put_u8(EOL);
    for (key, value) in frame.headers.iter() {
        if key == headers::CONTENT_LENGTH {
            continue;
        }
        dst.put_slice(escape_header(key).as_bytes());
        dst.put_u8(b':');
        dst.put_slice(escape_header(value).as_bytes());
        dst.put_u8(EOL);
    }
    let body = frame.body_bytes();
    if !body.is_empty() {
        dst.put_slice(headers::CONTENT_LENGTH.as_bytes());
        dst.put_u8(b':');
        dst.put_slice(body.len().to_string().as_bytes());
        dst.put_u8(EOL);
    }
    dst.put_u8(EOL);
    dst.put_slice(body);
    dst.put_u8(NUL);
}

/// Serialize `frame` into a fresh buffer.
pub fn encode_frame(frame: &Frame) -> Bytes {
    let mut dst = BytesMut::with_capacity(encoded_len(frame));
    write_frame(frame, &mut dst);
    dst.freeze()
}

fn encoded_len(frame: &Frame) -> usize {
    if frame.is_heartbeat() {
        return 1;
    }
    let headers: usize = frame
        .headers
        .iter()
        .map(|(k, v)| escape_header(k).len() + escape_header(v).len() + 2)
        .sum();
    let body = frame.body_bytes().len();
    frame.command.as_str().len() + 1 + headers + 1 + body + 1 + 32
}

//! Frame model and header escaping.

use std::borrow::Cow;
use std::fmt;

use bytes::Bytes;

use crate::errors::{Result, StompError};

/// Well-known header names.
pub mod headers {
    /// Body length in bytes.
    pub const CONTENT_LENGTH: &str = "content-length";
    /// MIME type of the body.
    pub const CONTENT_TYPE: &str = "content-type";
    /// Target or source destination.
    pub const DESTINATION: &str = "destination";
    /// Subscription identifier on SUBSCRIBE / UNSUBSCRIBE.
    pub const ID: &str = "id";
    /// Subscription a MESSAGE was routed through.
    pub const SUBSCRIPTION: &str = "subscription";
    /// Identifier stamped on MESSAGE frames.
    pub const MESSAGE_ID: &str = "message-id";
    /// Receipt requested by the sender.
    pub const RECEIPT: &str = "receipt";
    /// Receipt acknowledged by a RECEIPT frame.
    pub const RECEIPT_ID: &str = "receipt-id";
    /// Versions offered at CONNECT.
    pub const ACCEPT_VERSION: &str = "accept-version";
    /// Version chosen in CONNECTED.
    pub const VERSION: &str = "version";
    /// Virtual host named at CONNECT.
    pub const HOST: &str = "host";
    /// Heart-beat negotiation pair.
    pub const HEART_BEAT: &str = "heart-beat";
    /// Destination the response to a request should go to.
    pub const REPLY_TO: &str = "reply-to";
    /// Short error description on ERROR frames.
    pub const MESSAGE: &str = "message";
}

/// Frame command.
///
/// [`Command::Heartbeat`] has no command line on the wire: it is the single
/// end-of-line a peer sends to prove liveness.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Command {
    /// Client opens a session.
    Connect,
    /// Server accepts a session.
    Connected,
    /// Client publishes to a destination.
    Send,
    /// Client registers interest in a destination.
    Subscribe,
    /// Client drops a subscription.
    Unsubscribe,
    /// Server delivers a message to a client.
    Message,
    /// Server reports a fatal protocol error.
    Error,
    /// Client closes the session.
    Disconnect,
    /// Server acknowledges a `receipt` header.
    Receipt,
    /// Liveness signal (bare end-of-line).
    Heartbeat,
}

impl Command {
    /// Wire representation of the command line.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Connected => "CONNECTED",
            Self::Send => "SEND",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Message => "MESSAGE",
            Self::Error => "ERROR",
            Self::Disconnect => "DISCONNECT",
            Self::Receipt => "RECEIPT",
            Self::Heartbeat => "",
        }
    }

    /// Parse a command line. `STOMP` is accepted as an alias of `CONNECT`.
    pub fn parse(line: &str) -> Option<Self> {
        Some(match line {
            "CONNECT" | "STOMP" => Self::Connect,
            "CONNECTED" => Self::Connected,
            "SEND" => Self::Send,
            "SUBSCRIBE" => Self::Subscribe,
            "UNSUBSCRIBE" => Self::Unsubscribe,
            "MESSAGE" => Self::Message,
            "ERROR" => Self::Error,
            "DISCONNECT" => Self::Disconnect,
            "RECEIPT" => Self::Receipt,
            _ => return None,
        })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Heartbeat => f.write_str("HEARTBEAT"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Ordered header mapping with unique, case-sensitive keys.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// Create an empty header set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key` to `value`, replacing an existing value in place.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    /// Set `key` only if absent. Returns whether the value was stored.
    ///
    /// Decoding uses this so that the first occurrence of a repeated
    /// header wins.
    pub fn insert_if_absent(&mut self, key: impl Into<String>, value: impl Into<String>) -> bool {
        let key = key.into();
        if self.contains(&key) {
            return false;
        }
        self.entries.push((key, value.into()));
        true
    }

    /// Value of `key`, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Whether `key` is present.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// Remove `key`, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(pos).1)
    }

    /// Iterate in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of headers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no headers.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Self::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

/// One transport frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Frame command.
    pub command: Command,
    /// Frame headers.
    pub headers: Headers,
    /// Optional body. Empty bodies are represented as `None`.
    pub body: Option<Bytes>,
}

impl Frame {
    /// Create a frame with no headers and no body.
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Headers::new(),
            body: None,
        }
    }

    /// The liveness frame.
    pub fn heartbeat() -> Self {
        Self::new(Command::Heartbeat)
    }

    /// Builder: add a header.
    #[must_use]
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key, value);
        self
    }

    /// Builder: set the body. An empty body clears it.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        self.body = (!body.is_empty()).then_some(body);
        self
    }

    /// Whether this is a liveness frame.
    pub fn is_heartbeat(&self) -> bool {
        self.command == Command::Heartbeat
    }

    /// `destination` header.
    pub fn destination(&self) -> Option<&str> {
        self.headers.get(headers::DESTINATION)
    }

    /// `receipt` header.
    pub fn receipt(&self) -> Option<&str> {
        self.headers.get(headers::RECEIPT)
    }

    /// Body bytes, empty when absent.
    pub fn body_bytes(&self) -> &[u8] {
        self.body.as_deref().unwrap_or_default()
    }

    /// Build an ERROR frame carrying `message` both as header and body.
    pub fn error(message: &str) -> Self {
        Self::new(Command::Error)
            .header(headers::MESSAGE, message)
            .header(headers::CONTENT_TYPE, "text/plain")
            .with_body(Bytes::copy_from_slice(message.as_bytes()))
    }

    /// Build the RECEIPT frame acknowledging `receipt_id`.
    pub fn receipt_for(receipt_id: &str) -> Self {
        Self::new(Command::Receipt).header(headers::RECEIPT_ID, receipt_id)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Header escaping
// ─────────────────────────────────────────────────────────────────────────────

/// Escape a header key or value for the wire.
pub fn escape_header(raw: &str) -> Cow<'_, str> {
    if !raw.contains(['\\', '\r', '\n', ':']) {
        return Cow::Borrowed(raw);
    }
    let mut out = String::with_capacity(raw.len() + 8);
    for ch in raw.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    Cow::Owned(out)
}

/// Reverse [`escape_header`]. Undefined escapes and raw colons are rejected.
pub fn unescape_header(wire: &str) -> Result<Cow<'_, str>> {
    if !wire.contains(['\\', ':']) {
        return Ok(Cow::Borrowed(wire));
    }
    let mut out = String::with_capacity(wire.len());
    let mut chars = wire.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => match chars.next() {
                Some('\\') => out.push('\\'),
                Some('r') => out.push('\r'),
                Some('n') => out.push('\n'),
                Some('c') => out.push(':'),
                _ => return Err(StompError::InvalidEscape(wire.to_owned())),
            },
            ':' => return Err(StompError::InvalidEscape(wire.to_owned())),
            other => out.push(other),
        }
    }
    Ok(Cow::Owned(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn command_round_trip() {
        for cmd in [
            Command::Connect,
            Command::Connected,
            Command::Send,
            Command::Subscribe,
            Command::Unsubscribe,
            Command::Message,
            Command::Error,
            Command::Disconnect,
            Command::Receipt,
        ] {
            assert_eq!(Command::parse(cmd.as_str()), Some(cmd));
        }
    }

    #[test]
    fn stomp_is_connect_alias() {
        assert_eq!(Command::parse("STOMP"), Some(Command::Connect));
    }

    #[test]
    fn commands_are_case_sensitive() {
        assert_eq!(Command::parse("send"), None);
    }

    #[test]
    fn headers_insert_replaces_in_place() {
        let mut h = Headers::new();
        h.insert("a", "1");
        h.insert("b", "2");
        h.insert("a", "3");
        let pairs: Vec<_> = h.iter().collect();
        assert_eq!(pairs, vec![("a", "3"), ("b", "2")]);
    }

    #[test]
    fn headers_first_occurrence_wins() {
        let mut h = Headers::new();
        assert!(h.insert_if_absent("k", "first"));
        assert!(!h.insert_if_absent("k", "second"));
        assert_eq!(h.get("k"), Some("first"));
    }

    #[test]
    fn headers_are_case_sensitive() {
        let h: Headers = [("Destination", "x")].into_iter().collect();
        assert!(h.get("destination").is_none());
        assert_eq!(h.get("Destination"), Some("x"));
    }

    #[test]
    fn headers_remove() {
        let mut h: Headers = [("a", "1"), ("b", "2")].into_iter().collect();
        assert_eq!(h.remove("a").as_deref(), Some("1"));
        assert_eq!(h.len(), 1);
        assert!(h.remove("a").is_none());
    }

    #[test]
    fn empty_body_is_none() {
        let frame = Frame::new(Command::Send).with_body(Bytes::new());
        assert!(frame.body.is_none());
        assert!(frame.body_bytes().is_empty());
    }

    #[test]
    fn error_frame_carries_message() {
        let frame = Frame::error("boom");
        assert_eq!(frame.headers.get(headers::MESSAGE), Some("boom"));
        assert_eq!(frame.body_bytes(), b"boom");
    }

    #[test]
    fn escape_special_characters() {
        assert_eq!(escape_header("a:b\nc\\d\re"), "a\\cb\\nc\\\\d\\re");
        assert!(matches!(escape_header("plain"), Cow::Borrowed(_)));
    }

    #[test]
    fn unescape_reverses_escape() {
        let raw = "key:with\\odd\nchars\r";
        let wire = escape_header(raw);
        assert_eq!(unescape_header(&wire).unwrap(), raw);
    }

    #[test]
    fn unescape_rejects_undefined_escape() {
        assert_matches!(unescape_header("bad\\t"), Err(StompError::InvalidEscape(_)));
        assert_matches!(unescape_header("trailing\\"), Err(StompError::InvalidEscape(_)));
    }

    #[test]
    fn unescape_rejects_raw_colon() {
        assert_matches!(unescape_header("a:b"), Err(StompError::InvalidEscape(_)));
    }
}

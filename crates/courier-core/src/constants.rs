//! Protocol defaults shared by the server and the client.

/// Destination clients send RPC requests to.
pub const DEFAULT_REQUEST_DESTINATION: &str = "jms.topic.vdsm_requests";

/// Destination RPC responses are addressed to when a request carries no `reply-to`.
pub const DEFAULT_RESPONSE_DESTINATION: &str = "jms.topic.vdsm_responses";

/// Default listening port.
pub const DEFAULT_PORT: u16 = 54321;

/// STOMP protocol version negotiated at CONNECT.
pub const STOMP_VERSION: &str = "1.2";

/// Content type of every JSON-RPC body.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Default interval (ms) within which the client expects traffic from the server.
pub const DEFAULT_INCOMING_HEARTBEAT_MS: u64 = 30_000;

/// Default interval (ms) at which the client emits heart-beats. `0` disables them.
pub const DEFAULT_OUTGOING_HEARTBEAT_MS: u64 = 0;

/// Default number of reconnect attempts after a lost connection.
pub const DEFAULT_NR_RETRIES: u32 = 1;

/// Default base delay (ms) between reconnect attempts.
pub const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 2_000;

/// Slack applied to heart-beat intervals advertised at CONNECT.
///
/// The client promises to send no slower than `outgoing * (1 + f)` and asks
/// the server to send every `incoming * (1 - f)`.
pub const GRACE_PERIOD_FACTOR: f64 = 0.2;

/// Default maximum encoded frame size (bytes).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Default RPC call timeout (ms) on the client.
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 60_000;

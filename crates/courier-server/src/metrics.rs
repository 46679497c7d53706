//! Metric names recorded through the `metrics` facade.
//!
//! The library installs no recorder; embedders choose an exporter.

/// Connections accepted (counter).
pub const CONNECTIONS_TOTAL: &str = "courier_connections_total";
/// Connections closed (counter, labels: reason).
pub const DISCONNECTIONS_TOTAL: &str = "courier_disconnections_total";
/// Connections currently established (gauge).
pub const CONNECTIONS_ACTIVE: &str = "courier_connections_active";
/// Connection lifetime (histogram).
pub const CONNECTION_DURATION_SECONDS: &str = "courier_connection_duration_seconds";
/// Failed `accept()` calls (counter).
pub const ACCEPT_ERRORS_TOTAL: &str = "courier_accept_errors_total";
/// Frames received (counter, labels: command).
pub const FRAMES_RECEIVED_TOTAL: &str = "courier_frames_received_total";
/// RPC requests received (counter, labels: method).
pub const RPC_REQUESTS_TOTAL: &str = "courier_rpc_requests_total";
/// RPC requests answered with an error (counter, labels: method, code).
pub const RPC_ERRORS_TOTAL: &str = "courier_rpc_errors_total";
/// RPC request duration from dispatch to outcome (histogram, labels: method).
pub const RPC_REQUEST_DURATION_SECONDS: &str = "courier_rpc_request_duration_seconds";
/// Tasks admitted by the dispatcher (counter).
pub const DISPATCH_ADMITTED_TOTAL: &str = "courier_dispatch_admitted_total";
/// Tasks rejected by the dispatcher (counter, labels: reason).
pub const DISPATCH_REJECTED_TOTAL: &str = "courier_dispatch_rejected_total";
/// Tasks that exceeded their deadline (counter).
pub const DISPATCH_TIMEOUTS_TOTAL: &str = "courier_dispatch_timeouts_total";
/// Tasks that panicked (counter).
pub const DISPATCH_PANICS_TOTAL: &str = "courier_dispatch_panics_total";
/// Time tasks spent queued before a worker picked them up (histogram).
pub const DISPATCH_QUEUE_WAIT_SECONDS: &str = "courier_dispatch_queue_wait_seconds";
/// Tasks admitted and not yet finished (gauge).
pub const DISPATCH_IN_FLIGHT: &str = "courier_dispatch_in_flight";
/// Messages delivered to subscribers (counter).
pub const DELIVERIES_TOTAL: &str = "courier_deliveries_total";
/// Deliveries dropped on a full or closed send queue (counter).
pub const DELIVERIES_DROPPED_TOTAL: &str = "courier_deliveries_dropped_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_share_prefix() {
        for name in [
            CONNECTIONS_TOTAL,
            RPC_REQUESTS_TOTAL,
            DISPATCH_REJECTED_TOTAL,
            DELIVERIES_DROPPED_TOTAL,
        ] {
            assert!(name.starts_with("courier_"), "{name}");
        }
    }
}

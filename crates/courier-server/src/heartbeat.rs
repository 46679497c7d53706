//! Outbound heart-beats for idle connections.

use std::sync::Arc;
use std::time::Duration;

use courier_stomp::Frame;
use tokio::time::{self, MissedTickBehavior};
use tracing::trace;

use crate::connection::Connection;

/// Send a heart-beat whenever nothing was written for half of `interval`,
/// until the connection is torn down.
///
/// Checking at half the interval keeps the worst-case gap between two
/// outbound writes at `interval`.
pub async fn run_heartbeat_sender(connection: Arc<Connection>, interval: Duration) {
    let half = (interval / 2).max(Duration::from_millis(1));
    let mut ticker = time::interval(half);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let _ = ticker.tick().await;

    let cancel = connection.cancel_token().clone();
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if connection.last_sent_elapsed() >= half && connection.send(Frame::heartbeat()) {
                    trace!(conn_id = %connection.id, "heart-beat queued");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Outbound, test_connection};
    use assert_matches::assert_matches;

    #[tokio::test(start_paused = true)]
    async fn idle_connection_gets_heartbeats() {
        let (conn, mut rx) = test_connection(8);
        let task = tokio::spawn(run_heartbeat_sender(Arc::clone(&conn), Duration::from_secs(10)));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_matches!(rx.try_recv(), Ok(Outbound::Frame(f)) if f.is_heartbeat());

        conn.abort();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stops_on_abort() {
        let (conn, _rx) = test_connection(8);
        let task = tokio::spawn(run_heartbeat_sender(Arc::clone(&conn), Duration::from_secs(1)));
        conn.abort();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("heartbeat task should stop")
            .unwrap();
    }
}

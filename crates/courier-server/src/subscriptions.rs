//! Destination fan-out to subscribed connections.
//!
//! One mutex guards the destination table. Subscribe, unsubscribe and
//! publish all take it, so a delivery never races with the removal of its
//! subscription and every subscriber sees publishes in one order. Publishing
//! only ever `try_send`s into per-connection queues: a stalled peer loses its
//! own deliveries and nobody else's.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use courier_core::ids::{ConnectionId, MessageId};
use courier_stomp::{Command, Frame, headers};
use metrics::counter;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::metrics::{DELIVERIES_DROPPED_TOTAL, DELIVERIES_TOTAL};

struct Subscriber {
    connection: Arc<Connection>,
    subscription_id: String,
}

/// Destination → subscribers table.
#[derive(Default)]
pub struct SubscriptionRegistry {
    destinations: Mutex<HashMap<String, Vec<Subscriber>>>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `subscription_id` of `connection` on `destination`.
    ///
    /// Subscription ids are scoped to their connection. Reusing an id moves
    /// the subscription to the new destination. Returns `false` if the exact
    /// subscription already existed.
    pub fn subscribe(&self, destination: &str, connection: &Arc<Connection>, subscription_id: &str) -> bool {
        let mut table = self.destinations.lock();

        let exists = table.get(destination).is_some_and(|subs| {
            subs.iter()
                .any(|s| s.connection.id == connection.id && s.subscription_id == subscription_id)
        });
        if exists {
            return false;
        }
        let _ = remove_where(&mut table, |s| {
            s.connection.id == connection.id && s.subscription_id == subscription_id
        });

        table.entry(destination.to_owned()).or_default().push(Subscriber {
            connection: Arc::clone(connection),
            subscription_id: subscription_id.to_owned(),
        });
        debug!(conn_id = %connection.id, destination, subscription_id, "subscribed");
        true
    }

    /// Drop one subscription. Returns the destination it was on.
    pub fn unsubscribe(&self, connection_id: &ConnectionId, subscription_id: &str) -> Option<String> {
        let mut table = self.destinations.lock();
        let removed = remove_where(&mut table, |s| {
            &s.connection.id == connection_id && s.subscription_id == subscription_id
        });
        let destination = removed.into_iter().next();
        if let Some(destination) = &destination {
            debug!(conn_id = %connection_id, destination, subscription_id, "unsubscribed");
        }
        destination
    }

    /// Drop every subscription of a connection. Returns how many were removed.
    pub fn remove_connection(&self, connection_id: &ConnectionId) -> usize {
        let mut table = self.destinations.lock();
        remove_where(&mut table, |s| &s.connection.id == connection_id).len()
    }

    /// Queue a MESSAGE carrying `body` for every subscriber of `destination`.
    ///
    /// Returns the number of subscribers the message was queued for.
    pub fn publish(&self, destination: &str, body: &Bytes, content_type: Option<&str>) -> usize {
        let table = self.destinations.lock();
        let Some(subs) = table.get(destination) else {
            debug!(destination, "publish with no subscribers");
            return 0;
        };

        let mut delivered = 0;
        for sub in subs {
            let mut frame = Frame::new(Command::Message)
                .header(headers::DESTINATION, destination)
                .header(headers::SUBSCRIPTION, sub.subscription_id.as_str())
                .header(headers::MESSAGE_ID, MessageId::new().into_inner());
            if let Some(content_type) = content_type {
                frame = frame.header(headers::CONTENT_TYPE, content_type);
            }
            let frame = frame.with_body(body.clone());

            if sub.connection.send(frame) {
                delivered += 1;
            } else {
                counter!(DELIVERIES_DROPPED_TOTAL).increment(1);
                warn!(
                    conn_id = %sub.connection.id,
                    destination,
                    subscription_id = %sub.subscription_id,
                    "dropping delivery, send queue full or closed"
                );
            }
        }
        counter!(DELIVERIES_TOTAL).increment(delivered as u64);
        debug!(destination, recipients = subs.len(), delivered, "published");
        delivered
    }

    /// Subscribers on `destination`.
    pub fn subscriber_count(&self, destination: &str) -> usize {
        self.destinations.lock().get(destination).map_or(0, Vec::len)
    }

    /// Destinations with at least one subscriber.
    pub fn destinations(&self) -> Vec<String> {
        let mut names: Vec<_> = self.destinations.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Remove matching subscribers, pruning emptied destinations. Returns the
/// destination of each removed entry.
fn remove_where(
    table: &mut HashMap<String, Vec<Subscriber>>,
    pred: impl Fn(&Subscriber) -> bool,
) -> Vec<String> {
    let mut removed = Vec::new();
    table.retain(|destination, subs| {
        let before = subs.len();
        subs.retain(|s| !pred(s));
        removed.extend(std::iter::repeat_n(destination.clone(), before - subs.len()));
        !subs.is_empty()
    });
    removed
}

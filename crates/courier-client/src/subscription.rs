//! Client-side subscriptions and event delivery.

use bytes::Bytes;
use courier_core::ids::SubscriptionId;
use courier_rpc::codec::{self, Envelope, Message};
use courier_rpc::{JsonRpcRequest, Params};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

/// An event delivered to a subscription.
#[derive(Clone, Debug, PartialEq)]
pub struct ClientEvent {
    /// Destination the event was published to.
    pub destination: String,
    /// Event id (the notification's `method`).
    pub event_id: String,
    /// Event payload.
    pub params: Option<Params>,
}

impl ClientEvent {
    /// Decode a MESSAGE body carrying a JSON-RPC notification.
    pub fn from_body(destination: &str, body: &[u8]) -> Option<Self> {
        match codec::decode(body) {
            Ok(Envelope::Single(Message::Request(request))) => {
                Some(Self::from_request(destination, request))
            }
            Ok(_) => None,
            Err(e) => {
                debug!(destination, error = %e, "undecodable event body");
                None
            }
        }
    }

    fn from_request(destination: &str, request: JsonRpcRequest) -> Self {
        Self {
            destination: destination.to_owned(),
            event_id: request.method,
            params: request.params,
        }
    }
}

/// A live subscription. Events arrive in publish order.
///
/// Dropping the handle stops local delivery; pass it to
/// [`RpcClient::unsubscribe`](crate::RpcClient::unsubscribe) to also tell
/// the server.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    destination: String,
    events: mpsc::UnboundedReceiver<ClientEvent>,
}

impl Subscription {
    /// Subscription id sent in SUBSCRIBE.
    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    /// Subscribed destination.
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Next event, or `None` once the subscription is gone.
    pub async fn recv(&mut self) -> Option<ClientEvent> {
        self.events.recv().await
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<ClientEvent> {
        self.events.try_recv().ok()
    }
}

#[derive(Debug)]
struct Entry {
    destination: String,
    sink: mpsc::UnboundedSender<ClientEvent>,
}

/// Subscriptions of one client, kept across reconnects.
#[derive(Debug, Default)]
pub struct SubscriptionTable {
    entries: DashMap<SubscriptionId, Entry>,
}

impl SubscriptionTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscription to `destination` and return its handle.
    pub fn insert(&self, destination: &str) -> Subscription {
        let id = SubscriptionId::new();
        let (sink, events) = mpsc::unbounded_channel();
        let _ = self.entries.insert(
            id.clone(),
            Entry {
                destination: destination.to_owned(),
                sink,
            },
        );
        Subscription {
            id,
            destination: destination.to_owned(),
            events,
        }
    }

    /// Stop delivery to `id`. Returns whether it existed.
    pub fn remove(&self, id: &SubscriptionId) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Deliver a MESSAGE routed by subscription `id`.
    ///
    /// Returns `false` when the subscription is unknown or its handle was
    /// dropped; the entry is then removed.
    pub fn deliver(&self, id: &SubscriptionId, body: &Bytes) -> bool {
        let Some(entry) = self.entries.get(id) else {
            debug!(subscription = %id, "message for unknown subscription");
            return false;
        };
        let Some(event) = ClientEvent::from_body(&entry.destination, body) else {
            return false;
        };
        if entry.sink.send(event).is_ok() {
            return true;
        }
        drop(entry);
        let _ = self.entries.remove(id);
        false
    }

    /// Live `(id, destination)` pairs, for re-subscribing after a reconnect.
    pub fn active(&self) -> Vec<(SubscriptionId, String)> {
        self.entries
            .iter()
            .filter(|entry| !entry.sink.is_closed())
            .map(|entry| (entry.key().clone(), entry.destination.clone()))
            .collect()
    }

    /// Number of subscriptions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no subscriptions.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

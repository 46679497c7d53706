//! Correlation of in-flight calls with their responses.

use courier_rpc::{Id, JsonRpcResponse};
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::debug;

use crate::errors::{ClientError, Result};

/// Completion side of a pending call.
pub(crate) type Completion = oneshot::Sender<Result<JsonRpcResponse>>;

/// In-flight calls keyed by request id.
#[derive(Debug, Default)]
pub struct PendingCalls {
    calls: DashMap<Id, Completion>,
}

impl PendingCalls {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` and return the receiver its response will arrive on.
    pub fn register(&self, id: Id) -> oneshot::Receiver<Result<JsonRpcResponse>> {
        let (tx, rx) = oneshot::channel();
        if self.calls.insert(id.clone(), tx).is_some() {
            debug!(%id, "replaced pending call with duplicate id");
        }
        rx
    }

    /// Forget `id`. Returns whether it was still pending.
    pub fn remove(&self, id: &Id) -> bool {
        self.calls.remove(id).is_some()
    }

    /// Hand `response` to the matching caller.
    ///
    /// Returns `false` when nobody waits for it, e.g. the call already timed
    /// out or the id is null.
    pub fn complete(&self, response: JsonRpcResponse) -> bool {
        let Some(id) = response.id.clone() else {
            debug!("dropping response without id");
            return false;
        };
        match self.calls.remove(&id) {
            Some((_, tx)) => tx.send(Ok(response)).is_ok(),
            None => {
                debug!(%id, "dropping late response");
                false
            }
        }
    }

    /// Fail every pending call with the error built by `error`.
    pub fn fail_all(&self, error: impl Fn() -> ClientError) -> usize {
        let ids: Vec<Id> = self.calls.iter().map(|entry| entry.key().clone()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, tx)) = self.calls.remove(&id) {
                let _ = tx.send(Err(error()));
                failed += 1;
            }
        }
        failed
    }

    /// Number of calls awaiting a response.
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Whether no call is in flight.
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

//! Pending request table
//!
//! Maps outstanding request ids to single-shot completion slots. While an
//! entry lives, id → slot is a bijection; entries are removed on
//! completion, cancellation, timeout, or binding shutdown. A completion
//! for an id with no entry (late reply to a cancelled request, or a
//! duplicate) is dropped.

use crate::jsonrpc::{ErrorObject, RequestId};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

/// Raw outcome delivered to a waiter before typed decoding
#[derive(Debug)]
pub enum RawOutcome {
    /// Successful response; carries the `result` member (possibly null)
    Result(Value),
    /// Error response from the server
    Error(ErrorObject),
    /// The binding shut down before the response arrived
    Terminated,
}

/// Error types for client-issued requests
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("server error {code}: {message}")]
    Server {
        code: i32,
        message: String,
        data: Option<Value>,
    },

    #[error("request was cancelled")]
    Cancelled,

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("binding terminated before the request completed")]
    Terminated,

    #[error("in-flight window is full")]
    Saturated,

    #[error("duplicate request id: {0}")]
    DuplicateId(RequestId),

    #[error("request serialization failed: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("response deserialization failed: {0}")]
    Deserialize(#[source] serde_json::Error),
}

impl From<ErrorObject> for RequestError {
    fn from(error: ErrorObject) -> Self {
        RequestError::Server {
            code: error.code,
            message: error.message,
            data: error.data,
        }
    }
}

/// Thread-safe map from request id to completion slot
#[derive(Default)]
pub struct PendingTable {
    entries: Mutex<HashMap<String, oneshot::Sender<RawOutcome>>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh id and return the slot its waiter awaits
    pub fn insert(&self, id: &RequestId) -> Result<oneshot::Receiver<RawOutcome>, RequestError> {
        let (tx, rx) = oneshot::channel();
        let mut entries = self.entries.lock().unwrap();

        if entries.contains_key(id.as_str()) {
            return Err(RequestError::DuplicateId(id.clone()));
        }

        entries.insert(id.as_str().to_string(), tx);
        Ok(rx)
    }

    /// Deliver an outcome to the waiter for `id`.
    ///
    /// Returns false when no entry exists - a late reply to a cancelled
    /// request or a duplicate completion; both are dropped.
    pub fn complete(&self, id: &str, outcome: RawOutcome) -> bool {
        let sender = self.entries.lock().unwrap().remove(id);

        match sender {
            Some(sender) => {
                if sender.send(outcome).is_err() {
                    debug!("waiter for request {} dropped before completion", id);
                }
                true
            }
            None => false,
        }
    }

    /// Remove an entry without waking its waiter.
    ///
    /// Used by the cancellation path, which communicates the reason to
    /// the waiter out of band. Returns false if the entry was already
    /// completed.
    pub fn remove(&self, id: &RequestId) -> bool {
        self.entries.lock().unwrap().remove(id.as_str()).is_some()
    }

    /// Fail every outstanding entry with `Terminated`
    pub fn fail_all(&self) {
        let entries: Vec<_> = {
            let mut map = self.entries.lock().unwrap();
            map.drain().collect()
        };

        for (id, sender) in entries {
            debug!("failing outstanding request {} on shutdown", id);
            let _ = sender.send(RawOutcome::Terminated);
        }
    }

    /// Number of outstanding entries
    pub fn outstanding(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.outstanding() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_complete_wakes_waiter() {
        let table = PendingTable::new();
        let id = RequestId::fresh();
        let rx = table.insert(&id).unwrap();

        assert!(table.complete(id.as_str(), RawOutcome::Result(serde_json::json!(1))));

        match rx.await.unwrap() {
            RawOutcome::Result(value) => assert_eq!(value, serde_json::json!(1)),
            other => panic!("Expected result, got {other:?}"),
        }
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_completion_dropped() {
        let table = PendingTable::new();
        let id = RequestId::fresh();
        let _rx = table.insert(&id).unwrap();

        assert!(table.complete(id.as_str(), RawOutcome::Result(Value::Null)));
        assert!(!table.complete(id.as_str(), RawOutcome::Result(Value::Null)));
    }

    #[tokio::test]
    async fn test_unknown_id_dropped() {
        let table = PendingTable::new();
        assert!(!table.complete("no-such-id", RawOutcome::Result(Value::Null)));
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let table = PendingTable::new();
        let id = RequestId::fresh();
        let _rx = table.insert(&id).unwrap();

        assert!(matches!(
            table.insert(&id),
            Err(RequestError::DuplicateId(_))
        ));
    }

    #[tokio::test]
    async fn test_fail_all_terminates_waiters() {
        let table = PendingTable::new();
        let a = RequestId::fresh();
        let b = RequestId::fresh();
        let rx_a = table.insert(&a).unwrap();
        let rx_b = table.insert(&b).unwrap();
        assert_eq!(table.outstanding(), 2);

        table.fail_all();

        assert!(matches!(rx_a.await.unwrap(), RawOutcome::Terminated));
        assert!(matches!(rx_b.await.unwrap(), RawOutcome::Terminated));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_remove_leaves_waiter_unwoken() {
        let table = PendingTable::new();
        let id = RequestId::fresh();
        let mut rx = table.insert(&id).unwrap();

        assert!(table.remove(&id));
        assert!(!table.remove(&id));

        // Slot was dropped without an outcome
        assert!(rx.try_recv().is_err());
    }
}

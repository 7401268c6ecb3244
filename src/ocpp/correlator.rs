//! Request/reply correlation — maps outgoing CALL message ids to a
//! one-shot completion slot, fulfilled by the reader task or by deadline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::TimeoutError;

#[derive(Debug)]
pub enum CorrelatorOutcome {
    Success(Value),
    Error {
        error_code: String,
        error_description: String,
    },
    Disconnected,
}

struct PendingEntry {
    action: String,
    deadline: Instant,
    completion: oneshot::Sender<CorrelatorOutcome>,
}

/// Owned exclusively by a single session's supervisor task — no lock needed.
pub struct Correlator {
    next_id: AtomicI64,
    pending: HashMap<String, PendingEntry>,
    default_timeout: Duration,
}

impl Correlator {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            next_id: AtomicI64::new(1),
            pending: HashMap::new(),
            default_timeout,
        }
    }

    /// Allocate the next message id. Strictly increasing, starts at 1,
    /// persists across reconnects because it lives on the correlator, not
    /// the transport.
    pub fn next_message_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::SeqCst).to_string()
    }

    /// Register a pending outgoing CALL, returning the receiver half the
    /// caller awaits for its outcome.
    pub fn register(
        &mut self,
        message_id: String,
        action: impl Into<String>,
    ) -> oneshot::Receiver<CorrelatorOutcome> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            message_id,
            PendingEntry {
                action: action.into(),
                deadline: Instant::now() + self.default_timeout,
                completion: tx,
            },
        );
        rx
    }

    /// Fulfil a pending entry with a CALLRESULT payload. No-op if the id is
    /// unknown (already timed out, or never sent by us).
    pub fn fulfil_success(&mut self, message_id: &str, payload: Value) {
        if let Some(entry) = self.pending.remove(message_id) {
            let _ = entry.completion.send(CorrelatorOutcome::Success(payload));
        }
    }

    pub fn fulfil_error(&mut self, message_id: &str, error_code: String, error_description: String) {
        if let Some(entry) = self.pending.remove(message_id) {
            let _ = entry.completion.send(CorrelatorOutcome::Error {
                error_code,
                error_description,
            });
        }
    }

    /// Fail every still-pending request, e.g. on transport disconnect.
    pub fn fail_all_disconnected(&mut self) {
        for (_, entry) in self.pending.drain() {
            let _ = entry.completion.send(CorrelatorOutcome::Disconnected);
        }
    }

    /// Sweep entries whose deadline has elapsed, returning the timeouts so
    /// the caller can log/report them. The waiter itself learns of the
    /// timeout via its receiver resolving to `RecvError` (dropped sender),
    /// which callers convert into a [`TimeoutError`] at the await site.
    pub fn sweep_expired(&mut self) -> Vec<TimeoutError> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, e)| e.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|id| {
                self.pending.remove(&id).map(|entry| TimeoutError {
                    message_id: id,
                    action: entry.action,
                    elapsed_ms: self.default_timeout.as_millis() as u64,
                })
            })
            .collect()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|e| e.deadline).min()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_ids_are_strictly_increasing() {
        let correlator = Correlator::new(Duration::from_secs(30));
        let a: i64 = correlator.next_message_id().parse().unwrap();
        let b: i64 = correlator.next_message_id().parse().unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn fulfil_success_resolves_exactly_one_waiter() {
        let mut correlator = Correlator::new(Duration::from_secs(30));
        let id = correlator.next_message_id();
        let rx = correlator.register(id.clone(), "Heartbeat");

        correlator.fulfil_success(&id, serde_json::json!({"currentTime": "now"}));
        assert_eq!(correlator.pending_count(), 0);

        match rx.await.unwrap() {
            CorrelatorOutcome::Success(v) => assert_eq!(v["currentTime"], "now"),
            _ => panic!("expected success"),
        }
    }

    #[tokio::test]
    async fn unknown_message_id_is_a_no_op() {
        let mut correlator = Correlator::new(Duration::from_secs(30));
        correlator.fulfil_success("does-not-exist", serde_json::json!({}));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn disconnect_fails_all_pending_waiters() {
        let mut correlator = Correlator::new(Duration::from_secs(30));
        let id1 = correlator.next_message_id();
        let id2 = correlator.next_message_id();
        let rx1 = correlator.register(id1, "BootNotification");
        let rx2 = correlator.register(id2, "Heartbeat");

        correlator.fail_all_disconnected();

        assert!(matches!(rx1.await.unwrap(), CorrelatorOutcome::Disconnected));
        assert!(matches!(rx2.await.unwrap(), CorrelatorOutcome::Disconnected));
    }
}

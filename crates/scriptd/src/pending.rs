//! Response correlation registry.
//!
//! Maps an outstanding request key to the one-shot channel its caller is
//! waiting on. `notify` consumes the entry; a completion for a key nobody
//! is waiting on is logged and dropped. Flush and shutdown races
//! legitimately produce stray completions, and they must never wedge the
//! reader.

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::wire::protocol::{RequestKey, ScriptCompletion};

/// What a waiter receives: the completion body, or `None` for bare keyed
/// acknowledgements (flush).
pub type CompletionBody = Option<ScriptCompletion>;

#[derive(Debug, Default)]
pub struct PendingRequests {
    waiters: DashMap<RequestKey, oneshot::Sender<CompletionBody>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh key and register a waiter for it.
    ///
    /// The receiver resolves with the completion on notify, or errors when
    /// the registry fails the request (worker gone).
    pub fn add(&self) -> (RequestKey, oneshot::Receiver<CompletionBody>) {
        let key = RequestKey::new();
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(key, tx);
        (key, rx)
    }

    /// Deliver a completion to the waiter registered under `key`.
    ///
    /// Exactly one notify is expected per registered key. Unknown keys are
    /// dropped, never fatal.
    pub fn notify(&self, key: RequestKey, completion: CompletionBody) {
        match self.waiters.remove(&key) {
            Some((_, tx)) => {
                if tx.send(completion).is_err() {
                    tracing::debug!(%key, "Waiter dropped before completion arrived");
                }
            }
            None => {
                tracing::debug!(%key, "Dropping completion for unknown key");
            }
        }
    }

    /// Remove a waiter that will never be notified (send failed before the
    /// request left the process).
    pub fn discard(&self, key: RequestKey) {
        self.waiters.remove(&key);
    }

    /// Fail every outstanding waiter by dropping its sender, waking each
    /// caller with a channel-closed error.
    pub fn fail_all(&self) {
        let count = self.waiters.len();
        if count > 0 {
            tracing::warn!(count, "Failing all pending requests");
        }
        self.waiters.clear();
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::protocol::ScriptCategory;

    fn completion(job_id: u32) -> ScriptCompletion {
        ScriptCompletion {
            job_id,
            name: "test".to_string(),
            category: ScriptCategory::Prolog,
            status: 0,
            signalled: false,
            timed_out: false,
            resp_msg: String::new(),
        }
    }

    #[tokio::test]
    async fn notify_wakes_the_registered_waiter() {
        let pending = PendingRequests::new();
        let (key, rx) = pending.add();

        pending.notify(key, Some(completion(5)));

        let got = rx.await.unwrap().unwrap();
        assert_eq!(got.job_id, 5);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn keys_are_unique_and_independently_notified() {
        let pending = PendingRequests::new();
        let (k1, rx1) = pending.add();
        let (k2, rx2) = pending.add();
        assert_ne!(k1, k2);

        // Completion order is not request order.
        pending.notify(k2, Some(completion(2)));
        pending.notify(k1, Some(completion(1)));

        assert_eq!(rx1.await.unwrap().unwrap().job_id, 1);
        assert_eq!(rx2.await.unwrap().unwrap().job_id, 2);
    }

    #[tokio::test]
    async fn bare_acknowledgement_resolves_waiter() {
        let pending = PendingRequests::new();
        let (key, rx) = pending.add();
        pending.notify(key, None);
        assert!(rx.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_key_is_dropped_without_panic() {
        let pending = PendingRequests::new();
        pending.notify(RequestKey::new(), Some(completion(9)));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn fail_all_errors_every_waiter() {
        let pending = PendingRequests::new();
        let (_k1, rx1) = pending.add();
        let (_k2, rx2) = pending.add();

        pending.fail_all();

        assert!(rx1.await.is_err());
        assert!(rx2.await.is_err());
    }
}

//! The Reply Correlator (§4.4): an in-memory table pairing outbound request
//! IDs with their pending responses.
//!
//! `Watch` and `Insert` may race: a response can arrive before anyone has
//! called `Watch` for it (e.g. a very fast loopback reply beating the
//! caller's own bookkeeping). Either ordering must yield the response to the
//! eventual watcher exactly once (§8 round-trip law), so an `Insert` with no
//! matching watcher stashes the response instead of dropping it.

use dashmap::DashMap;
use mesh_common::RpcResponse;
use std::sync::Arc;
use tokio::sync::oneshot;
use uuid::Uuid;

enum Entry {
    Waiting(oneshot::Sender<RpcResponse>),
    Stashed(RpcResponse),
}

#[derive(Clone, Default)]
pub struct ReplyCorrelator {
    entries: Arc<DashMap<Uuid, Entry>>,
}

impl ReplyCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers interest in `id`. If a response already arrived and was
    /// stashed, the returned receiver resolves immediately.
    pub fn watch(&self, id: Uuid) -> oneshot::Receiver<RpcResponse> {
        let (tx, rx) = oneshot::channel();
        match self.entries.remove(&id) {
            Some((_, Entry::Stashed(response))) => {
                // Receiver side is freshly created, so send cannot fail.
                let _ = tx.send(response);
            }
            Some((_, Entry::Waiting(_))) | None => {
                self.entries.insert(id, Entry::Waiting(tx));
            }
        }
        rx
    }

    /// Delivers `response` to an existing watcher, or stashes it for a
    /// watcher that hasn't registered yet.
    pub fn insert(&self, response: RpcResponse) {
        let id = response.id;
        match self.entries.remove(&id) {
            Some((_, Entry::Waiting(tx))) => {
                // A dropped receiver (the caller gave up) just means the
                // send fails silently; nothing further to correlate.
                let _ = tx.send(response);
            }
            Some((_, Entry::Stashed(_))) | None => {
                self.entries.insert(id, Entry::Stashed(response));
            }
        }
    }

    /// Removes an entry outright. Callers use this on cancellation/timeout
    /// so an eventual late reply doesn't leak a stashed entry forever
    /// (§9 "Reply Correlator leak vectors").
    pub fn delete(&self, id: &Uuid) {
        self.entries.remove(id);
    }

    /// Drops every entry, waiting or stashed. Used on worker reload: a
    /// watcher from the previous generation has no script left to deliver
    /// its response to, and dropping its sender lets the watcher's `await`
    /// resolve to a closed-channel error rather than hang forever.
    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(id: Uuid) -> RpcResponse {
        RpcResponse::ok(id, "node-a", b"hi".to_vec())
    }

    #[tokio::test]
    async fn insert_then_watch_yields_response() {
        let correlator = ReplyCorrelator::new();
        let id = Uuid::new_v4();
        correlator.insert(response(id));
        let rx = correlator.watch(id);
        let got = rx.await.unwrap();
        assert_eq!(got.id, id);
        assert!(correlator.is_empty());
    }

    #[tokio::test]
    async fn watch_then_insert_yields_response() {
        let correlator = ReplyCorrelator::new();
        let id = Uuid::new_v4();
        let rx = correlator.watch(id);
        correlator.insert(response(id));
        let got = rx.await.unwrap();
        assert_eq!(got.id, id);
        assert!(correlator.is_empty());
    }

    #[tokio::test]
    async fn delete_drops_stashed_entry() {
        let correlator = ReplyCorrelator::new();
        let id = Uuid::new_v4();
        correlator.insert(response(id));
        correlator.delete(&id);
        assert!(correlator.is_empty());
    }

    #[tokio::test]
    async fn clear_closes_every_pending_watcher() {
        let correlator = ReplyCorrelator::new();
        let id = Uuid::new_v4();
        let rx = correlator.watch(id);
        correlator.clear();
        assert!(rx.await.is_err());
    }
}

//! The Inbox (§4.3): a durable FIFO of inbound RPC requests fanned out to N
//! per-worker consumers, plus an ephemeral broadcast path that bypasses the
//! durable queue entirely.
//!
//! A single durable record is delivered to exactly one consumer
//! (competitive consumption from the shared queue); a single broadcast copy
//! is delivered to exactly one consumer because each consumer gets its own
//! copy up front.

mod durable;

pub use durable::DurableQueue;

use dashmap::DashMap;
use mesh_common::{now_millis, RpcRequest};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const BROADCAST_CHANNEL_CAPACITY: usize = 1024;
const CONSUMER_OUTPUT_CAPACITY: usize = 256;

struct ConsumerHandle {
    broadcast_tx: mpsc::Sender<RpcRequest>,
    exit: CancellationToken,
}

pub struct Inbox {
    durable: Arc<DurableQueue>,
    consumers: DashMap<usize, ConsumerHandle>,
}

impl Inbox {
    pub async fn open(dir: &Path) -> std::io::Result<Self> {
        Ok(Self {
            durable: Arc::new(DurableQueue::open(dir).await?),
            consumers: DashMap::new(),
        })
    }

    /// Serialises `request` and appends it to the durable queue. Used for
    /// unicast calls that must survive a worker crash.
    pub async fn put_persistent(&self, request: &RpcRequest) -> Result<(), mesh_common::MeshError> {
        let bytes = bincode::serde::encode_to_vec(request, bincode::config::standard())
            .map_err(|err| mesh_common::MeshError::Transient(format!("encode request failed: {err}")))?;
        self.durable
            .put(&bytes)
            .await
            .map_err(|err| mesh_common::MeshError::Transient(format!("durable put failed: {err}")))
    }

    /// Creates one fresh-UUID copy of `request` per currently registered
    /// consumer and pushes each copy into that consumer's private channel.
    /// Returns the list of per-copy IDs. Never touches the durable queue.
    pub async fn broadcast(&self, request: &RpcRequest) -> Vec<Uuid> {
        let mut ids = Vec::with_capacity(self.consumers.len());
        let targets: Vec<mpsc::Sender<RpcRequest>> = self
            .consumers
            .iter()
            .map(|entry| entry.value().broadcast_tx.clone())
            .collect();
        for tx in targets {
            let mut copy = request.clone();
            copy.id = Uuid::new_v4();
            ids.push(copy.id);
            if tx.send(copy).await.is_err() {
                // Consumer torn down between the snapshot and the send;
                // its id still counts toward the issued list per §4.9 but
                // will never be fulfilled, so callers must pair it with a
                // timer (§9 "broadcast accounting").
                tracing::debug!("broadcast target disappeared before delivery");
            }
        }
        ids
    }

    /// Registers a new consumer for `worker_id` and starts its fan-in
    /// routine, which non-deterministically interleaves the durable queue's
    /// shared stream with the consumer's private broadcast channel.
    pub fn new_consumer(&self, worker_id: usize) -> mpsc::Receiver<RpcRequest> {
        let (broadcast_tx, broadcast_rx) = mpsc::channel(BROADCAST_CHANNEL_CAPACITY);
        let (out_tx, out_rx) = mpsc::channel(CONSUMER_OUTPUT_CAPACITY);
        let exit = CancellationToken::new();

        self.consumers.insert(
            worker_id,
            ConsumerHandle {
                broadcast_tx,
                exit: exit.clone(),
            },
        );

        tokio::spawn(fan_in(self.durable.clone(), broadcast_rx, out_tx, exit));
        out_rx
    }

    /// Closes every consumer channel and clears the consumer table. Used on
    /// script reload; a fresh `Load` calls `new_consumer` again per worker.
    pub fn reset(&self) {
        for entry in self.consumers.iter() {
            entry.value().exit.cancel();
        }
        self.consumers.clear();
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }
}

async fn fan_in(
    durable: Arc<DurableQueue>,
    mut broadcast_rx: mpsc::Receiver<RpcRequest>,
    out_tx: mpsc::Sender<RpcRequest>,
    exit: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = exit.cancelled() => break,
            maybe_req = broadcast_rx.recv() => {
                match maybe_req {
                    Some(req) => {
                        if out_tx.send(req).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            recv_result = durable.recv() => {
                match recv_result {
                    Ok(bytes) => {
                        match bincode::serde::decode_from_slice::<RpcRequest, _>(&bytes, bincode::config::standard()) {
                            Ok((req, _)) => {
                                if req.is_expired_at(now_millis()) {
                                    tracing::debug!(id = %req.id, "dropping expired durable request");
                                    continue;
                                }
                                if out_tx.send(req).await.is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                tracing::warn!(error = %err, "failed to decode durable inbox record");
                            }
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "durable queue recv failed");
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(name: &str) -> RpcRequest {
        RpcRequest {
            id: Uuid::new_v4(),
            name: name.to_string(),
            body: vec![],
            timestamp: now_millis(),
            timeout: 0,
            origin_node: "node-a".to_string(),
            is_loopback: false,
        }
    }

    #[tokio::test]
    async fn broadcast_fans_one_copy_to_every_consumer() {
        let dir = tempfile::tempdir().unwrap();
        let inbox = Inbox::open(dir.path()).await.unwrap();
        let mut c0 = inbox.new_consumer(0);
        let mut c1 = inbox.new_consumer(1);

        let ids = inbox.broadcast(&request("ping")).await;
        assert_eq!(ids.len(), 2);

        let r0 = c0.recv().await.unwrap();
        let r1 = c1.recv().await.unwrap();
        assert!(ids.contains(&r0.id));
        assert!(ids.contains(&r1.id));
        assert_ne!(r0.id, r1.id);
    }

    #[tokio::test]
    async fn persistent_put_is_delivered_to_exactly_one_consumer() {
        let dir = tempfile::tempdir().unwrap();
        let inbox = Inbox::open(dir.path()).await.unwrap();
        let mut c0 = inbox.new_consumer(0);
        let mut c1 = inbox.new_consumer(1);

        inbox.put_persistent(&request("sum")).await.unwrap();

        let winner = tokio::select! {
            Some(req) = c0.recv() => req,
            Some(req) = c1.recv() => req,
        };
        assert_eq!(winner.name, "sum");
    }

    #[tokio::test]
    async fn reset_clears_consumer_table() {
        let dir = tempfile::tempdir().unwrap();
        let inbox = Inbox::open(dir.path()).await.unwrap();
        inbox.new_consumer(0);
        assert_eq!(inbox.consumer_count(), 1);
        inbox.reset();
        assert_eq!(inbox.consumer_count(), 0);
    }
}

use std::path::Path;
use tokio::sync::Mutex;

/// Thin wrapper around the externally-provided durable FIFO queue (§1: "the
/// durable on-disk queue implementation...assumed to provide a FIFO
/// byte-record stream with fsync semantics"). Isolated in its own module so
/// the rest of the Inbox never has to know the on-disk record format.
pub struct DurableQueue {
    sender: Mutex<yaque::Sender>,
    receiver: Mutex<yaque::Receiver>,
}

impl DurableQueue {
    pub async fn open(dir: &Path) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(dir).await?;
        let (sender, receiver) = yaque::channel(dir)
            .map_err(|err| std::io::Error::other(format!("failed to open queue at {dir:?}: {err}")))?;
        Ok(Self {
            sender: Mutex::new(sender),
            receiver: Mutex::new(receiver),
        })
    }

    /// Appends one record. Fsync cadence (`sync_every` / `sync_timeout`) is
    /// owned by the queue implementation itself.
    pub async fn put(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut sender = self.sender.lock().await;
        sender
            .send(bytes)
            .await
            .map_err(|err| std::io::Error::other(format!("queue send failed: {err}")))
    }

    /// Pops the next record, blocking until one is available. Acts as the
    /// single point of competitive consumption: whichever caller currently
    /// holds the receiver lock gets the next record.
    pub async fn recv(&self) -> std::io::Result<Vec<u8>> {
        let mut receiver = self.receiver.lock().await;
        let guard = receiver
            .recv()
            .await
            .map_err(|err| std::io::Error::other(format!("queue recv failed: {err}")))?;
        let bytes = guard.to_vec();
        guard.commit();
        Ok(bytes)
    }
}

//! The Listener Manager (§4.5): a deduplicating factory of TCP listeners
//! keyed by `(network, address)`. A reloaded script calling `create_server`
//! with the same address as its predecessor reuses the already-bound
//! listener instead of stacking a new one on top of it, so a reload never
//! drops a bound port into `TIME_WAIT`.

use mesh_common::MeshError;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

#[derive(Clone, Default)]
pub struct ListenerManager {
    listeners: Arc<Mutex<HashMap<(String, String), Arc<TcpListener>>>>,
}

impl ListenerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the listener for `(network, address)`, binding a fresh one
    /// only on first request.
    pub async fn get_or_create(
        &self,
        network: &str,
        address: &str,
    ) -> Result<Arc<TcpListener>, MeshError> {
        let key = (network.to_string(), address.to_string());
        let mut listeners = self.listeners.lock().await;
        if let Some(existing) = listeners.get(&key) {
            return Ok(existing.clone());
        }
        let listener = TcpListener::bind(address)
            .await
            .map_err(|err| MeshError::Transient(format!("bind {address} failed: {err}")))?;
        let listener = Arc::new(listener);
        listeners.insert(key, listener.clone());
        Ok(listener)
    }

    /// Closes every managed listener. Invoked on script stop.
    pub async fn reset(&self) {
        let mut listeners = self.listeners.lock().await;
        tracing::debug!(count = listeners.len(), "resetting listener manager");
        listeners.clear();
    }

    pub async fn len(&self) -> usize {
        self.listeners.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn repeated_requests_for_the_same_address_share_one_listener() {
        let manager = ListenerManager::new();
        let a = manager.get_or_create("tcp", "127.0.0.1:0").await.unwrap();
        let addr = a.local_addr().unwrap().to_string();
        let b = manager.get_or_create("tcp", &addr).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.len().await, 1);
    }

    #[tokio::test]
    async fn reset_drops_every_listener() {
        let manager = ListenerManager::new();
        manager.get_or_create("tcp", "127.0.0.1:0").await.unwrap();
        manager.reset().await;
        assert_eq!(manager.len().await, 0);
    }
}

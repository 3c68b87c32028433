//! The Node Directory (§4.7): a cache of per-peer gRPC channels keyed by
//! node name, reconciled from `NotifyJoin`/`NotifyUpdate` gossip events and
//! purged on `NotifyLeave`.

use dashmap::DashMap;
use tonic::transport::{Channel, Endpoint};

#[derive(Clone)]
pub struct NodeDirectory {
    peers: DashMap<String, Channel>,
}

impl Default for NodeDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeDirectory {
    pub fn new() -> Self {
        Self {
            peers: DashMap::new(),
        }
    }

    /// Treats join and update identically: close any existing connection,
    /// then open a fresh lazy one to `addr:rpc_port` (§4.7 "reconcile").
    /// Lazy connection means the TCP handshake happens on first RPC, not
    /// here, so a flaky peer doesn't stall gossip event processing.
    pub fn reconcile(&self, node_name: &str, addr: &str, rpc_port: u16) -> Result<(), tonic::transport::Error> {
        let uri = format!("http://{addr}:{rpc_port}");
        let endpoint = Endpoint::from_shared(uri)?;
        let channel = endpoint.connect_lazy();
        self.peers.insert(node_name.to_string(), channel);
        Ok(())
    }

    pub fn get(&self, node_name: &str) -> Option<Channel> {
        self.peers.get(node_name).map(|c| c.clone())
    }

    /// Purges a departed peer (§4.6 delivery path 4).
    pub fn remove(&self, node_name: &str) {
        self.peers.remove(node_name);
    }

    pub fn contains(&self, node_name: &str) -> bool {
        self.peers.contains_key(node_name)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconcile_then_remove_round_trips() {
        let directory = NodeDirectory::new();
        directory.reconcile("node-b", "127.0.0.1", 9090).unwrap();
        assert!(directory.contains("node-b"));
        directory.remove("node-b");
        assert!(!directory.contains("node-b"));
    }

    #[test]
    fn reconcile_twice_replaces_the_connection() {
        let directory = NodeDirectory::new();
        directory.reconcile("node-b", "127.0.0.1", 9090).unwrap();
        directory.reconcile("node-b", "127.0.0.1", 9091).unwrap();
        assert_eq!(directory.len(), 1);
    }
}

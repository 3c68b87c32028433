//! Gossip integration (§4.6, §6). The gossip transport itself — failure
//! detection, UDP fan-out, TCP push/pull — is an external collaborator
//! (§1); this module owns only the delivery-path handlers a transport
//! invokes and the wire encodings they speak.

use crate::directory::NodeDirectory;
use crate::registry::{RegistryBroadcast, ServiceRegistry};
use mesh_common::now_millis;
use std::sync::Arc;

/// Encodes the advertised RPC port the way §3/§6 require: 4 bytes,
/// little-endian, carried as gossip node metadata.
pub fn encode_node_metadata(rpc_port: u16) -> [u8; 4] {
    (rpc_port as u32).to_le_bytes()
}

pub fn decode_node_metadata(bytes: &[u8]) -> Option<u16> {
    let arr: [u8; 4] = bytes.get(0..4)?.try_into().ok()?;
    Some(u32::from_le_bytes(arr) as u16)
}

/// The four delivery paths a gossip transport drives (§4.6). Implemented as
/// a concrete struct rather than a trait: there is exactly one
/// implementation per process, and the transport adapter only ever needs to
/// call these methods, never swap them out.
#[derive(Clone)]
pub struct GossipIntegration {
    node_name: String,
    registry: Arc<ServiceRegistry>,
    directory: Arc<NodeDirectory>,
}

impl GossipIntegration {
    pub fn new(node_name: impl Into<String>, registry: Arc<ServiceRegistry>, directory: Arc<NodeDirectory>) -> Self {
        Self {
            node_name: node_name.into(),
            registry,
            directory,
        }
    }

    /// Delivery path 1: `NotifyMsg` (UDP user data). Decodes by leading type
    /// byte; only `'r'` (RegistryBroadcast) is defined.
    pub fn on_notify_msg(&self, bytes: &[u8]) {
        match RegistryBroadcast::decode_gossip_message(bytes) {
            Some(broadcast) => self.registry.handle_broadcast(&broadcast),
            None => tracing::warn!("dropping unrecognised gossip user message"),
        }
    }

    /// Delivery path 2: `MergeRemoteState` (TCP push/pull). Decodes a JSON
    /// array of broadcasts and replays each through the same handler as
    /// `NotifyMsg`.
    pub fn on_merge_remote_state(&self, bytes: &[u8]) {
        match serde_json::from_slice::<Vec<RegistryBroadcast>>(bytes) {
            Ok(broadcasts) => {
                for broadcast in broadcasts {
                    self.registry.handle_broadcast(&broadcast);
                }
            }
            Err(err) => tracing::warn!(error = %err, "failed to decode merge-remote-state payload"),
        }
    }

    /// Delivery path 3: `LocalState`. Serialises every currently-local
    /// service, stamped with now, for a push/pull partner.
    pub fn local_state(&self) -> Vec<u8> {
        let broadcasts = self.registry.local_state(&self.node_name, now_millis());
        serde_json::to_vec(&broadcasts).unwrap_or_default()
    }

    /// Delivery path 4: `NotifyLeave`. Purges the peer from every service's
    /// node map and from the Node Directory.
    pub fn on_notify_leave(&self, peer_node_name: &str) {
        self.registry.handle_peer_leave(peer_node_name);
        self.directory.remove(peer_node_name);
    }

    /// `NotifyJoin`/`NotifyUpdate`: reconcile the peer's gRPC connection.
    pub fn on_notify_join_or_update(&self, peer_node_name: &str, addr: &str, metadata: &[u8]) {
        let Some(rpc_port) = decode_node_metadata(metadata) else {
            tracing::warn!(peer = peer_node_name, "peer advertised unparsable metadata");
            return;
        };
        if let Err(err) = self.directory.reconcile(peer_node_name, addr, rpc_port) {
            tracing::warn!(peer = peer_node_name, error = %err, "failed to reconcile peer connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_metadata_round_trips() {
        let encoded = encode_node_metadata(9090);
        assert_eq!(decode_node_metadata(&encoded), Some(9090));
    }

    #[test]
    fn notify_msg_with_unknown_tag_is_ignored_not_panicking() {
        let integration = GossipIntegration::new(
            "a",
            Arc::new(ServiceRegistry::new()),
            Arc::new(NodeDirectory::new()),
        );
        integration.on_notify_msg(&[b'z', 1, 2, 3]);
    }

    #[test]
    fn merge_remote_state_replays_every_broadcast() {
        let registry = Arc::new(ServiceRegistry::new());
        let integration = GossipIntegration::new("a", registry.clone(), Arc::new(NodeDirectory::new()));
        let broadcasts = vec![RegistryBroadcast {
            node_name: "b".into(),
            timestamp: 1,
            service_name: "sum".into(),
            weight: Some(1.0),
            is_deleted: false,
        }];
        integration.on_merge_remote_state(&serde_json::to_vec(&broadcasts).unwrap());
        assert!(registry.remote_nodes("sum").is_some());
    }
}

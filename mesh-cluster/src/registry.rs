//! The Service Registry (§4.6): a local service table mutated only by
//! scripts on this node, and a remote services view mutated only by the
//! gossip message handler and the peer-leave event handler.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Wire record for one `(service, node)` assertion, gossiped as the JSON
/// payload of a `'r'`-tagged user message (§6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistryBroadcast {
    #[serde(rename = "NodeName")]
    pub node_name: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: i64,
    #[serde(rename = "Name")]
    pub service_name: String,
    #[serde(rename = "Weight", skip_serializing_if = "Option::is_none", default)]
    pub weight: Option<f64>,
    #[serde(rename = "IsDeleted", skip_serializing_if = "is_false", default)]
    pub is_deleted: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// The gossip user-message type tag for a registry broadcast (§6).
pub const REGISTRY_BROADCAST_TAG: u8 = b'r';

impl RegistryBroadcast {
    pub fn encode_gossip_message(&self) -> Vec<u8> {
        let mut out = vec![REGISTRY_BROADCAST_TAG];
        out.extend_from_slice(&serde_json::to_vec(self).unwrap_or_default());
        out
    }

    pub fn decode_gossip_message(bytes: &[u8]) -> Option<Self> {
        let (tag, body) = bytes.split_first()?;
        if *tag != REGISTRY_BROADCAST_TAG {
            return None;
        }
        serde_json::from_slice(body).ok()
    }

    /// §4.6 invalidation rule: `self` invalidates `other` iff they name the
    /// same `(node, service)` and `self` is strictly newer.
    pub fn invalidates(&self, other: &RegistryBroadcast) -> bool {
        self.node_name == other.node_name
            && self.service_name == other.service_name
            && self.timestamp > other.timestamp
    }
}

/// One authoritative assertion about a `(service, node)` pair (§3).
#[derive(Clone, Debug)]
pub struct ServiceEntry {
    pub service_name: String,
    pub node_name: String,
    pub weight: f64,
    pub timestamp: i64,
    pub is_deleted: bool,
}

#[derive(Default)]
pub struct ServiceRegistry {
    /// Mutated only by scripts on this node during registration; cleared on
    /// script stop.
    local: DashMap<String, f64>,
    /// Mutated only by the gossip handler and the peer-leave handler.
    remote: DashMap<String, DashMap<String, f64>>,
    /// Last-applied timestamp per `(service, node)`, kept purely so the
    /// eventually-consistent property (§8) is directly observable; the
    /// applier itself never gates on it (§4.6 "overwrite without timestamp
    /// check").
    last_applied: DashMap<(String, String), i64>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // --- local table, written only by script registration ---

    pub fn register_local(&self, service_name: impl Into<String>, weight: f64) {
        self.local.insert(service_name.into(), weight);
    }

    pub fn unregister_local(&self, service_name: &str) {
        self.local.remove(service_name);
    }

    pub fn local_weight(&self, service_name: &str) -> Option<f64> {
        self.local.get(service_name).map(|w| *w)
    }

    /// Cleared on script stop (§4.10).
    pub fn clear_local(&self) {
        self.local.clear();
    }

    /// Serialises every currently-local service as a registry broadcast,
    /// stamped with `now` (§4.6 delivery path 3, `LocalState`).
    pub fn local_state(&self, node_name: &str, now: i64) -> Vec<RegistryBroadcast> {
        self.local
            .iter()
            .map(|entry| RegistryBroadcast {
                node_name: node_name.to_string(),
                timestamp: now,
                service_name: entry.key().clone(),
                weight: Some(*entry.value()),
                is_deleted: false,
            })
            .collect()
    }

    // --- remote view, written only by gossip handlers ---

    /// Applies one broadcast: upserts or removes `(service, node)`.
    /// Overwrites unconditionally — the invalidation rule is the gossip
    /// layer's delivery filter, not a condition checked here (§4.6).
    pub fn handle_broadcast(&self, broadcast: &RegistryBroadcast) {
        let key = (broadcast.service_name.clone(), broadcast.node_name.clone());
        self.last_applied.insert(key, broadcast.timestamp);

        if broadcast.is_deleted {
            if let Some(nodes) = self.remote.get(&broadcast.service_name) {
                nodes.remove(&broadcast.node_name);
            }
            return;
        }

        let weight = broadcast.weight.unwrap_or(0.0);
        self.remote
            .entry(broadcast.service_name.clone())
            .or_default()
            .insert(broadcast.node_name.clone(), weight);
    }

    /// Purges a departed peer from every service's node map (§4.6 delivery
    /// path 4, `NotifyLeave`).
    pub fn handle_peer_leave(&self, node_name: &str) {
        for entry in self.remote.iter() {
            entry.value().remove(node_name);
        }
    }

    /// `remote_services[name]` from §4.9 step 2: the weighted node map for
    /// one service, or `None` if nobody remote advertises it.
    pub fn remote_nodes(&self, service_name: &str) -> Option<Vec<(String, f64)>> {
        let nodes = self.remote.get(service_name)?;
        if nodes.is_empty() {
            return None;
        }
        Some(nodes.iter().map(|e| (e.key().clone(), *e.value())).collect())
    }

    pub fn last_applied_timestamp(&self, service_name: &str, node_name: &str) -> Option<i64> {
        self.last_applied
            .get(&(service_name.to_string(), node_name.to_string()))
            .map(|v| *v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_round_trips_through_gossip_wire_encoding() {
        let broadcast = RegistryBroadcast {
            node_name: "b".into(),
            timestamp: 42,
            service_name: "sum".into(),
            weight: Some(3.0),
            is_deleted: false,
        };
        let bytes = broadcast.encode_gossip_message();
        assert_eq!(bytes[0], REGISTRY_BROADCAST_TAG);
        let decoded = RegistryBroadcast::decode_gossip_message(&bytes).unwrap();
        assert_eq!(decoded.node_name, "b");
        assert_eq!(decoded.weight, Some(3.0));
    }

    #[test]
    fn is_deleted_removes_the_node_from_the_service() {
        let registry = ServiceRegistry::new();
        registry.handle_broadcast(&RegistryBroadcast {
            node_name: "b".into(),
            timestamp: 1,
            service_name: "sum".into(),
            weight: Some(1.0),
            is_deleted: false,
        });
        assert!(registry.remote_nodes("sum").is_some());

        registry.handle_broadcast(&RegistryBroadcast {
            node_name: "b".into(),
            timestamp: 2,
            service_name: "sum".into(),
            weight: None,
            is_deleted: true,
        });
        assert!(registry.remote_nodes("sum").is_none());
    }

    #[test]
    fn peer_leave_purges_every_service() {
        let registry = ServiceRegistry::new();
        registry.handle_broadcast(&RegistryBroadcast {
            node_name: "b".into(),
            timestamp: 1,
            service_name: "sum".into(),
            weight: Some(1.0),
            is_deleted: false,
        });
        registry.handle_broadcast(&RegistryBroadcast {
            node_name: "b".into(),
            timestamp: 1,
            service_name: "echo".into(),
            weight: Some(1.0),
            is_deleted: false,
        });
        registry.handle_peer_leave("b");
        assert!(registry.remote_nodes("sum").is_none());
        assert!(registry.remote_nodes("echo").is_none());
    }
}

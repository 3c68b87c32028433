//! Wires [`GossipIntegration`] to a concrete SWIM-style gossip transport
//! (`chitchat`). This module is the seam the spec calls "a library is
//! assumed" (§1): everything above it only knows about the four delivery
//! paths in §4.6, never about chitchat's own key-value/version model.

use crate::gossip::{encode_node_metadata, GossipIntegration};
use crate::registry::RegistryBroadcast;
use chitchat::transport::UdpTransport;
use chitchat::{spawn_chitchat, Chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig};
use mesh_common::config::GossipConfig;
use mesh_common::now_millis;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const SERVICE_KEY_PREFIX: &str = "svc:";
const RPC_PORT_KEY: &str = "rpc_port";
const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct GossipTransport {
    handle: ChitchatHandle,
}

impl GossipTransport {
    /// Starts the chitchat cluster, advertises this node's RPC port as
    /// metadata, and spawns a background task that drains live/dead node
    /// transitions and per-peer key-value changes into `integration`.
    pub async fn start(
        node_name: &str,
        config: &GossipConfig,
        rpc_port: u16,
        integration: GossipIntegration,
    ) -> anyhow::Result<Self> {
        let listen_addr: SocketAddr = format!("{}:{}", config.addr, config.port).parse()?;
        let chitchat_id = ChitchatId::new(node_name.to_string(), 0, listen_addr);
        let seed_nodes = config.seed_nodes.clone();

        let chitchat_config = ChitchatConfig {
            chitchat_id,
            cluster_id: "mesh-runtime".to_string(),
            gossip_interval: Duration::from_millis(500),
            listen_addr,
            seed_nodes,
            failure_detector_config: FailureDetectorConfig::default(),
            marked_for_deletion_grace_period: Duration::from_secs(60),
            catchup_callback: None,
            extra_liveness_predicate: None,
        };

        let handle = spawn_chitchat(chitchat_config, Vec::new(), &UdpTransport).await?;

        {
            let chitchat = handle.chitchat();
            let mut guard = chitchat.lock().await;
            let rpc_port_bytes = encode_node_metadata(rpc_port);
            guard
                .self_node_state()
                .set(RPC_PORT_KEY, hex::encode(rpc_port_bytes));
        }

        tokio::spawn(poll_loop(handle.chitchat(), integration));

        Ok(Self { handle })
    }

    /// Publishes (or retracts) one service's weight into this node's
    /// chitchat key-value state under `svc:<service_name>`.
    pub async fn publish_local_service(&self, service_name: &str, weight: f64, is_deleted: bool) {
        let broadcast = RegistryBroadcast {
            node_name: self.handle.chitchat_id().node_id.clone(),
            timestamp: now_millis(),
            service_name: service_name.to_string(),
            weight: if is_deleted { None } else { Some(weight) },
            is_deleted,
        };
        let chitchat = self.handle.chitchat();
        let mut guard = chitchat.lock().await;
        let key = format!("{SERVICE_KEY_PREFIX}{service_name}");
        let value = serde_json::to_string(&broadcast).unwrap_or_default();
        guard.self_node_state().set(&key, value);
    }

    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.handle.shutdown().await?;
        Ok(())
    }
}

async fn poll_loop(chitchat: Arc<Mutex<Chitchat>>, integration: GossipIntegration) {
    // chitchat keys node state by the full `ChitchatId` (node_id + generation
    // + advertise address), not just the node_id string, so the real ids
    // from `live_nodes()` have to be kept around for the `node_state` lookups
    // below rather than rebuilt from the bare name.
    let mut known_live: HashMap<String, ChitchatId> = HashMap::new();
    loop {
        tokio::time::sleep(POLL_INTERVAL).await;
        let guard = chitchat.lock().await;
        let live: HashMap<String, ChitchatId> =
            guard.live_nodes().map(|id| (id.node_id.clone(), id.clone())).collect();

        for (node_id, id) in &live {
            if known_live.contains_key(node_id) {
                continue;
            }
            let Some(state) = guard.node_state(id) else {
                continue;
            };
            if let Some(rpc_port_hex) = state.get(RPC_PORT_KEY) {
                if let Ok(metadata) = hex::decode(rpc_port_hex) {
                    let addr = id.gossip_advertise_addr.ip().to_string();
                    integration.on_notify_join_or_update(node_id, &addr, &metadata);
                }
            }
        }

        for node_id in known_live.keys() {
            if !live.contains_key(node_id) {
                integration.on_notify_leave(node_id);
            }
        }

        for id in live.values() {
            if let Some(state) = guard.node_state(id) {
                for (key, value) in state.key_values() {
                    if key.starts_with(SERVICE_KEY_PREFIX) {
                        if let Ok(broadcast) = serde_json::from_str::<RegistryBroadcast>(value) {
                            integration.on_notify_msg(&broadcast.encode_gossip_message());
                        }
                    }
                }
            }
        }

        known_live = live;
    }
}

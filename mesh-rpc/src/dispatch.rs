//! Outbound RPC Dispatch (§4.9): what happens when a script calls
//! `rpc.call`/`rpc.broadcast`.

use crate::proto::mesh_rpc_client::MeshRpcClient;
use crate::proto::{BroadcastRequest, CallRequest};
use futures::future::join_all;
use mesh_cluster::{weighted_random_pick, NodeDirectory, ServiceRegistry};
use mesh_common::{now_millis, MeshError, RpcRequest};
use mesh_correlator::ReplyCorrelator;
use mesh_inbox::Inbox;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Default)]
pub struct CallOptions {
    /// `Duration::ZERO` means no timeout (§3).
    pub timeout: Duration,
}

pub struct OutboundDispatcher {
    node_name: String,
    registry: Arc<ServiceRegistry>,
    directory: Arc<NodeDirectory>,
    inbox: Arc<Inbox>,
    correlator: Arc<ReplyCorrelator>,
}

impl OutboundDispatcher {
    pub fn new(
        node_name: impl Into<String>,
        registry: Arc<ServiceRegistry>,
        directory: Arc<NodeDirectory>,
        inbox: Arc<Inbox>,
        correlator: Arc<ReplyCorrelator>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            registry,
            directory,
            inbox,
            correlator,
        }
    }

    /// §4.9 steps 1-6.
    pub async fn call(&self, name: &str, body: Vec<u8>, options: CallOptions) -> Result<Vec<u8>, MeshError> {
        let id = if self.registry.local_weight(name).is_some() {
            self.route_loopback(name, body, options).await?
        } else {
            let candidates = self
                .registry
                .remote_nodes(name)
                .ok_or_else(|| MeshError::ServiceNotRegistered(name.to_string()))?;
            let node_name = weighted_random_pick(&candidates)
                .ok_or_else(|| MeshError::ServiceNotRegistered(name.to_string()))?
                .to_string();
            self.route_remote(&node_name, name, body, options).await?
        };

        self.await_reply(id, options.timeout).await
    }

    async fn route_loopback(
        &self,
        name: &str,
        body: Vec<u8>,
        options: CallOptions,
    ) -> Result<Uuid, MeshError> {
        let id = Uuid::new_v4();
        let record = RpcRequest {
            id,
            name: name.to_string(),
            body,
            timestamp: now_millis(),
            timeout: options.timeout.as_millis() as u64,
            origin_node: self.node_name.clone(),
            is_loopback: true,
        };
        self.inbox.put_persistent(&record).await?;
        Ok(id)
    }

    async fn route_remote(
        &self,
        node_name: &str,
        name: &str,
        body: Vec<u8>,
        options: CallOptions,
    ) -> Result<Uuid, MeshError> {
        let channel = self
            .directory
            .get(node_name)
            .ok_or_else(|| MeshError::NodeNotFound(node_name.to_string()))?;
        let mut client = MeshRpcClient::new(channel);
        let response = client
            .call(CallRequest {
                name: name.to_string(),
                body,
                timeout_milliseconds: options.timeout.as_millis() as u64,
                node_name: self.node_name.clone(),
            })
            .await
            .map_err(|status| MeshError::Transient(status.to_string()))?
            .into_inner();
        Uuid::parse_str(&response.id).map_err(|_| MeshError::Transient("malformed id from peer".into()))
    }

    async fn await_reply(&self, id: Uuid, timeout: Duration) -> Result<Vec<u8>, MeshError> {
        let rx = self.correlator.watch(id);
        let result = if timeout.is_zero() {
            rx.await.map_err(|_| MeshError::Transient("reply channel closed".into()))
        } else {
            match tokio::time::timeout(timeout, rx).await {
                Ok(inner) => inner.map_err(|_| MeshError::Transient("reply channel closed".into())),
                Err(_) => {
                    self.correlator.delete(&id);
                    return Err(MeshError::Timeout(timeout));
                }
            }
        }?;

        if result.is_error {
            Err(MeshError::ScriptFault(
                result.error_message().unwrap_or_default(),
            ))
        } else {
            Ok(result.result)
        }
    }

    /// §4.9 broadcast: fan out to every remote node hosting the service plus
    /// the local-registered path if applicable; await every id individually
    /// so one unresponsive peer can't stall the rest past its own timeout.
    pub async fn broadcast(
        &self,
        name: &str,
        body: Vec<u8>,
        options: CallOptions,
    ) -> Vec<Result<Vec<u8>, MeshError>> {
        let mut ids = Vec::new();

        if self.registry.local_weight(name).is_some() {
            let record = RpcRequest {
                id: Uuid::new_v4(),
                name: name.to_string(),
                body: body.clone(),
                timestamp: now_millis(),
                timeout: options.timeout.as_millis() as u64,
                origin_node: self.node_name.clone(),
                is_loopback: true,
            };
            ids.extend(self.inbox.broadcast(&record).await);
        }

        if let Some(candidates) = self.registry.remote_nodes(name) {
            for (node_name, _weight) in candidates {
                if let Some(channel) = self.directory.get(&node_name) {
                    let mut client = MeshRpcClient::new(channel);
                    let result = client
                        .broadcast(BroadcastRequest {
                            name: name.to_string(),
                            body: body.clone(),
                            timeout_milliseconds: options.timeout.as_millis() as u64,
                            node_name: self.node_name.clone(),
                        })
                        .await;
                    match result {
                        Ok(response) => {
                            for id in response.into_inner().id_lst {
                                if let Ok(id) = Uuid::parse_str(&id) {
                                    ids.push(id);
                                }
                            }
                        }
                        Err(status) => {
                            tracing::warn!(node = %node_name, error = %status, "broadcast fan-out to peer failed");
                        }
                    }
                }
            }
        }

        join_all(ids.into_iter().map(|id| self.await_reply(id, options.timeout))).await
    }
}

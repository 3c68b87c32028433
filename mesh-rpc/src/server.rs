//! §4.8 wire behaviour: accepts `Call`/`Broadcast`/`Reply`/`Debug` from
//! peers and routes them into the Inbox or the Reply Correlator. Neither
//! validates service existence — the caller already decided where to send
//! this (§4.9) — so a request for an unknown name is simply queued and the
//! consuming worker finds nobody registered to handle it.

use crate::proto::mesh_rpc_server::MeshRpc;
use crate::proto::{
    BroadcastRequest, BroadcastResponse, CallRequest, CallResponse, DebugRequest, DebugResponse,
    ReplyRequest, ReplyResponse,
};
use async_trait::async_trait;
use mesh_common::{now_millis, RpcRequest, RpcResponse};
use mesh_correlator::ReplyCorrelator;
use mesh_inbox::Inbox;
use std::sync::Arc;
use tonic::{Request, Response, Status};
use uuid::Uuid;

/// Out-of-band ops surface (`Debug` in §6). The concrete reload/loopback
/// behaviour is owned by the supervisor; this trait is the seam that keeps
/// that CLI-facing concern out of the core RPC transport (§1 non-goals).
#[async_trait]
pub trait DebugHandler: Send + Sync {
    async fn handle(&self, name: &str, body: Vec<u8>) -> Result<Vec<u8>, String>;
}

pub struct MeshRpcServer {
    node_name: String,
    inbox: Arc<Inbox>,
    correlator: Arc<ReplyCorrelator>,
    debug_handler: Arc<dyn DebugHandler>,
}

impl MeshRpcServer {
    pub fn new(
        node_name: impl Into<String>,
        inbox: Arc<Inbox>,
        correlator: Arc<ReplyCorrelator>,
        debug_handler: Arc<dyn DebugHandler>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            inbox,
            correlator,
            debug_handler,
        }
    }
}

#[async_trait]
impl MeshRpc for MeshRpcServer {
    async fn call(&self, request: Request<CallRequest>) -> Result<Response<CallResponse>, Status> {
        let req = request.into_inner();
        let id = Uuid::new_v4();
        let timestamp = now_millis();
        let record = RpcRequest {
            id,
            name: req.name,
            body: req.body,
            timestamp,
            timeout: req.timeout_milliseconds,
            origin_node: req.node_name,
            is_loopback: false,
        };
        self.inbox
            .put_persistent(&record)
            .await
            .map_err(|err| Status::internal(err.to_string()))?;

        Ok(Response::new(CallResponse {
            id: id.to_string(),
            timestamp_nano: timestamp * 1_000_000,
        }))
    }

    async fn broadcast(
        &self,
        request: Request<BroadcastRequest>,
    ) -> Result<Response<BroadcastResponse>, Status> {
        let req = request.into_inner();
        let timestamp = now_millis();
        let record = RpcRequest {
            id: Uuid::new_v4(),
            name: req.name,
            body: req.body,
            timestamp,
            timeout: req.timeout_milliseconds,
            origin_node: req.node_name,
            is_loopback: false,
        };
        let ids = self.inbox.broadcast(&record).await;

        Ok(Response::new(BroadcastResponse {
            id_lst: ids.iter().map(Uuid::to_string).collect(),
            timestamp_nano: timestamp * 1_000_000,
        }))
    }

    async fn reply(&self, request: Request<ReplyRequest>) -> Result<Response<ReplyResponse>, Status> {
        let req = request.into_inner();
        let id = Uuid::parse_str(&req.id).map_err(|_| Status::invalid_argument("malformed id"))?;
        self.correlator.insert(RpcResponse {
            id,
            result: req.result,
            timestamp: req.timestamp_nano / 1_000_000,
            origin_node: self.node_name.clone(),
            is_error: req.is_error,
        });
        Ok(Response::new(ReplyResponse {}))
    }

    async fn debug(&self, request: Request<DebugRequest>) -> Result<Response<DebugResponse>, Status> {
        let req = request.into_inner();
        match self.debug_handler.handle(&req.name, req.body).await {
            Ok(body) => Ok(Response::new(DebugResponse { body })),
            Err(err) => Err(Status::internal(err)),
        }
    }
}

//! Worker Lifecycle (§4.10): one worker is one Lua interpreter plus its own
//! [`ExecutionContext`], consuming one Inbox consumer channel and dispatching
//! inbound requests into script-registered handlers.

use crate::bridge::{self, BridgeContext, ServiceTable};
use mesh_cluster::{GossipTransport, NodeDirectory, ServiceRegistry};
use mesh_common::{now_millis, MeshError, RpcRequest, RpcResponse};
use mesh_correlator::ReplyCorrelator;
use mesh_exec::{ErrorSink, ExecutionContext, ExecutionContextConfig, InterpreterTask};
use mesh_inbox::Inbox;
use mesh_listener::ListenerManager;
use mesh_rpc::proto::mesh_rpc_client::MeshRpcClient;
use mesh_rpc::proto::ReplyRequest;
use mesh_rpc::OutboundDispatcher;
use mlua::Lua;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Shared, compiled-once script source (§4.10 "compile once"). `mlua` has no
/// portable precompiled-bytecode handle across a `Lua` instance boundary that
/// doesn't itself require a VM, so "compile once" here means: load and parse
/// the source once into this struct, then every worker's fresh `Lua` loads
/// the same immutable source string into its own chunk.
#[derive(Clone)]
pub struct CompiledScript {
    pub source: Arc<str>,
    pub chunk_name: Arc<str>,
}

impl CompiledScript {
    pub fn compile(source: impl Into<Arc<str>>, chunk_name: impl Into<Arc<str>>) -> mlua::Result<Self> {
        let source = source.into();
        let chunk_name: Arc<str> = chunk_name.into();
        // Validate it parses before committing to spawning N workers on it.
        let probe = Lua::new();
        probe
            .load(source.as_ref())
            .set_name(chunk_name.as_ref())
            .into_function()?;
        Ok(Self { source, chunk_name })
    }
}

pub struct WorkerContext {
    pub node_name: String,
    pub registry: Arc<ServiceRegistry>,
    pub directory: Arc<NodeDirectory>,
    pub inbox: Arc<Inbox>,
    pub correlator: Arc<ReplyCorrelator>,
    pub listeners: Arc<ListenerManager>,
    pub gossip: Option<Arc<GossipTransport>>,
    pub ec_config: ExecutionContextConfig,
}

pub struct Worker {
    pub id: usize,
    ec: Arc<ExecutionContext<Lua>>,
    exit: CancellationToken,
    services: ServiceTable,
}

impl Worker {
    /// §4.10 Load, steps 1-5 for a single worker.
    pub async fn spawn(
        id: usize,
        script: CompiledScript,
        ctx: Arc<WorkerContext>,
    ) -> Result<Self, MeshError> {
        // Step 1: fresh interpreter and EC.
        let error_sink: ErrorSink = {
            let node_name = ctx.node_name.clone();
            Arc::new(move |err| tracing::error!(node = %node_name, worker = id, %err, "unhandled worker error"))
        };
        let lua = Lua::new();
        let ec = Arc::new(ExecutionContext::start(ctx.ec_config.clone(), lua, error_sink));

        // Step 3: open extension modules (rpc/service) against this EC.
        let dispatcher = Arc::new(OutboundDispatcher::new(
            ctx.node_name.clone(),
            ctx.registry.clone(),
            ctx.directory.clone(),
            ctx.inbox.clone(),
            ctx.correlator.clone(),
        ));
        let services = ServiceTable::default();
        let bridge_ctx = BridgeContext {
            ec: ec.clone(),
            dispatcher: dispatcher.clone(),
            registry: ctx.registry.clone(),
            gossip: ctx.gossip.clone(),
            services: services.clone(),
            listeners: ctx.listeners.clone(),
        };
        let install_result = ec
            .call_interpreter(InterpreterTask::Scoped(Box::new(move |lua: &Lua| {
                bridge::install(lua, bridge_ctx).map_err(|err| MeshError::ScriptFault(err.to_string()))
            })))
            .await;
        install_result?;

        // Step 4: invoke the compiled main once.
        let main_script = script.clone();
        let (main_tx, main_rx) = tokio::sync::oneshot::channel();
        ec.call_interpreter(InterpreterTask::Protected(
            Box::new(move |lua: &Lua| {
                lua.load(main_script.source.as_ref())
                    .set_name(main_script.chunk_name.as_ref())
                    .exec()
                    .map_err(|err| MeshError::ScriptFault(err.to_string()))
            }),
            Box::new(move |err| {
                let _ = main_tx.send(err);
            }),
        ))
        .await?;
        // The protected handler sends only on failure; on success it (and
        // the sender it owns) is simply dropped once the task completes, so
        // a closed channel with no value is the success case.
        if let Ok(err) = main_rx.await {
            return Err(err);
        }

        // Step 2: this worker's inbox consumer channel.
        let consumer = ctx.inbox.new_consumer(id);
        let exit = ec.exit_signal();
        tokio::spawn(dispatch_loop(
            id,
            ec.clone(),
            services.clone(),
            consumer,
            ctx.clone(),
        ));

        Ok(Self {
            id,
            ec,
            exit,
            services,
        })
    }

    /// §4.10 Stop, per-worker half: signal exit and wait for the EC to
    /// finish tearing down (Listener Manager / Inbox / Registry cleanup is
    /// the supervisor's responsibility since those are shared, not owned by
    /// one worker).
    pub async fn shutdown(self) {
        self.services.clear();
        self.exit.cancel();
        self.ec.close().await;
    }
}

/// Pulls inbound requests off this worker's inbox channel and dispatches
/// each one to its registered handler, replying either through the local
/// correlator (loopback) or the originating peer's `Reply` RPC (remote).
async fn dispatch_loop(
    worker_id: usize,
    ec: Arc<ExecutionContext<Lua>>,
    services: ServiceTable,
    mut consumer: mpsc::Receiver<RpcRequest>,
    ctx: Arc<WorkerContext>,
) {
    while let Some(request) = consumer.recv().await {
        if request.is_expired_at(now_millis()) {
            tracing::debug!(worker = worker_id, id = %request.id, "dropping expired request at dispatch");
            continue;
        }
        let Some(key) = services.get(&request.name) else {
            tracing::debug!(worker = worker_id, service = %request.name, "no handler registered for service");
            continue;
        };
        let request_id = request.id;
        let origin_node = request.origin_node.clone();
        let is_loopback = request.is_loopback;
        let body = request.body.clone();

        let ctx_for_ok = ctx.clone();
        let origin_node_for_ok = origin_node.clone();
        let ctx_for_err = ctx.clone();

        let outcome = ec
            .call_interpreter(InterpreterTask::Protected(
                Box::new(move |lua: &Lua| {
                    let result = bridge::invoke_handler(lua, &key, &body);
                    deliver_reply(ctx_for_ok, request_id, &origin_node_for_ok, is_loopback, result);
                    Ok(())
                }),
                Box::new(move |err| {
                    deliver_reply(ctx_for_err, request_id, &origin_node, is_loopback, Err(err));
                }),
            ))
            .await;
        if let Err(err) = outcome {
            tracing::warn!(worker = worker_id, %err, "failed to enqueue handler invocation");
        }
    }
}

fn deliver_reply(
    ctx: Arc<WorkerContext>,
    id: uuid::Uuid,
    origin_node: &str,
    is_loopback: bool,
    result: Result<Vec<u8>, MeshError>,
) {
    let response = match result {
        Ok(body) => RpcResponse::ok(id, ctx.node_name.clone(), body),
        Err(err) => RpcResponse::error(id, ctx.node_name.clone(), err.into_script_message()),
    };

    if is_loopback {
        ctx.correlator.insert(response);
        return;
    }

    let origin_node = origin_node.to_string();
    tokio::spawn(async move {
        let Some(channel) = ctx.directory.get(&origin_node) else {
            tracing::warn!(node = %origin_node, "cannot deliver reply, peer not in directory");
            return;
        };
        let mut client = MeshRpcClient::new(channel);
        let request = ReplyRequest {
            id: response.id.to_string(),
            result: response.result,
            timestamp_nano: response.timestamp * 1_000_000,
            is_error: response.is_error,
        };
        if let Err(err) = client.reply(request).await {
            tracing::warn!(node = %origin_node, %err, "reply delivery to origin peer failed");
        }
    });
}

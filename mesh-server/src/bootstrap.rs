//! Wires a loaded [`mesh_common::config::NodeConfig`] into a running node:
//! the shared components every worker's [`mesh_worker::WorkerContext`]
//! needs, the gossip transport, and the gRPC surface.

use mesh_cluster::{GossipIntegration, GossipTransport, NodeDirectory, ServiceRegistry};
use mesh_common::config::NodeConfig;
use mesh_correlator::ReplyCorrelator;
use mesh_exec::ExecutionContextConfig;
use mesh_inbox::Inbox;
use mesh_listener::ListenerManager;
use mesh_rpc::{DebugHandler, MeshRpcServer};
use mesh_worker::{Supervisor, WorkerContext};
use std::sync::Arc;

/// Everything a running node owns. Held by `main` for the lifetime of the
/// process; `Supervisor` is handed the script to run once the caller decides
/// to `load`.
pub struct Node {
    pub config: NodeConfig,
    pub registry: Arc<ServiceRegistry>,
    pub directory: Arc<NodeDirectory>,
    pub inbox: Arc<Inbox>,
    pub correlator: Arc<ReplyCorrelator>,
    pub listeners: Arc<ListenerManager>,
    pub gossip: Option<Arc<GossipTransport>>,
    pub supervisor: Arc<Supervisor>,
}

impl Node {
    pub async fn start(config: NodeConfig) -> anyhow::Result<Self> {
        let registry = Arc::new(ServiceRegistry::new());
        let directory = Arc::new(NodeDirectory::new());
        let inbox = Arc::new(Inbox::open(&config.queue.inbox_dir()).await?);
        let correlator = Arc::new(ReplyCorrelator::new());
        let listeners = Arc::new(ListenerManager::new());

        let integration = GossipIntegration::new(config.node_name.clone(), registry.clone(), directory.clone());
        let gossip = GossipTransport::start(&config.node_name, &config.gossip, config.rpc.port, integration)
            .await
            .map(Arc::new)
            .ok();
        if gossip.is_none() {
            tracing::warn!("gossip transport failed to start, running without cluster discovery");
        }

        let worker_ctx = Arc::new(WorkerContext {
            node_name: config.node_name.clone(),
            registry: registry.clone(),
            directory: directory.clone(),
            inbox: inbox.clone(),
            correlator: correlator.clone(),
            listeners: listeners.clone(),
            gossip: gossip.clone(),
            ec_config: ExecutionContextConfig::default(),
        });
        let supervisor = Arc::new(Supervisor::new(worker_ctx, registry.clone(), config.concurrency));

        Ok(Self {
            config,
            registry,
            directory,
            inbox,
            correlator,
            listeners,
            gossip,
            supervisor,
        })
    }

    /// Starts the node's gRPC surface (§4.8) in the background; returns
    /// immediately, the server keeps running on its own spawned task.
    pub fn spawn_rpc_server(&self) {
        let addr = self.config.rpc.socket_addr();
        let node_name = self.config.node_name.clone();
        let inbox = self.inbox.clone();
        let correlator = self.correlator.clone();
        let supervisor = self.supervisor.clone();

        tokio::spawn(async move {
            let debug_handler: Arc<dyn DebugHandler> = Arc::new(SupervisorDebugHandler { supervisor });
            let rpc_server = MeshRpcServer::new(node_name, inbox, correlator, debug_handler);

            let (mut health_reporter, health_service) = tonic_health::server::health_reporter();
            health_reporter
                .set_serving::<mesh_rpc::proto::mesh_rpc_server::MeshRpcServer<MeshRpcServer>>()
                .await;

            let reflection_service = tonic_reflection::server::Builder::configure()
                .register_encoded_file_descriptor_set(mesh_rpc::proto::FILE_DESCRIPTOR_SET)
                .build()
                .expect("failed to build reflection service");

            let result = tonic::transport::Server::builder()
                .add_service(reflection_service)
                .add_service(health_service)
                .add_service(mesh_rpc::proto::mesh_rpc_server::MeshRpcServer::new(rpc_server))
                .serve(addr)
                .await;
            if let Err(err) = result {
                tracing::error!(%err, "rpc server exited");
            }
        });
    }
}

/// Routes `Debug` RPCs (§6) into the supervisor's loopback call path, the
/// same path the `debug call` CLI subcommand uses locally.
struct SupervisorDebugHandler {
    supervisor: Arc<Supervisor>,
}

#[async_trait::async_trait]
impl DebugHandler for SupervisorDebugHandler {
    /// `name == "reload"` carries `{timeout_seconds, script}` as its JSON
    /// body; any other name is treated as `call:<service>` per the CLI
    /// encoding in `main.rs`'s `debug call` subcommand.
    async fn handle(&self, name: &str, body: Vec<u8>) -> Result<Vec<u8>, String> {
        if name == "reload" {
            #[derive(serde::Deserialize)]
            struct ReloadBody {
                timeout_seconds: u64,
                script: String,
            }
            let parsed: ReloadBody = serde_json::from_slice(&body).map_err(|err| err.to_string())?;
            self.supervisor
                .reload(parsed.script, std::time::Duration::from_secs(parsed.timeout_seconds))
                .await
                .map_err(|err| err.into_script_message())?;
            return Ok(b"reloaded".to_vec());
        }

        let service_name = name.strip_prefix("call:").unwrap_or(name);
        self.supervisor
            .call_local(service_name, body)
            .await
            .map_err(|err| err.into_script_message())
    }
}

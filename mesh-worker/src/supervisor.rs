//! The Supervisor (§4.10 J): compiles the script once, spawns N workers,
//! and arbitrates Load/Stop/Reload so only one reload is ever in flight.

use crate::worker::{CompiledScript, Worker, WorkerContext};
use mesh_cluster::ServiceRegistry;
use mesh_common::MeshError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum SupervisorState {
    Stopped,
    Running,
}

pub struct Supervisor {
    ctx: Arc<WorkerContext>,
    registry: Arc<ServiceRegistry>,
    worker_count: usize,
    // The single-flight guard: held for the duration of a whole Load, Stop,
    // or Reload, so a second caller blocks rather than racing the first.
    guard: Mutex<SupervisorState>,
    workers: Mutex<Vec<Worker>>,
}

impl Supervisor {
    pub fn new(ctx: Arc<WorkerContext>, registry: Arc<ServiceRegistry>, worker_count: usize) -> Self {
        Self {
            ctx,
            registry,
            worker_count: worker_count.max(1),
            guard: Mutex::new(SupervisorState::Stopped),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// §4.10 Load: compile once, spawn N workers from the same source.
    pub async fn load(&self, script_source: impl Into<Arc<str>>) -> Result<(), MeshError> {
        let mut state = self.guard.lock().await;
        if *state == SupervisorState::Running {
            return Err(MeshError::ReloadInProgress);
        }

        let script = CompiledScript::compile(script_source, "main")
            .map_err(|err| MeshError::ScriptFault(err.to_string()))?;

        let mut spawned = Vec::with_capacity(self.worker_count);
        for id in 0..self.worker_count {
            let worker = Worker::spawn(id, script.clone(), self.ctx.clone()).await?;
            spawned.push(worker);
        }

        *self.workers.lock().await = spawned;
        *state = SupervisorState::Running;
        Ok(())
    }

    /// §4.10 Stop: signal every worker's exit channel with `timeout`, wait
    /// for all of them or the timeout, whichever comes first, then reset the
    /// shared components and announce every local service as deleted.
    pub async fn stop(&self, timeout: Duration) -> Result<(), MeshError> {
        let mut state = self.guard.lock().await;
        if *state == SupervisorState::Stopped {
            return Ok(());
        }

        let workers = std::mem::take(&mut *self.workers.lock().await);
        let shutdown_all = async {
            for worker in workers {
                worker.shutdown().await;
            }
        };
        if tokio::time::timeout(timeout, shutdown_all).await.is_err() {
            tracing::warn!(?timeout, "worker stop timeout elapsed, proceeding forcibly");
        }

        self.ctx.listeners.reset().await;
        self.ctx.inbox.reset();
        self.ctx.correlator.clear();

        let local_services: Vec<String> = self.registry.local_state(&self.ctx.node_name, 0).into_iter().map(|b| b.service_name).collect();
        self.registry.clear_local();
        if let Some(gossip) = &self.ctx.gossip {
            for service_name in local_services {
                gossip.publish_local_service(&service_name, 0.0, true).await;
            }
        }

        *state = SupervisorState::Stopped;
        Ok(())
    }

    /// §4.10 Reload: Stop then Load. Each half independently acquires and
    /// releases the single-flight guard, so this is "approximately"
    /// single-flight: a concurrent `load`/`stop`/`reload` call can still
    /// slip in between the two halves rather than being blocked for the
    /// whole sequence (see DESIGN.md's Open Question resolution).
    pub async fn reload(&self, script_source: impl Into<Arc<str>>, stop_timeout: Duration) -> Result<(), MeshError> {
        self.stop(stop_timeout).await?;
        self.load(script_source).await
    }

    pub async fn worker_count(&self) -> usize {
        self.workers.lock().await.len()
    }

    /// Loopback-invoke a locally-registered service, bypassing the RPC
    /// transport entirely. Backs the `debug call` CLI subcommand (§6).
    pub async fn call_local(&self, name: &str, body: Vec<u8>) -> Result<Vec<u8>, MeshError> {
        self.registry
            .local_weight(name)
            .ok_or_else(|| MeshError::ServiceNotRegistered(name.to_string()))?;
        let id = uuid::Uuid::new_v4();
        let record = mesh_common::RpcRequest {
            id,
            name: name.to_string(),
            body,
            timestamp: mesh_common::now_millis(),
            timeout: 10_000,
            origin_node: self.ctx.node_name.clone(),
            is_loopback: true,
        };
        let rx = self.ctx.correlator.watch(id);
        self.ctx.inbox.put_persistent(&record).await?;
        let response = tokio::time::timeout(Duration::from_secs(10), rx)
            .await
            .map_err(|_| MeshError::Timeout(Duration::from_secs(10)))?
            .map_err(|_| MeshError::Transient("reply channel closed".into()))?;
        if response.is_error {
            Err(MeshError::ScriptFault(response.error_message().unwrap_or_default()))
        } else {
            Ok(response.result)
        }
    }
}

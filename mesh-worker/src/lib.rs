//! Worker Lifecycle and Supervisor (§4.10): the topmost layer that turns a
//! script source into N running workers, each with its own interpreter and
//! [`mesh_exec::ExecutionContext`], and arbitrates Load/Stop/Reload.

mod bridge;
mod supervisor;
mod worker;

pub use bridge::ServiceTable;
pub use supervisor::Supervisor;
pub use worker::{CompiledScript, Worker, WorkerContext};

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_cluster::{NodeDirectory, ServiceRegistry};
    use mesh_correlator::ReplyCorrelator;
    use mesh_exec::ExecutionContextConfig;
    use mesh_inbox::Inbox;
    use mesh_listener::ListenerManager;
    use std::sync::Arc;
    use std::time::Duration;

    async fn test_context() -> Arc<WorkerContext> {
        let dir = tempfile::tempdir().unwrap();
        let inbox = Arc::new(Inbox::open(dir.path()).await.unwrap());
        Arc::new(WorkerContext {
            node_name: "node-test".to_string(),
            registry: Arc::new(ServiceRegistry::new()),
            directory: Arc::new(NodeDirectory::new()),
            inbox,
            correlator: Arc::new(ReplyCorrelator::new()),
            listeners: Arc::new(ListenerManager::new()),
            gossip: None,
            ec_config: ExecutionContextConfig::default(),
        })
    }

    #[tokio::test]
    async fn load_registers_local_service_and_call_local_round_trips() {
        let ctx = test_context().await;
        let registry = ctx.registry.clone();
        let supervisor = Supervisor::new(ctx, registry, 1);

        let script = r#"
            service.register("echo", 1.0, function(body)
                return body
            end)
        "#;
        supervisor.load(script).await.unwrap();
        assert_eq!(supervisor.worker_count().await, 1);

        let result = supervisor.call_local("echo", b"\"hi\"".to_vec()).await.unwrap();
        assert_eq!(result, b"\"hi\"");

        supervisor.stop(Duration::from_secs(1)).await.unwrap();
        assert_eq!(supervisor.worker_count().await, 0);
    }

    /// §8 scenario 1 ("local loopback call"): `rpc.call("echo", "hi")`
    /// must deliver the callback `(nil, "hi")`, not `(nil, nil)` — the body
    /// has to round-trip through the same JSON value mapping the
    /// handler/reply path uses, not be shipped as a raw, unparsed string.
    #[tokio::test]
    async fn rpc_call_round_trips_a_plain_string_body() {
        let ctx = test_context().await;
        let registry = ctx.registry.clone();
        let supervisor = Supervisor::new(ctx, registry, 1);

        let script = r#"
            local last_result = nil
            local last_err = nil
            service.register("echo", 1.0, function(body) return body end)
            service.register("peek", 1.0, function(body)
                return { result = last_result, err = last_err }
            end)
            rpc.call("echo", "hi", { callback = function(err, result)
                last_err = err
                last_result = result
            end })
        "#;
        supervisor.load(script).await.unwrap();

        let mut peeked = None;
        for _ in 0..50 {
            let body = supervisor.call_local("peek", b"null".to_vec()).await.unwrap();
            let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
            if !value["result"].is_null() {
                peeked = Some(value);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let peeked = peeked.expect("rpc.call callback never fired");
        assert_eq!(peeked["result"], serde_json::json!("hi"));
        assert!(peeked["err"].is_null());

        supervisor.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn call_local_on_unregistered_service_fails() {
        let ctx = test_context().await;
        let registry = ctx.registry.clone();
        let supervisor = Supervisor::new(ctx, registry, 1);
        supervisor.load("-- no services").await.unwrap();

        let result = supervisor.call_local("missing", vec![]).await;
        assert!(result.is_err());
        supervisor.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn reload_replaces_the_running_script() {
        let ctx = test_context().await;
        let registry = ctx.registry.clone();
        let supervisor = Supervisor::new(ctx, registry, 1);

        supervisor
            .load(r#"service.register("v1", 1.0, function(b) return "one" end)"#)
            .await
            .unwrap();
        supervisor
            .reload(
                r#"service.register("v2", 1.0, function(b) return "two" end)"#,
                Duration::from_secs(1),
            )
            .await
            .unwrap();

        assert!(supervisor.call_local("v1", vec![]).await.is_err());
        let result = supervisor.call_local("v2", b"null".to_vec()).await.unwrap();
        assert_eq!(result, b"\"two\"");
        supervisor.stop(Duration::from_secs(1)).await.unwrap();
    }
}

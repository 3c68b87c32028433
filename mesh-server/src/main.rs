mod bootstrap;

use bootstrap::Node;
use clap::{Parser, Subcommand};
use mesh_common::config::ConfigLoader;
use mesh_common::tracing_config::TracingConfig;
use mesh_common::SafeDisplay;
use mesh_rpc::proto::mesh_rpc_client::MeshRpcClient;
use mesh_rpc::proto::DebugRequest;
use std::time::Duration;

/// Operator CLI (§6): run a node, or send a debug command to one already
/// running.
#[derive(Parser)]
#[command(name = "mesh-server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Starts a node and loads `script_file` into its worker pool.
    Server {
        config_file: String,
        script_file: String,
    },
    /// Sends an out-of-band command to a running node's gRPC endpoint.
    Debug {
        remote_rpc_address: String,
        #[command(subcommand)]
        action: DebugAction,
    },
}

#[derive(Subcommand)]
enum DebugAction {
    /// Stops the remote node's workers with the given graceful timeout, then
    /// reloads the script at `script_file`.
    Reload {
        timeout_seconds: u64,
        script_file: String,
    },
    /// Loopback-invokes a locally-registered service on the remote node.
    Call { name: String, json_body: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Server {
            config_file,
            script_file,
        } => run_server(config_file, script_file).await,
        Command::Debug {
            remote_rpc_address,
            action,
        } => run_debug(remote_rpc_address, action).await,
    }
}

async fn run_server(config_file: String, script_file: String) -> anyhow::Result<()> {
    let config = ConfigLoader::new(&config_file).load()?;
    TracingConfig::local_dev("mesh-server").init();
    tracing::info!(config = %config.to_safe_string(), "starting node");

    let node = Node::start(config).await?;
    node.spawn_rpc_server();

    let script = tokio::fs::read_to_string(&script_file).await?;
    node.supervisor.load(script).await?;
    tracing::info!(workers = node.supervisor.worker_count().await, "script loaded");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, stopping workers");
    node.supervisor.stop(Duration::from_secs(10)).await?;
    Ok(())
}

async fn run_debug(remote_rpc_address: String, action: DebugAction) -> anyhow::Result<()> {
    let endpoint = format!("http://{remote_rpc_address}");
    let mut client = MeshRpcClient::connect(endpoint).await?;

    let (name, body) = match action {
        DebugAction::Reload {
            timeout_seconds,
            script_file,
        } => {
            let script = tokio::fs::read_to_string(&script_file).await?;
            let request = serde_json::json!({
                "timeout_seconds": timeout_seconds,
                "script": script,
            });
            ("reload".to_string(), serde_json::to_vec(&request)?)
        }
        DebugAction::Call { name, json_body } => {
            let parsed: serde_json::Value = serde_json::from_str(&json_body)?;
            (format!("call:{name}"), serde_json::to_vec(&parsed)?)
        }
    };

    let response = client.debug(DebugRequest { name, body }).await?.into_inner();
    println!("{}", String::from_utf8_lossy(&response.body));
    Ok(())
}

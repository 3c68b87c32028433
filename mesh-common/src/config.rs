use crate::SafeDisplay;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Loads a config type by layering, in increasing priority: the type's own
/// [`Default`], a TOML file, then environment variables prefixed
/// `MESH__<SECTION>__<KEY>`. Mirrors the merge order used by the teacher's
/// `ConfigLoader` (default < file < env).
pub struct ConfigLoader {
    pub config_file_name: PathBuf,
}

impl ConfigLoader {
    pub fn new(config_file_name: impl Into<PathBuf>) -> Self {
        Self {
            config_file_name: config_file_name.into(),
        }
    }

    pub fn load<T>(&self) -> figment::Result<T>
    where
        T: Default + Serialize + for<'de> Deserialize<'de>,
    {
        Figment::from(Serialized::defaults(T::default()))
            .merge(Toml::file(&self.config_file_name))
            .merge(Env::prefixed("MESH__").split("__"))
            .extract()
    }
}

/// Top-level node configuration (§6 Configuration).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_name: String,
    pub gossip: GossipConfig,
    pub rpc: RpcConfig,
    pub concurrency: usize,
    pub queue: QueueConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_name: "node-1".to_string(),
            gossip: GossipConfig::default(),
            rpc: RpcConfig::default(),
            concurrency: 4,
            queue: QueueConfig::default(),
        }
    }
}

impl SafeDisplay for NodeConfig {
    fn to_safe_string(&self) -> String {
        format!(
            "node_name: {}\ngossip:\n{}\nrpc:\n{}\nconcurrency: {}\nqueue:\n{}",
            self.node_name,
            self.gossip.to_safe_string_indented(),
            self.rpc.to_safe_string_indented(),
            self.concurrency,
            self.queue.to_safe_string_indented(),
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GossipConfig {
    pub addr: String,
    pub port: u16,
    pub gossip_secret_key: Option<String>,
    pub seed_nodes: Vec<String>,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0".to_string(),
            port: 7946,
            gossip_secret_key: None,
            seed_nodes: Vec::new(),
        }
    }
}

impl SafeDisplay for GossipConfig {
    fn to_safe_string(&self) -> String {
        format!(
            "addr: {}\nport: {}\nencrypted: {}\nseed_nodes: {:?}",
            self.addr,
            self.port,
            self.gossip_secret_key.is_some(),
            self.seed_nodes,
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcConfig {
    pub addr: String,
    pub port: u16,
    pub reply_concurrency: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0".to_string(),
            port: 9090,
            reply_concurrency: 8,
        }
    }
}

impl SafeDisplay for RpcConfig {
    fn to_safe_string(&self) -> String {
        format!(
            "addr: {}\nport: {}\nreply_concurrency: {}",
            self.addr, self.port, self.reply_concurrency
        )
    }
}

impl RpcConfig {
    pub fn socket_addr(&self) -> std::net::SocketAddr {
        format!("{}:{}", self.addr, self.port)
            .parse()
            .expect("invalid rpc addr/port")
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueConfig {
    pub dir: PathBuf,
    pub max_bytes_per_file: u64,
    pub max_msg_size: u64,
    pub sync_every: usize,
    #[serde(with = "humantime_serde")]
    pub sync_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data/queue"),
            max_bytes_per_file: 100 * 1024 * 1024,
            max_msg_size: 1024 * 1024,
            sync_every: 2500,
            sync_timeout: Duration::from_secs(2),
        }
    }
}

impl SafeDisplay for QueueConfig {
    fn to_safe_string(&self) -> String {
        format!(
            "dir: {}\nmax_bytes_per_file: {}\nmax_msg_size: {}\nsync_every: {}\nsync_timeout: {:?}",
            self.dir.display(),
            self.max_bytes_per_file,
            self.max_msg_size,
            self.sync_every,
            self.sync_timeout,
        )
    }
}

impl QueueConfig {
    pub fn inbox_dir(&self) -> PathBuf {
        self.dir.join("inbox")
    }

    pub fn outbox_dir(&self) -> PathBuf {
        self.dir.join("outbox")
    }
}

pub fn config_example_path() -> &'static Path {
    Path::new("mesh.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_figment_with_no_file() {
        let loader = ConfigLoader::new("/nonexistent/mesh.toml");
        let cfg: NodeConfig = loader.load().expect("defaults must load even without a file");
        assert_eq!(cfg.concurrency, 4);
        assert_eq!(cfg.rpc.port, 9090);
    }
}

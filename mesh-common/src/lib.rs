//! Shared types used by every component of the mesh runtime.

pub mod config;
pub mod error;
pub mod record;
pub mod tracing_config;
pub mod value;

pub use error::{MeshError, MeshResult};
pub use record::{RpcRequest, RpcResponse};
pub use value::Value;

/// Types that can render themselves without leaking secrets (access tokens,
/// gossip keys) into logs.
pub trait SafeDisplay {
    fn to_safe_string(&self) -> String;

    fn to_safe_string_indented(&self) -> String {
        self.to_safe_string()
            .lines()
            .map(|line| format!("  {line}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Milliseconds since the Unix epoch, used throughout the RPC and gossip wire
/// formats.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

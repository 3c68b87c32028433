use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The internal RPC request record (§3). Written to the durable Inbox for
/// unicast calls, or fanned directly to consumers for broadcasts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: Uuid,
    pub name: String,
    pub body: Vec<u8>,
    pub timestamp: i64,
    /// Milliseconds. `0` means no timeout.
    pub timeout: u64,
    pub origin_node: String,
    pub is_loopback: bool,
}

impl RpcRequest {
    /// `expires_at = timestamp + timeout`, or `None` when `timeout == 0`
    /// (§3 "no timeout").
    pub fn expires_at(&self) -> Option<i64> {
        if self.timeout == 0 {
            None
        } else {
            Some(self.timestamp + self.timeout as i64)
        }
    }

    pub fn is_expired_at(&self, now_millis: i64) -> bool {
        matches!(self.expires_at(), Some(expiry) if expiry < now_millis)
    }
}

/// The internal RPC response record (§3). `result` carries the UTF-8 error
/// message when `is_error` is set.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: Uuid,
    pub result: Vec<u8>,
    pub timestamp: i64,
    pub origin_node: String,
    pub is_error: bool,
}

impl RpcResponse {
    pub fn ok(id: Uuid, origin_node: impl Into<String>, result: Vec<u8>) -> Self {
        Self {
            id,
            result,
            timestamp: crate::now_millis(),
            origin_node: origin_node.into(),
            is_error: false,
        }
    }

    pub fn error(id: Uuid, origin_node: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id,
            result: message.into().into_bytes(),
            timestamp: crate::now_millis(),
            origin_node: origin_node.into(),
            is_error: true,
        }
    }

    pub fn error_message(&self) -> Option<String> {
        self.is_error
            .then(|| String::from_utf8_lossy(&self.result).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timeout_never_expires() {
        let req = RpcRequest {
            id: Uuid::nil(),
            name: "x".into(),
            body: vec![],
            timestamp: 0,
            timeout: 0,
            origin_node: "n".into(),
            is_loopback: false,
        };
        assert!(!req.is_expired_at(i64::MAX));
    }

    #[test]
    fn nonzero_timeout_expires_after_deadline() {
        let req = RpcRequest {
            id: Uuid::nil(),
            name: "x".into(),
            body: vec![],
            timestamp: 1_000,
            timeout: 100,
            origin_node: "n".into(),
            is_loopback: false,
        };
        assert!(!req.is_expired_at(1_099));
        assert!(req.is_expired_at(1_101));
    }
}

use thiserror::Error;

/// Error taxonomy for the runtime. The variant chosen at the point of failure
/// decides how far the error propagates (§7): transient errors stay local,
/// protocol errors surface to the calling script, fatal errors abort the
/// process.
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("service not registered: {0}")]
    ServiceNotRegistered(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("peer vanished: {0}")]
    PeerVanished(String),

    #[error("reload already in progress")]
    ReloadInProgress,

    #[error("script fault: {0}")]
    ScriptFault(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl MeshError {
    /// Errors in this taxonomy are surfaced to the script boundary as plain
    /// strings (§7 "User-visible behaviour") rather than unwound as panics.
    pub fn into_script_message(self) -> String {
        self.to_string()
    }
}

pub type MeshResult<T> = Result<T, MeshError>;

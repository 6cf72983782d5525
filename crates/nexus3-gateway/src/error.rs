//! Gateway error kinds: everything the Agent Pool, RPC Dispatcher and HTTP
//! Server can fail with, plus the JSON-RPC error-code mapping (§4.13).

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("agent already exists: {0}")]
    AgentAlreadyExists(String),

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("invalid agent id: {0}")]
    InvalidAgentId(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("a NEXUS3 server is already listening on this port")]
    AlreadyRunning,

    #[error("port is held by an unrelated service")]
    PortInUse,

    #[error(transparent)]
    Session(#[from] nexus3_session::SessionError),

    #[error(transparent)]
    Core(#[from] nexus3_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// JSON-RPC 2.0 standard codes plus a reserved application range
/// (-32000..-32099) for domain errors, per §4.13.
impl GatewayError {
    pub fn rpc_code(&self) -> i64 {
        match self {
            GatewayError::UnknownMethod(_) => -32601,
            GatewayError::InvalidParams(_) => -32602,
            GatewayError::PermissionDenied(_) => -32000,
            GatewayError::AgentNotFound(_) => -32001,
            GatewayError::AgentAlreadyExists(_) => -32002,
            GatewayError::InvalidAgentId(_) => -32003,
            GatewayError::AlreadyRunning | GatewayError::PortInUse => -32004,
            _ => -32603,
        }
    }
}

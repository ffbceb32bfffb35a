use crate::lifecycle::LifecycleError;
use mcplink_jsonrpc::transport::TransportError;
use mcplink_jsonrpc::{ErrorObject, JsonRpcError, PendingError, RateLimited, RequestId};
use std::time::Duration;

/// Request received before the handshake completed (or after shutdown)
pub const NOT_INITIALIZED: i32 = -32002;

/// Default code for requests turned away by a rate limiter
pub const RATE_LIMITED: i32 = -32001;

/// Failure of a request this side sent to its peer.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("Request {id} timed out after {timeout:?}")]
    Timeout { id: RequestId, timeout: Duration },

    #[error("Peer returned error {}: {}", .0.code, .0.message)]
    Remote(ErrorObject),

    #[error("Connection closed: {0}")]
    Closed(String),

    #[error("Request ID {0} is already in flight")]
    DuplicateId(RequestId),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("Error serializing request params")]
    Serialize(#[source] serde_json::Error),

    #[error("Error deserializing result")]
    Deserialize(#[source] serde_json::Error),
}

impl From<PendingError> for RpcError {
    fn from(error: PendingError) -> Self {
        match error {
            PendingError::Duplicate(id) => RpcError::DuplicateId(id),
            PendingError::Timeout { id, timeout } => RpcError::Timeout { id, timeout },
            PendingError::Remote(error) => RpcError::Remote(error),
            PendingError::Closed(reason) => RpcError::Closed(reason),
        }
    }
}

impl RpcError {
    /// The JSON-RPC error code of a remote failure
    pub fn remote_code(&self) -> Option<i32> {
        match self {
            RpcError::Remote(error) => Some(error.code),
            _ => None,
        }
    }
}

pub(crate) fn not_initialized() -> JsonRpcError {
    JsonRpcError::new(NOT_INITIALIZED, "Server not initialized", None)
}

pub(crate) fn rate_limited(code: i32, error: &RateLimited) -> JsonRpcError {
    JsonRpcError::new(code, error.to_string(), None)
}

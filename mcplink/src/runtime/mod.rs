//! Request/response runtime on top of a [`Transport`](mcplink_jsonrpc::transport::Transport).
//!
//! [`Peer`] is symmetric: both the server and the client send requests and serve them.
//! [`McpServer`] and [`McpClient`] add the MCP handshake and gating on top.
use mcplink_jsonrpc::RequestId;
use serde::{Deserialize, Serialize};

mod client;
mod handler;
mod peer;
mod server;

pub use client::McpClient;
pub use handler::{MethodContext, RequestHandler};
pub use peer::Peer;
pub use server::{LoggingLevel, McpServer};

pub const CANCELLED_METHOD: &str = "notifications/cancelled";

/// Params of a `notifications/cancelled` message
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelledNotification {
    pub request_id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

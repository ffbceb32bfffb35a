//! The streamable HTTP transport: JSON-RPC over `POST`, with server-sent event streams carrying
//! the server's side of the conversation.
pub mod accept;
pub mod auth;
mod client;
mod server;
pub mod sse;

pub use client::HttpClientTransport;
pub use server::HttpServerTransport;

/// Carries the session ID in both directions
pub const SESSION_ID_HEADER: &str = "mcp-session-id";

/// Cookie the server sets alongside [`SESSION_ID_HEADER`], accepted when the header is missing
pub const SESSION_COOKIE: &str = "Mcp-Session-Id";

/// Protocol version negotiated during the handshake, sent with every later request
pub const PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";

/// Sent by a reconnecting client to resume an event stream
pub const LAST_EVENT_ID_HEADER: &str = "last-event-id";

//! Bidirectional Model Context Protocol runtime.
//!
//! The pieces, from the wire up:
//!
//! * transports: newline-delimited JSON over stdio or any byte stream (from `mcplink-jsonrpc`),
//!   and the streamable HTTP transport in [`http`], whose server side keeps sessions, routes
//!   outbound messages to resumable event streams and backlogs what can't be delivered yet;
//! * [`runtime::Peer`], which correlates requests with responses, tracks cancellation and
//!   progress, and runs request handlers;
//! * [`runtime::McpServer`] and [`runtime::McpClient`], which add the initialize handshake,
//!   capability checks and rate limits for their role.
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event_stream;
pub mod http;
pub mod lifecycle;
pub mod ping;
pub mod progress;
pub mod router;
pub mod runtime;
pub mod session;
mod util;

pub use config::*;
pub use error::{RpcError, NOT_INITIALIZED, RATE_LIMITED};
pub use lifecycle::{Capability, CapabilitySet, Implementation, InitializeResult, LifecycleState};
pub use ping::PingScheduler;
pub use runtime::{McpClient, McpServer, MethodContext, Peer, RequestHandler};

pub use mcplink_jsonrpc as jsonrpc;

#[cfg(test)]
pub(crate) mod test_helpers {
    use std::sync::OnceLock;
    use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

    static TRACING: OnceLock<()> = OnceLock::new();

    /// Initialize tracing for tests with a stdout subscriber.
    /// Safe to call multiple times - will only initialize once.
    pub fn init_test_logging() {
        TRACING.get_or_init(|| {
            let filter = std::env::var("RUST_LOG")
                .map(EnvFilter::new)
                .unwrap_or_else(|_| EnvFilter::new("debug"));

            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_span_events(FmtSpan::CLOSE)
                .with_test_writer()
                .try_init()
                .ok();
        });
    }
}

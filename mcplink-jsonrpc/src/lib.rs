//! JSON-RPC 2.0 plumbing that does not know anything about MCP itself.
//!
//! `jsonrpsee` is a more full-featured JSON-RPC library, but it assumes it owns the connection and
//! only ever plays the server role.  MCP connections are symmetric (both sides issue requests) and
//! run over transports jsonrpsee doesn't speak, so this crate only borrows the error codes and
//! version marker from `jsonrpsee-types` and implements the rest.
mod cancellation;
mod pending;
mod rate_limit;
mod shared;
pub mod transport;

pub use cancellation::*;
pub use pending::*;
pub use rate_limit::*;
pub use shared::*;

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

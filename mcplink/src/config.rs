//! Runtime-configurable settings.
//!
//! Every struct has a `Default` impl carrying the stock values, and deserializes with
//! `#[serde(default)]` so a config file only needs to mention what it changes.
use crate::lifecycle::{CapabilitySet, Implementation};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// The newest protocol revision this runtime speaks.
pub const LATEST_PROTOCOL_VERSION: &str = "2025-06-18";

/// The revision assumed when the peer never said which one it speaks.
pub const COMPATIBILITY_PROTOCOL_VERSION: &str = "2025-03-26";

pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] =
    &[LATEST_PROTOCOL_VERSION, COMPATIBILITY_PROTOCOL_VERSION];

pub fn is_supported_protocol_version(version: &str) -> bool {
    SUPPORTED_PROTOCOL_VERSIONS.contains(&version)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub progress_per_second: u32,
    pub tools_per_second: u32,
    pub completions_per_second: u32,
    pub logs_per_second: u32,
    pub window_ms: u64,

    /// JSON-RPC error code used when a request is turned away for exceeding its limit
    pub error_code: i32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            progress_per_second: 20,
            tools_per_second: 5,
            completions_per_second: 10,
            logs_per_second: 20,
            window_ms: 1000,
            error_code: crate::error::RATE_LIMITED,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Settings shared by both roles, governing the request/response plumbing of one connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// First ID used for requests this side sends
    pub initial_request_id: i64,

    /// How long to wait for the peer to answer a request, unless the call overrides it
    pub request_timeout_ms: u64,

    pub rate_limits: RateLimitConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            initial_request_id: 1,
            request_timeout_ms: 30_000,
            rate_limits: RateLimitConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server_info: Implementation,
    pub capabilities: CapabilitySet,
    pub instructions: Option<String>,
    pub runtime: RuntimeConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_info: Implementation::new(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            capabilities: CapabilitySet::default(),
            instructions: None,
            runtime: RuntimeConfig::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub client_info: Implementation,
    pub capabilities: CapabilitySet,

    /// Version requested in the initialize handshake
    pub protocol_version: String,
    pub runtime: RuntimeConfig,
    pub ping: PingConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_info: Implementation::new(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            capabilities: CapabilitySet::default(),
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            runtime: RuntimeConfig::default(),
            ping: PingConfig::default(),
        }
    }
}

/// Liveness checks a client runs against its server
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PingConfig {
    pub interval_ms: u64,

    /// Deadline for each individual ping
    pub timeout_ms: u64,

    /// Consecutive failures before the failure callback runs
    pub max_failures: u32,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            timeout_ms: 10_000,
            max_failures: 3,
        }
    }
}

impl PingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpServerConfig {
    /// Path of the single MCP endpoint
    pub endpoint_path: String,

    pub session_id_bytes: usize,
    pub sse_prefix_bytes: usize,
    pub sse_history_limit: usize,
    pub sse_channel_capacity: usize,
    pub initialize_timeout_ms: u64,

    /// Origins (`scheme://authority`) allowed to talk to the endpoint
    pub allowed_origins: Vec<String>,

    pub resource_metadata_path: String,

    /// Canonical URL of this resource as advertised in the protected-resource metadata.  When not
    /// set it's derived from the request's `Host` header.
    pub resource_url: Option<String>,
    pub authorization_servers: Vec<String>,

    /// Principal assigned to every request when no authorizer is installed
    pub default_principal: String,

    /// Reject non-initialize requests that omit the protocol version header
    pub strict_protocol_version: bool,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            endpoint_path: "/".to_string(),
            session_id_bytes: 32,
            sse_prefix_bytes: 8,
            sse_history_limit: 100,
            sse_channel_capacity: 256,
            initialize_timeout_ms: 30_000,
            allowed_origins: vec![
                "http://localhost".to_string(),
                "http://127.0.0.1".to_string(),
                "https://localhost".to_string(),
                "https://127.0.0.1".to_string(),
            ],
            resource_metadata_path: "/.well-known/oauth-protected-resource".to_string(),
            resource_url: None,
            authorization_servers: vec![],
            default_principal: "default".to_string(),
            strict_protocol_version: false,
        }
    }
}

impl HttpServerConfig {
    pub fn initialize_timeout(&self) -> Duration {
        Duration::from_millis(self.initialize_timeout_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpClientConfig {
    /// URL of the server's MCP endpoint
    pub endpoint: String,

    /// Value sent in the `Origin` header
    pub origin: String,
    pub receive_timeout_ms: u64,
    pub bearer_token: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8080/".to_string(),
            origin: "http://127.0.0.1".to_string(),
            receive_timeout_ms: 10_000,
            bearer_token: None,
        }
    }
}

impl HttpClientConfig {
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }
}

/// Everything a config file can set, grouped by component
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub http_server: HttpServerConfig,
    pub http_client: HttpClientConfig,
}

impl Config {
    /// Load config from a JSON file.  Anything the file doesn't mention keeps its default.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Reading config file {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Parsing config file {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::Capability;
    use std::io::Write;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.server.runtime.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.server.runtime.initial_request_id, 1);
        assert_eq!(config.server.runtime.rate_limits.tools_per_second, 5);
        assert_eq!(config.server.runtime.rate_limits.error_code, -32001);
        assert_eq!(config.http_server.session_id_bytes, 32);
        assert_eq!(config.http_server.sse_prefix_bytes, 8);
        assert_eq!(config.http_server.initialize_timeout(), Duration::from_secs(30));
        assert!(!config.http_server.strict_protocol_version);
        assert_eq!(config.http_client.receive_timeout(), Duration::from_secs(10));
        assert_eq!(config.client.protocol_version, LATEST_PROTOCOL_VERSION);
        assert_eq!(config.client.ping.max_failures, 3);
    }

    #[test]
    fn partial_file_keeps_defaults() -> anyhow::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(
            file,
            r#"{{
                "server": {{ "capabilities": {{ "tools": {{}}, "somethingNew": {{}} }} }},
                "http_server": {{ "strict_protocol_version": true, "sse_history_limit": 5 }}
            }}"#
        )?;

        let config = Config::load(file.path())?;
        assert!(config.http_server.strict_protocol_version);
        assert_eq!(config.http_server.sse_history_limit, 5);
        assert_eq!(config.http_server.session_id_bytes, 32);
        assert!(config.server.capabilities.contains(Capability::Tools));
        assert!(!config.server.capabilities.contains(Capability::Resources));

        Ok(())
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(&dir.path().join("nope.json")).unwrap_err();
        assert!(err.to_string().contains("Reading config file"));
    }
}

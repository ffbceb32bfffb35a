use super::{MethodContext, Peer, RequestHandler};
use crate::config::ServerConfig;
use crate::error::{not_initialized, rate_limited, RpcError};
use crate::lifecycle::{Capability, InitializeRequest, InitializeResult, LifecycleState, ProtocolLifecycle};
use mcplink_jsonrpc::transport::{Transport, TransportError};
use mcplink_jsonrpc::{expect_params, JsonRpcError, RateLimiter};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tracing::*;

const LOG_MESSAGE_METHOD: &str = "notifications/message";

/// Severity of a log message sent to the client, lowest first
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LoggingLevel {
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Critical,
    Alert,
    Emergency,
}

#[derive(Deserialize)]
struct SetLevelParams {
    level: LoggingLevel,
}

struct ServerCore {
    config: ServerConfig,
    lifecycle: ProtocolLifecycle,
    tools: RateLimiter,
    completions: RateLimiter,
    logs: RateLimiter,
    log_level: Mutex<LoggingLevel>,
    handler: Arc<dyn RequestHandler>,
}

/// The server role: answers the handshake and `ping` itself, refuses anything else until the
/// client has confirmed initialization, enforces declared capabilities and rate limits, and hands
/// the rest to the application's [`RequestHandler`].
#[derive(Clone)]
pub struct McpServer {
    peer: Peer,
    core: Arc<ServerCore>,
}

impl McpServer {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: ServerConfig,
        handler: Arc<dyn RequestHandler>,
    ) -> Self {
        let peer = Peer::new(transport, &config.runtime);
        let limits = &config.runtime.rate_limits;
        let window = limits.window();

        let core = ServerCore {
            tools: RateLimiter::new(limits.tools_per_second, window),
            completions: RateLimiter::new(limits.completions_per_second, window),
            logs: RateLimiter::new(limits.logs_per_second, window),
            lifecycle: ProtocolLifecycle::new(),
            log_level: Mutex::new(LoggingLevel::Info),
            handler,
            config,
        };

        Self {
            peer,
            core: Arc::new(core),
        }
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn lifecycle(&self) -> &ProtocolLifecycle {
        &self.core.lifecycle
    }

    pub fn log_level(&self) -> LoggingLevel {
        *self
            .core
            .log_level
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Serve the connection until the client goes away
    pub async fn serve(&self) -> Result<(), TransportError> {
        info!(
            server = %self.core.config.server_info.name,
            version = %self.core.config.server_info.version,
            "Serving MCP connection"
        );
        self.peer.serve(self.core.clone()).await
    }

    /// Send a request to the client.  Methods that need a client capability fail locally if the
    /// client didn't declare it.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        self.core.lifecycle.ensure_operational(method)?;
        if let Some(capability) = Capability::required_by_client_method(method) {
            self.core.lifecycle.require_client_capability(capability)?;
        }
        self.peer.request(method, params).await
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), RpcError> {
        self.peer.notify(method, params).await
    }

    /// Send a log message to the client.  Returns `false` if it was filtered out by the level the
    /// client set, or dropped by the rate limiter.
    pub async fn send_log(
        &self,
        level: LoggingLevel,
        logger: Option<&str>,
        data: Value,
    ) -> Result<bool, RpcError> {
        if level < self.log_level() {
            return Ok(false);
        }
        if let Err(e) = self.core.logs.require_allowance(LOG_MESSAGE_METHOD) {
            debug!(error = %e, %level, "Log message rate limited; dropping");
            return Ok(false);
        }

        let mut params = json!({ "level": level, "data": data });
        if let Some(logger) = logger {
            params["logger"] = json!(logger);
        }
        self.peer.notify(LOG_MESSAGE_METHOD, Some(params)).await?;
        Ok(true)
    }

    pub async fn close(&self) -> Result<(), RpcError> {
        self.core.lifecycle.shutdown();
        self.peer.close().await
    }
}

impl ServerCore {
    fn initialize(&self, params: Option<&Value>) -> Result<Value, JsonRpcError> {
        let request: InitializeRequest = expect_params(params)?;
        debug!(
            client = %request.client_info.name,
            requested = %request.protocol_version,
            "Client initializing"
        );

        let result: InitializeResult = self.lifecycle.initialize(
            request,
            &self.config.server_info,
            &self.config.capabilities,
            self.config.instructions.as_deref(),
        )?;
        serde_json::to_value(result)
            .map_err(|e| JsonRpcError::internal(format!("Error serializing initialize result: {e}")))
    }

    fn set_level(&self, params: Option<&Value>) -> Result<Value, JsonRpcError> {
        let SetLevelParams { level } = expect_params(params)?;
        debug!(%level, "Client set log level");
        *self
            .log_level
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = level;
        Ok(json!({}))
    }

    fn check_rate_limit(&self, method: &str, params: Option<&Value>) -> Result<(), JsonRpcError> {
        let code = self.config.runtime.rate_limits.error_code;
        let result = match method {
            "tools/call" => {
                let tool = params
                    .and_then(|params| params.get("name"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                self.tools.require_allowance(tool)
            }
            "completion/complete" => self.completions.require_allowance(method),
            _ => Ok(()),
        };

        result.map_err(|e| {
            debug!(method, key = %e.key, "Rate limited");
            rate_limited(code, &e)
        })
    }
}

#[async_trait::async_trait]
impl RequestHandler for ServerCore {
    async fn handle_request(
        &self,
        method: &str,
        params: Option<Value>,
        context: MethodContext,
    ) -> Result<Value, JsonRpcError> {
        match method {
            "initialize" => self.initialize(params.as_ref()),
            "ping" => {
                self.lifecycle
                    .ensure_operational(method)
                    .map_err(|_| not_initialized())?;
                check_ping_params(params.as_ref())?;
                Ok(json!({}))
            }
            _ => {
                self.lifecycle
                    .ensure_operational(method)
                    .map_err(|_| not_initialized())?;
                if let Some(capability) = Capability::required_by_server_method(method) {
                    self.lifecycle.require_server_capability(capability)?;
                }
                self.check_rate_limit(method, params.as_ref())?;

                if method == "logging/setLevel" {
                    return self.set_level(params.as_ref());
                }
                self.handler.handle_request(method, params, context).await
            }
        }
    }

    async fn handle_notification(&self, method: &str, params: Option<Value>, peer: &Peer) {
        if method == "notifications/initialized" {
            if self.lifecycle.confirm_initialized() {
                info!("Client initialized");
                self.handler.on_initialized(peer).await;
            }
            return;
        }

        if self.lifecycle.state() == LifecycleState::Shutdown {
            trace!(method, "Ignoring notification after shutdown");
            return;
        }
        self.handler.handle_notification(method, params, peer).await;
    }

    async fn on_shutdown(&self) {
        self.lifecycle.shutdown();
        self.handler.on_shutdown().await;
    }
}

/// `ping` takes no params, apart from the `_meta` that any request may carry
pub(crate) fn check_ping_params(params: Option<&Value>) -> Result<(), JsonRpcError> {
    match params {
        None | Some(Value::Null) => Ok(()),
        Some(Value::Object(map)) if map.keys().all(|key| key == "_meta") => Ok(()),
        Some(_) => Err(JsonRpcError::invalid_params("ping takes no parameters")),
    }
}

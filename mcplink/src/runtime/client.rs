use super::server::check_ping_params;
use super::{MethodContext, Peer, RequestHandler};
use crate::config::ClientConfig;
use crate::error::{not_initialized, RpcError};
use crate::lifecycle::{Capability, InitializeRequest, InitializeResult, ProtocolLifecycle};
use crate::progress::ProgressNotification;
use mcplink_jsonrpc::transport::{Transport, TransportError};
use mcplink_jsonrpc::JsonRpcError;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::*;

const SERVE_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

struct ClientCore {
    lifecycle: ProtocolLifecycle,
    handler: Arc<dyn RequestHandler>,
}

/// The client role.
///
/// Starts reading from the transport as soon as it's created, so server-initiated requests
/// (sampling, roots, elicitation) are served by the [`RequestHandler`] while the client's own
/// requests are outstanding.
pub struct McpClient {
    config: ClientConfig,
    peer: Peer,
    core: Arc<ClientCore>,
    serve_task: Mutex<Option<JoinHandle<Result<(), TransportError>>>>,
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("client_info", &self.config.client_info)
            .field("state", &self.core.lifecycle.state())
            .finish_non_exhaustive()
    }
}

impl McpClient {
    /// Must be called from within a Tokio runtime
    pub fn start(
        transport: Arc<dyn Transport>,
        config: ClientConfig,
        handler: Arc<dyn RequestHandler>,
    ) -> Self {
        let peer = Peer::new(transport, &config.runtime);
        let core = Arc::new(ClientCore {
            lifecycle: ProtocolLifecycle::new(),
            handler,
        });

        let serve_task = tokio::spawn({
            let peer = peer.clone();
            let core = core.clone();
            async move { peer.serve(core).await }
        });

        Self {
            config,
            peer,
            core,
            serve_task: Mutex::new(Some(serve_task)),
        }
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn lifecycle(&self) -> &ProtocolLifecycle {
        &self.core.lifecycle
    }

    /// Run the handshake: send `initialize`, check the server's answer, confirm with
    /// `notifications/initialized`.
    #[instrument(skip(self), fields(client = %self.config.client_info.name))]
    pub async fn initialize(&self) -> Result<InitializeResult, RpcError> {
        let lifecycle = &self.core.lifecycle;
        lifecycle.begin_initialize()?;

        let request = InitializeRequest {
            protocol_version: self.config.protocol_version.clone(),
            capabilities: self.config.capabilities.clone(),
            client_info: self.config.client_info.clone(),
        };

        let result = match self.send_initialize(&request).await {
            Ok(result) => result,
            Err(e) => {
                lifecycle.abort_initialize();
                return Err(e);
            }
        };
        lifecycle.complete_initialize(&self.config.client_info, &self.config.capabilities, &result)?;

        self.peer
            .notify("notifications/initialized", None)
            .await?;
        info!(
            server = %result.server_info.name,
            protocol_version = %result.protocol_version,
            "Connected to MCP server"
        );
        Ok(result)
    }

    async fn send_initialize(&self, request: &InitializeRequest) -> Result<InitializeResult, RpcError> {
        let params = serde_json::to_value(request).map_err(RpcError::Serialize)?;
        let result = self.peer.request("initialize", Some(params)).await?;
        serde_json::from_value(result).map_err(RpcError::Deserialize)
    }

    pub async fn ping(&self) -> Result<(), RpcError> {
        self.ping_with_timeout(self.config.runtime.request_timeout())
            .await
    }

    pub async fn ping_with_timeout(&self, timeout: Duration) -> Result<(), RpcError> {
        self.peer
            .request_with_timeout("ping", None, timeout)
            .await
            .map(|_| ())
    }

    /// Send a request to the server.  Methods that need a server capability fail locally if the
    /// server didn't declare it.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        self.check_request(method)?;
        self.peer.request(method, params).await
    }

    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        self.check_request(method)?;
        self.peer.request_with_timeout(method, params, timeout).await
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), RpcError> {
        self.peer.notify(method, params).await
    }

    /// Progress the server reports for this client's requests
    pub fn progress_events(&self) -> mpsc::UnboundedReceiver<ProgressNotification> {
        self.peer.progress_events()
    }

    /// Close the connection and wait for the reader to finish
    pub async fn close(&self) -> Result<(), RpcError> {
        self.core.lifecycle.shutdown();
        let result = self.peer.close().await;

        let serve_task = self
            .serve_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(serve_task) = serve_task {
            let abort = serve_task.abort_handle();
            match tokio::time::timeout(SERVE_SHUTDOWN_GRACE, serve_task).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => debug!(error = %e, "Reader ended with an error"),
                Ok(Err(e)) => warn!(error = %e, "Reader task failed"),
                Err(_) => {
                    warn!("Reader did not stop in time; aborting");
                    abort.abort();
                }
            }
        }
        result
    }

    fn check_request(&self, method: &str) -> Result<(), RpcError> {
        self.core.lifecycle.ensure_operational(method)?;
        if let Some(capability) = Capability::required_by_server_method(method) {
            self.core.lifecycle.require_server_capability(capability)?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl RequestHandler for ClientCore {
    async fn handle_request(
        &self,
        method: &str,
        params: Option<Value>,
        context: MethodContext,
    ) -> Result<Value, JsonRpcError> {
        if method == "ping" {
            check_ping_params(params.as_ref())?;
            return Ok(json!({}));
        }

        self.lifecycle
            .ensure_operational(method)
            .map_err(|_| not_initialized())?;
        if let Some(capability) = Capability::required_by_client_method(method) {
            self.lifecycle.require_client_capability(capability)?;
        }
        self.handler.handle_request(method, params, context).await
    }

    async fn handle_notification(&self, method: &str, params: Option<Value>, peer: &Peer) {
        self.handler.handle_notification(method, params, peer).await;
    }

    async fn on_shutdown(&self) {
        self.lifecycle.shutdown();
        self.handler.on_shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServerConfig, COMPATIBILITY_PROTOCOL_VERSION};
    use crate::lifecycle::{CapabilitySet, LifecycleError, LifecycleState};
    use crate::runtime::McpServer;
    use crate::test_helpers::init_test_logging;
    use assert_matches::assert_matches;
    use mcplink_jsonrpc::transport::duplex;

    struct Sampler;

    #[async_trait::async_trait]
    impl RequestHandler for Sampler {
        async fn handle_request(
            &self,
            method: &str,
            _params: Option<Value>,
            _context: MethodContext,
        ) -> Result<Value, JsonRpcError> {
            match method {
                "sampling/createMessage" => Ok(json!({"role": "assistant"})),
                other => Err(JsonRpcError::method_not_found(other)),
            }
        }
    }

    struct NoHandler;
    impl RequestHandler for NoHandler {}

    fn connect(client_config: ClientConfig, server_caps: CapabilitySet) -> (McpServer, McpClient) {
        let (server_end, client_end) = duplex(64 * 1024);
        let server = McpServer::new(
            Arc::new(server_end),
            ServerConfig {
                capabilities: server_caps,
                ..Default::default()
            },
            Arc::new(NoHandler),
        );
        tokio::spawn({
            let server = server.clone();
            async move { server.serve().await }
        });

        let client = McpClient::start(Arc::new(client_end), client_config, Arc::new(Sampler));
        (server, client)
    }

    #[tokio::test]
    async fn handshake_and_ping() -> anyhow::Result<()> {
        init_test_logging();
        let (server, client) = connect(
            ClientConfig::default(),
            CapabilitySet::new().with(Capability::Tools),
        );

        // Only ping and initialize are allowed before the handshake
        assert_matches!(
            client.request("tools/list", None).await,
            Err(RpcError::Lifecycle(LifecycleError::NotInitialized(_)))
        );

        let result = client.initialize().await?;
        assert_eq!(result.server_info.name, env!("CARGO_PKG_NAME"));
        assert_eq!(client.lifecycle().state(), LifecycleState::Operation);
        client.ping().await?;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.lifecycle().state(), LifecycleState::Operation);

        // Not declared by the server, so refused without a round trip
        assert_matches!(
            client.request("prompts/list", None).await,
            Err(RpcError::Lifecycle(LifecycleError::CapabilityNotSupported { .. }))
        );

        client.close().await?;
        assert_eq!(client.lifecycle().state(), LifecycleState::Shutdown);
        Ok(())
    }

    #[tokio::test]
    async fn older_version_is_negotiated() -> anyhow::Result<()> {
        init_test_logging();
        let config = ClientConfig {
            protocol_version: COMPATIBILITY_PROTOCOL_VERSION.to_string(),
            ..Default::default()
        };
        let (_server, client) = connect(config, CapabilitySet::new());

        let result = client.initialize().await?;
        assert_eq!(result.protocol_version, COMPATIBILITY_PROTOCOL_VERSION);
        Ok(())
    }

    #[tokio::test]
    async fn server_requests_need_client_capabilities() -> anyhow::Result<()> {
        init_test_logging();
        let config = ClientConfig {
            capabilities: CapabilitySet::new().with(Capability::Sampling),
            ..Default::default()
        };
        let (server, client) = connect(config, CapabilitySet::new());
        client.initialize().await?;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let sampled = server.request("sampling/createMessage", None).await?;
        assert_eq!(sampled["role"], "assistant");

        assert_matches!(
            server.request("roots/list", None).await,
            Err(RpcError::Lifecycle(LifecycleError::CapabilityNotSupported { .. }))
        );
        Ok(())
    }

    #[tokio::test]
    async fn second_initialize_fails_locally() -> anyhow::Result<()> {
        init_test_logging();
        let (_server, client) = connect(ClientConfig::default(), CapabilitySet::new());
        client.initialize().await?;
        assert_matches!(
            client.initialize().await,
            Err(RpcError::Lifecycle(LifecycleError::AlreadyInitialized(_)))
        );
        Ok(())
    }
}

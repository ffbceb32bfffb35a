#![allow(dead_code)]

use mcplink::http::HttpServerTransport;
use mcplink::jsonrpc::JsonRpcError;
use mcplink::{
    Capability, CapabilitySet, HttpServerConfig, McpServer, MethodContext, RequestHandler,
    ServerConfig,
};
use serde_json::{json, Value};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

static TRACING: OnceLock<()> = OnceLock::new();

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

/// Tool handler used by the end-to-end tests.
///
/// `echo` answers right away; `slow` takes two seconds unless cancelled, and reports every
/// cancellation it sees on `cancelled`.
pub struct TestTools {
    cancelled: mpsc::UnboundedSender<String>,
}

impl TestTools {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (cancelled, receiver) = mpsc::unbounded_channel();
        (Self { cancelled }, receiver)
    }
}

#[async_trait::async_trait]
impl RequestHandler for TestTools {
    async fn handle_request(
        &self,
        method: &str,
        params: Option<Value>,
        context: MethodContext,
    ) -> Result<Value, JsonRpcError> {
        if method != "tools/call" {
            return Err(JsonRpcError::method_not_found(method));
        }

        let name = params
            .as_ref()
            .and_then(|params| params.get("name"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        match name {
            "echo" => Ok(json!({ "content": [{ "type": "text", "text": "echo" }] })),
            "slow" => {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(2)) => {
                        Ok(json!({ "content": [] }))
                    }
                    _ = context.abort_token().cancelled() => {
                        let _ = self.cancelled.send(context.request_id().to_string());
                        Err(JsonRpcError::internal("cancelled"))
                    }
                }
            }
            other => Err(JsonRpcError::invalid_params(format!("Unknown tool {other}"))),
        }
    }
}

pub struct HttpServer {
    pub transport: Arc<HttpServerTransport>,
    pub server: McpServer,
    pub cancelled: mpsc::UnboundedReceiver<String>,
}

/// Bind an HTTP server on a loopback port and start serving MCP on it
pub async fn start_http_server(config: HttpServerConfig) -> anyhow::Result<HttpServer> {
    let transport = Arc::new(HttpServerTransport::bind("127.0.0.1:0".parse()?, config).await?);
    let (tools, cancelled) = TestTools::new();

    let server = McpServer::new(
        transport.clone(),
        ServerConfig {
            capabilities: CapabilitySet::new()
                .with(Capability::Tools)
                .with(Capability::Logging),
            ..Default::default()
        },
        Arc::new(tools),
    );
    tokio::spawn({
        let server = server.clone();
        async move { server.serve().await }
    });

    Ok(HttpServer {
        transport,
        server,
        cancelled,
    })
}

pub fn initialize_body(id: i64) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "initialize",
        "params": {
            "protocolVersion": mcplink::LATEST_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": { "name": "raw", "version": "0" }
        }
    })
}

/// A POST with the headers every well-behaved client sends
pub fn post(http: &reqwest::Client, url: &str) -> reqwest::RequestBuilder {
    http.post(url)
        .header("origin", "http://127.0.0.1")
        .header("accept", "application/json, text/event-stream")
        .header("content-type", "application/json")
}

/// Run the handshake with raw HTTP requests.  Returns the session ID.
pub async fn raw_handshake(http: &reqwest::Client, url: &str) -> anyhow::Result<String> {
    let response = post(http, url)
        .body(initialize_body(1).to_string())
        .send()
        .await?;
    anyhow::ensure!(response.status() == 200, "initialize failed: {}", response.status());

    let session = response
        .headers()
        .get("mcp-session-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("no session ID"))?;

    let response = post(http, url)
        .header("mcp-session-id", &session)
        .header("mcp-protocol-version", mcplink::LATEST_PROTOCOL_VERSION)
        .body(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}).to_string())
        .send()
        .await?;
    anyhow::ensure!(response.status() == 202, "initialized failed: {}", response.status());

    Ok(session)
}

//! End-to-end scenarios: a real server and a real client, over each transport.
mod common;

use assert_matches::assert_matches;
use common::{init_test_logging, post, start_http_server, TestTools};
use mcplink::http::HttpClientTransport;
use mcplink::jsonrpc::transport::duplex;
use mcplink::{
    Capability, CapabilitySet, ClientConfig, HttpClientConfig, HttpServerConfig, LifecycleState,
    McpClient, McpServer, RequestHandler, RpcError, ServerConfig, LATEST_PROTOCOL_VERSION,
};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct NoHandler;
impl RequestHandler for NoHandler {}

#[tokio::test]
async fn handshake_and_ping_over_a_stream() -> anyhow::Result<()> {
    init_test_logging();
    let (server_end, client_end) = duplex(64 * 1024);
    let (tools, _cancelled) = TestTools::new();

    let server = McpServer::new(
        Arc::new(server_end),
        ServerConfig {
            capabilities: CapabilitySet::new().with(Capability::Tools),
            ..Default::default()
        },
        Arc::new(tools),
    );
    let serving = tokio::spawn({
        let server = server.clone();
        async move { server.serve().await }
    });

    let client = McpClient::start(
        Arc::new(client_end),
        ClientConfig::default(),
        Arc::new(NoHandler),
    );
    let result = client.initialize().await?;
    assert_eq!(result.protocol_version, LATEST_PROTOCOL_VERSION);
    assert!(result.capabilities.contains(Capability::Tools));

    client.ping().await?;
    let echoed = client
        .request("tools/call", Some(json!({"name": "echo"})))
        .await?;
    assert_eq!(echoed["content"][0]["text"], "echo");
    assert_eq!(server.lifecycle().state(), LifecycleState::Operation);

    client.close().await?;
    assert_matches!(serving.await?, Ok(()));
    assert_eq!(server.lifecycle().state(), LifecycleState::Shutdown);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn request_deadline_over_http_cancels_on_the_server() -> anyhow::Result<()> {
    init_test_logging();
    let mut http = start_http_server(HttpServerConfig::default()).await?;

    let transport = Arc::new(HttpClientTransport::new(HttpClientConfig {
        endpoint: http.transport.endpoint_url(),
        ..Default::default()
    })?);
    let client = McpClient::start(transport.clone(), ClientConfig::default(), Arc::new(NoHandler));

    client.initialize().await?;
    assert!(transport.session_id().is_some());
    assert_eq!(
        transport.protocol_version().as_deref(),
        Some(LATEST_PROTOCOL_VERSION)
    );
    client.ping().await?;

    let started = Instant::now();
    let result = client
        .request_with_timeout(
            "tools/call",
            Some(json!({"name": "slow"})),
            Duration::from_secs(1),
        )
        .await;
    let elapsed = started.elapsed();

    assert_matches!(result, Err(RpcError::Timeout { .. }));
    assert!(elapsed >= Duration::from_secs(1), "returned after {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1800), "returned after {elapsed:?}");

    let cancelled = tokio::time::timeout(Duration::from_secs(2), http.cancelled.recv()).await?;
    assert!(cancelled.is_some(), "server never saw the cancellation");

    client.close().await?;
    assert!(http.transport.session_id().is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn session_ids_are_enforced() -> anyhow::Result<()> {
    init_test_logging();
    let server = start_http_server(HttpServerConfig::default()).await?;
    let url = server.transport.endpoint_url();
    let http = reqwest::Client::new();

    // No session yet, and this isn't initialize.  Being refused doesn't quietly start one.
    let ping = json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}).to_string();
    for attempt in 1..=2 {
        let response = post(&http, &url).body(ping.clone()).send().await?;
        assert_eq!(response.status(), 400, "attempt {attempt}");
        assert!(
            response.headers().get("mcp-session-id").is_none(),
            "attempt {attempt} was given a session"
        );
        assert!(server.transport.session_id().is_none());
    }

    let session = common::raw_handshake(&http, &url).await?;
    assert_eq!(server.transport.session_id().as_deref(), Some(session.as_str()));

    // A forged session ID is unknown to the server
    let response = post(&http, &url)
        .header("mcp-session-id", "forged")
        .header("mcp-protocol-version", LATEST_PROTOCOL_VERSION)
        .body(ping.clone())
        .send()
        .await?;
    assert_eq!(response.status(), 404);

    // The real one works, and the answer arrives on an event stream
    let response = post(&http, &url)
        .header("mcp-session-id", &session)
        .header("mcp-protocol-version", LATEST_PROTOCOL_VERSION)
        .body(ping)
        .send()
        .await?;
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("content-type").and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );
    let body = response.text().await?;
    assert!(body.contains(r#""result":{}"#), "unexpected body {body}");
    Ok(())
}

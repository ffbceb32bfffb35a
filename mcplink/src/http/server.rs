//! Server side of the HTTP + server-sent events transport.
//!
//! The whole session is served from a single endpoint path:
//!
//! * `POST` carries one envelope from the client.  Notifications and responses are accepted with
//!   `202`; the `initialize` request is answered with a plain JSON body; every other request gets
//!   an event stream that carries whatever the server sends in relation to that request, ending
//!   with its response.
//! * `GET` opens (or resumes, with `Last-Event-ID`) the general event stream for server-initiated
//!   messages that aren't tied to a request.
//! * `DELETE` ends the session.
use super::accept::{accepts_exactly, OriginAllowList, APPLICATION_JSON, TEXT_EVENT_STREAM};
use super::auth::{challenge, Authorizer, ProtectedResourceMetadata};
use super::{LAST_EVENT_ID_HEADER, PROTOCOL_VERSION_HEADER, SESSION_COOKIE, SESSION_ID_HEADER};
use crate::config::HttpServerConfig;
use crate::dispatcher::MessageDispatcher;
use crate::event_stream::{parse_last_event_id, EventStream, SseEvent};
use crate::router::{MessageRouter, StreamBinding};
use crate::runtime::{CancelledNotification, CANCELLED_METHOD};
use crate::session::{Principal, SessionManager, SessionOutcome};
use anyhow::Context;
use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use mcplink_jsonrpc::transport::{Transport, TransportError};
use mcplink_jsonrpc::{Envelope, EnvelopeError, JsonRpcError, Request};
use serde_json::Value;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::*;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

struct ServerState {
    config: HttpServerConfig,
    origins: OriginAllowList,
    authorizer: Option<Arc<dyn Authorizer>>,
    session: SessionManager,
    router: Arc<MessageRouter>,
    dispatcher: MessageDispatcher,

    /// Envelopes posted by the client, waiting for [`Transport::receive`]
    incoming: mpsc::Sender<Envelope>,

    /// Tripped when the session is deleted or the transport closed; the inbound side is finished
    inbound_closed: CancellationToken,
}

/// Serves one MCP session over HTTP.
///
/// Implements [`Transport`], so a server runtime can sit on top of it exactly as it would on a
/// stdio transport.
pub struct HttpServerTransport {
    state: Arc<ServerState>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<Envelope>>,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    server: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for HttpServerTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServerTransport")
            .field("local_addr", &self.local_addr)
            .field("session", &self.state.session.session_id())
            .finish_non_exhaustive()
    }
}

impl HttpServerTransport {
    /// Start listening on `addr` without any authorization; every request runs as the configured
    /// default principal.
    pub async fn bind(addr: SocketAddr, config: HttpServerConfig) -> anyhow::Result<Self> {
        Self::bind_with_authorizer(addr, config, None).await
    }

    pub async fn bind_with_authorizer(
        addr: SocketAddr,
        config: HttpServerConfig,
        authorizer: Option<Arc<dyn Authorizer>>,
    ) -> anyhow::Result<Self> {
        let (incoming_tx, incoming_rx) = mpsc::channel(config.sse_channel_capacity);
        let router = Arc::new(MessageRouter::new());

        let state = Arc::new(ServerState {
            origins: OriginAllowList::new(&config.allowed_origins),
            authorizer,
            session: SessionManager::new(config.session_id_bytes, config.strict_protocol_version),
            dispatcher: MessageDispatcher::new(router.clone()),
            router,
            incoming: incoming_tx,
            inbound_closed: CancellationToken::new(),
            config,
        });

        let app = Router::new()
            .route(
                &state.config.endpoint_path,
                post(handle_post).get(handle_get).delete(handle_delete),
            )
            .route(&state.config.resource_metadata_path, get(handle_metadata))
            .layer(TraceLayer::new_for_http())
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Binding MCP HTTP server to {addr}"))?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, path = %state.config.endpoint_path, "Starting MCP HTTP server");

        let shutdown = CancellationToken::new();
        let server = tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                let result = axum::serve(
                    listener,
                    app.into_make_service_with_connect_info::<SocketAddr>(),
                )
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;

                if let Err(e) = result {
                    error!(error = %e, "MCP HTTP server failed");
                }
            }
        });

        Ok(Self {
            state,
            incoming: tokio::sync::Mutex::new(incoming_rx),
            local_addr,
            shutdown,
            server: std::sync::Mutex::new(Some(server)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Full URL of the MCP endpoint
    pub fn endpoint_url(&self) -> String {
        format!("http://{}{}", self.local_addr, self.state.config.endpoint_path)
    }

    pub fn session_id(&self) -> Option<String> {
        self.state.session.session_id()
    }

    pub fn protocol_version(&self) -> String {
        self.state.session.protocol_version()
    }

    /// Number of outbound envelopes waiting for a general stream to attach
    pub fn backlog_len(&self) -> usize {
        self.state.dispatcher.backlog_len()
    }
}

#[async_trait::async_trait]
impl Transport for HttpServerTransport {
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.state.dispatcher.dispatch(envelope);
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Envelope>, TransportError> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            biased;
            envelope = incoming.recv() => Ok(envelope),
            _ = self.state.inbound_closed.cancelled() => {
                debug!("Session ended; no more inbound messages");
                Ok(None)
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.shutdown.is_cancelled() {
            return Ok(());
        }

        let state = &self.state;
        state.inbound_closed.cancel();
        state.session.terminate(false);
        state
            .router
            .fail_response_slots(JsonRpcError::internal("Transport closed").into());
        state.router.clear();
        state.dispatcher.clear();
        self.shutdown.cancel();

        let server = self
            .server
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(server) = server {
            let abort = server.abort_handle();
            if tokio::time::timeout(SHUTDOWN_GRACE, server).await.is_err() {
                warn!("MCP HTTP server did not shut down in time; aborting");
                abort.abort();
            }
        }

        debug!("HTTP server transport closed");
        Ok(())
    }
}

impl Drop for HttpServerTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[instrument(skip_all, fields(%remote))]
async fn handle_post(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let principal = match check_request(&state, &headers, &[APPLICATION_JSON, TEXT_EVENT_STREAM]).await
    {
        Ok(principal) => principal,
        Err(response) => return response,
    };

    if state.inbound_closed.is_cancelled() {
        return (StatusCode::NOT_FOUND, "Transport closed").into_response();
    }

    let envelope = match serde_json::from_slice::<Value>(&body)
        .map_err(EnvelopeError::from)
        .and_then(Envelope::from_value)
    {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!(error = %e, "Malformed POST body");
            return (StatusCode::BAD_REQUEST, Json(e.to_error_envelope())).into_response();
        }
    };

    let initializing = matches!(&envelope, Envelope::Request(r) if r.method == "initialize");
    let outcome = match validate_session(&state, remote, &principal, &headers, initializing) {
        Ok(outcome) => outcome,
        Err(response) => return response,
    };

    match envelope {
        Envelope::Request(request) if initializing => {
            handle_initialize(&state, &outcome, request).await
        }
        Envelope::Request(request) => handle_streaming_request(&state, &outcome, request).await,
        envelope => {
            if envelope.method() == Some(CANCELLED_METHOD) {
                close_cancelled_stream(&state, envelope.params());
            }
            if enqueue(&state, envelope).await.is_err() {
                return (StatusCode::NOT_FOUND, "Transport closed").into_response();
            }
            (StatusCode::ACCEPTED, session_headers(&state, Some(&outcome))).into_response()
        }
    }
}

async fn handle_initialize(
    state: &ServerState,
    outcome: &SessionOutcome,
    request: Request,
) -> Response {
    let id = request.id.clone();
    let slot = state.router.register_response_slot(id.clone());
    if enqueue(state, Envelope::Request(request)).await.is_err() {
        state.router.remove_response_slot(&id);
        return (StatusCode::NOT_FOUND, "Transport closed").into_response();
    }

    match tokio::time::timeout(state.config.initialize_timeout(), slot).await {
        Ok(Ok(response)) => {
            if let Envelope::Response(r) = &response {
                if let Some(version) = r.result.get("protocolVersion").and_then(Value::as_str) {
                    state.session.set_protocol_version(version);
                }
            }
            (
                StatusCode::OK,
                session_headers(state, Some(outcome)),
                Json(response),
            )
                .into_response()
        }
        Ok(Err(_)) => (StatusCode::INTERNAL_SERVER_ERROR, "Transport closed").into_response(),
        Err(_) => {
            warn!(%id, "Timed out waiting for initialize response");
            state.router.remove_response_slot(&id);
            (StatusCode::REQUEST_TIMEOUT, "Initialize timed out").into_response()
        }
    }
}

async fn handle_streaming_request(
    state: &ServerState,
    outcome: &SessionOutcome,
    request: Request,
) -> Response {
    let id = request.id.clone();
    let stream = Arc::new(EventStream::open(
        state.config.sse_prefix_bytes,
        state.config.sse_history_limit,
    ));
    let (sink, events) = mpsc::channel(state.config.sse_channel_capacity);
    stream.attach(sink, 0);

    // Bind before handing the request over, so the response can't beat the stream
    state.router.bind_request_stream(id.clone(), stream.clone());
    if enqueue(state, Envelope::Request(request)).await.is_err() {
        state.router.close_request_stream(&id);
        return (StatusCode::NOT_FOUND, "Transport closed").into_response();
    }

    let guard = StreamGuard {
        router: state.router.clone(),
        stream,
        binding: StreamBinding::Request(id),
    };
    sse_response(events, guard, session_headers(state, Some(outcome)))
}

#[instrument(skip_all, fields(%remote))]
async fn handle_get(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let principal = match check_request(&state, &headers, &[TEXT_EVENT_STREAM]).await {
        Ok(principal) => principal,
        Err(response) => return response,
    };

    if state.inbound_closed.is_cancelled() {
        return (StatusCode::NOT_FOUND, "Transport closed").into_response();
    }

    let outcome = match validate_session(&state, remote, &principal, &headers, false) {
        Ok(outcome) => outcome,
        Err(response) => return response,
    };

    let resumable = headers
        .get(LAST_EVENT_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_last_event_id)
        .and_then(|(prefix, seq)| {
            state
                .router
                .resume(prefix)
                .map(|(stream, binding)| (stream, binding, seq))
        });

    let (sink, events) = mpsc::channel(state.config.sse_channel_capacity);
    let (stream, binding) = match resumable {
        Some((stream, binding, seq)) if stream.attach(sink.clone(), seq) => {
            debug!(prefix = stream.prefix(), seq, "Resumed event stream");
            (stream, binding)
        }
        _ => {
            let stream = Arc::new(EventStream::open(
                state.config.sse_prefix_bytes,
                state.config.sse_history_limit,
            ));
            stream.attach(sink, 0);
            (stream, StreamBinding::General)
        }
    };

    if binding == StreamBinding::General {
        state.dispatcher.attach_general(stream.clone());
    } else {
        state.dispatcher.flush();
    }

    let guard = StreamGuard {
        router: state.router.clone(),
        stream,
        binding,
    };
    sse_response(events, guard, session_headers(&state, Some(&outcome)))
}

#[instrument(skip_all, fields(%remote))]
async fn handle_delete(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let principal = match check_request(&state, &headers, &[]).await {
        Ok(principal) => principal,
        Err(response) => return response,
    };

    if let Err(response) = validate_session(&state, remote, &principal, &headers, false) {
        return response;
    }

    state.session.terminate(true);
    state.router.clear();
    state.dispatcher.clear();
    state.inbound_closed.cancel();
    info!("Session deleted by client");

    StatusCode::OK.into_response()
}

async fn handle_metadata(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
) -> Json<ProtectedResourceMetadata> {
    let base = resource_base(&state, &headers);
    Json(ProtectedResourceMetadata {
        resource: format!("{base}{}", state.config.endpoint_path),
        authorization_servers: state.config.authorization_servers.clone(),
    })
}

/// Authorization, origin and accept checks, in that order.  Returns the caller's principal.
async fn check_request(
    state: &ServerState,
    headers: &HeaderMap,
    accept: &[&str],
) -> Result<Principal, Response> {
    let principal = match &state.authorizer {
        Some(authorizer) => match authorizer.authorize(headers).await {
            Ok(principal) => principal,
            Err(e) => {
                debug!(error = %e, "Authorization failed");
                return Err(unauthorized(state, headers));
            }
        },
        None => Principal::new(state.config.default_principal.clone()),
    };

    match headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) {
        None => return Err((StatusCode::FORBIDDEN, "Missing Origin header").into_response()),
        Some(origin) if !state.origins.allows(origin) => {
            debug!(origin, "Origin not allowed");
            return Err((StatusCode::FORBIDDEN, "Origin not allowed").into_response());
        }
        Some(_) => {}
    }

    if !accept.is_empty() {
        let header = headers.get(header::ACCEPT).and_then(|v| v.to_str().ok());
        if !accepts_exactly(header, accept) {
            return Err((StatusCode::NOT_ACCEPTABLE, "Unsupported Accept header").into_response());
        }
    }

    Ok(principal)
}

fn validate_session(
    state: &ServerState,
    remote: SocketAddr,
    principal: &Principal,
    headers: &HeaderMap,
    initializing: bool,
) -> Result<SessionOutcome, Response> {
    let bad_request = || (StatusCode::BAD_REQUEST, "Invalid header value").into_response();

    let session_id = match headers.get(SESSION_ID_HEADER) {
        Some(value) => Some(value.to_str().map_err(|_| bad_request())?.to_string()),
        None => session_id_from_cookie(headers),
    };
    let protocol_version = match headers.get(PROTOCOL_VERSION_HEADER) {
        Some(value) => Some(value.to_str().map_err(|_| bad_request())?),
        None => None,
    };

    state
        .session
        .validate(
            remote.ip(),
            principal,
            session_id.as_deref(),
            protocol_version,
            initializing,
        )
        .map_err(|rejection| {
            debug!(%rejection, "Session check failed");
            (rejection.status(), rejection.to_string()).into_response()
        })
}

fn session_id_from_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|cookie| cookie.trim().split_once('='))
        .find(|(name, _)| name.eq_ignore_ascii_case(SESSION_COOKIE))
        .map(|(_, value)| value.to_string())
}

/// Headers every successful response carries: the protocol version always, the session ID when
/// there is one, plus the cookie when the session was just created.
fn session_headers(state: &ServerState, outcome: Option<&SessionOutcome>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Ok(version) = HeaderValue::from_str(&state.session.protocol_version()) {
        headers.insert(HeaderName::from_static(PROTOCOL_VERSION_HEADER), version);
    }

    let Some(outcome) = outcome else {
        return headers;
    };
    match HeaderValue::from_str(outcome.session_id()) {
        Ok(id) => {
            headers.insert(HeaderName::from_static(SESSION_ID_HEADER), id);
        }
        Err(e) => warn!(error = %e, "Session ID is not a valid header value"),
    }

    if let SessionOutcome::Created(id) = outcome {
        let cookie = format!("{SESSION_COOKIE}={id}; HttpOnly; Path=/; SameSite=Strict");
        if let Ok(cookie) = HeaderValue::from_str(&cookie) {
            headers.insert(header::SET_COOKIE, cookie);
        }
    }
    headers
}

fn unauthorized(state: &ServerState, headers: &HeaderMap) -> Response {
    let metadata_url = format!(
        "{}{}",
        resource_base(state, headers),
        state.config.resource_metadata_path
    );
    let mut response = (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    if let Ok(value) = HeaderValue::from_str(&challenge(&metadata_url)) {
        response
            .headers_mut()
            .insert(header::WWW_AUTHENTICATE, value);
    }
    response
}

/// Base URL of this resource: the configured one, or else derived from the `Host` header
fn resource_base(state: &ServerState, headers: &HeaderMap) -> String {
    let base = match &state.config.resource_url {
        Some(url) => url.clone(),
        None => {
            let host = headers
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("localhost");
            format!("http://{host}")
        }
    };
    base.trim_end_matches('/').to_string()
}

fn close_cancelled_stream(state: &ServerState, params: Option<&Value>) {
    match params.cloned().map(serde_json::from_value::<CancelledNotification>) {
        Some(Ok(cancelled)) => {
            if state.router.close_request_stream(&cancelled.request_id) {
                debug!(id = %cancelled.request_id, "Closed stream of cancelled request");
            }
        }
        _ => debug!("Cancellation without a usable request ID"),
    }
}

async fn enqueue(state: &ServerState, envelope: Envelope) -> Result<(), ()> {
    state.incoming.send(envelope).await.map_err(|_| {
        warn!("Inbound channel closed; dropping message");
    })
}

/// Detaches the stream when the client stops reading the response body
struct StreamGuard {
    router: Arc<MessageRouter>,
    stream: Arc<EventStream>,
    binding: StreamBinding,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        trace!(prefix = self.stream.prefix(), "Event stream response dropped");
        match &self.binding {
            StreamBinding::General => self.router.detach_general(self.stream.prefix()),
            StreamBinding::Request(_) => self.stream.detach(),
        }
    }
}

fn sse_response(
    events: mpsc::Receiver<SseEvent>,
    guard: StreamGuard,
    headers: HeaderMap,
) -> Response {
    let body = ReceiverStream::new(events).map(move |event| {
        let _guard = &guard;
        Ok::<_, Infallible>(event.to_wire())
    });

    (
        StatusCode::OK,
        headers,
        [
            (header::CONTENT_TYPE, TEXT_EVENT_STREAM),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(body),
    )
        .into_response()
}

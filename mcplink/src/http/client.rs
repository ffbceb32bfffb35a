//! Client side of the HTTP + server-sent events transport.
use super::sse::SseDecoder;
use super::{LAST_EVENT_ID_HEADER, PROTOCOL_VERSION_HEADER, SESSION_ID_HEADER};
use crate::config::HttpClientConfig;
use anyhow::Context;
use futures::StreamExt;
use mcplink_jsonrpc::transport::{Transport, TransportError};
use mcplink_jsonrpc::{Envelope, EnvelopeError};
use reqwest::header::{self, HeaderMap};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::*;
use url::Url;

const INCOMING_CAPACITY: usize = 256;
const POST_ACCEPT: &str = "application/json, text/event-stream";

#[derive(Debug, Default)]
struct ClientState {
    session_id: Option<String>,
    protocol_version: Option<String>,
    bearer_token: Option<String>,
    last_event_id: Option<String>,
}

/// Talks to an MCP server over HTTP.
///
/// Every [`Transport::send`] is a `POST`.  What comes back, either a JSON body or an event stream
/// read by a background task, is queued for [`Transport::receive`].  Messages the server sends on
/// its own initiative arrive only after [`Self::listen`] opens the general stream.
#[derive(Debug)]
pub struct HttpClientTransport {
    http: reqwest::Client,
    config: HttpClientConfig,
    endpoint: Url,
    state: Arc<Mutex<ClientState>>,
    incoming_tx: mpsc::Sender<Envelope>,
    incoming_rx: tokio::sync::Mutex<mpsc::Receiver<Envelope>>,
    readers: Mutex<Vec<JoinHandle<()>>>,
    closed: CancellationToken,
}

impl HttpClientTransport {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let endpoint = Url::parse(&config.endpoint)
            .with_context(|| format!("Parsing MCP endpoint URL '{}'", config.endpoint))?;
        let http = reqwest::Client::builder()
            .build()
            .context("Building HTTP client")?;
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_CAPACITY);

        let state = ClientState {
            bearer_token: config.bearer_token.clone(),
            ..Default::default()
        };

        Ok(Self {
            http,
            config,
            endpoint,
            state: Arc::new(Mutex::new(state)),
            incoming_tx,
            incoming_rx: tokio::sync::Mutex::new(incoming_rx),
            readers: Mutex::new(vec![]),
            closed: CancellationToken::new(),
        })
    }

    /// Use (or stop using) a bearer token on subsequent requests
    pub fn set_authorization(&self, token: Option<String>) {
        self.lock().bearer_token = token;
    }

    pub fn session_id(&self) -> Option<String> {
        self.lock().session_id.clone()
    }

    pub fn protocol_version(&self) -> Option<String> {
        self.lock().protocol_version.clone()
    }

    pub fn set_protocol_version(&self, version: impl Into<String>) {
        self.lock().protocol_version = Some(version.into());
    }

    pub fn last_event_id(&self) -> Option<String> {
        self.lock().last_event_id.clone()
    }

    /// Open the general event stream, resuming from the last event seen if there was one.
    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    pub async fn listen(&self) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }

        let mut request = self
            .request(Method::GET)
            .header(header::ACCEPT, super::accept::TEXT_EVENT_STREAM);
        if let Some(last_event_id) = self.last_event_id() {
            debug!(%last_event_id, "Resuming event stream");
            request = request.header(LAST_EVENT_ID_HEADER, last_event_id);
        }

        let response = request.send().await.map_err(request_error)?;
        let response = self.check_response(response)?;
        self.spawn_reader(response);
        Ok(())
    }

    fn request(&self, method: Method) -> reqwest::RequestBuilder {
        let state = self.lock();
        let mut builder = self
            .http
            .request(method, self.endpoint.clone())
            .header(header::ORIGIN, &self.config.origin);

        if let Some(session_id) = &state.session_id {
            builder = builder.header(SESSION_ID_HEADER, session_id);
        }
        if let Some(version) = &state.protocol_version {
            builder = builder.header(PROTOCOL_VERSION_HEADER, version);
        }
        if let Some(token) = &state.bearer_token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    /// Track session headers and turn failure statuses into errors
    fn check_response(
        &self,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, TransportError> {
        self.track_session(response.headers());

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            let challenge = response
                .headers()
                .get(header::WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            return Err(TransportError::Unauthorized { challenge });
        }
        if !status.is_success() {
            debug!(%status, "Server refused request");
            return Err(TransportError::Http {
                status: status.as_u16(),
            });
        }
        Ok(response)
    }

    fn track_session(&self, headers: &HeaderMap) {
        let mut state = self.lock();
        if let Some(id) = headers.get(SESSION_ID_HEADER).and_then(|v| v.to_str().ok()) {
            if state.session_id.as_deref() != Some(id) {
                debug!(session_id = id, "Server assigned session");
                state.session_id = Some(id.to_string());
            }
        }
        if let Some(version) = headers
            .get(PROTOCOL_VERSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            state.protocol_version = Some(version.to_string());
        }
    }

    fn spawn_reader(&self, response: reqwest::Response) {
        let incoming = self.incoming_tx.clone();
        let state = self.state.clone();
        let closed = self.closed.clone();

        let reader = tokio::spawn(async move {
            let mut decoder = SseDecoder::new();
            let mut body = response.bytes_stream();

            loop {
                let chunk = tokio::select! {
                    _ = closed.cancelled() => break,
                    chunk = body.next() => chunk,
                };
                let chunk = match chunk {
                    Some(Ok(chunk)) => chunk,
                    Some(Err(e)) => {
                        debug!(error = %e, "Event stream failed");
                        break;
                    }
                    None => break,
                };

                for event in decoder.push(&chunk) {
                    if let Some(id) = &event.id {
                        lock(&state).last_event_id = Some(id.clone());
                    }

                    match Envelope::from_str(&event.data) {
                        Ok(envelope) => {
                            if incoming.send(envelope).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!(error = %e, "Undecodable event from server; skipping"),
                    }
                }
            }
            trace!("Event stream ended");
        });

        let mut readers = self
            .readers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        readers.retain(|reader| !reader.is_finished());
        readers.push(reader);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ClientState> {
        lock(&self.state)
    }
}

#[async_trait::async_trait]
impl Transport for HttpClientTransport {
    #[instrument(skip_all, fields(method = envelope.method().unwrap_or("<response>")))]
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }

        let is_initialize =
            matches!(&envelope, Envelope::Request(request) if request.method == "initialize");
        let body = serde_json::to_vec(&envelope).map_err(TransportError::Encode)?;

        let response = self
            .request(Method::POST)
            .header(header::ACCEPT, POST_ACCEPT)
            .header(header::CONTENT_TYPE, super::accept::APPLICATION_JSON)
            .body(body)
            .send()
            .await
            .map_err(request_error)?;
        let response = self.check_response(response)?;

        if response.status() == StatusCode::ACCEPTED {
            return Ok(());
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();

        if content_type.starts_with(super::accept::TEXT_EVENT_STREAM) {
            self.spawn_reader(response);
        } else if content_type.starts_with(super::accept::APPLICATION_JSON) {
            let bytes = response.bytes().await.map_err(request_error)?;
            let envelope = serde_json::from_slice::<Value>(&bytes)
                .map_err(EnvelopeError::from)
                .and_then(Envelope::from_value)
                .map_err(TransportError::Malformed)?;

            if is_initialize {
                if let Envelope::Response(response) = &envelope {
                    if let Some(version) = response
                        .result
                        .get("protocolVersion")
                        .and_then(Value::as_str)
                    {
                        self.set_protocol_version(version);
                    }
                }
            }

            self.incoming_tx
                .send(envelope)
                .await
                .map_err(|_| TransportError::Closed)?;
        } else {
            trace!(%content_type, "Response carries no envelope");
        }
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Envelope>, TransportError> {
        let timeout = self.config.receive_timeout();
        let mut incoming = self.incoming_rx.lock().await;

        let next = async {
            tokio::select! {
                biased;
                envelope = incoming.recv() => envelope,
                _ = self.closed.cancelled() => None,
            }
        };

        tokio::time::timeout(timeout, next)
            .await
            .map_err(|_| TransportError::Timeout(timeout))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Ok(());
        }

        if self.session_id().is_some() {
            match self.request(Method::DELETE).send().await {
                Ok(response) => debug!(status = %response.status(), "Session deleted"),
                Err(e) => debug!(error = %e, "Error deleting session; closing anyway"),
            }
        }

        self.closed.cancel();
        let readers: Vec<_> = self
            .readers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for reader in readers {
            reader.abort();
        }

        self.lock().session_id = None;
        Ok(())
    }
}

fn request_error(error: reqwest::Error) -> TransportError {
    TransportError::Request(Box::new(error))
}

fn lock(state: &Mutex<ClientState>) -> std::sync::MutexGuard<'_, ClientState> {
    state
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

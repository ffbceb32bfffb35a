use super::{CancelledNotification, MethodContext, RequestHandler, CANCELLED_METHOD};
use crate::config::RuntimeConfig;
use crate::error::RpcError;
use crate::progress::{
    progress_token_from_params, ProgressNotification, ProgressRegistry, PROGRESS_METHOD,
};
use mcplink_jsonrpc::transport::{Transport, TransportError};
use mcplink_jsonrpc::{
    CancellationTracker, Envelope, JsonRpcError, Notification, PendingError, PendingRequestTable,
    ProgressToken, RateLimiter, Request, RequestId,
};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::*;

struct PeerInner {
    transport: Arc<dyn Transport>,

    /// Requests this side sent
    pending: PendingRequestTable,

    /// Requests the remote side sent that are still being handled
    cancellations: CancellationTracker,

    progress: ProgressRegistry,
    request_timeout: Duration,
    progress_listener: Mutex<Option<mpsc::UnboundedSender<ProgressNotification>>>,
}

/// One end of a JSON-RPC connection.
///
/// Sends requests and notifications to the remote side, and (in [`Self::serve`]) reads what the
/// remote side sends: responses complete the matching pending request, notifications are handled
/// in arrival order, and each request is handled in a task of its own so a slow handler never
/// holds up the connection.
///
/// Cheap to clone; every clone is the same connection.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("pending", &self.inner.pending.len())
            .field("in_flight", &self.inner.cancellations.len())
            .finish_non_exhaustive()
    }
}

impl Peer {
    pub fn new(transport: Arc<dyn Transport>, config: &RuntimeConfig) -> Self {
        let limiter = RateLimiter::new(
            config.rate_limits.progress_per_second,
            config.rate_limits.window(),
        );

        Self {
            inner: Arc::new(PeerInner {
                transport,
                pending: PendingRequestTable::new(config.initial_request_id),
                cancellations: CancellationTracker::new(),
                progress: ProgressRegistry::new(limiter),
                request_timeout: config.request_timeout(),
                progress_listener: Mutex::new(None),
            }),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    /// Send a request and wait for the result, up to the default request timeout
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        self.request_with_timeout(method, params, self.inner.request_timeout)
            .await
    }

    /// Send a request and wait for the result.
    ///
    /// If no answer arrives within `timeout`, the remote side is told the request is cancelled
    /// and [`RpcError::Timeout`] is returned.  A response arriving after that is dropped.
    #[instrument(skip(self, params))]
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        let inner = &self.inner;
        let id = inner.pending.next_id();
        let progress_token = progress_token_from_params(params.as_ref()).unwrap_or_else(|e| {
            debug!(error = %e, "Request carries an unusable progress token");
            None
        });

        let pending = inner.pending.register(id.clone(), progress_token.clone())?;
        let _outstanding = Outstanding {
            inner,
            id: id.clone(),
            progress_token,
        };
        inner
            .transport
            .send(Envelope::request(id.clone(), method, params))
            .await?;

        let outcome = inner.pending.wait(pending, timeout).await;

        match outcome {
            Ok(result) => Ok(result),
            Err(PendingError::Timeout { id, timeout }) => {
                warn!(%id, ?timeout, "Request timed out; cancelling");
                if let Err(e) = self.cancel(&id, Some("timeout")).await {
                    debug!(error = %e, "Could not send cancellation");
                }
                Err(RpcError::Timeout { id, timeout })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), RpcError> {
        self.inner
            .transport
            .send(Envelope::notification(method, params))
            .await?;
        Ok(())
    }

    /// Tell the remote side to stop working on a request this side sent
    pub async fn cancel(&self, id: &RequestId, reason: Option<&str>) -> Result<(), RpcError> {
        let params = serde_json::to_value(CancelledNotification {
            request_id: id.clone(),
            reason: reason.map(str::to_string),
        })
        .map_err(RpcError::Serialize)?;
        self.notify(CANCELLED_METHOD, Some(params)).await
    }

    /// Receive the progress notifications the remote side sends for requests of this side.
    /// Replaces any previous listener.
    pub fn progress_events(&self) -> mpsc::UnboundedReceiver<ProgressNotification> {
        let (sender, receiver) = mpsc::unbounded_channel();
        *self
            .inner
            .progress_listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(sender);
        receiver
    }

    /// Number of requests this side is waiting on
    pub fn pending_len(&self) -> usize {
        self.inner.pending.len()
    }

    /// Number of remote requests still being handled
    pub fn in_flight_len(&self) -> usize {
        self.inner.cancellations.len()
    }

    /// Close the transport.  Requests still waiting fail with [`RpcError::Closed`].
    pub async fn close(&self) -> Result<(), RpcError> {
        let result = self.inner.transport.close().await;
        self.abandon("Transport closed");
        result.map_err(Into::into)
    }

    /// Read from the transport until it closes, dispatching inbound messages to `handler`.
    ///
    /// Returns `Ok(())` when the remote side goes away cleanly.  Either way, when this returns
    /// every pending request has been failed and every in-flight handler cancelled.
    pub async fn serve(&self, handler: Arc<dyn RequestHandler>) -> Result<(), TransportError> {
        let result = loop {
            let envelope = match self.inner.transport.receive().await {
                Ok(Some(envelope)) => envelope,
                Ok(None) => {
                    debug!("Transport reached end of stream");
                    break Ok(());
                }
                Err(TransportError::Malformed(e)) => {
                    warn!(error = %e, "Malformed message from peer");
                    self.reply(e.to_error_envelope()).await;
                    continue;
                }
                Err(e) if e.is_recoverable() => {
                    trace!(error = %e, "Recoverable transport error");
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "Transport failed");
                    break Err(e);
                }
            };

            match envelope {
                Envelope::Response(response) => {
                    self.inner.pending.complete(&response.id, Ok(response.result));
                }
                Envelope::Error(error) => match &error.id {
                    Some(id) => {
                        self.inner.pending.complete(id, Err(error.error));
                    }
                    None => warn!(
                        code = error.error.code,
                        message = %error.error.message,
                        "Peer reported an error that isn't tied to a request"
                    ),
                },
                Envelope::Notification(notification) => {
                    self.handle_notification(handler.as_ref(), notification)
                        .await
                }
                Envelope::Request(request) => {
                    let peer = self.clone();
                    let handler = handler.clone();
                    tokio::spawn(async move { peer.handle_request(handler, request).await });
                }
            }
        };

        self.abandon("Transport closed");
        handler.on_shutdown().await;
        result
    }

    async fn handle_notification(&self, handler: &dyn RequestHandler, notification: Notification) {
        match notification.method.as_str() {
            CANCELLED_METHOD => match notification
                .params
                .clone()
                .map(serde_json::from_value::<CancelledNotification>)
            {
                Some(Ok(cancelled)) => {
                    self.inner
                        .cancellations
                        .cancel(&cancelled.request_id, cancelled.reason);
                }
                _ => warn!("Malformed cancellation notification; ignoring"),
            },
            PROGRESS_METHOD => {
                if let Some(progress) = self.inner.progress.record(notification.params.as_ref()) {
                    let listener = self
                        .inner
                        .progress_listener
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .clone();
                    if let Some(listener) = listener {
                        let _ = listener.send(progress);
                    }
                }
            }
            _ => {}
        }

        handler
            .handle_notification(&notification.method, notification.params, self)
            .await;
    }

    #[instrument(skip_all, fields(id = %request.id, method = %request.method))]
    async fn handle_request(&self, handler: Arc<dyn RequestHandler>, request: Request) {
        let Request { id, method, params } = request;
        let inner = &self.inner;

        let abort = match inner.cancellations.track(id.clone()) {
            Ok(abort) => abort,
            Err(e) => {
                warn!(error = %e, "Duplicate request ID");
                self.reply(Envelope::error(
                    id,
                    JsonRpcError::invalid_request(e.to_string()),
                ))
                .await;
                return;
            }
        };

        let progress_token = match inner.progress.register(&id, params.as_ref()) {
            Ok(token) => token,
            Err(e) => {
                inner.cancellations.release(&id);
                self.reply(Envelope::error(id, e)).await;
                return;
            }
        };

        let context = MethodContext::new(id.clone(), abort.clone(), progress_token, self.clone());
        context
            .report_progress(0.0, None, Some("in progress"))
            .await;

        let response = if abort.is_cancelled() {
            None
        } else {
            let outcome = handler.handle_request(&method, params, context.clone()).await;
            if abort.is_cancelled() {
                None
            } else {
                match outcome {
                    Ok(result) => {
                        context.report_progress(1.0, None, Some("completed")).await;
                        Some(Envelope::response(id.clone(), result))
                    }
                    Err(e) => {
                        debug!(code = e.code(), message = e.message(), "Request failed");
                        Some(Envelope::error(id.clone(), e))
                    }
                }
            }
        };

        inner.progress.release(&id);
        let reason = inner.cancellations.reason(&id);
        inner.cancellations.release(&id);

        match response {
            Some(response) => self.reply(response).await,
            None => debug!(
                reason = reason.as_deref().unwrap_or(""),
                "Request was cancelled; not responding"
            ),
        }
    }

    /// Send a progress notification for a request being handled, subject to the registry's
    /// ordering and rate rules.
    pub(crate) async fn send_progress(
        &self,
        token: &ProgressToken,
        progress: f64,
        total: Option<f64>,
        message: Option<&str>,
    ) -> Result<(), TransportError> {
        match self
            .inner
            .progress
            .emit(token, progress, total, message.map(str::to_string))
        {
            Some(envelope) => self.inner.transport.send(envelope).await,
            None => Ok(()),
        }
    }

    pub(crate) fn is_cancelled(&self, id: &RequestId) -> bool {
        self.inner.cancellations.is_cancelled(id)
    }

    async fn reply(&self, envelope: Envelope) {
        if let Err(e) = self.inner.transport.send(envelope).await {
            warn!(error = %e, "Error sending reply");
        }
    }

    fn abandon(&self, reason: &str) {
        self.inner.pending.fail_all(reason);
        self.inner.cancellations.cancel_all(reason);
    }
}

/// A request this side sent and is still waiting on.  Whether the wait ends with an outcome or
/// the caller simply stops waiting, the pending entry and any progress state go away with it.
struct Outstanding<'a> {
    inner: &'a PeerInner,
    id: RequestId,
    progress_token: Option<ProgressToken>,
}

impl Drop for Outstanding<'_> {
    fn drop(&mut self) {
        if self.inner.pending.remove(&self.id) {
            debug!(id = %self.id, "Request abandoned by its caller");
        }
        if let Some(token) = &self.progress_token {
            self.inner.progress.forget_received(token);
        }
    }
}

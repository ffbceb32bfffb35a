use super::Peer;
use mcplink_jsonrpc::{JsonRpcError, ProgressToken, RequestId};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::*;

/// Application logic plugged into a [`Peer`].
///
/// Every method has a default, so implementations only override what they serve.
#[async_trait::async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle_request(
        &self,
        method: &str,
        params: Option<Value>,
        context: MethodContext,
    ) -> Result<Value, JsonRpcError> {
        let _ = (params, context);
        Err(JsonRpcError::method_not_found(method))
    }

    async fn handle_notification(&self, method: &str, params: Option<Value>, peer: &Peer) {
        let _ = (params, peer);
        trace!(method, "Unhandled notification");
    }

    /// The handshake has completed
    async fn on_initialized(&self, peer: &Peer) {
        let _ = peer;
    }

    /// The connection is gone
    async fn on_shutdown(&self) {}
}

/// What a request handler gets to know about the request it is serving.
#[derive(Clone, Debug)]
pub struct MethodContext {
    request_id: RequestId,
    abort: CancellationToken,
    progress_token: Option<ProgressToken>,
    peer: Peer,
}

impl MethodContext {
    pub(crate) fn new(
        request_id: RequestId,
        abort: CancellationToken,
        progress_token: Option<ProgressToken>,
        peer: Peer,
    ) -> Self {
        Self {
            request_id,
            abort,
            progress_token,
            peer,
        }
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Tripped when the remote side cancels the request.  Long-running handlers should check it
    /// or select on [`CancellationToken::cancelled`].
    pub fn abort_token(&self) -> &CancellationToken {
        &self.abort
    }

    pub fn is_cancelled(&self) -> bool {
        self.abort.is_cancelled()
    }

    pub fn progress_token(&self) -> Option<&ProgressToken> {
        self.progress_token.as_ref()
    }

    /// The connection the request arrived on, for nested requests back to the caller
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Report progress, if the caller asked for it.  Reports that don't move progress forward,
    /// or that come too fast, are dropped.
    pub async fn report_progress(&self, progress: f64, total: Option<f64>, message: Option<&str>) {
        let Some(token) = &self.progress_token else {
            return;
        };
        if self.is_cancelled() {
            return;
        }

        if let Err(e) = self.peer.send_progress(token, progress, total, message).await {
            warn!(error = %e, "Error sending progress");
        }
    }
}

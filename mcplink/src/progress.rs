//! Progress notifications for long-running requests.
use mcplink_jsonrpc::{Envelope, JsonRpcError, ProgressToken, RateLimiter, RequestId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::*;

pub const PROGRESS_METHOD: &str = "notifications/progress";

/// Params of a `notifications/progress` message
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressNotification {
    pub progress_token: ProgressToken,
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Pull `_meta.progressToken` out of request params, if the request asked for progress.
pub fn progress_token_from_params(
    params: Option<&Value>,
) -> Result<Option<ProgressToken>, JsonRpcError> {
    let Some(token) = params
        .and_then(|params| params.get("_meta"))
        .and_then(|meta| meta.get("progressToken"))
    else {
        return Ok(None);
    };

    match token {
        Value::String(s) => Ok(Some(ProgressToken::String(s.clone()))),
        Value::Number(n) => n
            .as_i64()
            .map(|n| Some(ProgressToken::Number(n)))
            .ok_or_else(|| JsonRpcError::invalid_params("Progress token must be a string or an integer")),
        _ => Err(JsonRpcError::invalid_params(
            "Progress token must be a string or an integer",
        )),
    }
}

#[derive(Debug, Default)]
struct ProgressState {
    by_request: HashMap<RequestId, ProgressToken>,

    /// Outbound tokens of requests still being handled, with the last progress value sent
    active: HashMap<ProgressToken, Option<f64>>,

    /// Last progress value received from the peer, per token
    received: HashMap<ProgressToken, f64>,
}

/// Associates inbound requests with the progress tokens they carry, and throttles the progress
/// notifications sent for them.
///
/// Progress for a token must strictly increase.  Notifications that would go backwards, that are
/// for a token no longer active, or that exceed the rate limit are silently dropped.
#[derive(Debug)]
pub struct ProgressRegistry {
    limiter: RateLimiter,
    state: Mutex<ProgressState>,
}

impl ProgressRegistry {
    pub fn new(limiter: RateLimiter) -> Self {
        Self {
            limiter,
            state: Mutex::new(ProgressState::default()),
        }
    }

    /// Register the progress token carried by a request, if any.
    pub fn register(
        &self,
        id: &RequestId,
        params: Option<&Value>,
    ) -> Result<Option<ProgressToken>, JsonRpcError> {
        let Some(token) = progress_token_from_params(params)? else {
            return Ok(None);
        };

        let mut state = self.lock();
        if state.active.contains_key(&token) {
            return Err(JsonRpcError::invalid_params(format!(
                "Progress token {token} is already in use"
            )));
        }
        state.active.insert(token.clone(), None);
        state.by_request.insert(id.clone(), token.clone());
        Ok(Some(token))
    }

    pub fn release(&self, id: &RequestId) {
        let mut state = self.lock();
        if let Some(token) = state.by_request.remove(id) {
            state.active.remove(&token);
        }
    }

    pub fn token_for(&self, id: &RequestId) -> Option<ProgressToken> {
        self.lock().by_request.get(id).cloned()
    }

    /// Build the progress notification to send, or `None` if it should be dropped.
    pub fn emit(
        &self,
        token: &ProgressToken,
        progress: f64,
        total: Option<f64>,
        message: Option<String>,
    ) -> Option<Envelope> {
        let mut state = self.lock();
        let Some(last) = state.active.get_mut(token) else {
            debug!(%token, "Progress for inactive token; dropping");
            return None;
        };

        if last.is_some_and(|last| progress <= last) {
            debug!(%token, progress, "Progress did not increase; dropping");
            return None;
        }

        if self.limiter.require_allowance(&token.to_string()).is_err() {
            debug!(%token, progress, "Progress rate limited; dropping");
            return None;
        }

        *last = Some(progress);
        let notification = ProgressNotification {
            progress_token: token.clone(),
            progress,
            total,
            message,
        };

        match serde_json::to_value(&notification) {
            Ok(params) => Some(Envelope::notification(PROGRESS_METHOD, params)),
            Err(e) => {
                error!(error = %e, "Error serializing progress notification");
                None
            }
        }
    }

    /// Record an inbound progress notification.  Returns it if it's well-formed and moves
    /// progress forward.
    pub fn record(&self, params: Option<&Value>) -> Option<ProgressNotification> {
        let notification: ProgressNotification = match params.cloned().map(serde_json::from_value)
        {
            Some(Ok(notification)) => notification,
            Some(Err(e)) => {
                warn!(error = %e, "Malformed progress notification; ignoring");
                return None;
            }
            None => {
                warn!("Progress notification without params; ignoring");
                return None;
            }
        };

        let mut state = self.lock();
        let last = state.received.get(&notification.progress_token).copied();
        if last.is_some_and(|last| notification.progress <= last) {
            debug!(token = %notification.progress_token, progress = notification.progress, "Inbound progress did not increase; ignoring");
            return None;
        }

        state
            .received
            .insert(notification.progress_token.clone(), notification.progress);
        Some(notification)
    }

    /// Forget what was received for a token, once the request it belongs to is finished
    pub fn forget_received(&self, token: &ProgressToken) {
        self.lock().received.remove(token);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ProgressState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

use crate::RequestId;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::*;

#[derive(Debug, thiserror::Error)]
#[error("Request ID {0} is already being processed")]
pub struct DuplicateRequest(pub RequestId);

#[derive(Debug)]
struct Tracked {
    token: CancellationToken,
    reason: Option<String>,
}

/// Tracks inbound requests that are still being handled, so the peer can cancel them.
///
/// Cancellation is cooperative: cancelling a request only trips its token and records the reason.
/// The handler (or the runtime wrapping it) checks the token at its own convenience.
#[derive(Debug, Default)]
pub struct CancellationTracker {
    in_flight: Mutex<HashMap<RequestId, Tracked>>,
}

impl CancellationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a request.  Fails if a request with the same ID is still in flight.
    pub fn track(&self, id: RequestId) -> Result<CancellationToken, DuplicateRequest> {
        let mut in_flight = self.lock();
        if in_flight.contains_key(&id) {
            return Err(DuplicateRequest(id));
        }

        let token = CancellationToken::new();
        in_flight.insert(
            id,
            Tracked {
                token: token.clone(),
                reason: None,
            },
        );
        Ok(token)
    }

    /// Cancel a request.  Cancelling an unknown or already-cancelled request is a no-op; the
    /// first reason wins.  Returns whether the request was known.
    pub fn cancel(&self, id: &RequestId, reason: Option<String>) -> bool {
        let mut in_flight = self.lock();
        let Some(tracked) = in_flight.get_mut(id) else {
            debug!(%id, "Cancellation for unknown request ID; ignoring");
            return false;
        };

        if !tracked.token.is_cancelled() {
            debug!(%id, reason = reason.as_deref().unwrap_or(""), "Cancelling request");
            tracked.reason = reason;
            tracked.token.cancel();
        }
        true
    }

    pub fn is_cancelled(&self, id: &RequestId) -> bool {
        self.lock()
            .get(id)
            .is_some_and(|tracked| tracked.token.is_cancelled())
    }

    pub fn reason(&self, id: &RequestId) -> Option<String> {
        self.lock()
            .get(id)
            .and_then(|tracked| tracked.reason.clone())
    }

    /// Stop tracking a request once it has finished, cancelled or not.
    pub fn release(&self, id: &RequestId) {
        self.lock().remove(id);
    }

    pub fn cancel_all(&self, reason: &str) {
        let mut in_flight = self.lock();
        for (id, tracked) in in_flight.iter_mut() {
            if !tracked.token.is_cancelled() {
                trace!(%id, "Cancelling request");
                tracked.reason = Some(reason.to_string());
                tracked.token.cancel();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, Tracked>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

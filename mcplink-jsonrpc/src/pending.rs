//! Bookkeeping for requests this side has sent and is still waiting on.
use crate::{ErrorObject, ProgressToken, RequestId};
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::*;

const SHARD_COUNT: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum PendingError {
    #[error("Request ID {0} is already in flight")]
    Duplicate(RequestId),

    #[error("Request {id} timed out after {timeout:?}")]
    Timeout { id: RequestId, timeout: Duration },

    #[error("Peer returned error {}: {}", .0.code, .0.message)]
    Remote(ErrorObject),

    #[error("Request abandoned: {0}")]
    Closed(String),
}

type Outcome = Result<Value, PendingError>;

struct Entry {
    created_at: Instant,
    progress_token: Option<ProgressToken>,
    slot: oneshot::Sender<Outcome>,
}

/// Handle to one registered request, used to wait for its outcome.
#[derive(Debug)]
pub struct PendingRequest {
    id: RequestId,
    progress_token: Option<ProgressToken>,
    receiver: oneshot::Receiver<Outcome>,
}

impl PendingRequest {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub fn progress_token(&self) -> Option<&ProgressToken> {
        self.progress_token.as_ref()
    }
}

/// Correlates outgoing request IDs with whoever is waiting on the result.
///
/// The map is split into shards, each with its own lock, so completions arriving on the reader
/// task don't contend with new registrations from request tasks.  Every registered ID leaves the
/// table exactly once: on completion, on timeout in [`Self::wait`], via [`Self::remove`], or when
/// the connection fails everything with [`Self::fail_all`].
pub struct PendingRequestTable {
    shards: Vec<Mutex<HashMap<RequestId, Entry>>>,
    next_id: AtomicI64,
}

impl Default for PendingRequestTable {
    fn default() -> Self {
        Self::new(1)
    }
}

impl std::fmt::Debug for PendingRequestTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequestTable")
            .field("len", &self.len())
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish()
    }
}

impl PendingRequestTable {
    pub fn new(initial_id: i64) -> Self {
        Self {
            shards: (0..SHARD_COUNT)
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
            next_id: AtomicI64::new(initial_id),
        }
    }

    /// Mint a fresh request ID
    pub fn next_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn register(
        &self,
        id: RequestId,
        progress_token: Option<ProgressToken>,
    ) -> Result<PendingRequest, PendingError> {
        let (sender, receiver) = oneshot::channel();
        let mut shard = self.shard(&id);

        if shard.contains_key(&id) {
            return Err(PendingError::Duplicate(id));
        }
        shard.insert(
            id.clone(),
            Entry {
                created_at: Instant::now(),
                progress_token: progress_token.clone(),
                slot: sender,
            },
        );

        Ok(PendingRequest {
            id,
            progress_token,
            receiver,
        })
    }

    /// Deliver the outcome of a request.  Returns `false` if nothing was waiting on this ID, which
    /// happens for late responses after a timeout and isn't an error.
    pub fn complete(&self, id: &RequestId, result: Result<Value, ErrorObject>) -> bool {
        let Some(entry) = self.shard(id).remove(id) else {
            debug!(%id, "Response for unknown or expired request ID; dropping");
            return false;
        };

        trace!(%id, elapsed = ?entry.created_at.elapsed(), "Request completed");

        // The waiter may have been dropped without calling `wait`; nothing to do then
        let _ = entry.slot.send(result.map_err(PendingError::Remote));
        true
    }

    /// Wait for the outcome of a request, giving up after `timeout`.  The entry is removed from
    /// the table no matter how this returns, including when the future is dropped first.
    pub async fn wait(&self, pending: PendingRequest, timeout: Duration) -> Outcome {
        let PendingRequest { id, receiver, .. } = pending;
        let _release = self.release_on_drop(id.clone());

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(PendingError::Closed(format!(
                "request {id} was removed before it completed"
            ))),
            Err(_) => Err(PendingError::Timeout { id, timeout }),
        }
    }

    /// Remove `id` from the table when the returned guard goes out of scope, however that
    /// happens.  Removing an ID that already completed is a no-op.
    pub fn release_on_drop(&self, id: RequestId) -> ReleaseOnDrop<'_> {
        ReleaseOnDrop { table: self, id }
    }

    /// Drop a request without an outcome.  Anyone waiting on it sees [`PendingError::Closed`].
    pub fn remove(&self, id: &RequestId) -> bool {
        self.shard(id).remove(id).is_some()
    }

    /// Fail every outstanding request, for instance because the transport went away.
    pub fn fail_all(&self, reason: &str) {
        let mut failed = 0usize;
        for shard in &self.shards {
            let drained: Vec<Entry> = lock(shard).drain().map(|(_, entry)| entry).collect();
            for entry in drained {
                failed += 1;
                let _ = entry.slot.send(Err(PendingError::Closed(reason.to_string())));
            }
        }

        if failed > 0 {
            debug!(failed, reason, "Failed all pending requests");
        }
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.shard(id).contains_key(id)
    }

    pub fn progress_token(&self, id: &RequestId) -> Option<ProgressToken> {
        self.shard(id)
            .get(id)
            .and_then(|entry| entry.progress_token.clone())
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| lock(shard).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn shard(&self, id: &RequestId) -> std::sync::MutexGuard<'_, HashMap<RequestId, Entry>> {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.shards.len();
        lock(&self.shards[index])
    }
}

/// See [`PendingRequestTable::release_on_drop`]
#[derive(Debug)]
pub struct ReleaseOnDrop<'a> {
    table: &'a PendingRequestTable,
    id: RequestId,
}

impl Drop for ReleaseOnDrop<'_> {
    fn drop(&mut self) {
        if self.table.remove(&self.id) {
            debug!(id = %self.id, "Caller stopped waiting; released pending request");
        }
    }
}

/// None of the critical sections can panic halfway through an update, so a poisoned lock still
/// guards a consistent map.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

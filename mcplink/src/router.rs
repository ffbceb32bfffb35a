//! Decides where an outbound envelope goes on the HTTP transport.
use crate::event_stream::EventStream;
use mcplink_jsonrpc::{Envelope, ErrorObject, RequestId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,

    /// No destination is available yet; try again later
    Pending,

    /// There is no destination and never will be
    NotFound,
}

/// What a stream found by prefix was carrying
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamBinding {
    General,
    Request(RequestId),
}

#[derive(Debug, Default)]
struct Registry {
    /// Streams opened by a POSTed request, carrying everything related to that request
    request_streams: HashMap<RequestId, Arc<EventStream>>,

    /// One-shot slots for responses that are returned in an HTTP body rather than a stream
    response_slots: HashMap<RequestId, oneshot::Sender<Envelope>>,

    general: Vec<Arc<EventStream>>,

    /// The general stream whose client disconnected most recently.  Its history covers the gap
    /// until the client reconnects.
    last_general: Option<Arc<EventStream>>,

    by_prefix: HashMap<String, (Arc<EventStream>, StreamBinding)>,
}

/// Routing table from envelopes to the event streams and response slots that should carry them.
///
/// Routing never blocks and never fails; "can't deliver right now" is an outcome, not an error.
#[derive(Debug, Default)]
pub struct MessageRouter {
    registry: Mutex<Registry>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(&self, envelope: &Envelope) -> RouteOutcome {
        let mut registry = self.lock();

        if let Some(id) = envelope.id() {
            if let Some(stream) = registry.request_streams.get(id).cloned() {
                if stream.is_active() {
                    stream.send(envelope);
                    if envelope.is_terminal() {
                        trace!(%id, "Terminal response sent; closing request stream");
                        registry.request_streams.remove(id);
                        registry.by_prefix.remove(stream.prefix());
                        stream.close();
                    }
                    return RouteOutcome::Delivered;
                }

                debug!(%id, "Request stream no longer active; unbinding");
                registry.request_streams.remove(id);
                registry.by_prefix.remove(stream.prefix());
            }

            if let Some(slot) = registry.response_slots.remove(id) {
                return match slot.send(envelope.clone()) {
                    Ok(()) => RouteOutcome::Delivered,
                    Err(_) => {
                        debug!(%id, "Response slot receiver gone");
                        RouteOutcome::NotFound
                    }
                };
            }
        }

        match envelope {
            Envelope::Request(_) | Envelope::Notification(_) => registry.route_general(envelope),
            Envelope::Response(_) | Envelope::Error(_) => RouteOutcome::NotFound,
        }
    }

    pub fn bind_request_stream(&self, id: RequestId, stream: Arc<EventStream>) {
        let mut registry = self.lock();
        registry.by_prefix.insert(
            stream.prefix().to_string(),
            (stream.clone(), StreamBinding::Request(id.clone())),
        );
        registry.request_streams.insert(id, stream);
    }

    pub fn unbind_request_stream(&self, id: &RequestId) -> Option<Arc<EventStream>> {
        let mut registry = self.lock();
        let stream = registry.request_streams.remove(id)?;
        registry.by_prefix.remove(stream.prefix());
        Some(stream)
    }

    /// Unbind and close the stream of a request, for example because it was cancelled
    pub fn close_request_stream(&self, id: &RequestId) -> bool {
        match self.unbind_request_stream(id) {
            Some(stream) => {
                stream.close();
                true
            }
            None => false,
        }
    }

    pub fn has_request_stream(&self, id: &RequestId) -> bool {
        self.lock().request_streams.contains_key(id)
    }

    pub fn register_response_slot(&self, id: RequestId) -> oneshot::Receiver<Envelope> {
        let (sender, receiver) = oneshot::channel();
        self.lock().response_slots.insert(id, sender);
        receiver
    }

    pub fn remove_response_slot(&self, id: &RequestId) -> bool {
        self.lock().response_slots.remove(id).is_some()
    }

    pub fn attach_general(&self, stream: Arc<EventStream>) {
        let mut registry = self.lock();
        if !registry
            .general
            .iter()
            .any(|existing| existing.prefix() == stream.prefix())
        {
            registry.general.push(stream.clone());
        }
        registry
            .by_prefix
            .insert(stream.prefix().to_string(), (stream, StreamBinding::General));
    }

    /// The client of a general stream went away.  The stream stays resumable by prefix.
    pub fn detach_general(&self, prefix: &str) {
        let mut registry = self.lock();
        let Some(index) = registry
            .general
            .iter()
            .position(|stream| stream.prefix() == prefix)
        else {
            return;
        };

        let stream = registry.general.remove(index);
        stream.detach();
        registry.last_general = Some(stream);
    }

    /// Find a stream that a reconnecting client can resume, by the prefix of its event IDs
    pub fn resume(&self, prefix: &str) -> Option<(Arc<EventStream>, StreamBinding)> {
        self.lock()
            .by_prefix
            .get(prefix)
            .filter(|(stream, _)| !stream.is_closed())
            .cloned()
    }

    /// Answer every outstanding response slot with an error
    pub fn fail_response_slots(&self, error: ErrorObject) {
        let slots: Vec<_> = self.lock().response_slots.drain().collect();
        for (id, slot) in slots {
            let _ = slot.send(Envelope::error(id, error.clone()));
        }
    }

    /// Close every stream and forget all routing state
    pub fn clear(&self) {
        let mut registry = self.lock();
        for (stream, _) in registry.by_prefix.values() {
            stream.close();
        }
        for stream in registry.general.iter().chain(registry.last_general.iter()) {
            stream.close();
        }
        for stream in registry.request_streams.values() {
            stream.close();
        }
        *registry = Registry::default();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Registry {
    fn route_general(&self, envelope: &Envelope) -> RouteOutcome {
        let active: Vec<_> = self
            .general
            .iter()
            .filter(|stream| stream.is_active())
            .cloned()
            .collect();

        if !active.is_empty() {
            for stream in active {
                stream.send(envelope);
            }
            return RouteOutcome::Delivered;
        }

        match &self.last_general {
            Some(stream) if !stream.is_closed() => {
                stream.send(envelope);
                RouteOutcome::Delivered
            }
            _ => RouteOutcome::Pending,
        }
    }
}

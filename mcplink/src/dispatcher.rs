use crate::event_stream::EventStream;
use crate::router::{MessageRouter, RouteOutcome};
use mcplink_jsonrpc::Envelope;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::*;

/// Sends outbound envelopes through the router, holding on to the ones that have nowhere to go
/// yet.
///
/// Held envelopes are retried oldest first whenever something new is dispatched or the
/// dispatcher is flushed, so a later envelope never overtakes an earlier one bound for the same
/// destination.  The lock also serializes all outbound writes on the transport.
#[derive(Debug)]
pub struct MessageDispatcher {
    router: Arc<MessageRouter>,
    backlog: Mutex<VecDeque<Envelope>>,
}

impl MessageDispatcher {
    pub fn new(router: Arc<MessageRouter>) -> Self {
        Self {
            router,
            backlog: Mutex::new(VecDeque::new()),
        }
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn dispatch(&self, envelope: Envelope) -> RouteOutcome {
        let mut backlog = self.lock();
        self.drain(&mut backlog);

        let outcome = self.router.route(&envelope);
        match outcome {
            RouteOutcome::Delivered => self.drain(&mut backlog),
            RouteOutcome::Pending => {
                trace!(method = envelope.method(), "No destination yet; holding envelope");
                backlog.push_back(envelope);
            }
            RouteOutcome::NotFound => {
                warn!(id = ?envelope.id(), method = envelope.method(), "No destination for envelope; dropping");
            }
        }
        outcome
    }

    /// Start delivering general traffic to `stream`, handing it the held envelopes first.
    ///
    /// Attaching under the backlog lock keeps a concurrent [`Self::dispatch`] from delivering a
    /// new envelope to the stream ahead of the ones still held.
    pub fn attach_general(&self, stream: Arc<EventStream>) {
        let mut backlog = self.lock();
        self.router.attach_general(stream);
        self.drain(&mut backlog);
    }

    /// Retry held envelopes, typically because a stream just attached
    pub fn flush(&self) {
        let mut backlog = self.lock();
        self.drain(&mut backlog);
    }

    pub fn backlog_len(&self) -> usize {
        self.lock().len()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn drain(&self, backlog: &mut VecDeque<Envelope>) {
        while let Some(envelope) = backlog.front() {
            match self.router.route(envelope) {
                RouteOutcome::Delivered => {}
                RouteOutcome::NotFound => {
                    warn!(id = ?envelope.id(), method = envelope.method(), "Held envelope has no destination; dropping");
                }
                RouteOutcome::Pending => break,
            }
            backlog.pop_front();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Envelope>> {
        self.backlog
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcplink_jsonrpc::RequestId;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    fn numbered(n: u64) -> Envelope {
        Envelope::notification("notifications/message", json!({"n": n}))
    }

    /// Envelopes dispatched while nothing is listening arrive in dispatch order once a stream
    /// attaches.
    #[test]
    fn held_envelopes_keep_their_order() {
        let router = Arc::new(MessageRouter::new());
        let dispatcher = MessageDispatcher::new(router.clone());

        for n in 1..=5 {
            assert_eq!(dispatcher.dispatch(numbered(n)), RouteOutcome::Pending);
        }
        assert_eq!(dispatcher.backlog_len(), 5);

        let stream = Arc::new(EventStream::with_prefix("g", 100));
        let (sink, mut receiver) = mpsc::channel(64);
        stream.attach(sink, 0);
        router.attach_general(stream);

        // Something new dispatched before the flush must still come last
        assert_eq!(dispatcher.dispatch(numbered(6)), RouteOutcome::Delivered);
        dispatcher.flush();
        assert_eq!(dispatcher.backlog_len(), 0);

        let mut received = vec![];
        while let Ok(event) = receiver.try_recv() {
            let envelope: Envelope = event.data.parse().unwrap();
            received.push(envelope.params().unwrap()["n"].clone());
        }
        assert_eq!(received, (1..=6).map(Value::from).collect::<Vec<_>>());
    }

    fn received_numbers(receiver: &mut mpsc::Receiver<crate::event_stream::SseEvent>) -> Vec<u64> {
        let mut received = vec![];
        while let Ok(event) = receiver.try_recv() {
            let envelope: Envelope = event.data.parse().unwrap();
            received.push(envelope.params().unwrap()["n"].as_u64().unwrap());
        }
        received
    }

    #[test]
    fn attaching_delivers_the_backlog_first() {
        let dispatcher = MessageDispatcher::new(Arc::new(MessageRouter::new()));
        for n in 1..=3 {
            dispatcher.dispatch(numbered(n));
        }

        let stream = Arc::new(EventStream::with_prefix("g", 100));
        let (sink, mut receiver) = mpsc::channel(64);
        stream.attach(sink, 0);
        dispatcher.attach_general(stream);
        assert_eq!(dispatcher.backlog_len(), 0);

        dispatcher.dispatch(numbered(4));
        assert_eq!(received_numbers(&mut receiver), vec![1, 2, 3, 4]);
    }

    /// A stream attaching while another thread keeps dispatching still sees every envelope in
    /// dispatch order.
    #[test]
    fn attach_racing_with_dispatch_keeps_order() {
        for _ in 0..50 {
            let dispatcher = Arc::new(MessageDispatcher::new(Arc::new(MessageRouter::new())));
            for n in 1..=5 {
                dispatcher.dispatch(numbered(n));
            }

            let sender = std::thread::spawn({
                let dispatcher = dispatcher.clone();
                move || {
                    for n in 6..=200 {
                        dispatcher.dispatch(numbered(n));
                    }
                }
            });

            let stream = Arc::new(EventStream::with_prefix("g", 500));
            let (sink, mut receiver) = mpsc::channel(500);
            stream.attach(sink, 0);
            dispatcher.attach_general(stream);

            sender.join().unwrap();
            dispatcher.flush();
            assert_eq!(received_numbers(&mut receiver), (1..=200).collect::<Vec<_>>());
        }
    }

    #[test]
    fn undeliverable_responses_are_dropped() {
        let dispatcher = MessageDispatcher::new(Arc::new(MessageRouter::new()));
        assert_eq!(
            dispatcher.dispatch(Envelope::response(RequestId::Number(1), json!({}))),
            RouteOutcome::NotFound
        );
        assert_eq!(dispatcher.backlog_len(), 0);
    }

    #[test]
    fn request_bound_traffic_is_not_blocked_by_the_backlog() {
        let router = Arc::new(MessageRouter::new());
        let dispatcher = MessageDispatcher::new(router.clone());
        dispatcher.dispatch(numbered(1));

        let stream = Arc::new(EventStream::with_prefix("r", 100));
        let (sink, mut receiver) = mpsc::channel(8);
        stream.attach(sink, 0);
        router.bind_request_stream(RequestId::Number(3), stream);

        assert_eq!(
            dispatcher.dispatch(Envelope::response(RequestId::Number(3), json!({}))),
            RouteOutcome::Delivered
        );
        assert!(receiver.try_recv().is_ok());
        assert_eq!(dispatcher.backlog_len(), 1);
    }
}

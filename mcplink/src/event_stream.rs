//! Resumable server-sent event streams.
use crate::util::random_token;
use mcplink_jsonrpc::Envelope;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::*;

/// One event as it goes out on the wire
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SseEvent {
    pub id: String,
    pub data: Arc<str>,
}

impl SseEvent {
    pub fn to_wire(&self) -> String {
        format!("id: {}\ndata: {}\n\n", self.id, self.data)
    }
}

/// Where an attached stream writes its events; usually the body of an open HTTP response.
pub type EventSink = mpsc::Sender<SseEvent>;

#[derive(Debug)]
struct StreamState {
    next_seq: u64,
    history: VecDeque<(u64, Arc<str>)>,
    history_limit: usize,
    sink: Option<EventSink>,

    /// Set once the sink has been full: events queue here, in order, and a forwarding task
    /// writes them to the sink as the client catches up.
    spill: Option<EventSink>,
    closed: bool,
}

/// An ordered outbound event channel that survives the client disconnecting.
///
/// Every event gets the next sequence number and is kept in a bounded history, so a client that
/// reconnects with `Last-Event-ID` gets whatever it missed (as long as it's still in the
/// history).  Event IDs are `{prefix}-{sequence}`, the prefix identifying the stream.
#[derive(Debug)]
pub struct EventStream {
    prefix: String,
    state: Mutex<StreamState>,
}

impl EventStream {
    /// New stream with a random prefix of `prefix_bytes` random bytes
    pub fn open(prefix_bytes: usize, history_limit: usize) -> Self {
        Self::with_prefix(random_token(prefix_bytes), history_limit)
    }

    pub fn with_prefix(prefix: impl Into<String>, history_limit: usize) -> Self {
        Self {
            prefix: prefix.into(),
            state: Mutex::new(StreamState {
                next_seq: 1,
                history: VecDeque::new(),
                history_limit,
                sink: None,
                spill: None,
                closed: false,
            }),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Append an envelope to the stream, writing it out if a client is attached.  Never fails;
    /// a sink that can't take the event is detached and the event stays in the history.
    pub fn send(&self, envelope: &Envelope) {
        let data: Arc<str> = match envelope.to_json() {
            Ok(json) => json.into(),
            Err(e) => {
                error!(error = %e, "Error serializing envelope for event stream");
                return;
            }
        };

        let mut state = self.lock();
        if state.closed {
            debug!(prefix = %self.prefix, "Send on closed event stream; dropping");
            return;
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.history.push_back((seq, data.clone()));
        while state.history.len() > state.history_limit {
            state.history.pop_front();
        }

        let Some(sink) = state.sink.clone() else {
            return;
        };
        let event = SseEvent {
            id: self.event_id(seq),
            data,
        };

        if let Some(spill) = &state.spill {
            if let Err(e) = spill.try_send(event) {
                warn!(prefix = %self.prefix, seq, error = %e, "Event stream client is not keeping up; detaching");
                state.sink = None;
                state.spill = None;
            }
            return;
        }

        match sink.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                debug!(prefix = %self.prefix, seq, "Event stream sink is full; queueing");
                match self.start_spill(sink, state.history_limit.max(1)) {
                    Some(spill) => {
                        // A fresh channel with room for at least one event
                        let _ = spill.try_send(event);
                        state.spill = Some(spill);
                    }
                    None => state.sink = None,
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(prefix = %self.prefix, seq, "Event stream client went away; detaching");
                state.sink = None;
            }
        }
    }

    /// Queue for events that don't fit in `sink` right now, drained into it by a task of its own
    fn start_spill(&self, sink: EventSink, capacity: usize) -> Option<EventSink> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(prefix = %self.prefix, "Event stream sink is full and no runtime to wait on it; detaching");
            return None;
        };

        let (spill, mut queued) = mpsc::channel::<SseEvent>(capacity);
        let prefix = self.prefix.clone();
        runtime.spawn(async move {
            while let Some(event) = queued.recv().await {
                if sink.send(event).await.is_err() {
                    debug!(%prefix, "Event stream client went away with events still queued");
                    break;
                }
            }
        });
        Some(spill)
    }

    /// Attach a sink, first replaying every retained event after `last_delivered` (0 for a fresh
    /// client).  Returns `false` if the stream is closed or the replay couldn't be written.
    pub fn attach(&self, sink: EventSink, last_delivered: u64) -> bool {
        let mut state = self.lock();
        if state.closed {
            debug!(prefix = %self.prefix, "Refusing to attach to closed event stream");
            return false;
        }

        let replay: Vec<SseEvent> = state
            .history
            .iter()
            .filter(|(seq, _)| *seq > last_delivered)
            .map(|(seq, data)| SseEvent {
                id: self.event_id(*seq),
                data: data.clone(),
            })
            .collect();

        for event in replay {
            if let Err(e) = sink.try_send(event) {
                warn!(prefix = %self.prefix, error = %e, "Error replaying event stream history");
                state.sink = None;
                return false;
            }
        }

        trace!(prefix = %self.prefix, last_delivered, "Attached to event stream");
        state.sink = Some(sink);
        state.spill = None;
        true
    }

    pub fn detach(&self) {
        let mut state = self.lock();
        state.sink = None;
        state.spill = None;
    }

    /// Release the sink and the history for good.  Events already queued for a slow client are
    /// still written out before its sink is dropped.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.sink = None;
        state.spill = None;
        state.history.clear();
    }

    pub fn is_active(&self) -> bool {
        let state = self.lock();
        !state.closed && state.sink.as_ref().is_some_and(|sink| !sink.is_closed())
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn history_len(&self) -> usize {
        self.lock().history.len()
    }

    fn event_id(&self, seq: u64) -> String {
        format!("{}-{}", self.prefix, seq)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StreamState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Split a `Last-Event-ID` header into stream prefix and sequence number.
///
/// Prefixes can themselves contain `-`, so the split is at the last one.  Anything unparseable is
/// logged and treated as if no header was sent.
pub fn parse_last_event_id(value: &str) -> Option<(&str, u64)> {
    let Some((prefix, seq)) = value.rsplit_once('-') else {
        warn!(last_event_id = value, "Last-Event-ID has no sequence; ignoring");
        return None;
    };

    if prefix.is_empty() {
        warn!(last_event_id = value, "Last-Event-ID has no stream prefix; ignoring");
        return None;
    }

    match seq.parse::<u64>() {
        Ok(seq) => Some((prefix, seq)),
        Err(_) => {
            warn!(last_event_id = value, "Last-Event-ID has an invalid sequence; ignoring");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn notification(n: u64) -> Envelope {
        Envelope::notification("notifications/message", json!({"n": n}))
    }

    fn drain(receiver: &mut mpsc::Receiver<SseEvent>) -> Vec<SseEvent> {
        let mut events = vec![];
        while let Ok(event) = receiver.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn wire_format() {
        let stream = EventStream::with_prefix("abc", 10);
        let (sink, mut receiver) = mpsc::channel(10);
        stream.attach(sink, 0);
        stream.send(&notification(1));
        stream.send(&notification(2));

        let wire: String = drain(&mut receiver).iter().map(SseEvent::to_wire).collect();
        expectorate::assert_contents("src/testdata/sse_wire_format.txt", &wire);
    }

    #[test]
    fn resume_after_eviction_gets_only_the_missing_tail() {
        let limit = 3;
        let stream = EventStream::with_prefix("p", limit);
        let n = 5;
        for i in 1..=n {
            stream.send(&notification(i));
        }
        assert_eq!(stream.history_len(), limit);

        let (sink, mut receiver) = mpsc::channel(16);
        assert!(stream.attach(sink, n - 1));
        let events = drain(&mut receiver);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, "p-5");
    }

    #[test]
    fn fresh_attach_replays_everything_in_order() {
        let stream = EventStream::with_prefix("p", 10);
        for i in 1..=4 {
            stream.send(&notification(i));
        }

        let (sink, mut receiver) = mpsc::channel(16);
        assert!(stream.attach(sink, 0));
        let ids: Vec<String> = drain(&mut receiver).into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["p-1", "p-2", "p-3", "p-4"]);

        // Live events continue the sequence
        stream.send(&notification(5));
        assert_eq!(drain(&mut receiver)[0].id, "p-5");
    }

    #[test]
    fn failed_write_detaches_but_keeps_history() {
        let stream = EventStream::with_prefix("p", 10);
        let (sink, receiver) = mpsc::channel(16);
        stream.attach(sink, 0);
        assert!(stream.is_active());

        drop(receiver);
        assert!(!stream.is_active());
        stream.send(&notification(1));
        assert_eq!(stream.history_len(), 1);

        // Re-attach picks up the event that was never delivered
        let (sink, mut receiver) = mpsc::channel(16);
        assert!(stream.attach(sink, 0));
        assert_eq!(drain(&mut receiver).len(), 1);
    }

    #[tokio::test]
    async fn full_sink_queues_instead_of_detaching() -> anyhow::Result<()> {
        let stream = EventStream::with_prefix("p", 10);
        let (sink, mut receiver) = mpsc::channel(1);
        stream.attach(sink, 0);

        for i in 1..=3 {
            stream.send(&notification(i));
        }
        assert!(stream.is_active());

        let mut ids = vec![];
        for _ in 1..=3 {
            let event = tokio::time::timeout(std::time::Duration::from_secs(1), receiver.recv())
                .await?
                .expect("stream ended early");
            ids.push(event.id);
        }
        assert_eq!(ids, vec!["p-1", "p-2", "p-3"]);

        // Still in order once the client has caught up
        stream.send(&notification(4));
        let event = tokio::time::timeout(std::time::Duration::from_secs(1), receiver.recv()).await?;
        assert_eq!(event.map(|e| e.id).as_deref(), Some("p-4"));
        Ok(())
    }

    /// The last event on a request stream is usually followed by `close`; a slow client still
    /// gets it.
    #[tokio::test]
    async fn queued_events_survive_close() -> anyhow::Result<()> {
        let stream = EventStream::with_prefix("r", 10);
        let (sink, mut receiver) = mpsc::channel(1);
        stream.attach(sink, 0);

        stream.send(&notification(1));
        stream.send(&notification(2));
        stream.close();

        let mut ids = vec![];
        while let Some(event) =
            tokio::time::timeout(std::time::Duration::from_secs(1), receiver.recv()).await?
        {
            ids.push(event.id);
        }
        assert_eq!(ids, vec!["r-1", "r-2"]);
        Ok(())
    }

    #[test]
    fn closed_stream_never_reattaches() {
        let stream = EventStream::open(8, 10);
        stream.send(&notification(1));
        stream.close();

        assert!(stream.is_closed());
        assert_eq!(stream.history_len(), 0);
        let (sink, _receiver) = mpsc::channel(16);
        assert!(!stream.attach(sink, 0));
        assert!(!stream.is_active());
    }

    #[test]
    fn last_event_id_parsing() {
        assert_eq!(parse_last_event_id("abc-12"), Some(("abc", 12)));
        assert_eq!(parse_last_event_id("a-b-c-3"), Some(("a-b-c", 3)));
        assert_eq!(parse_last_event_id("-3"), None);
        assert_eq!(parse_last_event_id("abc-"), None);
        assert_eq!(parse_last_event_id("abc-1.5"), None);
        assert_eq!(parse_last_event_id("abc-x"), None);
        assert_eq!(parse_last_event_id("abc"), None);
    }
}

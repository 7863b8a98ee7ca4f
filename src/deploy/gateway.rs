//! Observer side of a session: replay the durable log, then follow live.
//!
//! [`Gateway::attach`] subscribes to the session channel *before* reading the
//! log, so an event appended and published in between is seen at least once;
//! the `seq` cursor in [`Attachment`] drops the duplicate.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::OrchestratorError;

use super::event_log::EventLog;
use super::models::Event;
use super::registry::{ObserverGuard, SessionRegistry};
use super::tailer::LogTail;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

pub const INVALID_SESSION_MESSAGE: &str = "Invalid session ID";
pub const SERVICE_NOT_FOUND_MESSAGE: &str = "Service not found or no logs available";

#[derive(Clone)]
pub struct Gateway {
    events: Arc<dyn EventLog>,
    registry: Arc<SessionRegistry>,
}

impl Gateway {
    pub fn new(events: Arc<dyn EventLog>, registry: Arc<SessionRegistry>) -> Self {
        Self { events, registry }
    }

    async fn is_known(&self, session_id: &str) -> Result<bool, OrchestratorError> {
        Ok(self.registry.contains(session_id)
            || !self.events.read_all(session_id).await?.is_empty())
    }

    /// Every stored event of the session.
    pub async fn snapshot(&self, session_id: &str) -> Result<Vec<Event>, OrchestratorError> {
        let events = self.events.read_all(session_id).await?;
        if events.is_empty() && !self.registry.contains(session_id) {
            return Err(OrchestratorError::SessionNotFound(session_id.to_string()));
        }
        Ok(events)
    }

    pub async fn attach(&self, session_id: &str) -> Result<Attachment, OrchestratorError> {
        if !self.is_known(session_id).await? {
            return Err(OrchestratorError::SessionNotFound(session_id.to_string()));
        }
        let live = self.events.subscribe(session_id).await?;
        let replay = self.events.read_all(session_id).await?;
        tracing::debug!(session_id = %session_id, replayed = replay.len(), "observer attached");
        Ok(Attachment {
            session_id: session_id.to_string(),
            events: Arc::clone(&self.events),
            replay: replay.into(),
            live,
            last_seq: None,
            resync: false,
            _guard: self.registry.observe(session_id),
        })
    }
}

/// One observer's cursor over a session.
pub struct Attachment {
    session_id: String,
    events: Arc<dyn EventLog>,
    replay: VecDeque<Event>,
    live: broadcast::Receiver<Event>,
    last_seq: Option<u64>,
    resync: bool,
    _guard: ObserverGuard,
}

impl Attachment {
    fn is_new(&self, event: &Event) -> bool {
        self.last_seq.is_none_or(|last| event.seq > last)
    }

    fn take_replayed(&mut self) -> Option<Event> {
        while let Some(event) = self.replay.pop_front() {
            if self.is_new(&event) {
                self.last_seq = Some(event.seq);
                return Some(event);
            }
        }
        None
    }

    /// Next event in `seq` order, or `None` once the session channel closes.
    ///
    /// Cancel safe: dropping the future loses no events.
    pub async fn next(&mut self) -> Option<Event> {
        loop {
            if self.resync {
                match self.events.read_all(&self.session_id).await {
                    Ok(stored) => {
                        let last = self.last_seq;
                        self.replay = stored
                            .into_iter()
                            .filter(|e| last.is_none_or(|last| e.seq > last))
                            .collect();
                        self.resync = false;
                    }
                    Err(e) => {
                        tracing::warn!(session_id = %self.session_id, error = %e, "resync read failed");
                        self.resync = false;
                    }
                }
            }
            if let Some(event) = self.take_replayed() {
                return Some(event);
            }

            match self.live.recv().await {
                Ok(event) => {
                    if self.is_new(&event) {
                        self.last_seq = Some(event.seq);
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(session_id = %self.session_id, skipped, "observer lagged, re-reading log");
                    self.resync = true;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.last_seq
    }
}

// ── WebSocket loops ──────────────────────────────────────────────────

/// Forward a session to a client with ping/pong keepalive.
///
/// Exits when the client closes, a read or write fails, no Pong arrives
/// within [`PONG_TIMEOUT`], or the session channel closes.
pub async fn run_session_socket(socket: WebSocket, mut attachment: Attachment) {
    let (mut sender, mut receiver) = socket.split();
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // First tick is immediate.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    tracing::debug!("observer missed pong, closing");
                    break;
                }
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            event = attachment.next() => {
                let Some(event) = event else { break };
                let json = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::warn!(seq = event.seq, error = %e, "failed to encode event");
                        continue;
                    }
                };
                if sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

/// Tell the client the session is unknown, then close.
pub async fn reject_socket(mut socket: WebSocket, message: &str) {
    let _ = socket.send(Message::Text(message.to_string().into())).await;
    let _ = socket.send(Message::Close(None)).await;
}

/// Stream a log tail to a client as raw text lines.
///
/// A reader task watches for disconnect and cancels the tail; this task
/// drains the buffer into the socket.
pub async fn run_tail_socket(socket: WebSocket, mut tail: LogTail) {
    let (mut sender, receiver) = socket.split();
    let token = tail.cancellation();
    let reader = tokio::spawn(watch_disconnect(receiver, token.clone()));

    'outer: while let Some(lines) = tail.next_batch().await {
        for line in lines {
            if sender.send(Message::Text(line.into())).await.is_err() {
                break 'outer;
            }
        }
    }
    if tail.not_found() {
        let _ = sender
            .send(Message::Text(SERVICE_NOT_FOUND_MESSAGE.into()))
            .await;
    }
    let evicted = tail.evicted();
    if evicted > 0 {
        tracing::debug!(evicted, "tail consumer fell behind");
    }

    token.cancel();
    reader.abort();
    let _ = sender.send(Message::Close(None)).await;
}

async fn watch_disconnect(mut receiver: SplitStream<WebSocket>, token: CancellationToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            msg = receiver.next() => match msg {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {
                    tracing::debug!("tail client disconnected");
                    token.cancel();
                    return;
                }
                Some(Ok(_)) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::event_log::MemoryEventLog;
    use crate::deploy::models::EventPayload;

    fn log_event(seq: u64) -> Event {
        Event::new(
            seq,
            EventPayload::Log {
                info: format!("line {}", seq),
            },
        )
    }

    async fn write(events: &Arc<dyn EventLog>, session: &str, seq: u64) {
        let event = log_event(seq);
        events.append(session, &event).await.unwrap();
        events.publish(session, &event).await.unwrap();
    }

    fn gateway_with(events: Arc<dyn EventLog>) -> (Gateway, Arc<SessionRegistry>) {
        let registry = Arc::new(SessionRegistry::new());
        (Gateway::new(events, Arc::clone(&registry)), registry)
    }

    async fn collect(attachment: &mut Attachment, n: usize) -> Vec<u64> {
        let mut seqs = Vec::new();
        for _ in 0..n {
            let event = tokio::time::timeout(Duration::from_secs(5), attachment.next())
                .await
                .unwrap()
                .unwrap();
            seqs.push(event.seq);
        }
        seqs
    }

    #[tokio::test]
    async fn test_unknown_session_rejected() {
        let (gateway, _) = gateway_with(Arc::new(MemoryEventLog::new()));
        assert!(matches!(
            gateway.attach("ghost").await,
            Err(OrchestratorError::SessionNotFound(_))
        ));
        assert!(matches!(
            gateway.snapshot("ghost").await,
            Err(OrchestratorError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_late_joiner_replays_then_follows() {
        let events: Arc<dyn EventLog> = Arc::new(MemoryEventLog::new());
        let (gateway, registry) = gateway_with(Arc::clone(&events));
        registry.register("s1", "d1").unwrap();
        for seq in 0..3 {
            write(&events, "s1", seq).await;
        }

        let mut attachment = gateway.attach("s1").await.unwrap();
        assert_eq!(registry.sessions_for("d1")[0].observers, 1);
        for seq in 3..5 {
            write(&events, "s1", seq).await;
        }
        assert_eq!(collect(&mut attachment, 5).await, vec![0, 1, 2, 3, 4]);
        assert_eq!(attachment.last_seq(), Some(4));

        drop(attachment);
        assert_eq!(registry.sessions_for("d1")[0].observers, 0);
    }

    #[tokio::test]
    async fn test_event_between_subscribe_and_read_is_not_duplicated() {
        let events: Arc<dyn EventLog> = Arc::new(MemoryEventLog::new());
        let (gateway, registry) = gateway_with(Arc::clone(&events));
        registry.register("s1", "d1").unwrap();
        write(&events, "s1", 0).await;

        // Simulate the race: subscribe, then an event lands, then the read.
        let live = events.subscribe("s1").await.unwrap();
        write(&events, "s1", 1).await;
        let replay = events.read_all("s1").await.unwrap();
        let mut attachment = Attachment {
            session_id: "s1".to_string(),
            events: Arc::clone(&events),
            replay: replay.into(),
            live,
            last_seq: None,
            resync: false,
            _guard: registry.observe("s1"),
        };
        write(&events, "s1", 2).await;

        assert_eq!(collect(&mut attachment, 3).await, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_independent_observers() {
        let events: Arc<dyn EventLog> = Arc::new(MemoryEventLog::new());
        let (gateway, registry) = gateway_with(Arc::clone(&events));
        registry.register("s1", "d1").unwrap();

        let mut early = gateway.attach("s1").await.unwrap();
        write(&events, "s1", 0).await;
        write(&events, "s1", 1).await;
        let mut late = gateway.attach("s1").await.unwrap();
        write(&events, "s1", 2).await;

        assert_eq!(collect(&mut early, 3).await, vec![0, 1, 2]);
        assert_eq!(collect(&mut late, 3).await, vec![0, 1, 2]);
        assert_eq!(registry.sessions_for("d1")[0].observers, 2);
    }

    #[tokio::test]
    async fn test_lagging_observer_recovers_from_log() {
        let events: Arc<dyn EventLog> = Arc::new(MemoryEventLog::with_channel_capacity(2));
        let (gateway, registry) = gateway_with(Arc::clone(&events));
        registry.register("s1", "d1").unwrap();

        let mut attachment = gateway.attach("s1").await.unwrap();
        for seq in 0..10 {
            write(&events, "s1", seq).await;
        }
        assert_eq!(collect(&mut attachment, 10).await, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_attachment_ends_when_session_pruned() {
        let events: Arc<dyn EventLog> = Arc::new(MemoryEventLog::new());
        let (gateway, registry) = gateway_with(Arc::clone(&events));
        registry.register("s1", "d1").unwrap();
        let mut attachment = gateway.attach("s1").await.unwrap();
        events.prune("s1").await.unwrap();
        let end = tokio::time::timeout(Duration::from_secs(5), attachment.next())
            .await
            .unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn test_durable_log_makes_session_known_after_restart() {
        let events: Arc<dyn EventLog> = Arc::new(MemoryEventLog::new());
        events.append("s1", &log_event(0)).await.unwrap();
        let (gateway, _) = gateway_with(Arc::clone(&events));
        let snapshot = gateway.snapshot("s1").await.unwrap();
        assert_eq!(snapshot.len(), 1);
        let mut attachment = gateway.attach("s1").await.unwrap();
        assert_eq!(collect(&mut attachment, 1).await, vec![0]);
    }
}

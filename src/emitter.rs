//! Per-client SSE fan-out: queuing, heartbeats, and stale-connection cleanup.
//!
//! Each client gets a bounded `tokio::sync::mpsc` channel and is watched by a
//! `tokio::time::interval` heartbeat loop spawned alongside its registration.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::error::{StreamError, StreamResult};
use crate::events::StreamEvent;

/// Lifecycle state of a client's SSE connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// A message ready to write onto the wire, either a real event or a heartbeat comment.
#[derive(Debug, Clone)]
pub enum SseMessage {
    Event(StreamEvent),
    Heartbeat { comment: String },
}

impl SseMessage {
    /// Render in SSE wire format: `event:`/`id:`/`data:` lines terminated by a blank line,
    /// or a bare `: comment` line for heartbeats.
    pub fn to_sse_format(&self) -> String {
        match self {
            Self::Event(event) => event.to_sse_line(),
            Self::Heartbeat { comment } => format!(": {comment}\n\n"),
        }
    }
}

/// A registered client connection: its outbound queue and liveness tracking.
pub struct ClientConnection {
    pub client_id: String,
    pub stream_id: String,
    pub state: parking_lot::Mutex<ConnectionState>,
    pub connected_at: DateTime<Utc>,
    pub last_activity: parking_lot::Mutex<DateTime<Utc>>,
    sender: mpsc::Sender<SseMessage>,
}

impl ClientConnection {
    pub fn is_active(&self) -> bool {
        *self.state.lock() == ConnectionState::Connected
    }

    pub fn mark_active(&self) {
        *self.last_activity.lock() = Utc::now();
    }

    pub fn is_stale(&self, timeout_secs: f64) -> bool {
        let inactive = (Utc::now() - *self.last_activity.lock()).num_milliseconds() as f64 / 1000.0;
        inactive > timeout_secs
    }

    fn disconnect(&self) {
        *self.state.lock() = ConnectionState::Disconnecting;
    }
}

/// Manages per-client queues, stream→clients fan-out, and heartbeat delivery.
pub struct SseEmitter {
    heartbeat_interval: Duration,
    queue_capacity: usize,
    clients: parking_lot::Mutex<HashMap<String, std::sync::Arc<ClientConnection>>>,
    stream_clients: parking_lot::Mutex<HashMap<String, HashSet<String>>>,
    heartbeat_handles: parking_lot::Mutex<HashMap<String, tokio::task::JoinHandle<()>>>,
    global_sequence: AtomicU64,
}

impl SseEmitter {
    pub fn new(heartbeat_interval: Duration, queue_capacity: usize, enable_heartbeats: bool) -> std::sync::Arc<Self> {
        let emitter = std::sync::Arc::new(Self {
            heartbeat_interval,
            queue_capacity,
            clients: parking_lot::Mutex::new(HashMap::new()),
            stream_clients: parking_lot::Mutex::new(HashMap::new()),
            heartbeat_handles: parking_lot::Mutex::new(HashMap::new()),
            global_sequence: AtomicU64::new(0),
        });
        let _ = enable_heartbeats;
        emitter
    }

    fn next_sequence(&self) -> u64 {
        self.global_sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Register a client and return its connection handle plus the receiver
    /// half of its outbound queue. Spawns a heartbeat task if `enable_heartbeats`.
    ///
    /// This is `register_client_pending` immediately followed by
    /// `activate_client` — use the split form directly when buffered
    /// recovery events must be enqueued before the client becomes visible
    /// to `emit_to_stream`.
    pub fn register_client(
        self: &std::sync::Arc<Self>,
        stream_id: &str,
        client_id: &str,
        enable_heartbeats: bool,
    ) -> (std::sync::Arc<ClientConnection>, mpsc::Receiver<SseMessage>) {
        let (connection, receiver) =
            self.register_client_pending(stream_id, client_id, enable_heartbeats);
        self.activate_client(stream_id, client_id);
        (connection, receiver)
    }

    /// Create a client connection and start its heartbeat, but do not add it
    /// to the stream's fan-out index yet. `emit_to_stream` will not reach
    /// this client until [`SseEmitter::activate_client`] is called.
    pub fn register_client_pending(
        self: &std::sync::Arc<Self>,
        stream_id: &str,
        client_id: &str,
        enable_heartbeats: bool,
    ) -> (std::sync::Arc<ClientConnection>, mpsc::Receiver<SseMessage>) {
        let (sender, receiver) = mpsc::channel(self.queue_capacity);

        let connection = std::sync::Arc::new(ClientConnection {
            client_id: client_id.to_string(),
            stream_id: stream_id.to_string(),
            state: parking_lot::Mutex::new(ConnectionState::Connected),
            connected_at: Utc::now(),
            last_activity: parking_lot::Mutex::new(Utc::now()),
            sender,
        });

        self.clients
            .lock()
            .insert(client_id.to_string(), connection.clone());

        if enable_heartbeats {
            let emitter = self.clone();
            let client_id = client_id.to_string();
            let interval = self.heartbeat_interval;
            let handle = tokio::spawn(async move {
                emitter.heartbeat_loop(client_id, interval).await;
            });
            self.heartbeat_handles
                .lock()
                .insert(connection.client_id.clone(), handle);
        }

        (connection, receiver)
    }

    /// Add a pending client into the stream's fan-out index, making it
    /// reachable by future `emit_to_stream` calls.
    pub fn activate_client(&self, stream_id: &str, client_id: &str) {
        self.stream_clients
            .lock()
            .entry(stream_id.to_string())
            .or_default()
            .insert(client_id.to_string());
    }

    async fn heartbeat_loop(self: std::sync::Arc<Self>, client_id: String, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;

            let Some(connection) = self.clients.lock().get(&client_id).cloned() else {
                break;
            };
            if !connection.is_active() {
                break;
            }

            let heartbeat = SseMessage::Heartbeat {
                comment: format!("heartbeat {}", Utc::now().to_rfc3339()),
            };
            if connection.sender.try_send(heartbeat).is_err() {
                connection.disconnect();
                break;
            }
            connection.mark_active();
        }
    }

    pub fn unregister_client(&self, client_id: &str) {
        self.cleanup_client(client_id);
    }

    fn cleanup_client(&self, client_id: &str) {
        let connection = self.clients.lock().remove(client_id);
        let Some(connection) = connection else {
            return;
        };
        connection.disconnect();

        if let Some(handle) = self.heartbeat_handles.lock().remove(client_id) {
            handle.abort();
        }

        let mut stream_clients = self.stream_clients.lock();
        if let Some(ids) = stream_clients.get_mut(&connection.stream_id) {
            ids.remove(client_id);
            if ids.is_empty() {
                stream_clients.remove(&connection.stream_id);
            }
        }
    }

    /// Emit a single event to one client, assigning it the next global sequence number.
    pub async fn emit(&self, client_id: &str, event: StreamEvent) -> StreamResult<bool> {
        let connection = self
            .clients
            .lock()
            .get(client_id)
            .cloned()
            .ok_or_else(|| StreamError::ClientDisconnected(client_id.to_string()))?;

        if !connection.is_active() {
            return Err(StreamError::ClientDisconnected(client_id.to_string()));
        }

        let sequence = self.next_sequence();
        let event = event.with_offset_and_sequence(event.offset, sequence);

        match connection.sender.try_send(SseMessage::Event(event)) {
            Ok(()) => {
                connection.mark_active();
                Ok(true)
            }
            Err(mpsc::error::TrySendError::Full(_)) => Ok(false),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(StreamError::ClientDisconnected(client_id.to_string()))
            }
        }
    }

    /// Emit an event to every client connected to `stream_id`, skipping `exclude_client` if set.
    pub async fn emit_to_stream(
        &self,
        stream_id: &str,
        event: &StreamEvent,
        exclude_client: Option<&str>,
    ) -> HashMap<String, bool> {
        let client_ids: Vec<String> = self
            .stream_clients
            .lock()
            .get(stream_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();

        let mut results = HashMap::new();
        for client_id in client_ids {
            if Some(client_id.as_str()) == exclude_client {
                continue;
            }
            let sent = self.emit(&client_id, event.clone()).await.unwrap_or(false);
            results.insert(client_id, sent);
        }
        results
    }

    pub fn stream_client_count(&self, stream_id: &str) -> usize {
        self.stream_clients
            .lock()
            .get(stream_id)
            .map(|ids| ids.len())
            .unwrap_or(0)
    }

    pub fn disconnect_stream(&self, stream_id: &str) {
        let client_ids: Vec<String> = self
            .stream_clients
            .lock()
            .get(stream_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        for client_id in client_ids {
            self.cleanup_client(&client_id);
        }
    }

    /// Disconnect every client whose last activity is older than `timeout_secs`.
    pub fn disconnect_stale_clients(&self, timeout_secs: f64) -> usize {
        let stale: Vec<String> = self
            .clients
            .lock()
            .values()
            .filter(|c| c.is_stale(timeout_secs))
            .map(|c| c.client_id.clone())
            .collect();

        for client_id in &stale {
            self.cleanup_client(client_id);
        }
        stale.len()
    }

    pub fn total_clients(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn total_streams(&self) -> usize {
        self.stream_clients.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventPayload;

    fn event(offset: u64) -> StreamEvent {
        StreamEvent::new(
            "sess-1",
            EventPayload::Chunk {
                text: "hi".into(),
                is_delta: true,
                token_count: None,
            },
        )
        .with_offset_and_sequence(offset, offset)
    }

    #[tokio::test]
    async fn register_and_emit_delivers_event() {
        let emitter = SseEmitter::new(Duration::from_secs(30), 10, false);
        let (_conn, mut rx) = emitter.register_client("s1", "c1", false);

        let sent = emitter.emit("c1", event(1)).await.unwrap();
        assert!(sent);

        let msg = rx.recv().await.unwrap();
        match msg {
            SseMessage::Event(e) => assert_eq!(e.offset, 1),
            _ => panic!("expected event message"),
        }
    }

    #[tokio::test]
    async fn emit_to_unknown_client_errors() {
        let emitter = SseEmitter::new(Duration::from_secs(30), 10, false);
        let result = emitter.emit("missing", event(1)).await;
        assert!(matches!(result, Err(StreamError::ClientDisconnected(_))));
    }

    #[tokio::test]
    async fn emit_to_stream_fans_out_to_all_clients() {
        let emitter = SseEmitter::new(Duration::from_secs(30), 10, false);
        let (_a, mut rx_a) = emitter.register_client("s1", "a", false);
        let (_b, mut rx_b) = emitter.register_client("s1", "b", false);

        let results = emitter.emit_to_stream("s1", &event(1), None).await;
        assert_eq!(results.len(), 2);
        assert!(rx_a.recv().await.is_some());
        assert!(rx_b.recv().await.is_some());
    }

    #[tokio::test]
    async fn emit_to_stream_excludes_named_client() {
        let emitter = SseEmitter::new(Duration::from_secs(30), 10, false);
        emitter.register_client("s1", "a", false);
        emitter.register_client("s1", "b", false);

        let results = emitter.emit_to_stream("s1", &event(1), Some("a")).await;
        assert_eq!(results.len(), 1);
        assert!(results.contains_key("b"));
    }

    #[tokio::test]
    async fn unregister_client_removes_from_stream_index() {
        let emitter = SseEmitter::new(Duration::from_secs(30), 10, false);
        emitter.register_client("s1", "a", false);
        assert_eq!(emitter.stream_client_count("s1"), 1);

        emitter.unregister_client("a");
        assert_eq!(emitter.stream_client_count("s1"), 0);
        assert!(emitter.emit("a", event(1)).await.is_err());
    }

    #[tokio::test]
    async fn full_queue_reports_not_sent_without_error() {
        let emitter = SseEmitter::new(Duration::from_secs(30), 1, false);
        emitter.register_client("s1", "a", false);

        assert!(emitter.emit("a", event(1)).await.unwrap());
        assert!(!emitter.emit("a", event(2)).await.unwrap());
    }

    #[tokio::test]
    async fn disconnect_stale_clients_removes_inactive_ones() {
        let emitter = SseEmitter::new(Duration::from_secs(30), 10, false);
        let (conn, _rx) = emitter.register_client("s1", "a", false);
        *conn.last_activity.lock() = Utc::now() - chrono::Duration::seconds(120);

        let removed = emitter.disconnect_stale_clients(60.0);
        assert_eq!(removed, 1);
        assert_eq!(emitter.total_clients(), 0);
    }

    #[tokio::test]
    async fn pending_client_is_invisible_to_emit_to_stream_until_activated() {
        let emitter = SseEmitter::new(Duration::from_secs(30), 10, false);
        emitter.register_client_pending("s1", "a", false);

        let results = emitter.emit_to_stream("s1", &event(1), None).await;
        assert!(results.is_empty());

        emitter.activate_client("s1", "a");
        let results = emitter.emit_to_stream("s1", &event(2), None).await;
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn heartbeat_message_renders_as_comment_line() {
        let msg = SseMessage::Heartbeat {
            comment: "heartbeat 2026".into(),
        };
        assert_eq!(msg.to_sse_format(), ": heartbeat 2026\n\n");
    }
}

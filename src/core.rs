//! Central stream coordination: lifecycle, event routing, recovery.
//!
//! Wires together [`crate::state::StreamingState`],
//! [`crate::buffer::PerStreamBuffer`], and [`crate::emitter::SseEmitter`].
//! Cancellation uses a `tokio_util::sync::CancellationToken`, and
//! `cancel_stream` releases its lock before awaiting the processing task's
//! shutdown to avoid the deadlock a held lock would cause against a task that
//! itself needs it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::buffer::{BufferCoverage, EventBuffer, PerStreamBuffer};
use crate::config::StreamConfig;
use crate::emitter::SseEmitter;
use crate::error::{StreamError, StreamResult};
use crate::events::{EventPayload, StreamEvent};
use crate::state::{StreamSession, StreamStatus, StreamingState, StreamingStats};

/// An active stream's coordination context: config, buffer, session, and the
/// machinery needed to cancel its processing task.
pub struct StreamContext {
    pub stream_id: String,
    pub session_id: String,
    pub config: StreamConfig,
    pub buffer: Arc<EventBuffer>,
    cancel_token: CancellationToken,
    cancel_reason: parking_lot::Mutex<Option<String>>,
    task: AsyncMutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Snapshot of a stream's current status for the `GET /streams/{id}` endpoint.
#[derive(Debug, Clone)]
pub struct StreamStatusView {
    pub stream_id: String,
    pub session_id: String,
    pub status: StreamStatus,
    pub current_offset: u64,
    pub client_count: usize,
}

/// Recovery feasibility info for a client resuming from a given offset.
#[derive(Debug, Clone)]
pub struct RecoveryInfo {
    pub stream_id: String,
    pub status: StreamStatus,
    pub requested_offset: u64,
    pub can_recover: bool,
    pub buffer_coverage: BufferCoverage,
    pub stream_active: bool,
}

/// A connected client's handle, returned from [`StreamingCore::connect_client`].
pub struct ConnectedClient {
    pub client_id: String,
    pub receiver: tokio::sync::mpsc::Receiver<crate::emitter::SseMessage>,
}

/// Central coordinator for every stream: lifecycle transitions, recovery,
/// and background cleanup.
pub struct StreamingCore {
    pub state: Arc<StreamingState>,
    pub emitter: Arc<SseEmitter>,
    default_config: StreamConfig,
    buffers: Arc<PerStreamBuffer>,
    streams: parking_lot::Mutex<HashMap<String, Arc<StreamContext>>>,
    cleanup_handle: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl StreamingCore {
    pub fn new(default_config: StreamConfig) -> Arc<Self> {
        let buffers = Arc::new(PerStreamBuffer::new(
            default_config.buffer_size,
            if default_config.buffer_age_seconds > 0 {
                Some(Duration::from_secs(default_config.buffer_age_seconds))
            } else {
                None
            },
        ));
        let emitter = SseEmitter::new(
            Duration::from_secs(default_config.heartbeat_interval_secs),
            default_config.client_queue_size,
            true,
        );

        Arc::new(Self {
            state: Arc::new(StreamingState::new()),
            emitter,
            default_config,
            buffers,
            streams: parking_lot::Mutex::new(HashMap::new()),
            cleanup_handle: parking_lot::Mutex::new(None),
        })
    }

    /// Spawn the background cleanup loop (expired buffer entries, stale
    /// clients, aged terminal streams).
    pub fn start(self: &Arc<Self>) {
        let core = self.clone();
        let handle = tokio::spawn(async move {
            core.cleanup_loop().await;
        });
        *self.cleanup_handle.lock() = Some(handle);
    }

    /// Cancel every stream and tear down background tasks.
    pub async fn stop(self: &Arc<Self>) {
        let stream_ids: Vec<String> = self.streams.lock().keys().cloned().collect();
        for stream_id in stream_ids {
            let _ = self.cancel_stream(&stream_id, Some("StreamingCore shutdown".into())).await;
        }

        if let Some(handle) = self.cleanup_handle.lock().take() {
            handle.abort();
        }
    }

    async fn cleanup_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(
            self.default_config.cleanup_interval_secs,
        ));
        ticker.tick().await;
        loop {
            ticker.tick().await;

            self.buffers.cleanup_expired_all();
            self.emitter
                .disconnect_stale_clients(self.default_config.stale_client_timeout_secs as f64);
            self.state.cleanup_old_streams(3600.0);
        }
    }

    pub fn create_stream(
        self: &Arc<Self>,
        stream_id: &str,
        session_id: &str,
        config: Option<StreamConfig>,
        metadata: Option<serde_json::Value>,
    ) -> StreamResult<Arc<StreamContext>> {
        let mut streams = self.streams.lock();
        if streams.contains_key(stream_id) {
            return Err(StreamError::StreamAlreadyExists(stream_id.to_string()));
        }

        let config = config.unwrap_or_else(|| self.default_config.clone());
        self.state.create_stream(stream_id, session_id, metadata)?;
        let buffer = self.buffers.get_or_create(stream_id);

        let context = Arc::new(StreamContext {
            stream_id: stream_id.to_string(),
            session_id: session_id.to_string(),
            config,
            buffer,
            cancel_token: CancellationToken::new(),
            cancel_reason: parking_lot::Mutex::new(None),
            task: AsyncMutex::new(None),
        });
        streams.insert(stream_id.to_string(), context.clone());

        Ok(context)
    }

    /// Begin consuming `events` and routing them to clients. `events` yields
    /// already-constructed payloads; offsets and the stream's session id are
    /// assigned here, not by the producer.
    pub async fn start_stream(
        self: &Arc<Self>,
        stream_id: &str,
        events: BoxStream<'static, anyhow::Result<EventPayload>>,
    ) -> StreamResult<()> {
        let context = self
            .streams
            .lock()
            .get(stream_id)
            .cloned()
            .ok_or_else(|| StreamError::StreamNotFound(stream_id.to_string()))?;

        self.state.update_stream_status(stream_id, StreamStatus::Running)?;

        let core = self.clone();
        let context_for_task = context.clone();
        let handle = tokio::spawn(async move {
            core.process_stream(context_for_task, events).await;
        });
        *context.task.lock().await = Some(handle);

        Ok(())
    }

    async fn process_stream(
        self: Arc<Self>,
        context: Arc<StreamContext>,
        mut events: BoxStream<'static, anyhow::Result<EventPayload>>,
    ) {
        let stream_id = context.stream_id.clone();

        loop {
            let next = tokio::select! {
                _ = context.cancel_token.cancelled() => {
                    let reason = context
                        .cancel_reason
                        .lock()
                        .clone()
                        .or_else(|| Some("Cancelled by request".into()));
                    self.finish_cancelled(&stream_id, reason).await;
                    return;
                }
                item = events.next() => item,
            };

            let Some(item) = next else {
                self.finish_completed(&stream_id).await;
                return;
            };

            let payload = match item {
                Ok(payload) => payload,
                Err(err) => {
                    let error_code = match err.downcast_ref::<StreamError>() {
                        Some(StreamError::ToolIterationLimit(_)) => "ITERATION_LIMIT",
                        Some(StreamError::ProviderError(_)) => "PROVIDER_ERROR",
                        _ => "STREAM_ERROR",
                    };
                    self.finish_errored(&stream_id, error_code, &err.to_string())
                        .await;
                    return;
                }
            };

            let offset = match self
                .state
                .with_stream_mut(&stream_id, |s| s.next_offset())
            {
                Ok(offset) => offset,
                Err(_) => return,
            };

            let mut event = StreamEvent::new(context.session_id.clone(), payload);
            event.offset = offset;

            if let Err(_e) = context.buffer.append(event.clone()) {
                continue;
            }

            if context.config.emit_checkpoints
                && context.config.checkpoint_interval > 0
                && offset % context.config.checkpoint_interval == 0
            {
                if let Ok(checkpoint_offset) =
                    self.state.with_stream_mut(&stream_id, |s| s.next_offset())
                {
                    let mut checkpoint = StreamEvent::new(
                        context.session_id.clone(),
                        EventPayload::Offset {
                            checkpoint_data: Some(serde_json::json!({ "last_event_offset": offset })),
                            is_recoverable: true,
                        },
                    );
                    checkpoint.offset = checkpoint_offset;
                    self.emitter.emit_to_stream(&stream_id, &checkpoint, None).await;
                }
            }

            self.emitter.emit_to_stream(&stream_id, &event, None).await;
        }
    }

    async fn finish_completed(&self, stream_id: &str) {
        let Some(context) = self.streams.lock().get(stream_id).cloned() else {
            return;
        };

        let final_offset = self
            .state
            .with_stream_mut(stream_id, |s| {
                s.mark_complete();
                s.next_offset()
            })
            .unwrap_or(0);

        let mut event = StreamEvent::new(
            context.session_id.clone(),
            EventPayload::Complete {
                final_offset,
                total_tokens: None,
                finish_reason: "stop".into(),
            },
        );
        event.offset = final_offset;
        self.emitter.emit_to_stream(stream_id, &event, None).await;
        self.emitter.disconnect_stream(stream_id);
    }

    async fn finish_cancelled(&self, stream_id: &str, reason: Option<String>) {
        let Some(context) = self.streams.lock().get(stream_id).cloned() else {
            return;
        };

        let cancelled_at_offset = self
            .state
            .with_stream_mut(stream_id, |s| {
                s.mark_cancelled(reason.clone());
                s.next_offset()
            })
            .unwrap_or(0);

        let mut event = StreamEvent::new(
            context.session_id.clone(),
            EventPayload::Cancelled {
                reason,
                cancelled_at_offset,
            },
        );
        event.offset = cancelled_at_offset;
        self.emitter.emit_to_stream(stream_id, &event, None).await;
        self.emitter.disconnect_stream(stream_id);
    }

    async fn finish_errored(&self, stream_id: &str, error_code: &str, message: &str) {
        let Some(context) = self.streams.lock().get(stream_id).cloned() else {
            return;
        };

        let error_offset = self
            .state
            .with_stream_mut(stream_id, |s| {
                s.mark_error(error_code.to_string(), message.to_string(), None);
                s.next_offset()
            })
            .unwrap_or(0);

        let mut event = StreamEvent::new(
            context.session_id.clone(),
            EventPayload::Error {
                error_code: error_code.to_string(),
                message: message.to_string(),
                details: None,
                is_recoverable: false,
            },
        );
        event.offset = error_offset;
        self.emitter.emit_to_stream(stream_id, &event, None).await;
        self.emitter.disconnect_stream(stream_id);
    }

    /// Signal cancellation and wait briefly for the processing task to exit.
    /// The lock guarding `streams` is released before the await so the
    /// processing task (which itself touches `self.streams`) can never
    /// deadlock against this call.
    pub async fn cancel_stream(self: &Arc<Self>, stream_id: &str, reason: Option<String>) -> StreamResult<()> {
        let context = {
            let streams = self.streams.lock();
            streams
                .get(stream_id)
                .cloned()
                .ok_or_else(|| StreamError::StreamNotFound(stream_id.to_string()))?
        };

        *context.cancel_reason.lock() = reason;
        context.cancel_token.cancel();

        let handle = context.task.lock().await.take();
        if let Some(handle) = handle {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }

        Ok(())
    }

    /// Connect a client to a stream, optionally replaying buffered events
    /// from `resume_from_offset` before the client becomes visible to live
    /// `emit_to_stream` fan-out.
    pub async fn connect_client(
        self: &Arc<Self>,
        stream_id: &str,
        client_id: Option<String>,
        resume_from_offset: Option<u64>,
    ) -> StreamResult<ConnectedClient> {
        let client_id = client_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let context = self
            .streams
            .lock()
            .get(stream_id)
            .cloned()
            .ok_or_else(|| StreamError::StreamNotFound(stream_id.to_string()))?;

        let session = self.state.get_stream(stream_id)?;
        if session.is_terminal() {
            return Err(StreamError::StreamCompleted(stream_id.to_string()));
        }

        let start_offset = resume_from_offset.unwrap_or(0);
        self.state.register_client(&client_id, stream_id, start_offset)?;

        let (_connection, receiver) =
            self.emitter
                .register_client_pending(stream_id, &client_id, true);

        if let Some(resume_from_offset) = resume_from_offset {
            if context.config.enable_recovery {
                let events = context.buffer.get_from_offset(resume_from_offset, None);
                for event in events {
                    let _ = self.emitter.emit(&client_id, event).await;
                }
            }
        }

        self.emitter.activate_client(stream_id, &client_id);

        Ok(ConnectedClient { client_id, receiver })
    }

    pub fn disconnect_client(&self, client_id: &str, stream_id: &str) {
        self.state.disconnect_client(client_id, Some(stream_id));
        self.emitter.unregister_client(client_id);
    }

    pub fn get_stream(&self, stream_id: &str) -> StreamResult<Arc<StreamContext>> {
        self.streams
            .lock()
            .get(stream_id)
            .cloned()
            .ok_or_else(|| StreamError::StreamNotFound(stream_id.to_string()))
    }

    pub fn get_stream_status(&self, stream_id: &str) -> StreamResult<StreamStatusView> {
        let session: StreamSession = self.state.get_stream(stream_id)?;
        Ok(StreamStatusView {
            stream_id: stream_id.to_string(),
            session_id: session.session_id,
            status: session.status,
            current_offset: session.current_offset,
            client_count: session.client_ids.len(),
        })
    }

    /// Replay a terminal-but-still-buffered stream's events from `offset`
    /// without registering a live client, for `GET /streams/{id}/events`
    /// against a stream that has already finished.
    pub fn replay_from_buffer(&self, stream_id: &str, offset: u64) -> StreamResult<Vec<StreamEvent>> {
        let session = self.state.get_stream(stream_id)?;
        if !session.is_terminal() {
            return Err(StreamError::StreamNotTerminal(stream_id.to_string()));
        }
        let buffer = self
            .buffers
            .get(stream_id)
            .ok_or_else(|| StreamError::StreamNotFound(stream_id.to_string()))?;
        Ok(buffer.get_from_offset(offset, None))
    }

    pub fn get_recovery_info(&self, stream_id: &str, offset: u64) -> StreamResult<RecoveryInfo> {
        let context = self.get_stream(stream_id)?;
        let session = self.state.get_stream(stream_id)?;
        let mut coverage = context.buffer.buffer_coverage(offset);

        // An empty buffer isn't automatically unrecoverable: if the stream
        // hasn't emitted anything past the requested offset yet, there is
        // nothing to have missed.
        if coverage.min_available.is_none() && offset <= session.current_offset {
            coverage.can_recover = true;
        }

        Ok(RecoveryInfo {
            stream_id: stream_id.to_string(),
            status: session.status,
            requested_offset: offset,
            can_recover: coverage.can_recover,
            buffer_coverage: coverage,
            stream_active: session.is_active(),
        })
    }

    pub fn stats(&self) -> CoreStats {
        CoreStats {
            state: self.state.stats(),
            active_streams: self.streams.lock().len(),
            total_clients: self.emitter.total_clients(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CoreStats {
    pub state: StreamingStats,
    pub active_streams: usize,
    pub total_clients: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn test_config() -> StreamConfig {
        StreamConfig {
            buffer_size: 100,
            buffer_age_seconds: 0,
            enable_recovery: true,
            emit_checkpoints: true,
            checkpoint_interval: 2,
            heartbeat_interval_secs: 30,
            max_concurrent_clients: 10,
            client_queue_size: 50,
            stale_client_timeout_secs: 60,
            cleanup_interval_secs: 3600,
        }
    }

    #[tokio::test]
    async fn create_stream_rejects_duplicates() {
        let core = StreamingCore::new(test_config());
        core.create_stream("s1", "sess-1", None, None).unwrap();
        let result = core.create_stream("s1", "sess-1", None, None);
        assert!(matches!(result, Err(StreamError::StreamAlreadyExists(_))));
    }

    #[tokio::test]
    async fn full_stream_lifecycle_completes_and_emits_complete_event() {
        let core = StreamingCore::new(test_config());
        core.create_stream("s1", "sess-1", None, None).unwrap();

        let connected = core.connect_client("s1", None, None).await.unwrap();
        let mut receiver = connected.receiver;

        let events: BoxStream<'static, anyhow::Result<EventPayload>> = Box::pin(stream::iter(vec![
            Ok(EventPayload::Chunk {
                text: "hi".into(),
                is_delta: true,
                token_count: None,
            }),
            Ok(EventPayload::Chunk {
                text: "there".into(),
                is_delta: true,
                token_count: None,
            }),
        ]));
        core.start_stream("s1", events).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut saw_complete = false;
        while let Ok(Some(msg)) =
            tokio::time::timeout(Duration::from_millis(200), receiver.recv()).await
        {
            if let crate::emitter::SseMessage::Event(e) = msg {
                if matches!(e.payload, EventPayload::Complete { .. }) {
                    saw_complete = true;
                }
            }
        }
        assert!(saw_complete);

        let status = core.get_stream_status("s1").unwrap();
        assert_eq!(status.status, StreamStatus::Completed);
    }

    #[tokio::test]
    async fn connect_client_rejects_terminal_stream() {
        let core = StreamingCore::new(test_config());
        core.create_stream("s1", "sess-1", None, None).unwrap();
        core.state
            .with_stream_mut("s1", |s| s.mark_complete())
            .unwrap();

        let result = core.connect_client("s1", None, None).await;
        assert!(matches!(result, Err(StreamError::StreamCompleted(_))));
    }

    #[tokio::test]
    async fn recovery_info_reports_buffer_coverage() {
        let core = StreamingCore::new(test_config());
        let context = core.create_stream("s1", "sess-1", None, None).unwrap();
        context.buffer.append(StreamEvent::new(
            "sess-1",
            EventPayload::Chunk {
                text: "x".into(),
                is_delta: true,
                token_count: None,
            },
        ).with_offset_and_sequence(0, 0)).unwrap();

        let info = core.get_recovery_info("s1", 0).unwrap();
        assert!(info.can_recover);
    }

    #[tokio::test]
    async fn recovery_from_offset_zero_on_a_stream_with_nothing_emitted_yet_is_recoverable() {
        let core = StreamingCore::new(test_config());
        core.create_stream("s1", "sess-1", None, None).unwrap();

        // Nothing has been appended to the buffer, but the stream also
        // hasn't emitted anything past offset 0 yet, so there is nothing
        // to have missed.
        let info = core.get_recovery_info("s1", 0).unwrap();
        assert!(info.buffer_coverage.min_available.is_none());
        assert!(info.can_recover);
    }

    #[tokio::test]
    async fn recovery_past_current_offset_on_an_empty_buffer_is_not_recoverable() {
        let core = StreamingCore::new(test_config());
        core.create_stream("s1", "sess-1", None, None).unwrap();

        let info = core.get_recovery_info("s1", 5).unwrap();
        assert!(info.buffer_coverage.min_available.is_none());
        assert!(!info.can_recover);
    }

    #[tokio::test]
    async fn replay_from_buffer_requires_terminal_stream() {
        let core = StreamingCore::new(test_config());
        core.create_stream("s1", "sess-1", None, None).unwrap();
        let result = core.replay_from_buffer("s1", 0);
        assert!(result.is_err());
    }
}

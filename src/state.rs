//! Stream lifecycle and client-connection bookkeeping.
//!
//! Tracks every [`StreamSession`] and [`ClientInfo`] under a single lock.
//! [`StreamingState::update_client_offset`] is monotone-max instead of an
//! unconditional overwrite, matching the invariant that a client's
//! acknowledged position never regresses.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{StreamError, StreamResult};

/// Lifecycle status of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Cancelled,
    Error,
}

impl StreamStatus {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Running | Self::Paused)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Error)
    }
}

/// Error detail recorded when a stream ends in [`StreamStatus::Error`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamErrorInfo {
    pub error_code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

/// Snapshot of recovery checkpoint data for a stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointData {
    pub offset: u64,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// A single streaming session and its lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSession {
    pub stream_id: String,
    pub session_id: String,
    pub status: StreamStatus,
    pub current_offset: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
    pub checkpoint_data: Option<CheckpointData>,
    pub client_ids: HashSet<String>,
    pub error_info: Option<StreamErrorInfo>,
}

impl StreamSession {
    fn new(stream_id: String, session_id: String, metadata: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            stream_id,
            session_id,
            status: StreamStatus::Pending,
            current_offset: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
            metadata,
            checkpoint_data: None,
            client_ids: HashSet::new(),
            error_info: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Claim the next offset and advance the stream's counter.
    pub fn next_offset(&mut self) -> u64 {
        let offset = self.current_offset;
        self.current_offset += 1;
        self.updated_at = Utc::now();
        offset
    }

    pub fn update_checkpoint(&mut self, offset: u64, data: serde_json::Value) {
        self.checkpoint_data = Some(CheckpointData {
            offset,
            data,
            timestamp: Utc::now(),
        });
        self.updated_at = Utc::now();
    }

    pub fn mark_complete(&mut self) {
        self.status = StreamStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.updated_at = Utc::now();
    }

    pub fn mark_cancelled(&mut self, reason: Option<String>) {
        self.status = StreamStatus::Cancelled;
        self.completed_at = Some(Utc::now());
        self.updated_at = Utc::now();
        if let Some(reason) = reason {
            if let serde_json::Value::Object(map) = &mut self.metadata {
                map.insert("cancellation_reason".into(), reason.into());
            }
        }
    }

    pub fn mark_error(&mut self, error_code: String, message: String, details: Option<serde_json::Value>) {
        self.status = StreamStatus::Error;
        self.completed_at = Some(Utc::now());
        self.updated_at = Utc::now();
        self.error_info = Some(StreamErrorInfo {
            error_code,
            message,
            details,
            timestamp: Utc::now(),
        });
    }

    fn add_client(&mut self, client_id: &str) {
        self.client_ids.insert(client_id.to_string());
        self.updated_at = Utc::now();
    }

    fn remove_client(&mut self, client_id: &str) {
        self.client_ids.remove(client_id);
        self.updated_at = Utc::now();
    }
}

/// Information about a single connected client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_id: String,
    pub connected_at: DateTime<Utc>,
    pub last_offset: u64,
    pub is_active: bool,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub last_activity: DateTime<Utc>,
}

impl ClientInfo {
    fn new(client_id: String, start_offset: u64) -> Self {
        let now = Utc::now();
        Self {
            client_id,
            connected_at: now,
            last_offset: start_offset,
            is_active: true,
            disconnected_at: None,
            last_activity: now,
        }
    }

    pub fn is_stale(&self, timeout_secs: f64) -> bool {
        let inactive = (Utc::now() - self.last_activity).num_milliseconds() as f64 / 1000.0;
        inactive > timeout_secs
    }
}

/// Aggregate counters across every tracked stream and client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamingStats {
    pub total_streams: usize,
    pub active_streams: usize,
    pub completed_streams: usize,
    pub cancelled_streams: usize,
    pub error_streams: usize,
    pub total_clients: usize,
    pub active_clients: usize,
}

struct Inner {
    streams: HashMap<String, StreamSession>,
    clients: HashMap<String, ClientInfo>,
    session_streams: HashMap<String, HashSet<String>>,
}

/// Central state for stream lifecycle and client connections, guarded by a
/// single `parking_lot::Mutex`.
pub struct StreamingState {
    inner: parking_lot::Mutex<Inner>,
}

impl Default for StreamingState {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamingState {
    pub fn new() -> Self {
        Self {
            inner: parking_lot::Mutex::new(Inner {
                streams: HashMap::new(),
                clients: HashMap::new(),
                session_streams: HashMap::new(),
            }),
        }
    }

    pub fn create_stream(
        &self,
        stream_id: &str,
        session_id: &str,
        metadata: Option<serde_json::Value>,
    ) -> StreamResult<StreamSession> {
        let mut inner = self.inner.lock();
        if inner.streams.contains_key(stream_id) {
            return Err(StreamError::StreamAlreadyExists(stream_id.to_string()));
        }

        let stream = StreamSession::new(
            stream_id.to_string(),
            session_id.to_string(),
            metadata.unwrap_or_else(|| serde_json::json!({})),
        );
        inner.streams.insert(stream_id.to_string(), stream.clone());
        inner
            .session_streams
            .entry(session_id.to_string())
            .or_default()
            .insert(stream_id.to_string());

        Ok(stream)
    }

    pub fn get_stream(&self, stream_id: &str) -> StreamResult<StreamSession> {
        self.inner
            .lock()
            .streams
            .get(stream_id)
            .cloned()
            .ok_or_else(|| StreamError::StreamNotFound(stream_id.to_string()))
    }

    pub fn get_or_create_stream(
        &self,
        stream_id: &str,
        session_id: &str,
        metadata: Option<serde_json::Value>,
    ) -> StreamResult<StreamSession> {
        match self.get_stream(stream_id) {
            Ok(stream) => Ok(stream),
            Err(StreamError::StreamNotFound(_)) => {
                self.create_stream(stream_id, session_id, metadata)
            }
            Err(other) => Err(other),
        }
    }

    /// Apply a mutation to a stream in place, returning the updated copy.
    pub fn with_stream_mut<F, R>(&self, stream_id: &str, f: F) -> StreamResult<R>
    where
        F: FnOnce(&mut StreamSession) -> R,
    {
        let mut inner = self.inner.lock();
        let stream = inner
            .streams
            .get_mut(stream_id)
            .ok_or_else(|| StreamError::StreamNotFound(stream_id.to_string()))?;
        Ok(f(stream))
    }

    pub fn update_stream_status(
        &self,
        stream_id: &str,
        status: StreamStatus,
    ) -> StreamResult<StreamSession> {
        self.with_stream_mut(stream_id, |stream| {
            stream.status = status;
            stream.updated_at = Utc::now();
            stream.clone()
        })
    }

    pub fn delete_stream(&self, stream_id: &str) {
        let mut inner = self.inner.lock();
        if let Some(stream) = inner.streams.remove(stream_id) {
            if let Some(ids) = inner.session_streams.get_mut(&stream.session_id) {
                ids.remove(stream_id);
                if ids.is_empty() {
                    inner.session_streams.remove(&stream.session_id);
                }
            }
        }
    }

    pub fn session_streams(&self, session_id: &str) -> Vec<StreamSession> {
        let inner = self.inner.lock();
        inner
            .session_streams
            .get(session_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.streams.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn register_client(
        &self,
        client_id: &str,
        stream_id: &str,
        start_offset: u64,
    ) -> StreamResult<ClientInfo> {
        let mut inner = self.inner.lock();
        if !inner.streams.contains_key(stream_id) {
            return Err(StreamError::StreamNotFound(stream_id.to_string()));
        }

        let client = ClientInfo::new(client_id.to_string(), start_offset);
        inner.clients.insert(client_id.to_string(), client.clone());
        inner
            .streams
            .get_mut(stream_id)
            .expect("checked above")
            .add_client(client_id);

        Ok(client)
    }

    pub fn disconnect_client(&self, client_id: &str, stream_id: Option<&str>) {
        let mut inner = self.inner.lock();
        if let Some(client) = inner.clients.get_mut(client_id) {
            client.is_active = false;
            client.disconnected_at = Some(Utc::now());
        }
        if let Some(stream_id) = stream_id {
            if let Some(stream) = inner.streams.get_mut(stream_id) {
                stream.remove_client(client_id);
            }
        }
    }

    /// Record a client's acknowledged offset. Monotone-max: never regresses
    /// `last_offset`, even if called with a stale value out of order.
    pub fn update_client_offset(&self, client_id: &str, offset: u64) {
        let mut inner = self.inner.lock();
        if let Some(client) = inner.clients.get_mut(client_id) {
            client.last_offset = client.last_offset.max(offset);
            client.last_activity = Utc::now();
        }
    }

    pub fn get_client(&self, client_id: &str) -> Option<ClientInfo> {
        self.inner.lock().clients.get(client_id).cloned()
    }

    pub fn get_recovery_offset(&self, stream_id: &str, client_id: &str) -> StreamResult<u64> {
        let inner = self.inner.lock();
        if !inner.streams.contains_key(stream_id) {
            return Err(StreamError::StreamNotFound(stream_id.to_string()));
        }
        Ok(inner
            .clients
            .get(client_id)
            .map(|c| c.last_offset)
            .unwrap_or(0))
    }

    pub fn validate_offset(&self, stream_id: &str, offset: u64) -> StreamResult<()> {
        let inner = self.inner.lock();
        let stream = inner
            .streams
            .get(stream_id)
            .ok_or_else(|| StreamError::StreamNotFound(stream_id.to_string()))?;

        if offset > stream.current_offset {
            return Err(StreamError::InvalidOffset {
                stream_id: stream_id.to_string(),
                offset,
                current: stream.current_offset,
            });
        }
        Ok(())
    }

    pub fn active_streams(&self) -> Vec<StreamSession> {
        self.inner
            .lock()
            .streams
            .values()
            .filter(|s| s.is_active())
            .cloned()
            .collect()
    }

    pub fn stream_count(&self) -> usize {
        self.inner.lock().streams.len()
    }

    /// Remove terminal streams whose `completed_at` is older than `max_age_secs`.
    pub fn cleanup_old_streams(&self, max_age_secs: f64) -> usize {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        let to_remove: Vec<String> = inner
            .streams
            .values()
            .filter(|s| {
                s.is_terminal()
                    && s.completed_at
                        .map(|t| (now - t).num_milliseconds() as f64 / 1000.0 > max_age_secs)
                        .unwrap_or(false)
            })
            .map(|s| s.stream_id.clone())
            .collect();

        for stream_id in &to_remove {
            if let Some(stream) = inner.streams.remove(stream_id) {
                if let Some(ids) = inner.session_streams.get_mut(&stream.session_id) {
                    ids.remove(stream_id);
                    if ids.is_empty() {
                        inner.session_streams.remove(&stream.session_id);
                    }
                }
            }
        }

        to_remove.len()
    }

    pub fn stats(&self) -> StreamingStats {
        let inner = self.inner.lock();
        let total = inner.streams.len();
        let active = inner.streams.values().filter(|s| s.is_active()).count();
        let completed = inner
            .streams
            .values()
            .filter(|s| s.status == StreamStatus::Completed)
            .count();
        let cancelled = inner
            .streams
            .values()
            .filter(|s| s.status == StreamStatus::Cancelled)
            .count();
        let error = inner
            .streams
            .values()
            .filter(|s| s.status == StreamStatus::Error)
            .count();

        StreamingStats {
            total_streams: total,
            active_streams: active,
            completed_streams: completed,
            cancelled_streams: cancelled,
            error_streams: error,
            total_clients: inner.clients.len(),
            active_clients: inner.clients.values().filter(|c| c.is_active).count(),
        }
    }
}

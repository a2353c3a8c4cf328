//! Per-stream event buffering for recovery and replay.
//!
//! A ring-buffer-plus-offset-index: events live in a [`BTreeMap`] keyed by
//! offset, so eviction, range queries, and min/max lookups are all O(log n).

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{StreamError, StreamResult};
use crate::events::StreamEvent;

/// An event stored in the buffer, tagged with its insertion time for
/// age-based eviction.
#[derive(Debug, Clone)]
struct BufferedEvent {
    event: StreamEvent,
    inserted_at: Instant,
}

/// Coverage information for a client attempting to recover from a given
/// offset (see [`EventBuffer::buffer_coverage`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferCoverage {
    pub has_offset: bool,
    pub min_available: Option<u64>,
    pub max_available: Option<u64>,
    pub can_recover: bool,
    pub missing_count: u64,
}

/// Aggregate counters for a single stream's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferStats {
    pub current_size: usize,
    pub max_size: usize,
    pub total_inserted: u64,
    pub total_evicted: u64,
    pub min_offset: Option<u64>,
    pub max_offset: Option<u64>,
}

/// Fixed-capacity, offset-indexed buffer of recent events for one stream.
///
/// Oldest events are evicted once `max_size` is reached. Events older than
/// `max_age` (if set) are eligible for removal via [`EventBuffer::cleanup_expired`].
pub struct EventBuffer {
    max_size: usize,
    max_age: Option<Duration>,
    inner: Mutex<Inner>,
}

struct Inner {
    by_offset: BTreeMap<u64, BufferedEvent>,
    insertion_order: std::collections::VecDeque<u64>,
    total_inserted: u64,
    total_evicted: u64,
}

impl EventBuffer {
    pub fn new(max_size: usize, max_age: Option<Duration>) -> Self {
        Self {
            max_size,
            max_age,
            inner: Mutex::new(Inner {
                by_offset: BTreeMap::new(),
                insertion_order: std::collections::VecDeque::new(),
                total_inserted: 0,
                total_evicted: 0,
            }),
        }
    }

    /// Append an event, evicting the oldest entry if at capacity.
    pub fn append(&self, event: StreamEvent) -> StreamResult<()> {
        let mut inner = self.inner.lock();

        if inner.by_offset.len() >= self.max_size {
            if let Some(oldest_offset) = inner.insertion_order.pop_front() {
                inner.by_offset.remove(&oldest_offset);
                inner.total_evicted += 1;
            }
        }

        let offset = event.offset;
        inner.insertion_order.push_back(offset);
        inner.by_offset.insert(
            offset,
            BufferedEvent {
                event,
                inserted_at: Instant::now(),
            },
        );
        inner.total_inserted += 1;

        Ok(())
    }

    /// Fetch a single event by offset.
    pub fn get(&self, offset: u64) -> Option<StreamEvent> {
        self.inner
            .lock()
            .by_offset
            .get(&offset)
            .map(|b| b.event.clone())
    }

    /// Fetch events in `[start_offset, end_offset]`, sorted ascending, capped at `limit`.
    pub fn get_range(
        &self,
        start_offset: u64,
        end_offset: Option<u64>,
        limit: Option<usize>,
    ) -> Vec<StreamEvent> {
        let inner = self.inner.lock();
        let range = match end_offset {
            Some(end) => inner.by_offset.range(start_offset..=end),
            None => inner.by_offset.range(start_offset..),
        };

        let mut events: Vec<StreamEvent> = range.map(|(_, b)| b.event.clone()).collect();
        if let Some(limit) = limit {
            events.truncate(limit);
        }
        events
    }

    /// Fetch all events from `offset` onwards. Primary recovery entry point.
    pub fn get_from_offset(&self, offset: u64, limit: Option<usize>) -> Vec<StreamEvent> {
        self.get_range(offset, None, limit)
    }

    pub fn has_offset(&self, offset: u64) -> bool {
        self.inner.lock().by_offset.contains_key(&offset)
    }

    pub fn min_offset(&self) -> Option<u64> {
        self.inner.lock().by_offset.keys().next().copied()
    }

    pub fn max_offset(&self) -> Option<u64> {
        self.inner.lock().by_offset.keys().next_back().copied()
    }

    /// Describe whether a client asking to recover from `required_offset` can
    /// be served from this buffer, and how many events (if any) are missing.
    pub fn buffer_coverage(&self, required_offset: u64) -> BufferCoverage {
        let inner = self.inner.lock();

        let Some(min_offset) = inner.by_offset.keys().next().copied() else {
            return BufferCoverage {
                has_offset: false,
                min_available: None,
                max_available: None,
                can_recover: false,
                missing_count: required_offset,
            };
        };
        let max_offset = *inner.by_offset.keys().next_back().unwrap();

        let has_offset = inner.by_offset.contains_key(&required_offset);
        let can_recover = required_offset <= max_offset;
        let missing_count = if required_offset <= min_offset {
            0
        } else {
            (min_offset..required_offset)
                .filter(|o| !inner.by_offset.contains_key(o))
                .count() as u64
        };

        BufferCoverage {
            has_offset,
            min_available: Some(min_offset),
            max_available: Some(max_offset),
            can_recover,
            missing_count,
        }
    }

    /// Remove events inserted before `max_age` ago. No-op if `max_age` is unset.
    pub fn cleanup_expired(&self) -> usize {
        let Some(max_age) = self.max_age else {
            return 0;
        };

        let mut inner = self.inner.lock();
        let cutoff = Instant::now() - max_age;
        let expired: Vec<u64> = inner
            .by_offset
            .iter()
            .filter(|(_, b)| b.inserted_at < cutoff)
            .map(|(offset, _)| *offset)
            .collect();

        for offset in &expired {
            inner.by_offset.remove(offset);
        }
        inner.insertion_order.retain(|o| !expired.contains(o));

        expired.len()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.by_offset.clear();
        inner.insertion_order.clear();
    }

    pub fn stats(&self) -> BufferStats {
        let inner = self.inner.lock();
        BufferStats {
            current_size: inner.by_offset.len(),
            max_size: self.max_size,
            total_inserted: inner.total_inserted,
            total_evicted: inner.total_evicted,
            min_offset: inner.by_offset.keys().next().copied(),
            max_offset: inner.by_offset.keys().next_back().copied(),
        }
    }

    /// The most recent `count` events, newest first.
    pub fn recent_events(&self, count: usize) -> Vec<StreamEvent> {
        self.inner
            .lock()
            .by_offset
            .values()
            .rev()
            .take(count)
            .map(|b| b.event.clone())
            .collect()
    }
}

/// Owns one [`EventBuffer`] per stream, lazily created on first use.
pub struct PerStreamBuffer {
    max_size: usize,
    max_age: Option<Duration>,
    buffers: Mutex<HashMap<String, std::sync::Arc<EventBuffer>>>,
}

impl PerStreamBuffer {
    pub fn new(max_size: usize, max_age: Option<Duration>) -> Self {
        Self {
            max_size,
            max_age,
            buffers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_or_create(&self, stream_id: &str) -> std::sync::Arc<EventBuffer> {
        let mut buffers = self.buffers.lock();
        buffers
            .entry(stream_id.to_string())
            .or_insert_with(|| std::sync::Arc::new(EventBuffer::new(self.max_size, self.max_age)))
            .clone()
    }

    pub fn get(&self, stream_id: &str) -> Option<std::sync::Arc<EventBuffer>> {
        self.buffers.lock().get(stream_id).cloned()
    }

    pub fn remove(&self, stream_id: &str) -> StreamResult<()> {
        let mut buffers = self.buffers.lock();
        match buffers.remove(stream_id) {
            Some(buffer) => {
                buffer.clear();
                Ok(())
            }
            None => Err(StreamError::StreamNotFound(stream_id.to_string())),
        }
    }

    pub fn cleanup_all(&self) {
        let mut buffers = self.buffers.lock();
        for buffer in buffers.values() {
            buffer.clear();
        }
        buffers.clear();
    }

    pub fn cleanup_expired_all(&self) -> HashMap<String, usize> {
        let buffers = self.buffers.lock();
        buffers
            .iter()
            .map(|(stream_id, buffer)| (stream_id.clone(), buffer.cleanup_expired()))
            .collect()
    }

    pub fn stats(&self) -> HashMap<String, BufferStats> {
        let buffers = self.buffers.lock();
        buffers
            .iter()
            .map(|(stream_id, buffer)| (stream_id.clone(), buffer.stats()))
            .collect()
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
                text: format!("chunk-{offset}"),
                is_delta: true,
                token_count: None,
            },
        )
        .with_offset_and_sequence(offset, offset)
    }

    #[test]
    fn append_and_get_round_trips() {
        let buffer = EventBuffer::new(10, None);
        buffer.append(event(1)).unwrap();
        buffer.append(event(2)).unwrap();

        assert!(buffer.get(1).is_some());
        assert_eq!(buffer.get(2).unwrap().offset, 2);
        assert!(buffer.get(3).is_none());
    }

    #[test]
    fn eviction_drops_oldest_at_capacity() {
        let buffer = EventBuffer::new(2, None);
        buffer.append(event(1)).unwrap();
        buffer.append(event(2)).unwrap();
        buffer.append(event(3)).unwrap();

        assert!(buffer.get(1).is_none());
        assert!(buffer.get(2).is_some());
        assert!(buffer.get(3).is_some());
        assert_eq!(buffer.stats().total_evicted, 1);
    }

    #[test]
    fn get_range_is_sorted_and_bounded() {
        let buffer = EventBuffer::new(10, None);
        for i in 1..=5 {
            buffer.append(event(i)).unwrap();
        }

        let events = buffer.get_range(2, Some(4), None);
        let offsets: Vec<u64> = events.iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![2, 3, 4]);

        let limited = buffer.get_range(1, None, Some(2));
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn buffer_coverage_reports_missing_events() {
        let buffer = EventBuffer::new(10, None);
        buffer.append(event(5)).unwrap();
        buffer.append(event(6)).unwrap();

        let coverage = buffer.buffer_coverage(6);
        assert!(coverage.has_offset);
        assert!(coverage.can_recover);
        assert_eq!(coverage.missing_count, 0);

        let coverage = buffer.buffer_coverage(8);
        assert!(!coverage.has_offset);
        assert!(!coverage.can_recover);

        let coverage = buffer.buffer_coverage(3);
        assert_eq!(coverage.missing_count, 0);
        assert!(coverage.can_recover);
    }

    #[test]
    fn buffer_coverage_on_empty_buffer() {
        let buffer = EventBuffer::new(10, None);
        let coverage = buffer.buffer_coverage(5);
        assert!(!coverage.has_offset);
        assert!(!coverage.can_recover);
        assert_eq!(coverage.missing_count, 5);
        assert_eq!(coverage.min_available, None);
    }

    #[test]
    fn cleanup_expired_removes_old_events() {
        let buffer = EventBuffer::new(10, Some(Duration::from_millis(10)));
        buffer.append(event(1)).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        buffer.append(event(2)).unwrap();

        let removed = buffer.cleanup_expired();
        assert_eq!(removed, 1);
        assert!(buffer.get(1).is_none());
        assert!(buffer.get(2).is_some());
    }

    #[test]
    fn cleanup_expired_is_noop_without_max_age() {
        let buffer = EventBuffer::new(10, None);
        buffer.append(event(1)).unwrap();
        assert_eq!(buffer.cleanup_expired(), 0);
    }

    #[test]
    fn recent_events_returns_newest_first() {
        let buffer = EventBuffer::new(10, None);
        for i in 1..=3 {
            buffer.append(event(i)).unwrap();
        }
        let recent = buffer.recent_events(2);
        assert_eq!(recent[0].offset, 3);
        assert_eq!(recent[1].offset, 2);
    }

    #[test]
    fn per_stream_buffer_isolates_streams() {
        let per_stream = PerStreamBuffer::new(10, None);
        let buffer_a = per_stream.get_or_create("a");
        let buffer_b = per_stream.get_or_create("b");

        buffer_a.append(event(1)).unwrap();
        assert!(buffer_a.get(1).is_some());
        assert!(buffer_b.get(1).is_none());
    }

    #[test]
    fn per_stream_buffer_get_or_create_is_idempotent() {
        let per_stream = PerStreamBuffer::new(10, None);
        let first = per_stream.get_or_create("a");
        first.append(event(1)).unwrap();

        let second = per_stream.get_or_create("a");
        assert!(second.get(1).is_some());
    }

    #[test]
    fn per_stream_buffer_remove_errors_on_unknown_stream() {
        let per_stream = PerStreamBuffer::new(10, None);
        let result = per_stream.remove("missing");
        assert!(matches!(result, Err(StreamError::StreamNotFound(_))));
    }

    #[test]
    fn per_stream_buffer_stats_cover_all_streams() {
        let per_stream = PerStreamBuffer::new(10, None);
        per_stream.get_or_create("a").append(event(1)).unwrap();
        per_stream.get_or_create("b").append(event(1)).unwrap();

        let stats = per_stream.stats();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats["a"].current_size, 1);
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Discriminant of a [`StreamEvent`]'s payload, mirrored in the SSE `event:`
/// line and the `type` field of its wire payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Chunk,
    ToolStart,
    ToolResult,
    Thinking,
    Offset,
    Error,
    Complete,
    Cancelled,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chunk => "chunk",
            Self::ToolStart => "tool_start",
            Self::ToolResult => "tool_result",
            Self::Thinking => "thinking",
            Self::Offset => "offset",
            Self::Error => "error",
            Self::Complete => "complete",
            Self::Cancelled => "cancelled",
        }
    }
}

/// The variable part of a stream event: everything besides the shared
/// offset/timestamp/session/sequence envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    Chunk {
        text: String,
        is_delta: bool,
        token_count: Option<u32>,
    },
    ToolStart {
        tool_name: String,
        tool_input: serde_json::Value,
        tool_call_id: String,
    },
    ToolResult {
        tool_name: String,
        tool_call_id: String,
        result: serde_json::Value,
        execution_time_ms: u64,
        error: Option<String>,
    },
    Thinking {
        text: String,
        step: Option<u32>,
    },
    Offset {
        checkpoint_data: Option<serde_json::Value>,
        is_recoverable: bool,
    },
    Error {
        error_code: String,
        message: String,
        details: Option<serde_json::Value>,
        is_recoverable: bool,
    },
    Complete {
        final_offset: u64,
        total_tokens: Option<u64>,
        finish_reason: String,
    },
    Cancelled {
        reason: Option<String>,
        cancelled_at_offset: u64,
    },
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::Chunk { .. } => EventType::Chunk,
            Self::ToolStart { .. } => EventType::ToolStart,
            Self::ToolResult { .. } => EventType::ToolResult,
            Self::Thinking { .. } => EventType::Thinking,
            Self::Offset { .. } => EventType::Offset,
            Self::Error { .. } => EventType::Error,
            Self::Complete { .. } => EventType::Complete,
            Self::Cancelled { .. } => EventType::Cancelled,
        }
    }

    fn data_json(&self) -> serde_json::Value {
        match self {
            Self::Chunk {
                text,
                is_delta,
                token_count,
            } => json!({ "text": text, "is_delta": is_delta, "token_count": token_count }),
            Self::ToolStart {
                tool_name,
                tool_input,
                tool_call_id,
            } => json!({
                "tool_name": tool_name,
                "tool_input": tool_input,
                "tool_call_id": tool_call_id,
            }),
            Self::ToolResult {
                tool_name,
                tool_call_id,
                result,
                execution_time_ms,
                error,
            } => json!({
                "tool_name": tool_name,
                "tool_call_id": tool_call_id,
                "result": result,
                "execution_time_ms": execution_time_ms,
                "error": error,
            }),
            Self::Thinking { text, step } => json!({ "text": text, "step": step }),
            Self::Offset {
                checkpoint_data,
                is_recoverable,
            } => json!({
                "checkpoint_data": checkpoint_data,
                "is_recoverable": is_recoverable,
            }),
            Self::Error {
                error_code,
                message,
                details,
                is_recoverable,
            } => json!({
                "error_code": error_code,
                "message": message,
                "details": details,
                "is_recoverable": is_recoverable,
            }),
            Self::Complete {
                final_offset,
                total_tokens,
                finish_reason,
            } => json!({
                "final_offset": final_offset,
                "total_tokens": total_tokens,
                "finish_reason": finish_reason,
            }),
            Self::Cancelled {
                reason,
                cancelled_at_offset,
            } => json!({
                "reason": reason,
                "cancelled_at_offset": cancelled_at_offset,
            }),
        }
    }
}

/// A single event flowing through a stream: the shared envelope (offset,
/// timestamp, session, sequence) plus a tagged payload.
///
/// Conceptually immutable once constructed — offset/sequence reassignment
/// happens by building a new `StreamEvent` (see
/// [`StreamEvent::with_offset_and_sequence`]), never by mutating one in
/// place, so events already sitting in a buffer are never invalidated out
/// from under a reader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    pub offset: u64,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub sequence: u64,
    pub payload: EventPayload,
}

impl StreamEvent {
    /// Construct a new event with offset/sequence left at zero; the
    /// Streaming Core assigns real values when the event enters a stream.
    pub fn new(session_id: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            offset: 0,
            timestamp: Utc::now(),
            session_id: session_id.into(),
            sequence: 0,
            payload,
        }
    }

    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }

    /// Return a copy of this event with `offset` and `sequence` assigned.
    pub fn with_offset_and_sequence(&self, offset: u64, sequence: u64) -> Self {
        Self {
            offset,
            sequence,
            ..self.clone()
        }
    }

    /// The exact wire payload shape: `{type, offset, timestamp, session_id, sequence, data}`.
    pub fn to_wire_payload(&self) -> serde_json::Value {
        json!({
            "type": self.event_type().as_str(),
            "offset": self.offset,
            "timestamp": self.timestamp.to_rfc3339(),
            "session_id": self.session_id,
            "sequence": self.sequence,
            "data": self.payload.data_json(),
        })
    }

    /// Render as a complete SSE frame: `event: {type}\ndata: {json}\n\n`.
    pub fn to_sse_line(&self) -> String {
        format!(
            "event: {}\ndata: {}\n\n",
            self.event_type().as_str(),
            self.to_wire_payload()
        )
    }
}

use thiserror::Error;

/// Errors produced by the Streaming Core, Agent Adapter, and Task Queue.
///
/// Each variant maps to an HTTP status at the gateway boundary via
/// [`StreamError::status_code`].
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream not found: {0}")]
    StreamNotFound(String),

    #[error("stream already exists: {0}")]
    StreamAlreadyExists(String),

    #[error("stream already completed: {0}")]
    StreamCompleted(String),

    #[error("stream was cancelled: {0}")]
    StreamCancelled(String),

    #[error("invalid offset {offset} for stream {stream_id} (current offset {current})")]
    InvalidOffset {
        stream_id: String,
        offset: u64,
        current: u64,
    },

    #[error("client disconnected: {0}")]
    ClientDisconnected(String),

    #[error("buffer overflow for stream {0}")]
    BufferOverflow(String),

    #[error("tool iteration limit reached after {0} iterations")]
    ToolIterationLimit(u32),

    #[error("tool call failed: {0}")]
    ToolCallFailed(String),

    #[error("provider error: {0}")]
    ProviderError(#[from] anyhow::Error),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("invalid bot configuration: {0}")]
    BotConfiguration(String),

    #[error("stream {0} has not reached a terminal state yet")]
    StreamNotTerminal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StreamError {
    /// HTTP status code this error should surface as at the gateway boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::StreamNotFound(_) | Self::TaskNotFound(_) => 404,
            Self::StreamAlreadyExists(_) => 409,
            Self::StreamCompleted(_) | Self::StreamCancelled(_) => 410,
            Self::InvalidOffset { .. } | Self::BotConfiguration(_) => 400,
            Self::StreamNotTerminal(_) => 409,
            Self::ClientDisconnected(_) => 410,
            Self::BufferOverflow(_) => 507,
            Self::ToolIterationLimit(_) => 422,
            Self::ToolCallFailed(_) => 502,
            Self::ProviderError(_) => 502,
            Self::Io(_) => 500,
        }
    }

    /// Whether this error represents a condition a retry would plausibly resolve.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ProviderError(_) | Self::ToolCallFailed(_) | Self::Io(_)
        )
    }
}

pub type StreamResult<T> = Result<T, StreamError>;

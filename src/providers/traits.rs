use crate::tools::traits::ToolSpec;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// Role of a single message in a chat history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One turn of conversation passed to a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
        }
    }
}

/// A tool invocation requested by the model mid-stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// One increment of a streaming provider response.
///
/// Mirrors the three things a token-by-token LLM stream can produce: a text
/// delta, a fully-formed tool call, or a terminal marker carrying token
/// accounting for the turn.
#[derive(Debug, Clone)]
pub enum ProviderChunk {
    ContentDelta(String),
    ToolCall(ToolCallRequest),
    Done {
        finish_reason: String,
        input_tokens: Option<u64>,
        output_tokens: Option<u64>,
    },
}

#[async_trait]
pub trait Provider: Send + Sync {
    async fn chat(&self, message: &str, model: &str, temperature: f64) -> anyhow::Result<String> {
        self.chat_with_system(None, message, model, temperature)
            .await
    }

    async fn chat_with_system(
        &self,
        system_prompt: Option<&str>,
        message: &str,
        model: &str,
        temperature: f64,
    ) -> anyhow::Result<String>;

    /// Stream a chat completion token-by-token, with tool-calling support.
    ///
    /// Implementations yield `ContentDelta` chunks as text arrives,
    /// `ToolCall` chunks when the model requests a tool, and exactly one
    /// terminal `Done` chunk. The default implementation adapts the
    /// non-streaming `chat_with_system` into a single `ContentDelta` followed
    /// by `Done`, for providers that have no native streaming transport.
    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        _tools: &[ToolSpec],
        model: &str,
        temperature: f64,
    ) -> anyhow::Result<BoxStream<'static, anyhow::Result<ProviderChunk>>> {
        let system_prompt = messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.clone());
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();

        let text = self
            .chat_with_system(system_prompt.as_deref(), &last_user, model, temperature)
            .await?;

        let chunks = vec![
            Ok(ProviderChunk::ContentDelta(text)),
            Ok(ProviderChunk::Done {
                finish_reason: "stop".into(),
                input_tokens: None,
                output_tokens: None,
            }),
        ];
        Ok(Box::pin(futures_util::stream::iter(chunks)))
    }

    /// Warm up the HTTP connection pool (TLS handshake, DNS, HTTP/2 setup).
    /// Default implementation is a no-op; providers with HTTP clients should override.
    async fn warmup(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

//! Converts an agent's tool-calling run into the typed event sequence the
//! Streaming Core consumes.
//!
//! A ReAct loop: send, parse tool calls, execute, append results, repeat
//! until the model answers with no further tool calls or `max_iterations` is
//! exhausted. Each step streams as an [`EventPayload`] rather than
//! accumulating into one final string, since the consumer here is the
//! Streaming Core rather than a CLI REPL.

use std::sync::Arc;
use std::time::Instant;

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::agent::compression::{self, CompressionStrategy};
use crate::error::StreamError;
use crate::events::EventPayload;
use crate::observability::{Observer, ObserverEvent};
use crate::providers::{ChatMessage, Provider, ProviderChunk};
use crate::tools::Tool;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Static configuration for one agent run, bound at adapter construction.
pub struct AdapterConfig {
    pub provider_name: String,
    pub model: String,
    pub temperature: f64,
    pub system_prompt: Option<String>,
    pub max_iterations: u32,
    pub compress_context: bool,
    pub compression_strategy: CompressionStrategy,
    pub compression_token_threshold: usize,
    pub compression_keep_recent: usize,
    pub show_thinking: bool,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            provider_name: "unknown".to_string(),
            model: String::new(),
            temperature: 0.7,
            system_prompt: None,
            max_iterations: 10,
            compress_context: false,
            compression_strategy: CompressionStrategy::Window,
            compression_token_threshold: 8_000,
            compression_keep_recent: 6,
            show_thinking: false,
        }
    }
}

/// Adapts a [`Provider`] plus a bound tool registry into the Streaming
/// Core's event contract.
pub struct AgentAdapter {
    provider: Arc<dyn Provider>,
    tools: Vec<Arc<dyn Tool>>,
    observer: Arc<dyn Observer>,
    config: AdapterConfig,
}

impl AgentAdapter {
    pub fn new(
        provider: Arc<dyn Provider>,
        tools: Vec<Arc<dyn Tool>>,
        observer: Arc<dyn Observer>,
        config: AdapterConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            provider,
            tools,
            observer,
            config,
        })
    }

    fn find_tool(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    /// Run the ReAct loop and expose it as the event stream `StreamingCore`
    /// drives. `thread_history` is any persisted prior turns for this
    /// thread; `messages` are the newly incoming ones for this turn.
    pub fn stream(
        self: Arc<Self>,
        thread_history: Vec<ChatMessage>,
        messages: Vec<ChatMessage>,
    ) -> BoxStream<'static, anyhow::Result<EventPayload>> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            self.run(thread_history, messages, tx).await;
        });
        ReceiverStream::new(rx).boxed()
    }

    async fn run(
        self: Arc<Self>,
        thread_history: Vec<ChatMessage>,
        messages: Vec<ChatMessage>,
        tx: mpsc::Sender<anyhow::Result<EventPayload>>,
    ) {
        let mut history = Vec::new();
        if let Some(prompt) = &self.config.system_prompt {
            history.push(ChatMessage::system(prompt));
        }
        history.extend(thread_history);
        history.extend(messages);

        let tool_specs: Vec<crate::tools::ToolSpec> =
            self.tools.iter().map(|t| t.spec()).collect();

        self.observer.record_event(&ObserverEvent::AgentStart {
            provider: self.config.provider_name.clone(),
            model: self.config.model.clone(),
        });
        let run_started_at = Instant::now();

        let max_iterations = self.config.max_iterations.max(1);
        let mut iterations_used = 0u32;

        loop {
            if self.config.compress_context {
                let over_budget =
                    compression::estimate_tokens(&history) > self.config.compression_token_threshold;
                if over_budget {
                    compression::compress(
                        &mut history,
                        self.config.compression_strategy,
                        self.config.compression_keep_recent,
                        self.provider.as_ref(),
                        &self.config.model,
                    )
                    .await;
                }
            }

            self.observer.record_event(&ObserverEvent::LlmRequest {
                provider: self.config.provider_name.clone(),
                model: self.config.model.clone(),
                messages_count: history.len(),
            });
            let llm_started_at = Instant::now();

            let mut provider_stream = match self
                .provider
                .stream_chat(
                    &history,
                    &tool_specs,
                    &self.config.model,
                    self.config.temperature,
                )
                .await
            {
                Ok(s) => s,
                Err(e) => {
                    self.observer.record_event(&ObserverEvent::LlmResponse {
                        provider: self.config.provider_name.clone(),
                        model: self.config.model.clone(),
                        duration: llm_started_at.elapsed(),
                        success: false,
                        error_message: Some(e.to_string()),
                        input_tokens: None,
                        output_tokens: None,
                    });
                    let _ = tx.send(Err(StreamError::ProviderError(e).into())).await;
                    return;
                }
            };

            let mut content = String::new();
            let mut tool_calls = Vec::new();
            let mut output_tokens = None;

            while let Some(chunk) = provider_stream.next().await {
                match chunk {
                    Ok(ProviderChunk::ContentDelta(text)) => {
                        content.push_str(&text);
                        if tx
                            .send(Ok(EventPayload::Chunk {
                                text,
                                is_delta: true,
                                token_count: None,
                            }))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Ok(ProviderChunk::ToolCall(call)) => tool_calls.push(call),
                    Ok(ProviderChunk::Done {
                        output_tokens: ot, ..
                    }) => {
                        output_tokens = ot;
                    }
                    Err(e) => {
                        self.observer.record_event(&ObserverEvent::LlmResponse {
                            provider: self.config.provider_name.clone(),
                            model: self.config.model.clone(),
                            duration: llm_started_at.elapsed(),
                            success: false,
                            error_message: Some(e.to_string()),
                            input_tokens: None,
                            output_tokens: None,
                        });
                        let _ = tx.send(Err(StreamError::ProviderError(e).into())).await;
                        return;
                    }
                }
            }

            self.observer.record_event(&ObserverEvent::LlmResponse {
                provider: self.config.provider_name.clone(),
                model: self.config.model.clone(),
                duration: llm_started_at.elapsed(),
                success: true,
                error_message: None,
                input_tokens: None,
                output_tokens,
            });

            if tool_calls.is_empty() {
                history.push(ChatMessage::assistant(content));
                self.observer.record_event(&ObserverEvent::AgentEnd {
                    provider: self.config.provider_name.clone(),
                    model: self.config.model.clone(),
                    duration: run_started_at.elapsed(),
                    tokens_used: output_tokens,
                    cost_usd: None,
                });
                return;
            }

            iterations_used += 1;
            if iterations_used > max_iterations {
                let _ = tx
                    .send(Err(StreamError::ToolIterationLimit(iterations_used).into()))
                    .await;
                return;
            }

            history.push(ChatMessage::assistant(content));

            for call in &tool_calls {
                if tx
                    .send(Ok(EventPayload::ToolStart {
                        tool_name: call.name.clone(),
                        tool_input: call.arguments.clone(),
                        tool_call_id: call.id.clone(),
                    }))
                    .await
                    .is_err()
                {
                    return;
                }

                self.observer.record_event(&ObserverEvent::ToolCallStart {
                    tool: call.name.clone(),
                });
                let tool_started_at = Instant::now();

                let (result_value, exec_error) = match self.find_tool(&call.name) {
                    None => (
                        serde_json::Value::Null,
                        Some(format!("unknown tool: {}", call.name)),
                    ),
                    Some(tool) => match validate_against_schema(&tool.parameters_schema(), &call.arguments) {
                        Err(reason) => (serde_json::Value::Null, Some(reason)),
                        Ok(()) => match tool.execute(call.arguments.clone()).await {
                            Ok(r) if r.success => (serde_json::Value::String(r.output), None),
                            Ok(r) => (
                                serde_json::Value::Null,
                                Some(r.error.unwrap_or(r.output)),
                            ),
                            Err(e) => (serde_json::Value::Null, Some(e.to_string())),
                        },
                    },
                };

                self.observer.record_event(&ObserverEvent::ToolCall {
                    tool: call.name.clone(),
                    duration: tool_started_at.elapsed(),
                    success: exec_error.is_none(),
                });

                if tx
                    .send(Ok(EventPayload::ToolResult {
                        tool_name: call.name.clone(),
                        tool_call_id: call.id.clone(),
                        result: result_value.clone(),
                        execution_time_ms: tool_started_at.elapsed().as_millis() as u64,
                        error: exec_error.clone(),
                    }))
                    .await
                    .is_err()
                {
                    return;
                }

                let tool_message = serde_json::json!({
                    "tool_call_id": call.id,
                    "content": exec_error.clone().unwrap_or_else(|| result_value.to_string()),
                });
                history.push(ChatMessage::tool(tool_message.to_string()));
            }

            continue;
        }
    }
}

/// Minimal structural validation: every name in the schema's `required`
/// array must be present in `arguments`. Full JSON-schema validation (types,
/// enums, nested shapes) is left to the tool's own `execute`.
fn validate_against_schema(schema: &serde_json::Value, arguments: &serde_json::Value) -> Result<(), String> {
    let Some(required) = schema.get("required").and_then(|v| v.as_array()) else {
        return Ok(());
    };

    for field in required {
        let Some(name) = field.as_str() else { continue };
        if arguments.get(name).is_none() {
            return Err(format!("missing required argument: {name}"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::noop::NoopObserver;
    use crate::tools::ToolResult;
    use async_trait::async_trait;

    struct StaticTool;

    #[async_trait]
    impl Tool for StaticTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "required": ["text"]})
        }
        async fn execute(&self, args: serde_json::Value) -> anyhow::Result<ToolResult> {
            Ok(ToolResult {
                success: true,
                output: args.get("text").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                error: None,
            })
        }
    }

    struct ScriptedProvider {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        async fn chat_with_system(
            &self,
            _system_prompt: Option<&str>,
            _message: &str,
            _model: &str,
            _temperature: f64,
        ) -> anyhow::Result<String> {
            Ok("unused".to_string())
        }

        async fn stream_chat(
            &self,
            _messages: &[ChatMessage],
            _tools: &[crate::tools::ToolSpec],
            _model: &str,
            _temperature: f64,
        ) -> anyhow::Result<BoxStream<'static, anyhow::Result<ProviderChunk>>> {
            let n = self
                .calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);

            let chunks = if n == 0 {
                vec![
                    Ok(ProviderChunk::ContentDelta("looking it up".to_string())),
                    Ok(ProviderChunk::ToolCall(crate::providers::ToolCallRequest {
                        id: "call-1".to_string(),
                        name: "echo".to_string(),
                        arguments: serde_json::json!({"text": "hi"}),
                    })),
                    Ok(ProviderChunk::Done {
                        finish_reason: "tool_calls".to_string(),
                        input_tokens: Some(10),
                        output_tokens: Some(5),
                    }),
                ]
            } else {
                vec![
                    Ok(ProviderChunk::ContentDelta("done".to_string())),
                    Ok(ProviderChunk::Done {
                        finish_reason: "stop".to_string(),
                        input_tokens: Some(10),
                        output_tokens: Some(2),
                    }),
                ]
            };
            Ok(Box::pin(futures_util::stream::iter(chunks)))
        }
    }

    fn adapter(max_iterations: u32) -> Arc<AgentAdapter> {
        let provider = Arc::new(ScriptedProvider {
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let tools: Vec<Arc<dyn Tool>> = vec![Arc::new(StaticTool)];
        let observer = Arc::new(NoopObserver);
        AgentAdapter::new(
            provider,
            tools,
            observer,
            AdapterConfig {
                max_iterations,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn stream_emits_chunk_tool_start_tool_result_then_final_chunk() {
        let adapter = adapter(5);
        let mut stream = adapter.stream(Vec::new(), vec![ChatMessage::user("search something")]);

        let mut events = Vec::new();
        while let Some(item) = stream.next().await {
            events.push(item.unwrap());
        }

        assert!(matches!(events[0], EventPayload::Chunk { .. }));
        assert!(matches!(events[1], EventPayload::ToolStart { .. }));
        assert!(matches!(events[2], EventPayload::ToolResult { .. }));
        assert!(matches!(events[3], EventPayload::Chunk { .. }));
        assert_eq!(events.len(), 4);
    }

    #[tokio::test]
    async fn missing_required_argument_surfaces_as_tool_result_error() {
        struct NoArgsProvider;
        #[async_trait]
        impl Provider for NoArgsProvider {
            async fn chat_with_system(
                &self,
                _s: Option<&str>,
                _m: &str,
                _model: &str,
                _t: f64,
            ) -> anyhow::Result<String> {
                Ok(String::new())
            }

            async fn stream_chat(
                &self,
                _messages: &[ChatMessage],
                _tools: &[crate::tools::ToolSpec],
                _model: &str,
                _temperature: f64,
            ) -> anyhow::Result<BoxStream<'static, anyhow::Result<ProviderChunk>>> {
                let chunks = vec![
                    Ok(ProviderChunk::ToolCall(crate::providers::ToolCallRequest {
                        id: "call-1".to_string(),
                        name: "echo".to_string(),
                        arguments: serde_json::json!({}),
                    })),
                    Ok(ProviderChunk::Done {
                        finish_reason: "tool_calls".to_string(),
                        input_tokens: None,
                        output_tokens: None,
                    }),
                ];
                Ok(Box::pin(futures_util::stream::iter(chunks)))
            }
        }

        let provider = Arc::new(NoArgsProvider);
        let tools: Vec<Arc<dyn Tool>> = vec![Arc::new(StaticTool)];
        let observer = Arc::new(NoopObserver);
        let adapter = AgentAdapter::new(
            provider,
            tools,
            observer,
            AdapterConfig {
                max_iterations: 1,
                ..Default::default()
            },
        );

        let mut stream = adapter.stream(Vec::new(), vec![ChatMessage::user("go")]);
        let mut events = Vec::new();
        while let Some(item) = stream.next().await {
            events.push(item);
        }

        let tool_result = events
            .iter()
            .find_map(|e| match e {
                Ok(EventPayload::ToolResult { error, .. }) => Some(error.clone()),
                _ => None,
            })
            .flatten();
        assert!(tool_result.unwrap().contains("missing required argument"));
    }

    #[tokio::test]
    async fn exceeding_max_iterations_yields_tool_iteration_limit_error() {
        struct AlwaysToolCallProvider;
        #[async_trait]
        impl Provider for AlwaysToolCallProvider {
            async fn chat_with_system(
                &self,
                _s: Option<&str>,
                _m: &str,
                _model: &str,
                _t: f64,
            ) -> anyhow::Result<String> {
                Ok(String::new())
            }

            async fn stream_chat(
                &self,
                _messages: &[ChatMessage],
                _tools: &[crate::tools::ToolSpec],
                _model: &str,
                _temperature: f64,
            ) -> anyhow::Result<BoxStream<'static, anyhow::Result<ProviderChunk>>> {
                let chunks = vec![
                    Ok(ProviderChunk::ToolCall(crate::providers::ToolCallRequest {
                        id: "call-x".to_string(),
                        name: "echo".to_string(),
                        arguments: serde_json::json!({"text": "x"}),
                    })),
                    Ok(ProviderChunk::Done {
                        finish_reason: "tool_calls".to_string(),
                        input_tokens: None,
                        output_tokens: None,
                    }),
                ];
                Ok(Box::pin(futures_util::stream::iter(chunks)))
            }
        }

        let provider = Arc::new(AlwaysToolCallProvider);
        let tools: Vec<Arc<dyn Tool>> = vec![Arc::new(StaticTool)];
        let observer = Arc::new(NoopObserver);
        let adapter = AgentAdapter::new(
            provider,
            tools,
            observer,
            AdapterConfig {
                max_iterations: 2,
                ..Default::default()
            },
        );

        let mut stream = adapter.stream(Vec::new(), vec![ChatMessage::user("loop forever")]);
        let mut last = None;
        while let Some(item) = stream.next().await {
            last = Some(item);
        }

        let err = last.unwrap().unwrap_err();
        assert!(err.to_string().contains("iteration limit"));
    }

    #[tokio::test]
    async fn a_stopping_round_after_exactly_max_iterations_tool_cycles_still_succeeds() {
        struct StopsAfterTwoCyclesProvider {
            calls: std::sync::atomic::AtomicUsize,
        }
        #[async_trait]
        impl Provider for StopsAfterTwoCyclesProvider {
            async fn chat_with_system(
                &self,
                _s: Option<&str>,
                _m: &str,
                _model: &str,
                _t: f64,
            ) -> anyhow::Result<String> {
                Ok(String::new())
            }

            async fn stream_chat(
                &self,
                _messages: &[ChatMessage],
                _tools: &[crate::tools::ToolSpec],
                _model: &str,
                _temperature: f64,
            ) -> anyhow::Result<BoxStream<'static, anyhow::Result<ProviderChunk>>> {
                let call = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                let chunks = if call < 2 {
                    vec![
                        Ok(ProviderChunk::ToolCall(crate::providers::ToolCallRequest {
                            id: format!("call-{call}"),
                            name: "echo".to_string(),
                            arguments: serde_json::json!({"text": "x"}),
                        })),
                        Ok(ProviderChunk::Done {
                            finish_reason: "tool_calls".to_string(),
                            input_tokens: None,
                            output_tokens: None,
                        }),
                    ]
                } else {
                    vec![
                        Ok(ProviderChunk::ContentDelta("done".to_string())),
                        Ok(ProviderChunk::Done {
                            finish_reason: "stop".to_string(),
                            input_tokens: None,
                            output_tokens: None,
                        }),
                    ]
                };
                Ok(Box::pin(futures_util::stream::iter(chunks)))
            }
        }

        let provider = Arc::new(StopsAfterTwoCyclesProvider {
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let tools: Vec<Arc<dyn Tool>> = vec![Arc::new(StaticTool)];
        let observer = Arc::new(NoopObserver);
        let adapter = AgentAdapter::new(
            provider,
            tools,
            observer,
            AdapterConfig {
                max_iterations: 2,
                ..Default::default()
            },
        );

        let mut stream = adapter.stream(Vec::new(), vec![ChatMessage::user("go")]);
        let mut events = Vec::new();
        while let Some(item) = stream.next().await {
            events.push(item.unwrap());
        }

        // Two tool-call cycles plus a non-counted stopping round must succeed
        // rather than tripping the iteration limit.
        assert!(events
            .iter()
            .any(|e| matches!(e, EventPayload::ToolResult { .. })));
        assert!(matches!(events.last(), Some(EventPayload::Chunk { .. })));
    }
}

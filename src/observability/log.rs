use super::traits::{Observer, ObserverEvent, ObserverMetric};
use tracing::info;

/// Log-based observer — uses tracing, zero external deps.
pub struct LogObserver;

impl LogObserver {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LogObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl Observer for LogObserver {
    fn record_event(&self, event: &ObserverEvent) {
        match event {
            ObserverEvent::StreamCreated {
                stream_id,
                session_id,
            } => {
                info!(stream_id = %stream_id, session_id = %session_id, "stream.created");
            }
            ObserverEvent::StreamStarted { stream_id } => {
                info!(stream_id = %stream_id, "stream.started");
            }
            ObserverEvent::StreamCompleted {
                stream_id,
                final_offset,
            } => {
                info!(stream_id = %stream_id, final_offset = final_offset, "stream.completed");
            }
            ObserverEvent::StreamCancelled { stream_id, reason } => {
                info!(stream_id = %stream_id, reason = ?reason, "stream.cancelled");
            }
            ObserverEvent::StreamErrored { stream_id, message } => {
                info!(stream_id = %stream_id, error = %message, "stream.errored");
            }
            ObserverEvent::ClientConnected {
                client_id,
                stream_id,
            } => {
                info!(client_id = %client_id, stream_id = %stream_id, "client.connected");
            }
            ObserverEvent::ClientDisconnected {
                client_id,
                stream_id,
            } => {
                info!(client_id = %client_id, stream_id = %stream_id, "client.disconnected");
            }
            ObserverEvent::ClientStale {
                client_id,
                stream_id,
            } => {
                info!(client_id = %client_id, stream_id = %stream_id, "client.stale");
            }
            ObserverEvent::TaskStarted { task_id } => {
                info!(task_id = %task_id, "task.started");
            }
            ObserverEvent::TaskCompleted { task_id } => {
                info!(task_id = %task_id, "task.completed");
            }
            ObserverEvent::TaskFailed { task_id, message } => {
                info!(task_id = %task_id, error = %message, "task.failed");
            }
            ObserverEvent::AgentStart { provider, model } => {
                info!(provider = %provider, model = %model, "agent.start");
            }
            ObserverEvent::AgentEnd {
                provider,
                model,
                duration,
                tokens_used,
                cost_usd,
            } => {
                let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
                info!(provider = %provider, model = %model, duration_ms = ms, tokens = ?tokens_used, cost_usd = ?cost_usd, "agent.end");
            }
            ObserverEvent::ToolCallStart { tool } => {
                info!(tool = %tool, "tool.start");
            }
            ObserverEvent::ToolCall {
                tool,
                duration,
                success,
            } => {
                let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
                info!(tool = %tool, duration_ms = ms, success = success, "tool.call");
            }
            ObserverEvent::HeartbeatTick => {
                info!("heartbeat.tick");
            }
            ObserverEvent::Error { component, message } => {
                info!(component = %component, error = %message, "error");
            }
            ObserverEvent::LlmRequest {
                provider,
                model,
                messages_count,
            } => {
                info!(
                    provider = %provider,
                    model = %model,
                    messages_count = messages_count,
                    "llm.request"
                );
            }
            ObserverEvent::LlmResponse {
                provider,
                model,
                duration,
                success,
                error_message,
                input_tokens,
                output_tokens,
            } => {
                let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
                info!(
                    provider = %provider,
                    model = %model,
                    duration_ms = ms,
                    success = success,
                    error = ?error_message,
                    input_tokens = ?input_tokens,
                    output_tokens = ?output_tokens,
                    "llm.response"
                );
            }
        }
    }

    fn record_metric(&self, metric: &ObserverMetric) {
        match metric {
            ObserverMetric::RequestLatency(d) => {
                let ms = u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
                info!(latency_ms = ms, "metric.request_latency");
            }
            ObserverMetric::TokensUsed(t) => {
                info!(tokens = t, "metric.tokens_used");
            }
            ObserverMetric::ActiveSessions(s) => {
                info!(sessions = s, "metric.active_sessions");
            }
            ObserverMetric::QueueDepth(d) => {
                info!(depth = d, "metric.queue_depth");
            }
        }
    }

    fn name(&self) -> &str {
        "log"
    }
}

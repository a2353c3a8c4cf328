use super::traits::{Observer, ObserverEvent, ObserverMetric};

/// Human-readable progress observer for interactive CLI sessions.
///
/// Prints compact `>` / `<` progress lines without exposing prompt contents.
/// Intended to be opt-in (e.g. `--verbose`).
pub struct VerboseObserver;

impl VerboseObserver {
    pub fn new() -> Self {
        Self
    }
}

impl Default for VerboseObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl Observer for VerboseObserver {
    fn record_event(&self, event: &ObserverEvent) {
        match event {
            ObserverEvent::StreamCreated { stream_id, .. } => {
                eprintln!("> Stream {stream_id} created");
            }
            ObserverEvent::StreamCompleted {
                stream_id,
                final_offset,
            } => {
                eprintln!("< Stream {stream_id} complete (final_offset={final_offset})");
            }
            ObserverEvent::StreamCancelled { stream_id, reason } => {
                eprintln!(
                    "< Stream {stream_id} cancelled ({})",
                    reason.as_deref().unwrap_or("no reason given")
                );
            }
            ObserverEvent::StreamErrored { stream_id, message } => {
                eprintln!("< Stream {stream_id} errored: {message}");
            }
            ObserverEvent::LlmRequest {
                provider,
                model,
                messages_count,
            } => {
                eprintln!("> Thinking");
                eprintln!(
                    "> Send (provider={provider}, model={model}, messages={messages_count})"
                );
            }
            ObserverEvent::LlmResponse {
                duration, success, ..
            } => {
                let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
                eprintln!("< Receive (success={success}, duration_ms={ms})");
            }
            ObserverEvent::ToolCallStart { tool } => {
                eprintln!("> Tool {tool}");
            }
            ObserverEvent::ToolCall {
                tool,
                duration,
                success,
            } => {
                let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
                eprintln!("< Tool {tool} (success={success}, duration_ms={ms})");
            }
            ObserverEvent::TaskFailed { task_id, message } => {
                eprintln!("< Task {task_id} failed: {message}");
            }
            _ => {}
        }
    }

    #[inline(always)]
    fn record_metric(&self, _metric: &ObserverMetric) {}

    fn name(&self) -> &str {
        "verbose"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn verbose_name() {
        assert_eq!(VerboseObserver::new().name(), "verbose");
    }

    #[test]
    fn verbose_events_do_not_panic() {
        let obs = VerboseObserver::new();
        obs.record_event(&ObserverEvent::StreamCreated {
            stream_id: "s1".into(),
            session_id: "sess".into(),
        });
        obs.record_event(&ObserverEvent::LlmRequest {
            provider: "openrouter".into(),
            model: "claude".into(),
            messages_count: 3,
        });
        obs.record_event(&ObserverEvent::LlmResponse {
            provider: "openrouter".into(),
            model: "claude".into(),
            duration: Duration::from_millis(12),
            success: true,
            error_message: None,
            input_tokens: None,
            output_tokens: None,
        });
        obs.record_event(&ObserverEvent::ToolCallStart {
            tool: "calculator".into(),
        });
        obs.record_event(&ObserverEvent::ToolCall {
            tool: "calculator".into(),
            duration: Duration::from_millis(2),
            success: true,
        });
        obs.record_event(&ObserverEvent::TaskFailed {
            task_id: "t1".into(),
            message: "boom".into(),
        });
    }
}

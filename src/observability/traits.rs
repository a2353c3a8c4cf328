use std::time::Duration;

/// Discrete events emitted by the Streaming Core and Agent Adapter for
/// observability.
///
/// Each variant represents a lifecycle event that observers can record,
/// aggregate, or forward to external monitoring systems. Events carry just
/// enough context for tracing and diagnostics without exposing sensitive
/// prompt or response content.
#[derive(Debug, Clone)]
pub enum ObserverEvent {
    /// A stream was created and registered with Stream State.
    StreamCreated { stream_id: String, session_id: String },
    /// A stream transitioned from `Pending` to `Running`.
    StreamStarted { stream_id: String },
    /// A stream reached the `Completed` terminal state.
    StreamCompleted {
        stream_id: String,
        final_offset: u64,
    },
    /// A stream reached the `Cancelled` terminal state.
    StreamCancelled {
        stream_id: String,
        reason: Option<String>,
    },
    /// A stream reached the `Error` terminal state.
    StreamErrored { stream_id: String, message: String },
    /// A client registered with the Emitter and Stream State.
    ClientConnected {
        client_id: String,
        stream_id: String,
    },
    /// A client was unregistered, cooperatively or by reaping.
    ClientDisconnected {
        client_id: String,
        stream_id: String,
    },
    /// A client's queue was found full during a heartbeat or stale sweep.
    ClientStale {
        client_id: String,
        stream_id: String,
    },
    /// A task was dequeued and handed to a `TaskExecutor`.
    TaskStarted { task_id: String },
    /// A task's agent run completed and its output was persisted.
    TaskCompleted { task_id: String },
    /// A task exhausted its retry budget and moved to `Failed`.
    TaskFailed { task_id: String, message: String },
    /// The agent loop has started a new run.
    AgentStart { provider: String, model: String },
    /// A request is about to be sent to an LLM provider.
    ///
    /// Emitted immediately before a provider call so observers can print
    /// user-facing progress without leaking prompt contents.
    LlmRequest {
        provider: String,
        model: String,
        messages_count: usize,
    },
    /// Result of a single LLM provider call.
    LlmResponse {
        provider: String,
        model: String,
        duration: Duration,
        success: bool,
        error_message: Option<String>,
        input_tokens: Option<u64>,
        output_tokens: Option<u64>,
    },
    /// The agent run has finished (content response with no further tool calls).
    AgentEnd {
        provider: String,
        model: String,
        duration: Duration,
        tokens_used: Option<u64>,
        cost_usd: Option<f64>,
    },
    /// A tool call is about to be executed.
    ToolCallStart { tool: String },
    /// A tool call has completed with a success/failure outcome.
    ToolCall {
        tool: String,
        duration: Duration,
        success: bool,
    },
    /// Periodic heartbeat tick sent to a connected client.
    HeartbeatTick,
    /// An error occurred in a named component.
    Error {
        /// Subsystem where the error originated (e.g. `"core"`, `"gateway"`).
        component: String,
        /// Human-readable error description. Must not contain secrets or tokens.
        message: String,
    },
}

/// Numeric metrics emitted by the Streaming Core and Agent Adapter.
///
/// Observers can aggregate these into dashboards, alerts, or structured logs.
/// Each variant carries a single scalar value with implicit units.
#[derive(Debug, Clone)]
pub enum ObserverMetric {
    /// Time elapsed for a single LLM or tool request.
    RequestLatency(Duration),
    /// Number of tokens consumed by an LLM call.
    TokensUsed(u64),
    /// Current number of active (non-terminal) streams.
    ActiveSessions(u64),
    /// Current depth of the task queue.
    QueueDepth(u64),
}

/// Core observability trait for recording runtime telemetry.
///
/// Implement this trait to integrate with any monitoring backend (structured
/// logging, Prometheus, etc.). The Streaming Core and Agent Adapter hold one
/// or more `Observer` instances and call
/// [`record_event`](Observer::record_event) and
/// [`record_metric`](Observer::record_metric) at key lifecycle points.
///
/// Implementations must be `Send + Sync + 'static` because the observer is
/// shared across async tasks via `Arc`.
pub trait Observer: Send + Sync + 'static {
    /// Record a discrete lifecycle event.
    ///
    /// Called synchronously on the hot path; implementations should avoid
    /// blocking I/O.
    fn record_event(&self, event: &ObserverEvent);

    /// Record a numeric metric sample.
    fn record_metric(&self, metric: &ObserverMetric);

    /// Flush any buffered telemetry data to the backend.
    ///
    /// The runtime calls this during graceful shutdown. The default
    /// implementation is a no-op, appropriate for backends that write
    /// synchronously.
    fn flush(&self) {}

    /// Return the human-readable name of this observer backend.
    fn name(&self) -> &str;

    /// Downcast to `Any` for backend-specific operations.
    fn as_any(&self) -> &dyn std::any::Any
    where
        Self: Sized,
    {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct DummyObserver {
        events: Mutex<u64>,
        metrics: Mutex<u64>,
    }

    impl Observer for DummyObserver {
        fn record_event(&self, _event: &ObserverEvent) {
            let mut guard = self.events.lock();
            *guard += 1;
        }

        fn record_metric(&self, _metric: &ObserverMetric) {
            let mut guard = self.metrics.lock();
            *guard += 1;
        }

        fn name(&self) -> &str {
            "dummy-observer"
        }
    }

    #[test]
    fn observer_records_events_and_metrics() {
        let observer = DummyObserver::default();

        observer.record_event(&ObserverEvent::HeartbeatTick);
        observer.record_event(&ObserverEvent::Error {
            component: "test".into(),
            message: "boom".into(),
        });
        observer.record_metric(&ObserverMetric::TokensUsed(42));

        assert_eq!(*observer.events.lock(), 2);
        assert_eq!(*observer.metrics.lock(), 1);
    }

    #[test]
    fn observer_default_flush_and_as_any_work() {
        let observer = DummyObserver::default();

        observer.flush();
        assert_eq!(observer.name(), "dummy-observer");
        assert!(observer.as_any().downcast_ref::<DummyObserver>().is_some());
    }

    #[test]
    fn observer_event_and_metric_are_cloneable() {
        let event = ObserverEvent::ToolCall {
            tool: "shell".into(),
            duration: Duration::from_millis(10),
            success: true,
        };
        let metric = ObserverMetric::RequestLatency(Duration::from_millis(8));

        let cloned_event = event.clone();
        let cloned_metric = metric.clone();

        assert!(matches!(cloned_event, ObserverEvent::ToolCall { .. }));
        assert!(matches!(cloned_metric, ObserverMetric::RequestLatency(_)));
    }
}

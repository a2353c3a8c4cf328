use super::traits::{Observer, ObserverEvent, ObserverMetric};
use prometheus::{
    Encoder, GaugeVec, Histogram, HistogramOpts, HistogramVec, IntCounterVec, Registry, TextEncoder,
};

/// Prometheus-backed observer — exposes metrics for scraping via `/metrics`.
pub struct PrometheusObserver {
    registry: Registry,

    // Counters
    streams_created: IntCounterVec,
    streams_terminated: IntCounterVec,
    clients_connected: prometheus::IntCounter,
    clients_disconnected: prometheus::IntCounter,
    clients_stale: prometheus::IntCounter,
    tasks_started: prometheus::IntCounter,
    tasks_completed: prometheus::IntCounter,
    tasks_failed: prometheus::IntCounter,
    agent_starts: IntCounterVec,
    llm_requests: IntCounterVec,
    tokens_input_total: IntCounterVec,
    tokens_output_total: IntCounterVec,
    tool_calls: IntCounterVec,
    heartbeat_ticks: prometheus::IntCounter,
    errors: IntCounterVec,

    // Histograms
    agent_duration: HistogramVec,
    tool_duration: HistogramVec,
    request_latency: Histogram,

    // Gauges
    tokens_used: prometheus::IntGauge,
    active_streams: GaugeVec,
    queue_depth: GaugeVec,
}

impl PrometheusObserver {
    pub fn new() -> Self {
        let registry = Registry::new();

        let streams_created = IntCounterVec::new(
            prometheus::Opts::new("streamcore_streams_created_total", "Total streams created"),
            &["session_id"],
        )
        .expect("valid metric");

        let streams_terminated = IntCounterVec::new(
            prometheus::Opts::new(
                "streamcore_streams_terminated_total",
                "Total streams reaching a terminal state",
            ),
            &["status"],
        )
        .expect("valid metric");

        let clients_connected = prometheus::IntCounter::new(
            "streamcore_clients_connected_total",
            "Total client connections registered",
        )
        .expect("valid metric");

        let clients_disconnected = prometheus::IntCounter::new(
            "streamcore_clients_disconnected_total",
            "Total client connections unregistered",
        )
        .expect("valid metric");

        let clients_stale = prometheus::IntCounter::new(
            "streamcore_clients_stale_total",
            "Total clients reaped for staleness or a full queue",
        )
        .expect("valid metric");

        let tasks_started = prometheus::IntCounter::new(
            "streamcore_tasks_started_total",
            "Total tasks dequeued and started",
        )
        .expect("valid metric");

        let tasks_completed = prometheus::IntCounter::new(
            "streamcore_tasks_completed_total",
            "Total tasks completed successfully",
        )
        .expect("valid metric");

        let tasks_failed = prometheus::IntCounter::new(
            "streamcore_tasks_failed_total",
            "Total tasks that exhausted their retry budget",
        )
        .expect("valid metric");

        let agent_starts = IntCounterVec::new(
            prometheus::Opts::new("streamcore_agent_starts_total", "Total agent run invocations"),
            &["provider", "model"],
        )
        .expect("valid metric");

        let llm_requests = IntCounterVec::new(
            prometheus::Opts::new("streamcore_llm_requests_total", "Total LLM provider requests"),
            &["provider", "model", "success"],
        )
        .expect("valid metric");

        let tokens_input_total = IntCounterVec::new(
            prometheus::Opts::new("streamcore_tokens_input_total", "Total input tokens consumed"),
            &["provider", "model"],
        )
        .expect("valid metric");

        let tokens_output_total = IntCounterVec::new(
            prometheus::Opts::new(
                "streamcore_tokens_output_total",
                "Total output tokens consumed",
            ),
            &["provider", "model"],
        )
        .expect("valid metric");

        let tool_calls = IntCounterVec::new(
            prometheus::Opts::new("streamcore_tool_calls_total", "Total tool calls"),
            &["tool", "success"],
        )
        .expect("valid metric");

        let heartbeat_ticks = prometheus::IntCounter::new(
            "streamcore_heartbeat_ticks_total",
            "Total heartbeat ticks sent",
        )
        .expect("valid metric");

        let errors = IntCounterVec::new(
            prometheus::Opts::new("streamcore_errors_total", "Total errors by component"),
            &["component"],
        )
        .expect("valid metric");

        let agent_duration = HistogramVec::new(
            HistogramOpts::new(
                "streamcore_agent_duration_seconds",
                "Agent run duration in seconds",
            )
            .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
            &["provider", "model"],
        )
        .expect("valid metric");

        let tool_duration = HistogramVec::new(
            HistogramOpts::new(
                "streamcore_tool_duration_seconds",
                "Tool execution duration in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]),
            &["tool"],
        )
        .expect("valid metric");

        let request_latency = Histogram::with_opts(
            HistogramOpts::new(
                "streamcore_request_latency_seconds",
                "Request latency in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )
        .expect("valid metric");

        let tokens_used = prometheus::IntGauge::new(
            "streamcore_tokens_used_last",
            "Tokens used in the last LLM response",
        )
        .expect("valid metric");

        let active_streams = GaugeVec::new(
            prometheus::Opts::new("streamcore_active_streams", "Number of non-terminal streams"),
            &[],
        )
        .expect("valid metric");

        let queue_depth = GaugeVec::new(
            prometheus::Opts::new("streamcore_queue_depth", "Task queue depth"),
            &[],
        )
        .expect("valid metric");

        registry.register(Box::new(streams_created.clone())).ok();
        registry
            .register(Box::new(streams_terminated.clone()))
            .ok();
        registry
            .register(Box::new(clients_connected.clone()))
            .ok();
        registry
            .register(Box::new(clients_disconnected.clone()))
            .ok();
        registry.register(Box::new(clients_stale.clone())).ok();
        registry.register(Box::new(tasks_started.clone())).ok();
        registry.register(Box::new(tasks_completed.clone())).ok();
        registry.register(Box::new(tasks_failed.clone())).ok();
        registry.register(Box::new(agent_starts.clone())).ok();
        registry.register(Box::new(llm_requests.clone())).ok();
        registry.register(Box::new(tokens_input_total.clone())).ok();
        registry
            .register(Box::new(tokens_output_total.clone()))
            .ok();
        registry.register(Box::new(tool_calls.clone())).ok();
        registry.register(Box::new(heartbeat_ticks.clone())).ok();
        registry.register(Box::new(errors.clone())).ok();
        registry.register(Box::new(agent_duration.clone())).ok();
        registry.register(Box::new(tool_duration.clone())).ok();
        registry.register(Box::new(request_latency.clone())).ok();
        registry.register(Box::new(tokens_used.clone())).ok();
        registry.register(Box::new(active_streams.clone())).ok();
        registry.register(Box::new(queue_depth.clone())).ok();

        Self {
            registry,
            streams_created,
            streams_terminated,
            clients_connected,
            clients_disconnected,
            clients_stale,
            tasks_started,
            tasks_completed,
            tasks_failed,
            agent_starts,
            llm_requests,
            tokens_input_total,
            tokens_output_total,
            tool_calls,
            heartbeat_ticks,
            errors,
            agent_duration,
            tool_duration,
            request_latency,
            tokens_used,
            active_streams,
            queue_depth,
        }
    }

    /// Encode all registered metrics into Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&families, &mut buf).unwrap_or_default();
        String::from_utf8(buf).unwrap_or_default()
    }
}

impl Default for PrometheusObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl Observer for PrometheusObserver {
    fn record_event(&self, event: &ObserverEvent) {
        match event {
            ObserverEvent::StreamCreated { session_id, .. } => {
                self.streams_created
                    .with_label_values(&[session_id.as_str()])
                    .inc();
            }
            ObserverEvent::StreamStarted { .. } => {}
            ObserverEvent::StreamCompleted { .. } => {
                self.streams_terminated
                    .with_label_values(&["completed"])
                    .inc();
            }
            ObserverEvent::StreamCancelled { .. } => {
                self.streams_terminated
                    .with_label_values(&["cancelled"])
                    .inc();
            }
            ObserverEvent::StreamErrored { .. } => {
                self.streams_terminated
                    .with_label_values(&["error"])
                    .inc();
            }
            ObserverEvent::ClientConnected { .. } => {
                self.clients_connected.inc();
            }
            ObserverEvent::ClientDisconnected { .. } => {
                self.clients_disconnected.inc();
            }
            ObserverEvent::ClientStale { .. } => {
                self.clients_stale.inc();
            }
            ObserverEvent::TaskStarted { .. } => {
                self.tasks_started.inc();
            }
            ObserverEvent::TaskCompleted { .. } => {
                self.tasks_completed.inc();
            }
            ObserverEvent::TaskFailed { .. } => {
                self.tasks_failed.inc();
            }
            ObserverEvent::AgentStart { provider, model } => {
                self.agent_starts
                    .with_label_values(&[provider, model])
                    .inc();
            }
            ObserverEvent::AgentEnd {
                provider,
                model,
                duration,
                tokens_used,
                cost_usd: _,
            } => {
                self.agent_duration
                    .with_label_values(&[provider, model])
                    .observe(duration.as_secs_f64());
                if let Some(t) = tokens_used {
                    self.tokens_used.set(i64::try_from(*t).unwrap_or(i64::MAX));
                }
            }
            ObserverEvent::LlmResponse {
                provider,
                model,
                success,
                input_tokens,
                output_tokens,
                ..
            } => {
                let success_str = if *success { "true" } else { "false" };
                self.llm_requests
                    .with_label_values(&[provider.as_str(), model.as_str(), success_str])
                    .inc();
                if let Some(input) = input_tokens {
                    self.tokens_input_total
                        .with_label_values(&[provider.as_str(), model.as_str()])
                        .inc_by(*input);
                }
                if let Some(output) = output_tokens {
                    self.tokens_output_total
                        .with_label_values(&[provider.as_str(), model.as_str()])
                        .inc_by(*output);
                }
            }
            ObserverEvent::ToolCallStart { .. } | ObserverEvent::LlmRequest { .. } => {}
            ObserverEvent::ToolCall {
                tool,
                duration,
                success,
            } => {
                let success_str = if *success { "true" } else { "false" };
                self.tool_calls
                    .with_label_values(&[tool.as_str(), success_str])
                    .inc();
                self.tool_duration
                    .with_label_values(&[tool.as_str()])
                    .observe(duration.as_secs_f64());
            }
            ObserverEvent::HeartbeatTick => {
                self.heartbeat_ticks.inc();
            }
            ObserverEvent::Error {
                component,
                message: _,
            } => {
                self.errors.with_label_values(&[component]).inc();
            }
        }
    }

    fn record_metric(&self, metric: &ObserverMetric) {
        match metric {
            ObserverMetric::RequestLatency(d) => {
                self.request_latency.observe(d.as_secs_f64());
            }
            ObserverMetric::TokensUsed(t) => {
                self.tokens_used.set(i64::try_from(*t).unwrap_or(i64::MAX));
            }
            ObserverMetric::ActiveSessions(s) => {
                self.active_streams
                    .with_label_values(&[] as &[&str])
                    .set(*s as f64);
            }
            ObserverMetric::QueueDepth(d) => {
                self.queue_depth
                    .with_label_values(&[] as &[&str])
                    .set(*d as f64);
            }
        }
    }

    fn name(&self) -> &str {
        "prometheus"
    }
}

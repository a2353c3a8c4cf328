//! Task Queue: a single-process FIFO of task IDs and the executor that runs
//! each one through the Streaming Core and Agent Adapter.
//!
//! External persistence and bot configuration are modeled as trait seams —
//! [`TaskStore`], [`MessageStore`], [`BotRegistry`] — observed through the
//! existing [`Observer`] rather than a separate broadcaster.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agent::adapter::{AdapterConfig, AgentAdapter};
use crate::config::TaskQueueConfig;
use crate::core::StreamingCore;
use crate::emitter::SseMessage;
use crate::error::{StreamError, StreamResult};
use crate::events::EventPayload;
use crate::observability::{Observer, ObserverEvent};
use crate::providers::{ChatMessage, Provider};
use crate::tools::Tool;

/// Status of a queued task. Terminal states (`Completed`, `Failed`,
/// `Cancelled`) are frozen once reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// A unit of work submitted to the queue.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub input: String,
    /// `spec.bot_name`, the first link in the bot-resolution fallback chain.
    pub bot_name: Option<String>,
    /// `spec.botRef.name`, the second link in the fallback chain.
    pub bot_ref_name: Option<String>,
    pub status: TaskStatus,
    pub output: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(id: impl Into<String>, input: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            input: input.into(),
            bot_name: None,
            bot_ref_name: None,
            status: TaskStatus::Pending,
            output: None,
            error: None,
            created_at,
            started_at: None,
            completed_at: None,
        }
    }
}

/// Resolve the bot name for a task: `bot_name` field, then `botRef.name`,
/// then `"default"`.
pub fn extract_bot_name(task: &Task) -> String {
    task.bot_name
        .clone()
        .or_else(|| task.bot_ref_name.clone())
        .unwrap_or_else(|| "default".to_string())
}

/// External task storage: fetch, create, and transition tasks.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create(
        &self,
        input: String,
        bot_name: Option<String>,
        bot_ref_name: Option<String>,
        now: DateTime<Utc>,
    ) -> StreamResult<Task>;
    async fn get(&self, task_id: &str) -> StreamResult<Task>;
    async fn start(&self, task_id: &str, now: DateTime<Utc>) -> StreamResult<Task>;
    async fn complete(&self, task_id: &str, output: String, now: DateTime<Utc>) -> StreamResult<Task>;
    async fn fail(&self, task_id: &str, error: String, now: DateTime<Utc>) -> StreamResult<Task>;
}

/// External message persistence for a task's conversation thread.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create_user_message(&self, task_id: &str, content: &str);
    async fn create_assistant_message(&self, task_id: &str, content: &str);
}

/// Everything the executor needs to run an agent turn for a given bot name.
pub struct BotSpec {
    pub provider: Arc<dyn Provider>,
    pub provider_name: String,
    pub model: String,
    pub temperature: f64,
    pub system_prompt: Option<String>,
    pub max_iterations: u32,
    pub tools: Vec<Arc<dyn Tool>>,
}

/// External bot configuration lookup and validation.
#[async_trait]
pub trait BotRegistry: Send + Sync {
    async fn resolve(&self, bot_name: &str) -> StreamResult<BotSpec>;
}

/// A `MessageStore` that discards everything, for running without a
/// persistence layer wired in.
pub struct NoopMessageStore;

#[async_trait]
impl MessageStore for NoopMessageStore {
    async fn create_user_message(&self, _task_id: &str, _content: &str) {}
    async fn create_assistant_message(&self, _task_id: &str, _content: &str) {}
}

/// A `BotRegistry` that resolves nothing, for running the gateway before any
/// real provider/tool wiring is plugged in. Every task fails fast with
/// [`StreamError::BotConfiguration`] instead of hanging.
pub struct UnconfiguredBotRegistry;

#[async_trait]
impl BotRegistry for UnconfiguredBotRegistry {
    async fn resolve(&self, bot_name: &str) -> StreamResult<BotSpec> {
        Err(StreamError::BotConfiguration(format!(
            "no bot registry configured; cannot resolve bot '{bot_name}'"
        )))
    }
}

/// In-memory `TaskStore` reference implementation, useful for tests and for
/// running the queue without an external database wired in.
pub struct InMemoryTaskStore {
    tasks: Mutex<std::collections::HashMap<String, Task>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tasks: Mutex::new(std::collections::HashMap::new()),
        })
    }

    pub fn insert(&self, task: Task) {
        self.tasks.lock().insert(task.id.clone(), task);
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create(
        &self,
        input: String,
        bot_name: Option<String>,
        bot_ref_name: Option<String>,
        now: DateTime<Utc>,
    ) -> StreamResult<Task> {
        let mut task = Task::new(uuid::Uuid::new_v4().to_string(), input, now);
        task.bot_name = bot_name;
        task.bot_ref_name = bot_ref_name;
        self.tasks.lock().insert(task.id.clone(), task.clone());
        Ok(task)
    }

    async fn get(&self, task_id: &str) -> StreamResult<Task> {
        self.tasks
            .lock()
            .get(task_id)
            .cloned()
            .ok_or_else(|| StreamError::TaskNotFound(task_id.to_string()))
    }

    async fn start(&self, task_id: &str, now: DateTime<Utc>) -> StreamResult<Task> {
        let mut tasks = self.tasks.lock();
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| StreamError::TaskNotFound(task_id.to_string()))?;
        task.status = TaskStatus::Running;
        task.started_at = Some(now);
        Ok(task.clone())
    }

    async fn complete(&self, task_id: &str, output: String, now: DateTime<Utc>) -> StreamResult<Task> {
        let mut tasks = self.tasks.lock();
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| StreamError::TaskNotFound(task_id.to_string()))?;
        task.status = TaskStatus::Completed;
        task.output = Some(output);
        task.completed_at = Some(now);
        Ok(task.clone())
    }

    async fn fail(&self, task_id: &str, error: String, now: DateTime<Utc>) -> StreamResult<Task> {
        let mut tasks = self.tasks.lock();
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| StreamError::TaskNotFound(task_id.to_string()))?;
        task.status = TaskStatus::Failed;
        task.error = Some(error);
        task.completed_at = Some(now);
        Ok(task.clone())
    }
}

/// Executes one task end-to-end: bot resolution, retrying stream runs, and
/// persisting the outcome.
pub struct TaskExecutor {
    task_store: Arc<dyn TaskStore>,
    message_store: Arc<dyn MessageStore>,
    bot_registry: Arc<dyn BotRegistry>,
    core: Arc<StreamingCore>,
    observer: Arc<dyn Observer>,
    config: TaskQueueConfig,
}

impl TaskExecutor {
    pub fn new(
        task_store: Arc<dyn TaskStore>,
        message_store: Arc<dyn MessageStore>,
        bot_registry: Arc<dyn BotRegistry>,
        core: Arc<StreamingCore>,
        observer: Arc<dyn Observer>,
        config: TaskQueueConfig,
    ) -> Self {
        Self {
            task_store,
            message_store,
            bot_registry,
            core,
            observer,
            config,
        }
    }

    pub async fn execute_task(&self, task_id: &str) -> StreamResult<Task> {
        let task = self.task_store.get(task_id).await?;

        let now = Utc::now();
        self.task_store.start(task_id, now).await?;
        self.observer.record_event(&ObserverEvent::TaskStarted {
            task_id: task_id.to_string(),
        });

        let bot_name = extract_bot_name(&task);
        let bot_spec = match self.bot_registry.resolve(&bot_name).await {
            Ok(spec) => spec,
            Err(e) => {
                let message = StreamError::BotConfiguration(e.to_string()).to_string();
                let now = Utc::now();
                let failed = self.task_store.fail(task_id, message.clone(), now).await?;
                self.observer.record_event(&ObserverEvent::TaskFailed {
                    task_id: task_id.to_string(),
                    message,
                });
                return Ok(failed);
            }
        };

        let max_retries = self.config.max_retries.max(1);
        let mut last_error = None;

        for attempt in 0..max_retries {
            match self.run_once(task_id, &task, &bot_spec).await {
                Ok(output) => {
                    let now = Utc::now();
                    let completed = self.task_store.complete(task_id, output, now).await?;
                    self.observer.record_event(&ObserverEvent::TaskCompleted {
                        task_id: task_id.to_string(),
                    });
                    return Ok(completed);
                }
                Err(e) => {
                    tracing::warn!(task_id, attempt, error = %e, "task execution attempt failed");
                    last_error = Some(e);
                    if attempt + 1 < max_retries {
                        let backoff = self.config.retry_delay_secs * f64::from(attempt + 1);
                        tokio::time::sleep(std::time::Duration::from_secs_f64(backoff)).await;
                    }
                }
            }
        }

        let message = format!(
            "task execution failed after {max_retries} attempts: {}",
            last_error.map(|e| e.to_string()).unwrap_or_default()
        );
        let now = Utc::now();
        let failed = self.task_store.fail(task_id, message.clone(), now).await?;
        self.observer.record_event(&ObserverEvent::TaskFailed {
            task_id: task_id.to_string(),
            message,
        });
        Ok(failed)
    }

    async fn run_once(
        &self,
        task_id: &str,
        task: &Task,
        bot_spec: &BotSpec,
    ) -> anyhow::Result<String> {
        if !task.input.is_empty() {
            self.message_store
                .create_user_message(task_id, &task.input)
                .await;
        }

        let stream_id = format!("task-{task_id}-{}", uuid::Uuid::new_v4());
        let session_id = task_id.to_string();
        self.core.create_stream(&stream_id, &session_id, None, None)?;

        let adapter = AgentAdapter::new(
            bot_spec.provider.clone(),
            bot_spec.tools.clone(),
            self.observer.clone(),
            AdapterConfig {
                provider_name: bot_spec.provider_name.clone(),
                model: bot_spec.model.clone(),
                temperature: bot_spec.temperature,
                system_prompt: bot_spec.system_prompt.clone(),
                max_iterations: bot_spec.max_iterations,
                ..Default::default()
            },
        );

        let messages = if task.input.is_empty() {
            Vec::new()
        } else {
            vec![ChatMessage::user(&task.input)]
        };
        let events = adapter.stream(Vec::new(), messages);

        self.core.start_stream(&stream_id, events).await?;

        let mut client = self.core.connect_client(&stream_id, None, None).await?;

        let mut content = String::new();
        let mut tool_error = None;

        while let Some(msg) = client.receiver.recv().await {
            let SseMessage::Event(event) = msg else {
                continue;
            };
            match event.payload {
                EventPayload::Chunk { text, .. } => content.push_str(&text),
                EventPayload::Error { message, .. } => {
                    tool_error = Some(message);
                }
                EventPayload::Complete { .. } => break,
                EventPayload::Cancelled { reason, .. } => {
                    tool_error = Some(reason.unwrap_or_else(|| "stream cancelled".to_string()));
                    break;
                }
                _ => {}
            }
        }

        self.core.disconnect_client(&client.client_id, &stream_id);

        if let Some(err) = tool_error {
            anyhow::bail!(err);
        }

        if !content.is_empty() {
            self.message_store
                .create_assistant_message(task_id, &content)
                .await;
        }

        Ok(content)
    }
}

/// Single-process FIFO of task IDs plus the worker that drains it.
///
/// `enqueue` is non-blocking; `start` spawns one worker loop that polls with
/// a timeout, skips IDs already in flight, and hands everything else to a
/// [`TaskExecutor`].
pub struct TaskQueue {
    executor: Arc<TaskExecutor>,
    sender: mpsc::UnboundedSender<String>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    running: Arc<Mutex<HashSet<String>>>,
    shutdown: CancellationToken,
    worker_handle: Mutex<Option<JoinHandle<()>>>,
    poll_timeout_secs: u64,
}

impl TaskQueue {
    pub fn new(executor: Arc<TaskExecutor>, poll_timeout_secs: u64) -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        Arc::new(Self {
            executor,
            sender,
            receiver: Mutex::new(Some(receiver)),
            running: Arc::new(Mutex::new(HashSet::new())),
            shutdown: CancellationToken::new(),
            worker_handle: Mutex::new(None),
            poll_timeout_secs,
        })
    }

    pub fn enqueue(&self, task_id: impl Into<String>) {
        let _ = self.sender.send(task_id.into());
    }

    pub fn is_running(&self, task_id: &str) -> bool {
        self.running.lock().contains(task_id)
    }

    pub fn running_count(&self) -> usize {
        self.running.lock().len()
    }

    pub fn start(self: &Arc<Self>) {
        let Some(mut receiver) = self.receiver.lock().take() else {
            return;
        };
        let queue = self.clone();
        let handle = tokio::spawn(async move {
            let timeout = std::time::Duration::from_secs(queue.poll_timeout_secs.max(1));
            loop {
                let next = tokio::select! {
                    () = queue.shutdown.cancelled() => break,
                    item = tokio::time::timeout(timeout, receiver.recv()) => item,
                };

                let Ok(Some(task_id)) = next else {
                    continue;
                };

                if queue.running.lock().contains(&task_id) {
                    tracing::warn!(task_id, "task already running, skipping");
                    continue;
                }

                queue.running.lock().insert(task_id.clone());
                let executor = queue.executor.clone();
                let running = queue.running.clone();
                let id = task_id.clone();
                tokio::spawn(async move {
                    if let Err(e) = executor.execute_task(&id).await {
                        tracing::error!(task_id = %id, error = %e, "task execution failed");
                    }
                    running.lock().remove(&id);
                });
            }
        });
        *self.worker_handle.lock() = Some(handle);
    }

    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handle = self.worker_handle.lock().take();
        if let Some(handle) = handle {
            let _ = tokio::time::timeout(std::time::Duration::from_secs(5), handle).await;
        }
    }
}

#![warn(clippy::all)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    dead_code
)]

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use streamcore::config::Config;
use streamcore::core::StreamingCore;
use streamcore::gateway::{self, AppState};
use streamcore::observability::{create_observer, Observer, PrometheusObserver};
use streamcore::queue::{
    InMemoryTaskStore, NoopMessageStore, TaskExecutor, TaskQueue, TaskStore, UnconfiguredBotRegistry,
};

#[derive(Parser, Debug)]
#[command(name = "streamcore")]
#[command(about = "Streaming substrate for agent execution: stream routing, buffering, and SSE fan-out.")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the gateway and task queue (default).
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
}

fn init_logging() {
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
}

fn build_observer(config: &Config) -> (Arc<dyn Observer>, Option<Arc<PrometheusObserver>>) {
    if config.observability.backend == "prometheus" {
        // Built directly (not via `create_observer`) so `/metrics` can call
        // `PrometheusObserver::encode` without downcasting a trait object.
        let observer = Arc::new(PrometheusObserver::new());
        (observer.clone(), Some(observer))
    } else {
        (Arc::from(create_observer(&config.observability)), None)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let (host, port) = match cli.command {
        Some(Commands::Serve { host, port }) => (host, port),
        None => (None, None),
    };

    let mut config = Config::load_or_init()?;
    if let Some(host) = host {
        config.gateway.host = host;
    }
    if let Some(port) = port {
        config.gateway.port = port;
    }

    let core = StreamingCore::new(config.stream.clone());
    core.start();

    let (observer, prometheus) = build_observer(&config);

    let task_store: Arc<dyn TaskStore> = InMemoryTaskStore::new();
    let message_store = Arc::new(NoopMessageStore);
    let bot_registry = Arc::new(UnconfiguredBotRegistry);

    let executor = Arc::new(TaskExecutor::new(
        task_store.clone(),
        message_store,
        bot_registry,
        core.clone(),
        observer.clone(),
        config.task_queue.clone(),
    ));
    let queue = TaskQueue::new(executor, config.task_queue.worker_poll_timeout_secs);
    queue.start();

    let state = AppState {
        core: core.clone(),
        queue,
        task_store,
        observer,
        prometheus,
    };

    let host = config.gateway.host.clone();
    let port = config.gateway.port;
    let result = gateway::run_gateway(&host, port, &config.gateway, state).await;

    core.stop().await;
    result
}

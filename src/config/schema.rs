use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

// ── Top-level config ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to config.toml - computed from home, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,

    #[serde(default)]
    pub task_queue: TaskQueueConfig,

    #[serde(default)]
    pub agent: AgentConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_path: PathBuf::new(),
            stream: StreamConfig::default(),
            gateway: GatewayConfig::default(),
            observability: ObservabilityConfig::default(),
            task_queue: TaskQueueConfig::default(),
            agent: AgentConfig::default(),
        }
    }
}

// ── Streaming Core ────────────────────────────────────────────────

/// Per-stream tuning knobs, mirrored onto every `StreamContext` at creation
/// time. See `streaming::core::StreamConfig` for the runtime copy of these
/// values (this struct is the serializable default; callers may override
/// individual streams without touching the on-disk config).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_buffer_age_seconds")]
    pub buffer_age_seconds: u64,
    #[serde(default = "default_true")]
    pub enable_recovery: bool,
    #[serde(default = "default_true")]
    pub emit_checkpoints: bool,
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_max_concurrent_clients")]
    pub max_concurrent_clients: usize,
    #[serde(default = "default_client_queue_size")]
    pub client_queue_size: usize,
    #[serde(default = "default_stale_client_timeout_secs")]
    pub stale_client_timeout_secs: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

fn default_buffer_size() -> usize {
    10_000
}
fn default_buffer_age_seconds() -> u64 {
    3_600
}
fn default_checkpoint_interval() -> u64 {
    100
}
fn default_heartbeat_interval_secs() -> u64 {
    30
}
fn default_max_concurrent_clients() -> usize {
    100
}
fn default_client_queue_size() -> usize {
    1_000
}
fn default_stale_client_timeout_secs() -> u64 {
    60
}
fn default_cleanup_interval_secs() -> u64 {
    60
}
fn default_true() -> bool {
    true
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            buffer_age_seconds: default_buffer_age_seconds(),
            enable_recovery: true,
            emit_checkpoints: true,
            checkpoint_interval: default_checkpoint_interval(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            max_concurrent_clients: default_max_concurrent_clients(),
            client_queue_size: default_client_queue_size(),
            stale_client_timeout_secs: default_stale_client_timeout_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

// ── Gateway (SSE / HTTP surface) ──────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    #[serde(default = "default_gateway_host")]
    pub host: String,
    #[serde(default = "default_request_body_limit_bytes")]
    pub request_body_limit_bytes: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_gateway_port() -> u16 {
    8080
}

fn default_gateway_host() -> String {
    "127.0.0.1".into()
}

fn default_request_body_limit_bytes() -> usize {
    1024 * 1024
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            host: default_gateway_host(),
            request_body_limit_bytes: default_request_body_limit_bytes(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

// ── Observability ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// "none" | "log" | "prometheus"
    #[serde(default = "default_observability_backend")]
    pub backend: String,
}

fn default_observability_backend() -> String {
    "log".into()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            backend: default_observability_backend(),
        }
    }
}

// ── Task Queue ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskQueueConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: f64,
    #[serde(default = "default_worker_poll_timeout_secs")]
    pub worker_poll_timeout_secs: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_secs() -> f64 {
    1.0
}

fn default_worker_poll_timeout_secs() -> u64 {
    1
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay_secs(),
            worker_poll_timeout_secs: default_worker_poll_timeout_secs(),
        }
    }
}

// ── Agent Adapter ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default)]
    pub compress_context: bool,
    #[serde(default = "default_compression_token_threshold")]
    pub compression_token_threshold: usize,
    #[serde(default = "default_compression_keep_recent")]
    pub compression_keep_recent: usize,
}

fn default_max_iterations() -> u32 {
    10
}

fn default_compression_token_threshold() -> usize {
    8_000
}

fn default_compression_keep_recent() -> usize {
    6
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            compress_context: false,
            compression_token_threshold: default_compression_token_threshold(),
            compression_keep_recent: default_compression_keep_recent(),
        }
    }
}

// ── Load / save ────────────────────────────────────────────────────

fn default_config_dir() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("dev", "streamcore", "streamcore")
        .context("Failed to resolve config directory")?;
    Ok(dirs.config_dir().to_path_buf())
}

impl Config {
    pub fn load_or_init() -> Result<Self> {
        let config_dir = default_config_dir()?;
        let config_path = config_dir.join("config.toml");

        fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        let mut config = if config_path.exists() {
            let contents =
                fs::read_to_string(&config_path).context("Failed to read config file")?;
            toml::from_str(&contents).context("Failed to parse config file")?
        } else {
            let config = Config::default();
            let toml_str =
                toml::to_string_pretty(&config).context("Failed to serialize default config")?;
            fs::write(&config_path, toml_str).context("Failed to write default config file")?;
            config
        };

        config.config_path = config_path;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to config.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(port_str) =
            std::env::var("STREAMCORE_GATEWAY_PORT").or_else(|_| std::env::var("PORT"))
        {
            if let Ok(port) = port_str.parse::<u16>() {
                self.gateway.port = port;
            }
        }

        if let Ok(host) =
            std::env::var("STREAMCORE_GATEWAY_HOST").or_else(|_| std::env::var("HOST"))
        {
            if !host.is_empty() {
                self.gateway.host = host;
            }
        }

        if let Ok(backend) = std::env::var("STREAMCORE_OBSERVABILITY_BACKEND") {
            if !backend.is_empty() {
                self.observability.backend = backend;
            }
        }
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&self.config_path, toml_str).context("Failed to write config file")?;
        Ok(())
    }
}

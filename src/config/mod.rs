pub mod schema;

pub use schema::{
    AgentConfig, Config, GatewayConfig, ObservabilityConfig, StreamConfig, TaskQueueConfig,
};

pub mod adapter;
pub mod compression;

pub use adapter::{AgentAdapter, AdapterConfig};
pub use compression::CompressionStrategy;

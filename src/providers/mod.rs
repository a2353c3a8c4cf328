pub mod traits;

pub use traits::{ChatMessage, Provider, ProviderChunk, Role, ToolCallRequest};

pub mod types;

pub use types::{EventPayload, EventType, StreamEvent};

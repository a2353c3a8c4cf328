#![warn(clippy::all)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::unnecessary_literal_bound,
    clippy::module_name_repetitions,
    clippy::struct_field_names,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::return_self_not_must_use,
    dead_code
)]

pub mod agent;
pub mod buffer;
pub mod config;
pub mod core;
pub mod emitter;
pub mod error;
pub mod events;
pub mod gateway;
pub mod observability;
pub mod providers;
pub mod queue;
pub mod state;
pub mod tools;
pub mod util;

//! Core types for selfforge: data model, error taxonomy, event bus, config.
//!
//! Everything here is shared by the llm, tools, engine and gateway crates.
//! No component in this crate performs I/O beyond the broadcast channel.

pub mod config;
pub mod error;
pub mod event;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use event::{Event, EventBus, EventStream, LogLevel, RegistryChangeKind};
pub use types::{Plan, PlanStep, StepResult, TaskId, TaskOutcome, TaskRecord};

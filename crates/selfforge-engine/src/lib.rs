//! selfforge-engine — the task execution loop.
//!
//! Drives a task through analysis, optional tool synthesis, plan
//! generation, sequential execution, result synthesis and experience
//! recording, streaming structured events throughout.

pub mod engine;
pub mod executor;
pub mod experience;

pub use engine::{EngineConfig, TaskEngine};
pub use executor::PlanExecutor;
pub use experience::{ExperienceStore, Recommendation, StoreError, StoreSummary, ToolStats};

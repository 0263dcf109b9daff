//! LLM boundary for selfforge.
//!
//! All prompt formatting, response parsing, retry and fallback behavior
//! lives behind [`LlmGate`]; no other crate talks to the provider.

pub mod chat;
pub mod gate;
pub mod mock;
pub mod provider;

pub use chat::ChatProvider;
pub use gate::{LlmGate, SafetyVerdict, ToolCreationAnalysis, ToolSpec};
pub use provider::{ChatRequest, LlmError, LlmProvider, LlmResult};

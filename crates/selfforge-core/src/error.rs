//! Error types for selfforge

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("llm error: {0}")]
    Llm(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("tool execution failed: {name} - {message}")]
    ToolExec { name: String, message: String },

    #[error("tool '{name}' timed out after {seconds}s")]
    ToolTimeout { name: String, seconds: u64 },

    #[error("missing dependency: {0}")]
    MissingDependency(String),

    #[error("tool already registered: {0}")]
    AlreadyRegistered(String),

    #[error("synthesis failed: {0}")]
    SynthesisFailed(String),

    #[error("manifest parse error: {0}")]
    ManifestParse(String),

    #[error("cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn tool_exec(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolExec {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::InvalidArgs(message.into())
    }

    /// Whether this error aborts the whole task, as opposed to a single
    /// plan step or an optional enrichment.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvalidTask(_) | Self::Cancelled)
    }
}

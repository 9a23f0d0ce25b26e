use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Reasons a submission is rejected before any sandbox exists.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Source code is empty")]
    EmptySource,

    #[error("Source code is {size} bytes, maximum is {max}")]
    SourceTooLarge { size: usize, max: usize },

    #[error("Source code contains a NUL byte")]
    NulByte,

    #[error("{field} must be greater than zero")]
    NonPositive { field: &'static str },

    #[error("Language not supported: {0}")]
    UnsupportedLanguage(String),
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid submission: {0}")]
    Validation(#[from] ValidationError),

    #[error("Interpreter not found for {0}")]
    InterpreterNotFound(String),

    #[error("Execution queue is full ({depth} waiting)")]
    Backpressure { depth: usize },

    #[error("Rate limit exceeded for {requester}: {limit} executions per {window:?}")]
    RateLimited {
        requester: String,
        limit: u32,
        window: Duration,
    },

    #[error("Isolation backend error: {0}")]
    Backend(String),

    #[error("Failed to load security policy: {0}")]
    PolicyLoad(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Invalid execution state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Tracker error: {0}")]
    Tracker(String),

    #[error("Quota store error: {0}")]
    Quota(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid pattern: {0}")]
    Regex(#[from] regex::Error),
}

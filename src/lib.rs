//! Execution engine for untrusted student programs.
//!
//! Submissions in the Python-like language or the graph language are
//! validated, checked against a per-language security policy, and run in an
//! isolated sandbox under time, memory and output limits. Programs can also
//! be translated between the two languages.
//!
//! ```rust,no_run
//! use codeexec::{create_default_engine, ExecutionRequest, Language};
//! use std::time::Duration;
//!
//! # async fn run() -> codeexec::Result<()> {
//! let engine = create_default_engine()?;
//! let request = ExecutionRequest::new(Language::Python, "print('Hello, World!')")
//!     .with_timeout(Duration::from_secs(2));
//! let result = engine.execute(request).await?;
//! println!("{}: {}", result.status(), result.stdout());
//! # Ok(())
//! # }
//! ```

pub mod analyzer;
pub mod config;
#[cfg(target_os = "linux")]
mod confine;
pub mod engine;
pub mod errors;
pub mod executor;
pub mod governor;
pub mod native;
pub mod policy;
pub mod pool;
pub mod sandbox_builder;
pub mod sandboxed;
pub mod service;
pub mod templates;
pub mod tracker;
pub mod translate;
pub mod types;
pub mod validator;

pub use analyzer::{
    EvaluatorRegistry, PolicyEvaluator, SecurityViolation, TokenPolicyEvaluator, Verdict,
    ViolationKind,
};
pub use config::{EngineConfig, InterpreterConfig, PoolConfig, ProcessLimits, RateLimitConfig};
pub use engine::{
    BackendCapabilities, ExitInfo, IsolationBackend, LaunchSpec, MemorySample, SandboxHandle,
    SpawnedSandbox,
};
pub use errors::{EngineError, Result, ValidationError};
pub use executor::{ExecutionState, SandboxExecutor};
pub use governor::{ResourceGovernor, RunLimits};
pub use native::ProcessBackend;
pub use policy::{PolicySet, PolicySnapshot, PolicyStore, SecurityPolicy};
pub use pool::{InMemoryQuotaStore, PoolStats, QuotaStore, RateLimiter, WorkerPool};
pub use sandbox_builder::{
    create_default_engine, create_engine_from_env, create_engine_with_options, EngineOptions,
};
pub use service::ExecutionEngine;
pub use templates::{CodeTemplate, InMemoryTemplateStore, TemplateStore};
pub use tracker::{
    ChannelTracker, ExecutionRecord, ExecutionTracker, JsonLinesTracker, NullTracker,
    TrackerEvent, TranslationRecord,
};
pub use translate::{
    Diagnostic, Severity, TranslationRequest, TranslationResult, Translator,
};
pub use types::{
    ExecutionId, ExecutionRequest, ExecutionResult, ExecutionStatus, Language, RunReport,
};
pub use validator::{SubmissionValidator, ValidatedRequest};

/// Cancels an execution, queued or running
pub use tokio_util::sync::CancellationToken as AbortToken;

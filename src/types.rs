//! Request and result records shared by the executor, the tracker boundary and
//! the transport wrapper.

use crate::analyzer::SecurityViolation;
use crate::errors::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MEMORY_LIMIT_BYTES: u64 = 64 * 1024 * 1024;
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 10 * 1024;
pub const ANONYMOUS_REQUESTER: &str = "anonymous";

/// Source languages accepted by the engine
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    /// Python-like language
    #[serde(alias = "py", alias = "python-like")]
    Python,
    /// Graph language (node/edge/walker archetypes, brace-delimited blocks)
    #[serde(alias = "graph-language", alias = "jac")]
    Graph,
}

impl Language {
    pub const ALL: [Language; 2] = [Language::Python, Language::Graph];

    pub fn tag(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Graph => "graph",
        }
    }

    /// File extension used when the program is written to the scratch directory
    pub fn file_extension(&self) -> &'static str {
        match self {
            Language::Python => "py",
            Language::Graph => "jac",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Language {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "python" | "py" | "python-like" | "python_like" => Ok(Language::Python),
            "graph" | "graph-language" | "graph_language" | "jac" => Ok(Language::Graph),
            other => Err(ValidationError::UnsupportedLanguage(other.to_string())),
        }
    }
}

/// Unique execution identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub uuid::Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single submission. Fields are private so the request cannot change after
/// it has been built; use the `with_*` methods while constructing it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionRequest {
    source: String,
    language: Language,
    #[serde(rename = "timeout_ms", with = "duration_ms", default = "default_timeout")]
    timeout: Duration,
    #[serde(default = "default_memory_limit")]
    memory_limit_bytes: u64,
    #[serde(default = "default_max_output")]
    max_output_bytes: usize,
    #[serde(default = "default_requester")]
    requester: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    template_id: Option<String>,
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

fn default_memory_limit() -> u64 {
    DEFAULT_MEMORY_LIMIT_BYTES
}

fn default_max_output() -> usize {
    DEFAULT_MAX_OUTPUT_BYTES
}

fn default_requester() -> String {
    ANONYMOUS_REQUESTER.to_string()
}

impl ExecutionRequest {
    pub fn new(language: Language, source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            language,
            timeout: DEFAULT_TIMEOUT,
            memory_limit_bytes: DEFAULT_MEMORY_LIMIT_BYTES,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            requester: default_requester(),
            template_id: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit_bytes = bytes;
        self
    }

    pub fn with_max_output(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    pub fn with_requester(mut self, requester: impl Into<String>) -> Self {
        self.requester = requester.into();
        self
    }

    pub(crate) fn with_template_id(mut self, template_id: impl Into<String>) -> Self {
        self.template_id = Some(template_id.into());
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit_bytes
    }

    pub fn max_output_bytes(&self) -> usize {
        self.max_output_bytes
    }

    pub fn requester(&self) -> &str {
        &self.requester
    }

    pub fn template_id(&self) -> Option<&str> {
        self.template_id.as_deref()
    }
}

/// Terminal outcome of an execution
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// The program ran to completion (its own exit code may still be non-zero)
    Completed,
    /// Wall-clock limit reached, process group killed
    TimedOut,
    /// Memory ceiling reached, process group killed
    MemoryExceeded,
    /// Cancelled through an abort token
    Killed,
    /// Rejected by the security policy, nothing was spawned
    SecurityViolation,
    /// The engine failed to run the program
    InternalError,
}

impl ExecutionStatus {
    /// True when the outcome is the engine's fault rather than the submitted code's
    pub fn is_system_fault(&self) -> bool {
        matches!(self, ExecutionStatus::InternalError)
    }

    pub fn describe(&self) -> &'static str {
        match self {
            ExecutionStatus::Completed => "Your program finished",
            ExecutionStatus::TimedOut => "Your program exceeded its time limit",
            ExecutionStatus::MemoryExceeded => "Your program exceeded its memory limit",
            ExecutionStatus::Killed => "The run was cancelled",
            ExecutionStatus::SecurityViolation => {
                "Your program uses a construct that is not allowed"
            }
            ExecutionStatus::InternalError => {
                "The system failed to run your program; this is not caused by your code"
            }
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::TimedOut => "timed_out",
            ExecutionStatus::MemoryExceeded => "memory_exceeded",
            ExecutionStatus::Killed => "killed",
            ExecutionStatus::SecurityViolation => "security_violation",
            ExecutionStatus::InternalError => "internal_error",
        };
        f.write_str(s)
    }
}

/// Everything the governor measured about one run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub status: ExecutionStatus,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub duration: Duration,
    pub peak_memory_bytes: Option<u64>,
    pub truncated: bool,
}

/// Immutable record of one execution. Built once by the executor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionResult {
    id: ExecutionId,
    language: Language,
    status: ExecutionStatus,
    stdout: String,
    stderr: String,
    exit_code: Option<i32>,
    signal: Option<i32>,
    #[serde(rename = "duration_ms", with = "duration_ms")]
    duration: Duration,
    peak_memory_bytes: Option<u64>,
    truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    violation: Option<SecurityViolation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ExecutionResult {
    pub(crate) fn from_report(id: ExecutionId, language: Language, report: RunReport) -> Self {
        Self {
            id,
            language,
            status: report.status,
            stdout: report.stdout,
            stderr: report.stderr,
            exit_code: report.exit_code,
            signal: report.signal,
            duration: report.duration,
            peak_memory_bytes: report.peak_memory_bytes,
            truncated: report.truncated,
            violation: None,
            error: None,
        }
    }

    pub(crate) fn security_violation(
        id: ExecutionId,
        language: Language,
        violation: SecurityViolation,
        elapsed: Duration,
    ) -> Self {
        Self {
            id,
            language,
            status: ExecutionStatus::SecurityViolation,
            stdout: String::new(),
            stderr: violation.to_string(),
            exit_code: None,
            signal: None,
            duration: elapsed,
            peak_memory_bytes: None,
            truncated: false,
            violation: Some(violation),
            error: None,
        }
    }

    pub(crate) fn killed_before_start(id: ExecutionId, language: Language, elapsed: Duration) -> Self {
        Self {
            id,
            language,
            status: ExecutionStatus::Killed,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            signal: None,
            duration: elapsed,
            peak_memory_bytes: None,
            truncated: false,
            violation: None,
            error: None,
        }
    }

    pub(crate) fn internal_error(
        id: ExecutionId,
        language: Language,
        message: String,
        elapsed: Duration,
    ) -> Self {
        Self {
            id,
            language,
            status: ExecutionStatus::InternalError,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            signal: None,
            duration: elapsed,
            peak_memory_bytes: None,
            truncated: false,
            violation: None,
            error: Some(message),
        }
    }

    pub fn id(&self) -> ExecutionId {
        self.id
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn signal(&self) -> Option<i32> {
        self.signal
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn peak_memory_bytes(&self) -> Option<u64> {
        self.peak_memory_bytes
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn violation(&self) -> Option<&SecurityViolation> {
        self.violation.as_ref()
    }

    /// Infrastructure error message, only set for `InternalError`
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Message suitable for showing to the submitter
    pub fn user_message(&self) -> String {
        match (&self.status, &self.violation) {
            (ExecutionStatus::SecurityViolation, Some(v)) => {
                format!("{}: {}", self.status.describe(), v)
            }
            (ExecutionStatus::Completed, _) if self.truncated => {
                format!("{} (output truncated)", self.status.describe())
            }
            _ => self.status.describe().to_string(),
        }
    }
}

/// Serialize a `Duration` as integer milliseconds
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_aliases() {
        assert_eq!("python-like".parse::<Language>().unwrap(), Language::Python);
        assert_eq!("JAC".parse::<Language>().unwrap(), Language::Graph);
        assert!(matches!(
            "cobol".parse::<Language>(),
            Err(ValidationError::UnsupportedLanguage(_))
        ));
    }

    #[test]
    fn test_request_defaults_from_json() {
        let req: ExecutionRequest =
            serde_json::from_str(r#"{"source": "print(1)", "language": "python"}"#).unwrap();
        assert_eq!(req.timeout(), DEFAULT_TIMEOUT);
        assert_eq!(req.memory_limit_bytes(), DEFAULT_MEMORY_LIMIT_BYTES);
        assert_eq!(req.max_output_bytes(), DEFAULT_MAX_OUTPUT_BYTES);
        assert_eq!(req.requester(), ANONYMOUS_REQUESTER);

        let req: ExecutionRequest = serde_json::from_str(
            r#"{"source": "x", "language": "graph-language", "timeout_ms": 1500}"#,
        )
        .unwrap();
        assert_eq!(req.language(), Language::Graph);
        assert_eq!(req.timeout(), Duration::from_millis(1500));
    }

    #[test]
    fn test_system_fault_is_distinct() {
        assert!(ExecutionStatus::InternalError.is_system_fault());
        for status in [
            ExecutionStatus::Completed,
            ExecutionStatus::TimedOut,
            ExecutionStatus::MemoryExceeded,
            ExecutionStatus::Killed,
            ExecutionStatus::SecurityViolation,
        ] {
            assert!(!status.is_system_fault());
            assert_ne!(status.describe(), ExecutionStatus::InternalError.describe());
        }
    }
}

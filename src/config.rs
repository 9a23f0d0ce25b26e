use crate::errors::{EngineError, Result};
use crate::types::{duration_ms, Language};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_MAX_SOURCE_BYTES: usize = 100 * 1024;

/// How to start the runtime for one language. The program is resolved with
/// `which` at spawn time and receives `args` followed by the program file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InterpreterConfig {
    pub language: Language,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl InterpreterConfig {
    pub fn new(language: Language, program: &str, args: &[&str]) -> Self {
        Self {
            language,
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// `python3 -I -u`: isolated mode (no user site, no PYTHON* env), unbuffered
    pub fn python() -> Self {
        Self::new(Language::Python, "python3", &["-I", "-u"])
    }

    pub fn graph() -> Self {
        Self::new(Language::Graph, "jac", &["run"])
    }
}

/// Worker pool sizing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PoolConfig {
    /// Sandboxes running at the same time
    pub max_concurrent: usize,
    /// Requests allowed to wait for a slot; beyond this new requests are refused
    pub max_queue_depth: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        Self {
            max_concurrent: cores,
            max_queue_depth: cores * 16,
        }
    }
}

/// Per-requester submission limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RateLimitConfig {
    pub per_minute: u32,
    pub per_hour: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_minute: 30,
            per_hour: 300,
        }
    }
}

impl RateLimitConfig {
    /// No limits, for trusted embedders and tests
    pub fn unlimited() -> Self {
        Self {
            per_minute: u32::MAX,
            per_hour: u32::MAX,
        }
    }
}

/// OS limits applied to every sandboxed process in addition to the
/// per-request time and memory limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProcessLimits {
    /// RLIMIT_NPROC for the sandbox user
    pub max_processes: u64,
    /// RLIMIT_FSIZE, caps any single file written in the scratch directory
    pub max_file_size_bytes: u64,
    /// Thread cap exported to numeric libraries (OMP/MKL/OPENBLAS)
    pub max_threads: u32,
    /// Extra CPU seconds allowed beyond the wall-clock timeout before SIGXCPU
    pub cpu_grace_secs: u64,
    /// Host paths the program may read and execute. The scratch directory
    /// and the interpreter's install prefix are always added.
    pub read_only_paths: Vec<PathBuf>,
    /// Refuse to run when the kernel cannot confine the filesystem
    pub require_filesystem_confinement: bool,
}

impl Default for ProcessLimits {
    fn default() -> Self {
        Self {
            max_processes: 64,
            max_file_size_bytes: 16 * 1024 * 1024,
            max_threads: 1,
            cpu_grace_secs: 1,
            read_only_paths: [
                "/usr",
                "/lib",
                "/lib64",
                "/bin",
                "/etc/ld.so.cache",
                "/etc/localtime",
                "/dev/null",
                "/dev/urandom",
            ]
            .iter()
            .map(PathBuf::from)
            .collect(),
            require_filesystem_confinement: false,
        }
    }
}

/// Engine-wide settings. Security rules live in [`crate::policy`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    pub max_source_bytes: usize,
    pub pool: PoolConfig,
    pub rate_limits: RateLimitConfig,
    pub process_limits: ProcessLimits,
    pub interpreters: Vec<InterpreterConfig>,
    /// Parent directory for per-run scratch directories; system temp when unset
    pub scratch_base: Option<PathBuf>,
    /// JSON policy document; built-in presets when unset
    pub policy_file: Option<PathBuf>,
    #[serde(rename = "memory_poll_interval_ms", with = "duration_ms")]
    pub memory_poll_interval: Duration,
    /// Time allowed for output pipes to close after the process group is killed
    #[serde(rename = "drain_grace_ms", with = "duration_ms")]
    pub drain_grace: Duration,
    /// How long a killed process may take to be reaped before the run is
    /// reported as an internal error
    #[serde(rename = "backend_slack_ms", with = "duration_ms")]
    pub backend_slack: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_source_bytes: DEFAULT_MAX_SOURCE_BYTES,
            pool: PoolConfig::default(),
            rate_limits: RateLimitConfig::default(),
            process_limits: ProcessLimits::default(),
            interpreters: vec![InterpreterConfig::python(), InterpreterConfig::graph()],
            scratch_base: None,
            policy_file: None,
            memory_poll_interval: Duration::from_millis(25),
            drain_grace: Duration::from_millis(500),
            backend_slack: Duration::from_secs(5),
        }
    }
}

impl EngineConfig {
    pub fn interpreter(&self, language: Language) -> Option<&InterpreterConfig> {
        self.interpreters.iter().find(|i| i.language == language)
    }

    /// Replace (or add) the interpreter for its language
    pub fn set_interpreter(&mut self, interpreter: InterpreterConfig) {
        self.interpreters.retain(|i| i.language != interpreter.language);
        self.interpreters.push(interpreter);
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
    }

    /// `CODEEXEC_CONFIG` file (or defaults) with `CODEEXEC_*` overrides applied
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var_os("CODEEXEC_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup:
    ///
    /// - `CODEEXEC_PYTHON` / `CODEEXEC_GRAPH_RUNTIME`: interpreter program
    /// - `CODEEXEC_SCRATCH_DIR`: scratch parent directory
    /// - `CODEEXEC_POLICY_FILE`: policy document
    /// - `CODEEXEC_MAX_CONCURRENT` / `CODEEXEC_MAX_QUEUE_DEPTH`: pool sizing
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        for (key, language) in [
            ("CODEEXEC_PYTHON", Language::Python),
            ("CODEEXEC_GRAPH_RUNTIME", Language::Graph),
        ] {
            if let Some(program) = lookup(key) {
                let mut interpreter = self
                    .interpreter(language)
                    .cloned()
                    .unwrap_or_else(|| InterpreterConfig::new(language, "", &[]));
                interpreter.program = program;
                self.set_interpreter(interpreter);
            }
        }
        if let Some(dir) = lookup("CODEEXEC_SCRATCH_DIR") {
            self.scratch_base = Some(PathBuf::from(dir));
        }
        if let Some(path) = lookup("CODEEXEC_POLICY_FILE") {
            self.policy_file = Some(PathBuf::from(path));
        }
        if let Some(value) = lookup("CODEEXEC_MAX_CONCURRENT") {
            self.pool.max_concurrent = parse_count("CODEEXEC_MAX_CONCURRENT", &value)?;
        }
        if let Some(value) = lookup("CODEEXEC_MAX_QUEUE_DEPTH") {
            self.pool.max_queue_depth = parse_count("CODEEXEC_MAX_QUEUE_DEPTH", &value)?;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_source_bytes == 0 {
            return Err(EngineError::Config(
                "max_source_bytes must be greater than zero".to_string(),
            ));
        }
        if self.pool.max_concurrent == 0 {
            return Err(EngineError::Config(
                "pool.max_concurrent must be greater than zero".to_string(),
            ));
        }
        if self.memory_poll_interval.is_zero() {
            return Err(EngineError::Config(
                "memory_poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if let Some(empty) = self.interpreters.iter().find(|i| i.program.trim().is_empty()) {
            return Err(EngineError::Config(format!(
                "interpreter program for {} is empty",
                empty.language
            )));
        }
        Ok(())
    }
}

fn parse_count(key: &str, value: &str) -> Result<usize> {
    value
        .trim()
        .parse()
        .map_err(|_| EngineError::Config(format!("{} must be a number, got '{}'", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = EngineConfig::from_json(
            r#"{"pool": {"max_concurrent": 3}, "drain_grace_ms": 250}"#,
        )
        .unwrap();
        assert_eq!(config.pool.max_concurrent, 3);
        assert_eq!(config.pool.max_queue_depth, PoolConfig::default().max_queue_depth);
        assert_eq!(config.drain_grace, Duration::from_millis(250));
        assert_eq!(config.max_source_bytes, DEFAULT_MAX_SOURCE_BYTES);
        assert_eq!(config.interpreter(Language::Python).unwrap().program, "python3");
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("CODEEXEC_PYTHON", "/opt/python/bin/python3.12"),
            ("CODEEXEC_MAX_CONCURRENT", "2"),
            ("CODEEXEC_SCRATCH_DIR", "/var/tmp/runs"),
        ]
        .into_iter()
        .collect();

        let mut config = EngineConfig::default();
        config
            .apply_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();

        let python = config.interpreter(Language::Python).unwrap();
        assert_eq!(python.program, "/opt/python/bin/python3.12");
        assert_eq!(python.args, vec!["-I", "-u"]);
        assert_eq!(config.pool.max_concurrent, 2);
        assert_eq!(config.scratch_base, Some(PathBuf::from("/var/tmp/runs")));
    }

    #[test]
    fn test_invalid_values_are_config_errors() {
        let mut config = EngineConfig::default();
        let result = config.apply_overrides(|k| {
            (k == "CODEEXEC_MAX_CONCURRENT").then(|| "many".to_string())
        });
        assert!(matches!(result, Err(EngineError::Config(_))));

        assert!(matches!(
            EngineConfig::from_json(r#"{"pool": {"max_concurrent": 0}}"#),
            Err(EngineError::Config(_))
        ));
    }
}

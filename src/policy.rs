//! Security Policy Data and Snapshots
//!
//! Policies are layered the same way for every language:
//!
//! 1. **Primitives** - blocked imports, blocked builtins, raw syntax patterns,
//!    and the hard caps the validator clamps requests to
//! 2. **Presets** - `python_default`, `graph_default`, `permissive`
//! 3. **Snapshots** - an immutable, versioned [`PolicySet`] plus the
//!    evaluators compiled from it, swapped atomically on reload
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  PolicyStore                                                 │
//! │  - Holds the current Arc<PolicySnapshot>                    │
//! │  - reload() compiles a new snapshot, then swaps it in       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  PolicySnapshot (immutable)                                  │
//! │  - version, loaded_at                                       │
//! │  - PolicySet + EvaluatorRegistry                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  SecurityPolicy (per language)                               │
//! │  - imports, builtins, patterns, output/time/memory caps     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! A request takes one snapshot when it is dequeued and keeps it until it
//! reaches a terminal state, so a reload never changes the rules mid-run.

use crate::analyzer::{EvaluatorRegistry, PolicyEvaluator};
use crate::errors::{EngineError, Result};
use crate::types::{duration_ms, Language};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{info, warn};

// ============================================================================
// PRIMITIVES - Per-language rules and caps
// ============================================================================

/// Rules applied to one language before anything is spawned
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SecurityPolicy {
    /// Modules that may not be imported; a dotted entry also covers its submodules
    pub blocked_imports: BTreeSet<String>,
    /// Builtin names that may not be referenced
    pub blocked_builtins: BTreeSet<String>,
    /// Regular expressions matched against the raw source
    pub blocked_syntax_patterns: Vec<String>,
    /// Upper bound for a request's per-stream output cap, in bytes
    pub max_output_size: usize,
    /// Upper bound for a request's timeout
    #[serde(rename = "max_time_ms", with = "duration_ms")]
    pub max_time: Duration,
    /// Upper bound for a request's memory limit, in bytes
    #[serde(rename = "max_memory_bytes")]
    pub max_memory: u64,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self::python_default()
    }
}

const DEFAULT_MAX_OUTPUT_SIZE: usize = 1024 * 1024;
const DEFAULT_MAX_TIME: Duration = Duration::from_secs(30);
const DEFAULT_MAX_MEMORY: u64 = 512 * 1024 * 1024;

fn set_of(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl SecurityPolicy {
    /// Modules that reach the OS, the network, the interpreter internals or
    /// serialized code
    pub fn default_blocked_imports() -> BTreeSet<String> {
        set_of(&[
            "os",
            "sys",
            "subprocess",
            "multiprocessing",
            "socket",
            "ctypes",
            "importlib",
            "shutil",
            "signal",
            "pty",
            "fcntl",
            "resource",
            "threading",
            "_thread",
            "asyncio",
            "urllib",
            "http",
            "requests",
            "ftplib",
            "smtplib",
            "telnetlib",
            "pickle",
            "marshal",
            "builtins",
            "code",
            "codeop",
            "gc",
            "inspect",
            "mmap",
            "tempfile",
            "pathlib",
            "io",
            "glob",
            "webbrowser",
            "platform",
        ])
    }

    /// Builtins that evaluate code, open files or walk the object graph
    pub fn default_blocked_builtins() -> BTreeSet<String> {
        set_of(&[
            "exec",
            "eval",
            "compile",
            "open",
            "__import__",
            "globals",
            "locals",
            "vars",
            "getattr",
            "setattr",
            "delattr",
            "breakpoint",
            "help",
            "input",
            "memoryview",
        ])
    }

    /// Introspection escapes and host paths
    pub fn default_blocked_patterns() -> Vec<String> {
        [
            r"__(subclasses|globals|builtins|code|mro|bases|dict|class|loader|spec)__",
            r"\bos\s*\.\s*(system|popen|exec\w*|spawn\w*|fork)\b",
            r"/proc/",
            r"/etc/",
            r"\.\./",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    /// Classroom defaults for the Python-like language
    pub fn python_default() -> Self {
        Self {
            blocked_imports: Self::default_blocked_imports(),
            blocked_builtins: Self::default_blocked_builtins(),
            blocked_syntax_patterns: Self::default_blocked_patterns(),
            max_output_size: DEFAULT_MAX_OUTPUT_SIZE,
            max_time: DEFAULT_MAX_TIME,
            max_memory: DEFAULT_MAX_MEMORY,
        }
    }

    /// Same lists as Python plus inline Python blocks, which would bypass the
    /// graph-level checks
    pub fn graph_default() -> Self {
        let mut policy = Self::python_default();
        policy
            .blocked_syntax_patterns
            .push(r"::py::".to_string());
        policy
    }

    /// No blocked constructs; caps unchanged. For instructor-authored code only.
    pub fn permissive() -> Self {
        Self {
            blocked_imports: BTreeSet::new(),
            blocked_builtins: BTreeSet::new(),
            blocked_syntax_patterns: Vec::new(),
            ..Self::python_default()
        }
    }

    /// Default preset for a language
    pub fn for_language(language: Language) -> Self {
        match language {
            Language::Python => Self::python_default(),
            Language::Graph => Self::graph_default(),
        }
    }

    /// `module` is blocked when it, or any dotted prefix of it, is listed.
    /// `os.path` is blocked by `os`; `asyncio.subprocess` blocks only that
    /// subtree when `asyncio` itself is not listed.
    pub fn is_import_blocked(&self, module: &str) -> bool {
        let module = module.trim();
        if module.is_empty() {
            return false;
        }
        if self.blocked_imports.contains(module) {
            return true;
        }
        module
            .match_indices('.')
            .any(|(i, _)| self.blocked_imports.contains(&module[..i]))
    }

    pub fn is_builtin_blocked(&self, name: &str) -> bool {
        self.blocked_builtins.contains(name)
    }

    /// Start a customized policy from a preset
    pub fn custom(base: Self) -> SecurityPolicyBuilder {
        SecurityPolicyBuilder { policy: base }
    }
}

/// Builder for custom policies
pub struct SecurityPolicyBuilder {
    policy: SecurityPolicy,
}

impl SecurityPolicyBuilder {
    pub fn block_import(mut self, module: &str) -> Self {
        self.policy.blocked_imports.insert(module.to_string());
        self
    }

    pub fn allow_import(mut self, module: &str) -> Self {
        self.policy.blocked_imports.remove(module);
        self
    }

    pub fn block_builtin(mut self, name: &str) -> Self {
        self.policy.blocked_builtins.insert(name.to_string());
        self
    }

    pub fn allow_builtin(mut self, name: &str) -> Self {
        self.policy.blocked_builtins.remove(name);
        self
    }

    pub fn block_pattern(mut self, pattern: &str) -> Self {
        self.policy.blocked_syntax_patterns.push(pattern.to_string());
        self
    }

    pub fn max_output_size(mut self, bytes: usize) -> Self {
        self.policy.max_output_size = bytes;
        self
    }

    pub fn max_time(mut self, time: Duration) -> Self {
        self.policy.max_time = time;
        self
    }

    pub fn max_memory(mut self, bytes: u64) -> Self {
        self.policy.max_memory = bytes;
        self
    }

    pub fn build(self) -> SecurityPolicy {
        self.policy
    }
}

// ============================================================================
// POLICY SET - One policy per language, loadable from JSON
// ============================================================================

/// Policies for every language the engine runs.
///
/// Serialized as an object keyed by language tag:
///
/// ```json
/// { "python": { "blocked_imports": ["os"], "max_time_ms": 10000 } }
/// ```
///
/// Languages missing from a file keep their default preset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicySet {
    policies: BTreeMap<Language, SecurityPolicy>,
}

impl Default for PolicySet {
    fn default() -> Self {
        Self {
            policies: Language::ALL
                .iter()
                .map(|lang| (*lang, SecurityPolicy::for_language(*lang)))
                .collect(),
        }
    }
}

impl PolicySet {
    pub fn empty() -> Self {
        Self {
            policies: BTreeMap::new(),
        }
    }

    pub fn get(&self, language: Language) -> Option<&SecurityPolicy> {
        self.policies.get(&language)
    }

    pub fn set(&mut self, language: Language, policy: SecurityPolicy) {
        self.policies.insert(language, policy);
    }

    pub fn with_policy(mut self, language: Language, policy: SecurityPolicy) -> Self {
        self.set(language, policy);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (Language, &SecurityPolicy)> {
        self.policies.iter().map(|(lang, policy)| (*lang, policy))
    }

    /// Parse a JSON policy document over the default presets
    pub fn from_json(content: &str) -> Result<Self> {
        let raw: BTreeMap<String, SecurityPolicy> = serde_json::from_str(content)
            .map_err(|e| EngineError::PolicyLoad(format!("Failed to parse policy file: {}", e)))?;
        let mut set = Self::default();
        for (tag, policy) in raw {
            let language: Language = tag
                .parse()
                .map_err(|e| EngineError::PolicyLoad(format!("{}", e)))?;
            set.set(language, policy);
        }
        Ok(set)
    }

    /// Load a policy document from disk
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::PolicyLoad(format!(
                "Failed to read policy file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json(&content)
    }

    pub fn to_json(&self) -> Result<String> {
        let raw: BTreeMap<&str, &SecurityPolicy> = self
            .policies
            .iter()
            .map(|(lang, policy)| (lang.tag(), policy))
            .collect();
        Ok(serde_json::to_string_pretty(&raw)?)
    }
}

// ============================================================================
// SNAPSHOTS - Immutable view handed to each request
// ============================================================================

/// Policies and their compiled evaluators at one point in time
pub struct PolicySnapshot {
    version: u64,
    loaded_at: DateTime<Utc>,
    policies: PolicySet,
    evaluators: EvaluatorRegistry,
}

impl PolicySnapshot {
    /// Compile evaluators for every policy in `policies`
    pub fn build(version: u64, policies: PolicySet) -> Result<Self> {
        let evaluators = EvaluatorRegistry::from_policies(&policies)?;
        Ok(Self::with_evaluators(version, policies, evaluators))
    }

    /// Use a caller-assembled registry, e.g. with a custom evaluator plugged in
    pub fn with_evaluators(version: u64, policies: PolicySet, evaluators: EvaluatorRegistry) -> Self {
        Self {
            version,
            loaded_at: Utc::now(),
            policies,
            evaluators,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn policies(&self) -> &PolicySet {
        &self.policies
    }

    pub fn policy(&self, language: Language) -> Option<&SecurityPolicy> {
        self.policies.get(language)
    }

    pub fn evaluator(&self, language: Language) -> Option<Arc<dyn PolicyEvaluator>> {
        self.evaluators.get(language)
    }
}

impl std::fmt::Debug for PolicySnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicySnapshot")
            .field("version", &self.version)
            .field("loaded_at", &self.loaded_at)
            .field("languages", &self.evaluators.languages())
            .finish()
    }
}

// ============================================================================
// POLICY STORE - Hot reload
// ============================================================================

/// Holds the current snapshot. Readers clone the `Arc` and never block a run.
pub struct PolicyStore {
    current: RwLock<Arc<PolicySnapshot>>,
}

impl PolicyStore {
    pub fn new(policies: PolicySet) -> Result<Self> {
        let snapshot = PolicySnapshot::build(1, policies)?;
        Ok(Self::from_snapshot(snapshot))
    }

    pub fn from_snapshot(snapshot: PolicySnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    /// Snapshot for one request
    pub fn current(&self) -> Arc<PolicySnapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the active policies. On error the previous snapshot stays active.
    pub fn reload(&self, policies: PolicySet) -> Result<u64> {
        let evaluators = EvaluatorRegistry::from_policies(&policies).map_err(|e| {
            warn!("[POLICY] Reload rejected, keeping current policies: {}", e);
            e
        })?;
        self.install(policies, evaluators)
    }

    /// Reload with a caller-assembled registry
    pub fn install(&self, policies: PolicySet, evaluators: EvaluatorRegistry) -> Result<u64> {
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let version = guard.version() + 1;
        *guard = Arc::new(PolicySnapshot::with_evaluators(
            version, policies, evaluators,
        ));
        info!("[POLICY] Installed policy snapshot v{}", version);
        Ok(version)
    }

    pub fn reload_from_file(&self, path: &Path) -> Result<u64> {
        let policies = PolicySet::from_file(path).map_err(|e| {
            warn!("[POLICY] Reload rejected, keeping current policies: {}", e);
            e
        })?;
        self.reload(policies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_dotted_import_matching() {
        let policy = SecurityPolicy::custom(SecurityPolicy::permissive())
            .block_import("os")
            .block_import("asyncio.subprocess")
            .build();

        assert!(policy.is_import_blocked("os"));
        assert!(policy.is_import_blocked("os.path"));
        assert!(!policy.is_import_blocked("osmosis"));
        assert!(policy.is_import_blocked("asyncio.subprocess"));
        assert!(policy.is_import_blocked("asyncio.subprocess.base"));
        assert!(!policy.is_import_blocked("asyncio"));
    }

    #[test]
    fn test_graph_default_extends_python() {
        let python = SecurityPolicy::python_default();
        let graph = SecurityPolicy::graph_default();
        assert_eq!(python.blocked_imports, graph.blocked_imports);
        assert!(graph.blocked_syntax_patterns.len() > python.blocked_syntax_patterns.len());
    }

    #[test]
    fn test_policy_builder() {
        let policy = SecurityPolicy::custom(SecurityPolicy::python_default())
            .allow_import("io")
            .block_builtin("print")
            .max_time(Duration::from_secs(2))
            .build();

        assert!(!policy.is_import_blocked("io"));
        assert!(policy.is_builtin_blocked("print"));
        assert_eq!(policy.max_time, Duration::from_secs(2));
    }

    #[test]
    fn test_policy_file_overlays_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"python": {{"blocked_imports": ["turtle"], "max_time_ms": 2000}}}}"#
        )
        .unwrap();

        let set = PolicySet::from_file(file.path()).unwrap();
        let python = set.get(Language::Python).unwrap();
        assert!(python.is_import_blocked("turtle"));
        assert!(!python.is_import_blocked("os"));
        assert_eq!(python.max_time, Duration::from_secs(2));
        assert_eq!(
            python.blocked_builtins,
            SecurityPolicy::default_blocked_builtins()
        );
        assert_eq!(
            set.get(Language::Graph),
            Some(&SecurityPolicy::graph_default())
        );
    }

    #[test]
    fn test_policy_file_errors() {
        assert!(matches!(
            PolicySet::from_json(r#"{"cobol": {}}"#),
            Err(EngineError::PolicyLoad(_))
        ));
        assert!(matches!(
            PolicySet::from_json("not json"),
            Err(EngineError::PolicyLoad(_))
        ));
        assert!(matches!(
            PolicySet::from_file(Path::new("/nonexistent/policies.json")),
            Err(EngineError::PolicyLoad(_))
        ));
    }

    #[test]
    fn test_json_round_trip() {
        let set = PolicySet::default();
        let parsed = PolicySet::from_json(&set.to_json().unwrap()).unwrap();
        assert_eq!(parsed, set);
    }

    #[test]
    fn test_reload_swaps_snapshot_atomically() {
        let store = PolicyStore::new(PolicySet::default()).unwrap();
        let before = store.current();
        assert_eq!(before.version(), 1);

        let relaxed = PolicySet::default()
            .with_policy(Language::Python, SecurityPolicy::permissive());
        assert_eq!(store.reload(relaxed).unwrap(), 2);

        // The old snapshot is untouched for requests still holding it
        assert!(before
            .policy(Language::Python)
            .unwrap()
            .is_import_blocked("os"));
        assert!(!store
            .current()
            .policy(Language::Python)
            .unwrap()
            .is_import_blocked("os"));
    }

    #[test]
    fn test_bad_reload_keeps_current_snapshot() {
        let store = PolicyStore::new(PolicySet::default()).unwrap();
        let broken = SecurityPolicy::custom(SecurityPolicy::python_default())
            .block_pattern("(unclosed")
            .build();
        let result = store.reload(PolicySet::default().with_policy(Language::Python, broken));
        assert!(result.is_err());
        assert_eq!(store.current().version(), 1);
    }
}

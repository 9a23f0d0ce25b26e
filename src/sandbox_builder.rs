use crate::{
    config::EngineConfig,
    engine::IsolationBackend,
    native::ProcessBackend,
    policy::{PolicySet, PolicyStore},
    pool::{InMemoryQuotaStore, QuotaStore},
    service::{EngineParts, ExecutionEngine},
    templates::{InMemoryTemplateStore, TemplateStore},
    tracker::{ExecutionTracker, NullTracker},
    Result,
};
use std::sync::Arc;
use tracing::info;

/// Options for creating an engine
#[derive(Default)]
pub struct EngineOptions {
    /// Engine configuration; defaults when absent
    pub config: Option<EngineConfig>,
    /// Isolation backend; the process backend when absent
    pub backend: Option<Arc<dyn IsolationBackend>>,
    /// Initial policies; read from `config.policy_file` or the defaults when absent
    pub policies: Option<PolicySet>,
    pub tracker: Option<Arc<dyn ExecutionTracker>>,
    pub templates: Option<Arc<dyn TemplateStore>>,
    pub quota: Option<Arc<dyn QuotaStore>>,
}

impl EngineOptions {
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_backend(mut self, backend: Arc<dyn IsolationBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_policies(mut self, policies: PolicySet) -> Self {
        self.policies = Some(policies);
        self
    }

    pub fn with_tracker(mut self, tracker: Arc<dyn ExecutionTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn with_templates(mut self, templates: Arc<dyn TemplateStore>) -> Self {
        self.templates = Some(templates);
        self
    }

    pub fn with_quota_store(mut self, quota: Arc<dyn QuotaStore>) -> Self {
        self.quota = Some(quota);
        self
    }
}

/// Create an engine with custom options
pub fn create_engine_with_options(options: EngineOptions) -> Result<ExecutionEngine> {
    let config = options.config.unwrap_or_default();
    config.validate()?;

    let policies = match (options.policies, &config.policy_file) {
        (Some(policies), _) => policies,
        (None, Some(path)) => PolicySet::from_file(path)?,
        (None, None) => PolicySet::default(),
    };
    let policies = PolicyStore::new(policies)?;

    let backend = options
        .backend
        .unwrap_or_else(|| Arc::new(ProcessBackend::new(&config)));

    info!(
        "[ENGINE] Using {} backend, {} concurrent, queue depth {}",
        backend.name(),
        config.pool.max_concurrent,
        config.pool.max_queue_depth
    );

    Ok(ExecutionEngine::from_parts(EngineParts {
        backend,
        policies,
        tracker: options.tracker.unwrap_or_else(|| Arc::new(NullTracker)),
        templates: options
            .templates
            .unwrap_or_else(|| Arc::new(InMemoryTemplateStore::new())),
        quota: options
            .quota
            .unwrap_or_else(|| Arc::new(InMemoryQuotaStore::default())),
        config,
    }))
}

/// Create an engine with the default configuration and the process backend
pub fn create_default_engine() -> Result<ExecutionEngine> {
    create_engine_with_options(EngineOptions::default())
}

/// Create an engine configured from `CODEEXEC_CONFIG` and `CODEEXEC_*` overrides
pub fn create_engine_from_env() -> Result<ExecutionEngine> {
    create_engine_with_options(EngineOptions::default().with_config(EngineConfig::from_env()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::EngineError;
    use crate::policy::SecurityPolicy;
    use crate::types::Language;

    #[test]
    fn test_policies_come_from_the_configured_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policies.json");
        std::fs::write(&path, r#"{"python": {"blocked_imports": ["turtle"]}}"#).unwrap();

        let config = EngineConfig {
            policy_file: Some(path),
            ..EngineConfig::default()
        };
        let engine = create_engine_with_options(EngineOptions::default().with_config(config)).unwrap();
        let python = engine.get_security_policy(Language::Python).unwrap();
        assert!(python.is_import_blocked("turtle"));
        assert!(!python.is_import_blocked("os"));
        assert_eq!(engine.backend_capabilities().name, "OS process (rlimits + process group)");
    }

    #[test]
    fn test_explicit_policies_win() {
        let policies = PolicySet::empty().with_policy(Language::Python, SecurityPolicy::permissive());
        let engine = create_engine_with_options(EngineOptions::default().with_policies(policies)).unwrap();
        assert!(matches!(
            engine.get_security_policy(Language::Graph),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = EngineConfig::default();
        config.pool.max_concurrent = 0;
        assert!(matches!(
            create_engine_with_options(EngineOptions::default().with_config(config)),
            Err(EngineError::Config(_))
        ));
    }
}

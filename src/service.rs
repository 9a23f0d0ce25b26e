//! The engine as seen by callers: execute, translate, inspect and reload
//! policies, seed requests from templates.

use crate::config::EngineConfig;
use crate::engine::{BackendCapabilities, IsolationBackend};
use crate::errors::{EngineError, Result, ValidationError};
use crate::executor::SandboxExecutor;
use crate::governor::ResourceGovernor;
use crate::policy::{PolicySet, PolicySnapshot, PolicyStore, SecurityPolicy};
use crate::pool::{PoolStats, QuotaStore, RateLimiter, WorkerPool};
use crate::templates::TemplateStore;
use crate::tracker::{ExecutionRecord, ExecutionTracker, TranslationRecord};
use crate::translate::{TranslationRequest, TranslationResult, Translator};
use crate::types::{ExecutionId, ExecutionRequest, ExecutionResult, Language};
use crate::validator::SubmissionValidator;
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Everything an engine is assembled from
pub(crate) struct EngineParts {
    pub config: EngineConfig,
    pub backend: Arc<dyn IsolationBackend>,
    pub policies: PolicyStore,
    pub tracker: Arc<dyn ExecutionTracker>,
    pub templates: Arc<dyn TemplateStore>,
    pub quota: Arc<dyn QuotaStore>,
}

struct EngineInner {
    config: EngineConfig,
    policies: PolicyStore,
    executor: SandboxExecutor,
    translator: Translator,
    pool: WorkerPool,
    limiter: RateLimiter,
    tracker: Arc<dyn ExecutionTracker>,
    templates: Arc<dyn TemplateStore>,
}

/// Cheap to clone; clones share the pool, policies and tracker
#[derive(Clone)]
pub struct ExecutionEngine {
    inner: Arc<EngineInner>,
}

impl ExecutionEngine {
    pub(crate) fn from_parts(parts: EngineParts) -> Self {
        let EngineParts {
            config,
            backend,
            policies,
            tracker,
            templates,
            quota,
        } = parts;
        let executor = SandboxExecutor::new(
            backend,
            SubmissionValidator::new(&config),
            ResourceGovernor::new(&config),
        );
        Self {
            inner: Arc::new(EngineInner {
                pool: WorkerPool::new(&config.pool),
                limiter: RateLimiter::new(quota, &config.rate_limits),
                translator: Translator::default(),
                executor,
                policies,
                tracker,
                templates,
                config,
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn backend_capabilities(&self) -> BackendCapabilities {
        self.inner.executor.backend().capabilities()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    pub fn policy_snapshot(&self) -> Arc<PolicySnapshot> {
        self.inner.policies.current()
    }

    /// Run a program to a terminal state
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        self.execute_with_abort(request, CancellationToken::new())
            .await
    }

    /// Run a program; cancelling `abort` kills it, or drops it from the
    /// queue if it has not started.
    ///
    /// `Err` means the request was refused (rate limit, full queue, invalid
    /// request). Everything that happens to an accepted request is a result.
    pub async fn execute_with_abort(
        &self,
        request: ExecutionRequest,
        abort: CancellationToken,
    ) -> Result<ExecutionResult> {
        let inner = &self.inner;
        let id = ExecutionId::new();
        let accepted = Instant::now();
        let snapshot = inner.policies.current();
        let requester = request.requester().to_string();
        let template_id = request.template_id().map(str::to_string);
        let language = request.language();

        inner.limiter.check(&requester).await?;
        let admission = inner.pool.admit()?;
        inner.limiter.record(&requester).await;
        debug!(
            "[ENGINE] {} accepted for {} ({}, policy v{})",
            id,
            requester,
            language,
            snapshot.version()
        );

        let Some(permit) = admission.wait(&abort).await else {
            debug!("[ENGINE] {} aborted while queued", id);
            let result = ExecutionResult::killed_before_start(id, language, accepted.elapsed());
            self.track_execution(&result, requester, template_id, snapshot.version());
            return Ok(result);
        };

        let policy_version = snapshot.version();
        let outcome = inner.executor.run(id, request, snapshot, &abort).await;
        drop(permit);
        let result = outcome?;

        info!(
            "[ENGINE] {} finished: {} in {:?}",
            id,
            result.status(),
            result.duration()
        );
        self.track_execution(&result, requester, template_id, policy_version);
        Ok(result)
    }

    /// Translate between the two languages. Never touches the sandbox.
    pub fn translate(&self, request: &TranslationRequest) -> TranslationResult {
        let result = self.inner.translator.translate(request);
        debug!(
            "[TRANSLATE] {} -> {}: {} diagnostics",
            result.source_lang,
            result.target_lang,
            result.diagnostics.len()
        );

        // Translation is usable without a runtime; only tracking needs one
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let tracker = self.inner.tracker.clone();
            let record = TranslationRecord {
                result: result.clone(),
                recorded_at: Utc::now(),
            };
            runtime.spawn(async move {
                if let Err(e) = tracker.record_translation(record).await {
                    warn!("[TRACKER] Failed to record translation: {}", e);
                }
            });
        }
        result
    }

    /// The policy currently applied to new requests in `language`
    pub fn get_security_policy(&self, language: Language) -> Result<SecurityPolicy> {
        self.inner
            .policies
            .current()
            .policy(language)
            .cloned()
            .ok_or_else(|| ValidationError::UnsupportedLanguage(language.to_string()).into())
    }

    /// Replace the policies for new requests. Requests already accepted keep
    /// the snapshot they were accepted under.
    pub fn reload_policies(&self, policies: PolicySet) -> Result<u64> {
        self.inner.policies.reload(policies)
    }

    pub fn reload_policies_from_file(&self, path: &Path) -> Result<u64> {
        self.inner.policies.reload_from_file(path)
    }

    /// Start a request from a stored template, translating it when the
    /// template is in the other language
    pub async fn request_from_template(
        &self,
        template_id: &str,
        language: Language,
    ) -> Result<ExecutionRequest> {
        let template = self
            .inner
            .templates
            .get(template_id)
            .await?
            .ok_or_else(|| EngineError::TemplateNotFound(template_id.to_string()))?;

        let source = if template.language == language {
            template.body
        } else {
            let translated = self.translate(&TranslationRequest::new(
                template.language,
                language,
                template.body,
            ));
            if !translated.is_valid() {
                return Err(EngineError::TemplateNotFound(format!(
                    "{} has no valid {} translation",
                    template_id, language
                )));
            }
            translated.target_code
        };
        Ok(ExecutionRequest::new(language, source).with_template_id(template_id))
    }

    fn track_execution(
        &self,
        result: &ExecutionResult,
        requester: String,
        template_id: Option<String>,
        policy_version: u64,
    ) {
        let tracker = self.inner.tracker.clone();
        let record = ExecutionRecord {
            result: result.clone(),
            requester,
            template_id,
            policy_version,
            recorded_at: Utc::now(),
        };
        tokio::spawn(async move {
            if let Err(e) = tracker.record_execution(record).await {
                warn!("[TRACKER] Failed to record execution: {}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PoolConfig, RateLimitConfig};
    use crate::engine::fake::{FakeBackend, Script};
    use crate::pool::InMemoryQuotaStore;
    use crate::templates::{CodeTemplate, InMemoryTemplateStore};
    use crate::tracker::{ChannelTracker, NullTracker, TrackerEvent};
    use crate::types::ExecutionStatus;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn config(max_concurrent: usize, max_queue_depth: usize) -> EngineConfig {
        EngineConfig {
            pool: PoolConfig {
                max_concurrent,
                max_queue_depth,
            },
            rate_limits: RateLimitConfig::unlimited(),
            ..EngineConfig::default()
        }
    }

    fn engine_with(
        config: EngineConfig,
        backend: Arc<FakeBackend>,
        tracker: Arc<dyn ExecutionTracker>,
    ) -> ExecutionEngine {
        let templates = InMemoryTemplateStore::new();
        templates.insert(CodeTemplate::new("hello", Language::Python, "print('hello')\n"));
        templates.insert(CodeTemplate::new("count", Language::Python, "x = 1\nprint(x)\n"));
        ExecutionEngine::from_parts(EngineParts {
            config,
            backend,
            policies: PolicyStore::new(PolicySet::default()).unwrap(),
            tracker,
            templates: Arc::new(templates),
            quota: Arc::new(InMemoryQuotaStore::default()),
        })
    }

    fn slow() -> Script {
        Script {
            run_for: Duration::from_secs(30),
            ..Script::default()
        }
    }

    async fn until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    async fn next_execution(events: &mut UnboundedReceiver<TrackerEvent>) -> ExecutionRecord {
        loop {
            match events.recv().await {
                Some(TrackerEvent::Execution(record)) => return record,
                Some(_) => continue,
                None => panic!("tracker channel closed"),
            }
        }
    }

    #[tokio::test]
    async fn test_full_queue_is_backpressure() {
        let backend = Arc::new(FakeBackend::new(slow()));
        let engine = engine_with(config(1, 0), backend.clone(), Arc::new(NullTracker));

        let running = CancellationToken::new();
        let first = {
            let engine = engine.clone();
            let abort = running.clone();
            tokio::spawn(async move {
                engine
                    .execute_with_abort(ExecutionRequest::new(Language::Python, "print(1)"), abort)
                    .await
            })
        };
        until(|| engine.pool_stats().running == 1).await;

        let refused = engine
            .execute(ExecutionRequest::new(Language::Python, "print(2)"))
            .await;
        assert!(matches!(refused, Err(EngineError::Backpressure { .. })));

        running.cancel();
        let first = first.await.unwrap().unwrap();
        assert_eq!(first.status(), ExecutionStatus::Killed);
        assert_eq!(backend.spawns(), 1);
    }

    #[tokio::test]
    async fn test_abort_while_queued_never_spawns() {
        let backend = Arc::new(FakeBackend::new(slow()));
        let engine = engine_with(config(1, 4), backend.clone(), Arc::new(NullTracker));

        let running = CancellationToken::new();
        let first = {
            let engine = engine.clone();
            let abort = running.clone();
            tokio::spawn(async move {
                engine
                    .execute_with_abort(ExecutionRequest::new(Language::Python, "print(1)"), abort)
                    .await
            })
        };
        until(|| engine.pool_stats().running == 1).await;

        let queued = CancellationToken::new();
        let second = {
            let engine = engine.clone();
            let abort = queued.clone();
            tokio::spawn(async move {
                engine
                    .execute_with_abort(ExecutionRequest::new(Language::Python, "print(2)"), abort)
                    .await
            })
        };
        until(|| engine.pool_stats().queued == 1).await;
        queued.cancel();

        let second = second.await.unwrap().unwrap();
        assert_eq!(second.status(), ExecutionStatus::Killed);
        assert_eq!(backend.spawns(), 1);
        assert_eq!(engine.pool_stats().queued, 0);

        running.cancel();
        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_accepted_request_keeps_its_policy_snapshot() {
        let backend = Arc::new(FakeBackend::new(slow()));
        let (tracker, mut events) = ChannelTracker::new();
        let engine = engine_with(config(1, 4), backend.clone(), Arc::new(tracker));

        let running = CancellationToken::new();
        let first = {
            let engine = engine.clone();
            let abort = running.clone();
            tokio::spawn(async move {
                engine
                    .execute_with_abort(ExecutionRequest::new(Language::Python, "print(1)"), abort)
                    .await
            })
        };
        until(|| engine.pool_stats().running == 1).await;

        let uses_json = "import json\nprint(json.dumps([1]))";
        let queued = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .execute(
                        ExecutionRequest::new(Language::Python, uses_json)
                            .with_timeout(Duration::from_millis(50)),
                    )
                    .await
            })
        };
        until(|| engine.pool_stats().queued == 1).await;

        let stricter = PolicySet::default().with_policy(
            Language::Python,
            SecurityPolicy::custom(SecurityPolicy::python_default())
                .block_import("json")
                .build(),
        );
        assert_eq!(engine.reload_policies(stricter).unwrap(), 2);
        running.cancel();
        assert_eq!(first.await.unwrap().unwrap().status(), ExecutionStatus::Killed);

        // Accepted under v1, so it runs
        let queued = queued.await.unwrap().unwrap();
        assert_eq!(queued.status(), ExecutionStatus::TimedOut);
        assert_eq!(backend.spawns(), 2);

        // New requests see v2
        let rejected = engine
            .execute(ExecutionRequest::new(Language::Python, uses_json))
            .await
            .unwrap();
        assert_eq!(rejected.status(), ExecutionStatus::SecurityViolation);
        assert_eq!(backend.spawns(), 2);

        let mut versions = Vec::new();
        for _ in 0..3 {
            let record = next_execution(&mut events).await;
            versions.push((record.result.id(), record.policy_version));
        }
        assert!(versions.contains(&(queued.id(), 1)));
        assert!(versions.contains(&(rejected.id(), 2)));
    }

    #[tokio::test]
    async fn test_tracker_receives_executions_and_translations() {
        let backend = Arc::new(FakeBackend::new(Script {
            stdout: b"hello\n".to_vec(),
            ..Script::default()
        }));
        let (tracker, mut events) = ChannelTracker::new();
        let engine = engine_with(config(2, 2), backend, Arc::new(tracker));

        let result = engine
            .execute(ExecutionRequest::new(Language::Python, "print('hello')").with_requester("alice"))
            .await
            .unwrap();
        let record = next_execution(&mut events).await;
        assert_eq!(record.result, result);
        assert_eq!(record.requester, "alice");
        assert_eq!(record.policy_version, 1);

        let translated = engine.translate(&TranslationRequest::new(
            Language::Python,
            Language::Graph,
            "x = 1\n",
        ));
        match events.recv().await {
            Some(TrackerEvent::Translation(record)) => assert_eq!(record.result, translated),
            other => panic!("expected a translation record, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rate_limit_is_checked_before_queueing() {
        let backend = Arc::new(FakeBackend::new(Script::default()));
        let mut config = config(2, 2);
        config.rate_limits = RateLimitConfig {
            per_minute: 2,
            per_hour: 10,
        };
        let engine = engine_with(config, backend.clone(), Arc::new(NullTracker));

        for _ in 0..2 {
            engine
                .execute(ExecutionRequest::new(Language::Python, "print(1)").with_requester("bob"))
                .await
                .unwrap();
        }
        let limited = engine
            .execute(ExecutionRequest::new(Language::Python, "print(1)").with_requester("bob"))
            .await;
        assert!(matches!(limited, Err(EngineError::RateLimited { limit: 2, .. })));
        assert_eq!(backend.spawns(), 2);

        engine
            .execute(ExecutionRequest::new(Language::Python, "print(1)").with_requester("carol"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_policy_inspection_and_failed_reload() {
        let engine = engine_with(
            config(1, 1),
            Arc::new(FakeBackend::new(Script::default())),
            Arc::new(NullTracker),
        );
        let python = engine.get_security_policy(Language::Python).unwrap();
        assert!(python.is_import_blocked("subprocess"));

        let bad = PolicySet::default().with_policy(
            Language::Python,
            SecurityPolicy::custom(SecurityPolicy::python_default())
                .block_pattern("(unclosed")
                .build(),
        );
        assert!(engine.reload_policies(bad).is_err());
        assert_eq!(engine.policy_snapshot().version(), 1);
    }

    #[tokio::test]
    async fn test_request_from_template() {
        let backend = Arc::new(FakeBackend::new(Script::default()));
        let engine = engine_with(config(1, 1), backend.clone(), Arc::new(NullTracker));

        let request = engine
            .request_from_template("hello", Language::Python)
            .await
            .unwrap();
        assert_eq!(request.source(), "print('hello')\n");
        assert_eq!(request.template_id(), Some("hello"));

        let translated = engine
            .request_from_template("count", Language::Graph)
            .await
            .unwrap();
        assert_eq!(translated.language(), Language::Graph);
        assert!(translated.source().contains("with entry"));

        assert!(matches!(
            engine.request_from_template("missing", Language::Python).await,
            Err(EngineError::TemplateNotFound(_))
        ));

        engine.execute(request).await.unwrap();
        assert_eq!(backend.sources(), vec!["print('hello')\n".to_string()]);
    }
}

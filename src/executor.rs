//! Runs one dequeued request through validation, policy check, spawn and
//! supervision, producing exactly one [`ExecutionResult`].

use crate::analyzer::Verdict;
use crate::engine::{IsolationBackend, LaunchSpec, SpawnedSandbox};
use crate::errors::{EngineError, Result, ValidationError};
use crate::governor::{ResourceGovernor, RunLimits};
use crate::policy::PolicySnapshot;
use crate::types::{ExecutionId, ExecutionRequest, ExecutionResult, ExecutionStatus};
use crate::validator::{SubmissionValidator, ValidatedRequest};
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle of one execution. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Queued,
    Validating,
    PolicyChecking,
    Spawning,
    Running,
    Completed,
    TimedOut,
    MemoryExceeded,
    Killed,
    InternalError,
    /// Refused before anything was spawned (invalid request or policy violation)
    Rejected,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Completed
                | ExecutionState::TimedOut
                | ExecutionState::MemoryExceeded
                | ExecutionState::Killed
                | ExecutionState::InternalError
                | ExecutionState::Rejected
        )
    }

    fn allows(&self, next: ExecutionState) -> bool {
        use ExecutionState::*;
        match (self, next) {
            (Queued, Validating | Killed) => true,
            (Validating, PolicyChecking | Rejected | Killed) => true,
            (PolicyChecking, Spawning | Rejected | Killed) => true,
            (Spawning, Running | InternalError | Killed) => true,
            (Running, Completed | TimedOut | MemoryExceeded | Killed | InternalError) => true,
            _ => false,
        }
    }

    /// Move to `next`, refusing transitions the lifecycle does not allow
    pub fn advance(&mut self, next: ExecutionState) -> Result<()> {
        if !self.allows(next) {
            return Err(EngineError::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            });
        }
        *self = next;
        Ok(())
    }
}

impl From<ExecutionStatus> for ExecutionState {
    fn from(status: ExecutionStatus) -> Self {
        match status {
            ExecutionStatus::Completed => ExecutionState::Completed,
            ExecutionStatus::TimedOut => ExecutionState::TimedOut,
            ExecutionStatus::MemoryExceeded => ExecutionState::MemoryExceeded,
            ExecutionStatus::Killed => ExecutionState::Killed,
            ExecutionStatus::SecurityViolation => ExecutionState::Rejected,
            ExecutionStatus::InternalError => ExecutionState::InternalError,
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Tracks the state of one execution and logs each transition
struct Lifecycle {
    id: ExecutionId,
    state: ExecutionState,
}

impl Lifecycle {
    fn new(id: ExecutionId) -> Self {
        Self {
            id,
            state: ExecutionState::Queued,
        }
    }

    fn advance(&mut self, next: ExecutionState) -> Result<()> {
        let from = self.state;
        self.state.advance(next)?;
        debug!("[EXECUTOR] {} {} -> {}", self.id, from, next);
        Ok(())
    }
}

pub struct SandboxExecutor {
    backend: Arc<dyn IsolationBackend>,
    validator: SubmissionValidator,
    governor: ResourceGovernor,
}

impl SandboxExecutor {
    pub fn new(
        backend: Arc<dyn IsolationBackend>,
        validator: SubmissionValidator,
        governor: ResourceGovernor,
    ) -> Self {
        Self {
            backend,
            validator,
            governor,
        }
    }

    pub fn backend(&self) -> &Arc<dyn IsolationBackend> {
        &self.backend
    }

    /// Take a dequeued request to a terminal state.
    ///
    /// `Err` is returned only for an invalid request; every other outcome,
    /// including policy rejection and backend failure, is a result.
    pub async fn run(
        &self,
        id: ExecutionId,
        request: ExecutionRequest,
        snapshot: Arc<PolicySnapshot>,
        abort: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let started = Instant::now();
        let language = request.language();
        let mut lifecycle = Lifecycle::new(id);

        if abort.is_cancelled() {
            lifecycle.advance(ExecutionState::Killed)?;
            return Ok(ExecutionResult::killed_before_start(id, language, started.elapsed()));
        }

        lifecycle.advance(ExecutionState::Validating)?;
        let validated = match self.validator.validate(request, &snapshot) {
            Ok(validated) => validated,
            Err(e) => {
                lifecycle.advance(ExecutionState::Rejected)?;
                debug!("[EXECUTOR] {} invalid: {}", id, e);
                return Err(e.into());
            }
        };

        lifecycle.advance(ExecutionState::PolicyChecking)?;
        let evaluator = snapshot
            .evaluator(language)
            .ok_or_else(|| ValidationError::UnsupportedLanguage(language.to_string()))?;
        if let Verdict::Violation(violation) = evaluator.evaluate(validated.source()) {
            lifecycle.advance(ExecutionState::Rejected)?;
            info!(
                "[POLICY] {} rejected under policy v{}: {}",
                id,
                snapshot.version(),
                violation
            );
            return Ok(ExecutionResult::security_violation(
                id,
                language,
                violation,
                started.elapsed(),
            ));
        }

        if abort.is_cancelled() {
            lifecycle.advance(ExecutionState::Killed)?;
            return Ok(ExecutionResult::killed_before_start(id, language, started.elapsed()));
        }

        lifecycle.advance(ExecutionState::Spawning)?;
        let sandbox = match self.spawn_with_retry(id, &validated).await {
            Ok(sandbox) => sandbox,
            Err(e) => {
                lifecycle.advance(ExecutionState::InternalError)?;
                warn!("[EXECUTOR] {} could not start a sandbox: {}", id, e);
                return Ok(ExecutionResult::internal_error(
                    id,
                    language,
                    e.to_string(),
                    started.elapsed(),
                ));
            }
        };

        lifecycle.advance(ExecutionState::Running)?;
        let limits = RunLimits {
            timeout: validated.timeout(),
            memory_limit_bytes: validated.memory_limit_bytes(),
            max_output_bytes: validated.max_output_bytes(),
        };
        match self.governor.supervise(id, sandbox, limits, abort).await {
            Ok(report) => {
                lifecycle.advance(report.status.into())?;
                Ok(ExecutionResult::from_report(id, language, report))
            }
            Err(e) => {
                lifecycle.advance(ExecutionState::InternalError)?;
                warn!("[EXECUTOR] {} sandbox failed: {}", id, e);
                Ok(ExecutionResult::internal_error(
                    id,
                    language,
                    e.to_string(),
                    started.elapsed(),
                ))
            }
        }
    }

    /// One transparent retry; a second failure is surfaced
    async fn spawn_with_retry(
        &self,
        id: ExecutionId,
        validated: &ValidatedRequest,
    ) -> Result<SpawnedSandbox> {
        let spec = LaunchSpec {
            execution_id: id,
            language: validated.language(),
            source: validated.source().to_string(),
            timeout: validated.timeout(),
            memory_limit_bytes: validated.memory_limit_bytes(),
        };
        match self.backend.spawn(&spec).await {
            Ok(sandbox) => Ok(sandbox),
            Err(first) => {
                warn!(
                    "[EXECUTOR] {} spawn on {} failed, retrying once: {}",
                    id,
                    self.backend.name(),
                    first
                );
                self.backend.spawn(&spec).await
            }
        }
    }
}

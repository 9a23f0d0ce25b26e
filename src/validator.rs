//! Request checks that need no sandbox: language support, source shape and
//! limit bounds.

use crate::config::EngineConfig;
use crate::errors::ValidationError;
use crate::policy::PolicySnapshot;
use crate::types::{ExecutionRequest, Language};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::debug;

/// A request that passed validation, with its limits clamped to the policy caps
#[derive(Debug, Clone)]
pub struct ValidatedRequest {
    request: ExecutionRequest,
    timeout: Duration,
    memory_limit_bytes: u64,
    max_output_bytes: usize,
    clamped: Vec<&'static str>,
}

impl ValidatedRequest {
    pub fn request(&self) -> &ExecutionRequest {
        &self.request
    }

    pub fn source(&self) -> &str {
        self.request.source()
    }

    pub fn language(&self) -> Language {
        self.request.language()
    }

    /// Effective timeout after clamping
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit_bytes
    }

    pub fn max_output_bytes(&self) -> usize {
        self.max_output_bytes
    }

    /// Names of the limits that were lowered to the policy cap
    pub fn clamped(&self) -> &[&'static str] {
        &self.clamped
    }
}

#[derive(Debug, Clone)]
pub struct SubmissionValidator {
    max_source_bytes: usize,
    interpreters: BTreeSet<Language>,
}

impl SubmissionValidator {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            max_source_bytes: config.max_source_bytes,
            interpreters: config.interpreters.iter().map(|i| i.language).collect(),
        }
    }

    pub fn validate(
        &self,
        request: ExecutionRequest,
        snapshot: &PolicySnapshot,
    ) -> Result<ValidatedRequest, ValidationError> {
        let language = request.language();
        let policy = match snapshot.policy(language) {
            Some(policy)
                if snapshot.evaluator(language).is_some()
                    && self.interpreters.contains(&language) =>
            {
                policy
            }
            _ => return Err(ValidationError::UnsupportedLanguage(language.to_string())),
        };

        if request.timeout().is_zero() {
            return Err(ValidationError::NonPositive { field: "timeout" });
        }
        if request.memory_limit_bytes() == 0 {
            return Err(ValidationError::NonPositive {
                field: "memory_limit_bytes",
            });
        }
        if request.max_output_bytes() == 0 {
            return Err(ValidationError::NonPositive {
                field: "max_output_bytes",
            });
        }

        let source = request.source();
        if source.trim().is_empty() {
            return Err(ValidationError::EmptySource);
        }
        if source.len() > self.max_source_bytes {
            return Err(ValidationError::SourceTooLarge {
                size: source.len(),
                max: self.max_source_bytes,
            });
        }
        if source.contains('\0') {
            return Err(ValidationError::NulByte);
        }

        let mut clamped = Vec::new();
        let timeout = clamp(request.timeout(), policy.max_time, "timeout", &mut clamped);
        let memory_limit_bytes = clamp(
            request.memory_limit_bytes(),
            policy.max_memory,
            "memory_limit_bytes",
            &mut clamped,
        );
        let max_output_bytes = clamp(
            request.max_output_bytes(),
            policy.max_output_size,
            "max_output_bytes",
            &mut clamped,
        );
        if !clamped.is_empty() {
            debug!("[VALIDATOR] Clamped {:?} to policy caps", clamped);
        }

        Ok(ValidatedRequest {
            request,
            timeout,
            memory_limit_bytes,
            max_output_bytes,
            clamped,
        })
    }
}

fn clamp<T: PartialOrd>(value: T, cap: T, field: &'static str, clamped: &mut Vec<&'static str>) -> T {
    if value > cap {
        clamped.push(field);
        cap
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{PolicySet, SecurityPolicy};

    fn snapshot() -> PolicySnapshot {
        PolicySnapshot::build(1, PolicySet::default()).unwrap()
    }

    fn validator() -> SubmissionValidator {
        SubmissionValidator::new(&EngineConfig::default())
    }

    #[test]
    fn test_accepts_and_keeps_limits_under_caps() {
        let req = ExecutionRequest::new(Language::Python, "print('hello')")
            .with_timeout(Duration::from_secs(2));
        let validated = validator().validate(req, &snapshot()).unwrap();
        assert_eq!(validated.timeout(), Duration::from_secs(2));
        assert!(validated.clamped().is_empty());
    }

    #[test]
    fn test_clamps_to_policy_caps() {
        let policies = PolicySet::default().with_policy(
            Language::Python,
            SecurityPolicy::custom(SecurityPolicy::python_default())
                .max_time(Duration::from_secs(3))
                .max_output_size(1024)
                .build(),
        );
        let snapshot = PolicySnapshot::build(1, policies).unwrap();
        let req = ExecutionRequest::new(Language::Python, "print(1)")
            .with_timeout(Duration::from_secs(60))
            .with_max_output(1_000_000);

        let validated = validator().validate(req, &snapshot).unwrap();
        assert_eq!(validated.timeout(), Duration::from_secs(3));
        assert_eq!(validated.max_output_bytes(), 1024);
        assert_eq!(validated.clamped(), &["timeout", "max_output_bytes"]);
    }

    #[test]
    fn test_rejects_malformed_requests() {
        let v = validator();
        let snap = snapshot();
        let cases = [
            (
                ExecutionRequest::new(Language::Python, "  \n\t"),
                ValidationError::EmptySource,
            ),
            (
                ExecutionRequest::new(Language::Python, "print(1)\0"),
                ValidationError::NulByte,
            ),
            (
                ExecutionRequest::new(Language::Python, "x").with_timeout(Duration::ZERO),
                ValidationError::NonPositive { field: "timeout" },
            ),
            (
                ExecutionRequest::new(Language::Python, "x").with_memory_limit(0),
                ValidationError::NonPositive {
                    field: "memory_limit_bytes",
                },
            ),
            (
                ExecutionRequest::new(Language::Python, "#".repeat(200 * 1024)),
                ValidationError::SourceTooLarge {
                    size: 200 * 1024,
                    max: 100 * 1024,
                },
            ),
        ];
        for (req, expected) in cases {
            assert_eq!(v.validate(req, &snap).unwrap_err(), expected);
        }
    }

    #[test]
    fn test_language_needs_policy_and_interpreter() {
        let python_only = PolicySnapshot::build(
            1,
            PolicySet::empty().with_policy(Language::Python, SecurityPolicy::python_default()),
        )
        .unwrap();
        let req = ExecutionRequest::new(Language::Graph, "with entry { print(1); }");
        assert!(matches!(
            validator().validate(req.clone(), &python_only),
            Err(ValidationError::UnsupportedLanguage(_))
        ));

        let mut config = EngineConfig::default();
        config.interpreters.retain(|i| i.language != Language::Graph);
        assert!(matches!(
            SubmissionValidator::new(&config).validate(req, &snapshot()),
            Err(ValidationError::UnsupportedLanguage(_))
        ));
    }
}

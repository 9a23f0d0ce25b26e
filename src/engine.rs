use crate::errors::Result;
use crate::types::{ExecutionId, Language};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::AsyncRead;

/// Everything a backend needs to start one program
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub execution_id: ExecutionId,
    pub language: Language,
    pub source: String,
    /// Wall-clock limit; backends may derive a CPU limit from it
    pub timeout: Duration,
    /// Memory ceiling in bytes
    pub memory_limit_bytes: u64,
}

/// Capabilities of an isolation backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendCapabilities {
    /// Backend name
    pub name: String,
    /// Whether `resident_memory` returns samples
    pub memory_sampling: bool,
    /// Whether the sandbox runs without network access
    pub network_isolation: bool,
    /// Whether `kill` reaches every process the program started
    pub group_kill: bool,
    /// Whether the program is kept out of host paths beyond its scratch
    /// directory and read-only runtime files
    pub filesystem_confinement: bool,
    /// Security level (0-10, 10 being most secure)
    pub security_level: u8,
}

/// How the sandboxed program ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitInfo {
    pub code: Option<i32>,
    /// Terminating signal, unix only
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Memory use of the sandboxed program
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySample {
    pub resident_bytes: u64,
    /// Resident high-water mark reported by the OS, when available
    pub peak_bytes: Option<u64>,
    /// Peak address space, the quantity an RLIMIT_AS ceiling bounds
    pub address_space_bytes: Option<u64>,
}

pub type OutputStream = Box<dyn AsyncRead + Send + Unpin>;

/// Control over one running sandbox. All methods take `&self` so the
/// governor can sample and kill while a `wait` is pending.
#[async_trait]
pub trait SandboxHandle: Send + Sync {
    /// OS process id, if the backend has one
    fn id(&self) -> Option<u32>;

    /// Resolve when the program exits
    async fn wait(&self) -> Result<ExitInfo>;

    /// Kill the program and everything it started. Killing an exited
    /// sandbox is not an error.
    fn kill(&self) -> Result<()>;

    fn resident_memory(&self) -> Option<MemorySample>;
}

/// A started program: its output streams and its control handle
pub struct SpawnedSandbox {
    pub stdout: OutputStream,
    pub stderr: OutputStream,
    pub handle: Box<dyn SandboxHandle>,
}

/// Trait for isolation backends (OS process, container, VM)
#[async_trait]
pub trait IsolationBackend: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> BackendCapabilities;

    /// Start the program described by `spec`. Errors mean no sandbox exists.
    async fn spawn(&self, spec: &LaunchSpec) -> Result<SpawnedSandbox>;
}

/// Scripted backend for unit tests: counts spawns, can fail the first few,
/// and runs a "program" that prints fixed output and exits after a delay
/// unless killed first.
#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use crate::errors::EngineError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    #[derive(Debug, Clone)]
    pub struct Script {
        pub stdout: Vec<u8>,
        pub stderr: Vec<u8>,
        pub exit_code: i32,
        pub run_for: Duration,
        pub resident_bytes: Option<u64>,
        pub address_space_bytes: Option<u64>,
    }

    impl Default for Script {
        fn default() -> Self {
            Self {
                stdout: Vec::new(),
                stderr: Vec::new(),
                exit_code: 0,
                run_for: Duration::from_millis(10),
                resident_bytes: None,
                address_space_bytes: None,
            }
        }
    }

    pub struct FakeBackend {
        script: Script,
        failures: AtomicUsize,
        spawns: Arc<AtomicUsize>,
        sources: std::sync::Mutex<Vec<String>>,
    }

    impl FakeBackend {
        pub fn new(script: Script) -> Self {
            Self {
                script,
                failures: AtomicUsize::new(0),
                spawns: Arc::new(AtomicUsize::new(0)),
                sources: std::sync::Mutex::new(Vec::new()),
            }
        }

        /// Fail the next `n` spawn attempts
        pub fn failing(self, n: usize) -> Self {
            self.failures.store(n, Ordering::SeqCst);
            self
        }

        pub fn spawns(&self) -> usize {
            self.spawns.load(Ordering::SeqCst)
        }

        pub fn sources(&self) -> Vec<String> {
            self.sources.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl IsolationBackend for FakeBackend {
        fn name(&self) -> &str {
            "fake"
        }

        fn capabilities(&self) -> BackendCapabilities {
            BackendCapabilities {
                name: "fake".to_string(),
                memory_sampling: self.script.resident_bytes.is_some(),
                network_isolation: true,
                group_kill: true,
                filesystem_confinement: true,
                security_level: 0,
            }
        }

        async fn spawn(&self, spec: &LaunchSpec) -> Result<SpawnedSandbox> {
            self.spawns.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(EngineError::Backend("scripted spawn failure".to_string()));
            }
            self.sources.lock().unwrap().push(spec.source.clone());
            Ok(SpawnedSandbox {
                stdout: Box::new(std::io::Cursor::new(self.script.stdout.clone())),
                stderr: Box::new(std::io::Cursor::new(self.script.stderr.clone())),
                handle: Box::new(FakeHandle {
                    script: self.script.clone(),
                    killed: CancellationToken::new(),
                }),
            })
        }
    }

    struct FakeHandle {
        script: Script,
        killed: CancellationToken,
    }

    #[async_trait]
    impl SandboxHandle for FakeHandle {
        fn id(&self) -> Option<u32> {
            None
        }

        async fn wait(&self) -> Result<ExitInfo> {
            tokio::select! {
                _ = self.killed.cancelled() => Ok(ExitInfo { code: None, signal: Some(9) }),
                _ = tokio::time::sleep(self.script.run_for) => {
                    if self.killed.is_cancelled() {
                        Ok(ExitInfo { code: None, signal: Some(9) })
                    } else {
                        Ok(ExitInfo { code: Some(self.script.exit_code), signal: None })
                    }
                }
            }
        }

        fn kill(&self) -> Result<()> {
            self.killed.cancel();
            Ok(())
        }

        fn resident_memory(&self) -> Option<MemorySample> {
            self.script.resident_bytes.map(|resident_bytes| MemorySample {
                resident_bytes,
                peak_bytes: None,
                address_space_bytes: self.script.address_space_bytes,
            })
        }
    }
}

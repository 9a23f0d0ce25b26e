//! Watches one running sandbox: wall-clock deadline, memory ceiling, abort
//! token and bounded output capture.

use crate::config::EngineConfig;
use crate::engine::{ExitInfo, OutputStream, SandboxHandle, SpawnedSandbox};
use crate::errors::{EngineError, Result};
use crate::types::{ExecutionId, ExecutionStatus, RunReport};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[cfg(unix)]
const SIGKILL: i32 = libc::SIGKILL;
#[cfg(unix)]
const SIGSEGV: i32 = libc::SIGSEGV;
#[cfg(unix)]
const SIGXCPU: i32 = libc::SIGXCPU;
#[cfg(not(unix))]
const SIGKILL: i32 = 9;
#[cfg(not(unix))]
const SIGSEGV: i32 = 11;
#[cfg(not(unix))]
const SIGXCPU: i32 = 24;

/// Output kept up to a byte limit; the rest is read and discarded
#[derive(Debug, Default)]
pub(crate) struct BoundedBuffer {
    data: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl BoundedBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            data: Vec::with_capacity(limit.min(64 * 1024)),
            limit,
            truncated: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.data.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.data.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Decode as UTF-8. A code point cut in half by the limit is dropped;
    /// other invalid sequences are replaced.
    pub fn to_text(&self) -> String {
        let mut bytes = self.data.as_slice();
        if self.truncated {
            if let Err(e) = std::str::from_utf8(bytes) {
                if e.error_len().is_none() {
                    bytes = &bytes[..e.valid_up_to()];
                }
            }
        }
        String::from_utf8_lossy(bytes).into_owned()
    }
}

type SharedBuffer = Arc<Mutex<BoundedBuffer>>;

fn capture(mut stream: OutputStream, limit: usize) -> (SharedBuffer, JoinHandle<()>) {
    let buffer: SharedBuffer = Arc::new(Mutex::new(BoundedBuffer::new(limit)));
    let sink = buffer.clone();
    let task = tokio::spawn(async move {
        let mut chunk = vec![0u8; 8192];
        loop {
            match stream.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => sink
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(&chunk[..n]),
                Err(e) => {
                    debug!("[GOVERNOR] Output stream closed with error: {}", e);
                    break;
                }
            }
        }
    });
    (buffer, task)
}

/// Limits enforced on one run
#[derive(Debug, Clone, Copy)]
pub struct RunLimits {
    pub timeout: Duration,
    pub memory_limit_bytes: u64,
    pub max_output_bytes: usize,
}

/// Why the governor killed the sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KillReason {
    Deadline,
    Memory,
    Abort,
}

#[derive(Debug, Clone)]
pub struct ResourceGovernor {
    memory_poll_interval: Duration,
    drain_grace: Duration,
    reap_timeout: Duration,
}

impl ResourceGovernor {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            memory_poll_interval: config.memory_poll_interval,
            drain_grace: config.drain_grace,
            reap_timeout: config.backend_slack,
        }
    }

    /// Supervise `sandbox` until it exits or is killed. Errors are backend
    /// faults; every limit breach is a report status.
    pub async fn supervise(
        &self,
        id: ExecutionId,
        sandbox: SpawnedSandbox,
        limits: RunLimits,
        abort: &CancellationToken,
    ) -> Result<RunReport> {
        let started = Instant::now();
        let SpawnedSandbox {
            stdout,
            stderr,
            handle,
        } = sandbox;
        let (stdout_buf, stdout_task) = capture(stdout, limits.max_output_bytes);
        let (stderr_buf, stderr_task) = capture(stderr, limits.max_output_bytes);

        let mut peak_memory: Option<u64> = None;
        let mut address_space: Option<u64> = None;
        let mut ticker = tokio::time::interval(self.memory_poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let deadline = tokio::time::sleep_until(started + limits.timeout);
        tokio::pin!(deadline);

        let wait = handle.wait();
        tokio::pin!(wait);

        let mut killed: Option<KillReason> = None;
        let mut reap_deadline: Option<Instant> = None;
        let exit = loop {
            tokio::select! {
                exit = &mut wait => break exit,
                _ = abort.cancelled(), if killed.is_none() => {
                    debug!("[GOVERNOR] {} aborted", id);
                    killed = Some(KillReason::Abort);
                }
                _ = &mut deadline, if killed.is_none() => {
                    debug!("[GOVERNOR] {} reached its {:?} deadline", id, limits.timeout);
                    killed = Some(KillReason::Deadline);
                }
                _ = ticker.tick() => {
                    if let Some(sample) = handle.resident_memory() {
                        let peak = sample.peak_bytes.unwrap_or(0).max(sample.resident_bytes);
                        peak_memory = Some(peak_memory.unwrap_or(0).max(peak));
                        let reserved = sample.address_space_bytes.unwrap_or(0).max(peak);
                        address_space = Some(address_space.unwrap_or(0).max(reserved));
                        if killed.is_none() && sample.resident_bytes > limits.memory_limit_bytes {
                            debug!(
                                "[GOVERNOR] {} resident memory {} over limit {}",
                                id, sample.resident_bytes, limits.memory_limit_bytes
                            );
                            killed = Some(KillReason::Memory);
                        }
                    }
                    if reap_deadline.is_some_and(|at| Instant::now() > at) {
                        break Err(EngineError::Backend(format!(
                            "sandbox {} did not exit after being killed",
                            id
                        )));
                    }
                }
            }
            if killed.is_some() && reap_deadline.is_none() {
                kill(handle.as_ref(), id);
                reap_deadline = Some(Instant::now() + self.reap_timeout);
            }
        };
        let duration = started.elapsed();

        // Anything the program left running in its group, and the readers
        // blocked on pipes those processes hold
        kill(handle.as_ref(), id);
        let mut readers = [stdout_task, stderr_task];
        let drained = tokio::time::timeout(self.drain_grace, async {
            for reader in readers.iter_mut() {
                let _ = reader.await;
            }
        })
        .await;
        if drained.is_err() {
            warn!("[GOVERNOR] {} output pipes still open after exit, discarding", id);
            for reader in &readers {
                reader.abort();
            }
        }

        let exit = exit?;
        let (stdout, stdout_truncated) = take(&stdout_buf);
        let (stderr, stderr_truncated) = take(&stderr_buf);
        let close_to_limit = near_ceiling(address_space, limits.memory_limit_bytes);
        let status = classify(killed, &exit, &stderr, close_to_limit);

        debug!(
            "[GOVERNOR] {} finished: {} in {:?} (exit {:?}, signal {:?})",
            id, status, duration, exit.code, exit.signal
        );

        Ok(RunReport {
            status,
            stdout,
            stderr,
            exit_code: exit.code,
            signal: exit.signal,
            duration,
            peak_memory_bytes: peak_memory,
            truncated: stdout_truncated || stderr_truncated,
        })
    }
}

fn kill(handle: &dyn SandboxHandle, id: ExecutionId) {
    if let Err(e) = handle.kill() {
        warn!("[GOVERNOR] Failed to kill sandbox {}: {}", id, e);
    }
}

fn take(buffer: &SharedBuffer) -> (String, bool) {
    let buffer = buffer.lock().unwrap_or_else(PoisonError::into_inner);
    (buffer.to_text(), buffer.truncated())
}

/// Whether the program was seen within a quarter of its memory ceiling
fn near_ceiling(observed: Option<u64>, limit: u64) -> bool {
    observed.is_some_and(|bytes| bytes >= limit - limit / 4)
}

/// `near_ceiling` separates a failed allocation from a `MemoryError` the
/// program raised itself
fn classify(
    killed: Option<KillReason>,
    exit: &ExitInfo,
    stderr: &str,
    near_ceiling: bool,
) -> ExecutionStatus {
    match killed {
        Some(KillReason::Abort) => return ExecutionStatus::Killed,
        Some(KillReason::Deadline) => return ExecutionStatus::TimedOut,
        Some(KillReason::Memory) => return ExecutionStatus::MemoryExceeded,
        None => {}
    }
    match exit.signal {
        Some(SIGXCPU) => ExecutionStatus::TimedOut,
        // Not sent by us: the kernel (RLIMIT_CPU hard limit or OOM) or a failed allocation
        Some(SIGKILL) | Some(SIGSEGV) => ExecutionStatus::MemoryExceeded,
        _ if near_ceiling && !exit.success() && stderr.contains("MemoryError") => {
            ExecutionStatus::MemoryExceeded
        }
        _ => ExecutionStatus::Completed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_buffer_truncates_exactly() {
        let mut buf = BoundedBuffer::new(10);
        buf.push(b"hello ");
        buf.push(b"world, again");
        assert!(buf.truncated());
        assert_eq!(buf.to_text(), "hello worl");
    }

    #[test]
    fn test_cut_code_point_is_dropped() {
        let mut buf = BoundedBuffer::new(4);
        buf.push("ab\u{e9}\u{e9}".as_bytes()); // a b C3 A9 C3 A9
        assert_eq!(buf.to_text(), "ab\u{e9}");

        let mut buf = BoundedBuffer::new(3);
        buf.push("ab\u{e9}".as_bytes());
        assert_eq!(buf.to_text(), "ab");
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let mut buf = BoundedBuffer::new(16);
        buf.push(&[b'o', b'k', 0xff, b'!']);
        assert!(!buf.truncated());
        assert_eq!(buf.to_text(), "ok\u{fffd}!");
    }

    #[test]
    fn test_classification() {
        let exited = |code: Option<i32>, signal: Option<i32>| ExitInfo { code, signal };
        assert_eq!(
            classify(None, &exited(Some(1), None), "Traceback\nMemoryError\n", true),
            ExecutionStatus::MemoryExceeded
        );
        assert_eq!(
            classify(None, &exited(Some(1), None), "ZeroDivisionError", true),
            ExecutionStatus::Completed
        );
        assert_eq!(
            classify(None, &exited(None, Some(SIGXCPU)), "", false),
            ExecutionStatus::TimedOut
        );
        assert_eq!(
            classify(Some(KillReason::Abort), &exited(None, Some(SIGKILL)), "", false),
            ExecutionStatus::Killed
        );
        assert_eq!(
            classify(Some(KillReason::Deadline), &exited(None, Some(SIGKILL)), "", false),
            ExecutionStatus::TimedOut
        );
    }

    #[test]
    fn test_raised_memory_error_far_from_the_ceiling_is_completed() {
        let failed = ExitInfo {
            code: Some(1),
            signal: None,
        };
        let stderr = "Traceback (most recent call last):\nMemoryError: student raised this\n";
        assert_eq!(
            classify(None, &failed, stderr, false),
            ExecutionStatus::Completed
        );
    }

    #[test]
    fn test_near_ceiling() {
        let limit = 64 * 1024 * 1024;
        assert!(!near_ceiling(None, limit));
        assert!(!near_ceiling(Some(20 * 1024 * 1024), limit));
        assert!(near_ceiling(Some(48 * 1024 * 1024), limit));
        assert!(near_ceiling(Some(limit + 1), limit));
    }
}

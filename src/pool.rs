//! Admission control: bounded concurrency with a bounded wait queue, and
//! per-requester rate limits over a pluggable quota store.

use crate::config::{PoolConfig, RateLimitConfig};
use crate::errors::{EngineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

// ============================================================================
// Worker pool
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub max_concurrent: usize,
    pub running: usize,
    pub queued: usize,
    pub max_queue_depth: usize,
}

/// Bounds how many sandboxes run at once and how many requests may wait
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    waiting: Arc<AtomicUsize>,
    max_concurrent: usize,
    max_queue_depth: usize,
}

impl WorkerPool {
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(config.max_concurrent)),
            waiting: Arc::new(AtomicUsize::new(0)),
            max_concurrent: config.max_concurrent,
            max_queue_depth: config.max_queue_depth,
        }
    }

    /// Take a free slot, or a place in the queue. A full queue is refused
    /// immediately.
    pub fn admit(&self) -> Result<Admission> {
        if let Ok(permit) = self.permits.clone().try_acquire_owned() {
            return Ok(Admission::Ready(permit));
        }
        let limit = self.max_queue_depth;
        match self
            .waiting
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < limit).then_some(n + 1)
            }) {
            Ok(depth) => {
                debug!("[POOL] Queued at depth {}", depth + 1);
                Ok(Admission::Queued(QueueTicket {
                    permits: self.permits.clone(),
                    waiting: self.waiting.clone(),
                }))
            }
            Err(depth) => Err(EngineError::Backpressure { depth }),
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            max_concurrent: self.max_concurrent,
            running: self
                .max_concurrent
                .saturating_sub(self.permits.available_permits()),
            queued: self.waiting.load(Ordering::SeqCst),
            max_queue_depth: self.max_queue_depth,
        }
    }
}

/// A request accepted by the pool
#[derive(Debug)]
pub enum Admission {
    Ready(OwnedSemaphorePermit),
    Queued(QueueTicket),
}

impl Admission {
    pub fn is_queued(&self) -> bool {
        matches!(self, Admission::Queued(_))
    }

    /// Wait for a slot. `None` if `abort` fired first; the queue place is
    /// released either way.
    pub async fn wait(self, abort: &CancellationToken) -> Option<OwnedSemaphorePermit> {
        match self {
            Admission::Ready(permit) => Some(permit),
            Admission::Queued(ticket) => {
                let permit = tokio::select! {
                    permit = ticket.permits.clone().acquire_owned() => permit.ok(),
                    _ = abort.cancelled() => None,
                };
                drop(ticket);
                permit
            }
        }
    }
}

/// A place in the wait queue, given back on drop
#[derive(Debug)]
pub struct QueueTicket {
    permits: Arc<Semaphore>,
    waiting: Arc<AtomicUsize>,
}

impl Drop for QueueTicket {
    fn drop(&mut self) {
        self.waiting.fetch_sub(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Quota store
// ============================================================================

/// Where per-requester submission times are kept
#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Submissions by `requester` at or after `since`
    async fn count_since(&self, requester: &str, since: DateTime<Utc>) -> Result<u32>;

    async fn record(&self, requester: &str, at: DateTime<Utc>) -> Result<()>;
}

/// Process-local quota store. Entries older than `retention` are pruned on
/// every write, and requesters left with no entries are forgotten.
#[derive(Debug)]
pub struct InMemoryQuotaStore {
    entries: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
    retention: chrono::Duration,
}

impl Default for InMemoryQuotaStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}

impl InMemoryQuotaStore {
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            retention: chrono::Duration::from_std(retention)
                .unwrap_or_else(|_| chrono::Duration::hours(1)),
        }
    }

    #[cfg(test)]
    fn tracked_requesters(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl QuotaStore for InMemoryQuotaStore {
    async fn count_since(&self, requester: &str, since: DateTime<Utc>) -> Result<u32> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let count = entries
            .get(requester)
            .map(|times| times.iter().filter(|t| **t >= since).count())
            .unwrap_or(0);
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn record(&self, requester: &str, at: DateTime<Utc>) -> Result<()> {
        let cutoff = at - self.retention;
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|_, times| {
            while times.front().is_some_and(|t| *t < cutoff) {
                times.pop_front();
            }
            !times.is_empty()
        });
        entries.entry(requester.to_string()).or_default().push_back(at);
        Ok(())
    }
}

// ============================================================================
// Rate limiter
// ============================================================================

/// Sliding-window limits per requester. Store failures let the request
/// through.
pub struct RateLimiter {
    store: Arc<dyn QuotaStore>,
    windows: Vec<(u32, Duration)>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn QuotaStore>, limits: &RateLimitConfig) -> Self {
        let windows = [
            (limits.per_minute, Duration::from_secs(60)),
            (limits.per_hour, Duration::from_secs(3600)),
        ]
        .into_iter()
        .filter(|(limit, _)| *limit != u32::MAX)
        .collect();
        Self { store, windows }
    }

    pub async fn check(&self, requester: &str) -> Result<()> {
        let now = Utc::now();
        for &(limit, window) in &self.windows {
            let since = now - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::hours(1));
            match self.store.count_since(requester, since).await {
                Ok(count) if count >= limit => {
                    debug!(
                        "[POOL] {} over {} per {:?} ({} recent)",
                        requester, limit, window, count
                    );
                    return Err(EngineError::RateLimited {
                        requester: requester.to_string(),
                        limit,
                        window,
                    });
                }
                Ok(_) => {}
                Err(e) => warn!("[POOL] Quota store unavailable, allowing {}: {}", requester, e),
            }
        }
        Ok(())
    }

    pub async fn record(&self, requester: &str) {
        if self.windows.is_empty() {
            return;
        }
        if let Err(e) = self.store.record(requester, Utc::now()).await {
            warn!("[POOL] Failed to record usage for {}: {}", requester, e);
        }
    }
}

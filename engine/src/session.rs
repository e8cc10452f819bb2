//! Per-run context.
//!
//! A `RunContext` is created when a pipeline or verification call starts and
//! dropped when it returns its `Summary` or verdicts. It carries the run id used
//! in log events, the start time, counters shared by all workers, and the
//! cancellation signal.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Cooperative cancellation signal, cloneable across threads.
///
/// Workers check it between units, never in the middle of a copy.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Context for exactly one run.
#[derive(Debug)]
pub struct RunContext {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    started: Instant,
    cancel: CancellationToken,
    bytes_moved: AtomicU64,
    retries: AtomicU64,
    copy_attempts: AtomicU64,
}

impl RunContext {
    pub fn new(cancel: CancellationToken) -> Self {
        RunContext {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            started: Instant::now(),
            cancel,
            bytes_moved: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            copy_attempts: AtomicU64::new(0),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn add_bytes(&self, bytes: u64) {
        self.bytes_moved.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_attempt(&self, attempt: u32) {
        self.copy_attempts.fetch_add(1, Ordering::Relaxed);
        if attempt > 1 {
            self.retries.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn bytes_moved(&self) -> u64 {
        self.bytes_moved.load(Ordering::Relaxed)
    }

    /// Copy attempts after the first for the same unit.
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn copy_attempts(&self) -> u64 {
        self.copy_attempts.load(Ordering::Relaxed)
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_shared_between_clones() {
        let token = CancellationToken::new();
        let ctx = RunContext::new(token.clone());
        assert!(!ctx.is_cancelled());
        token.cancel();
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn test_counters() {
        let ctx = RunContext::default();
        ctx.record_attempt(1);
        ctx.record_attempt(2);
        ctx.record_attempt(1);
        ctx.add_bytes(10);
        ctx.add_bytes(5);
        assert_eq!(ctx.copy_attempts(), 3);
        assert_eq!(ctx.retries(), 1);
        assert_eq!(ctx.bytes_moved(), 15);
    }
}

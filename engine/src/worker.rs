//! Bounded worker pool.
//!
//! Items are fed through a bounded channel to a fixed number of scoped
//! threads. Cancellation is checked before each item is started; an item
//! already in progress always runs to completion.

use std::time::Duration;

use crossbeam_channel::bounded;

use crate::session::CancellationToken;

/// Upper bound on a single retry delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Delay before retry number `retry` (1-based): `base * 2^(retry - 1)`, capped.
pub fn backoff_delay(base: Duration, retry: u32) -> Duration {
    let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
    base.checked_mul(factor)
        .map_or(MAX_BACKOFF, |delay| delay.min(MAX_BACKOFF))
}

/// Run `work` over `items` on `concurrency` threads.
///
/// Results come back in completion order. Items not started before
/// cancellation are dropped without a result.
pub fn run_pool<T, R, F>(
    items: Vec<T>,
    concurrency: usize,
    cancel: &CancellationToken,
    work: F,
) -> Vec<R>
where
    T: Send,
    R: Send,
    F: Fn(T) -> R + Sync,
{
    let workers = concurrency.max(1).min(items.len().max(1));
    let (job_tx, job_rx) = bounded::<T>(workers * 2);
    let (result_tx, result_rx) = crossbeam_channel::unbounded::<R>();
    let work = &work;

    std::thread::scope(|scope| {
        for _ in 0..workers {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            scope.spawn(move || {
                for item in job_rx.iter() {
                    if cancel.is_cancelled() {
                        continue;
                    }
                    if result_tx.send(work(item)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(result_tx);

        for item in items {
            if cancel.is_cancelled() || job_tx.send(item).is_err() {
                break;
            }
        }
        drop(job_tx);
    });

    result_rx.try_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_millis(250);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(250));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(1000));
        assert_eq!(backoff_delay(base, 20), MAX_BACKOFF);
        assert_eq!(backoff_delay(base, 64), MAX_BACKOFF);
        assert_eq!(backoff_delay(Duration::ZERO, 5), Duration::ZERO);
    }

    #[test]
    fn test_all_items_processed() {
        let cancel = CancellationToken::new();
        let mut results = run_pool((0..100u64).collect(), 4, &cancel, |n| n * 2);
        results.sort_unstable();
        assert_eq!(results, (0..100u64).map(|n| n * 2).collect::<Vec<_>>());
    }

    #[test]
    fn test_concurrency_is_bounded() {
        let cancel = CancellationToken::new();
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        run_pool((0..64).collect::<Vec<u32>>(), 3, &cancel, |_| {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(2));
            active.fetch_sub(1, Ordering::SeqCst);
        });
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn test_cancel_stops_new_items() {
        let cancel = CancellationToken::new();
        let results = run_pool((0..1000u32).collect(), 2, &cancel, |n| {
            if n == 5 {
                cancel.cancel();
            }
            n
        });
        assert!(results.contains(&5));
        assert!(results.len() < 1000);
    }

    #[test]
    fn test_empty_input() {
        let cancel = CancellationToken::new();
        let results: Vec<u8> = run_pool(Vec::<u8>::new(), 8, &cancel, |n| n);
        assert!(results.is_empty());
    }
}

//! Admission primitives: a counting permit gate and a minimum-interval pacer.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::safety::{GovernedError, GovernedResult, SafetyLimit};

/// Bounds how many governed computations may hold a permit at once.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    max: usize,
    active: Arc<AtomicUsize>,
    peak: AtomicUsize,
}

/// A held permit. Dropping it releases the permit on every exit path.
#[derive(Debug)]
pub struct ConcurrencyPermit {
    _permit: OwnedSemaphorePermit,
    active: Arc<AtomicUsize>,
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ConcurrencyLimiter {
    pub fn new(max: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max)),
            max,
            active: Arc::new(AtomicUsize::new(0)),
            peak: AtomicUsize::new(0),
        }
    }

    /// Wait for a permit, giving up after `wait_timeout` with a `ConcurrencyTimeout`.
    pub async fn acquire(&self, wait_timeout: Option<Duration>) -> GovernedResult<ConcurrencyPermit> {
        let started = Instant::now();
        let acquire = self.semaphore.clone().acquire_owned();

        let permit = match wait_timeout {
            Some(limit) => match tokio::time::timeout(limit, acquire).await {
                Ok(permit) => permit,
                Err(_) => {
                    tracing::error!(
                        waited_ms = started.elapsed().as_millis() as u64,
                        max_concurrency = self.max,
                        "Timed out waiting for a concurrency permit"
                    );
                    return Err(SafetyLimit::concurrency_timeout(started.elapsed(), self.max).into());
                }
            },
            None => acquire.await,
        }
        // The semaphore is never closed.
        .map_err(|_| GovernedError::TaskTerminated)?;

        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_active, Ordering::SeqCst);
        tracing::trace!(
            active = now_active,
            waited_ms = started.elapsed().as_millis() as u64,
            "Acquired concurrency permit"
        );

        Ok(ConcurrencyPermit {
            _permit: permit,
            active: self.active.clone(),
        })
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// Enforces a floor on the spacing between successive remote call starts.
///
/// The lock is held across the sleep, so callers leave `pace` one at a time and in order.
#[derive(Debug)]
pub struct IntervalPacer {
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl IntervalPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_call: Mutex::new(None),
        }
    }

    /// Wait until at least `min_interval` has passed since the previous call start.
    pub async fn pace(&self) {
        let mut last_call = self.last_call.lock().await;
        if let Some(previous) = *last_call {
            let earliest = previous + self.min_interval;
            if earliest > Instant::now() {
                tracing::trace!(
                    wait_ms = earliest.saturating_duration_since(Instant::now()).as_millis() as u64,
                    "Pacing remote call"
                );
                tokio::time::sleep_until(earliest).await;
            }
        }
        *last_call = Some(Instant::now());
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safety::SafetyLimitKind;

    #[tokio::test]
    async fn test_permits_are_released_on_drop() {
        let limiter = ConcurrencyLimiter::new(2);
        let a = limiter.acquire(None).await.unwrap();
        let b = limiter.acquire(None).await.unwrap();
        assert_eq!(limiter.active(), 2);
        assert_eq!(limiter.available(), 0);

        drop(a);
        assert_eq!(limiter.active(), 1);
        assert_eq!(limiter.available(), 1);
        drop(b);
        assert_eq!(limiter.active(), 0);
        assert_eq!(limiter.peak(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out_with_safety_limit() {
        let limiter = ConcurrencyLimiter::new(1);
        let _held = limiter.acquire(None).await.unwrap();

        let err = limiter
            .acquire(Some(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert_eq!(err.safety_limit(), SafetyLimitKind::ConcurrencyTimeout);
        assert_eq!(limiter.active(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permit_released_when_task_panics() {
        let limiter = Arc::new(ConcurrencyLimiter::new(1));
        let task_limiter = limiter.clone();
        let handle = tokio::spawn(async move {
            let _permit = task_limiter.acquire(None).await.unwrap();
            panic!("work blew up");
        });
        assert!(handle.await.is_err());

        assert_eq!(limiter.active(), 0);
        let _again = limiter
            .acquire(Some(Duration::from_millis(10)))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacer_spaces_calls() {
        let pacer = IntervalPacer::new(Duration::from_millis(100));
        let start = Instant::now();
        let mut starts = Vec::new();
        for _ in 0..4 {
            pacer.pace().await;
            starts.push(start.elapsed());
        }
        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(100));
        }
        assert_eq!(starts[0], Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacer_does_not_wait_after_idle_gap() {
        let pacer = IntervalPacer::new(Duration::from_millis(100));
        pacer.pace().await;
        tokio::time::advance(Duration::from_millis(250)).await;
        let before = Instant::now();
        pacer.pace().await;
        assert_eq!(before.elapsed(), Duration::ZERO);
    }
}

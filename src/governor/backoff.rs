//! Shared rate-limit backoff.
//!
//! A rate-limit signal means the whole connection to the remote account is throttled, so
//! the ban applies to every caller of the governor rather than to one fingerprint.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct BackoffState {
    banned_until: Option<Instant>,
    consecutive_failures: u32,
}

/// Tracks the shared "banned until" instant and the consecutive rate-limit counter.
///
/// Both fields live behind one lock so that the check-then-extend on a rate-limit hit is a
/// single critical section.
#[derive(Debug)]
pub struct BackoffController {
    state: Mutex<BackoffState>,
    base: Duration,
    ceiling: Duration,
}

impl BackoffController {
    pub fn new(base: Duration, ceiling: Duration) -> Self {
        Self {
            state: Mutex::new(BackoffState::default()),
            base,
            ceiling,
        }
    }

    /// Suspend until no backoff window is active.
    ///
    /// Re-checks after every sleep because another task may have extended the window.
    pub async fn wait(&self) {
        loop {
            let banned_until = self.state.lock().banned_until;
            match banned_until {
                Some(until) if until > Instant::now() => {
                    tracing::debug!(
                        remaining_ms = until.saturating_duration_since(Instant::now()).as_millis() as u64,
                        "Waiting out shared backoff window"
                    );
                    tokio::time::sleep_until(until).await;
                }
                _ => return,
            }
        }
    }

    /// Record a rate-limit signal and extend the shared window.
    ///
    /// The window is `min(ceiling, base * 2^consecutive_failures)` from now. The stored
    /// instant never moves backwards while failures are consecutive. Returns the window
    /// that was computed for this hit.
    pub fn record_rate_limit_hit(&self) -> Duration {
        let mut state = self.state.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        let window = self.window_for(state.consecutive_failures);
        let candidate = Instant::now() + window;
        state.banned_until = Some(match state.banned_until {
            Some(existing) if existing > candidate => existing,
            _ => candidate,
        });

        tracing::warn!(
            consecutive_failures = state.consecutive_failures,
            backoff_ms = window.as_millis() as u64,
            "Rate limit detected, extending shared backoff"
        );
        window
    }

    /// Reset the consecutive-failure counter. Any success resets it fully.
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        if state.consecutive_failures > 0 {
            tracing::debug!(
                previous_failures = state.consecutive_failures,
                "Resetting rate-limit backoff after success"
            );
        }
        state.consecutive_failures = 0;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }

    /// End of the active backoff window, if there is one.
    pub fn banned_until(&self) -> Option<Instant> {
        self.state
            .lock()
            .banned_until
            .filter(|until| *until > Instant::now())
    }

    pub fn is_backed_off(&self) -> bool {
        self.banned_until().is_some()
    }

    fn window_for(&self, failures: u32) -> Duration {
        let factor = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.ceiling)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> BackoffController {
        BackoffController::new(Duration::from_secs(1), Duration::from_secs(30))
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_grows_exponentially_and_caps() {
        let backoff = controller();
        let windows: Vec<u64> = (0..6)
            .map(|_| backoff.record_rate_limit_hit().as_secs())
            .collect();
        assert_eq!(windows, vec![2, 4, 8, 16, 30, 30]);
        assert_eq!(backoff.consecutive_failures(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_counter_only() {
        let backoff = controller();
        backoff.record_rate_limit_hit();
        backoff.record_rate_limit_hit();
        backoff.record_success();
        assert_eq!(backoff.consecutive_failures(), 0);
        // The active window is not cut short by the reset.
        assert!(backoff.is_backed_off());

        // Escalation starts over from the first step.
        assert_eq!(backoff.record_rate_limit_hit(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_suspends_until_window_ends() {
        let backoff = controller();
        let start = Instant::now();
        backoff.wait().await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        backoff.record_rate_limit_hit();
        backoff.wait().await;
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert!(!backoff.is_backed_off());
    }

    #[tokio::test(start_paused = true)]
    async fn test_banned_until_never_moves_backwards() {
        let backoff = BackoffController::new(Duration::from_secs(1), Duration::from_secs(4));
        backoff.record_rate_limit_hit();
        backoff.record_rate_limit_hit();
        let first = backoff.banned_until().unwrap();

        tokio::time::advance(Duration::from_millis(500)).await;
        backoff.record_success();
        backoff.record_rate_limit_hit(); // 2s window, shorter than what is left
        assert_eq!(backoff.banned_until().unwrap(), first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_hits_are_all_counted() {
        let backoff = std::sync::Arc::new(controller());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let backoff = backoff.clone();
            handles.push(tokio::spawn(async move {
                backoff.record_rate_limit_hit();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(backoff.consecutive_failures(), 8);
    }
}

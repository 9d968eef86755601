//! Single-slot cancellable retry timer.
//!
//! Every arm bumps a generation counter and every cancel bumps it again, so
//! a callback that already fired can tell whether it is still wanted.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct PendingRetry {
    generation: u64,
    token: CancellationToken,
    _handle: JoinHandle<()>,
}

/// Holds at most one armed timer.
#[derive(Default)]
pub struct RetryTimer {
    generation: u64,
    pending: Option<PendingRetry>,
    armed_total: u64,
    cancelled_total: u64,
}

impl RetryTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a timer is armed and has not fired yet.
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether `generation` still names the most recent arm.
    pub fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }

    /// Arm the timer. Returns `None` without arming when a timer is already
    /// pending; the caller never ends up with two live timers.
    pub fn arm<F, Fut>(&mut self, delay: Duration, on_fire: F) -> Option<u64>
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.pending.is_some() {
            return None;
        }

        self.generation += 1;
        let generation = self.generation;
        let token = CancellationToken::new();
        let task_token = token.clone();

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = task_token.cancelled() => {}
                _ = tokio::time::sleep(delay) => on_fire(generation).await,
            }
        });

        self.pending = Some(PendingRetry {
            generation,
            token,
            _handle: handle,
        });
        self.armed_total += 1;
        Some(generation)
    }

    /// Claim the pending timer from inside its callback.
    ///
    /// Returns false when the timer was cancelled or replaced in the meantime.
    pub fn take_if_current(&mut self, generation: u64) -> bool {
        match &self.pending {
            Some(pending) if pending.generation == generation => {
                self.pending = None;
                true
            }
            _ => false,
        }
    }

    /// Invalidate the current generation and cancel a pending timer.
    ///
    /// Returns true only when a pending timer was actually cancelled.
    pub fn cancel(&mut self) -> bool {
        self.generation += 1;
        match self.pending.take() {
            Some(pending) => {
                pending.token.cancel();
                self.cancelled_total += 1;
                true
            }
            None => false,
        }
    }

    /// Number of timers armed over the lifetime of this slot.
    pub fn armed_total(&self) -> u64 {
        self.armed_total
    }

    /// Number of pending timers cancelled over the lifetime of this slot.
    pub fn cancelled_total(&self) -> u64 {
        self.cancelled_total
    }
}

impl Drop for RetryTimer {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_second_arm_is_refused_while_pending() {
        let fired = Arc::new(AtomicU32::new(0));
        let mut timer = RetryTimer::new();

        let f = fired.clone();
        assert!(
            timer
                .arm(Duration::from_secs(1), move |_| async move {
                    f.fetch_add(1, Ordering::SeqCst);
                })
                .is_some()
        );
        let f = fired.clone();
        assert!(
            timer
                .arm(Duration::from_secs(1), move |_| async move {
                    f.fetch_add(1, Ordering::SeqCst);
                })
                .is_none()
        );

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(timer.armed_total(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_firing() {
        let fired = Arc::new(AtomicU32::new(0));
        let mut timer = RetryTimer::new();

        let f = fired.clone();
        timer.arm(Duration::from_secs(5), move |_| async move {
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert!(timer.cancel());
        assert!(!timer.cancel());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(timer.cancelled_total(), 1);
        assert!(!timer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_generation_is_not_current() {
        let mut timer = RetryTimer::new();
        let generation = timer
            .arm(Duration::from_secs(1), |_| async {})
            .unwrap();

        assert!(timer.is_current(generation));
        timer.cancel();
        assert!(!timer.is_current(generation));
        assert!(!timer.take_if_current(generation));
    }
}

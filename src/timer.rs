//! Cancellable one-shot idle timer
//!
//! An [`IdleTimer`] runs its callback once after a delay unless it is
//! cancelled first. Firing and cancellation are decided by a single atomic
//! transition out of the pending state, so exactly one of them wins.

use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Stand-in deadline for durations too large to add to the current instant
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

const PENDING: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

/// Observable state of a timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Pending,
    Fired,
    Cancelled,
}

/// Handle to a scheduled one-shot callback. Not restartable: schedule a new
/// timer to move the deadline.
pub struct IdleTimer {
    state: Arc<AtomicU8>,
    deadline: Instant,
    task: JoinHandle<()>,
}

impl IdleTimer {
    /// Start counting down immediately; after `duration` run `callback` once.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule<F, Fut>(duration: Duration, callback: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let state = Arc::new(AtomicU8::new(PENDING));
        let deadline = deadline_after(duration);

        let task_state = Arc::clone(&state);
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if task_state
                .compare_exchange(PENDING, FIRED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                callback().await;
            }
        });

        Self { state, deadline, task }
    }

    /// Prevent the callback from running. Returns true if this call cancelled
    /// the timer, false if it had already fired or been cancelled.
    pub fn cancel(&self) -> bool {
        let cancelled = self
            .state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        // A fired callback keeps running to completion.
        if cancelled {
            self.task.abort();
        }
        cancelled
    }

    pub fn state(&self) -> TimerState {
        match self.state.load(Ordering::Acquire) {
            PENDING => TimerState::Pending,
            FIRED => TimerState::Fired,
            _ => TimerState::Cancelled,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// `now + duration`, saturating at a far-future instant instead of overflowing
pub(crate) fn deadline_after(duration: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(duration).unwrap_or_else(|| now + FAR_FUTURE)
}

impl std::fmt::Debug for IdleTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdleTimer")
            .field("state", &self.state())
            .field("deadline", &self.deadline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_timer(duration: Duration) -> (IdleTimer, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let timer = IdleTimer::schedule(duration, move || async move {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (timer, count)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_after_duration() {
        let (timer, count) = counting_timer(Duration::from_secs(2));

        tokio::time::sleep(Duration::from_millis(1999)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(timer.state(), TimerState::Pending);

        tokio::time::sleep(Duration::from_millis(2)).await;
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(timer.state(), TimerState::Fired);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_deadline_prevents_callback() {
        let (timer, count) = counting_timer(Duration::from_secs(2));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(timer.cancel());
        assert_eq!(timer.state(), TimerState::Cancelled);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_fire_is_noop() {
        let (timer, count) = counting_timer(Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(200)).await;
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert!(!timer.cancel());
        assert_eq!(timer.state(), TimerState::Fired);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_twice() {
        let (timer, _count) = counting_timer(Duration::from_secs(1));
        assert!(timer.cancel());
        assert!(!timer.cancel());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_does_not_abort_running_callback() {
        let done = Arc::new(AtomicUsize::new(0));
        let d = Arc::clone(&done);
        let timer = IdleTimer::schedule(Duration::from_millis(10), move || async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            d.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(timer.state(), TimerState::Fired);
        assert!(!timer.cancel());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handle_keeps_timer_armed() {
        let (timer, count) = counting_timer(Duration::from_millis(50));
        drop(timer);

        tokio::time::sleep(Duration::from_millis(100)).await;
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_duration_stays_pending() {
        let (timer, count) = counting_timer(Duration::MAX);
        assert!(timer.deadline() > Instant::now() + Duration::from_secs(86400 * 365));

        tokio::time::sleep(Duration::from_secs(86400)).await;
        assert_eq!(timer.state(), TimerState::Pending);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        assert!(timer.cancel());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_after_saturates() {
        let near = deadline_after(Duration::from_secs(5));
        let far = deadline_after(Duration::from_secs(u64::MAX));
        assert_eq!(near, Instant::now() + Duration::from_secs(5));
        assert!(far > near);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replacing_timer_moves_deadline() {
        let (first, count) = counting_timer(Duration::from_secs(2));
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(first.cancel());
        let c = Arc::clone(&count);
        let second = IdleTimer::schedule(Duration::from_secs(2), move || async move {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert!(second.deadline() > first.deadline());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(600)).await;
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}

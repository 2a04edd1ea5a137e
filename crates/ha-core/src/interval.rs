//! Recurring timer helper
//!
//! [`track_time_interval`] runs an async action every `period`, starting one
//! full period after registration. The action is awaited before the timer
//! waits for the next period, so invocations never overlap. The returned
//! [`IntervalHandle`] stops the timer; [`IntervalHandle::cancel`] also waits
//! for an invocation that is already running.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Shortest period accepted; tokio intervals cannot tick at zero
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Handle to a running interval timer
///
/// Dropping the handle stops future invocations without waiting.
#[derive(Debug)]
pub struct IntervalHandle {
    period: Duration,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl IntervalHandle {
    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Stop the timer and wait until the timer task has exited
    ///
    /// The token handed to the action is cancelled too, so an action that
    /// observes it can cut long waits short.
    pub async fn cancel(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                if err.is_panic() {
                    warn!("Interval action panicked: {}", err);
                }
            }
        }
    }
}

impl Drop for IntervalHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Run `action` every `period` until the returned handle is cancelled or dropped
///
/// Each invocation receives a child of the timer's cancellation token.
/// Must be called from within a tokio runtime.
pub fn track_time_interval<F, Fut>(period: Duration, mut action: F) -> IntervalHandle
where
    F: FnMut(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let period = period.max(MIN_PERIOD);
    let token = CancellationToken::new();
    let timer_token = token.clone();
    let first_tick = Instant::now() + period;

    let task = tokio::spawn(async move {
        let mut ticker = interval_at(first_tick, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = timer_token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            action(timer_token.child_token()).await;
        }

        debug!(period_secs = period.as_secs(), "Interval timer stopped");
    });

    IntervalHandle {
        period,
        token,
        task: Some(task),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting(
        counter: &Arc<AtomicUsize>,
    ) -> impl FnMut(CancellationToken) -> std::future::Ready<()> + Send + 'static {
        let counter = counter.clone();
        move |_token| {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_after_one_period() {
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = track_time_interval(Duration::from_secs(60), counting(&counter));

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);

        handle.cancel().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_ticks() {
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = track_time_interval(Duration::from_secs(10), counting(&counter));

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        handle.cancel().await;
        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_waits_for_running_action() {
        let finished = Arc::new(AtomicUsize::new(0));
        let done = finished.clone();
        let handle = track_time_interval(Duration::from_secs(10), move |_token| {
            let done = done.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                done.fetch_add(1, Ordering::SeqCst);
            }
        });

        // Land inside the first invocation
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);

        handle.cancel().await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_action_sees_cancellation() {
        let observed = Arc::new(AtomicUsize::new(0));
        let seen = observed.clone();
        let handle = track_time_interval(Duration::from_secs(10), move |token| {
            let seen = seen.clone();
            async move {
                tokio::select! {
                    _ = token.cancelled() => { seen.fetch_add(1, Ordering::SeqCst); }
                    _ = tokio::time::sleep(Duration::from_secs(3600)) => {}
                }
            }
        });

        tokio::time::sleep(Duration::from_secs(11)).await;
        handle.cancel().await;
        assert_eq!(observed.load(Ordering::SeqCst), 1);
    }
}

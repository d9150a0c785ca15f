// Coalescing throttle: leading write plus a single trailing write per window.
//
// A submit outside the window flushes immediately. Inside the window the
// value is parked as "pending" and one timer is armed for the rest of the
// window; later submits only overwrite the pending value. When the timer
// fires it flushes the latest pending value, unless that equals the last
// value the sink accepted. A flush reports acceptance by resolving to `true`.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio::time::Instant;

type FlushFn<T> = Arc<dyn Fn(T) -> BoxFuture<'static, bool> + Send + Sync>;

/// What `submit` did with a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submit {
    /// Flushed inline.
    Immediate,
    /// Parked and a trailing timer was armed.
    Scheduled,
    /// Replaced an already-pending value.
    Coalesced,
}

struct ThrottleState<T> {
    last_flush: Option<Instant>,
    /// Last value the sink accepted. Cleared while a flush is in flight.
    last_value: Option<T>,
    pending: Option<T>,
    timer: Option<JoinHandle<()>>,
}

impl<T> Default for ThrottleState<T> {
    fn default() -> Self {
        Self { last_flush: None, last_value: None, pending: None, timer: None }
    }
}

pub struct CoalescingThrottle<T> {
    window: Duration,
    flush: FlushFn<T>,
    state: Arc<Mutex<ThrottleState<T>>>,
}

impl<T> CoalescingThrottle<T>
where
    T: Clone + PartialEq + Send + 'static,
{
    pub fn new<F>(window: Duration, flush: F) -> Self
    where
        F: Fn(T) -> BoxFuture<'static, bool> + Send + Sync + 'static,
    {
        Self {
            window,
            flush: Arc::new(flush),
            state: Arc::new(Mutex::new(ThrottleState::default())),
        }
    }

    pub async fn submit(&self, value: T) -> Submit {
        let now = Instant::now();
        {
            let mut state = lock(&self.state);
            if let Some(last) = state.last_flush {
                let elapsed = now.duration_since(last);
                if elapsed < self.window {
                    state.pending = Some(value);
                    if state.timer.is_some() {
                        return Submit::Coalesced;
                    }
                    state.timer = Some(self.arm(self.window - elapsed));
                    return Submit::Scheduled;
                }
            }
            state.last_flush = Some(now);
            state.last_value = None;
        }

        let accepted = (self.flush)(value.clone()).await;
        record_accepted(&self.state, now, value, accepted);
        Submit::Immediate
    }

    /// Whether a trailing flush is still outstanding.
    pub fn has_pending(&self) -> bool {
        lock(&self.state).pending.is_some()
    }

    /// Drop the pending value and disarm the timer. The window is kept.
    pub fn cancel(&self) {
        let mut state = lock(&self.state);
        state.pending = None;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }

    /// Cancel and forget the window, so the next submit flushes inline.
    pub fn reset(&self) {
        self.cancel();
        let mut state = lock(&self.state);
        state.last_flush = None;
        state.last_value = None;
    }

    fn arm(&self, delay: Duration) -> JoinHandle<()> {
        let state = Arc::clone(&self.state);
        let flush = Arc::clone(&self.flush);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let due = {
                let mut guard = lock(&state);
                guard.timer = None;
                match guard.pending.take() {
                    Some(value) if guard.last_value.as_ref() != Some(&value) => {
                        let started = Instant::now();
                        guard.last_flush = Some(started);
                        guard.last_value = None;
                        Some((started, value))
                    }
                    _ => None,
                }
            };
            if let Some((started, value)) = due {
                let accepted = flush(value.clone()).await;
                record_accepted(&state, started, value, accepted);
            }
        })
    }
}

impl<T> Drop for CoalescingThrottle<T> {
    fn drop(&mut self) {
        if let Some(timer) = lock(&self.state).timer.take() {
            timer.abort();
        }
    }
}

fn lock<T>(state: &Mutex<ThrottleState<T>>) -> MutexGuard<'_, ThrottleState<T>> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Remember `value` as delivered, unless a newer flush or a reset happened
/// while it was in flight.
fn record_accepted<T>(
    state: &Mutex<ThrottleState<T>>,
    started: Instant,
    value: T,
    accepted: bool,
) {
    if !accepted {
        return;
    }
    let mut guard = lock(state);
    if guard.last_flush == Some(started) {
        guard.last_value = Some(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::time;

    fn recording_throttle(window_ms: u64) -> (CoalescingThrottle<u32>, Arc<Mutex<Vec<u32>>>) {
        let (throttle, flushed, _accepting) = flaky_throttle(window_ms);
        (throttle, flushed)
    }

    /// Records every flush attempt; attempts are accepted while the flag is set.
    fn flaky_throttle(
        window_ms: u64,
    ) -> (CoalescingThrottle<u32>, Arc<Mutex<Vec<u32>>>, Arc<AtomicBool>) {
        let flushed = Arc::new(Mutex::new(Vec::new()));
        let accepting = Arc::new(AtomicBool::new(true));
        let sink = Arc::clone(&flushed);
        let gate = Arc::clone(&accepting);
        let throttle = CoalescingThrottle::new(Duration::from_millis(window_ms), move |value| {
            let sink = Arc::clone(&sink);
            let gate = Arc::clone(&gate);
            async move {
                sink.lock().unwrap().push(value);
                gate.load(Ordering::SeqCst)
            }
            .boxed()
        });
        (throttle, flushed, accepting)
    }

    // ── Leading edge ───────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn first_submit_flushes_immediately() {
        let (throttle, flushed) = recording_throttle(100);
        assert_eq!(throttle.submit(1).await, Submit::Immediate);
        assert_eq!(*flushed.lock().unwrap(), vec![1]);
        assert!(!throttle.has_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn submit_after_window_flushes_immediately() {
        let (throttle, flushed) = recording_throttle(100);
        throttle.submit(1).await;
        time::advance(Duration::from_millis(100)).await;
        assert_eq!(throttle.submit(2).await, Submit::Immediate);
        assert_eq!(*flushed.lock().unwrap(), vec![1, 2]);
    }

    // ── Trailing edge ──────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn burst_coalesces_into_one_trailing_flush_with_last_value() {
        let (throttle, flushed) = recording_throttle(100);
        throttle.submit(1).await;

        assert_eq!(throttle.submit(2).await, Submit::Scheduled);
        for value in 3..=9 {
            time::advance(Duration::from_millis(5)).await;
            assert_eq!(throttle.submit(value).await, Submit::Coalesced);
        }
        assert_eq!(*flushed.lock().unwrap(), vec![1]);

        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*flushed.lock().unwrap(), vec![1, 9]);
        assert!(!throttle.has_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn trailing_timer_fires_at_end_of_window() {
        let (throttle, flushed) = recording_throttle(100);
        throttle.submit(1).await;
        time::advance(Duration::from_millis(60)).await;
        throttle.submit(2).await;

        time::sleep(Duration::from_millis(39)).await;
        assert_eq!(*flushed.lock().unwrap(), vec![1]);

        time::sleep(Duration::from_millis(2)).await;
        assert_eq!(*flushed.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn trailing_value_equal_to_leading_value_is_skipped() {
        let (throttle, flushed) = recording_throttle(100);
        for _ in 0..10 {
            throttle.submit(7).await;
        }
        time::sleep(Duration::from_millis(250)).await;
        assert_eq!(*flushed.lock().unwrap(), vec![7]);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_leading_value_is_retried_by_trailing_flush() {
        let (throttle, flushed, accepting) = flaky_throttle(100);
        accepting.store(false, Ordering::SeqCst);
        assert_eq!(throttle.submit(7).await, Submit::Immediate);

        accepting.store(true, Ordering::SeqCst);
        time::advance(Duration::from_millis(50)).await;
        assert_eq!(throttle.submit(7).await, Submit::Scheduled);
        time::sleep(Duration::from_millis(100)).await;

        assert_eq!(*flushed.lock().unwrap(), vec![7, 7]);
        assert!(!throttle.has_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn accepted_trailing_value_dedupes_the_next_window() {
        let (throttle, flushed, accepting) = flaky_throttle(100);
        accepting.store(false, Ordering::SeqCst);
        throttle.submit(1).await;
        accepting.store(true, Ordering::SeqCst);
        throttle.submit(1).await;
        time::sleep(Duration::from_millis(110)).await;

        // The trailing retry at t=100 was accepted, so a repeat inside its
        // window is dropped.
        throttle.submit(1).await;
        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*flushed.lock().unwrap(), vec![1, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn trailing_flush_opens_a_new_window() {
        let (throttle, flushed) = recording_throttle(100);
        throttle.submit(1).await;
        throttle.submit(2).await;
        time::sleep(Duration::from_millis(110)).await;

        // The trailing flush at t=100 restarted the window.
        assert_eq!(throttle.submit(3).await, Submit::Scheduled);
        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*flushed.lock().unwrap(), vec![1, 2, 3]);
    }

    // ── Cancellation ───────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn cancel_discards_pending_value() {
        let (throttle, flushed) = recording_throttle(100);
        throttle.submit(1).await;
        throttle.submit(2).await;
        assert!(throttle.has_pending());

        throttle.cancel();
        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*flushed.lock().unwrap(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_forgets_the_window() {
        let (throttle, flushed) = recording_throttle(100);
        throttle.submit(1).await;
        throttle.reset();
        assert_eq!(throttle.submit(2).await, Submit::Immediate);
        assert_eq!(*flushed.lock().unwrap(), vec![1, 2]);
    }
}

//! Scheduler-agnostic timer source.
//!
//! The connection-and-channel core never calls `tokio::time::sleep` directly;
//! it goes through a `Clock` so tests can drive delay and timeout behavior
//! deterministically instead of waiting on real wall-clock time.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// A source of time and delay futures.
pub trait Clock: Send + Sync + 'static {
    /// Sleep for `duration`. Boxed because trait objects can't return `impl Future`.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Production clock backed by `tokio::time`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}


#[cfg(test)]
mod tests {
    use super::fake::FakeClock;
    use super::*;

    #[tokio::test]
    async fn tokio_clock_sleeps_for_at_least_the_requested_duration() {
        let clock = TokioClock;
        let start = tokio::time::Instant::now();
        clock.sleep(Duration::from_millis(5)).await;
        assert!(start.elapsed() >= Duration::from_millis(5));
    }

    #[tokio::test]
    async fn fake_clock_only_resolves_on_fire() {
        let clock = FakeClock::new();
        let fut = clock.sleep(Duration::from_secs(3600));
        let fire_clock = clock.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            fire_clock.fire();
        });
        tokio::time::timeout(Duration::from_secs(1), fut)
            .await
            .expect("fake sleep should resolve once fired, not after a real timeout");
    }
}

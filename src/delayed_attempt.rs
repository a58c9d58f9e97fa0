//! A one-shot "try to connect after a delay" token (§4.1).

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::clock::Clock;
use crate::error::PhoenixError;

enum Control {
    Skip,
    Abort,
}

/// A single delayed attempt at invoking some fallible async callback.
///
/// Two phases: *delaying* (waiting out `delay`, or cut short by
/// `skip_delay`/`abort`) and *callback running/done*. `abort` during the
/// delay prevents the callback from ever running; `skip_delay` just
/// collapses the wait.
pub struct DelayedAttempt<T> {
    id: u32,
    control_tx: Arc<Mutex<Option<oneshot::Sender<Control>>>>,
    delay_resolved: Arc<AtomicBool>,
    callback_rx: Option<oneshot::Receiver<Result<T, PhoenixError>>>,
}

impl<T: Send + 'static> DelayedAttempt<T> {
    /// Spawn the attempt: after `delay` (or immediately on `skip_delay`),
    /// invoke `callback` and resolve `callback_future` with its result.
    /// `abort` before the delay resolves short-circuits with an error and
    /// the callback never runs.
    pub fn new<F, Fut>(delay: Duration, clock: Arc<dyn Clock>, callback: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, PhoenixError>> + Send + 'static,
    {
        let id = rand::random::<u32>();
        let delay_resolved = Arc::new(AtomicBool::new(false));
        let (ctrl_tx, mut ctrl_rx) = oneshot::channel();
        let control_tx = Arc::new(Mutex::new(Some(ctrl_tx)));
        let (callback_tx, callback_rx) = oneshot::channel();

        let task_resolved = Arc::clone(&delay_resolved);

        tokio::spawn(async move {
            let control = tokio::select! {
                () = clock.sleep(delay) => None,
                ctrl = &mut ctrl_rx => ctrl.ok(),
            };
            task_resolved.store(true, Ordering::SeqCst);

            if matches!(control, Some(Control::Abort)) {
                let _ = callback_tx.send(Err(PhoenixError::ConnectionInitialization {
                    cause: "attempt aborted during delay".to_string(),
                }));
                return;
            }

            let result = callback().await;
            let _ = callback_tx.send(result);
        });

        Self {
            id,
            control_tx,
            delay_resolved,
            callback_rx: Some(callback_rx),
        }
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn delay_done(&self) -> bool {
        self.delay_resolved.load(Ordering::SeqCst)
    }

    /// Collapse the remaining delay; the callback then runs immediately.
    /// No-op if the delay has already resolved.
    pub fn skip_delay(&self) {
        send_control(&self.control_tx, &self.delay_resolved, Control::Skip);
    }

    /// Cancel the delay and prevent the callback from ever running.
    /// No-op if the delay has already resolved.
    pub fn abort(&self) {
        send_control(&self.control_tx, &self.delay_resolved, Control::Abort);
    }

    /// Await the callback's completion (or the abort error).
    ///
    /// # Panics
    /// Panics if called more than once; a `DelayedAttempt` is consumed by a
    /// single awaiter, matching the single-shot `callbackFuture` contract.
    pub async fn callback_future(&mut self) -> Result<T, PhoenixError> {
        let rx = self
            .callback_rx
            .take()
            .expect("callback_future polled more than once");
        await_receiver(rx).await
    }

    /// A lightweight, independently-ownable control surface (`id`,
    /// `skip_delay`, `abort`) that doesn't borrow `self`. Needed by callers
    /// that must hold the receiver returned by `into_receiver` across a
    /// `select!` loop while still being able to call `skip_delay`/`abort`.
    #[must_use]
    pub fn handle(&self) -> AttemptHandle {
        AttemptHandle {
            id: self.id,
            control_tx: Arc::clone(&self.control_tx),
            delay_resolved: Arc::clone(&self.delay_resolved),
        }
    }

    /// Take ownership of the single-shot receiver directly, for callers that
    /// want to poll it themselves (e.g. across multiple `select!` turns)
    /// rather than through `callback_future`.
    ///
    /// # Panics
    /// Panics if the receiver has already been taken.
    pub fn into_receiver(mut self) -> oneshot::Receiver<Result<T, PhoenixError>> {
        self.callback_rx.take().expect("receiver already taken")
    }
}

async fn await_receiver<T>(rx: oneshot::Receiver<Result<T, PhoenixError>>) -> Result<T, PhoenixError> {
    rx.await.unwrap_or_else(|_| {
        Err(PhoenixError::ConnectionInitialization {
            cause: "attempt task dropped without completing".to_string(),
        })
    })
}

fn send_control(control_tx: &Mutex<Option<oneshot::Sender<Control>>>, delay_resolved: &AtomicBool, control: Control) {
    if delay_resolved.load(Ordering::SeqCst) {
        return;
    }
    if let Some(tx) = control_tx.lock().unwrap().take() {
        let _ = tx.send(control);
    }
}

/// The `id`/`skip_delay`/`abort` surface of a `DelayedAttempt`, clonable and
/// independent of the (single-shot) completion receiver.
#[derive(Clone)]
pub struct AttemptHandle {
    id: u32,
    control_tx: Arc<Mutex<Option<oneshot::Sender<Control>>>>,
    delay_resolved: Arc<AtomicBool>,
}

impl AttemptHandle {
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn delay_done(&self) -> bool {
        self.delay_resolved.load(Ordering::SeqCst)
    }

    pub fn skip_delay(&self) {
        send_control(&self.control_tx, &self.delay_resolved, Control::Skip);
    }

    pub fn abort(&self) {
        send_control(&self.control_tx, &self.delay_resolved, Control::Abort);
    }
}

impl<T> PartialEq for DelayedAttempt<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::fake::FakeClock;
    use crate::clock::TokioClock;
    use std::sync::atomic::AtomicBool as StdAtomicBool;

    #[tokio::test]
    async fn callback_runs_after_delay_elapses() {
        let ran = Arc::new(StdAtomicBool::new(false));
        let ran2 = Arc::clone(&ran);
        let mut attempt = DelayedAttempt::new(Duration::from_millis(1), Arc::new(TokioClock), move || {
            let ran = Arc::clone(&ran2);
            async move {
                ran.store(true, Ordering::SeqCst);
                Ok::<_, PhoenixError>(42)
            }
        });
        let result = attempt.callback_future().await.unwrap();
        assert_eq!(result, 42);
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn skip_delay_runs_callback_without_waiting() {
        let clock = FakeClock::new();
        let mut attempt = DelayedAttempt::new(Duration::from_secs(3600), Arc::new(clock), || async {
            Ok::<_, PhoenixError>(7)
        });
        // skip_delay is delivered through a oneshot, so it is buffered even
        // if the spawned task hasn't reached its `select!` yet.
        attempt.skip_delay();
        let result = tokio::time::timeout(Duration::from_secs(1), attempt.callback_future())
            .await
            .expect("skip_delay should unblock immediately")
            .unwrap();
        assert_eq!(result, 7);
    }

    #[tokio::test]
    async fn abort_prevents_callback_from_running() {
        let clock = FakeClock::new();
        let ran = Arc::new(StdAtomicBool::new(false));
        let ran2 = Arc::clone(&ran);
        let mut attempt = DelayedAttempt::new(Duration::from_secs(3600), Arc::new(clock), move || {
            let ran = Arc::clone(&ran2);
            async move {
                ran.store(true, Ordering::SeqCst);
                Ok::<_, PhoenixError>(1)
            }
        });
        attempt.abort();
        let result = tokio::time::timeout(Duration::from_secs(1), attempt.callback_future())
            .await
            .expect("abort should unblock immediately");
        assert!(result.is_err());
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn skip_delay_is_idempotent_after_resolution() {
        let mut attempt =
            DelayedAttempt::new(Duration::from_millis(1), Arc::new(TokioClock), || async {
                Ok::<_, PhoenixError>(())
            });
        attempt.callback_future().await.unwrap();
        // Delay already resolved; these must not panic or deadlock.
        attempt.skip_delay();
        attempt.abort();
    }

    #[test]
    fn equality_is_by_id() {
        let a = DelayedAttempt::<()>::new(Duration::from_secs(3600), Arc::new(FakeClock::new()), || async {
            Ok(())
        });
        let b = DelayedAttempt::<()>::new(Duration::from_secs(3600), Arc::new(FakeClock::new()), || async {
            Ok(())
        });
        assert_eq!(a, a);
        assert_ne!(a.id(), b.id());
    }
}

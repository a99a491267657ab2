//! Command/event synchronization
//!
//! Lets a caller issue a command and then wait for the asynchronous
//! confirmation. A [`Waiter`] is registered *before* the command is written
//! so the confirming event cannot slip past; it then resolves exactly once:
//! on a matching event, on a failure event, when the device detaches, when
//! the session closes, on timeout, or on cancellation.

use std::future::pending;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};

use crate::error::{IndiError, IndiResult};
use crate::event::{DomainEvent, EventBus, WaiterRegistration};

/// Cooperative cancellation shared between a caller and its waits
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel every wait using this token, now and later
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once the token is cancelled
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // register interest before checking the flag so a concurrent
            // cancel() cannot fall between the two
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Why an awaited operation failed
#[derive(Debug, Clone, PartialEq)]
pub enum FailureReason {
    /// The device reported Alert on the awaited property
    Alert(Option<String>),
    /// The device went away
    Detached,
    /// The session closed
    SessionClosed,
}

/// Decision of a matcher for one event
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Pending,
    Success,
    Failure(FailureReason),
}

/// How a wait ended
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    Success,
    Failure(FailureReason),
    TimedOut,
    Cancelled,
}

impl WaitOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, WaitOutcome::Success)
    }

    /// Map onto [`IndiError`] for callers that only care about success
    pub fn into_result(
        self,
        device: &str,
        operation: &str,
        timeout: Option<Duration>,
    ) -> IndiResult<()> {
        match self {
            WaitOutcome::Success => Ok(()),
            WaitOutcome::Failure(FailureReason::Alert(message)) => Err(IndiError::DeviceAlert {
                device: device.to_string(),
                reason: message.unwrap_or_else(|| format!("{} failed", operation)),
            }),
            WaitOutcome::Failure(FailureReason::Detached) => {
                Err(IndiError::Detached(device.to_string()))
            }
            WaitOutcome::Failure(FailureReason::SessionClosed) => Err(IndiError::SessionClosed),
            WaitOutcome::TimedOut => Err(IndiError::OperationTimeout {
                operation: operation.to_string(),
                device: device.to_string(),
                duration: timeout.unwrap_or_default(),
            }),
            WaitOutcome::Cancelled => Err(IndiError::Cancelled {
                operation: operation.to_string(),
                device: device.to_string(),
            }),
        }
    }
}

/// A pending wait on one device's events
pub struct Waiter {
    device: String,
    feed: WaiterRegistration,
}

impl Waiter {
    /// Start collecting events for `device`. Call before sending the command.
    pub fn register(bus: &Arc<EventBus>, device: &str) -> Self {
        Self {
            device: device.to_string(),
            feed: bus.register_waiter(device),
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// Wait until `matcher` decides, the device detaches, the session closes,
    /// `timeout` elapses or `cancel` fires. Exactly one outcome is reported;
    /// when cancellation races a confirming event either may win.
    pub async fn wait<F>(
        mut self,
        mut matcher: F,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> WaitOutcome
    where
        F: FnMut(&DomainEvent) -> Verdict,
    {
        let deadline = timeout.map(|t| Instant::now() + t);
        let expired = async move {
            match deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => pending::<()>().await,
            }
        };
        tokio::pin!(expired);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    tracing::debug!("Wait on {} cancelled", self.device);
                    return WaitOutcome::Cancelled;
                }
                event = self.feed.recv() => {
                    let Some(event) = event else {
                        return WaitOutcome::Failure(FailureReason::SessionClosed);
                    };
                    if event.is_detach_of(&self.device) {
                        return WaitOutcome::Failure(FailureReason::Detached);
                    }
                    match matcher(&event) {
                        Verdict::Pending => {}
                        Verdict::Success => return WaitOutcome::Success,
                        Verdict::Failure(reason) => return WaitOutcome::Failure(reason),
                    }
                }
                _ = &mut expired => {
                    tracing::debug!("Wait on {} timed out after {:?}", self.device, timeout);
                    return WaitOutcome::TimedOut;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{test_device, DeviceKind};
    use crate::event::DeviceEvent;
    use crate::focuser::FocuserEvent;

    fn position_is(target: f64) -> impl FnMut(&DomainEvent) -> Verdict {
        move |event| match event {
            DomainEvent::Focuser(_, FocuserEvent::PositionChanged(p)) if *p == target => {
                Verdict::Success
            }
            DomainEvent::Focuser(_, FocuserEvent::MoveFailed(reason)) => {
                Verdict::Failure(FailureReason::Alert(reason.clone()))
            }
            _ => Verdict::Pending,
        }
    }

    #[tokio::test]
    async fn test_success_on_matching_event() {
        let (device, _outbox, bus) = test_device("Focuser", DeviceKind::Focuser);
        let waiter = Waiter::register(&bus, "Focuser");
        bus.publish(DomainEvent::Focuser(device.clone(), FocuserEvent::PositionChanged(10.0)));
        bus.publish(DomainEvent::Focuser(device.clone(), FocuserEvent::PositionChanged(20.0)));

        let outcome = waiter
            .wait(position_is(20.0), Some(Duration::from_secs(5)), &CancellationToken::new())
            .await;
        assert_eq!(outcome, WaitOutcome::Success);
        assert_eq!(bus.waiter_count(), 0);
    }

    #[tokio::test]
    async fn test_failure_event() {
        let (device, _outbox, bus) = test_device("Focuser", DeviceKind::Focuser);
        let waiter = Waiter::register(&bus, "Focuser");
        bus.publish(DomainEvent::Focuser(
            device,
            FocuserEvent::MoveFailed(Some("limit".to_string())),
        ));
        let outcome = waiter
            .wait(position_is(20.0), None, &CancellationToken::new())
            .await;
        assert_eq!(
            outcome,
            WaitOutcome::Failure(FailureReason::Alert(Some("limit".to_string())))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let (_device, _outbox, bus) = test_device("Focuser", DeviceKind::Focuser);
        let waiter = Waiter::register(&bus, "Focuser");
        let outcome = waiter
            .wait(position_is(1.0), Some(Duration::from_secs(120)), &CancellationToken::new())
            .await;
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert!(matches!(
            outcome.into_result("Focuser", "focus move", Some(Duration::from_secs(120))),
            Err(IndiError::OperationTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_before_wait() {
        let (_device, _outbox, bus) = test_device("Focuser", DeviceKind::Focuser);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = Waiter::register(&bus, "Focuser")
            .wait(position_is(1.0), None, &cancel)
            .await;
        assert_eq!(outcome, WaitOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_from_other_task() {
        let (_device, _outbox, bus) = test_device("Focuser", DeviceKind::Focuser);
        let cancel = CancellationToken::new();
        let waiter = Waiter::register(&bus, "Focuser");
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { waiter.wait(position_is(1.0), None, &cancel).await })
        };
        tokio::task::yield_now().await;
        cancel.cancel();
        assert_eq!(task.await.unwrap(), WaitOutcome::Cancelled);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_racing_confirmation_reports_one_outcome() {
        for _ in 0..200 {
            let (device, _outbox, bus) = test_device("Focuser", DeviceKind::Focuser);
            let cancel = CancellationToken::new();
            let waiter = Waiter::register(&bus, "Focuser");
            let wait = {
                let cancel = cancel.clone();
                tokio::spawn(async move { waiter.wait(position_is(5.0), None, &cancel).await })
            };
            let canceller = {
                let cancel = cancel.clone();
                tokio::spawn(async move { cancel.cancel() })
            };
            bus.publish(DomainEvent::Focuser(device, FocuserEvent::PositionChanged(5.0)));
            canceller.await.unwrap();

            let outcome = wait.await.unwrap();
            assert!(
                outcome == WaitOutcome::Success || outcome == WaitOutcome::Cancelled,
                "unexpected {:?}",
                outcome
            );
        }
    }

    #[tokio::test]
    async fn test_detach_releases_waiter() {
        let (device, _outbox, bus) = test_device("Mount", DeviceKind::Mount);
        let waiter = Waiter::register(&bus, "Mount");
        let task = tokio::spawn(async move {
            waiter
                .wait(|_| Verdict::Pending, None, &CancellationToken::new())
                .await
        });
        bus.publish(DomainEvent::Device(device, DeviceEvent::Detached));
        assert_eq!(
            task.await.unwrap(),
            WaitOutcome::Failure(FailureReason::Detached)
        );
    }

    #[tokio::test]
    async fn test_session_close_releases_waiter() {
        let (_device, _outbox, bus) = test_device("Mount", DeviceKind::Mount);
        let waiter = Waiter::register(&bus, "Mount");
        bus.close();
        let outcome = waiter
            .wait(|_| Verdict::Pending, None, &CancellationToken::new())
            .await;
        assert_eq!(outcome, WaitOutcome::Failure(FailureReason::SessionClosed));
        assert!(matches!(
            outcome.into_result("Mount", "park", None),
            Err(IndiError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_independent_waits_on_one_device() {
        let (device, _outbox, bus) = test_device("Focuser", DeviceKind::Focuser);
        let first = Waiter::register(&bus, "Focuser");
        let second = Waiter::register(&bus, "Focuser");
        let cancel_first = CancellationToken::new();
        let cancel_second = CancellationToken::new();
        cancel_second.cancel();

        bus.publish(DomainEvent::Focuser(device, FocuserEvent::PositionChanged(7.0)));

        let (a, b) = tokio::join!(
            first.wait(position_is(7.0), None, &cancel_first),
            second.wait(position_is(7.0), None, &cancel_second),
        );
        assert_eq!(a, WaitOutcome::Success);
        assert_eq!(b, WaitOutcome::Cancelled);
    }
}

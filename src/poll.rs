//! Fixed-interval poll loop shared by the provider implementations.
//!
//! Polling never backs off: every wait in this crate targets short-lived
//! infrastructure and sleeps a constant interval between checks. Each policy
//! carries a ceiling so a stuck cloud operation surfaces as a timeout instead
//! of blocking forever.

use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

/// Interval and ceiling for one kind of wait.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PollPolicy {
    /// Sleep between consecutive checks.
    pub interval: Duration,
    /// Total time allowed before the wait is abandoned.
    pub timeout: Duration,
}

impl PollPolicy {
    /// Creates a policy from an interval and a ceiling.
    #[must_use]
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// GCE zonal operations (instance insert, stop, delete).
pub const GCE_ZONE_OPERATION: PollPolicy =
    PollPolicy::new(Duration::from_secs(10), Duration::from_secs(15 * 60));
/// GCE global operations (image insert).
pub const GCE_GLOBAL_OPERATION: PollPolicy =
    PollPolicy::new(Duration::from_secs(10), Duration::from_secs(60 * 60));
/// GCE instance status while waiting for `RUNNING`.
pub const GCE_INSTANCE_READY: PollPolicy =
    PollPolicy::new(Duration::from_secs(5), Duration::from_secs(10 * 60));
/// OCI instance lifecycle-state polling (ready, stop, terminate).
pub const OCI_INSTANCE_STATE: PollPolicy =
    PollPolicy::new(Duration::from_secs(2), Duration::from_secs(20 * 60));
/// OCI image lifecycle-state polling.
pub const OCI_IMAGE_STATE: PollPolicy =
    PollPolicy::new(Duration::from_secs(2), Duration::from_secs(90 * 60));

/// Why a poll loop stopped without producing a value.
#[derive(Debug)]
pub enum PollStop<E> {
    /// The check itself failed.
    Failed(E),
    /// The policy ceiling elapsed.
    TimedOut(Duration),
    /// The caller cancelled the wait.
    Cancelled,
}

/// Calls `check` until it yields `Some`, sleeping `policy.interval` between
/// attempts.
///
/// The first check runs immediately. Cancellation is tested before every
/// check and interrupts the sleep between checks.
///
/// # Errors
///
/// Returns [`PollStop::Failed`] with the check's error, [`PollStop::TimedOut`]
/// once the ceiling has elapsed, or [`PollStop::Cancelled`] when `cancel`
/// fires.
pub async fn poll_until<T, E, F, Fut>(
    policy: PollPolicy,
    cancel: &CancellationToken,
    mut check: F,
) -> Result<T, PollStop<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let deadline = Instant::now() + policy.timeout;
    loop {
        if cancel.is_cancelled() {
            return Err(PollStop::Cancelled);
        }
        if let Some(value) = check().await.map_err(PollStop::Failed)? {
            return Ok(value);
        }
        if Instant::now() + policy.interval > deadline {
            return Err(PollStop::TimedOut(policy.timeout));
        }
        tokio::select! {
            () = cancel.cancelled() => return Err(PollStop::Cancelled),
            () = sleep(policy.interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::convert::Infallible;

    use super::*;

    const FAST: PollPolicy = PollPolicy::new(Duration::from_secs(2), Duration::from_secs(60));

    #[tokio::test(start_paused = true)]
    async fn returns_after_the_check_yields() {
        let calls = Cell::new(0_u32);
        let start = Instant::now();
        let value = poll_until(FAST, &CancellationToken::new(), || {
            calls.set(calls.get() + 1);
            let done = calls.get() == 3;
            async move { Ok::<_, Infallible>(done.then_some("done")) }
        })
        .await;

        assert!(matches!(value, Ok("done")));
        assert_eq!(calls.get(), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn check_errors_stop_the_loop() {
        let result: Result<(), PollStop<&str>> =
            poll_until(FAST, &CancellationToken::new(), || async { Err("boom") }).await;
        assert!(matches!(result, Err(PollStop::Failed("boom"))));
    }

    #[tokio::test(start_paused = true)]
    async fn ceiling_surfaces_a_timeout() {
        let policy = PollPolicy::new(Duration::from_secs(2), Duration::from_secs(7));
        let result: Result<(), PollStop<Infallible>> =
            poll_until(policy, &CancellationToken::new(), || async { Ok(None) }).await;
        assert!(matches!(result, Err(PollStop::TimedOut(waited)) if waited == policy.timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_sleep() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });
        let start = Instant::now();
        let result: Result<(), PollStop<Infallible>> =
            poll_until(FAST, &cancel, || async { Ok(None) }).await;

        assert!(matches!(result, Err(PollStop::Cancelled)));
        assert!(start.elapsed() < FAST.interval);
    }
}

//! Retry policies for `FLOOD_WAIT` and transient errors, and the reconnect
//! backoff schedule.

use std::num::NonZeroU32;
use std::ops::ControlFlow;
use std::time::Duration;

use crate::errors::InvocationError;

/// Controls how [`crate::Client::invoke`] reacts when a call fails.
pub trait RetryPolicy: Send + Sync + 'static {
    /// `Continue(delay)` sleeps `delay` and sends the call again;
    /// `Break(())` returns the error to the caller.
    fn should_retry(&self, ctx: &RetryContext) -> ControlFlow<(), Duration>;
}

/// Context passed to [`RetryPolicy::should_retry`] on each failure.
pub struct RetryContext {
    /// How many times this call has failed so far.
    pub fail_count:   NonZeroU32,
    /// Total time already spent sleeping between attempts.
    pub slept_so_far: Duration,
    /// The latest failure.
    pub error:        InvocationError,
}

/// Never retry.
pub struct NoRetries;
impl RetryPolicy for NoRetries {
    fn should_retry(&self, _: &RetryContext) -> ControlFlow<(), Duration> {
        ControlFlow::Break(())
    }
}

/// Sleep through short flood waits and retry once on transient errors.
pub struct AutoSleep {
    /// Longest flood wait that is slept through instead of returned.
    pub threshold:             Duration,
    /// Delay before the single retry after a transient failure; `None`
    /// returns transient errors directly.
    pub io_errors_as_flood_of: Option<Duration>,
}

impl Default for AutoSleep {
    fn default() -> Self {
        Self {
            threshold:             Duration::from_secs(60),
            io_errors_as_flood_of: Some(Duration::from_secs(1)),
        }
    }
}

impl RetryPolicy for AutoSleep {
    fn should_retry(&self, ctx: &RetryContext) -> ControlFlow<(), Duration> {
        if let Some(secs) = ctx.error.flood_wait_seconds() {
            let wait = Duration::from_secs(u64::from(secs));
            if ctx.fail_count.get() == 1 && wait <= self.threshold {
                tracing::info!("[mtwire] FLOOD_WAIT_{secs}, sleeping before retry");
                return ControlFlow::Continue(wait);
            }
        }
        if ctx.error.is_transient() && ctx.fail_count.get() == 1 {
            if let Some(d) = self.io_errors_as_flood_of {
                tracing::info!("[mtwire] {}, sleeping {d:?} before retry", ctx.error);
                return ControlFlow::Continue(d);
            }
        }
        ControlFlow::Break(())
    }
}

// ─── Backoff ─────────────────────────────────────────────────────────────────

/// Capped exponential delay between reconnect attempts.
///
/// Attempt `n` (starting at 0) waits `min(base * factor^n, max)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Backoff {
    /// Delay before the first attempt.
    pub base:   Duration,
    /// Growth factor per failed attempt.
    pub factor: u32,
    /// Upper bound on any single delay.
    pub max:    Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self { base: Duration::from_millis(500), factor: 2, max: Duration::from_secs(30) }
    }
}

impl Backoff {
    /// Delay before attempt number `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let growth = self.factor.max(1).saturating_pow(attempt);
        self.base.saturating_mul(growth).min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::RpcError;

    fn ctx(fail_count: u32, error: InvocationError) -> RetryContext {
        RetryContext {
            fail_count: NonZeroU32::new(fail_count).unwrap(),
            slept_so_far: Duration::ZERO,
            error,
        }
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let b = Backoff::default();
        assert_eq!(b.delay(0), Duration::from_millis(500));
        assert_eq!(b.delay(1), Duration::from_secs(1));
        assert_eq!(b.delay(3), Duration::from_secs(4));
        assert_eq!(b.delay(6), Duration::from_secs(30));
        assert_eq!(b.delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn degenerate_factor_keeps_base() {
        let b = Backoff { base: Duration::from_millis(10), factor: 0, max: Duration::from_secs(1) };
        assert_eq!(b.delay(5), Duration::from_millis(10));
    }

    #[test]
    fn no_retries_always_breaks() {
        let c = ctx(1, InvocationError::FloodWait { seconds: 1 });
        assert_eq!(NoRetries.should_retry(&c), ControlFlow::Break(()));
    }

    #[test]
    fn auto_sleep_honours_threshold_and_first_failure_only() {
        let policy = AutoSleep::default();
        let short = ctx(1, InvocationError::FloodWait { seconds: 5 });
        assert_eq!(policy.should_retry(&short), ControlFlow::Continue(Duration::from_secs(5)));

        let long = ctx(1, InvocationError::FloodWait { seconds: 600 });
        assert_eq!(policy.should_retry(&long), ControlFlow::Break(()));

        let second = ctx(2, InvocationError::FloodWait { seconds: 5 });
        assert_eq!(policy.should_retry(&second), ControlFlow::Break(()));
    }

    #[test]
    fn auto_sleep_retries_transient_errors_once() {
        let policy = AutoSleep::default();
        let io = ctx(1, InvocationError::TransportClosed);
        assert_eq!(policy.should_retry(&io), ControlFlow::Continue(Duration::from_secs(1)));

        let rpc = ctx(1, InvocationError::Rpc(RpcError::from_message(400, "BAD_REQUEST")));
        assert_eq!(policy.should_retry(&rpc), ControlFlow::Break(()));
    }
}

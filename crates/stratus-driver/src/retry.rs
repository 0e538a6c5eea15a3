//! Retry decisions: whether to try again and how long to back off.
//!
//! Classification of *what* is retryable lives on [`Error::is_retryable`];
//! the handler only decides attempt budgets and delays, so custom handlers
//! cannot accidentally retry fatal errors.

use std::fmt;
use std::time::Duration;

use crate::error::Error;

/// Everything a handler may consult: pure request state.
#[derive(Debug)]
pub struct RetryContext<'a> {
    /// Retries already performed (0 on the first failure).
    pub retries: u32,
    /// The error that ended the last attempt.
    pub error: &'a Error,
}

/// Decides whether a failed request should be retried and after how long.
pub trait RetryHandler: Send + Sync + fmt::Debug {
    fn should_retry(&self, ctx: &RetryContext<'_>) -> bool;

    fn retry_delay(&self, ctx: &RetryContext<'_>) -> Duration;
}

/// Exponential backoff with jitter and an attempt cap.
///
/// Security-info propagation retries on a short fixed cadence regardless of
/// the cap; throttling errors get a longer minimum floor so a retry has a
/// chance of finding capacity.
#[derive(Debug, Clone)]
pub struct DefaultRetryHandler {
    max_retries: u32,
    base_delay: Duration,
}

const SECURITY_INFO_DELAY: Duration = Duration::from_millis(100);
const THROTTLE_FLOOR: Duration = Duration::from_millis(500);

impl DefaultRetryHandler {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        DefaultRetryHandler {
            max_retries,
            base_delay,
        }
    }

    fn backoff(&self, retries: u32) -> Duration {
        let shift = retries.min(6);
        let exp = self.base_delay.saturating_mul(1u32 << shift);
        let jitter = Duration::from_millis(fastrand::u64(0..=self.base_delay.as_millis() as u64));
        exp + jitter
    }
}

impl Default for DefaultRetryHandler {
    fn default() -> Self {
        DefaultRetryHandler::new(10, Duration::from_millis(200))
    }
}

impl RetryHandler for DefaultRetryHandler {
    fn should_retry(&self, ctx: &RetryContext<'_>) -> bool {
        // Security info propagation resolves on its own schedule; keep
        // retrying and let the deadline bound the loop.
        if matches!(ctx.error, Error::SecurityInfoNotReady(_)) {
            return true;
        }
        ctx.retries < self.max_retries
    }

    fn retry_delay(&self, ctx: &RetryContext<'_>) -> Duration {
        if matches!(ctx.error, Error::SecurityInfoNotReady(_)) {
            return SECURITY_INFO_DELAY;
        }
        let delay = self.backoff(ctx.retries);
        if ctx.error.is_throttling() {
            delay.max(THROTTLE_FLOOR)
        } else {
            delay
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(retries: u32, error: &Error) -> RetryContext<'_> {
        RetryContext { retries, error }
    }

    #[test]
    fn respects_the_attempt_cap() {
        let h = DefaultRetryHandler::new(3, Duration::from_millis(10));
        let e = Error::TableBusy("t".into());
        assert!(h.should_retry(&ctx(0, &e)));
        assert!(h.should_retry(&ctx(2, &e)));
        assert!(!h.should_retry(&ctx(3, &e)));
    }

    #[test]
    fn security_info_ignores_the_cap() {
        let h = DefaultRetryHandler::new(1, Duration::from_millis(10));
        let e = Error::SecurityInfoNotReady("t".into());
        assert!(h.should_retry(&ctx(50, &e)));
        assert_eq!(h.retry_delay(&ctx(50, &e)), Duration::from_millis(100));
    }

    #[test]
    fn backoff_grows_with_retries() {
        let h = DefaultRetryHandler::new(10, Duration::from_millis(100));
        let e = Error::RetryableService("t".into());
        // Jitter adds at most one base_delay; 4 doublings dominate it.
        let early = h.retry_delay(&ctx(0, &e));
        let late = h.retry_delay(&ctx(4, &e));
        assert!(late > early, "{late:?} <= {early:?}");
    }

    #[test]
    fn throttling_has_a_delay_floor() {
        let h = DefaultRetryHandler::new(10, Duration::from_millis(1));
        let e = Error::ReadThrottled("t".into());
        assert!(h.retry_delay(&ctx(0, &e)) >= Duration::from_millis(500));
    }
}

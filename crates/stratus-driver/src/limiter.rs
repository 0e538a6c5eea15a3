//! Token-bucket-by-time rate limiting.
//!
//! A limiter stores a single instant `next`: the earliest time at which a
//! new request finds the limiter under its limit. Charging units pushes
//! `next` forward by `units * time_per_unit`; the gap between `next` and
//! now, bounded by the burst `duration`, is the accumulated credit.

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// Default burst window: how much unused capacity a limiter may bank.
const DEFAULT_BURST: Duration = Duration::from_secs(1);

/// A pacing primitive enforcing a configured units-per-second rate.
///
/// Implementations must serialize state internally and must not hold locks
/// across sleeps.
pub trait RateLimiter: Send + Sync + fmt::Debug {
    /// Block until the limiter is under its limit, then charge `units`.
    ///
    /// Returns the time slept. Negative `units` return capacity. A zero
    /// `timeout` means no limit on the wait. When the wait would exceed
    /// `timeout`: sleep `timeout`, then either charge anyway and return
    /// `timeout` (`consume_on_timeout`) or fail with [`Error::Timeout`]
    /// without charging.
    fn consume_units<'a>(
        &'a self,
        units: i64,
        timeout: Duration,
        consume_on_timeout: bool,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Duration, Error>>;

    /// Change the rate. Values ≤ 0 disable the limiter. Unused capacity is
    /// prorated so a rate change neither grants nor confiscates burst.
    fn set_limit(&self, units_per_second: f64);

    /// Feedback from a server throttling error: discard banked credit so
    /// the next consumer starts from scratch.
    fn handle_throttle(&self);

    /// The currently configured rate in units per second (0 if disabled).
    fn limit(&self) -> f64;
}

#[derive(Debug)]
struct LimiterState {
    /// Units per second; 0 means disabled.
    limit: f64,
    /// Time one unit costs; zero when disabled.
    time_per_unit: Duration,
    /// Burst window; at least one `time_per_unit`.
    duration: Duration,
    /// Earliest instant at which a new request is under the limit.
    next: Instant,
    /// Set by throttling feedback; discards past credit on the next consume.
    remove_past: bool,
}

/// The standard [`RateLimiter`]: one mutex, sleeps taken outside it.
pub struct SimpleRateLimiter {
    state: Mutex<LimiterState>,
}

enum Plan {
    /// Charged; sleep this long (possibly zero).
    Proceed(Duration),
    /// Wait exceeds the timeout; sleep `timeout`, charged or not.
    OverTimeout { timeout: Duration, charged: bool },
}

impl SimpleRateLimiter {
    pub fn new(units_per_second: f64) -> Self {
        Self::with_burst(units_per_second, DEFAULT_BURST)
    }

    /// Create a limiter with an explicit burst window.
    pub fn with_burst(units_per_second: f64, burst: Duration) -> Self {
        let limiter = SimpleRateLimiter {
            state: Mutex::new(LimiterState {
                limit: 0.0,
                time_per_unit: Duration::ZERO,
                duration: burst,
                next: Instant::now(),
                remove_past: false,
            }),
        };
        limiter.set_limit(units_per_second);
        limiter
    }

    fn plan(&self, units: i64, timeout: Duration, consume_on_timeout: bool) -> Plan {
        let mut s = self.state.lock().expect("limiter mutex poisoned");
        if s.time_per_unit.is_zero() {
            return Plan::Proceed(Duration::ZERO);
        }

        let now = Instant::now();

        // Bound the stored burst: credit older than `duration` evaporates,
        // and throttling feedback evaporates all of it.
        let floor = if s.remove_past {
            s.remove_past = false;
            Some(now)
        } else {
            now.checked_sub(s.duration)
        };
        if let Some(floor) = floor
            && s.next < floor
        {
            s.next = floor;
        }

        let sleep = s.next.saturating_duration_since(now);
        let new_next = if units >= 0 {
            s.next + s.time_per_unit.mul_f64(units as f64)
        } else {
            s.next
                .checked_sub(s.time_per_unit.mul_f64(-units as f64))
                .unwrap_or(now)
        };

        if units < 0 || s.next <= now {
            s.next = new_next;
            return Plan::Proceed(Duration::ZERO);
        }

        if timeout.is_zero() || sleep < timeout {
            s.next = new_next;
            return Plan::Proceed(sleep);
        }

        if consume_on_timeout {
            s.next = new_next;
        }
        Plan::OverTimeout {
            timeout,
            charged: consume_on_timeout,
        }
    }
}

impl RateLimiter for SimpleRateLimiter {
    fn consume_units<'a>(
        &'a self,
        units: i64,
        timeout: Duration,
        consume_on_timeout: bool,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Duration, Error>> {
        Box::pin(async move {
            let plan = self.plan(units, timeout, consume_on_timeout);
            match plan {
                Plan::Proceed(sleep) => {
                    if !sleep.is_zero() {
                        sleep_or_cancel(sleep, cancel).await?;
                    }
                    Ok(sleep)
                }
                Plan::OverTimeout { timeout, charged } => {
                    sleep_or_cancel(timeout, cancel).await?;
                    if charged {
                        Ok(timeout)
                    } else {
                        Err(Error::Timeout {
                            elapsed: timeout,
                            retries: 0,
                            cause: None,
                        })
                    }
                }
            }
        })
    }

    fn set_limit(&self, units_per_second: f64) {
        let mut s = self.state.lock().expect("limiter mutex poisoned");
        if units_per_second <= 0.0 {
            s.limit = 0.0;
            s.time_per_unit = Duration::ZERO;
            return;
        }
        let new_tpu = Duration::from_secs_f64(1.0 / units_per_second);
        let old_tpu = s.time_per_unit;
        s.limit = units_per_second;
        s.duration = s.duration.max(new_tpu);

        // Prorate unused capacity: the same number of banked units must
        // remain banked at the new rate.
        let now = Instant::now();
        if !old_tpu.is_zero() && s.next < now {
            let behind = now.duration_since(s.next);
            let scaled = behind.mul_f64(new_tpu.as_secs_f64() / old_tpu.as_secs_f64());
            s.next = now.checked_sub(scaled).unwrap_or(s.next);
        }
        s.time_per_unit = new_tpu;
    }

    fn handle_throttle(&self) {
        let mut s = self.state.lock().expect("limiter mutex poisoned");
        s.remove_past = true;
    }

    fn limit(&self) -> f64 {
        self.state.lock().expect("limiter mutex poisoned").limit
    }
}

impl fmt::Debug for SimpleRateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.state.lock().expect("limiter mutex poisoned");
        f.debug_struct("SimpleRateLimiter")
            .field("limit", &s.limit)
            .field("duration", &s.duration)
            .finish()
    }
}

async fn sleep_or_cancel(d: Duration, cancel: &CancellationToken) -> Result<(), Error> {
    tokio::select! {
        _ = tokio::time::sleep(d) => Ok(()),
        _ = cancel.cancelled() => Err(Error::Cancelled),
    }
}

/// A limiter that never paces. Installed for tables with a zero unit count
/// on one side, and usable anywhere a no-op is needed.
#[derive(Debug, Default)]
pub struct NullRateLimiter;

impl RateLimiter for NullRateLimiter {
    fn consume_units<'a>(
        &'a self,
        _units: i64,
        _timeout: Duration,
        _consume_on_timeout: bool,
        _cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Duration, Error>> {
        Box::pin(async { Ok(Duration::ZERO) })
    }

    fn set_limit(&self, _units_per_second: f64) {}

    fn handle_throttle(&self) {}

    fn limit(&self) -> f64 {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    async fn consume(l: &SimpleRateLimiter, units: i64) -> Duration {
        l.consume_units(units, Duration::ZERO, false, &token())
            .await
            .unwrap()
    }

    // ── basic pacing ───────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn disabled_limiter_never_sleeps() {
        let l = SimpleRateLimiter::new(0.0);
        assert_eq!(consume(&l, 1_000_000).await, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn first_consume_is_free_second_waits() {
        let l = SimpleRateLimiter::new(10.0);
        // Under limit: charge advances next but returns immediately.
        assert_eq!(consume(&l, 10).await, Duration::ZERO);
        // Now one second over; the next consume waits it out.
        let slept = consume(&l, 1).await;
        assert!(slept >= Duration::from_millis(990), "slept {slept:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn returning_units_never_sleeps() {
        let l = SimpleRateLimiter::new(1.0);
        consume(&l, 100).await;
        assert_eq!(consume(&l, -50).await, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn sequential_consumers_are_staggered() {
        let l = SimpleRateLimiter::new(1.0);
        consume(&l, 1).await;
        let first = consume(&l, 1).await;
        let second = consume(&l, 1).await;
        assert!(first <= second, "{first:?} > {second:?}");
    }

    // ── timeout semantics ──────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn over_timeout_without_consume_fails_and_does_not_charge() {
        let l = SimpleRateLimiter::new(1.0);
        consume(&l, 1000).await;

        let err = l
            .consume_units(1, Duration::from_millis(10), false, &token())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));

        // Not charged: the backlog is still exactly 1000 units. Waiting it
        // out takes ~1000s, not 1001.
        let slept = consume(&l, 0).await;
        assert!(slept <= Duration::from_secs(1000), "slept {slept:?}");
        assert!(slept >= Duration::from_secs(999), "slept {slept:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn over_timeout_with_consume_charges_and_reports_timeout() {
        let l = SimpleRateLimiter::new(1.0);
        consume(&l, 100).await;

        let slept = l
            .consume_units(5, Duration::from_millis(10), true, &token())
            .await
            .unwrap();
        assert_eq!(slept, Duration::from_millis(10));

        // Charged: backlog is now ~105 units.
        let wait = consume(&l, 0).await;
        assert!(wait >= Duration::from_secs(104), "waited {wait:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_wait() {
        let l = SimpleRateLimiter::new(1.0);
        consume(&l, 100).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = l
            .consume_units(1, Duration::ZERO, false, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    // ── burst window ───────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn credit_is_capped_by_burst_duration() {
        let l = SimpleRateLimiter::with_burst(10.0, Duration::from_secs(1));
        // Idle for a long time: credit would be enormous, but is clamped to
        // one burst window (10 units at 10/s).
        tokio::time::advance(Duration::from_secs(3600)).await;
        consume(&l, 10).await;
        consume(&l, 10).await;
        // Two windows charged against one banked window: ~1s over.
        let slept = consume(&l, 0).await;
        assert!(slept >= Duration::from_millis(900), "slept {slept:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_feedback_discards_credit() {
        let l = SimpleRateLimiter::new(10.0);
        tokio::time::advance(Duration::from_millis(500)).await;
        l.handle_throttle();
        // The 5 banked units are gone: charging 5 pushes next past now.
        consume(&l, 5).await;
        let slept = consume(&l, 0).await;
        assert!(slept >= Duration::from_millis(400), "slept {slept:?}");
    }

    // ── limit changes ──────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn set_limit_prorates_idle_credit() {
        let l = SimpleRateLimiter::new(10.0);
        // Bank 5 units of credit (500ms at 100ms/unit).
        tokio::time::advance(Duration::from_millis(500)).await;
        // Halve the rate; the 5 banked units should survive as 1000ms.
        l.set_limit(5.0);
        consume(&l, 6).await;
        // 6 units at 200ms = 1200ms charged against 1000ms credit.
        let slept = consume(&l, 0).await;
        assert!(slept >= Duration::from_millis(150), "slept {slept:?}");
        assert!(slept <= Duration::from_millis(250), "slept {slept:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn set_limit_at_the_limit_keeps_next_fixed() {
        let l = SimpleRateLimiter::new(10.0);
        consume(&l, 10).await; // next is ~1s in the future
        l.set_limit(20.0);
        // No proration when not idle: the backlog instant is unchanged.
        let slept = consume(&l, 0).await;
        assert!(slept >= Duration::from_millis(900), "slept {slept:?}");
        assert!(slept <= Duration::from_millis(1100), "slept {slept:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn set_limit_nonpositive_disables() {
        let l = SimpleRateLimiter::new(10.0);
        l.set_limit(0.0);
        assert_eq!(l.limit(), 0.0);
        assert_eq!(consume(&l, 1_000_000).await, Duration::ZERO);
    }

    // ── sliding-window property ────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn charged_units_bounded_by_rate_times_window() {
        // Property: across a window of W + burst seconds, at most
        // R * (W + burst) units are charged without erroring.
        let rate = 50.0;
        let l = SimpleRateLimiter::new(rate);
        let start = Instant::now();
        let mut charged: i64 = 0;
        while Instant::now().duration_since(start) < Duration::from_secs(4) {
            l.consume_units(5, Duration::ZERO, false, &token())
                .await
                .unwrap();
            charged += 5;
        }
        let window = Instant::now().duration_since(start) + DEFAULT_BURST;
        let bound = (rate * window.as_secs_f64()).ceil() as i64 + 5;
        assert!(charged <= bound, "charged {charged} > bound {bound}");
    }
}

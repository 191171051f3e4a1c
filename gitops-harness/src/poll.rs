//! Eventual-consistency polling.
//!
//! Every convergence assertion in the suite is built on [`until`]: evaluate
//! a condition against live state on a fixed cadence until it holds or the
//! deadline elapses. The cadence is constant: the convergence windows under
//! test are seconds long, and backoff would reduce polling resolution
//! exactly when it matters most.

use std::thread;
use std::time::{Duration, Instant};

use crate::errors::PollError;

/// Default tick for convergence checks.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Repeatedly evaluate `condition` until it succeeds or `timeout` elapses.
///
/// Any `Err` from the condition means "not yet converged, retry"; the engine
/// does not distinguish transient from permanent failures. On timeout the
/// returned [`PollError`] carries the last condition error observed, so the
/// failure names the final divergence rather than a bare "timed out".
///
/// The condition is evaluated once immediately, then once per tick; it is
/// never invoked concurrently with itself. The engine sleeps at most the
/// remaining time to the deadline, so it returns within one tick of it.
/// A condition that blocks internally is not interrupted; conditions are
/// expected to bound their own work (command timeouts, HTTP timeouts).
pub fn until<F>(timeout: Duration, interval: Duration, mut condition: F) -> Result<(), PollError>
where
    F: FnMut() -> anyhow::Result<()>,
{
    let deadline = Instant::now() + timeout;

    let mut last = match condition() {
        Ok(()) => return Ok(()),
        Err(err) => err,
    };

    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(PollError { timeout, last });
        }
        thread::sleep(interval.min(deadline - now));

        match condition() {
            Ok(()) => return Ok(()),
            Err(err) => last = err,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::time::Instant;

    const TICK: Duration = Duration::from_millis(10);

    #[test]
    fn test_until_returns_immediately_on_success() {
        let start = Instant::now();
        let result = until(Duration::from_secs(5), TICK, || Ok(()));
        assert!(result.is_ok());
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_until_succeeds_within_one_tick_of_convergence() {
        let mut calls = 0;
        let result = until(Duration::from_secs(5), TICK, || {
            calls += 1;
            if calls >= 3 {
                Ok(())
            } else {
                bail!("not yet")
            }
        });
        assert!(result.is_ok());
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_until_timeout_carries_last_error() {
        let mut calls = 0;
        let err = until(Duration::from_millis(50), TICK, || {
            calls += 1;
            bail!("marker still at def456 (attempt {calls})")
        })
        .unwrap_err();

        assert!(err.to_string().contains("def456"));
        // The reported failure is the most recent one, not the first.
        assert!(err.to_string().contains(&format!("attempt {calls}")));
    }

    #[test]
    fn test_until_timeout_respects_deadline_bounds() {
        let timeout = Duration::from_millis(60);
        let start = Instant::now();
        let result = until(timeout, TICK, || bail!("never"));
        let elapsed = start.elapsed();

        assert!(result.is_err());
        assert!(elapsed >= timeout, "returned before the deadline");
        // No more than one tick (plus scheduling slack) past the deadline.
        assert!(elapsed < timeout + Duration::from_millis(500));
    }

    #[test]
    fn test_until_zero_timeout_still_evaluates_once() {
        let mut calls = 0;
        let result = until(Duration::ZERO, TICK, || {
            calls += 1;
            bail!("nope")
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}

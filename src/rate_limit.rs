//! Per-worker speed ceiling
//!
//! Compares a worker's throughput since its last report tick against a
//! configured ceiling. A worker over the ceiling pauses briefly and checks
//! again without issuing I/O.

use std::time::{Duration, Instant};

use crate::stats::Account;

/// How long a throttled worker sleeps before re-checking.
pub const THROTTLE_PAUSE: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedLimit {
    max_mbps: f64,
}

impl SpeedLimit {
    /// A ceiling of zero (or anything not positive) means unlimited.
    pub fn new(max_mbps: f64) -> Option<Self> {
        (max_mbps > 0.0).then_some(Self { max_mbps })
    }

    /// True when the worker behind `account` must hold off at `now`.
    pub fn exceeded(&self, account: &Account, now: Instant) -> bool {
        account.instant_mbps(now) > self.max_mbps
    }
}

/// Error returned when a ceiling is not a usable number
#[derive(Debug, Clone)]
pub struct SpeedLimitError {
    pub value: f64,
}

impl std::fmt::Display for SpeedLimitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Invalid speed ceiling {}: must be finite and non-negative",
            self.value
        )
    }
}

impl std::error::Error for SpeedLimitError {}

/// Check a ceiling before it is sent to a peer
pub fn validate_max_speed(value: f64) -> Result<(), SpeedLimitError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(SpeedLimitError { value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_is_unlimited() {
        assert!(SpeedLimit::new(0.0).is_none());
        assert!(SpeedLimit::new(-5.0).is_none());
        assert_eq!(SpeedLimit::new(10.0), Some(SpeedLimit { max_mbps: 10.0 }));
    }

    #[test]
    fn test_exceeded_since_last_tick() {
        let start = Instant::now();
        let limit = SpeedLimit::new(10.0).unwrap();
        let mut account = Account::new(start);

        // 125 KB in 100 ms is exactly 10 Mbps, which is allowed
        account.record(125_000);
        assert!(!limit.exceeded(&account, start + Duration::from_millis(100)));

        account.record(1);
        assert!(limit.exceeded(&account, start + Duration::from_millis(100)));

        // Waiting brings the rate back under the ceiling
        assert!(!limit.exceeded(&account, start + Duration::from_millis(200)));
    }

    #[test]
    fn test_zero_elapsed_never_throttles() {
        let start = Instant::now();
        let limit = SpeedLimit::new(1.0).unwrap();
        let mut account = Account::new(start);
        account.record(1_000_000);
        assert!(!limit.exceeded(&account, start));
    }

    #[test]
    fn test_validate_max_speed() {
        assert!(validate_max_speed(0.0).is_ok());
        assert!(validate_max_speed(950.5).is_ok());
        assert!(validate_max_speed(-1.0).is_err());
        assert!(validate_max_speed(f64::NAN).is_err());
        assert!(validate_max_speed(f64::INFINITY).is_err());
    }
}

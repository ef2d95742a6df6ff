//! Wall-clock timestamps and the injectable clock.
//!
//! The application runtime and the native layer exchange wall-clock
//! timestamps as fractional seconds since the Unix epoch. All
//! reconciliation arithmetic (margins of error, app-start durations,
//! forward-only end extension) happens on this representation, so it gets
//! its own newtype instead of raw `f64`s scattered through the codebase.
//!
//! Deadlines and TTLs are *not* wall-clock concerns; those use
//! `tokio::time` internally so tests can pause the scheduler. The `Clock`
//! trait here only covers wall-clock sampling, which tests replace with
//! [`ManualClock`].

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Wall-clock instant in fractional seconds since the Unix epoch.
///
/// This is the **physical timestamp** reported by either side of the
/// bridge; the two sides share no clock, so two timestamps are only
/// comparable within a configured margin of error.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(f64);

impl Timestamp {
    /// Construct from fractional seconds since the Unix epoch.
    pub fn from_secs(secs: f64) -> Self {
        Timestamp(secs)
    }

    /// Construct from milliseconds since the Unix epoch.
    pub fn from_millis(millis: f64) -> Self {
        Timestamp(millis / 1000.0)
    }

    /// Fractional seconds since the Unix epoch.
    pub fn as_secs(&self) -> f64 {
        self.0
    }

    /// Milliseconds since the Unix epoch.
    pub fn as_millis(&self) -> f64 {
        self.0 * 1000.0
    }

    /// Signed distance from `earlier` to `self`, in seconds.
    ///
    /// Negative when `self` precedes `earlier`; callers decide what a
    /// negative duration means (clock skew, delayed process resume).
    pub fn seconds_since(&self, earlier: Timestamp) -> f64 {
        self.0 - earlier.0
    }

    /// Signed distance from `earlier` to `self`, in milliseconds.
    pub fn millis_since(&self, earlier: Timestamp) -> f64 {
        self.seconds_since(earlier) * 1000.0
    }

    /// Whether two independently captured timestamps correspond to the
    /// same moment within `margin`.
    pub fn is_close(&self, other: Timestamp, margin: Duration) -> bool {
        (self.0 - other.0).abs() < margin.as_secs_f64()
    }

    /// The later of two timestamps.
    pub fn max(self, other: Timestamp) -> Timestamp {
        if other.0 > self.0 {
            other
        } else {
            self
        }
    }

    /// Shift forward by `d`.
    pub fn add(self, d: Duration) -> Timestamp {
        Timestamp(self.0 + d.as_secs_f64())
    }

    /// Shift backward by `d`.
    pub fn sub(self, d: Duration) -> Timestamp {
        Timestamp(self.0 - d.as_secs_f64())
    }
}

/// Source of wall-clock timestamps.
///
/// Production uses [`SystemClock`]; tests inject [`ManualClock`] so
/// capture timestamps are deterministic and margin-of-error paths can be
/// exercised exactly.
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> Timestamp;
}

/// System wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Timestamp(elapsed.as_secs_f64())
    }
}

/// Manually driven clock for tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<f64>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: Timestamp) -> Self {
        ManualClock {
            now: Mutex::new(start.as_secs()),
        }
    }

    /// Move the clock to an absolute time.
    pub fn set(&self, to: Timestamp) {
        *self.now.lock().unwrap() = to.as_secs();
    }

    /// Advance the clock by `d`.
    pub fn advance(&self, d: Duration) {
        *self.now.lock().unwrap() += d.as_secs_f64();
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp(*self.now.lock().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seconds_and_millis_round_trip() {
        let ts = Timestamp::from_millis(1_700_000_000_123.0);
        assert!((ts.as_secs() - 1_700_000_000.123).abs() < 1e-9);
        assert!((ts.as_millis() - 1_700_000_000_123.0).abs() < 1e-3);
    }

    #[test]
    fn test_signed_distance() {
        let a = Timestamp::from_secs(100.0);
        let b = Timestamp::from_secs(99.5);
        assert!((a.seconds_since(b) - 0.5).abs() < 1e-9);
        assert!((b.seconds_since(a) + 0.5).abs() < 1e-9);
        assert!((b.millis_since(a) + 500.0).abs() < 1e-6);
    }

    #[test]
    fn test_is_close_within_margin() {
        let margin = Duration::from_millis(50);
        let a = Timestamp::from_secs(10.0);

        assert!(a.is_close(Timestamp::from_secs(10.049), margin));
        assert!(a.is_close(Timestamp::from_secs(9.951), margin));
        // The margin is exclusive: exactly 50ms apart is not close.
        assert!(!a.is_close(Timestamp::from_secs(10.050), margin));
        assert!(!a.is_close(Timestamp::from_secs(10.051), margin));
    }

    #[test]
    fn test_max_picks_later() {
        let a = Timestamp::from_secs(1.0);
        let b = Timestamp::from_secs(2.0);
        assert_eq!(a.max(b), b);
        assert_eq!(b.max(a), b);
        assert_eq!(a.max(a), a);
    }

    #[test]
    fn test_add_sub() {
        let a = Timestamp::from_secs(10.0);
        assert_eq!(a.add(Duration::from_millis(500)), Timestamp::from_secs(10.5));
        assert_eq!(a.sub(Duration::from_secs(1)), Timestamp::from_secs(9.0));
    }

    #[test]
    fn test_system_clock_is_monotonic_enough() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b.as_secs() >= a.as_secs());
        // Sanity: we are past 2020 and before year ~5138.
        assert!(a.as_secs() > 1_577_836_800.0);
        assert!(a.as_secs() < 100_000_000_000.0);
    }

    #[test]
    fn test_manual_clock_set_and_advance() {
        let clock = ManualClock::new(Timestamp::from_secs(50.0));
        assert_eq!(clock.now(), Timestamp::from_secs(50.0));

        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now(), Timestamp::from_secs(50.25));

        clock.set(Timestamp::from_secs(7.0));
        assert_eq!(clock.now(), Timestamp::from_secs(7.0));
    }

    #[test]
    fn test_serde_transparent() {
        let ts = Timestamp::from_secs(1234.5);
        let json = serde_json::to_string(&ts).unwrap();
        assert_eq!(json, "1234.5");
        let back: Timestamp = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ts);
    }
}

//! Policy configuration.
//!
//! Every threshold in the reconciliation core is policy, not invariant:
//! the margin of error, the app-start bounds and the race deadlines were
//! all measured into existence on real devices, so they live here as
//! plain data with the production defaults.

use std::time::Duration;

/// Tunables for the whole timing core.
#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// Maximum drift between two independently captured timestamps before
    /// they are considered non-corresponding.
    pub margin_of_error: Duration,

    /// Deadline for a single native frame-snapshot fetch.
    pub frames_fetch_deadline: Duration,

    /// How long a start frame snapshot waits for its span to end.
    pub start_frames_ttl: Duration,

    /// How long an end frame snapshot waits for event finalization.
    pub end_frames_ttl: Duration,

    /// How long a resolved display timestamp waits to be consumed.
    pub display_ttl: Duration,

    /// Sweep interval for all expiring maps; coarser than the TTLs.
    pub cleanup_interval: Duration,

    /// App starts longer than this are discarded as clock skew.
    pub max_app_start_duration: Duration,

    /// App-start timestamps older than this relative to the transaction
    /// start are discarded as stale.
    pub max_app_start_age: Duration,

    /// Hard timeout for the next-frame race.
    pub next_frame_deadline: Duration,

    /// Full-display durations beyond this fall back to the
    /// initial-display measurement.
    pub full_display_deadline: Duration,

    /// Development mode: attach out-of-range app starts anyway so they
    /// can be diagnosed.
    pub debug_mode: bool,
}

impl Default for TimingConfig {
    fn default() -> Self {
        TimingConfig {
            margin_of_error: Duration::from_millis(50),
            frames_fetch_deadline: Duration::from_secs(2),
            start_frames_ttl: Duration::from_secs(60),
            end_frames_ttl: Duration::from_secs(2),
            display_ttl: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(5),
            max_app_start_duration: Duration::from_secs(60),
            max_app_start_age: Duration::from_secs(60),
            next_frame_deadline: Duration::from_secs(10),
            full_display_deadline: Duration::from_secs(30),
            debug_mode: false,
        }
    }
}

impl TimingConfig {
    /// Production defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults with development mode on.
    pub fn development() -> Self {
        TimingConfig {
            debug_mode: true,
            ..Self::default()
        }
    }
}

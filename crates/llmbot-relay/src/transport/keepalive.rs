//! Wall-clock aligned heartbeat scheduling

use chrono::Utc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// Heartbeat cadence; frames go out on every 6th second boundary
pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(6);

/// Time from `now_millis` (unix epoch) until the next multiple of `period`
///
/// Exactly on a boundary the *next* boundary is returned, so the result is
/// always in `(0, period]`.
pub fn delay_to_boundary(now_millis: i64, period: Duration) -> Duration {
    let period_ms = period.as_millis().max(1) as i64;
    let elapsed = now_millis.rem_euclid(period_ms);
    Duration::from_millis((period_ms - elapsed) as u64)
}

/// Interval whose first tick lands on the next wall-clock boundary
pub(crate) fn aligned_interval(period: Duration) -> Interval {
    let delay = delay_to_boundary(Utc::now().timestamp_millis(), period);
    let mut interval = interval_at(Instant::now() + delay, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

//! Retry backoff policy for recovery tasks.

use chrono::Duration;
use pacrelay_db::TaskPriority;

/// Delay table in minutes, keyed by the post-increment attempt count.
/// Attempts beyond the table fall back to the longest delay.
const DELAY_MINUTES: [(i32, i64); 3] = [(1, 2), (2, 5), (3, 10)];
const DEFAULT_DELAY_MINUTES: i64 = 10;

/// Minimum delay for high-priority tasks after halving.
const HIGH_PRIORITY_FLOOR_MINUTES: i64 = 1;

/// How long to wait before the next attempt of a task that just failed.
///
/// High-priority tasks use half the computed delay, floored at one minute,
/// so urgent recoveries come back faster without hammering the PAC.
pub fn retry_delay(attempts: i32, priority: TaskPriority) -> Duration {
    let minutes = DELAY_MINUTES
        .iter()
        .find(|(count, _)| *count == attempts)
        .map(|(_, minutes)| *minutes)
        .unwrap_or(DEFAULT_DELAY_MINUTES);

    let minutes = if priority == TaskPriority::High {
        (minutes / 2).max(HIGH_PRIORITY_FLOOR_MINUTES)
    } else {
        minutes
    };

    Duration::minutes(minutes)
}

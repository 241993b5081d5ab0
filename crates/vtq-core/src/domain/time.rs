//! Time helpers shared by the store and the engine.
//!
//! ストアは UTC の epoch ミリ秒で時刻を保持します。
//! 終端状態のタスクの `visible_at` は「二度と見えない」番兵値に固定されます。

use chrono::{DateTime, Utc};
use std::time::Duration;

/// `visible_at` sentinel for tasks that must never be selected again.
pub const NEVER_VISIBLE_MS: i64 = i64::MAX;

pub fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// epoch ミリ秒から復元。番兵値と範囲外は None
pub fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    if ms == NEVER_VISIBLE_MS {
        return None;
    }
    DateTime::<Utc>::from_timestamp_millis(ms)
}

/// `at + delay`, saturating at the far end of the representable range.
pub fn after(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    let ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
    chrono::Duration::try_milliseconds(ms)
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

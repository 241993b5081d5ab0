//! Status - キューの集計ビュー
//!
//! 期限切れの lease は store 上は LEASED のままですが、
//! 再選択可能なので集計では pending 側に数えます。

use serde::{Deserialize, Serialize};

use crate::domain::TaskStatus;

/// Task counts of one workspace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    /// PENDING と期限切れ LEASED の合計
    pub pending: u64,
    /// 有効な lease を持つもの
    pub leased: u64,
    /// `pending` のうち期限切れ lease の件数
    pub expired_leases: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl QueueCounts {
    pub fn from_rows(rows: &[(TaskStatus, u64)], expired_leases: u64) -> Self {
        let mut counts = QueueCounts::default();
        for &(status, n) in rows {
            match status {
                TaskStatus::Pending => counts.pending += n,
                TaskStatus::Leased => counts.leased += n,
                TaskStatus::Succeeded => counts.succeeded += n,
                TaskStatus::Failed => counts.failed += n,
            }
        }
        let expired = expired_leases.min(counts.leased);
        counts.leased -= expired;
        counts.pending += expired;
        counts.expired_leases = expired;
        counts
    }

    /// Non-terminal tasks.
    pub fn live(&self) -> u64 {
        self.pending + self.leased
    }

    pub fn total(&self) -> u64 {
        self.live() + self.succeeded + self.failed
    }
}

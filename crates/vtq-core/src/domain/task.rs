//! Task - キューに積まれるペイロードとその記録
//!
//! - [`Task`]: receive で consumer に渡す値（id + payload）
//! - [`TaskRecord`]: ストアの行全体（状態確認用）
//! - [`NewTask`]: enqueue 時に挿入する行
//! - [`TaskError`]: nack/retry で残すエラー履歴（追記のみ）

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::ids::TaskId;
use super::state::TaskStatus;

pub const DEFAULT_TASK_PRIORITY: i64 = 50;

/// A leased task as handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub vqueue_name: String,
    pub data: Vec<u8>,
    pub priority: i64,
    /// lease の期限（これを過ぎると再配送され得る）
    pub visible_at: DateTime<Utc>,
    /// 何回目の lease か（1 始まり）
    pub lease_count: i64,
}

/// Full stored state of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub vqueue_name: String,
    pub data: Vec<u8>,
    pub priority: i64,
    pub status: TaskStatus,
    /// None は「二度と選択されない」（終端状態）
    pub visible_at: Option<DateTime<Utc>>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub lease_count: i64,
    pub retries: i64,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// LEASED かつ期限切れ（再選択可能）か
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Leased && self.visible_at.is_some_and(|at| at <= now)
    }
}

/// Row inserted by enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    pub id: TaskId,
    pub vqueue_name: String,
    pub data: Vec<u8>,
    pub priority: i64,
    pub queued_at: DateTime<Utc>,
    pub visible_at: DateTime<Utc>,
}

/// Append-only error history entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub task_id: TaskId,
    pub error_message: String,
    pub happened_at: DateTime<Utc>,
}

/// Mutable fields accepted by `update`.
///
/// data / vqueue_name / priority は作成後に変更できません。
/// 変更できるのは可視性だけ（lease の延長、または PENDING の後ろ倒し）。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskUpdate {
    /// `visible_at = now + visible_after`
    pub visible_after: Option<Duration>,
}

impl TaskUpdate {
    pub fn visible_after(delay: Duration) -> Self {
        Self {
            visible_after: Some(delay),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.visible_after.is_none()
    }
}

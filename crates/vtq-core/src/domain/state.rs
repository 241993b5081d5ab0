//! State - タスクの状態と遷移
//!
//! # 状態遷移
//! ```text
//! PENDING(0) --lease--> LEASED(50) --ack--> SUCCEEDED(100)
//!     ^                   |    |
//!     +-----requeue-------+    +--nack--> FAILED(101)
//!     +-----------------retry---------------+
//! ```
//!
//! Lease の期限切れは明示的な遷移を持ちません。`LEASED` のまま
//! `visible_at <= now` になったタスクは再び選択可能になります。
//!
//! ここでは遷移の「ガード」と「効果」だけを定義し、ストアへの適用は
//! `app::state_machine` が行います。

use serde::{Deserialize, Serialize};
use std::fmt;

/// TaskStatus はストアに保存される整数コードと 1:1 に対応する
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Leased,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Pending,
        TaskStatus::Leased,
        TaskStatus::Succeeded,
        TaskStatus::Failed,
    ];

    /// Statuses a task can be claimed from (subject to `visible_at`).
    pub const SELECTABLE: &'static [TaskStatus] = &[TaskStatus::Pending, TaskStatus::Leased];

    /// ストア上の整数コード
    pub fn code(self) -> i64 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Leased => 50,
            TaskStatus::Succeeded => 100,
            TaskStatus::Failed => 101,
        }
    }

    /// 整数コードから復元（未知のコードは None）
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(TaskStatus::Pending),
            50 => Some(TaskStatus::Leased),
            100 => Some(TaskStatus::Succeeded),
            101 => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.code() >= 100
    }

    pub fn is_pending(self) -> bool {
        self.code() < 10
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Leased => "leased",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Consumer-driven transitions of an existing task.
///
/// Lease は Selection Engine が独自のガード（visible_at, hidden, lease_count）
/// で行うため、ここには含めません。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Ack,
    Nack,
    Requeue,
    Retry,
}

impl Transition {
    /// 遷移元として許される状態
    pub fn from(self) -> &'static [TaskStatus] {
        match self {
            Transition::Ack | Transition::Nack | Transition::Requeue => &[TaskStatus::Leased],
            Transition::Retry => &[TaskStatus::Failed],
        }
    }

    /// 遷移先
    pub fn to(self) -> TaskStatus {
        match self {
            Transition::Ack => TaskStatus::Succeeded,
            Transition::Nack => TaskStatus::Failed,
            Transition::Requeue | Transition::Retry => TaskStatus::Pending,
        }
    }

    /// Whether finding the task already at `status` counts as success.
    ///
    /// ack/nack は同じ終端状態なら冪等。requeue は PENDING なら冪等。
    /// retry は FAILED からのみで、PENDING の再適用は失敗扱い。
    pub fn is_idempotent_at(self, status: TaskStatus) -> bool {
        match self {
            Transition::Ack => status == TaskStatus::Succeeded,
            Transition::Nack => status == TaskStatus::Failed,
            Transition::Requeue => status == TaskStatus::Pending,
            Transition::Retry => false,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Transition::Ack => "ack",
            Transition::Nack => "nack",
            Transition::Requeue => "requeue",
            Transition::Retry => "retry",
        }
    }
}

/// 遷移を適用した結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// ガードを満たし、状態を更新した
    Applied,
    /// すでに遷移先にいた（冪等な成功）
    AlreadyApplied,
    /// タスクが存在しない
    NotFound,
    /// 現在の状態からは遷移できない
    InvalidState(TaskStatus),
}

impl TransitionOutcome {
    /// 呼び出し側に返す bool
    pub fn succeeded(self) -> bool {
        matches!(
            self,
            TransitionOutcome::Applied | TransitionOutcome::AlreadyApplied
        )
    }

    /// Classifies a guarded update that touched no row.
    pub fn classify(transition: Transition, current: Option<TaskStatus>) -> Self {
        match current {
            None => TransitionOutcome::NotFound,
            Some(status) if transition.is_idempotent_at(status) => {
                TransitionOutcome::AlreadyApplied
            }
            Some(status) => TransitionOutcome::InvalidState(status),
        }
    }
}

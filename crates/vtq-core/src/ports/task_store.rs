//! TaskStore port - タスクと VQ の正本（source of truth）
//!
//! # 責務
//! - トランザクション境界の提供（closure スコープ: Ok で commit、Err / panic で rollback）
//! - 条件付き更新（ガード付き UPDATE、影響行数を返す）
//! - 選択エンジンが使う 3 つの問い合わせ（最大 priority、bucket 重み、bucket 先頭）
//! - VQ の存在チェック（外部キー違反 / 一意性違反を区別して返す）
//!
//! 同期 API です。async 側からは `spawn_blocking` 越しに呼びます。

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::domain::{
    NewTask, StoreError, TaskError, TaskId, TaskRecord, TaskStatus, VirtualQueue,
};

/// TaskStore はトランザクションを開くだけの薄い trait
///
/// 複数の broker プロセスが同じストアを共有しても、
/// 排他は `update_task_where` のガードだけで成立する前提です。
pub trait TaskStore: Send + Sync + 'static {
    /// Runs `f` inside one transaction.
    ///
    /// `f` が Ok を返せば commit、Err を返すか panic すれば rollback。
    fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn StoreTx) -> Result<T, E>,
        E: From<StoreError>;
}

/// `visible_at` の書き込み値
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    At(DateTime<Utc>),
    Never,
}

/// Preconditions of a conditional task update. All set fields must hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskGuard<'a> {
    pub statuses: &'a [TaskStatus],
    /// `visible_at <= due_by`
    pub due_by: Option<DateTime<Utc>>,
    /// `lease_count = expected`（楽観的バージョン）
    pub lease_count: Option<i64>,
    /// 所属 VQ が hidden でないこと
    pub vqueue_visible: bool,
}

impl<'a> TaskGuard<'a> {
    pub fn status_in(statuses: &'a [TaskStatus]) -> Self {
        Self {
            statuses,
            due_by: None,
            lease_count: None,
            vqueue_visible: false,
        }
    }

    pub fn due_by(mut self, now: DateTime<Utc>) -> Self {
        self.due_by = Some(now);
        self
    }

    pub fn lease_count(mut self, expected: i64) -> Self {
        self.lease_count = Some(expected);
        self
    }

    pub fn vqueue_visible(mut self) -> Self {
        self.vqueue_visible = true;
        self
    }
}

/// Fields written by a conditional task update. Unset fields are left alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskChange {
    pub status: Option<TaskStatus>,
    pub visible_at: Option<Visibility>,
    pub started_at: Option<DateTime<Utc>>,
    /// `Some(None)` clears `ended_at`
    pub ended_at: Option<Option<DateTime<Utc>>>,
    pub bump_lease_count: bool,
    pub bump_retries: bool,
    pub updated_at: DateTime<Utc>,
}

impl TaskChange {
    pub fn at(updated_at: DateTime<Utc>) -> Self {
        Self {
            status: None,
            visible_at: None,
            started_at: None,
            ended_at: None,
            bump_lease_count: false,
            bump_retries: false,
            updated_at,
        }
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn visible(mut self, visibility: Visibility) -> Self {
        self.visible_at = Some(visibility);
        self
    }

    pub fn started(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn ended(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.ended_at = Some(at);
        self
    }

    pub fn bump_lease_count(mut self) -> Self {
        self.bump_lease_count = true;
        self
    }

    pub fn bump_retries(mut self) -> Self {
        self.bump_retries = true;
        self
    }
}

/// Summed weight of one bucket among VQs that have ready tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketWeight {
    pub bucket_name: String,
    pub weight: u64,
}

/// The head of a bucket, as observed by the selection query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub id: TaskId,
    pub vqueue_name: String,
    pub lease_count: i64,
    pub visibility_timeout: Duration,
}

/// Primitives available inside a transaction.
///
/// 「ready」は `status IN (PENDING, LEASED) AND visible_at <= now AND VQ.hidden = false`。
/// LEASED で期限切れのタスクも ready に含めます。
pub trait StoreTx {
    // ---- virtual queues ----

    fn find_vqueue(&mut self, name: &str) -> Result<Option<VirtualQueue>, StoreError>;

    /// 既存なら `StoreError::DuplicateVirtualQueue`
    fn insert_vqueue(&mut self, vqueue: &VirtualQueue) -> Result<(), StoreError>;

    fn list_vqueues(&mut self) -> Result<Vec<VirtualQueue>, StoreError>;

    /// Operator pause / resume on the named VQs; returns rows that changed.
    ///
    /// limiter が立てた hidden に pause を掛けると、所有者が運用者に移ります。
    fn set_vqueue_hidden(
        &mut self,
        names: &[String],
        hidden: bool,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError>;

    /// Hides the visible VQs among `names` on behalf of `limiter`; returns those hidden.
    fn hide_vqueues_for(
        &mut self,
        limiter: &str,
        names: &[String],
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError>;

    /// Un-hides every VQ hidden by `limiter`; returns their names.
    fn unhide_vqueues_of(
        &mut self,
        limiter: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError>;

    // ---- tasks ----

    /// VQ が無ければ `StoreError::MissingVirtualQueue`
    fn insert_task(&mut self, task: &NewTask) -> Result<(), StoreError>;

    fn get_task(&mut self, id: TaskId) -> Result<Option<TaskRecord>, StoreError>;

    fn task_status(&mut self, id: TaskId) -> Result<Option<TaskStatus>, StoreError>;

    /// Applies `change` if `guard` holds; returns affected rows (0 or 1).
    fn update_task_where(
        &mut self,
        id: TaskId,
        guard: &TaskGuard<'_>,
        change: &TaskChange,
    ) -> Result<usize, StoreError>;

    /// エラー履歴ごと削除。存在しなければ false
    fn delete_task(&mut self, id: TaskId) -> Result<bool, StoreError>;

    fn append_error(&mut self, error: &TaskError) -> Result<(), StoreError>;

    fn task_errors(&mut self, id: TaskId) -> Result<Vec<TaskError>, StoreError>;

    // ---- selection ----

    /// Highest VQ priority among ready tasks.
    fn max_ready_priority(&mut self, now: DateTime<Utc>) -> Result<Option<i64>, StoreError>;

    /// Buckets of the layer, each weighted by the VQs that have ready tasks.
    /// Ordered by bucket name.
    fn ready_buckets(
        &mut self,
        now: DateTime<Utc>,
        priority: i64,
    ) -> Result<Vec<BucketWeight>, StoreError>;

    /// Highest task priority, then earliest queued_at, then insertion order.
    fn head_of_bucket(
        &mut self,
        now: DateTime<Utc>,
        priority: i64,
        bucket_name: &str,
    ) -> Result<Option<Candidate>, StoreError>;

    /// Earliest future `visible_at` among non-terminal tasks of visible VQs.
    fn next_visible_at(&mut self, now: DateTime<Utc>)
    -> Result<Option<DateTime<Utc>>, StoreError>;

    // ---- inspection ----

    fn count_by_status(&mut self) -> Result<Vec<(TaskStatus, u64)>, StoreError>;

    /// LEASED かつ期限切れの件数
    fn count_expired_leases(&mut self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Live leases (`LEASED`, `visible_at > now`) across the named VQs.
    fn count_in_flight(
        &mut self,
        vqueues: &[String],
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Removes every task, error and VQ of the workspace.
    fn flush(&mut self) -> Result<(), StoreError>;
}

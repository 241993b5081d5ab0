//! SelectionEngine - 次に配送するタスクを選んで claim する
//!
//! # アルゴリズム（1 ラウンド）
//! 1. 候補: hidden でない VQ の、`visible_at <= now` で選択可能なタスク
//! 2. 優先度の層: 候補を持つ VQ の最大 priority に絞る
//! 3. bucket の重み付き抽選（累積和 + 二分探索）
//! 4. bucket 内: task.priority 降順 → queued_at 昇順 → 挿入順
//! 5. 条件付き UPDATE で claim。0 行なら他の consumer に取られたので 1 からやり直す
//!
//! 選択（読み取り）と claim（書き込み）は別々の短いトランザクションで、
//! 排他は claim のガードだけで成立します。

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

use super::admission::AdmissionController;
use super::weighted::WeightedTable;
use crate::domain::time;
use crate::domain::{StoreError, Task, TaskStatus};
use crate::ports::{Candidate, StoreTx, TaskChange, TaskGuard, TaskStore, Visibility};

pub struct SelectionEngine {
    admission: Arc<AdmissionController>,
    rng: Mutex<Box<dyn RngCore + Send>>,
    max_claim_attempts: u32,
}

impl SelectionEngine {
    pub fn new(admission: Arc<AdmissionController>, max_claim_attempts: u32) -> Self {
        Self {
            admission,
            rng: Mutex::new(Box::new(StdRng::from_entropy())),
            max_claim_attempts: max_claim_attempts.max(1),
        }
    }

    /// テスト用: 抽選の乱数源を差し替える
    pub fn with_rng(self, rng: impl RngCore + Send + 'static) -> Self {
        Self {
            rng: Mutex::new(Box::new(rng)),
            ..self
        }
    }

    /// Picks and leases one task. `None` when nothing is eligible.
    pub fn select_and_lease<S: TaskStore>(
        &self,
        store: &S,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError> {
        for attempt in 1..=self.max_claim_attempts {
            let Some(candidate) = store.transaction(|tx| self.pick(tx, now))? else {
                return Ok(None);
            };
            if let Some(task) = store.transaction(|tx| self.claim(tx, &candidate, now))? {
                return Ok(Some(task));
            }
            debug!(task_id = %candidate.id, attempt, "claim lost to a concurrent consumer");
        }
        warn!(
            attempts = self.max_claim_attempts,
            "giving up selection round after repeated claim conflicts"
        );
        Ok(None)
    }

    fn pick(&self, tx: &mut dyn StoreTx, now: DateTime<Utc>) -> Result<Option<Candidate>, StoreError> {
        let Some(priority) = tx.max_ready_priority(now)? else {
            return Ok(None);
        };
        let buckets = tx.ready_buckets(now, priority)?;
        let table = WeightedTable::new(buckets.iter().map(|b| b.weight));
        let index = {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            table.pick(&mut **rng)
        };
        let Some(bucket) = index.and_then(|i| buckets.get(i)) else {
            return Ok(None);
        };
        tx.head_of_bucket(now, priority, &bucket.bucket_name)
    }

    fn claim(
        &self,
        tx: &mut dyn StoreTx,
        candidate: &Candidate,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError> {
        let guard = TaskGuard::status_in(TaskStatus::SELECTABLE)
            .due_by(now)
            .lease_count(candidate.lease_count)
            .vqueue_visible();
        let lease_until = time::after(now, candidate.visibility_timeout);
        let change = TaskChange::at(now)
            .status(TaskStatus::Leased)
            .visible(Visibility::At(lease_until))
            .started(now)
            .bump_lease_count();
        if tx.update_task_where(candidate.id, &guard, &change)? == 0 {
            return Ok(None);
        }

        let record = tx
            .get_task(candidate.id)?
            .ok_or_else(|| StoreError::Corrupt(format!("claimed task {} vanished", candidate.id)))?;
        self.admission.on_dispatch(tx, &record.vqueue_name, now)?;
        debug!(task_id = %record.id, vqueue = %record.vqueue_name, lease = record.lease_count, "leased");

        Ok(Some(Task {
            id: record.id,
            vqueue_name: record.vqueue_name,
            data: record.data,
            priority: record.priority,
            visible_at: lease_until,
            lease_count: record.lease_count,
        }))
    }
}

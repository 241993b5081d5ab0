//! VQueueRegistry - VQ カタログと遅延作成
//!
//! # 遅延作成の流れ（enqueue）
//! 1. タスクを挿入する
//! 2. 外部キー違反（VQ が無い）なら、設定からポリシーを引いて
//!    「VQ 挿入 + タスク挿入」を 1 トランザクションで行う
//! 3. そこで一意性違反（他の producer が先に作った）なら 1 に戻る
//!
//! 作成した VQ はその場で rate limiter に登録します（suspend 中なら隠れた状態で生まれる）。
//!
//! 同期 API です。Coordinator が `spawn_blocking` の中から呼びます。

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};

use super::admission::AdmissionController;
use crate::domain::{NewTask, Result, StoreError, VirtualQueue, VtqError};
use crate::ports::{ConfigurationProvider, StoreTx, TaskStore};

/// 作成競合に負け続けた場合の打ち切り回数
const MAX_ENQUEUE_ROUNDS: usize = 3;

#[derive(Clone)]
pub struct VQueueRegistry {
    provider: Arc<dyn ConfigurationProvider>,
    admission: Option<Arc<AdmissionController>>,
}

impl VQueueRegistry {
    pub fn new(provider: Arc<dyn ConfigurationProvider>) -> Self {
        Self {
            provider,
            admission: None,
        }
    }

    /// 作成した VQ を `admission` の limiter に登録する
    pub fn with_admission(mut self, admission: Arc<AdmissionController>) -> Self {
        self.admission = Some(admission);
        self
    }

    pub fn provider(&self) -> &Arc<dyn ConfigurationProvider> {
        &self.provider
    }

    /// Returns the stored VQ, creating it from configuration if absent.
    pub fn ensure<S: TaskStore>(
        &self,
        store: &S,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<VirtualQueue> {
        if let Some(vqueue) = store.transaction(|tx| tx.find_vqueue(name))? {
            return Ok(vqueue);
        }
        match store.transaction(|tx| self.create(tx, name, now)) {
            Ok(vqueue) => Ok(vqueue),
            Err(VtqError::Store(StoreError::DuplicateVirtualQueue(_))) => {
                debug!(vqueue = name, "lost vqueue creation race, re-reading");
                store
                    .transaction(|tx| tx.find_vqueue(name))?
                    .ok_or_else(|| StoreError::MissingVirtualQueue(name.to_string()).into())
            }
            Err(e) => Err(e),
        }
    }

    /// Inserts `task`, materializing its VQ on first use.
    pub fn insert_task<S: TaskStore>(
        &self,
        store: &S,
        task: &NewTask,
        now: DateTime<Utc>,
    ) -> Result<()> {
        for round in 0..MAX_ENQUEUE_ROUNDS {
            match store.transaction(|tx| tx.insert_task(task)) {
                Ok(()) => return Ok(()),
                Err(StoreError::MissingVirtualQueue(_)) => {}
                Err(e) => return Err(e.into()),
            }

            let created = store.transaction(|tx| {
                let vqueue = self.create(tx, &task.vqueue_name, now)?;
                tx.insert_task(task)?;
                Ok::<_, VtqError>(vqueue)
            });
            match created {
                Ok(_) => return Ok(()),
                Err(VtqError::Store(StoreError::DuplicateVirtualQueue(_))) => {
                    debug!(vqueue = %task.vqueue_name, round, "vqueue created concurrently, retrying insert");
                }
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::MissingVirtualQueue(task.vqueue_name.clone()).into())
    }

    /// Operator pause / resume. 変化が無ければ false
    pub fn set_hidden<S: TaskStore>(
        &self,
        store: &S,
        name: &str,
        hidden: bool,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let changed =
            store.transaction(|tx| tx.set_vqueue_hidden(&[name.to_string()], hidden, now))?;
        if changed > 0 {
            info!(vqueue = name, hidden, "vqueue visibility changed");
        }
        Ok(changed > 0)
    }

    pub fn list<S: TaskStore>(&self, store: &S) -> Result<Vec<VirtualQueue>> {
        Ok(store.transaction(|tx| tx.list_vqueues())?)
    }

    fn create(&self, tx: &mut dyn StoreTx, name: &str, now: DateTime<Utc>) -> Result<VirtualQueue> {
        let policy = self
            .provider
            .policy_for(name)
            .ok_or_else(|| VtqError::ConfigurationMissing(name.to_string()))?;
        let mut vqueue = VirtualQueue::new(name, policy, now);
        tx.insert_vqueue(&vqueue)?;
        if let Some(admission) = &self.admission {
            let decision = admission.register(tx, name, now)?;
            if let Some(decision) = decision.filter(|d| d.vqueues.iter().any(|v| v == name)) {
                vqueue.hidden = true;
                vqueue.hidden_by = Some(decision.limiter);
            }
        }
        info!(
            vqueue = name,
            priority = vqueue.policy.priority,
            bucket = %vqueue.policy.bucket_name,
            "created vqueue"
        );
        Ok(vqueue)
    }
}

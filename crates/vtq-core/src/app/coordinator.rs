//! Coordinator - broker の公開 API
//!
//! # 構成
//! - store / registry / selection / state machine / admission は同期 API
//! - Coordinator が `spawn_blocking` でそれらを包み、async API として公開する
//! - notifier と ticker は long-poll の待ち時間を縮めるためだけにある
//!
//! # receive の流れ
//! 1. 待っている receiver がいなければ即時に選択する（wait = 0 なら常に）
//! 2. 空、または先客がいて wait > 0 なら、FIFO の待ち行列（公平な `Semaphore(1)`）に並ぶ
//! 3. 先頭の receiver だけが「store を見る → 通知か poll 間隔まで眠る」を繰り返す
//!
//! # キャンセル
//! receive の future が drop されても、blocking pool 上で走っている claim は止まりません。
//! claim の結果は [`Handoff`] 経由で受け取り、受け取り手がいなければ requeue します。

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::admission::AdmissionController;
use super::builder::CoordinatorBuilder;
use super::registry::VQueueRegistry;
use super::selection::SelectionEngine;
use super::state_machine::{StateMachine, TransitionArgs};
use super::status::QueueCounts;
use super::ticker::{self, TickReport, VisibilityTicker};
use crate::domain::time;
use crate::domain::{
    NewTask, Result, Task, TaskError, TaskId, TaskRecord, TaskUpdate, Transition,
    TransitionOutcome, VirtualQueue, VtqError,
};
use crate::impls::SqliteStore;
use crate::ports::{Clock, IdGenerator, Notifier, TaskStore};

pub(crate) struct Inner<S> {
    pub(crate) store: Arc<S>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) ids: Arc<dyn IdGenerator>,
    pub(crate) registry: VQueueRegistry,
    pub(crate) engine: SelectionEngine,
    pub(crate) machine: StateMachine,
    pub(crate) admission: Arc<AdmissionController>,
    pub(crate) notifier: Arc<dyn Notifier>,
    /// long-poll の待ち行列（tokio の Semaphore は FIFO で公平）
    pub(crate) waiting: Semaphore,
    pub(crate) poll_interval: Duration,
    pub(crate) closed: AtomicBool,
    pub(crate) ticker: Mutex<Option<VisibilityTicker>>,
}

/// Handle to a running broker. Cheap to clone.
pub struct Coordinator<S: TaskStore> {
    inner: Arc<Inner<S>>,
}

impl<S: TaskStore> Clone for Coordinator<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Coordinator<SqliteStore> {
    pub fn builder() -> CoordinatorBuilder {
        CoordinatorBuilder::new()
    }
}

impl<S: TaskStore> Coordinator<S> {
    pub(crate) fn from_inner(inner: Inner<S>) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.inner.store
    }

    /// Adds a task and returns its id.
    ///
    /// 未知の VQ 名は設定から遅延作成されます。`delay` の間は選択されません。
    #[instrument(skip(self, data))]
    pub async fn enqueue(
        &self,
        data: impl Into<Vec<u8>>,
        vqueue: &str,
        priority: i64,
        delay: Duration,
    ) -> Result<TaskId> {
        let data = data.into();
        let vqueue = vqueue.to_string();
        let id = self
            .blocking(move |inner| inner.enqueue(data, vqueue, priority, delay))
            .await?;
        self.inner.notifier.signal(Some(id));
        Ok(id)
    }

    /// Leases up to `max_number` tasks.
    ///
    /// 何も無ければ最大 `wait` だけ待ちます。待っている間に一部でも取れたら、
    /// その時点で返します（`max_number` に満たなくてもよい）。
    #[instrument(skip(self))]
    pub async fn receive(&self, max_number: usize, wait: Duration) -> Result<Vec<Task>> {
        self.ensure_open()?;
        if max_number == 0 {
            return Ok(Vec::new());
        }
        // 先に待っている receiver がいれば、その後ろに並ぶ
        if wait.is_zero() || self.inner.waiting.available_permits() > 0 {
            let tasks = self.claim_batch(max_number).await?;
            if !tasks.is_empty() || wait.is_zero() {
                return Ok(tasks);
            }
        }

        let deadline = Instant::now() + wait;
        let _permit = match tokio::time::timeout_at(deadline, self.inner.waiting.acquire()).await {
            Err(_) => return Ok(Vec::new()),
            Ok(Err(_)) => return Err(VtqError::Closed),
            Ok(Ok(permit)) => permit,
        };

        let mut subscription = self.inner.notifier.subscribe();
        loop {
            self.ensure_open()?;
            // store を見る前の signal は、この後の選択で拾える
            subscription.mark_seen();
            let tasks = self.claim_batch(max_number).await?;
            if !tasks.is_empty() {
                return Ok(tasks);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let budget = (deadline - now).min(self.inner.poll_interval);
            let woken = subscription.wait(budget).await;
            debug!(woken, "long-poll round finished");
        }
    }

    pub async fn ack(&self, id: TaskId) -> Result<bool> {
        self.transition(id, Transition::Ack, TransitionArgs::default())
            .await
    }

    pub async fn nack(&self, id: TaskId, error_message: &str) -> Result<bool> {
        self.transition(id, Transition::Nack, TransitionArgs::error(error_message))
            .await
    }

    /// Gives a leased task back without counting it as a failure.
    pub async fn requeue(&self, id: TaskId) -> Result<bool> {
        self.transition(id, Transition::Requeue, TransitionArgs::default())
            .await
    }

    /// Moves a failed task back to pending after `delay`.
    pub async fn retry(&self, id: TaskId, delay: Duration, error_message: &str) -> Result<bool> {
        let args = TransitionArgs {
            delay,
            error_message: Some(error_message.to_string()),
        };
        self.transition(id, Transition::Retry, args).await
    }

    pub async fn delete(&self, id: TaskId) -> Result<bool> {
        let deleted = self
            .blocking(move |inner| {
                let now = inner.clock.now();
                Ok(inner
                    .store
                    .transaction(|tx| inner.machine.delete(tx, id, now))?)
            })
            .await?;
        if deleted {
            // 並行数 limiter が開いたかもしれない
            self.inner.notifier.signal(None);
        }
        Ok(deleted)
    }

    pub async fn update(&self, id: TaskId, update: TaskUpdate) -> Result<bool> {
        let updated = self
            .blocking(move |inner| {
                let now = inner.clock.now();
                Ok(inner
                    .store
                    .transaction(|tx| inner.machine.update(tx, id, &update, now))?)
            })
            .await?;
        if updated {
            self.inner.notifier.signal(Some(id));
        }
        Ok(updated)
    }

    /// Number of tasks that are not finished.
    pub async fn len(&self) -> Result<usize> {
        let counts = self.counts().await?;
        Ok(usize::try_from(counts.live()).unwrap_or(usize::MAX))
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    pub async fn counts(&self) -> Result<QueueCounts> {
        self.blocking(|inner| {
            let now = inner.clock.now();
            let (rows, expired) = inner.store.transaction(|tx| {
                Ok::<_, VtqError>((tx.count_by_status()?, tx.count_expired_leases(now)?))
            })?;
            Ok(QueueCounts::from_rows(&rows, expired))
        })
        .await
    }

    pub async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>> {
        self.blocking(move |inner| Ok(inner.store.transaction(|tx| tx.get_task(id))?))
            .await
    }

    /// Error history of a task, oldest first.
    pub async fn errors(&self, id: TaskId) -> Result<Vec<TaskError>> {
        self.blocking(move |inner| Ok(inner.store.transaction(|tx| tx.task_errors(id))?))
            .await
    }

    pub async fn ensure_vqueue(&self, name: &str) -> Result<VirtualQueue> {
        let name = name.to_string();
        self.blocking(move |inner| {
            let now = inner.clock.now();
            inner.registry.ensure(inner.store.as_ref(), &name, now)
        })
        .await
    }

    /// Operator pause (`hidden = true`) or resume.
    pub async fn set_vqueue_hidden(&self, name: &str, hidden: bool) -> Result<bool> {
        let name = name.to_string();
        let changed = self
            .blocking(move |inner| {
                let now = inner.clock.now();
                inner
                    .registry
                    .set_hidden(inner.store.as_ref(), &name, hidden, now)
            })
            .await?;
        if changed && !hidden {
            self.inner.notifier.signal(None);
        }
        Ok(changed)
    }

    pub async fn vqueues(&self) -> Result<Vec<VirtualQueue>> {
        self.blocking(|inner| inner.registry.list(inner.store.as_ref()))
            .await
    }

    /// Names of rate limiters currently holding their VQs hidden.
    pub fn suspended_limiters(&self) -> Vec<String> {
        self.inner.admission.suspended()
    }

    /// Runs one ticker pass now.
    pub async fn sweep(&self) -> Result<TickReport> {
        let report = self
            .blocking(|inner| {
                let now = inner.clock.now();
                Ok(ticker::tick(inner.store.as_ref(), &inner.admission, now)?)
            })
            .await?;
        if report.reopened() {
            self.inner.notifier.signal(None);
        }
        Ok(report)
    }

    /// Removes every task and VQ of this workspace.
    pub async fn flush(&self) -> Result<()> {
        self.blocking(|inner| Ok(inner.store.transaction(|tx| tx.flush())?))
            .await
    }

    /// Stops the ticker and rejects further calls.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.waiting.close();
        let ticker = self
            .inner
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(ticker) = ticker {
            ticker.shutdown_and_join().await;
        }
        debug!("coordinator closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(VtqError::Closed);
        }
        Ok(())
    }

    async fn transition(
        &self,
        id: TaskId,
        transition: Transition,
        args: TransitionArgs,
    ) -> Result<bool> {
        let outcome = self
            .blocking(move |inner| {
                let now = inner.clock.now();
                Ok(inner
                    .store
                    .transaction(|tx| inner.machine.apply(tx, id, transition, &args, now))?)
            })
            .await?;
        if outcome == TransitionOutcome::Applied {
            // requeue / retry は即座に、ack / nack は limiter 経由で見えるものが増え得る
            self.inner.notifier.signal(Some(id));
        }
        Ok(outcome.succeeded())
    }

    /// One claim round on the blocking pool, protected against cancellation.
    async fn claim_batch(&self, max_number: usize) -> Result<Vec<Task>> {
        let handoff = Arc::new(Mutex::new(Handoff::default()));
        let mut guard = ClaimGuard {
            inner: Arc::clone(&self.inner),
            handoff: Arc::clone(&handoff),
            settled: false,
        };

        let inner = Arc::clone(&self.inner);
        let join = tokio::task::spawn_blocking(move || {
            let claimed = inner.claim(max_number)?;
            let mut slot = handoff.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.cancelled {
                drop(slot);
                inner.requeue_all(&claimed);
                return Ok(());
            }
            slot.claimed = Some(claimed);
            Ok::<_, VtqError>(())
        })
        .await;

        guard.settled = true;
        join??;
        let claimed = guard
            .handoff
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .claimed
            .take();
        Ok(claimed.unwrap_or_default())
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Inner<S>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.ensure_open()?;
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner)).await?
    }
}

impl<S: TaskStore> Inner<S> {
    fn enqueue(
        &self,
        data: Vec<u8>,
        vqueue: String,
        priority: i64,
        delay: Duration,
    ) -> Result<TaskId> {
        let now = self.clock.now();
        let task = NewTask {
            id: self.ids.generate_task_id(),
            vqueue_name: vqueue,
            data,
            priority,
            queued_at: now,
            visible_at: time::after(now, delay),
        };
        self.registry.insert_task(self.store.as_ref(), &task, now)?;
        debug!(task_id = %task.id, vqueue = %task.vqueue_name, priority, "enqueued");
        Ok(task.id)
    }

    fn claim(&self, max_number: usize) -> Result<Vec<Task>> {
        let now: DateTime<Utc> = self.clock.now();
        let mut claimed = Vec::new();
        while claimed.len() < max_number {
            match self.engine.select_and_lease(self.store.as_ref(), now) {
                Ok(Some(task)) => claimed.push(task),
                Ok(None) => break,
                // 取れた分は返す。エラーは次の呼び出しで再び表面化する
                Err(e) if !claimed.is_empty() => {
                    warn!(error = %e, claimed = claimed.len(), "selection failed mid-batch");
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(claimed)
    }

    fn requeue_all(&self, tasks: &[Task]) {
        let now = self.clock.now();
        let args = TransitionArgs::default();
        for task in tasks {
            let result = self.store.transaction(|tx| {
                self.machine
                    .apply(tx, task.id, Transition::Requeue, &args, now)
            });
            match result {
                Ok(outcome) => {
                    debug!(task_id = %task.id, ?outcome, "requeued task of cancelled receive")
                }
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "failed to requeue task of cancelled receive")
                }
            }
        }
        if !tasks.is_empty() {
            self.notifier.signal(None);
        }
    }
}

/// Slot shared between a claim round and the receive future waiting on it.
#[derive(Default)]
struct Handoff {
    cancelled: bool,
    claimed: Option<Vec<Task>>,
}

struct ClaimGuard<S: TaskStore> {
    inner: Arc<Inner<S>>,
    handoff: Arc<Mutex<Handoff>>,
    settled: bool,
}

impl<S: TaskStore> Drop for ClaimGuard<S> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let orphaned = {
            let mut slot = self.handoff.lock().unwrap_or_else(PoisonError::into_inner);
            slot.cancelled = true;
            slot.claimed.take()
        };
        let Some(tasks) = orphaned.filter(|t| !t.is_empty()) else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || inner.requeue_all(&tasks));
            }
            Err(_) => inner.requeue_all(&tasks),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use crate::domain::TaskStatus;
    use crate::ports::FixedClock;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn quiet_config() -> BrokerConfig {
        let mut config = BrokerConfig::default();
        config.ticker.enabled = false;
        config.receive.poll_interval_ms = 20;
        config
    }

    async fn coordinator(clock: Arc<FixedClock>) -> Coordinator<SqliteStore> {
        Coordinator::builder()
            .config(quiet_config())
            .clock(clock)
            .open_in_memory()
            .unwrap()
    }

    #[tokio::test]
    async fn enqueue_receive_ack_round_trip() {
        let c = coordinator(Arc::new(FixedClock::new(t0()))).await;
        let id = c.enqueue(b"hello".to_vec(), "", 50, Duration::ZERO).await.unwrap();
        assert_eq!(c.len().await.unwrap(), 1);

        let tasks = c.receive(10, Duration::ZERO).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, id);
        assert_eq!(tasks[0].data, b"hello");

        assert!(c.ack(id).await.unwrap());
        assert!(c.ack(id).await.unwrap());
        assert!(!c.nack(id, "late").await.unwrap());
        assert_eq!(c.len().await.unwrap(), 0);
        assert_eq!(c.get(id).await.unwrap().unwrap().status, TaskStatus::Succeeded);
    }

    #[tokio::test]
    async fn receive_zero_returns_immediately() {
        let c = coordinator(Arc::new(FixedClock::new(t0()))).await;
        c.enqueue(b"x".to_vec(), "", 50, Duration::ZERO).await.unwrap();
        assert!(c.receive(0, Duration::from_secs(5)).await.unwrap().is_empty());
        assert_eq!(c.counts().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn delayed_task_waits_for_clock() {
        let clock = Arc::new(FixedClock::new(t0()));
        let c = coordinator(clock.clone()).await;
        c.enqueue(b"later".to_vec(), "", 50, Duration::from_secs(10)).await.unwrap();

        assert!(c.receive(1, Duration::ZERO).await.unwrap().is_empty());
        clock.advance(Duration::from_secs(10));
        assert_eq!(c.receive(1, Duration::ZERO).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn nack_then_retry_records_history() {
        let c = coordinator(Arc::new(FixedClock::new(t0()))).await;
        let id = c.enqueue(b"x".to_vec(), "", 50, Duration::ZERO).await.unwrap();
        c.receive(1, Duration::ZERO).await.unwrap();

        assert!(c.nack(id, "first").await.unwrap());
        assert!(c.retry(id, Duration::ZERO, "second").await.unwrap());
        let messages: Vec<String> = c
            .errors(id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.error_message)
            .collect();
        assert_eq!(messages, vec!["first", "second"]);

        let again = c.receive(1, Duration::ZERO).await.unwrap();
        assert_eq!(again[0].id, id);
        assert_eq!(again[0].lease_count, 2);
    }

    #[tokio::test]
    async fn operator_pause_hides_vqueue() {
        let c = coordinator(Arc::new(FixedClock::new(t0()))).await;
        c.enqueue(b"x".to_vec(), "reports", 50, Duration::ZERO).await.unwrap();

        assert!(c.set_vqueue_hidden("reports", true).await.unwrap());
        assert!(c.receive(1, Duration::ZERO).await.unwrap().is_empty());
        assert!(c.set_vqueue_hidden("reports", false).await.unwrap());
        assert_eq!(c.receive(1, Duration::ZERO).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn closed_coordinator_rejects_calls() {
        let c = coordinator(Arc::new(FixedClock::new(t0()))).await;
        c.close().await;
        c.close().await;
        assert!(matches!(
            c.enqueue(b"x".to_vec(), "", 50, Duration::ZERO).await,
            Err(VtqError::Closed)
        ));
        assert!(matches!(c.receive(1, Duration::ZERO).await, Err(VtqError::Closed)));
    }

    #[tokio::test]
    async fn abandoned_claim_is_requeued() {
        let c = coordinator(Arc::new(FixedClock::new(t0()))).await;
        let id = c.enqueue(b"x".to_vec(), "", 50, Duration::ZERO).await.unwrap();

        let claimed = c.inner.claim(1).unwrap();
        assert_eq!(claimed[0].id, id);
        let guard = ClaimGuard {
            inner: Arc::clone(&c.inner),
            handoff: Arc::new(Mutex::new(Handoff {
                cancelled: false,
                claimed: Some(claimed),
            })),
            settled: false,
        };
        drop(guard);

        // requeue は blocking pool で走る
        for _ in 0..100 {
            if c.get(id).await.unwrap().unwrap().status == TaskStatus::Pending {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task was not requeued");
    }

    #[tokio::test]
    async fn newcomer_queues_behind_sleeping_waiter() {
        let mut config = quiet_config();
        config.receive.poll_interval_ms = 60_000;
        let c = Coordinator::builder()
            .config(config)
            .clock(Arc::new(FixedClock::new(t0())))
            .open_in_memory()
            .unwrap();
        c.ensure_vqueue("q").await.unwrap();
        c.set_vqueue_hidden("q", true).await.unwrap();

        let head = {
            let c = c.clone();
            tokio::spawn(async move { c.receive(1, Duration::from_millis(300)).await })
        };
        while c.inner.waiting.available_permits() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let id = c.enqueue(b"x".to_vec(), "q", 50, Duration::ZERO).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // 通知なしで見えるようにする（head は眠ったまま）
        c.store()
            .transaction(|tx| tx.set_vqueue_hidden(&["q".to_string()], false, t0()))
            .unwrap();

        let newcomer = c.receive(1, Duration::from_millis(50)).await.unwrap();
        assert!(newcomer.is_empty());
        let served = head.await.unwrap().unwrap();
        assert_eq!(served[0].id, id);
    }
}

//! VisibilityTicker - 時間経過で見えるようになったタスクを知らせる
//!
//! 遅延 enqueue・retry の delay・lease 期限切れ・rate limit の窓明けは
//! どれも「誰も書き込まないのに状態が変わる」ので、通知が来ません。
//! ticker が次の期限まで眠り、起きたら admission を sweep して signal します。
//! 眠っている間に別の signal（enqueue など）が来たら、期限を計算し直します。
//!
//! 停止は `watch` チャネルで伝えます（`request_shutdown` / `shutdown_and_join`）。

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::admission::{AdmissionController, HiddenDecision};
use crate::domain::StoreError;
use crate::ports::{Clock, Notifier, TaskStore};

/// Result of one ticker pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub decisions: Vec<HiddenDecision>,
    /// 次に何かが見えるようになる時刻（タスクまたは limiter）
    pub next_wake: Option<DateTime<Utc>>,
}

impl TickReport {
    /// Whether some VQ was un-hidden by this pass.
    pub fn reopened(&self) -> bool {
        self.decisions.iter().any(|d| !d.hidden)
    }
}

/// Runs one sweep: reopens elapsed limiters and finds the next deadline.
pub fn tick<S: TaskStore>(
    store: &S,
    admission: &AdmissionController,
    now: DateTime<Utc>,
) -> Result<TickReport, StoreError> {
    store.transaction(|tx| {
        let decisions = admission.sweep(tx, now)?;
        let next_task = tx.next_visible_at(now)?;
        let next_wake = [next_task, admission.next_deadline()]
            .into_iter()
            .flatten()
            .min();
        Ok(TickReport {
            decisions,
            next_wake,
        })
    })
}

/// Background ticker handle.
pub struct VisibilityTicker {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl VisibilityTicker {
    pub fn spawn<S: TaskStore>(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        admission: Arc<AdmissionController>,
        notifier: Arc<dyn Notifier>,
        interval: Duration,
    ) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            ticker_loop(store, clock, admission, notifier, interval, &mut shutdown_rx).await;
        });
        Self { shutdown_tx, join }
    }

    pub fn request_shutdown(&self) {
        // ループが先に終わっていれば受信側はもう無い
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        let _ = self.join.await;
    }
}

async fn ticker_loop<S: TaskStore>(
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    admission: Arc<AdmissionController>,
    notifier: Arc<dyn Notifier>,
    interval: Duration,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    let mut subscription = notifier.subscribe();
    let mut due: Option<DateTime<Utc>> = None;
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let now = clock.now();
        let pass = {
            let store = Arc::clone(&store);
            let admission = Arc::clone(&admission);
            tokio::task::spawn_blocking(move || tick(store.as_ref(), &admission, now)).await
        };

        let mut sleep_for = interval;
        match pass {
            Ok(Ok(report)) => {
                let deadline_passed = due.is_some_and(|at| at <= now);
                if report.reopened() || deadline_passed {
                    debug!(reopened = report.reopened(), "visibility changed, waking receivers");
                    notifier.signal(None);
                    // 自分の signal で起きないように
                    subscription.mark_seen();
                }
                due = report.next_wake;
                if let Some(at) = report.next_wake {
                    let until = (at - now).to_std().unwrap_or(Duration::ZERO);
                    sleep_for = sleep_for.min(until.max(Duration::from_millis(1)));
                }
            }
            Ok(Err(e)) => warn!(error = %e, "ticker pass failed"),
            Err(e) => warn!(error = %e, "ticker pass panicked"),
        }

        tokio::select! {
            _ = shutdown_rx.changed() => continue,
            _ = subscription.wait(sleep_for) => {}
        }
    }
    debug!("ticker stopped");
}

//! LocalNotifier - プロセス内の通知チャネル
//!
//! # 実装詳細
//! - `tokio::sync::watch` の世代カウンタを進めるだけ
//! - 連続した signal は 1 回に合流する（waiter は store を見に行くだけなので問題ない）
//! - 別プロセスの enqueue は届かない。その分は poll 間隔で拾う

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::watch;
use tracing::trace;

use crate::domain::TaskId;
use crate::ports::{Notifier, Subscription};

pub struct LocalNotifier {
    generation: watch::Sender<u64>,
}

impl LocalNotifier {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self { generation }
    }
}

impl Default for LocalNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier for LocalNotifier {
    fn signal(&self, task_id: Option<TaskId>) {
        // 受信者がいなくても値は更新される
        self.generation.send_modify(|n| *n = n.wrapping_add(1));
        trace!(task_id = ?task_id, "signalled");
    }

    fn subscribe(&self) -> Box<dyn Subscription> {
        Box::new(LocalSubscription {
            rx: self.generation.subscribe(),
        })
    }
}

struct LocalSubscription {
    rx: watch::Receiver<u64>,
}

#[async_trait]
impl Subscription for LocalSubscription {
    async fn wait(&mut self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.rx.changed()).await {
            Ok(Ok(())) => {
                self.rx.borrow_and_update();
                true
            }
            // sender が消えた: もう signal は来ないので時間だけ潰す
            Ok(Err(_)) => {
                tokio::time::sleep(timeout).await;
                false
            }
            Err(_) => false,
        }
    }

    fn mark_seen(&mut self) {
        self.rx.borrow_and_update();
    }
}

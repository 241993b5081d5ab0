//! Notifier port - long-poll 中の receiver を起こすための信号
//!
//! 正しさには関与しません。信号が落ちたり合流したりしても、
//! receiver は poll 間隔で再確認するので遅延が増えるだけです。

use async_trait::async_trait;
use std::time::Duration;

use crate::domain::TaskId;

pub trait Notifier: Send + Sync {
    /// Best-effort, never blocks. `None` は「何か見えるようになった」だけを伝える。
    fn signal(&self, task_id: Option<TaskId>);

    /// 以降の signal を観測する購読を作る
    fn subscribe(&self) -> Box<dyn Subscription>;
}

#[async_trait]
pub trait Subscription: Send {
    /// Waits for a signal newer than the last one observed here.
    /// Returns false on timeout.
    async fn wait(&mut self, timeout: Duration) -> bool;

    /// 未観測の signal を観測済みにする（store を見る直前に呼ぶ）
    fn mark_seen(&mut self);
}

//! StateMachine - ガード付き状態遷移の適用
//!
//! 遷移は 1 回の条件付き UPDATE です。0 行だった場合だけ、同じトランザクション内で
//! 現在の状態を読み、NotFound / 冪等な成功 / 不正な遷移 を判定します。

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::admission::AdmissionController;
use crate::domain::time;
use crate::domain::{StoreError, TaskError, TaskId, TaskStatus, TaskUpdate, Transition, TransitionOutcome};
use crate::ports::{StoreTx, TaskChange, TaskGuard, Visibility};

/// Inputs that only some transitions use.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionArgs {
    /// retry: `visible_at = now + delay`
    pub delay: Duration,
    /// nack / retry: 空でなければ TaskError を 1 行追記
    pub error_message: Option<String>,
}

impl TransitionArgs {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            ..Self::default()
        }
    }
}

#[derive(Clone)]
pub struct StateMachine {
    admission: Arc<AdmissionController>,
}

impl StateMachine {
    pub fn new(admission: Arc<AdmissionController>) -> Self {
        Self { admission }
    }

    pub fn apply(
        &self,
        tx: &mut dyn StoreTx,
        id: TaskId,
        transition: Transition,
        args: &TransitionArgs,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError> {
        let change = change_for(transition, args, now);
        let affected = tx.update_task_where(id, &TaskGuard::status_in(transition.from()), &change)?;
        if affected == 0 {
            let outcome = TransitionOutcome::classify(transition, tx.task_status(id)?);
            debug!(task_id = %id, transition = transition.name(), ?outcome, "guard did not match");
            return Ok(outcome);
        }

        if matches!(transition, Transition::Nack | Transition::Retry)
            && let Some(message) = args.error_message.as_deref().filter(|m| !m.is_empty())
        {
            tx.append_error(&TaskError {
                task_id: id,
                error_message: message.to_string(),
                happened_at: now,
            })?;
        }

        if let Some(task) = tx.get_task(id)? {
            self.admission.on_release(tx, &task.vqueue_name, now)?;
        }
        debug!(task_id = %id, transition = transition.name(), "applied");
        Ok(TransitionOutcome::Applied)
    }

    /// Changes visibility of a non-terminal task.
    pub fn update(
        &self,
        tx: &mut dyn StoreTx,
        id: TaskId,
        update: &TaskUpdate,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let Some(delay) = update.visible_after else {
            // 変更なし: 存在して終端でなければ成功
            return Ok(tx
                .task_status(id)?
                .is_some_and(|status| !status.is_terminal()));
        };
        let change =
            TaskChange::at(now).visible(Visibility::At(time::after(now, delay)));
        let affected = tx.update_task_where(id, &TaskGuard::status_in(TaskStatus::SELECTABLE), &change)?;
        Ok(affected > 0)
    }

    pub fn delete(
        &self,
        tx: &mut dyn StoreTx,
        id: TaskId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let Some(task) = tx.get_task(id)? else {
            return Ok(false);
        };
        let deleted = tx.delete_task(id)?;
        if deleted && task.status == TaskStatus::Leased {
            self.admission.on_release(tx, &task.vqueue_name, now)?;
        }
        Ok(deleted)
    }
}

fn change_for(transition: Transition, args: &TransitionArgs, now: DateTime<Utc>) -> TaskChange {
    let change = TaskChange::at(now).status(transition.to());
    match transition {
        Transition::Ack | Transition::Nack => change.visible(Visibility::Never).ended(Some(now)),
        Transition::Requeue => change.visible(Visibility::At(now)),
        Transition::Retry => change
            .visible(Visibility::At(time::after(now, args.delay)))
            .ended(None)
            .bump_retries(),
    }
}

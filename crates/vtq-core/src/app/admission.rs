//! AdmissionController - rate limit による VQ の hidden 切り替え
//!
//! # 契約
//! - `hidden = true` の VQ のタスクは、後の評価で解除されるまで候補から外れる
//! - controller が立てた hidden だけを controller が下ろす（運用者の pause は触らない）
//! - 同じ limiter 名に解決された VQ は 1 つの limiter を共有し、まとめて切り替わる
//!
//! # 所有者
//! どの limiter が hidden を立てたかは VQ 行の `hidden_by` に残します。
//! 最初の呼び出しで store の VQ 一覧を読み、全 VQ を limiter に割り当て、
//! 前のプロセスが残した hidden を引き取ります（引き取った limiter は次の評価で開き得る）。
//! 設定から消えた limiter の hidden はその場で下ろします。
//!
//! # 呼び出し点
//! - VQ 作成直後（同じトランザクション内）: [`AdmissionController::register`]
//! - lease 直後（同じトランザクション内）: [`AdmissionController::on_dispatch`]
//! - ack / nack / requeue / retry / delete の後: [`AdmissionController::on_release`]
//! - 起動時と ticker: [`AdmissionController::sweep`]

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::info;

use super::rate_limiter::{Admission, RateLimitPolicy, policy_for};
use crate::domain::StoreError;
use crate::ports::{ConfigurationProvider, StoreTx};

/// A hidden-flag change made by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HiddenDecision {
    pub limiter: String,
    pub vqueues: Vec<String>,
    pub hidden: bool,
    pub until: Option<DateTime<Utc>>,
}

struct Limiter {
    policy: Box<dyn RateLimitPolicy>,
    members: BTreeSet<String>,
    suspended: Option<Admission>,
}

#[derive(Default)]
struct State {
    /// VQ 名 -> limiter 名（None は「rate limit 無し」のキャッシュ）
    resolved: HashMap<String, Option<String>>,
    limiters: HashMap<String, Limiter>,
    /// store の VQ 一覧を読み込み済みか
    loaded: bool,
}

pub struct AdmissionController {
    provider: Arc<dyn ConfigurationProvider>,
    state: Mutex<State>,
}

impl AdmissionController {
    pub fn new(provider: Arc<dyn ConfigurationProvider>) -> Self {
        Self {
            provider,
            state: Mutex::new(State::default()),
        }
    }

    /// Attaches a newly created VQ to its limiter, hiding it if that limiter is suspended.
    pub fn register(
        &self,
        tx: &mut dyn StoreTx,
        vqueue: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<HiddenDecision>, StoreError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.load(tx, &mut state, now)?;
        let Some(name) = self.resolve(&mut state, vqueue) else {
            return Ok(None);
        };
        let Some(limiter) = state.limiters.get_mut(&name) else {
            return Ok(None);
        };
        let current = limiter.suspended;
        match current {
            Some(admission) => apply(tx, &name, limiter, admission, now),
            None => Ok(None),
        }
    }

    /// Records one dispatch from `vqueue` and hides it if a limit is hit.
    pub fn on_dispatch(
        &self,
        tx: &mut dyn StoreTx,
        vqueue: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<HiddenDecision>, StoreError> {
        self.evaluate(tx, vqueue, now, true)
    }

    /// Re-evaluates `vqueue` after one of its tasks left the leased state.
    pub fn on_release(
        &self,
        tx: &mut dyn StoreTx,
        vqueue: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<HiddenDecision>, StoreError> {
        self.evaluate(tx, vqueue, now, false)
    }

    /// Re-evaluates every suspended limiter and un-hides those that reopened.
    pub fn sweep(
        &self,
        tx: &mut dyn StoreTx,
        now: DateTime<Utc>,
    ) -> Result<Vec<HiddenDecision>, StoreError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut decisions = self.load(tx, &mut state, now)?;
        let mut names: Vec<String> = state
            .limiters
            .iter()
            .filter(|(_, l)| l.suspended.is_some())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        for name in names {
            let Some(limiter) = state.limiters.get_mut(&name) else {
                continue;
            };
            let in_flight = in_flight(tx, limiter, now)?;
            let admission = limiter.policy.poll(now, in_flight);
            if let Some(decision) = apply(tx, &name, limiter, admission, now)? {
                decisions.push(decision);
            }
        }
        Ok(decisions)
    }

    /// Earliest time a suspended limiter may reopen by itself.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .limiters
            .values()
            .filter_map(|l| match l.suspended {
                Some(Admission::Suspended { until }) => until,
                _ => None,
            })
            .min()
    }

    /// 現在 suspend 中の limiter 名
    pub fn suspended(&self) -> Vec<String> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = state
            .limiters
            .iter()
            .filter(|(_, l)| l.suspended.is_some())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    fn evaluate(
        &self,
        tx: &mut dyn StoreTx,
        vqueue: &str,
        now: DateTime<Utc>,
        dispatched: bool,
    ) -> Result<Option<HiddenDecision>, StoreError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.load(tx, &mut state, now)?;
        let Some(name) = self.resolve(&mut state, vqueue) else {
            return Ok(None);
        };
        let Some(limiter) = state.limiters.get_mut(&name) else {
            return Ok(None);
        };
        let in_flight = in_flight(tx, limiter, now)?;
        let admission = if dispatched {
            limiter.policy.on_dispatch(now, in_flight)
        } else {
            limiter.policy.poll(now, in_flight)
        };
        apply(tx, &name, limiter, admission, now)
    }

    /// Assigns every stored VQ to its limiter and adopts hidden flags left by earlier runs.
    fn load(
        &self,
        tx: &mut dyn StoreTx,
        state: &mut State,
        now: DateTime<Utc>,
    ) -> Result<Vec<HiddenDecision>, StoreError> {
        if state.loaded {
            return Ok(Vec::new());
        }
        let vqueues = tx.list_vqueues()?;
        // limiter 名 -> もう所有者でなくなった VQ
        let mut orphaned: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for vqueue in &vqueues {
            let resolved = self.resolve(state, &vqueue.name);
            let Some(owner) = &vqueue.hidden_by else {
                continue;
            };
            match (resolved, state.limiters.get_mut(owner)) {
                (Some(name), Some(limiter)) if &name == owner => {
                    // 窓の状態は引き継げないので、次の評価で開くかを決める
                    limiter
                        .suspended
                        .get_or_insert(Admission::Suspended { until: None });
                }
                _ => orphaned
                    .entry(owner.clone())
                    .or_default()
                    .push(vqueue.name.clone()),
            }
        }

        let mut decisions = Vec::new();
        for (owner, released) in orphaned {
            tx.set_vqueue_hidden(&released, false, now)?;
            info!(limiter = %owner, vqueues = ?released, "released vqueues of unknown rate limiter");
            decisions.push(HiddenDecision {
                limiter: owner,
                vqueues: released,
                hidden: false,
                until: None,
            });
        }
        state.loaded = true;
        Ok(decisions)
    }

    fn resolve(&self, state: &mut State, vqueue: &str) -> Option<String> {
        if let Some(cached) = state.resolved.get(vqueue) {
            return cached.clone();
        }
        let rule = self.provider.rate_limit_for(vqueue);
        let name = rule.as_ref().map(|r| r.name.clone());
        if let Some(rule) = rule {
            state
                .limiters
                .entry(rule.name.clone())
                .or_insert_with(|| Limiter {
                    policy: policy_for(&rule.kind),
                    members: BTreeSet::new(),
                    suspended: None,
                })
                .members
                .insert(vqueue.to_string());
        }
        state.resolved.insert(vqueue.to_string(), name.clone());
        name
    }
}

fn in_flight(
    tx: &mut dyn StoreTx,
    limiter: &Limiter,
    now: DateTime<Utc>,
) -> Result<u64, StoreError> {
    if !limiter.policy.needs_in_flight() {
        return Ok(0);
    }
    let members: Vec<String> = limiter.members.iter().cloned().collect();
    tx.count_in_flight(&members, now)
}

fn apply(
    tx: &mut dyn StoreTx,
    name: &str,
    limiter: &mut Limiter,
    admission: Admission,
    now: DateTime<Utc>,
) -> Result<Option<HiddenDecision>, StoreError> {
    match admission {
        Admission::Suspended { until } => {
            let newly_suspended = limiter.suspended.is_none();
            limiter.suspended = Some(admission);
            // 途中から加わった member や運用者が resume した member も隠し直す
            let members: Vec<String> = limiter.members.iter().cloned().collect();
            let hidden = tx.hide_vqueues_for(name, &members, now)?;
            if !newly_suspended && hidden.is_empty() {
                return Ok(None);
            }
            info!(limiter = name, vqueues = ?hidden, until = ?until, "rate limit suspended dispatch");
            Ok(Some(HiddenDecision {
                limiter: name.to_string(),
                vqueues: hidden,
                hidden: true,
                until,
            }))
        }
        Admission::Open => {
            if limiter.suspended.take().is_none() {
                return Ok(None);
            }
            let released = tx.unhide_vqueues_of(name, now)?;
            info!(limiter = name, vqueues = ?released, "rate limit resumed dispatch");
            Ok(Some(HiddenDecision {
                limiter: name.to_string(),
                vqueues: released,
                hidden: false,
                until: None,
            }))
        }
    }
}

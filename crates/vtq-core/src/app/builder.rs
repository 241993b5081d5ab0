//! CoordinatorBuilder - Coordinator の構築とワイヤリング
//!
//! # Fail-fast 設計
//! - `build` 時に設定を検証し、VQ パターンを正規表現へコンパイルする
//! - 不正な設定は最初の enqueue ではなく起動時に `VtqError::Config` になる
//!
//! # 使用例
//! ```ignore
//! let coordinator = Coordinator::builder()
//!     .config(BrokerConfig::load("vtq.toml")?)
//!     .open()?;
//! ```

use rand::SeedableRng;
use rand::rngs::StdRng;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use super::admission::AdmissionController;
use super::coordinator::{Coordinator, Inner};
use super::registry::VQueueRegistry;
use super::selection::SelectionEngine;
use super::state_machine::StateMachine;
use super::ticker::VisibilityTicker;
use crate::config::BrokerConfig;
use crate::domain::Result;
use crate::impls::{LocalNotifier, SqliteStore, StaticConfigProvider};
use crate::ports::{Clock, ConfigurationProvider, Notifier, SystemClock, TaskStore, UlidGenerator};

pub struct CoordinatorBuilder {
    config: BrokerConfig,
    clock: Option<Arc<dyn Clock>>,
    provider: Option<Arc<dyn ConfigurationProvider>>,
    notifier: Option<Arc<dyn Notifier>>,
    seed: Option<u64>,
}

impl CoordinatorBuilder {
    pub fn new() -> Self {
        Self {
            config: BrokerConfig::default(),
            clock: None,
            provider: None,
            notifier: None,
            seed: None,
        }
    }

    pub fn config(mut self, config: BrokerConfig) -> Self {
        self.config = config;
        self
    }

    /// テストでは FixedClock を渡す
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// 設定ファイルの代わりに使う ConfigurationProvider
    pub fn provider(mut self, provider: Arc<dyn ConfigurationProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// bucket 抽選の乱数を固定する
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Opens the SQLite file named by `store.path`.
    pub fn open(self) -> Result<Coordinator<SqliteStore>> {
        self.config.validate()?;
        let store = SqliteStore::open(&self.config.store.path, &self.config.store.workspace)?;
        info!(
            path = %self.config.store.path.display(),
            workspace = %self.config.store.workspace,
            "store opened"
        );
        self.build(store)
    }

    pub fn open_in_memory(self) -> Result<Coordinator<SqliteStore>> {
        self.config.validate()?;
        let store = SqliteStore::open_in_memory(&self.config.store.workspace)?;
        self.build(store)
    }

    /// Wires a coordinator around `store`.
    ///
    /// ticker を有効にしている場合は tokio ランタイムの中で呼んでください。
    /// ランタイムが無ければ ticker 無しで起動します（警告を出す）。
    pub fn build<S: TaskStore>(self, store: S) -> Result<Coordinator<S>> {
        self.config.validate()?;
        let provider = match self.provider {
            Some(provider) => provider,
            None => Arc::new(StaticConfigProvider::from_config(&self.config)?),
        };
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let notifier = self
            .notifier
            .unwrap_or_else(|| Arc::new(LocalNotifier::new()));
        let admission = Arc::new(AdmissionController::new(Arc::clone(&provider)));

        let mut engine =
            SelectionEngine::new(Arc::clone(&admission), self.config.receive.max_claim_attempts);
        if let Some(seed) = self.seed {
            engine = engine.with_rng(StdRng::seed_from_u64(seed));
        }

        // 前回のプロセスが limiter で隠したまま終わった VQ を引き取る
        let reconciled = store.transaction(|tx| admission.sweep(tx, clock.now()))?;
        if !reconciled.is_empty() {
            info!(decisions = reconciled.len(), "reconciled rate-limited vqueues");
        }

        let store = Arc::new(store);
        let ticker = if !self.config.ticker.enabled {
            None
        } else if tokio::runtime::Handle::try_current().is_ok() {
            Some(VisibilityTicker::spawn(
                Arc::clone(&store),
                Arc::clone(&clock),
                Arc::clone(&admission),
                Arc::clone(&notifier),
                self.config.ticker.interval(),
            ))
        } else {
            warn!("no tokio runtime, visibility ticker disabled");
            None
        };

        Ok(Coordinator::from_inner(Inner {
            store,
            ids: Arc::new(UlidGenerator::new(Arc::clone(&clock))),
            clock,
            registry: VQueueRegistry::new(provider).with_admission(Arc::clone(&admission)),
            engine,
            machine: StateMachine::new(Arc::clone(&admission)),
            admission,
            notifier,
            waiting: Semaphore::new(1),
            poll_interval: self.config.receive.poll_interval(),
            closed: AtomicBool::new(false),
            ticker: Mutex::new(ticker),
        }))
    }
}

impl Default for CoordinatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

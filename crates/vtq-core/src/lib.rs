//! vtq-core
//!
//! Durable, priority-aware task queue broker.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, vqueue, state, rate_limit, errors, time）
//! - **ports**: 抽象化レイヤー（TaskStore, ConfigurationProvider, Notifier, Clock, IdGenerator）
//! - **app**: アプリケーションロジック（coordinator, selection, state_machine, admission, ticker）
//! - **impls**: 実装（SqliteStore, LocalNotifier, StaticConfigProvider）
//! - **config**: TOML の broker 設定

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;

pub use self::app::{Coordinator, CoordinatorBuilder, QueueCounts};
pub use self::config::BrokerConfig;
pub use self::domain::{Result, Task, TaskId, TaskRecord, TaskStatus, TaskUpdate, VtqError};
pub use self::impls::SqliteStore;

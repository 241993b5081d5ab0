//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部システム（永続ストア、設定、通知、時刻、ID 生成）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - 永続ストアが source of truth（正本）
//! - 通知は最適化であって、正しさの根拠にはしない

pub mod clock;
pub mod config_provider;
pub mod id_generator;
pub mod notifier;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::config_provider::ConfigurationProvider;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::notifier::{Notifier, Subscription};
pub use self::task_store::{
    BucketWeight, Candidate, StoreTx, TaskChange, TaskGuard, TaskStore, Visibility,
};

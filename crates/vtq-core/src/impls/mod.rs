//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **SqliteStore**: SQLite による TaskStore（本番・テスト共用）
//! - **LocalNotifier**: プロセス内の通知チャネル
//! - **StaticConfigProvider**: 設定ファイルから VQ ポリシーと rate limit を引く

pub mod local_notifier;
pub mod sqlite_store;
pub mod static_config;

pub use self::local_notifier::LocalNotifier;
pub use self::sqlite_store::{DEFAULT_WORKSPACE, SqliteStore};
pub use self::static_config::StaticConfigProvider;

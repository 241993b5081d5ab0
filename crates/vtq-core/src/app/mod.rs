//! App - アプリケーション層
//!
//! ports を組み合わせて broker のロジックを実装します。
//!
//! # 主要コンポーネント
//! - **Coordinator**: 公開 API（enqueue / receive / ack / nack / ...）
//! - **CoordinatorBuilder**: 構築とワイヤリング、起動時検証
//! - **SelectionEngine**: 優先度の層 → bucket 抽選 → 条件付き claim
//! - **StateMachine**: ガード付き状態遷移
//! - **AdmissionController**: rate limit による VQ の hidden 切り替え
//! - **VQueueRegistry**: VQ カタログと遅延作成
//! - **VisibilityTicker**: 時間経過で見えるようになったタスクの通知

pub mod admission;
pub mod builder;
pub mod coordinator;
pub mod rate_limiter;
pub mod registry;
pub mod selection;
pub mod state_machine;
pub mod status;
pub mod ticker;
pub mod weighted;

// 主要な型を再エクスポート
pub use self::admission::{AdmissionController, HiddenDecision};
pub use self::builder::CoordinatorBuilder;
pub use self::coordinator::Coordinator;
pub use self::registry::VQueueRegistry;
pub use self::selection::SelectionEngine;
pub use self::state_machine::{StateMachine, TransitionArgs};
pub use self::status::QueueCounts;
pub use self::ticker::{TickReport, VisibilityTicker};

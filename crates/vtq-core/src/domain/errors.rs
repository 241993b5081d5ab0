//! Errors - エラー型と分類
//!
//! 状態遷移の失敗（NotFound / 不正な遷移）はエラーではなく
//! [`TransitionOutcome`](super::state::TransitionOutcome) として bool で返します。
//! ここにあるのは呼び出し側に伝播させるべきものだけです。

use thiserror::Error;

use super::ids::ParseIdError;

/// ErrorKind は実行エラーの分類
///
/// - Transient: 一時的なエラー（リトライ推奨）
/// - Permanent: 恒久的なエラー（リトライ無意味）
/// - Infrastructure: ストアなど基盤の障害
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

/// Failures reported by a [`TaskStore`](crate::ports::TaskStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// Task insert referenced a VQ that does not exist.
    #[error("virtual queue `{0}` does not exist")]
    MissingVirtualQueue(String),

    /// VQ insert lost a creation race.
    #[error("virtual queue `{0}` already exists")]
    DuplicateVirtualQueue(String),

    /// A stored row could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("invalid workspace name `{0}`")]
    InvalidWorkspace(String),

    /// The backend failed (I/O, locking, SQL).
    #[error("store unavailable: {0}")]
    Unavailable(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    pub fn unavailable(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        StoreError::Unavailable(Box::new(err))
    }
}

/// VtqError は公開 API が返すエラー
#[derive(Debug, Error)]
pub enum VtqError {
    #[error("no configuration for virtual queue `{0}`")]
    ConfigurationMissing(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    InvalidTaskId(#[from] ParseIdError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("coordinator is closed")]
    Closed,
}

impl VtqError {
    pub fn config(message: impl Into<String>) -> Self {
        VtqError::Config(message.into())
    }

    /// 運用上の分類
    pub fn kind(&self) -> ErrorKind {
        match self {
            VtqError::Store(StoreError::Unavailable(_)) | VtqError::Join(_) => {
                ErrorKind::Infrastructure
            }
            VtqError::Store(StoreError::MissingVirtualQueue(_))
            | VtqError::Store(StoreError::DuplicateVirtualQueue(_)) => ErrorKind::Transient,
            VtqError::Store(_)
            | VtqError::ConfigurationMissing(_)
            | VtqError::InvalidTaskId(_)
            | VtqError::Config(_)
            | VtqError::Closed => ErrorKind::Permanent,
        }
    }
}

pub type Result<T, E = VtqError> = std::result::Result<T, E>;

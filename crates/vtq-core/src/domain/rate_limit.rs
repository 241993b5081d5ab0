//! Rate limit rules applied by the admission controller.

use serde::{Deserialize, Serialize};

/// How a limiter decides to suspend dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RateLimitKind {
    /// Each dispatch consumes one token; tokens refill continuously.
    TokenBucket { capacity: u32, refill_per_second: f64 },
    /// At most `limit` dispatches per aligned window.
    FixedWindow { limit: u32, window_seconds: u64 },
    /// At most `max_in_flight` live leases across member VQs.
    Concurrency { max_in_flight: u32 },
    /// `Concurrency { max_in_flight: 1 }`
    Mutex,
}

impl RateLimitKind {
    /// Mutex を Concurrency に正規化する
    pub fn normalized(&self) -> RateLimitKind {
        match self {
            RateLimitKind::Mutex => RateLimitKind::Concurrency { max_in_flight: 1 },
            other => other.clone(),
        }
    }
}

/// A limiter resolved for one VQ.
///
/// `name` はテンプレート展開済み。同じ name に解決された VQ は
/// 1 つの limiter を共有し、まとめて hidden になります。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub name: String,
    #[serde(flatten)]
    pub kind: RateLimitKind,
}

//! Virtual Queue - 名前付きのタスク区画とその静的ポリシー
//!
//! VQ は priority（層）、bucket（公平性グループ）、bucket_weight（配分比）、
//! visibility_timeout（lease の長さ）、hidden（配送停止フラグ）を持ちます。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_VQUEUE_PRIORITY: i64 = 50;
pub const DEFAULT_BUCKET_NAME: &str = "";
pub const DEFAULT_BUCKET_WEIGHT: u64 = 100;
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(86_400);

/// Static policy a VQ is created with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VQueuePolicy {
    pub priority: i64,
    pub bucket_name: String,
    pub bucket_weight: u64,
    #[serde(with = "duration_secs")]
    pub visibility_timeout: Duration,
}

impl Default for VQueuePolicy {
    fn default() -> Self {
        Self {
            priority: DEFAULT_VQUEUE_PRIORITY,
            bucket_name: DEFAULT_BUCKET_NAME.to_string(),
            bucket_weight: DEFAULT_BUCKET_WEIGHT,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
        }
    }
}

/// VirtualQueue はストアに保存された VQ の行
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualQueue {
    pub name: String,
    pub policy: VQueuePolicy,
    /// true の間、この VQ のタスクは候補から外れる
    pub hidden: bool,
    /// hidden を立てた rate limiter の名前。None は運用者の pause
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hidden_by: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl VirtualQueue {
    pub fn new(name: impl Into<String>, policy: VQueuePolicy, now: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            policy,
            hidden: false,
            hidden_by: None,
            updated_at: now,
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_matches_documented_defaults() {
        let policy = VQueuePolicy::default();
        assert_eq!(policy.priority, 50);
        assert_eq!(policy.bucket_name, "");
        assert_eq!(policy.bucket_weight, 100);
        assert_eq!(policy.visibility_timeout, Duration::from_secs(86_400));
    }

    #[test]
    fn visibility_timeout_serializes_as_seconds() {
        let policy = VQueuePolicy {
            visibility_timeout: Duration::from_secs(30),
            ..VQueuePolicy::default()
        };
        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(json["visibility_timeout"], 30);
    }
}

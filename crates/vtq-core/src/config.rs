//! Broker configuration (TOML).
//!
//! ```toml
//! allow_unknown_vqueues = true
//!
//! [store]
//! path = "vtq.db"
//! workspace = "vtq"
//!
//! [receive]
//! poll_interval_ms = 1000
//! max_claim_attempts = 16
//!
//! [defaults]
//! priority = 50
//! bucket = ""
//! bucket_weight = 100
//! visibility_timeout_seconds = 86400
//!
//! [[vqueues]]
//! pattern = "billing-*"
//! priority = 80
//! bucket = "billing"
//!
//! [[rate_limiters]]
//! name = "mutex-{vqueue_name}"
//! type = "mutex"
//! vqueues = ["report-*"]
//! ```
//!
//! パターンは `*`（任意の文字列）と `?`（任意の 1 文字）だけを解釈します。
//! 最初にマッチしたルールが勝ちます。

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::vqueue::{
    DEFAULT_BUCKET_NAME, DEFAULT_BUCKET_WEIGHT, DEFAULT_VISIBILITY_TIMEOUT,
    DEFAULT_VQUEUE_PRIORITY,
};
use crate::domain::{RateLimitKind, Result, VQueuePolicy, VtqError};
use crate::impls::sqlite_store::DEFAULT_WORKSPACE;

/// Placeholder expanded in rate limiter names.
pub const VQUEUE_NAME_PLACEHOLDER: &str = "{vqueue_name}";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// ルールにマッチしない VQ 名を defaults で作るか
    pub allow_unknown_vqueues: bool,
    pub store: StoreConfig,
    pub receive: ReceiveConfig,
    pub ticker: TickerConfig,
    pub defaults: PolicyConfig,
    pub vqueues: Vec<VQueueRule>,
    pub rate_limiters: Vec<RateLimiterConfig>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            allow_unknown_vqueues: true,
            store: StoreConfig::default(),
            receive: ReceiveConfig::default(),
            ticker: TickerConfig::default(),
            defaults: PolicyConfig::default(),
            vqueues: Vec::new(),
            rate_limiters: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub workspace: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("vtq.db"),
            workspace: DEFAULT_WORKSPACE.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiveConfig {
    /// long-poll 中に通知が無くても store を見直す間隔
    pub poll_interval_ms: u64,
    /// 1 回の選択で claim 競合に負けてよい回数
    pub max_claim_attempts: u32,
}

impl Default for ReceiveConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            max_claim_attempts: 16,
        }
    }
}

impl ReceiveConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TickerConfig {
    pub enabled: bool,
    /// 遅延タスク・期限切れ lease の確認間隔の上限
    pub interval_ms: u64,
}

impl Default for TickerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 1_000,
        }
    }
}

impl TickerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub priority: i64,
    pub bucket: String,
    pub bucket_weight: u64,
    pub visibility_timeout_seconds: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            priority: DEFAULT_VQUEUE_PRIORITY,
            bucket: DEFAULT_BUCKET_NAME.to_string(),
            bucket_weight: DEFAULT_BUCKET_WEIGHT,
            visibility_timeout_seconds: DEFAULT_VISIBILITY_TIMEOUT.as_secs(),
        }
    }
}

impl PolicyConfig {
    pub fn to_policy(&self) -> VQueuePolicy {
        VQueuePolicy {
            priority: self.priority,
            bucket_name: self.bucket.clone(),
            bucket_weight: self.bucket_weight,
            visibility_timeout: Duration::from_secs(self.visibility_timeout_seconds),
        }
    }
}

/// Policy overrides for VQ names matching `pattern`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VQueueRule {
    pub pattern: String,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub bucket_weight: Option<u64>,
    #[serde(default)]
    pub visibility_timeout_seconds: Option<u64>,
}

impl VQueueRule {
    /// defaults にこのルールの上書きを重ねる
    pub fn apply(&self, defaults: &PolicyConfig) -> VQueuePolicy {
        PolicyConfig {
            priority: self.priority.unwrap_or(defaults.priority),
            bucket: self.bucket.clone().unwrap_or_else(|| defaults.bucket.clone()),
            bucket_weight: self.bucket_weight.unwrap_or(defaults.bucket_weight),
            visibility_timeout_seconds: self
                .visibility_timeout_seconds
                .unwrap_or(defaults.visibility_timeout_seconds),
        }
        .to_policy()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// `{vqueue_name}` を含めると VQ ごとの limiter になる
    pub name: String,
    pub vqueues: Vec<String>,
    #[serde(flatten)]
    pub kind: RateLimitKind,
}

impl BrokerConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: BrokerConfig =
            toml::from_str(input).map_err(|e| VtqError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| VtqError::config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// 起動時に弾けるものは弾く（Fail-fast）
    pub fn validate(&self) -> Result<()> {
        if self.receive.poll_interval_ms == 0 {
            return Err(VtqError::config("receive.poll_interval_ms must be positive"));
        }
        if self.receive.max_claim_attempts == 0 {
            return Err(VtqError::config("receive.max_claim_attempts must be positive"));
        }
        if self.ticker.enabled && self.ticker.interval_ms == 0 {
            return Err(VtqError::config("ticker.interval_ms must be positive"));
        }
        for rule in &self.vqueues {
            if rule.pattern.is_empty() {
                return Err(VtqError::config("vqueues.pattern must not be empty"));
            }
        }
        for limiter in &self.rate_limiters {
            if limiter.name.is_empty() {
                return Err(VtqError::config("rate_limiters.name must not be empty"));
            }
            if limiter.vqueues.is_empty() {
                return Err(VtqError::config(format!(
                    "rate limiter `{}` matches no vqueues",
                    limiter.name
                )));
            }
            let valid = match &limiter.kind {
                RateLimitKind::TokenBucket {
                    capacity,
                    refill_per_second,
                } => *capacity > 0 && refill_per_second.is_finite() && *refill_per_second > 0.0,
                RateLimitKind::FixedWindow {
                    limit,
                    window_seconds,
                } => *limit > 0 && *window_seconds > 0,
                RateLimitKind::Concurrency { max_in_flight } => *max_in_flight > 0,
                RateLimitKind::Mutex => true,
            };
            if !valid {
                return Err(VtqError::config(format!(
                    "rate limiter `{}` has non-positive limits",
                    limiter.name
                )));
            }
        }
        Ok(())
    }
}

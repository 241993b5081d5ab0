//! StaticConfigProvider - BrokerConfig から引く ConfigurationProvider
//!
//! パターンは起動時に正規表現へ変換しておき、問い合わせは線形に先頭から照合します。

use regex::Regex;

use crate::config::{BrokerConfig, PolicyConfig, RateLimiterConfig, VQUEUE_NAME_PLACEHOLDER, VQueueRule};
use crate::domain::{RateLimitRule, Result, VQueuePolicy, VtqError};
use crate::ports::ConfigurationProvider;

/// `*` / `?` ワイルドカードを完全一致の正規表現にする
pub fn wildcard_to_regex(pattern: &str) -> Result<Regex> {
    let escaped = regex::escape(pattern)
        .replace(r"\*", ".*")
        .replace(r"\?", ".");
    Regex::new(&format!("^{escaped}$"))
        .map_err(|e| VtqError::config(format!("pattern `{pattern}`: {e}")))
}

struct CompiledRule {
    pattern: Regex,
    rule: VQueueRule,
}

struct CompiledLimiter {
    patterns: Vec<Regex>,
    limiter: RateLimiterConfig,
}

pub struct StaticConfigProvider {
    defaults: PolicyConfig,
    allow_unknown: bool,
    rules: Vec<CompiledRule>,
    limiters: Vec<CompiledLimiter>,
}

impl StaticConfigProvider {
    pub fn from_config(config: &BrokerConfig) -> Result<Self> {
        let rules = config
            .vqueues
            .iter()
            .map(|rule| {
                Ok(CompiledRule {
                    pattern: wildcard_to_regex(&rule.pattern)?,
                    rule: rule.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let limiters = config
            .rate_limiters
            .iter()
            .map(|limiter| {
                Ok(CompiledLimiter {
                    patterns: limiter
                        .vqueues
                        .iter()
                        .map(|p| wildcard_to_regex(p))
                        .collect::<Result<Vec<_>>>()?,
                    limiter: limiter.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            defaults: config.defaults.clone(),
            allow_unknown: config.allow_unknown_vqueues,
            rules,
            limiters,
        })
    }
}

impl Default for StaticConfigProvider {
    /// 任意の VQ 名をデフォルトポリシーで受け付け、rate limit は無し
    fn default() -> Self {
        Self {
            defaults: PolicyConfig::default(),
            allow_unknown: true,
            rules: Vec::new(),
            limiters: Vec::new(),
        }
    }
}

impl ConfigurationProvider for StaticConfigProvider {
    fn policy_for(&self, vqueue_name: &str) -> Option<VQueuePolicy> {
        match self.rules.iter().find(|r| r.pattern.is_match(vqueue_name)) {
            Some(compiled) => Some(compiled.rule.apply(&self.defaults)),
            None if self.allow_unknown => Some(self.defaults.to_policy()),
            None => None,
        }
    }

    fn rate_limit_for(&self, vqueue_name: &str) -> Option<RateLimitRule> {
        self.limiters
            .iter()
            .find(|l| l.patterns.iter().any(|p| p.is_match(vqueue_name)))
            .map(|compiled| RateLimitRule {
                name: compiled
                    .limiter
                    .name
                    .replace(VQUEUE_NAME_PLACEHOLDER, vqueue_name),
                kind: compiled.limiter.kind.normalized(),
            })
    }
}

//! ConfigurationProvider port - 未知の VQ 名に対するポリシーの供給元
//!
//! VQ は最初の enqueue 時に遅延作成されます。その時の priority / bucket /
//! visibility_timeout と、admission controller が使う rate limit はここから引きます。

use crate::domain::{RateLimitRule, VQueuePolicy};

pub trait ConfigurationProvider: Send + Sync {
    /// None なら VQ を作れない（`ConfigurationMissing`）
    fn policy_for(&self, vqueue_name: &str) -> Option<VQueuePolicy>;

    /// VQ に掛かる rate limit（name はテンプレート展開済み）
    fn rate_limit_for(&self, vqueue_name: &str) -> Option<RateLimitRule>;
}

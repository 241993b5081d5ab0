//! Rate limit policies used by the admission controller.
//!
//! どのポリシーも「配送が 1 件起きた」「時間が経った / lease が減った」の
//! 2 種類の入力だけを受け取り、配送を止めるべきかを返します。
//! 状態はプロセス内に閉じています。

use chrono::{DateTime, Utc};

use crate::domain::RateLimitKind;

/// Dispatch admission for one limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Open,
    /// `until` が None のときは外部の変化（lease の減少）を待つ
    Suspended { until: Option<DateTime<Utc>> },
}

impl Admission {
    pub fn is_suspended(self) -> bool {
        matches!(self, Admission::Suspended { .. })
    }
}

pub trait RateLimitPolicy: Send {
    /// Records one dispatch.
    fn on_dispatch(&mut self, now: DateTime<Utc>, in_flight: u64) -> Admission;

    /// Re-evaluates without recording a dispatch.
    fn poll(&mut self, now: DateTime<Utc>, in_flight: u64) -> Admission;

    /// `in_flight` を数える必要があるか（ストア問い合わせを省くため）
    fn needs_in_flight(&self) -> bool {
        false
    }
}

pub fn policy_for(kind: &RateLimitKind) -> Box<dyn RateLimitPolicy> {
    match kind.normalized() {
        RateLimitKind::TokenBucket {
            capacity,
            refill_per_second,
        } => Box::new(TokenBucket::new(capacity, refill_per_second)),
        RateLimitKind::FixedWindow {
            limit,
            window_seconds,
        } => Box::new(FixedWindow::new(limit, window_seconds)),
        RateLimitKind::Concurrency { max_in_flight } => {
            Box::new(ConcurrencyLimit::new(max_in_flight))
        }
        RateLimitKind::Mutex => Box::new(ConcurrencyLimit::new(1)),
    }
}

const TOKEN_EPSILON: f64 = 1e-9;

/// Token bucket: starts full, one token per dispatch.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_second: f64,
    tokens: f64,
    last_refill: Option<DateTime<Utc>>,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_second: f64) -> Self {
        Self {
            capacity: f64::from(capacity),
            refill_per_second,
            tokens: f64::from(capacity),
            last_refill: None,
        }
    }

    fn refill(&mut self, now: DateTime<Utc>) {
        if let Some(last) = self.last_refill {
            let elapsed_ms = (now - last).num_milliseconds().max(0) as f64;
            self.tokens =
                (self.tokens + elapsed_ms * self.refill_per_second / 1_000.0).min(self.capacity);
        }
        self.last_refill = Some(now);
    }

    fn check(&self, now: DateTime<Utc>) -> Admission {
        // 浮動小数の端数で 1 トークンに届かないのを避ける
        if self.tokens >= 1.0 - TOKEN_EPSILON {
            return Admission::Open;
        }
        let wait_ms = ((1.0 - self.tokens) * 1_000.0 / self.refill_per_second).ceil() as i64;
        Admission::Suspended {
            // 補充が遅すぎて表せない時刻は「期限なし」として扱う
            until: chrono::Duration::try_milliseconds(wait_ms)
                .and_then(|d| now.checked_add_signed(d)),
        }
    }
}

impl RateLimitPolicy for TokenBucket {
    fn on_dispatch(&mut self, now: DateTime<Utc>, _in_flight: u64) -> Admission {
        self.refill(now);
        self.tokens -= 1.0;
        self.check(now)
    }

    fn poll(&mut self, now: DateTime<Utc>, _in_flight: u64) -> Admission {
        self.refill(now);
        self.check(now)
    }
}

/// Fixed window aligned to the epoch.
#[derive(Debug)]
pub struct FixedWindow {
    limit: u32,
    window_ms: i64,
    window_start: i64,
    count: u32,
}

impl FixedWindow {
    pub fn new(limit: u32, window_seconds: u64) -> Self {
        Self {
            limit,
            window_ms: i64::try_from(window_seconds.saturating_mul(1_000))
                .unwrap_or(i64::MAX)
                .max(1),
            window_start: i64::MIN,
            count: 0,
        }
    }

    fn roll(&mut self, now: DateTime<Utc>) {
        let now_ms = now.timestamp_millis();
        let start = now_ms - now_ms.rem_euclid(self.window_ms);
        if start != self.window_start {
            self.window_start = start;
            self.count = 0;
        }
    }

    fn check(&self) -> Admission {
        if self.count < self.limit {
            return Admission::Open;
        }
        Admission::Suspended {
            until: DateTime::<Utc>::from_timestamp_millis(
                self.window_start.saturating_add(self.window_ms),
            ),
        }
    }
}

impl RateLimitPolicy for FixedWindow {
    fn on_dispatch(&mut self, now: DateTime<Utc>, _in_flight: u64) -> Admission {
        self.roll(now);
        self.count = self.count.saturating_add(1);
        self.check()
    }

    fn poll(&mut self, now: DateTime<Utc>, _in_flight: u64) -> Admission {
        self.roll(now);
        self.check()
    }
}

/// Caps live leases across the limiter's VQs.
#[derive(Debug)]
pub struct ConcurrencyLimit {
    max_in_flight: u64,
}

impl ConcurrencyLimit {
    pub fn new(max_in_flight: u32) -> Self {
        Self {
            max_in_flight: u64::from(max_in_flight),
        }
    }

    fn check(&self, in_flight: u64) -> Admission {
        if in_flight < self.max_in_flight {
            Admission::Open
        } else {
            Admission::Suspended { until: None }
        }
    }
}

impl RateLimitPolicy for ConcurrencyLimit {
    fn on_dispatch(&mut self, _now: DateTime<Utc>, in_flight: u64) -> Admission {
        self.check(in_flight)
    }

    fn poll(&mut self, _now: DateTime<Utc>, in_flight: u64) -> Admission {
        self.check(in_flight)
    }

    fn needs_in_flight(&self) -> bool {
        true
    }
}

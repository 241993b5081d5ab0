//! Weighted random pick over buckets.
//!
//! 累積和の配列を作り、`[0, total)` の乱数を二分探索で区間に落とします。
//! 重みは整数なので浮動小数の誤差は入りません。

use rand::Rng;

/// Prefix sums of positive weights.
#[derive(Debug, Clone)]
pub struct WeightedTable {
    cumulative: Vec<u64>,
}

impl WeightedTable {
    /// 重み 0 の要素は選ばれない。全要素が 0 なら一様に選ぶ。
    pub fn new(weights: impl IntoIterator<Item = u64>) -> Self {
        let weights: Vec<u64> = weights.into_iter().collect();
        let uniform = weights.iter().all(|&w| w == 0);
        let mut total: u64 = 0;
        let cumulative = weights
            .into_iter()
            .map(|w| {
                total = total.saturating_add(if uniform { 1 } else { w });
                total
            })
            .collect();
        Self { cumulative }
    }

    pub fn len(&self) -> usize {
        self.cumulative.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cumulative.is_empty()
    }

    pub fn total(&self) -> u64 {
        self.cumulative.last().copied().unwrap_or(0)
    }

    /// Index owning the point `r` (`r < total`).
    pub fn index_of(&self, r: u64) -> usize {
        self.cumulative.partition_point(|&c| c <= r)
    }

    /// Draws an index; `None` when empty. 1 要素なら乱数を使わない。
    pub fn pick<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<usize> {
        match self.cumulative.len() {
            0 => None,
            1 => Some(0),
            _ => Some(self.index_of(rng.gen_range(0..self.total()))),
        }
    }
}

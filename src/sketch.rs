//! A bounded-memory streaming histogram. We keep at most `budget` weighted
//! centroids ordered by value, and when an insert pushes us over budget we fold
//! together the two neighbours that sit closest to each other. This is the
//! classic Ben-Haim/Tom-Tov streaming histogram, which is plenty accurate for
//! dashboard percentiles and never allocates past its budget.
use crate::error::ConfigError;

const DEFAULT_BUCKET_BUDGET: usize = 50;

/// The maximum number of distinct buckets a [`Sketch`] retains.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BucketBudget(usize);

impl BucketBudget {
    pub fn new(budget: usize) -> Result<Self, ConfigError> {
        if budget == 0 {
            return Err(ConfigError::InvalidBucketBudget(budget));
        }
        Ok(Self(budget))
    }

    pub fn get(&self) -> usize {
        self.0
    }
}

impl Default for BucketBudget {
    fn default() -> Self {
        Self(DEFAULT_BUCKET_BUDGET)
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
struct Bucket {
    value: f64,
    weight: u64,
}

#[derive(Debug, Clone)]
pub struct Sketch {
    budget: usize,
    total: u64,
    buckets: Vec<Bucket>,
}

impl Default for Sketch {
    fn default() -> Self {
        Self::new(BucketBudget::default())
    }
}

impl Sketch {
    pub fn new(budget: BucketBudget) -> Self {
        Self {
            budget: budget.get(),
            total: 0,
            // One extra slot since we insert before trimming.
            buckets: Vec::with_capacity(budget.get() + 1),
        }
    }

    /// Total number of samples folded into this sketch.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn insert(&mut self, value: f64) {
        self.total += 1;
        // total_cmp gives NaN a stable home at the ends instead of poisoning
        // the ordering.
        let pos = self
            .buckets
            .partition_point(|b| b.value.total_cmp(&value).is_lt());
        if let Some(bucket) = self.buckets.get_mut(pos) {
            if bucket.value.total_cmp(&value).is_eq() {
                bucket.weight += 1;
                return;
            }
        }
        self.buckets.insert(pos, Bucket { value, weight: 1 });
        while self.buckets.len() > self.budget {
            self.merge_closest();
        }
    }

    /// Merge the adjacent pair with the smallest gap. Ties go to the lowest
    /// index so a given insert sequence always produces the same buckets.
    fn merge_closest(&mut self) {
        debug_assert!(self.buckets.len() >= 2);
        let mut best = 0;
        let mut best_gap = self.buckets[1].value - self.buckets[0].value;
        for (idx, pair) in self.buckets.windows(2).enumerate().skip(1) {
            let gap = pair[1].value - pair[0].value;
            if gap < best_gap {
                best = idx;
                best_gap = gap;
            }
        }
        let right = self.buckets.remove(best + 1);
        let left = &mut self.buckets[best];
        let weight = left.weight + right.weight;
        left.value =
            (left.value * left.weight as f64 + right.value * right.weight as f64) / weight as f64;
        left.weight = weight;
    }

    /// Estimate the value at quantile `q`. Each bucket is anchored at the
    /// midpoint of the cumulative weight it covers and we interpolate linearly
    /// between neighbouring anchors. Returns `None` if the sketch is empty.
    pub fn quantile(&self, q: f64) -> Option<f64> {
        if self.total == 0 || q.is_nan() {
            return None;
        }
        let target = q.clamp(0.0, 1.0) * self.total as f64;
        let mut seen = 0f64;
        let mut prev: Option<(f64, f64)> = None;
        for bucket in &self.buckets {
            let weight = bucket.weight as f64;
            let center = seen + weight / 2.0;
            if target <= center {
                return Some(match prev {
                    None => bucket.value,
                    Some((prev_center, prev_value)) => {
                        let frac = (target - prev_center) / (center - prev_center);
                        prev_value + (bucket.value - prev_value) * frac
                    }
                });
            }
            prev = Some((center, bucket.value));
            seen += weight;
        }
        self.buckets.last().map(|b| b.value)
    }
}

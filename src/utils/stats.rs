//! Streaming statistics
use num_traits::real::Real;
use serde::{Deserialize, Serialize};
use std::iter::{Extend, FromIterator};

/// Online mean and variance calculation using Welford's Algorithm
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OnlineMeanVariance<T> {
    mean: T,
    squared_residual_sum: T,
    count: u64,
}

impl<T: Real> Default for OnlineMeanVariance<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Real> OnlineMeanVariance<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            mean: T::zero(),
            squared_residual_sum: T::zero(),
            count: 0,
        }
    }

    /// Number of accumulated values.
    #[must_use]
    pub const fn count(&self) -> u64 {
        self.count
    }

    /// The mean of all accumulated values, if any.
    #[must_use]
    pub fn mean(&self) -> Option<T> {
        if self.count > 0 {
            Some(self.mean)
        } else {
            None
        }
    }

    /// The (population) variance of all accumulated values, if any.
    #[must_use]
    pub fn variance(&self) -> Option<T> {
        if self.count > 0 {
            Some(self.squared_residual_sum / T::from(self.count)?)
        } else {
            None
        }
    }

    /// The (population) standard deviation of all accumulated values, if any.
    #[must_use]
    pub fn stddev(&self) -> Option<T> {
        self.variance().map(Real::sqrt)
    }

    /// Add a new value to the calculation.
    pub fn push(&mut self, value: T) {
        let residual_pre = value - self.mean;
        self.count += 1;
        // u64 -> float conversion does not fail for float types
        let count = T::from(self.count).unwrap_or_else(T::max_value);
        self.mean = self.mean + residual_pre / count;
        let residual_post = value - self.mean;
        self.squared_residual_sum = self.squared_residual_sum + residual_pre * residual_post;
    }

    /// Combine with statistics accumulated over a disjoint set of values.
    ///
    /// Uses the parallel update of Chan et al.
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        if other.count == 0 {
            return *self;
        }
        if self.count == 0 {
            return *other;
        }
        let count = self.count + other.count;
        let (n_a, n_b, n) = match (
            T::from(self.count),
            T::from(other.count),
            T::from(count),
        ) {
            (Some(a), Some(b), Some(n)) => (a, b, n),
            _ => return *self,
        };
        let delta = other.mean - self.mean;
        Self {
            mean: self.mean + delta * n_b / n,
            squared_residual_sum: self.squared_residual_sum
                + other.squared_residual_sum
                + delta * delta * n_a * n_b / n,
            count,
        }
    }
}

impl<T: Real> Extend<T> for OnlineMeanVariance<T> {
    fn extend<I>(&mut self, iter: I)
    where
        I: IntoIterator<Item = T>,
    {
        for value in iter {
            self.push(value)
        }
    }
}

impl<T: Real> FromIterator<T> for OnlineMeanVariance<T> {
    fn from_iter<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = T>,
    {
        let mut s = Self::default();
        s.extend(iter);
        s
    }
}

/// Streaming mean, variance and range of a single value channel.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub moments: OnlineMeanVariance<f64>,
    pub min: f64,
    pub max: f64,
}

impl Default for ChannelStats {
    fn default() -> Self {
        Self {
            moments: OnlineMeanVariance::new(),
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }
}

impl ChannelStats {
    pub fn push(&mut self, value: f64) {
        self.moments.push(value);
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        Self {
            moments: self.moments.merge(&other.moments),
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    #[must_use]
    pub const fn count(&self) -> u64 {
        self.moments.count()
    }
}

/// Per-channel statistics of a fixed-width vector stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorStats {
    channels: Vec<ChannelStats>,
}

impl VectorStats {
    #[must_use]
    pub fn new(dim: usize) -> Self {
        Self {
            channels: vec![ChannelStats::default(); dim],
        }
    }

    /// Add one vector. Extra or missing trailing entries are ignored.
    pub fn push<'a, I>(&mut self, values: I)
    where
        I: IntoIterator<Item = &'a f32>,
    {
        for (channel, &value) in self.channels.iter_mut().zip(values) {
            channel.push(f64::from(value));
        }
    }

    /// Merge channel-wise. Both sides must have the same dimension.
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        assert_eq!(
            self.channels.len(),
            other.channels.len(),
            "merging statistics of different dimensions"
        );
        Self {
            channels: self
                .channels
                .iter()
                .zip(&other.channels)
                .map(|(a, b)| a.merge(b))
                .collect(),
        }
    }

    #[must_use]
    pub fn channels(&self) -> &[ChannelStats] {
        &self.channels
    }

    /// Per-channel means; `NaN` for channels without data.
    #[must_use]
    pub fn means(&self) -> Vec<f64> {
        self.channels
            .iter()
            .map(|c| c.moments.mean().unwrap_or(f64::NAN))
            .collect()
    }

    /// Per-channel standard deviations; `NaN` for channels without data.
    #[must_use]
    pub fn stddevs(&self) -> Vec<f64> {
        self.channels
            .iter()
            .map(|c| c.moments.stddev().unwrap_or(f64::NAN))
            .collect()
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.channels.first().map_or(0, ChannelStats::count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_f64() {
        let stats: OnlineMeanVariance<f64> = [1.0, 2.0, 3.0, 4.0].into_iter().collect();
        assert!((stats.mean().unwrap() - 2.5).abs() < 1e-8);
        assert!((stats.variance().unwrap() - 1.25).abs() < 1e-8);
    }

    #[test]
    fn empty_has_no_mean() {
        let stats = OnlineMeanVariance::<f64>::new();
        assert_eq!(stats.mean(), None);
        assert_eq!(stats.stddev(), None);
    }

    #[test]
    fn merge_matches_sequential() {
        let values = [0.5, -1.0, 3.0, 2.25, 8.0, -4.5, 0.0];
        let all: OnlineMeanVariance<f64> = values.iter().copied().collect();
        let left: OnlineMeanVariance<f64> = values[..3].iter().copied().collect();
        let right: OnlineMeanVariance<f64> = values[3..].iter().copied().collect();
        let merged = left.merge(&right);
        assert_eq!(merged.count(), all.count());
        assert!((merged.mean().unwrap() - all.mean().unwrap()).abs() < 1e-12);
        assert!((merged.variance().unwrap() - all.variance().unwrap()).abs() < 1e-12);
    }

    #[test]
    fn merge_with_empty() {
        let stats: OnlineMeanVariance<f64> = [1.0, 2.0].into_iter().collect();
        assert_eq!(stats.merge(&OnlineMeanVariance::new()), stats);
        assert_eq!(OnlineMeanVariance::new().merge(&stats), stats);
    }

    #[test]
    fn vector_stats_range() {
        let mut stats = VectorStats::new(2);
        stats.push(&[1.0, -2.0]);
        stats.push(&[3.0, 2.0]);
        let channels = stats.channels();
        assert_eq!(channels[0].min, 1.0);
        assert_eq!(channels[0].max, 3.0);
        assert_eq!(stats.means(), vec![2.0, 0.0]);
        assert_eq!(stats.count(), 2);
    }
}

//! `IntervalSpace` and `BoxSpace` definitions
use super::Space;
use crate::Action;
use ndarray::Array1;
use rand::distributions::Distribution;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A closed interval of floating-point numbers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntervalSpace {
    pub low: f32,
    pub high: f32,
}

impl IntervalSpace {
    #[must_use]
    pub fn new(low: f32, high: f32) -> Self {
        assert!(low <= high, "require low <= high");
        Self { low, high }
    }
}

impl fmt::Display for IntervalSpace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "IntervalSpace({}, {})", self.low, self.high)
    }
}

impl Space for IntervalSpace {
    type Element = f32;

    fn contains(&self, value: &Self::Element) -> bool {
        &self.low <= value && value <= &self.high && value.is_finite()
    }
}

impl Distribution<f32> for IntervalSpace {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f32 {
        if self.low < self.high {
            rng.gen_range(self.low..=self.high)
        } else {
            self.low
        }
    }
}

/// A product of bounded closed intervals; continuous vector actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoxSpace {
    pub intervals: Vec<IntervalSpace>,
}

impl BoxSpace {
    /// Create from per-dimension lower and upper bounds.
    ///
    /// # Panics
    /// If the bound lengths differ or any `low > high`.
    #[must_use]
    pub fn new(low: Vec<f32>, high: Vec<f32>) -> Self {
        assert_eq!(low.len(), high.len(), "bounds must have equal length");
        Self {
            intervals: low
                .into_iter()
                .zip(high)
                .map(|(low, high)| IntervalSpace::new(low, high))
                .collect(),
        }
    }

    #[must_use]
    pub fn dim(&self) -> usize {
        self.intervals.len()
    }

    /// Sum of the log side lengths.
    #[must_use]
    pub fn log_volume(&self) -> f64 {
        self.intervals
            .iter()
            .map(|i| f64::from(i.high - i.low).ln())
            .sum()
    }

    #[must_use]
    pub fn bounds(&self) -> (Array1<f32>, Array1<f32>) {
        (
            self.intervals.iter().map(|i| i.low).collect(),
            self.intervals.iter().map(|i| i.high).collect(),
        )
    }
}

impl fmt::Display for BoxSpace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "BoxSpace(")?;
        let mut first = true;
        for interval in &self.intervals {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            write!(f, "[{}, {}]", interval.low, interval.high)?;
        }
        write!(f, ")")
    }
}

impl Space for BoxSpace {
    type Element = Action;

    fn contains(&self, value: &Self::Element) -> bool {
        value.len() == self.intervals.len()
            && self
                .intervals
                .iter()
                .zip(value)
                .all(|(interval, x)| interval.contains(x))
    }
}

impl Distribution<Action> for BoxSpace {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Action {
        self.intervals.iter().map(|i| i.sample(rng)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Prng;
    use ndarray::array;
    use rand::SeedableRng;

    #[test]
    fn box_contains() {
        let space = BoxSpace::new(vec![-1.0, 0.0], vec![1.0, 2.0]);
        assert!(space.contains(&array![0.0, 2.0]));
        assert!(!space.contains(&array![0.0, 2.5]));
        assert!(!space.contains(&array![0.0]));
        assert!(!space.contains(&array![f32::NAN, 1.0]));
    }

    #[test]
    fn box_samples_are_contained() {
        let space = BoxSpace::new(vec![-1.0, 0.0, 3.0], vec![1.0, 2.0, 3.0]);
        let mut rng = Prng::seed_from_u64(7);
        for _ in 0..100 {
            assert!(space.contains(&space.sample(&mut rng)));
        }
    }

    #[test]
    fn display() {
        let space = BoxSpace::new(vec![-1.0], vec![1.0]);
        assert_eq!(format!("{}", space), "BoxSpace([-1, 1])");
    }
}

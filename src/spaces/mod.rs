//! Action spaces
mod index;
mod interval;

pub use index::IndexSpace;
pub use interval::{BoxSpace, IntervalSpace};

use crate::Action;
use ndarray::Array1;
use rand::distributions::Distribution;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Display};

/// A mathematical space
pub trait Space: Display + Debug + Distribution<<Self as Space>::Element> {
    type Element;

    /// Check if the space contains a particular value
    fn contains(&self, value: &Self::Element) -> bool;
}

/// The action space of an environment.
///
/// Actions are stored in replay pools as flat `f32` vectors.
/// A discrete action is stored as its index in a length-1 vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ActionSpace {
    Discrete(IndexSpace),
    Box(BoxSpace),
}

impl ActionSpace {
    /// Length of the flat action vector.
    #[must_use]
    pub fn flat_dim(&self) -> usize {
        match self {
            Self::Discrete(_) => 1,
            Self::Box(space) => space.dim(),
        }
    }

    /// Log probability density of any action under the uniform distribution over the space.
    #[must_use]
    pub fn uniform_log_prob(&self) -> f64 {
        match self {
            #[allow(clippy::cast_precision_loss)]
            Self::Discrete(space) => -(space.size as f64).ln(),
            Self::Box(space) => -space.log_volume(),
        }
    }

    /// Lower and upper bounds of each element of the flat action vector.
    #[must_use]
    pub fn bounds(&self) -> (Array1<f32>, Array1<f32>) {
        match self {
            #[allow(clippy::cast_precision_loss)]
            Self::Discrete(space) => (
                Array1::zeros(1),
                Array1::from_elem(1, space.size.saturating_sub(1) as f32),
            ),
            Self::Box(space) => space.bounds(),
        }
    }
}

impl Display for ActionSpace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Discrete(space) => Display::fmt(space, f),
            Self::Box(space) => Display::fmt(space, f),
        }
    }
}

impl Space for ActionSpace {
    type Element = Action;

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn contains(&self, value: &Self::Element) -> bool {
        match self {
            Self::Discrete(space) => {
                value.len() == 1
                    && value[0] >= 0.0
                    && value[0].fract() == 0.0
                    && space.contains(&(value[0] as usize))
            }
            Self::Box(space) => space.contains(value),
        }
    }
}

impl Distribution<Action> for ActionSpace {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Action {
        match self {
            #[allow(clippy::cast_precision_loss)]
            Self::Discrete(space) => Array1::from_elem(1, space.sample(rng) as f32),
            Self::Box(space) => space.sample(rng),
        }
    }
}

//! Reinforcement learning environment interface
mod vec_env;
#[cfg(test)]
pub mod testing;

pub use vec_env::{VecEnv, VecEnvStep};

use crate::error::BoxedError;
use crate::spaces::ActionSpace;
use crate::{Action, EnvInfo, Observation};

/// The external structure of an environment.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvSpec {
    /// Shape of the image part of each observation.
    pub im_shape: Vec<usize>,
    /// Length of the vector part of each observation.
    pub vec_dim: usize,
    /// The space of all possible actions.
    pub action_space: ActionSpace,
}

/// The outcome of a single environment step.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvStep {
    /// Observation of the resulting state.
    pub observation: Observation,
    /// The reward value for this transition.
    pub reward: f64,
    /// Whether this step ends the episode.
    pub done: bool,
    /// Additional per-step information.
    pub info: EnvInfo,
}

/// A reinforcement learning environment with internal state.
///
/// Simulated or physical; errors from the underlying system are reported as faults and are
/// never retried here.
pub trait Environment {
    /// Observation and action structure of the environment.
    fn spec(&self) -> EnvSpec;

    /// Maximum number of steps in an episode.
    fn horizon(&self) -> u64;

    /// Reset the environment to an initial state.
    ///
    /// Must be called before each new episode.
    fn reset(&mut self) -> Result<Observation, BoxedError>;

    /// Take a step in the environment.
    ///
    /// May fail if the state has not been initialized with `reset()`
    /// after initialization or after a step returned `done = true`.
    fn step(&mut self, action: &Action) -> Result<EnvStep, BoxedError>;
}

impl<E: Environment + ?Sized> Environment for Box<E> {
    fn spec(&self) -> EnvSpec {
        E::spec(self)
    }
    fn horizon(&self) -> u64 {
        E::horizon(self)
    }
    fn reset(&mut self) -> Result<Observation, BoxedError> {
        E::reset(self)
    }
    fn step(&mut self, action: &Action) -> Result<EnvStep, BoxedError> {
        E::step(self, action)
    }
}

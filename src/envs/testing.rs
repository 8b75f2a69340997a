//! Environments for testing
use super::{EnvSpec, EnvStep, Environment};
use crate::error::BoxedError;
use crate::spaces::{ActionSpace, IndexSpace};
use crate::{Action, EnvInfo, Observation};
use ndarray::{Array1, ArrayD, IxDyn};
use serde_json::json;

pub const IM_SHAPE: [usize; 2] = [2, 2];

/// An observation whose image and vector parts both encode `value`.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn counting_observation(value: u64) -> Observation {
    Observation {
        im: ArrayD::from_elem(IxDyn(&IM_SHAPE), value as u8),
        vec: Array1::from_elem(1, value as f32),
    }
}

/// Counts steps within an episode.
///
/// Observes the current step count, gives reward `1` each step
/// and ends the episode after `episode_len` steps.
#[derive(Debug, Clone, PartialEq)]
pub struct CountingEnv {
    pub episode_len: u64,
    /// Fail once, on this (0-based) lifetime step.
    pub fault_at: Option<u64>,
    t: u64,
    total_steps: u64,
}

impl CountingEnv {
    pub const fn new(episode_len: u64) -> Self {
        Self {
            episode_len,
            fault_at: None,
            t: 0,
            total_steps: 0,
        }
    }

    pub const fn with_fault_at(episode_len: u64, fault_at: u64) -> Self {
        Self {
            episode_len,
            fault_at: Some(fault_at),
            t: 0,
            total_steps: 0,
        }
    }
}

impl Environment for CountingEnv {
    fn spec(&self) -> EnvSpec {
        EnvSpec {
            im_shape: IM_SHAPE.to_vec(),
            vec_dim: 1,
            action_space: ActionSpace::Discrete(IndexSpace::new(2)),
        }
    }

    fn horizon(&self) -> u64 {
        self.episode_len
    }

    fn reset(&mut self) -> Result<Observation, BoxedError> {
        self.t = 0;
        Ok(counting_observation(0))
    }

    fn step(&mut self, action: &Action) -> Result<EnvStep, BoxedError> {
        self.total_steps += 1;
        if self.fault_at == Some(self.total_steps - 1) {
            return Err("simulated fault".into());
        }
        self.t += 1;
        let mut info = EnvInfo::new();
        info.insert("action".into(), json!(action[0]));
        Ok(EnvStep {
            observation: counting_observation(self.t),
            reward: 1.0,
            done: self.t >= self.episode_len,
            info,
        })
    }
}

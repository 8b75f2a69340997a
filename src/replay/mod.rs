//! Replay pools
//!
//! A [`RingStore`] is a fixed-capacity circular buffer of transitions for a single
//! environment. Transitions are written either live, one step at a time, with the two-phase
//! [`RingStore::store_observation`] / [`RingStore::store_effect`] sequence, or in bulk from
//! recorded [`Rollout`]s. Batches combine stacked observation histories with N-step returns.
mod encode;
mod ingest;
mod returns;
mod ring;
mod sample;
mod stats;
#[cfg(test)]
pub mod testing;

pub use encode::EncodedObservation;
pub use ingest::{
    load_rollout_files, write_rollout_file, CborRolloutReader, LoadReport, Rollout, RolloutFile,
    RolloutReader,
};
pub use returns::NStepReturn;
pub use ring::{PendingStep, RingStore, WriteState};
pub use sample::{Batch, SampleWeighting};
pub use stats::{EpisodeSummary, PoolStatistics};

use crate::error::ReplayError;
use ndarray::{Array1, ArrayD};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A flat action vector.
pub type Action = Array1<f32>;

/// Additional per-step information reported by an environment or a policy.
pub type EnvInfo = BTreeMap<String, serde_json::Value>;

/// An environment observation, split into an image-like part and a flat vector part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub im: ArrayD<u8>,
    pub vec: Array1<f32>,
}

/// The second half of a transition: what happened after observing.
#[derive(Debug, Clone, PartialEq)]
pub struct Effect {
    pub action: Action,
    pub reward: f64,
    pub done: bool,
    pub env_info: EnvInfo,
    /// Value estimate of the policy; `NaN` when unknown.
    pub est_value: f64,
    pub logprob: f64,
}

/// How a pool selects sample indices.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SamplingMethod {
    /// Uniformly at random over all valid indices.
    Uniform,
    /// Uniformly at random over valid indices belonging to completed episodes.
    OnlyCompletedEpisodes,
}

impl Default for SamplingMethod {
    fn default() -> Self {
        Self::Uniform
    }
}

/// Sizes of the stored observation and action arrays.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Layout {
    pub im_shape: Vec<usize>,
    pub vec_dim: usize,
    pub action_dim: usize,
}

impl From<&crate::envs::EnvSpec> for Layout {
    fn from(spec: &crate::envs::EnvSpec) -> Self {
        Self {
            im_shape: spec.im_shape.clone(),
            vec_dim: spec.vec_dim,
            action_dim: spec.action_space.flat_dim(),
        }
    }
}

/// Configuration of a [`RingStore`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of transitions held.
    pub capacity: usize,
    /// Return horizon `N`.
    pub n_step: usize,
    /// Discount factor, in `[0, 1]`.
    pub gamma: f64,
    /// Number of stacked observation frames `H`.
    pub obs_history_len: usize,
    pub sampling_method: SamplingMethod,
    /// Keep finished live episodes for [`RingStore::get_recent_paths`].
    pub save_rollouts: bool,
    /// Include observations in saved episodes.
    pub save_rollouts_observations: bool,
    /// Keep environment info of each step. Otherwise env info is discarded on write.
    pub save_env_infos: bool,
    /// Seed of the index sampler.
    pub seed: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 100_000,
            n_step: 1,
            gamma: 0.99,
            obs_history_len: 1,
            sampling_method: SamplingMethod::Uniform,
            save_rollouts: false,
            save_rollouts_observations: true,
            save_env_infos: false,
            seed: 0,
        }
    }
}

impl PoolConfig {
    /// Check that the configuration describes a usable pool.
    pub fn validate(&self) -> Result<(), ReplayError> {
        if self.n_step == 0 {
            return Err(ReplayError::InvalidConfiguration(
                "n_step must be at least 1".into(),
            ));
        }
        if self.obs_history_len == 0 {
            return Err(ReplayError::InvalidConfiguration(
                "obs_history_len must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.gamma) {
            return Err(ReplayError::InvalidConfiguration(format!(
                "gamma must be in [0, 1], got {}",
                self.gamma
            )));
        }
        let span = self.obs_history_len + self.n_step;
        if self.capacity < span {
            return Err(ReplayError::InvalidConfiguration(format!(
                "capacity {} is smaller than obs_history_len + n_step = {}",
                self.capacity, span
            )));
        }
        Ok(())
    }
}

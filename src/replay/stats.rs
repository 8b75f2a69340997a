//! Pool statistics and episode bookkeeping
use super::{Rollout, RingStore};
use crate::logging::{Id, LogError, Loggable, StatsLogger};
use crate::utils::stats::{ChannelStats, OnlineMeanVariance, VectorStats};
use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};

/// Streaming statistics of every transition committed to a pool.
///
/// Used by policies to normalize their inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolStatistics {
    pub observations_vec: VectorStats,
    pub actions: VectorStats,
    pub rewards: ChannelStats,
}

impl PoolStatistics {
    #[must_use]
    pub fn new(vec_dim: usize, action_dim: usize) -> Self {
        Self {
            observations_vec: VectorStats::new(vec_dim),
            actions: VectorStats::new(action_dim),
            rewards: ChannelStats::default(),
        }
    }

    /// Number of transitions summarized.
    #[must_use]
    pub const fn count(&self) -> u64 {
        self.rewards.count()
    }

    pub fn push(&mut self, observation_vec: ArrayView1<f32>, action: ArrayView1<f32>, reward: f64) {
        self.observations_vec.push(observation_vec.iter());
        self.actions.push(action.iter());
        self.rewards.push(reward);
    }

    /// Combine the statistics of two pools with the same layout.
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        Self {
            observations_vec: self.observations_vec.merge(&other.observations_vec),
            actions: self.actions.merge(&other.actions),
            rewards: self.rewards.merge(&other.rewards),
        }
    }
}

/// Return and length of a finished live episode.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct EpisodeSummary {
    pub episode_return: f64,
    pub length: u64,
}

/// Tracks the open live episode and the episodes finished since they were last reported.
#[derive(Debug, Clone, PartialEq)]
pub struct EpisodeLog {
    save_rollouts: bool,
    save_observations: bool,
    current_return: f64,
    current_len: u64,
    finished: Vec<EpisodeSummary>,
    rollouts: Vec<Rollout>,
}

impl EpisodeLog {
    pub const fn new(save_rollouts: bool, save_observations: bool) -> Self {
        Self {
            save_rollouts,
            save_observations,
            current_return: 0.0,
            current_len: 0,
            finished: Vec::new(),
            rollouts: Vec::new(),
        }
    }

    pub fn push_step(&mut self, reward: f64) {
        self.current_return += reward;
        self.current_len += 1;
    }

    /// End the open episode, recording it if it has any live steps.
    pub fn finish_current(&mut self) -> Option<EpisodeSummary> {
        if self.current_len == 0 {
            return None;
        }
        let summary = EpisodeSummary {
            episode_return: self.current_return,
            length: self.current_len,
        };
        self.finished.push(summary);
        self.discard_current();
        Some(summary)
    }

    pub fn discard_current(&mut self) {
        self.current_return = 0.0;
        self.current_len = 0;
    }

    pub const fn saves_rollouts(&self) -> bool {
        self.save_rollouts
    }

    pub const fn saves_observations(&self) -> bool {
        self.save_observations
    }

    pub fn push_rollout(&mut self, rollout: Rollout) {
        self.rollouts.push(rollout);
    }

    pub fn take_finished(&mut self) -> Vec<EpisodeSummary> {
        std::mem::take(&mut self.finished)
    }

    pub fn take_rollouts(&mut self) -> Vec<Rollout> {
        std::mem::take(&mut self.rollouts)
    }
}

impl RingStore {
    /// Log the pool size and the episodes finished since the previous call.
    ///
    /// Values are logged under `prefix`. Episode values are only logged when at least one
    /// episode has finished.
    pub fn log<L: StatsLogger + ?Sized>(
        &mut self,
        logger: &mut L,
        prefix: &str,
    ) -> Result<(), LogError> {
        let finished = self.episodes.take_finished();
        logger.group_start();
        let result = self.log_group(logger, prefix, &finished);
        logger.group_end();
        result
    }

    #[allow(clippy::cast_precision_loss)]
    fn log_group<L: StatsLogger + ?Sized>(
        &self,
        logger: &mut L,
        prefix: &str,
        finished: &[EpisodeSummary],
    ) -> Result<(), LogError> {
        logger.group_log(Id::scoped(prefix, "pool_size"), (self.len() as f64).into())?;
        if finished.is_empty() {
            return Ok(());
        }
        let returns: OnlineMeanVariance<f64> = finished.iter().map(|e| e.episode_return).collect();
        let lengths: OnlineMeanVariance<f64> = finished.iter().map(|e| e.length as f64).collect();
        logger.group_log(
            Id::scoped(prefix, "ep_return_mean"),
            returns.mean().unwrap_or(f64::NAN).into(),
        )?;
        logger.group_log(
            Id::scoped(prefix, "ep_return_std"),
            returns.stddev().unwrap_or(f64::NAN).into(),
        )?;
        logger.group_log(
            Id::scoped(prefix, "ep_length_mean"),
            lengths.mean().unwrap_or(f64::NAN).into(),
        )?;
        logger.group_log(
            Id::scoped(prefix, "episodes"),
            Loggable::CounterIncrement(finished.len() as u64),
        )
    }

    /// Take the live episodes saved since the previous call.
    ///
    /// Empty unless the pool was configured with `save_rollouts`.
    pub fn get_recent_paths(&mut self) -> Vec<Rollout> {
        self.episodes.take_rollouts()
    }
}

//! Action-selecting policies
mod exploration;

pub use exploration::{EpsilonGreedy, Exploring, PiecewiseSchedule};

use crate::error::{BoxedError, ReplayError};
use crate::logging::{Id, LogError, StatsLogger};
use crate::replay::{Batch, EncodedObservation};
use crate::spaces::ActionSpace;
use crate::{Action, EnvInfo, Prng};
use rand::distributions::Distribution;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Actions chosen for a batch of environments, one entry per environment.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PolicyOutput {
    pub actions: Vec<Action>,
    /// Value estimate of each observation; `NaN` if the policy has none.
    pub est_values: Vec<f64>,
    /// Log probability of each action under the policy.
    pub logprobs: Vec<f64>,
    /// Extra information to store with the environment info of the step.
    pub action_infos: Vec<EnvInfo>,
}

/// A decision-making policy trained from replayed batches.
pub trait Policy {
    /// Return horizon of the batches the policy trains on.
    fn n_step(&self) -> usize;

    /// Discount factor.
    fn gamma(&self) -> f64;

    /// Number of stacked observation frames the policy acts on.
    fn obs_history_len(&self) -> usize;

    /// Whether to train only on transitions of completed episodes.
    fn only_completed_episodes(&self) -> bool {
        false
    }

    /// Choose one action for each environment.
    ///
    /// # Args
    /// * `steps` - Global step index of each environment.
    /// * `current_episode_steps` - Steps taken so far in the episode of each environment.
    /// * `observations` - Encoded observation history of each environment.
    /// * `explore` - Whether to add exploration noise.
    fn get_actions(
        &mut self,
        steps: &[u64],
        current_episode_steps: &[u64],
        observations: &[EncodedObservation],
        explore: bool,
    ) -> Result<PolicyOutput, ReplayError>;

    /// Forget any per-episode action-selection state.
    ///
    /// Called whenever an environment finishes an episode.
    fn reset_get_action(&mut self) {}

    /// Update the policy from a batch of transitions.
    fn train_step(&mut self, step: u64, batch: &Batch) -> Result<(), ReplayError>;

    /// Save the policy parameters.
    fn save(&self, _path: &Path) -> Result<(), ReplayError> {
        Ok(())
    }

    /// Restore parameters written by [`Policy::save`].
    fn restore(&mut self, _path: &Path) -> Result<(), ReplayError> {
        Ok(())
    }

    /// Log training statistics.
    fn log(&mut self, _logger: &mut dyn StatsLogger, _prefix: &str) -> Result<(), LogError> {
        Ok(())
    }
}

/// Configuration of a [`RandomPolicy`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RandomPolicyConfig {
    pub n_step: usize,
    pub gamma: f64,
    pub obs_history_len: usize,
    pub only_completed_episodes: bool,
    pub seed: u64,
}

impl Default for RandomPolicyConfig {
    fn default() -> Self {
        Self {
            n_step: 1,
            gamma: 0.99,
            obs_history_len: 1,
            only_completed_episodes: false,
            seed: 0,
        }
    }
}

impl RandomPolicyConfig {
    pub fn validate(&self) -> Result<(), ReplayError> {
        if self.n_step == 0 || self.obs_history_len == 0 {
            return Err(ReplayError::InvalidConfiguration(
                "n_step and obs_history_len must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.gamma) {
            return Err(ReplayError::InvalidConfiguration(format!(
                "gamma must be in [0, 1], got {}",
                self.gamma
            )));
        }
        Ok(())
    }
}

/// A policy that acts uniformly at random and learns nothing.
#[derive(Debug, Clone)]
pub struct RandomPolicy {
    config: RandomPolicyConfig,
    action_space: ActionSpace,
    rng: Prng,
    train_steps: u64,
}

impl RandomPolicy {
    pub fn new(config: RandomPolicyConfig, action_space: ActionSpace) -> Result<Self, ReplayError> {
        config.validate()?;
        Ok(Self {
            rng: Prng::seed_from_u64(config.seed),
            config,
            action_space,
            train_steps: 0,
        })
    }
}

impl Policy for RandomPolicy {
    fn n_step(&self) -> usize {
        self.config.n_step
    }

    fn gamma(&self) -> f64 {
        self.config.gamma
    }

    fn obs_history_len(&self) -> usize {
        self.config.obs_history_len
    }

    fn only_completed_episodes(&self) -> bool {
        self.config.only_completed_episodes
    }

    fn get_actions(
        &mut self,
        _steps: &[u64],
        _current_episode_steps: &[u64],
        observations: &[EncodedObservation],
        _explore: bool,
    ) -> Result<PolicyOutput, ReplayError> {
        let n = observations.len();
        Ok(PolicyOutput {
            actions: (0..n)
                .map(|_| self.action_space.sample(&mut self.rng))
                .collect(),
            est_values: vec![f64::NAN; n],
            logprobs: vec![self.action_space.uniform_log_prob(); n],
            action_infos: vec![EnvInfo::new(); n],
        })
    }

    fn train_step(&mut self, _step: u64, batch: &Batch) -> Result<(), ReplayError> {
        if batch.actions.shape()[1] != self.config.n_step {
            return Err(ReplayError::ShapeMismatch {
                field: "batch actions",
                expected: vec![batch.len(), self.config.n_step, self.action_space.flat_dim()],
                actual: batch.actions.shape().to_vec(),
            });
        }
        self.train_steps += 1;
        Ok(())
    }

    fn save(&self, path: &Path) -> Result<(), ReplayError> {
        let file = File::create(path).map_err(policy_error)?;
        serde_json::to_writer(BufWriter::new(file), &self.config).map_err(policy_error)
    }

    fn restore(&mut self, path: &Path) -> Result<(), ReplayError> {
        let file = File::open(path).map_err(policy_error)?;
        let config: RandomPolicyConfig =
            serde_json::from_reader(BufReader::new(file)).map_err(policy_error)?;
        config.validate()?;
        self.rng = Prng::seed_from_u64(config.seed);
        self.config = config;
        Ok(())
    }

    fn log(&mut self, logger: &mut dyn StatsLogger, prefix: &str) -> Result<(), LogError> {
        let steps = std::mem::take(&mut self.train_steps);
        logger.log_counter_increment(Id::scoped(prefix, "train_steps"), steps)
    }
}

fn policy_error<E: Into<BoxedError>>(err: E) -> ReplayError {
    ReplayError::Policy(err.into())
}

/// Policy definition
///
/// Selects one of the supported policy kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PolicyDef {
    /// Uniformly random actions.
    Random(RandomPolicyConfig),
    /// Another policy with epsilon-greedy exploration.
    Exploring {
        policy: Box<PolicyDef>,
        exploration: PiecewiseSchedule,
        seed: u64,
    },
}

impl Default for PolicyDef {
    fn default() -> Self {
        Self::Random(RandomPolicyConfig::default())
    }
}

impl PolicyDef {
    /// Construct the policy for an environment with the given action space.
    pub fn build(&self, action_space: &ActionSpace) -> Result<BuiltPolicy, ReplayError> {
        match self {
            Self::Random(config) => {
                RandomPolicy::new(config.clone(), action_space.clone()).map(BuiltPolicy::Random)
            }
            Self::Exploring {
                policy,
                exploration,
                seed,
            } => {
                let inner = policy.build(action_space)?;
                let strategy = EpsilonGreedy::new(exploration.clone())?;
                Ok(BuiltPolicy::Exploring(Box::new(Exploring::new(
                    inner,
                    strategy,
                    action_space.clone(),
                    *seed,
                ))))
            }
        }
    }
}

/// A policy built from a [`PolicyDef`].
#[derive(Debug, Clone)]
pub enum BuiltPolicy {
    Random(RandomPolicy),
    Exploring(Box<Exploring<BuiltPolicy>>),
}

macro_rules! dispatch {
    ($self:ident, $p:ident => $e:expr) => {
        match $self {
            BuiltPolicy::Random($p) => $e,
            BuiltPolicy::Exploring($p) => $e,
        }
    };
}

impl Policy for BuiltPolicy {
    fn n_step(&self) -> usize {
        dispatch!(self, p => p.n_step())
    }

    fn gamma(&self) -> f64 {
        dispatch!(self, p => p.gamma())
    }

    fn obs_history_len(&self) -> usize {
        dispatch!(self, p => p.obs_history_len())
    }

    fn only_completed_episodes(&self) -> bool {
        dispatch!(self, p => p.only_completed_episodes())
    }

    fn get_actions(
        &mut self,
        steps: &[u64],
        current_episode_steps: &[u64],
        observations: &[EncodedObservation],
        explore: bool,
    ) -> Result<PolicyOutput, ReplayError> {
        dispatch!(self, p => p.get_actions(steps, current_episode_steps, observations, explore))
    }

    fn reset_get_action(&mut self) {
        dispatch!(self, p => p.reset_get_action())
    }

    fn train_step(&mut self, step: u64, batch: &Batch) -> Result<(), ReplayError> {
        dispatch!(self, p => p.train_step(step, batch))
    }

    fn save(&self, path: &Path) -> Result<(), ReplayError> {
        dispatch!(self, p => p.save(path))
    }

    fn restore(&mut self, path: &Path) -> Result<(), ReplayError> {
        dispatch!(self, p => p.restore(path))
    }

    fn log(&mut self, logger: &mut dyn StatsLogger, prefix: &str) -> Result<(), LogError> {
        dispatch!(self, p => p.log(logger, prefix))
    }
}

use super::{EnvSpec, Environment};
use crate::error::ReplayError;
use crate::spaces::ActionSpace;
use crate::{Action, EnvInfo, Observation};

/// Results of stepping every environment of a [`VecEnv`] once.
#[derive(Debug, Clone, PartialEq)]
pub struct VecEnvStep {
    /// Next observation of each environment.
    ///
    /// For environments whose episode ended this is the first observation of the next episode.
    pub observations: Vec<Observation>,
    pub rewards: Vec<f64>,
    pub dones: Vec<bool>,
    pub infos: Vec<EnvInfo>,
}

/// Steps several environments in lockstep.
///
/// Episodes are cut off after `max_path_length` steps. A cut-off is reported as `done`
/// and, like a true terminal step, is followed by an automatic reset.
#[derive(Debug)]
pub struct VecEnv<E> {
    envs: Vec<E>,
    max_path_length: u64,
    current_episode_steps: Vec<u64>,
}

impl<E: Environment> VecEnv<E> {
    /// Create a new executor.
    ///
    /// `max_path_length` is capped by the horizon of each environment.
    pub fn new(envs: Vec<E>, max_path_length: u64) -> Result<Self, ReplayError> {
        let first = envs.first().ok_or_else(|| {
            ReplayError::InvalidConfiguration("at least one environment is required".into())
        })?;
        let spec = first.spec();
        if envs.iter().any(|env| env.spec() != spec) {
            return Err(ReplayError::InvalidConfiguration(
                "all environments must share the same spec".into(),
            ));
        }
        let horizon = envs.iter().map(Environment::horizon).min().unwrap_or(0);
        let num_envs = envs.len();
        Ok(Self {
            envs,
            max_path_length: max_path_length.min(horizon),
            current_episode_steps: vec![0; num_envs],
        })
    }

    #[must_use]
    pub fn num_envs(&self) -> usize {
        self.envs.len()
    }

    #[must_use]
    pub fn spec(&self) -> EnvSpec {
        self.envs[0].spec()
    }

    #[must_use]
    pub fn action_space(&self) -> ActionSpace {
        self.spec().action_space
    }

    #[must_use]
    pub const fn max_path_length(&self) -> u64 {
        self.max_path_length
    }

    /// Number of steps taken so far in the current episode of each environment.
    #[must_use]
    pub fn current_episode_steps(&self) -> &[u64] {
        &self.current_episode_steps
    }

    /// Reset every environment.
    pub fn reset(&mut self) -> Result<Vec<Observation>, ReplayError> {
        self.current_episode_steps.iter_mut().for_each(|s| *s = 0);
        self.envs
            .iter_mut()
            .map(|env| env.reset().map_err(ReplayError::EnvironmentFault))
            .collect()
    }

    /// Step each environment with its own action.
    ///
    /// # Errors
    /// An [`EnvironmentFault`](ReplayError::EnvironmentFault) from any environment aborts the
    /// step. Environments stepped before the fault are not rolled back.
    pub fn step(&mut self, actions: &[Action]) -> Result<VecEnvStep, ReplayError> {
        if actions.len() != self.envs.len() {
            return Err(ReplayError::ShapeMismatch {
                field: "actions",
                expected: vec![self.envs.len()],
                actual: vec![actions.len()],
            });
        }
        let num_envs = self.envs.len();
        let mut result = VecEnvStep {
            observations: Vec::with_capacity(num_envs),
            rewards: Vec::with_capacity(num_envs),
            dones: Vec::with_capacity(num_envs),
            infos: Vec::with_capacity(num_envs),
        };
        for ((env, steps), action) in self
            .envs
            .iter_mut()
            .zip(&mut self.current_episode_steps)
            .zip(actions)
        {
            let step = env.step(action).map_err(ReplayError::EnvironmentFault)?;
            *steps += 1;

            let done = step.done || *steps >= self.max_path_length;
            let observation = if done {
                *steps = 0;
                env.reset().map_err(ReplayError::EnvironmentFault)?
            } else {
                step.observation
            };
            result.observations.push(observation);
            result.rewards.push(step.reward);
            result.dones.push(done);
            result.infos.push(step.info);
        }
        Ok(result)
    }
}

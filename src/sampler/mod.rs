//! Collect experience from several environments into replay pools
use crate::envs::{Environment, VecEnv, VecEnvStep};
use crate::error::ReplayError;
use crate::logging::{Id, StatsLogger};
use crate::policies::{Policy, PolicyOutput};
use crate::replay::{
    load_rollout_files, Batch, CborRolloutReader, Effect, EnvInfo, Layout, Observation,
    PoolConfig, PoolStatistics, RingStore, Rollout, RolloutReader, SamplingMethod,
};
use crate::Prng;
use log::{info, warn};
use rand::distributions::Distribution;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How batches are drawn from the pools of a [`Sampler`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolSampling {
    /// Split each batch evenly over all pools that can be sampled.
    Merge,
    /// Draw each batch from a single pool, taking the pools in turn.
    Cycle,
}

impl Default for PoolSampling {
    fn default() -> Self {
        Self::Merge
    }
}

/// Configuration of a [`Sampler`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Number of environments stepped in lockstep, each with its own pool.
    pub n_envs: usize,
    /// Total capacity, divided evenly among the pools.
    pub replay_pool_size: usize,
    /// Episodes are cut off after this many steps.
    pub max_path_length: u64,
    pub sampling_method: SamplingMethod,
    pub pool_sampling: PoolSampling,
    pub save_rollouts: bool,
    pub save_rollouts_observations: bool,
    pub save_env_infos: bool,
    pub seed: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            n_envs: 1,
            replay_pool_size: 1_000_000,
            max_path_length: u64::MAX,
            sampling_method: SamplingMethod::Uniform,
            pool_sampling: PoolSampling::Merge,
            save_rollouts: false,
            save_rollouts_observations: true,
            save_env_infos: false,
            seed: 0,
        }
    }
}

impl SamplerConfig {
    pub fn validate(&self) -> Result<(), ReplayError> {
        if self.n_envs == 0 {
            return Err(ReplayError::InvalidConfiguration(
                "n_envs must be at least 1".into(),
            ));
        }
        if self.max_path_length == 0 {
            return Err(ReplayError::InvalidConfiguration(
                "max_path_length must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Configuration of the pool of environment `i` for training `policy`.
    pub fn pool_config<P: Policy + ?Sized>(&self, policy: &P, i: usize) -> PoolConfig {
        PoolConfig {
            capacity: self.replay_pool_size / self.n_envs,
            n_step: policy.n_step(),
            gamma: policy.gamma(),
            obs_history_len: policy.obs_history_len(),
            sampling_method: self.sampling_method,
            save_rollouts: self.save_rollouts,
            save_rollouts_observations: self.save_rollouts_observations,
            save_env_infos: self.save_env_infos,
            seed: self.seed.wrapping_add(i as u64),
        }
    }
}

/// Run configuration and the statistics log sink, built once per run.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RunContext<L> {
    pub config: SamplerConfig,
    pub logger: L,
}

/// Summary of [`Sampler::add_rollouts`].
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct AddRolloutsReport {
    /// Number of files read.
    pub files_succeeded: usize,
    /// Number of files skipped as corrupt.
    pub files_failed: usize,
    /// Number of (possibly truncated) rollouts stored.
    pub rollouts_added: usize,
    /// Number of transitions stored.
    pub steps_added: usize,
}

impl AddRolloutsReport {
    /// Fraction of files that were read; `1` if there were no files.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_ratio(&self) -> f64 {
        let total = self.files_succeeded + self.files_failed;
        if total == 0 {
            1.0
        } else {
            self.files_succeeded as f64 / total as f64
        }
    }
}

/// Steps `k` environments in lockstep, recording each into its own replay pool.
///
/// Environment `i` at global step `t` is recorded with the step index `t + i`.
pub struct Sampler<E, P, L> {
    config: SamplerConfig,
    logger: L,
    policy: P,
    envs: VecEnv<E>,
    pools: Vec<RingStore>,
    /// Observations to act on next; `None` until reset.
    current_observations: Option<Vec<Observation>>,
    rng: Prng,
    next_pool: usize,
}

impl<E, P, L> Sampler<E, P, L>
where
    E: Environment,
    P: Policy,
    L: StatsLogger,
{
    /// Create a sampler with one pool per environment.
    ///
    /// # Errors
    /// [`ReplayError::InvalidConfiguration`] if the configuration is invalid, if the number of
    /// environments is not `n_envs`, or if the resulting pools would be invalid.
    pub fn new(context: RunContext<L>, envs: Vec<E>, policy: P) -> Result<Self, ReplayError> {
        let RunContext { config, logger } = context;
        config.validate()?;
        if envs.len() != config.n_envs {
            return Err(ReplayError::InvalidConfiguration(format!(
                "expected {} environments, got {}",
                config.n_envs,
                envs.len()
            )));
        }
        let envs = VecEnv::new(envs, config.max_path_length)?;
        let layout = Layout::from(&envs.spec());
        let pools = (0..config.n_envs)
            .map(|i| RingStore::new(&config.pool_config(&policy, i), layout.clone()))
            .collect::<Result<_, _>>()?;
        Ok(Self {
            rng: Prng::seed_from_u64(config.seed),
            config,
            logger,
            policy,
            envs,
            pools,
            current_observations: None,
            next_pool: 0,
        })
    }

    #[must_use]
    pub fn n_envs(&self) -> usize {
        self.pools.len()
    }

    /// Number of transitions held over all pools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pools.iter().map(RingStore::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pools.iter().all(RingStore::is_empty)
    }

    #[must_use]
    pub fn pools(&self) -> &[RingStore] {
        &self.pools
    }

    #[must_use]
    pub const fn policy(&self) -> &P {
        &self.policy
    }

    pub fn policy_mut(&mut self) -> &mut P {
        &mut self.policy
    }

    #[must_use]
    pub const fn logger(&self) -> &L {
        &self.logger
    }

    pub fn logger_mut(&mut self) -> &mut L {
        &mut self.logger
    }

    /// Reset every environment and close the open episode of every pool.
    pub fn reset(&mut self) -> Result<(), ReplayError> {
        let observations = self.envs.reset()?;
        for pool in &mut self.pools {
            pool.force_done();
        }
        self.current_observations = Some(observations);
        Ok(())
    }

    /// Take one step in every environment and record the transitions.
    ///
    /// With `take_random_actions` the actions are sampled uniformly from the action space
    /// instead of being chosen by the policy.
    ///
    /// # Errors
    /// If anything fails during the step, every open rollout is trashed and the error is
    /// returned. The sampler must then be [reset](Sampler::reset) before stepping again.
    /// Stepping before the first reset is a [`ReplayError::ProtocolViolation`].
    pub fn step(
        &mut self,
        step: u64,
        take_random_actions: bool,
        explore: bool,
    ) -> Result<(), ReplayError> {
        let observations = self.current_observations.take().ok_or(
            ReplayError::ProtocolViolation("the sampler must be reset before stepping"),
        )?;
        match self.try_step(step, &observations, take_random_actions, explore) {
            Ok(next_observations) => {
                self.current_observations = Some(next_observations);
                Ok(())
            }
            Err(err) => {
                let removed = self.trash_current_rollouts();
                warn!("step {} failed, discarded {} steps: {}", step, removed, err);
                Err(err)
            }
        }
    }

    fn try_step(
        &mut self,
        step: u64,
        observations: &[Observation],
        take_random_actions: bool,
        explore: bool,
    ) -> Result<Vec<Observation>, ReplayError> {
        let n = self.pools.len();
        let mut pending = Vec::with_capacity(n);
        let mut encoded = Vec::with_capacity(n);
        for ((i, pool), observation) in self.pools.iter_mut().enumerate().zip(observations) {
            let (token, encoded_observation) =
                pool.store_observation(step + i as u64, observation)?;
            pending.push(token);
            encoded.push(encoded_observation);
        }

        let output = if take_random_actions {
            let action_space = self.envs.action_space();
            PolicyOutput {
                actions: (0..n).map(|_| action_space.sample(&mut self.rng)).collect(),
                est_values: vec![f64::NAN; n],
                logprobs: vec![action_space.uniform_log_prob(); n],
                action_infos: vec![EnvInfo::new(); n],
            }
        } else {
            let steps: Vec<u64> = (step..).take(n).collect();
            let output = self.policy.get_actions(
                &steps,
                self.envs.current_episode_steps(),
                &encoded,
                explore,
            )?;
            check_policy_output(&output, n)?;
            output
        };

        let VecEnvStep {
            observations: next_observations,
            rewards,
            dones,
            mut infos,
        } = self.envs.step(&output.actions)?;
        for (info, action_info) in infos.iter_mut().zip(output.action_infos) {
            info.extend(action_info);
        }
        if dones.iter().any(|&done| done) {
            self.policy.reset_get_action();
        }

        let effects = output
            .actions
            .into_iter()
            .zip(rewards)
            .zip(dones)
            .zip(infos)
            .zip(output.est_values.into_iter().zip(output.logprobs))
            .map(
                |((((action, reward), done), env_info), (est_value, logprob))| Effect {
                    action,
                    reward,
                    done,
                    env_info,
                    est_value,
                    logprob,
                },
            );
        for ((pool, token), effect) in self.pools.iter_mut().zip(pending).zip(effects) {
            pool.store_effect(token, effect)?;
        }
        Ok(next_observations)
    }

    /// Discard the open episode of every pool.
    ///
    /// Returns the total number of transitions removed.
    pub fn trash_current_rollouts(&mut self) -> usize {
        self.pools
            .iter_mut()
            .map(RingStore::trash_current_rollout)
            .sum()
    }

    /// Load CBOR rollout files into the pools.
    ///
    /// See [`Sampler::add_rollouts_with`].
    pub fn add_rollouts<Q>(
        &mut self,
        paths: &[Q],
        max_to_add: Option<usize>,
    ) -> Result<AddRolloutsReport, ReplayError>
    where
        Q: AsRef<Path> + Sync,
    {
        self.add_rollouts_with(&CborRolloutReader, paths, max_to_add)
    }

    /// Load rollout files into the pools, skipping files that fail to load.
    ///
    /// Files are read in order, in chunks of one file per CPU. Rollouts are assigned to the
    /// pools in turn and their step indices continue from the current total size of the
    /// pools. Once the total size would reach `max_to_add`, the current rollout is truncated
    /// to fit and no further files are read.
    /// The fraction of files read successfully is logged as `load_success_ratio`.
    ///
    /// # Errors
    /// An error from storing a rollout (for example a rollout that does not match the
    /// environment layout) stops loading. Rollouts stored before it are kept.
    pub fn add_rollouts_with<R, Q>(
        &mut self,
        reader: &R,
        paths: &[Q],
        max_to_add: Option<usize>,
    ) -> Result<AddRolloutsReport, ReplayError>
    where
        R: RolloutReader + ?Sized,
        Q: AsRef<Path> + Sync,
    {
        let mut report = AddRolloutsReport::default();
        let mut step = self.len();
        let mut done_adding = max_to_add.map_or(false, |max| step >= max);
        for chunk in paths.chunks(num_cpus::get().max(1)) {
            if done_adding {
                break;
            }
            let loaded = load_rollout_files(reader, chunk);
            report.files_succeeded += loaded.succeeded;
            report.files_failed += loaded.failed;

            for mut rollout in loaded.rollouts {
                if let Some(max) = max_to_add {
                    if step + rollout.len() >= max {
                        rollout.truncate(max - step);
                        done_adding = true;
                    }
                }
                let pool = report.rollouts_added % self.pools.len();
                let added = self.pools[pool].store_rollout(step as u64, &rollout)?;
                step += added;
                report.steps_added += added;
                report.rollouts_added += 1;
                if done_adding {
                    break;
                }
            }
        }

        info!(
            "Files successfully loaded: {:.2}%",
            100.0 * report.success_ratio()
        );
        if let Err(err) = self
            .logger
            .log_scalar(Id::from("load_success_ratio"), report.success_ratio())
        {
            warn!("{}", err);
        }
        info!(
            "added {} steps from {} rollouts",
            report.steps_added, report.rollouts_added
        );
        Ok(report)
    }

    /// Whether any pool can be sampled.
    #[must_use]
    pub fn can_sample(&self) -> bool {
        let only_completed = self.policy.only_completed_episodes();
        self.pools
            .iter()
            .any(|pool| pool.can_sample_filtered(only_completed))
    }

    /// Sample a batch of transitions according to the configured [`PoolSampling`].
    ///
    /// Only completed episodes are sampled if the policy asks for it. Pools without any
    /// index passing that filter are skipped.
    ///
    /// # Errors
    /// [`ReplayError::InsufficientData`] if no pool can be sampled.
    pub fn sample(&mut self, batch_size: usize) -> Result<Batch, ReplayError> {
        let only_completed = self.policy.only_completed_episodes();
        let insufficient = || {
            ReplayError::InsufficientData(format!(
                "no pool can be sampled (only completed episodes: {})",
                only_completed
            ))
        };
        match self.config.pool_sampling {
            PoolSampling::Merge => {
                let ready: Vec<usize> = (0..self.pools.len())
                    .filter(|&i| self.pools[i].can_sample_filtered(only_completed))
                    .collect();
                if ready.is_empty() {
                    return Err(insufficient());
                }
                let (base, extra) = (batch_size / ready.len(), batch_size % ready.len());
                let mut batches = Vec::with_capacity(ready.len());
                for (j, &i) in ready.iter().enumerate() {
                    let size = base + usize::from(j < extra);
                    if size > 0 || batch_size == 0 {
                        batches.push(self.pools[i].sample(size, only_completed)?);
                    }
                }
                Batch::concatenate(&batches)
            }
            PoolSampling::Cycle => {
                for _ in 0..self.pools.len() {
                    let i = self.next_pool;
                    self.next_pool = (i + 1) % self.pools.len();
                    if self.pools[i].can_sample_filtered(only_completed) {
                        return self.pools[i].sample(batch_size, only_completed);
                    }
                }
                Err(insufficient())
            }
        }
    }

    /// Combined statistics of all pools.
    #[must_use]
    pub fn statistics(&self) -> PoolStatistics {
        let layout = self.pools[0].layout();
        self.pools.iter().fold(
            PoolStatistics::new(layout.vec_dim, layout.action_dim),
            |stats, pool| stats.merge(pool.statistics()),
        )
    }

    /// Log the statistics of each pool under `prefix/pool{i}`.
    pub fn log(&mut self, prefix: &str) {
        for (i, pool) in self.pools.iter_mut().enumerate() {
            let scope = Id::scoped(prefix, format!("pool{}", i));
            if let Err(err) = pool.log(&mut self.logger, scope.as_str()) {
                warn!("{}", err);
            }
        }
    }

    /// Take the finished live episodes saved by every pool since the previous call.
    pub fn get_recent_paths(&mut self) -> Vec<Rollout> {
        self.pools
            .iter_mut()
            .flat_map(RingStore::get_recent_paths)
            .collect()
    }
}

fn check_policy_output(output: &PolicyOutput, n: usize) -> Result<(), ReplayError> {
    let lengths = [
        ("policy actions", output.actions.len()),
        ("policy value estimates", output.est_values.len()),
        ("policy log probabilities", output.logprobs.len()),
        ("policy action infos", output.action_infos.len()),
    ];
    for (field, len) in lengths {
        if len != n {
            return Err(ReplayError::ShapeMismatch {
                field,
                expected: vec![n],
                actual: vec![len],
            });
        }
    }
    Ok(())
}

use super::sample::SampleWeighting;
use super::stats::{EpisodeLog, PoolStatistics};
use super::{Effect, EncodedObservation, EnvInfo, Layout, Observation, PoolConfig, SamplingMethod};
use crate::error::ReplayError;
use crate::Prng;
use ndarray::{Array2, ArrayD, Axis, IxDyn};
use rand::SeedableRng;
use std::iter;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(0);

/// Write protocol state of a [`RingStore`].
///
/// ```text
/// AwaitingObservation -> AwaitingEffect -> AwaitingObservation
///                                       -> EpisodeClosed -> AwaitingObservation
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum WriteState {
    /// Inside an episode, waiting for the next observation.
    AwaitingObservation,
    /// An observation has been stored; its effect has not.
    AwaitingEffect { index: u64 },
    /// No episode is open. The next observation starts a new episode.
    EpisodeClosed,
}

/// Token for a transition whose observation has been stored but whose effect has not.
///
/// Must be passed to [`RingStore::store_effect`] of the same pool before the next observation
/// can be stored there.
#[must_use = "a pending step must be completed with `store_effect`"]
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct PendingStep {
    pool_id: u64,
    generation: u64,
    index: u64,
}

impl PendingStep {
    /// Logical buffer index of the pending transition.
    #[must_use]
    pub const fn index(&self) -> u64 {
        self.index
    }
}

/// Fixed-capacity circular transition store for a single environment.
///
/// # Indices
/// Transitions are addressed by their logical index: the number of transitions written
/// before them (rewound by [`RingStore::trash_current_rollout`]). The logical index `i` lives
/// in ring slot `i mod capacity`. The held transitions are the logical range `begin .. end`;
/// writing past `begin + capacity` reclaims the oldest slot.
///
/// # Episodes
/// Each slot carries an episode-start marker. Observation histories never reach past a
/// start marker or past the oldest held transition, and return windows never cross a
/// start marker.
#[derive(Debug)]
pub struct RingStore {
    pub(super) id: u64,
    pub(super) capacity: usize,
    pub(super) n_step: usize,
    pub(super) gamma: f64,
    pub(super) history_len: usize,
    pub(super) sampling_method: SamplingMethod,
    pub(super) layout: Layout,
    pub(super) save_env_infos: bool,

    pub(super) steps: Vec<u64>,
    pub(super) obs_im: ArrayD<u8>,
    pub(super) obs_vec: Array2<f32>,
    pub(super) actions: Array2<f32>,
    pub(super) rewards: Vec<f64>,
    pub(super) dones: Vec<bool>,
    pub(super) episode_starts: Vec<bool>,
    pub(super) est_values: Vec<f64>,
    pub(super) logprobs: Vec<f64>,
    pub(super) env_infos: Vec<EnvInfo>,

    /// Logical index of the oldest held transition.
    pub(super) begin: u64,
    /// One past the logical index of the newest committed transition.
    pub(super) end: u64,
    /// Logical index of the first step of the open episode (`end` if none is open).
    pub(super) episode_begin: u64,
    /// Logical index of the most recent step with `done = true`.
    pub(super) last_done: Option<u64>,
    /// Newest logical index ending a single-episode run of `history_len + n_step` steps.
    pub(super) full_run_end: Option<u64>,
    pub(super) state: WriteState,
    /// Number of observations opened over the lifetime of the store.
    generation: u64,

    pub(super) statistics: PoolStatistics,
    pub(super) episodes: EpisodeLog,
    pub(super) weighting: Option<Box<dyn SampleWeighting>>,
    pub(super) rng: Prng,
}

impl RingStore {
    /// Create an empty store.
    ///
    /// # Errors
    /// [`ReplayError::InvalidConfiguration`] if `config` fails validation.
    pub fn new(config: &PoolConfig, layout: Layout) -> Result<Self, ReplayError> {
        config.validate()?;
        let capacity = config.capacity;
        let im_dim: Vec<usize> = iter::once(capacity)
            .chain(layout.im_shape.iter().copied())
            .collect();
        Ok(Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            capacity,
            n_step: config.n_step,
            gamma: config.gamma,
            history_len: config.obs_history_len,
            sampling_method: config.sampling_method,
            save_env_infos: config.save_env_infos,
            steps: vec![0; capacity],
            obs_im: ArrayD::zeros(IxDyn(&im_dim)),
            obs_vec: Array2::zeros((capacity, layout.vec_dim)),
            actions: Array2::zeros((capacity, layout.action_dim)),
            rewards: vec![0.0; capacity],
            dones: vec![false; capacity],
            episode_starts: vec![false; capacity],
            est_values: vec![f64::NAN; capacity],
            logprobs: vec![0.0; capacity],
            env_infos: vec![EnvInfo::new(); capacity],
            begin: 0,
            end: 0,
            episode_begin: 0,
            last_done: None,
            full_run_end: None,
            state: WriteState::EpisodeClosed,
            generation: 0,
            statistics: PoolStatistics::new(layout.vec_dim, layout.action_dim),
            episodes: EpisodeLog::new(config.save_rollouts, config.save_rollouts_observations),
            weighting: None,
            rng: Prng::seed_from_u64(config.seed),
            layout,
        })
    }

    /// Maximum number of transitions held.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of committed transitions currently held.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn len(&self) -> usize {
        // at most capacity
        (self.end - self.begin) as usize
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.end == self.begin
    }

    /// Ring slot of the next committed transition.
    #[must_use]
    pub fn head(&self) -> usize {
        self.slot(self.end)
    }

    /// Logical index range of the held committed transitions.
    #[must_use]
    pub const fn index_range(&self) -> std::ops::Range<u64> {
        self.begin..self.end
    }

    #[must_use]
    pub const fn write_state(&self) -> WriteState {
        self.state
    }

    #[must_use]
    pub const fn n_step(&self) -> usize {
        self.n_step
    }

    #[must_use]
    pub const fn gamma(&self) -> f64 {
        self.gamma
    }

    #[must_use]
    pub const fn obs_history_len(&self) -> usize {
        self.history_len
    }

    #[must_use]
    pub const fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Caller-supplied step index of a held transition.
    #[must_use]
    pub fn step_index(&self, index: u64) -> Option<u64> {
        self.contains(index).then(|| self.steps[self.slot(index)])
    }

    /// Running statistics over every committed transition.
    #[must_use]
    pub const fn statistics(&self) -> &PoolStatistics {
        &self.statistics
    }

    /// Install a sampling weight hook, replacing uniform index selection.
    pub fn set_sample_weighting(&mut self, weighting: Option<Box<dyn SampleWeighting>>) {
        self.weighting = weighting;
    }

    /// Store the observation half of a new transition.
    ///
    /// Returns the token to complete the transition with and the observation history ending
    /// at the new step.
    ///
    /// # Errors
    /// * [`ReplayError::ProtocolViolation`] if a previous observation still awaits its effect.
    /// * [`ReplayError::ShapeMismatch`] if the observation does not match the pool layout.
    pub fn store_observation(
        &mut self,
        step_index: u64,
        observation: &Observation,
    ) -> Result<(PendingStep, EncodedObservation), ReplayError> {
        if let WriteState::AwaitingEffect { .. } = self.state {
            return Err(ReplayError::ProtocolViolation(
                "an observation is already awaiting its effect",
            ));
        }
        self.check_observation(observation)?;
        let index = self.open_slot(step_index, observation);
        self.state = WriteState::AwaitingEffect { index };
        self.generation += 1;
        let pending = PendingStep {
            pool_id: self.id,
            generation: self.generation,
            index,
        };
        Ok((pending, self.encode_observation(index)))
    }

    /// Complete the pending transition.
    ///
    /// If `effect.done` the episode is closed and the next observation starts a new episode.
    ///
    /// # Errors
    /// * [`ReplayError::ProtocolViolation`] if `pending` does not belong to the transition
    ///   awaiting an effect in this pool.
    /// * [`ReplayError::ShapeMismatch`] if the action does not match the pool layout.
    ///   The observation stays pending; discard it with [`RingStore::force_done`] or
    ///   [`RingStore::trash_current_rollout`].
    pub fn store_effect(&mut self, pending: PendingStep, effect: Effect) -> Result<(), ReplayError> {
        match self.state {
            WriteState::AwaitingEffect { index }
                if pending.pool_id == self.id
                    && pending.generation == self.generation
                    && pending.index == index => {}
            _ => {
                return Err(ReplayError::ProtocolViolation(
                    "step token does not match the pending observation",
                ))
            }
        }
        self.check_action(&effect.action)?;
        self.commit(pending.index, effect, true);
        Ok(())
    }

    /// Discard the open, unterminated episode and any pending observation.
    ///
    /// Returns the number of committed transitions removed.
    /// Transitions overwritten by the discarded episode are not restored.
    #[allow(clippy::cast_possible_truncation)]
    pub fn trash_current_rollout(&mut self) -> usize {
        let removed = self.end - self.episode_begin;
        self.end = self.episode_begin;
        self.state = WriteState::EpisodeClosed;
        self.episodes.discard_current();
        if removed > 0 {
            self.rescan_full_run();
        }
        // at most capacity
        removed as usize
    }

    /// Mark the open episode as terminated at its last committed step.
    ///
    /// A pending observation is discarded. Does nothing if no episode is open.
    pub fn force_done(&mut self) {
        if self.end > self.episode_begin {
            let last = self.end - 1;
            let slot = self.slot(last);
            self.dones[slot] = true;
            self.last_done = Some(last);
            self.close_episode();
        } else {
            self.state = WriteState::EpisodeClosed;
        }
    }

    /// Ring slot of a logical index.
    #[allow(clippy::cast_possible_truncation)]
    pub(super) fn slot(&self, index: u64) -> usize {
        // Less than capacity, which is a usize
        (index % self.capacity as u64) as usize
    }

    /// Whether a logical index refers to a held committed transition.
    pub(super) const fn contains(&self, index: u64) -> bool {
        self.begin <= index && index < self.end
    }

    /// Whether the observation at a logical index is held (committed or pending).
    pub(super) fn is_readable(&self, index: u64) -> bool {
        self.contains(index) || self.state == WriteState::AwaitingEffect { index }
    }

    pub(super) fn check_observation(&self, observation: &Observation) -> Result<(), ReplayError> {
        if observation.im.shape() != self.layout.im_shape.as_slice() {
            return Err(ReplayError::ShapeMismatch {
                field: "observation image",
                expected: self.layout.im_shape.clone(),
                actual: observation.im.shape().to_vec(),
            });
        }
        if observation.vec.len() != self.layout.vec_dim {
            return Err(ReplayError::ShapeMismatch {
                field: "observation vector",
                expected: vec![self.layout.vec_dim],
                actual: vec![observation.vec.len()],
            });
        }
        Ok(())
    }

    pub(super) fn check_action(&self, action: &ndarray::Array1<f32>) -> Result<(), ReplayError> {
        if action.len() == self.layout.action_dim {
            Ok(())
        } else {
            Err(ReplayError::ShapeMismatch {
                field: "action",
                expected: vec![self.layout.action_dim],
                actual: vec![action.len()],
            })
        }
    }

    /// Write an observation into the next slot, reclaiming the oldest if full.
    ///
    /// Returns the logical index of the opened slot.
    pub(super) fn open_slot(&mut self, step_index: u64, observation: &Observation) -> u64 {
        let index = self.end;
        if index - self.begin == self.capacity as u64 {
            self.begin += 1;
            self.episode_begin = self.episode_begin.max(self.begin);
        }
        let new_episode = self.state == WriteState::EpisodeClosed;
        if new_episode {
            self.episode_begin = index;
        }

        let slot = self.slot(index);
        self.steps[slot] = step_index;
        self.obs_im
            .index_axis_mut(Axis(0), slot)
            .assign(&observation.im);
        self.obs_vec.row_mut(slot).assign(&observation.vec);
        self.dones[slot] = false;
        self.episode_starts[slot] = new_episode;
        index
    }

    /// Write the effect of the opened slot `index` and advance `end` past it.
    pub(super) fn commit(&mut self, index: u64, effect: Effect, live: bool) {
        let slot = self.slot(index);
        self.actions.row_mut(slot).assign(&effect.action);
        self.rewards[slot] = effect.reward;
        self.dones[slot] = effect.done;
        self.est_values[slot] = effect.est_value;
        self.logprobs[slot] = effect.logprob;
        self.env_infos[slot] = if self.save_env_infos {
            effect.env_info
        } else {
            EnvInfo::new()
        };
        self.end = index + 1;

        self.statistics
            .push(self.obs_vec.row(slot), self.actions.row(slot), effect.reward);
        if live {
            self.episodes.push_step(effect.reward);
        }

        let run_start = self.episode_begin.max(self.begin);
        if self.end - run_start >= self.span() {
            self.full_run_end = Some(index);
        }

        if effect.done {
            self.last_done = Some(index);
            self.close_episode();
        } else {
            self.state = WriteState::AwaitingObservation;
        }
    }

    /// Number of contiguous single-episode steps needed for a full sample window.
    pub(super) const fn span(&self) -> u64 {
        (self.history_len + self.n_step) as u64
    }

    pub(super) fn close_episode(&mut self) {
        if self.episodes.finish_current().is_some() && self.episodes.saves_rollouts() {
            let rollout = self.extract_rollout(self.episode_begin.max(self.begin), self.end);
            self.episodes.push_rollout(rollout);
        }
        self.episode_begin = self.end;
        self.state = WriteState::EpisodeClosed;
    }

    /// Recompute `full_run_end` from the held data.
    fn rescan_full_run(&mut self) {
        let span = self.span();
        let mut run_start = self.begin;
        self.full_run_end = None;
        for index in self.begin..self.end {
            if self.episode_starts[self.slot(index)] {
                run_start = index;
            }
            if index + 1 - run_start >= span {
                self.full_run_end = Some(index);
            }
        }
    }
}

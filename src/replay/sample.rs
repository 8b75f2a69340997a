//! Sample index selection and batch assembly
use super::{RingStore, SamplingMethod};
use crate::error::ReplayError;
use ndarray::{
    s, Array, Array1, Array2, Array3, ArrayD, ArrayView, Axis, IxDyn, RemoveAxis, Slice,
};
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use std::fmt;
use std::iter;

/// Relative sampling weight of held transitions.
///
/// When installed with [`RingStore::set_sample_weighting`], sample indices are drawn from the
/// valid indices with probability proportional to their weight.
pub trait SampleWeighting: fmt::Debug + Send {
    /// Non-negative weight of the valid index `index` of `pool`.
    fn weight(&self, pool: &RingStore, index: u64) -> f64;
}

/// A columnar batch of N-step transitions.
///
/// `B` is the batch size, `H` the observation history length and `N` the return horizon.
/// Window slots past the end of an episode are zero (`NaN` for value estimates).
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Caller step index of each transition. `[B]`
    pub step_indices: Array1<u64>,
    /// `H` history frames ending at the transition, then the next `N` frames. `[B, H+N, ..]`
    pub observations_im: ArrayD<u8>,
    /// Vector part of the frames of `observations_im`. `[B, H+N, D]`
    pub observations_vec: Array3<f32>,
    /// `[B, N, A]`
    pub actions: Array3<f32>,
    /// Undiscounted rewards of the window. `[B, N]`
    pub rewards: Array2<f64>,
    /// Discounted N-step return. `[B]`
    pub returns: Array1<f64>,
    /// Whether the episode has terminated at or before each window slot. `[B, N]`
    pub dones: Array2<bool>,
    /// Whether each window slot is a real step. `[B, N]`
    pub valid: Array2<bool>,
    /// Whether the window reaches the end of its episode. `[B]`
    pub terminal: Array1<bool>,
    /// `[B, N]`
    pub est_values: Array2<f64>,
    /// `[B, N]`
    pub logprobs: Array2<f64>,
}

impl Batch {
    /// Number of transitions in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.step_indices.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.step_indices.is_empty()
    }

    /// Stack batches along the batch dimension.
    ///
    /// # Errors
    /// * [`ReplayError::InsufficientData`] if `batches` is empty.
    /// * [`ReplayError::InvalidConfiguration`] if the batches differ in shape.
    pub fn concatenate(batches: &[Self]) -> Result<Self, ReplayError> {
        if batches.is_empty() {
            return Err(ReplayError::InsufficientData(
                "no batches to concatenate".into(),
            ));
        }
        Ok(Self {
            step_indices: stack(batches, |b| b.step_indices.view())?,
            observations_im: stack(batches, |b| b.observations_im.view())?,
            observations_vec: stack(batches, |b| b.observations_vec.view())?,
            actions: stack(batches, |b| b.actions.view())?,
            rewards: stack(batches, |b| b.rewards.view())?,
            returns: stack(batches, |b| b.returns.view())?,
            dones: stack(batches, |b| b.dones.view())?,
            valid: stack(batches, |b| b.valid.view())?,
            terminal: stack(batches, |b| b.terminal.view())?,
            est_values: stack(batches, |b| b.est_values.view())?,
            logprobs: stack(batches, |b| b.logprobs.view())?,
        })
    }
}

fn stack<'a, A, D, F>(batches: &'a [Batch], field: F) -> Result<Array<A, D>, ReplayError>
where
    A: Clone + 'a,
    D: RemoveAxis,
    F: Fn(&'a Batch) -> ArrayView<'a, A, D>,
{
    let views: Vec<_> = batches.iter().map(field).collect();
    ndarray::concatenate(Axis(0), &views).map_err(|err| {
        ReplayError::InvalidConfiguration(format!("cannot concatenate batches: {}", err))
    })
}

impl RingStore {
    /// Whether the pool holds a run of `H + N` contiguous steps within one episode.
    #[must_use]
    pub fn can_sample(&self) -> bool {
        self.full_run_end
            .map_or(false, |last| last + 1 >= self.begin + self.span())
    }

    /// Whether [`RingStore::sample`] can draw a batch.
    ///
    /// Like [`RingStore::can_sample`], but with completed episodes only (as requested, or as
    /// configured) at least one held index must also belong to a completed episode.
    #[must_use]
    pub fn can_sample_filtered(&self, only_completed_episodes: bool) -> bool {
        if !self.can_sample() {
            return false;
        }
        !self.completed_only(only_completed_episodes)
            || (self.begin..self.end).any(|i| self.is_valid_index(i, true))
    }

    fn completed_only(&self, only_completed_episodes: bool) -> bool {
        only_completed_episodes || self.sampling_method == SamplingMethod::OnlyCompletedEpisodes
    }

    /// Whether a logical index can be sampled.
    ///
    /// The index must be held; its history must either start an episode within the held
    /// range or have all `H` frames held; and its return window must either reach a `done`
    /// or be followed by a held bootstrap step of the same episode. With `only_completed`,
    /// the last step of the window must not come after the most recent `done`.
    #[must_use]
    pub fn is_valid_index(&self, index: u64, only_completed: bool) -> bool {
        if !self.contains(index) {
            return false;
        }
        let frames = self.history_frames(index);
        let oldest_frame = index + 1 - frames as u64;
        if frames < self.history_len && !self.episode_starts[self.slot(oldest_frame)] {
            return false;
        }

        let mut len = 0;
        let mut terminal = false;
        for (_, done) in self.window(index) {
            len += 1;
            if done {
                terminal = true;
                break;
            }
        }
        if !terminal {
            let bootstrap = index + self.n_step as u64;
            if len < self.n_step
                || !self.contains(bootstrap)
                || self.episode_starts[self.slot(bootstrap)]
            {
                return false;
            }
        }
        if only_completed {
            let last = index + len as u64 - 1;
            return self.last_done.map_or(false, |done| last <= done);
        }
        true
    }

    /// All valid logical indices, in increasing order.
    #[must_use]
    pub fn valid_indices(&self, only_completed: bool) -> Vec<u64> {
        (self.begin..self.end)
            .filter(|&i| self.is_valid_index(i, only_completed))
            .collect()
    }

    /// Draw `batch_size` valid logical indices with replacement.
    ///
    /// Uniform unless a [`SampleWeighting`] is installed.
    ///
    /// # Errors
    /// [`ReplayError::InsufficientData`] if [`RingStore::can_sample`] is false or no index
    /// passes the filter.
    pub fn sample_indices(
        &mut self,
        batch_size: usize,
        only_completed: bool,
    ) -> Result<Vec<u64>, ReplayError> {
        if !self.can_sample() {
            return Err(ReplayError::InsufficientData(format!(
                "pool holds {} steps but no {}-step run within one episode",
                self.len(),
                self.span()
            )));
        }
        let no_candidates = || {
            ReplayError::InsufficientData(format!(
                "no valid sample index (only completed episodes: {})",
                only_completed
            ))
        };

        if let Some(weighting) = &self.weighting {
            let candidates = self.valid_indices(only_completed);
            if candidates.is_empty() {
                return Err(no_candidates());
            }
            let weights: Vec<f64> = candidates
                .iter()
                .map(|&i| weighting.weight(self, i))
                .collect();
            let distribution = WeightedIndex::new(&weights).map_err(|err| {
                ReplayError::InsufficientData(format!("unusable sample weights: {}", err))
            })?;
            return Ok((0..batch_size)
                .map(|_| candidates[distribution.sample(&mut self.rng)])
                .collect());
        }

        let mut indices = Vec::with_capacity(batch_size);
        for _ in 0..batch_size * 8 + 64 {
            if indices.len() == batch_size {
                return Ok(indices);
            }
            let index = self.rng.gen_range(self.begin..self.end);
            if self.is_valid_index(index, only_completed) {
                indices.push(index);
            }
        }

        // Valid indices are sparse; pick from the full candidate list
        let candidates = self.valid_indices(only_completed);
        if candidates.is_empty() {
            return Err(no_candidates());
        }
        while indices.len() < batch_size {
            indices.push(candidates[self.rng.gen_range(0..candidates.len())]);
        }
        Ok(indices)
    }

    /// Sample a batch of transitions.
    ///
    /// Only completed episodes are sampled if either `only_completed_episodes` is set or the
    /// pool is configured with [`SamplingMethod::OnlyCompletedEpisodes`].
    ///
    /// # Errors
    /// See [`RingStore::sample_indices`].
    ///
    pub fn sample(
        &mut self,
        batch_size: usize,
        only_completed_episodes: bool,
    ) -> Result<Batch, ReplayError> {
        let indices =
            self.sample_indices(batch_size, self.completed_only(only_completed_episodes))?;
        self.gather(&indices)
    }

    /// Assemble the batch of the given logical indices.
    ///
    /// # Errors
    /// [`ReplayError::InsufficientData`] if any index is not valid.
    pub fn gather(&self, indices: &[u64]) -> Result<Batch, ReplayError> {
        if let Some(index) = indices.iter().find(|&&i| !self.is_valid_index(i, false)) {
            return Err(ReplayError::InsufficientData(format!(
                "index {} cannot be sampled",
                index
            )));
        }
        let (b, h, n) = (indices.len(), self.history_len, self.n_step);
        let frames = h + n;
        let im_dim: Vec<usize> = [b, frames]
            .into_iter()
            .chain(self.layout.im_shape.iter().copied())
            .collect();
        let mut batch = Batch {
            step_indices: Array1::zeros(b),
            observations_im: ArrayD::zeros(IxDyn(&im_dim)),
            observations_vec: Array3::zeros((b, frames, self.layout.vec_dim)),
            actions: Array3::zeros((b, n, self.layout.action_dim)),
            rewards: Array2::zeros((b, n)),
            returns: Array1::zeros(b),
            dones: Array2::from_elem((b, n), false),
            valid: Array2::from_elem((b, n), false),
            terminal: Array1::from_elem(b, false),
            est_values: Array2::from_elem((b, n), f64::NAN),
            logprobs: Array2::zeros((b, n)),
        };

        for (row, &index) in indices.iter().enumerate() {
            batch.step_indices[row] = self.steps[self.slot(index)];

            let mut im = batch.observations_im.index_axis_mut(Axis(0), row);
            let mut vec = batch.observations_vec.index_axis_mut(Axis(0), row);
            self.write_history(
                index,
                im.slice_axis_mut(Axis(0), Slice::from(0..h)),
                vec.slice_mut(s![0..h, ..]),
            );

            let ret = self.n_step_return(index);
            // Frames following the window steps; none after a terminal step
            let future = if ret.terminal { ret.len - 1 } else { ret.len };
            for (k, j) in (1..=future).zip(index + 1..) {
                let slot = self.slot(j);
                im.index_axis_mut(Axis(0), h - 1 + k)
                    .assign(&self.obs_im.index_axis(Axis(0), slot));
                vec.row_mut(h - 1 + k).assign(&self.obs_vec.row(slot));
            }

            for (k, j) in (0..ret.len).zip(index..) {
                let slot = self.slot(j);
                batch
                    .actions
                    .slice_mut(s![row, k, ..])
                    .assign(&self.actions.row(slot));
                batch.rewards[[row, k]] = self.rewards[slot];
                batch.est_values[[row, k]] = self.est_values[slot];
                batch.logprobs[[row, k]] = self.logprobs[slot];
            }
            batch.returns[row] = ret.value;
            batch.terminal[row] = ret.terminal;
            for (k, (&done, &valid)) in iter::zip(&ret.dones, &ret.valid).enumerate() {
                batch.dones[[row, k]] = done;
                batch.valid[[row, k]] = valid;
            }
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{make_pool, rollout, store_steps};
    use super::super::{PoolConfig, SamplingMethod};
    use super::*;
    use ndarray::array;
    use rstest::rstest;

    #[rstest]
    #[case::single_frame(1, 1)]
    #[case::history(4, 1)]
    #[case::n_step(1, 3)]
    #[case::both(2, 3)]
    fn can_sample_at_history_plus_n(#[case] history_len: usize, #[case] n_step: usize) {
        let mut pool = make_pool(50, history_len, n_step);
        let span = (history_len + n_step) as u64;
        for t in 0..span {
            assert!(!pool.can_sample());
            assert!(matches!(
                pool.sample(4, false),
                Err(ReplayError::InsufficientData(_))
            ));
            store_steps(&mut pool, t, &[(1.0, false)]);
        }
        assert!(pool.can_sample());
        assert_eq!(pool.sample(4, false).unwrap().len(), 4);
    }

    #[test]
    fn short_episodes_do_not_allow_sampling() {
        let mut pool = make_pool(50, 2, 2);
        for t in 0..6 {
            store_steps(&mut pool, t, &[(1.0, t % 3 == 2)]);
        }
        assert_eq!(pool.len(), 6);
        assert!(!pool.can_sample());
        store_steps(&mut pool, 6, &[(1.0, false); 4]);
        assert!(pool.can_sample());
    }

    #[test]
    fn can_sample_rescanned_after_trash() {
        let mut pool = make_pool(50, 2, 1);
        store_steps(&mut pool, 0, &[(1.0, false); 4]);
        assert!(pool.can_sample());
        pool.trash_current_rollout();
        assert!(!pool.can_sample());
    }

    #[test]
    fn empty_pool_is_insufficient() {
        let mut pool = make_pool(10, 1, 1);
        assert!(matches!(
            pool.sample(1, false),
            Err(ReplayError::InsufficientData(_))
        ));
    }

    /// capacity 100, H = 4, N = 3, one 10 step rollout with reward 1
    fn scenario_pool() -> RingStore {
        let mut pool = make_pool(100, 4, 3);
        let mut dones = [false; 10];
        dones[9] = true;
        pool.store_rollout(0, &rollout(0, &[1.0; 10], &dones))
            .unwrap();
        pool
    }

    #[test]
    fn scenario_mid_episode() {
        let pool = scenario_pool();
        let batch = pool.gather(&[5]).unwrap();
        assert_eq!(batch.step_indices, array![5_u64]);
        assert_eq!(batch.returns[0], 1.0 + 0.99 + 0.99 * 0.99);
        assert!((batch.returns[0] - 2.9701).abs() < 1e-12);
        assert!(!batch.terminal[0]);
        assert_eq!(batch.rewards, array![[1.0, 1.0, 1.0]]);
        assert_eq!(batch.dones, array![[false, false, false]]);
        assert_eq!(batch.valid, array![[true, true, true]]);
        // History frames 2, 3, 4, 5 then future frames 6, 7, 8
        let frames: Vec<f32> = batch.observations_vec.iter().copied().collect();
        assert_eq!(frames, vec![2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
        assert!(batch
            .observations_im
            .index_axis(Axis(1), 0)
            .iter()
            .all(|&x| x == 2));
        assert_eq!(batch.actions.slice(s![0, .., 0]), array![5.0_f32, 6.0, 7.0]);
        assert_eq!(batch.logprobs, array![[-0.5, -0.5, -0.5]]);
    }

    #[test]
    fn scenario_episode_end() {
        let pool = scenario_pool();
        let batch = pool.gather(&[8]).unwrap();
        assert_eq!(batch.returns[0], 1.0 + 0.99);
        assert!(batch.terminal[0]);
        assert_eq!(batch.rewards, array![[1.0, 1.0, 0.0]]);
        assert_eq!(batch.dones, array![[false, true, true]]);
        assert_eq!(batch.valid, array![[true, true, false]]);
        let frames: Vec<f32> = batch.observations_vec.iter().copied().collect();
        assert_eq!(frames, vec![5.0, 6.0, 7.0, 8.0, 9.0, 0.0, 0.0]);
        assert!(batch.est_values[[0, 2]].is_nan());
        assert_eq!(batch.logprobs[[0, 2]], 0.0);
    }

    #[test]
    fn episode_start_is_zero_padded() {
        let mut pool = make_pool(100, 4, 3);
        pool.store_rollout(0, &rollout(10, &[1.0; 10], &[false; 10]))
            .unwrap();
        let batch = pool.gather(&[1]).unwrap();
        let frames: Vec<f32> = batch.observations_vec.iter().copied().collect();
        assert_eq!(frames, vec![0.0, 0.0, 10.0, 11.0, 12.0, 13.0, 14.0]);
    }

    #[test]
    fn scenario_valid_indices() {
        let pool = scenario_pool();
        // Every step either bootstraps within the episode or reaches the final done
        assert_eq!(pool.valid_indices(false), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn unterminated_episode_end_is_not_valid() {
        let mut pool = make_pool(100, 1, 3);
        store_steps(&mut pool, 0, &[(1.0, false); 6]);
        // Indices 3.. lack a held bootstrap step
        assert_eq!(pool.valid_indices(false), vec![0, 1, 2]);
        assert!(pool.gather(&[3]).is_err());
    }

    #[test]
    fn history_never_crosses_episode_boundary() {
        let mut pool = make_pool(100, 4, 2);
        // Observations start at 1 so that 0 means padding
        let mut steps = vec![(1.0, false); 5];
        steps[4].1 = true;
        steps.extend(vec![(1.0, false); 10]);
        store_steps(&mut pool, 1, &steps);
        let batch = pool.sample(200, false).unwrap();
        for (row, &step) in batch.step_indices.iter().enumerate() {
            let history = batch.observations_vec.slice(s![row, 0..4, 0]);
            let episode_start = if step <= 5 { 1 } else { 6 };
            let expected_frames = (step - episode_start + 1).min(4);
            for (pos, &frame) in history.iter().enumerate() {
                if (pos as u64) < 4 - expected_frames {
                    assert_eq!(frame, 0.0);
                } else {
                    assert!(frame as u64 >= episode_start);
                    assert!(frame as u64 <= step);
                }
            }
        }
    }

    #[test]
    fn overwritten_indices_never_sampled() {
        let mut pool = make_pool(10, 2, 2);
        store_steps(&mut pool, 0, &[(1.0, false); 35]);
        assert_eq!(pool.len(), 10);
        let batch = pool.sample(500, false).unwrap();
        // Oldest held step index is 25; the first held index lacks its full history
        assert!(batch.step_indices.iter().all(|&s| (26..33).contains(&s)));
    }

    #[test]
    fn only_completed_episodes() {
        let mut pool = make_pool(100, 1, 2);
        let mut steps = vec![(1.0, false); 4];
        steps[3].1 = true;
        steps.extend(vec![(1.0, false); 6]);
        store_steps(&mut pool, 0, &steps);
        assert_eq!(pool.valid_indices(true), vec![0, 1, 2, 3]);
        assert!(pool.can_sample_filtered(true));
        let batch = pool.sample(100, true).unwrap();
        assert!(batch.step_indices.iter().all(|&s| s < 4));
    }

    #[test]
    fn only_completed_without_done_is_insufficient() {
        let mut pool = make_pool(100, 1, 1);
        store_steps(&mut pool, 0, &[(1.0, false); 10]);
        assert!(pool.can_sample());
        assert!(pool.can_sample_filtered(false));
        assert!(!pool.can_sample_filtered(true));
        assert!(matches!(
            pool.sample(4, true),
            Err(ReplayError::InsufficientData(_))
        ));
    }

    #[test]
    fn configured_sampling_method_applies() {
        let config = PoolConfig {
            sampling_method: SamplingMethod::OnlyCompletedEpisodes,
            ..super::super::testing::config(100, 1, 1)
        };
        let mut pool = RingStore::new(&config, super::super::testing::layout()).unwrap();
        store_steps(&mut pool, 0, &[(1.0, false); 10]);
        assert!(!pool.can_sample_filtered(false));
        assert!(pool.sample(4, false).is_err());
    }

    #[test]
    fn rollout_round_trip_through_batches() {
        let mut pool = make_pool(100, 1, 1);
        let rewards = [0.5, -1.0, 2.0, 3.5, 0.0];
        let r = rollout(20, &rewards, &[false, false, false, false, true]);
        pool.store_rollout(0, &r).unwrap();
        let indices = pool.valid_indices(false);
        assert_eq!(indices.len(), r.len());
        let batch = pool.gather(&indices).unwrap();
        for (row, k) in indices.iter().enumerate() {
            let k = *k as usize;
            assert_eq!(
                batch.observations_vec.slice(s![row, 0, ..]),
                r.observations[k].vec
            );
            assert_eq!(
                batch.observations_im.index_axis(Axis(0), row).index_axis(Axis(0), 0),
                r.observations[k].im
            );
            assert_eq!(batch.actions.slice(s![row, 0, ..]), r.actions[k]);
            assert_eq!(batch.rewards[[row, 0]], r.rewards[k]);
            assert_eq!(batch.logprobs[[row, 0]], r.logprobs[k]);
        }
    }

    #[derive(Debug)]
    struct OnlyIndex(u64);

    impl SampleWeighting for OnlyIndex {
        fn weight(&self, _: &RingStore, index: u64) -> f64 {
            if index == self.0 {
                1.0
            } else {
                0.0
            }
        }
    }

    #[test]
    fn sample_weighting_hook() {
        let mut pool = make_pool(100, 1, 1);
        store_steps(&mut pool, 0, &[(1.0, false); 10]);
        pool.set_sample_weighting(Some(Box::new(OnlyIndex(3))));
        let batch = pool.sample(20, false).unwrap();
        assert!(batch.step_indices.iter().all(|&s| s == 3));
        // An index outside the candidates gets no weight at all
        pool.set_sample_weighting(Some(Box::new(OnlyIndex(50))));
        assert!(matches!(
            pool.sample(1, false),
            Err(ReplayError::InsufficientData(_))
        ));
    }

    #[test]
    fn concatenate_batches() {
        let pool = scenario_pool();
        let a = pool.gather(&[1, 2]).unwrap();
        let b = pool.gather(&[8]).unwrap();
        let both = Batch::concatenate(&[a, b]).unwrap();
        let expected = pool.gather(&[1, 2, 8]).unwrap();
        assert_eq!(both.len(), 3);
        assert_eq!(both.step_indices, expected.step_indices);
        assert_eq!(both.observations_im, expected.observations_im);
        assert_eq!(both.observations_vec, expected.observations_vec);
        assert_eq!(both.returns, expected.returns);
        assert_eq!(both.dones, expected.dones);
        assert_eq!(both.valid, expected.valid);
    }

    #[test]
    fn concatenate_nothing() {
        assert!(matches!(
            Batch::concatenate(&[]),
            Err(ReplayError::InsufficientData(_))
        ));
    }
}

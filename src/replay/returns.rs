//! N-step discounted returns
use super::RingStore;

/// Discounted return over a window of up to `n` steps.
#[derive(Debug, Clone, PartialEq)]
pub struct NStepReturn {
    /// Sum of `gamma^k * reward_k`, accumulated earliest to latest.
    pub value: f64,
    /// Whether the episode has terminated at or before each slot of the window.
    pub dones: Vec<bool>,
    /// Whether each slot of the window holds a real step of the episode.
    pub valid: Vec<bool>,
    /// Whether the window reaches a `done` step.
    pub terminal: bool,
    /// Number of real steps in the window.
    pub len: usize,
}

impl NStepReturn {
    /// Accumulate the return of a sequence of `(reward, done)` steps.
    ///
    /// Consumes at most `n` steps and stops after the first `done`.
    /// Slots past the last consumed step are invalid; they are marked done only if the window
    /// ended at a terminal step.
    pub fn accumulate<I>(steps: I, n: usize, gamma: f64) -> Self
    where
        I: IntoIterator<Item = (f64, bool)>,
    {
        let mut value = 0.0;
        let mut discount = 1.0;
        let mut terminal = false;
        let mut len = 0;
        for (reward, done) in steps.into_iter().take(n) {
            value += discount * reward;
            discount *= gamma;
            len += 1;
            if done {
                terminal = true;
                break;
            }
        }
        let dones = (0..n).map(|k| terminal && k + 1 >= len).collect();
        let valid = (0..n).map(|k| k < len).collect();
        Self {
            value,
            dones,
            valid,
            terminal,
            len,
        }
    }
}

impl RingStore {
    /// `(reward, done)` of the held steps in the return window starting at `index`.
    ///
    /// Stops before `end`, before `n_step` steps and before the start of another episode.
    pub(super) fn window(&self, index: u64) -> impl Iterator<Item = (f64, bool)> + '_ {
        (0..self.n_step as u64)
            .map(move |k| index + k)
            .take_while(move |&j| {
                j < self.end && (j == index || !self.episode_starts[self.slot(j)])
            })
            .map(move |j| {
                let slot = self.slot(j);
                (self.rewards[slot], self.dones[slot])
            })
    }

    /// N-step return of the window starting at the held index `index`.
    pub(super) fn n_step_return(&self, index: u64) -> NStepReturn {
        NStepReturn::accumulate(self.window(index), self.n_step, self.gamma)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{make_pool, store_steps};
    use super::*;
    use rstest::rstest;

    #[test]
    fn exact_sum_earliest_to_latest() {
        let ret = NStepReturn::accumulate(vec![(1.0, false); 5], 3, 0.99);
        assert_eq!(ret.value, 1.0 + 0.99 + 0.99 * 0.99);
        assert!((ret.value - 2.9701).abs() < 1e-12);
        assert_eq!(ret.len, 3);
        assert!(!ret.terminal);
        assert_eq!(ret.dones, vec![false; 3]);
        assert_eq!(ret.valid, vec![true; 3]);
    }

    #[test]
    fn stops_at_done() {
        let steps = vec![(1.0, false), (2.0, true), (100.0, false)];
        let ret = NStepReturn::accumulate(steps, 4, 0.5);
        assert_eq!(ret.value, 1.0 + 0.5 * 2.0);
        assert_eq!(ret.len, 2);
        assert!(ret.terminal);
        assert_eq!(ret.dones, vec![false, true, true, true]);
        assert_eq!(ret.valid, vec![true, true, false, false]);
    }

    #[test]
    fn short_nonterminal_window() {
        let ret = NStepReturn::accumulate(vec![(3.0, false)], 3, 0.9);
        assert_eq!(ret.value, 3.0);
        assert!(!ret.terminal);
        assert_eq!(ret.dones, vec![false; 3]);
        assert_eq!(ret.valid, vec![true, false, false]);
    }

    #[rstest]
    #[case::zero_gamma(0.0, 1.0)]
    #[case::unit_gamma(1.0, 4.0)]
    fn gamma_extremes(#[case] gamma: f64, #[case] expected: f64) {
        let ret = NStepReturn::accumulate(vec![(1.0, false); 4], 4, gamma);
        assert_eq!(ret.value, expected);
    }

    #[test]
    fn window_does_not_cross_episode_start() {
        let mut pool = make_pool(20, 1, 3);
        // Episode of length 2, then a new episode
        store_steps(&mut pool, 0, &[(1.0, false), (2.0, true), (4.0, false), (8.0, false)]);
        let steps: Vec<_> = pool.window(1).collect();
        assert_eq!(steps, vec![(2.0, true)]);
        let ret = pool.n_step_return(2);
        assert_eq!(ret.len, 2);
        assert_eq!(ret.value, 4.0 + 0.99 * 8.0);
    }

    #[test]
    fn forced_done_ends_window() {
        let mut pool = make_pool(20, 1, 3);
        store_steps(&mut pool, 0, &[(1.0, false), (1.0, false)]);
        pool.trash_current_rollout();
        store_steps(&mut pool, 0, &[(1.0, false), (1.0, false)]);
        pool.force_done();
        store_steps(&mut pool, 2, &[(5.0, false)]);
        let ret = pool.n_step_return(0);
        assert!(ret.terminal);
        assert_eq!(ret.len, 2);
    }
}

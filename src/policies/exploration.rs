//! Epsilon-greedy exploration
use super::{Policy, PolicyOutput};
use crate::error::ReplayError;
use crate::logging::{Id, LogError, StatsLogger};
use crate::replay::{Batch, EncodedObservation};
use crate::spaces::ActionSpace;
use crate::{Action, Prng};
use rand::distributions::Distribution;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;

/// A value that varies linearly between `(time, value)` endpoints.
///
/// Times outside of the endpoints get `outside_value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PiecewiseSchedule {
    /// `(time, value)` pairs in increasing time order.
    pub endpoints: Vec<(f64, f64)>,
    pub outside_value: f64,
}

impl Default for PiecewiseSchedule {
    fn default() -> Self {
        Self {
            endpoints: vec![(0.0, 1.0), (1e6, 0.1)],
            outside_value: 0.1,
        }
    }
}

impl PiecewiseSchedule {
    /// A schedule with the same value at all times.
    #[must_use]
    pub const fn constant(value: f64) -> Self {
        Self {
            endpoints: Vec::new(),
            outside_value: value,
        }
    }

    pub fn validate(&self) -> Result<(), ReplayError> {
        if self.endpoints.windows(2).all(|w| w[0].0 <= w[1].0) {
            Ok(())
        } else {
            Err(ReplayError::InvalidConfiguration(
                "schedule endpoints must be sorted by time".into(),
            ))
        }
    }

    /// Value at time `t`.
    #[must_use]
    pub fn value(&self, t: f64) -> f64 {
        for w in self.endpoints.windows(2) {
            let ((l_t, l), (r_t, r)) = (w[0], w[1]);
            if l_t <= t && t < r_t {
                let alpha = (t - l_t) / (r_t - l_t);
                return l + alpha * (r - l);
            }
        }
        self.outside_value
    }
}

/// Replaces actions with random ones with a scheduled probability.
#[derive(Debug, Clone, PartialEq)]
pub struct EpsilonGreedy {
    pub schedule: PiecewiseSchedule,
}

impl EpsilonGreedy {
    pub fn new(schedule: PiecewiseSchedule) -> Result<Self, ReplayError> {
        schedule.validate()?;
        Ok(Self { schedule })
    }

    /// Exploration probability at step `t`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn epsilon(&self, t: u64) -> f64 {
        self.schedule.value(t as f64)
    }

    /// With probability `epsilon(t)` replace `action` with a uniform sample of `action_space`.
    ///
    /// Returns the action and whether it was replaced.
    pub fn add_exploration<R: Rng + ?Sized>(
        &self,
        t: u64,
        action: Action,
        action_space: &ActionSpace,
        rng: &mut R,
    ) -> (Action, bool) {
        if rng.gen::<f64>() < self.epsilon(t) {
            (action_space.sample(rng), true)
        } else {
            (action, false)
        }
    }
}

/// Wraps a policy with epsilon-greedy exploration.
///
/// Exploration is only applied when actions are requested with `explore`.
/// Explored actions are flagged in the action info under `"explored"`.
#[derive(Debug, Clone)]
pub struct Exploring<P> {
    pub policy: P,
    pub strategy: EpsilonGreedy,
    action_space: ActionSpace,
    rng: Prng,
    last_step: u64,
}

impl<P> Exploring<P> {
    pub fn new(policy: P, strategy: EpsilonGreedy, action_space: ActionSpace, seed: u64) -> Self {
        Self {
            policy,
            strategy,
            action_space,
            rng: Prng::seed_from_u64(seed),
            last_step: 0,
        }
    }
}

impl<P: Policy> Policy for Exploring<P> {
    fn n_step(&self) -> usize {
        self.policy.n_step()
    }

    fn gamma(&self) -> f64 {
        self.policy.gamma()
    }

    fn obs_history_len(&self) -> usize {
        self.policy.obs_history_len()
    }

    fn only_completed_episodes(&self) -> bool {
        self.policy.only_completed_episodes()
    }

    fn get_actions(
        &mut self,
        steps: &[u64],
        current_episode_steps: &[u64],
        observations: &[EncodedObservation],
        explore: bool,
    ) -> Result<PolicyOutput, ReplayError> {
        let mut output =
            self.policy
                .get_actions(steps, current_episode_steps, observations, explore)?;
        if !explore {
            return Ok(output);
        }
        for ((action, info), &t) in output
            .actions
            .iter_mut()
            .zip(&mut output.action_infos)
            .zip(steps)
        {
            let (explored_action, explored) = self.strategy.add_exploration(
                t,
                action.clone(),
                &self.action_space,
                &mut self.rng,
            );
            *action = explored_action;
            info.insert("explored".into(), json!(explored));
        }
        self.last_step = steps.iter().copied().max().unwrap_or(self.last_step);
        Ok(output)
    }

    fn reset_get_action(&mut self) {
        self.policy.reset_get_action()
    }

    fn train_step(&mut self, step: u64, batch: &Batch) -> Result<(), ReplayError> {
        self.policy.train_step(step, batch)
    }

    fn save(&self, path: &Path) -> Result<(), ReplayError> {
        self.policy.save(path)
    }

    fn restore(&mut self, path: &Path) -> Result<(), ReplayError> {
        self.policy.restore(path)
    }

    fn log(&mut self, logger: &mut dyn StatsLogger, prefix: &str) -> Result<(), LogError> {
        logger.log_scalar(
            Id::scoped(prefix, "epsilon"),
            self.strategy.epsilon(self.last_step),
        )?;
        self.policy.log(logger, prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::super::{RandomPolicy, RandomPolicyConfig};
    use super::*;
    use crate::logging::MemoryLogger;
    use crate::spaces::{IndexSpace, Space};
    use ndarray::{array, Array2, ArrayD, IxDyn};
    use rstest::rstest;

    #[rstest]
    #[case::start(0.0, 1.0)]
    #[case::middle(50.0, 0.55)]
    #[case::second_segment(150.0, 0.05)]
    #[case::after(500.0, 0.01)]
    #[case::before(-1.0, 0.01)]
    fn piecewise_value(#[case] t: f64, #[case] expected: f64) {
        let schedule = PiecewiseSchedule {
            endpoints: vec![(0.0, 1.0), (100.0, 0.1), (200.0, 0.0)],
            outside_value: 0.01,
        };
        assert!((schedule.value(t) - expected).abs() < 1e-12);
    }

    #[test]
    fn unsorted_schedule_is_invalid() {
        let schedule = PiecewiseSchedule {
            endpoints: vec![(10.0, 1.0), (0.0, 0.0)],
            outside_value: 0.0,
        };
        assert!(matches!(
            EpsilonGreedy::new(schedule),
            Err(ReplayError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn epsilon_extremes() {
        let space = ActionSpace::Discrete(IndexSpace::new(1000));
        let mut rng = Prng::seed_from_u64(0);
        let never = EpsilonGreedy::new(PiecewiseSchedule::constant(0.0)).unwrap();
        let always = EpsilonGreedy::new(PiecewiseSchedule::constant(1.0)).unwrap();
        for t in 0..20 {
            let (action, explored) = never.add_exploration(t, array![7.0], &space, &mut rng);
            assert_eq!(action, array![7.0_f32]);
            assert!(!explored);
            let (action, explored) = always.add_exploration(t, array![7.0], &space, &mut rng);
            assert!(space.contains(&action));
            assert!(explored);
        }
    }

    fn exploring_policy(epsilon: f64) -> Exploring<RandomPolicy> {
        let space = ActionSpace::Discrete(IndexSpace::new(3));
        let inner = RandomPolicy::new(RandomPolicyConfig::default(), space.clone()).unwrap();
        Exploring::new(
            inner,
            EpsilonGreedy::new(PiecewiseSchedule::constant(epsilon)).unwrap(),
            space,
            0,
        )
    }

    fn observations(n: usize) -> Vec<EncodedObservation> {
        vec![
            EncodedObservation {
                im: ArrayD::zeros(IxDyn(&[1, 2, 2])),
                vec: Array2::zeros((1, 1)),
            };
            n
        ]
    }

    #[test]
    fn exploring_flags_actions() {
        let mut policy = exploring_policy(1.0);
        let output = policy
            .get_actions(&[3, 4], &[0, 0], &observations(2), true)
            .unwrap();
        assert!(output
            .action_infos
            .iter()
            .all(|info| info["explored"] == json!(true)));

        let output = policy
            .get_actions(&[5, 6], &[1, 1], &observations(2), false)
            .unwrap();
        assert!(output.action_infos.iter().all(|info| info.is_empty()));
    }

    #[test]
    fn exploring_logs_epsilon() {
        let mut policy = exploring_policy(0.25);
        let mut logger = MemoryLogger::default();
        policy.log(&mut logger, "policy").unwrap();
        assert_eq!(logger.last_scalar("policy/epsilon"), Some(0.25));
    }
}

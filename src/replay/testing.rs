//! Pool construction helpers for tests
use super::{Effect, EnvInfo, Layout, Observation, PoolConfig, Rollout, RingStore};
use crate::envs::testing::{counting_observation, IM_SHAPE};
use ndarray::Array1;

pub fn layout() -> Layout {
    Layout {
        im_shape: IM_SHAPE.to_vec(),
        vec_dim: 1,
        action_dim: 1,
    }
}

pub fn config(capacity: usize, history_len: usize, n_step: usize) -> PoolConfig {
    PoolConfig {
        capacity,
        n_step,
        gamma: 0.99,
        obs_history_len: history_len,
        ..PoolConfig::default()
    }
}

pub fn make_pool(capacity: usize, history_len: usize, n_step: usize) -> RingStore {
    RingStore::new(&config(capacity, history_len, n_step), layout()).unwrap()
}

pub fn observation(value: u64) -> Observation {
    counting_observation(value)
}

pub fn effect(reward: f64, done: bool) -> Effect {
    Effect {
        action: Array1::zeros(1),
        reward,
        done,
        env_info: EnvInfo::new(),
        est_value: f64::NAN,
        logprob: 0.0,
    }
}

/// Store live steps with observation `t`, action `t` and the given rewards and dones.
pub fn store_steps(pool: &mut RingStore, first: u64, steps: &[(f64, bool)]) {
    for (t, &(reward, done)) in (first..).zip(steps) {
        let (pending, _) = pool.store_observation(t, &observation(t)).unwrap();
        #[allow(clippy::cast_precision_loss)]
        let action = Array1::from_elem(1, t as f32);
        pool.store_effect(
            pending,
            Effect {
                action,
                reward,
                done,
                env_info: EnvInfo::new(),
                est_value: f64::NAN,
                logprob: 0.0,
            },
        )
        .unwrap();
    }
}

/// A rollout whose step `k` has observation and action `offset + k`.
#[allow(clippy::cast_precision_loss)]
pub fn rollout(offset: u64, rewards: &[f64], dones: &[bool]) -> Rollout {
    assert_eq!(rewards.len(), dones.len());
    let len = rewards.len() as u64;
    Rollout {
        observations: (offset..offset + len).map(counting_observation).collect(),
        actions: (offset..offset + len)
            .map(|t| Array1::from_elem(1, t as f32))
            .collect(),
        rewards: rewards.to_vec(),
        dones: dones.to_vec(),
        logprobs: vec![-0.5; rewards.len()],
        est_values: Vec::new(),
        env_infos: Vec::new(),
    }
}

//! Experience replay for reinforcement learning.
//!
//! Transitions from one or more environments are recorded into fixed-capacity
//! [replay pools](replay::RingStore), live one step at a time or in bulk from recorded
//! rollouts, and served back as batches of stacked observation histories with N-step
//! discounted returns. A [`Sampler`] steps several environments in lockstep with a
//! [`Policy`] and keeps one pool per environment.
#![warn(clippy::cast_lossless)]
#![warn(clippy::cast_possible_truncation)]
#![warn(clippy::doc_markdown)]
#![warn(clippy::explicit_iter_loop)]
#![warn(clippy::for_kv_map)] // part of warn(clippy::all), specifically style?
#![warn(clippy::missing_const_for_fn)] // has some false positives
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::redundant_closure_for_method_calls)]
#![warn(clippy::use_self)] // also triggered by macro expansions
pub mod envs;
mod error;
pub mod logging;
pub mod policies;
pub mod replay;
pub mod sampler;
pub mod spaces;
pub mod utils;

pub use envs::{EnvSpec, EnvStep, Environment, VecEnv};
pub use error::{BoxedError, ReplayError};
pub use policies::{BuiltPolicy, Policy, PolicyDef, PolicyOutput};
pub use replay::{
    Action, Batch, Effect, EnvInfo, Observation, PoolConfig, RingStore, Rollout, SamplingMethod,
};
pub use sampler::{PoolSampling, RunContext, Sampler, SamplerConfig};

/// Pseudo-random number generator used throughout the crate.
pub type Prng = rand_chacha::ChaCha8Rng;

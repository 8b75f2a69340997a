//! Error type
use std::error::Error;
use std::path::PathBuf;
use thiserror::Error;

/// Boxed error raised by an external collaborator (environment or policy).
pub type BoxedError = Box<dyn Error + Send + Sync + 'static>;

/// Error from the replay crate.
#[derive(Error, Debug)]
pub enum ReplayError {
    /// Not enough valid transitions to draw the requested sample.
    #[error("insufficient data: {0}")]
    InsufficientData(String),
    /// A rollout file could not be read or parsed.
    #[error("corrupt rollout file {path:?}: {reason}")]
    CorruptRollout { path: PathBuf, reason: String },
    /// A rollout passed for bulk ingest is internally inconsistent.
    #[error("invalid rollout: {0}")]
    InvalidRollout(String),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    /// The two-phase observation / effect write sequence was not respected.
    #[error("write protocol violation: {0}")]
    ProtocolViolation(&'static str),
    #[error("{field} has shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        field: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("environment fault")]
    EnvironmentFault(#[source] BoxedError),
    #[error("policy error")]
    Policy(#[source] BoxedError),
}

impl ReplayError {
    /// Whether this error is an [`EnvironmentFault`](Self::EnvironmentFault).
    #[must_use]
    pub const fn is_environment_fault(&self) -> bool {
        matches!(self, Self::EnvironmentFault(_))
    }
}

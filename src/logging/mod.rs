//! Logging statistics from replay pools and simulation runs
mod display;

pub use display::DisplayLogger;

use std::borrow::Cow;
use std::fmt;
use thiserror::Error;

/// Identifier of a logged value: a `/`-separated name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id(Cow<'static, str>);

impl Id {
    /// Prefix the name with `scope/`, or leave it unchanged if `scope` is empty.
    #[must_use]
    pub fn scoped(scope: &str, name: impl Into<Cow<'static, str>>) -> Self {
        let name = name.into();
        if scope.is_empty() {
            Self(name)
        } else {
            Self(format!("{}/{}", scope.trim_end_matches('/'), name).into())
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&'static str> for Id {
    fn from(name: &'static str) -> Self {
        Self(name.into())
    }
}

impl From<String> for Id {
    fn from(name: String) -> Self {
        Self(name.into())
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A value that can be logged.
#[derive(Debug, Clone, PartialEq)]
pub enum Loggable {
    /// Nothing. No data to log.
    ///
    /// Logging Nothing data may still produce a placeholder entry for the name.
    Nothing,
    /// Increment a counter.
    CounterIncrement(u64),
    /// A scalar value. Aggregate by taking means.
    Scalar(f64),
    /// A text message. Aggregate by counting occurrences.
    Message(Cow<'static, str>),
}

impl From<f64> for Loggable {
    fn from(value: f64) -> Self {
        Self::Scalar(value)
    }
}

impl From<f32> for Loggable {
    fn from(value: f32) -> Self {
        Self::Scalar(value.into())
    }
}

impl Loggable {
    const fn kind(&self) -> &'static str {
        match self {
            Self::Nothing => "nothing",
            Self::CounterIncrement(_) => "counter",
            Self::Scalar(_) => "scalar",
            Self::Message(_) => "message",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LogError {
    #[error("\"{id}\": incompatible value type {new}, expected {expected}")]
    IncompatibleValue {
        id: Id,
        new: &'static str,
        expected: &'static str,
    },
}

/// Log statistics.
///
/// Values logged within one `group_start` / `group_end` pair belong to the same time step.
pub trait StatsLogger {
    /// Start a group of related values.
    fn group_start(&mut self) {}

    /// Log a value within the current group.
    ///
    /// # Returns
    /// May return an error if the logged value is structurally incompatible
    /// with previous values logged under the same id.
    fn group_log(&mut self, id: Id, value: Loggable) -> Result<(), LogError>;

    /// End the current group.
    fn group_end(&mut self) {}

    /// Write out any buffered summaries.
    fn flush(&mut self) {}

    /// Log a single value as its own group.
    fn log(&mut self, id: Id, value: Loggable) -> Result<(), LogError> {
        self.group_start();
        let result = self.group_log(id, value);
        self.group_end();
        result
    }

    /// Log a scalar value as its own group.
    fn log_scalar(&mut self, id: Id, value: f64) -> Result<(), LogError> {
        self.log(id, Loggable::Scalar(value))
    }

    /// Log a counter increment as its own group.
    fn log_counter_increment(&mut self, id: Id, increment: u64) -> Result<(), LogError> {
        self.log(id, Loggable::CounterIncrement(increment))
    }
}

/// Logger that does nothing
impl StatsLogger for () {
    fn group_log(&mut self, _: Id, _: Loggable) -> Result<(), LogError> {
        Ok(())
    }
}

impl<L: StatsLogger + ?Sized> StatsLogger for &'_ mut L {
    fn group_start(&mut self) {
        L::group_start(self)
    }
    fn group_log(&mut self, id: Id, value: Loggable) -> Result<(), LogError> {
        L::group_log(self, id, value)
    }
    fn group_end(&mut self) {
        L::group_end(self)
    }
    fn flush(&mut self) {
        L::flush(self)
    }
}

impl<L: StatsLogger + ?Sized> StatsLogger for Box<L> {
    fn group_start(&mut self) {
        L::group_start(self)
    }
    fn group_log(&mut self, id: Id, value: Loggable) -> Result<(), LogError> {
        L::group_log(self, id, value)
    }
    fn group_end(&mut self) {
        L::group_end(self)
    }
    fn flush(&mut self) {
        L::flush(self)
    }
}

/// Logger that records every value in memory.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MemoryLogger {
    pub entries: Vec<(Id, Loggable)>,
}

impl MemoryLogger {
    /// All values logged under the given name, in order.
    pub fn values<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Loggable> + 'a {
        self.entries
            .iter()
            .filter(move |(entry_id, _)| entry_id.as_str() == id)
            .map(|(_, value)| value)
    }

    /// The most recent scalar logged under the given name.
    #[must_use]
    pub fn last_scalar(&self, id: &str) -> Option<f64> {
        self.values(id)
            .filter_map(|value| match value {
                Loggable::Scalar(x) => Some(*x),
                _ => None,
            })
            .last()
    }
}

impl StatsLogger for MemoryLogger {
    fn group_log(&mut self, id: Id, value: Loggable) -> Result<(), LogError> {
        if let Some((_, previous)) = self.entries.iter().rev().find(|(i, _)| i == &id) {
            if previous.kind() != value.kind() {
                return Err(LogError::IncompatibleValue {
                    id,
                    new: value.kind(),
                    expected: previous.kind(),
                });
            }
        }
        self.entries.push((id, value));
        Ok(())
    }
}

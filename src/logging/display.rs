//! Command-line logger
use super::{Id, LogError, Loggable, StatsLogger};
use crate::utils::fmt::{DisplayFn, PrettyPrint};
use crate::utils::stats::OnlineMeanVariance;
use std::borrow::Cow;
use std::collections::{btree_map::Entry, BTreeMap};
use std::fmt;
use std::ops::Drop;
use std::time::{Duration, Instant};
use yansi::Paint;

/// Logger that displays summaries to standard output at most once per display period.
///
/// Values logged between displays are aggregated: scalars by mean and standard deviation,
/// counters by summing, messages by counting.
#[derive(Debug, Clone)]
pub struct DisplayLogger {
    summaries: BTreeMap<Id, Summary>,
    display_period: Duration,
    last_display_time: Instant,
}

impl DisplayLogger {
    #[must_use]
    pub fn new(display_period: Duration) -> Self {
        Self {
            summaries: BTreeMap::new(),
            display_period,
            last_display_time: Instant::now(),
        }
    }
}

impl Default for DisplayLogger {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl StatsLogger for DisplayLogger {
    fn group_log(&mut self, id: Id, value: Loggable) -> Result<(), LogError> {
        match self.summaries.entry(id) {
            Entry::Vacant(e) => {
                e.insert(Summary::from(value));
            }
            Entry::Occupied(e) => {
                let (id, summary) = (e.key().clone(), e.into_mut());
                summary.push(id, value)?;
            }
        }
        Ok(())
    }

    fn group_end(&mut self) {
        if self.last_display_time.elapsed() >= self.display_period {
            self.flush()
        }
    }

    fn flush(&mut self) {
        let elapsed = self.last_display_time.elapsed();
        let dirty: Vec<_> = self.summaries.iter().filter(|(_, s)| s.dirty()).collect();
        if !dirty.is_empty() {
            println!();
            println!("{}", Paint::fixed(8, format!("==== {:.1?} ====", elapsed)));
            for (id, summary) in dirty {
                println!("{:<32} {}", Paint::fixed(35, id), summary);
            }
        }
        for summary in self.summaries.values_mut() {
            summary.reset();
        }
        self.last_display_time = Instant::now();
    }
}

/// Flush when dropped
impl Drop for DisplayLogger {
    fn drop(&mut self) {
        self.flush();
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Summary {
    Nothing,
    Counter {
        increment: u64,
        initial_value: u64,
    },
    Scalar {
        stats: OnlineMeanVariance<f64>,
    },
    Message {
        counts: BTreeMap<Cow<'static, str>, usize>,
    },
}

impl From<Loggable> for Summary {
    fn from(value: Loggable) -> Self {
        match value {
            Loggable::Nothing => Self::Nothing,
            Loggable::CounterIncrement(i) => Self::Counter {
                increment: i,
                initial_value: 0,
            },
            Loggable::Scalar(v) => {
                let mut stats = OnlineMeanVariance::new();
                stats.push(v);
                Self::Scalar { stats }
            }
            Loggable::Message(s) => {
                let mut counts = BTreeMap::new();
                counts.insert(s, 1);
                Self::Message { counts }
            }
        }
    }
}

impl Summary {
    const fn kind(&self) -> &'static str {
        match self {
            Self::Nothing => "nothing",
            Self::Counter { .. } => "counter",
            Self::Scalar { .. } => "scalar",
            Self::Message { .. } => "message",
        }
    }

    fn push(&mut self, id: Id, value: Loggable) -> Result<(), LogError> {
        match (self, value) {
            (Self::Nothing, Loggable::Nothing) => {}
            (Self::Counter { increment, .. }, Loggable::CounterIncrement(i)) => *increment += i,
            (Self::Scalar { stats }, Loggable::Scalar(v)) => stats.push(v),
            (Self::Message { counts }, Loggable::Message(s)) => *counts.entry(s).or_insert(0) += 1,
            (summary, value) => {
                return Err(LogError::IncompatibleValue {
                    id,
                    new: value.kind(),
                    expected: summary.kind(),
                })
            }
        }
        Ok(())
    }

    fn dirty(&self) -> bool {
        match self {
            Self::Nothing => false,
            Self::Counter { increment, .. } => *increment > 0,
            Self::Scalar { stats } => stats.count() > 0,
            Self::Message { counts } => !counts.is_empty(),
        }
    }

    fn reset(&mut self) {
        match self {
            Self::Nothing => {}
            Self::Counter {
                increment,
                initial_value,
            } => {
                *initial_value += *increment;
                *increment = 0;
            }
            Self::Scalar { stats } => *stats = OnlineMeanVariance::new(),
            Self::Message { counts } => counts.clear(),
        }
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Nothing => Ok(()),
            Self::Counter {
                increment,
                initial_value,
            } => write!(
                f,
                "{}  (+{})",
                initial_value + increment,
                Paint::fixed(253, increment)
            ),
            Self::Scalar { stats } => {
                if let Some(mean) = stats.mean() {
                    write!(f, "{:.3}", PrettyPrint(mean))?;
                }
                if stats.count() > 1 {
                    if let Some(stddev) = stats.stddev() {
                        write!(
                            f,
                            " {}",
                            Paint::fixed(
                                8,
                                DisplayFn(|f| write!(f, "(σ {:.3})", PrettyPrint(stddev)))
                            )
                        )?;
                    }
                }
                Ok(())
            }
            Self::Message { counts } => {
                let mut first = true;
                for (message, count) in counts {
                    if !first {
                        write!(f, "; ")?;
                    }
                    first = false;
                    write!(f, "{} (x{})", message, count)?;
                }
                Ok(())
            }
        }
    }
}

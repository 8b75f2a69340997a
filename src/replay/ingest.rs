//! Bulk rollout ingest
use super::{Action, Effect, EnvInfo, Observation, RingStore, WriteState};
use crate::error::{BoxedError, ReplayError};
use log::{debug, warn};
use ndarray::Axis;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::panic;
use std::path::Path;

/// A recorded episode (or part of one) as parallel per-step arrays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rollout {
    pub observations: Vec<Observation>,
    pub actions: Vec<Action>,
    pub rewards: Vec<f64>,
    pub dones: Vec<bool>,
    pub logprobs: Vec<f64>,
    /// Value estimates per step; may be empty if unknown.
    #[serde(default)]
    pub est_values: Vec<f64>,
    /// Environment info per step; may be empty.
    #[serde(default)]
    pub env_infos: Vec<EnvInfo>,
}

impl Rollout {
    /// Number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rewards.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rewards.is_empty()
    }

    /// Keep only the first `len` steps of every per-step array.
    pub fn truncate(&mut self, len: usize) {
        self.observations.truncate(len);
        self.actions.truncate(len);
        self.rewards.truncate(len);
        self.dones.truncate(len);
        self.logprobs.truncate(len);
        self.est_values.truncate(len);
        self.env_infos.truncate(len);
    }

    /// Check that the per-step arrays have equal lengths.
    ///
    /// `est_values` and `env_infos` may also be empty.
    pub fn validate(&self) -> Result<(), ReplayError> {
        let len = self.len();
        let required = [
            ("observations", self.observations.len()),
            ("actions", self.actions.len()),
            ("dones", self.dones.len()),
            ("logprobs", self.logprobs.len()),
        ];
        let optional = [
            ("est_values", self.est_values.len()),
            ("env_infos", self.env_infos.len()),
        ];
        for (name, field_len) in required {
            if field_len != len {
                return Err(ReplayError::InvalidRollout(format!(
                    "{} has {} entries but there are {} rewards",
                    name, field_len, len
                )));
            }
        }
        for (name, field_len) in optional {
            if field_len != 0 && field_len != len {
                return Err(ReplayError::InvalidRollout(format!(
                    "{} has {} entries but there are {} rewards",
                    name, field_len, len
                )));
            }
        }
        Ok(())
    }
}

impl RingStore {
    /// Write a recorded rollout as a new episode, bypassing the two-phase protocol.
    ///
    /// Step `k` of the rollout gets the step index `start_index + k`. An open live episode is
    /// cut off (without marking it done). Episodes end where the rollout has `done` set; a
    /// rollout that does not end in `done` is closed without one.
    ///
    /// Returns the number of transitions written.
    ///
    /// # Errors
    /// * [`ReplayError::ProtocolViolation`] if an observation is awaiting its effect.
    /// * [`ReplayError::InvalidRollout`] or [`ReplayError::ShapeMismatch`] if the rollout is
    ///   inconsistent with itself or with the pool layout. Nothing is written in that case.
    pub fn store_rollout(&mut self, start_index: u64, rollout: &Rollout) -> Result<usize, ReplayError> {
        if let WriteState::AwaitingEffect { .. } = self.state {
            return Err(ReplayError::ProtocolViolation(
                "cannot store a rollout while an observation is awaiting its effect",
            ));
        }
        rollout.validate()?;
        for observation in &rollout.observations {
            self.check_observation(observation)?;
        }
        for action in &rollout.actions {
            self.check_action(action)?;
        }
        if rollout.is_empty() {
            return Ok(0);
        }

        self.episodes.discard_current();
        self.state = WriteState::EpisodeClosed;
        for (k, observation) in rollout.observations.iter().enumerate() {
            let index = self.open_slot(start_index + k as u64, observation);
            let effect = Effect {
                action: rollout.actions[k].clone(),
                reward: rollout.rewards[k],
                done: rollout.dones[k],
                env_info: rollout.env_infos.get(k).cloned().unwrap_or_default(),
                est_value: rollout.est_values.get(k).copied().unwrap_or(f64::NAN),
                logprob: rollout.logprobs[k],
            };
            self.commit(index, effect, false);
        }
        if self.state != WriteState::EpisodeClosed {
            self.close_episode();
        }
        Ok(rollout.len())
    }

    /// Copy the held transitions `from .. to` into a rollout.
    ///
    /// Observations are included only if the pool saves rollout observations.
    pub(super) fn extract_rollout(&self, from: u64, to: u64) -> Rollout {
        let slots: Vec<usize> = (from..to)
            .filter(|&i| self.contains(i))
            .map(|i| self.slot(i))
            .collect();
        let observations = if self.episodes.saves_observations() {
            slots
                .iter()
                .map(|&slot| Observation {
                    im: self.obs_im.index_axis(Axis(0), slot).to_owned(),
                    vec: self.obs_vec.row(slot).to_owned(),
                })
                .collect()
        } else {
            Vec::new()
        };
        Rollout {
            observations,
            actions: slots.iter().map(|&s| self.actions.row(s).to_owned()).collect(),
            rewards: slots.iter().map(|&s| self.rewards[s]).collect(),
            dones: slots.iter().map(|&s| self.dones[s]).collect(),
            logprobs: slots.iter().map(|&s| self.logprobs[s]).collect(),
            est_values: slots.iter().map(|&s| self.est_values[s]).collect(),
            env_infos: if self.save_env_infos {
                slots.iter().map(|&s| self.env_infos[s].clone()).collect()
            } else {
                Vec::new()
            },
        }
    }
}

/// Contents of a rollout file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RolloutFile {
    pub rollouts: Vec<Rollout>,
}

/// Reads the rollouts stored in a file.
pub trait RolloutReader: Sync {
    /// # Errors
    /// [`ReplayError::CorruptRollout`] if the file cannot be read or parsed.
    fn read(&self, path: &Path) -> Result<Vec<Rollout>, ReplayError>;
}

/// Reads CBOR-encoded [`RolloutFile`]s.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct CborRolloutReader;

impl RolloutReader for CborRolloutReader {
    fn read(&self, path: &Path) -> Result<Vec<Rollout>, ReplayError> {
        let corrupt = |reason: String| ReplayError::CorruptRollout {
            path: path.to_path_buf(),
            reason,
        };
        let file = File::open(path).map_err(|err| corrupt(err.to_string()))?;
        let contents: RolloutFile =
            serde_cbor::from_reader(BufReader::new(file)).map_err(|err| corrupt(err.to_string()))?;
        Ok(contents.rollouts)
    }
}

/// Write rollouts to a file readable by [`CborRolloutReader`].
pub fn write_rollout_file(path: &Path, contents: &RolloutFile) -> Result<(), BoxedError> {
    let file = File::create(path)?;
    serde_cbor::to_writer(BufWriter::new(file), contents)?;
    Ok(())
}

/// Result of loading a set of rollout files.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct LoadReport {
    /// Rollouts of all readable files, in file order.
    pub rollouts: Vec<Rollout>,
    /// Number of files read.
    pub succeeded: usize,
    /// Number of files skipped as corrupt.
    pub failed: usize,
}

impl LoadReport {
    /// Fraction of files that were read; `1` if there were no files.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_ratio(&self) -> f64 {
        let total = self.succeeded + self.failed;
        if total == 0 {
            1.0
        } else {
            self.succeeded as f64 / total as f64
        }
    }
}

/// Read the rollouts of one file, rejecting the file if any rollout is malformed.
fn read_valid<R>(reader: &R, path: &Path) -> Result<Vec<Rollout>, ReplayError>
where
    R: RolloutReader + ?Sized,
{
    let rollouts = reader.read(path)?;
    for (k, rollout) in rollouts.iter().enumerate() {
        rollout
            .validate()
            .map_err(|err| ReplayError::CorruptRollout {
                path: path.to_path_buf(),
                reason: format!("rollout {}: {}", k, err),
            })?;
    }
    Ok(rollouts)
}

/// Read rollout files in parallel, skipping files that fail to load.
///
/// A file fails to load if it cannot be read or parsed, or if any of its rollouts has
/// per-step arrays of unequal length.
/// Files are distributed over up to one worker thread per CPU.
/// The rollouts of the report are in the order of `paths`.
pub fn load_rollout_files<R, P>(reader: &R, paths: &[P]) -> LoadReport
where
    R: RolloutReader + ?Sized,
    P: AsRef<Path> + Sync,
{
    let num_workers = num_cpus::get().min(paths.len()).max(1);
    let mut results: Vec<(usize, Result<Vec<Rollout>, ReplayError>)> =
        crossbeam::scope(|scope| {
            let threads: Vec<_> = (0..num_workers)
                .map(|worker| {
                    scope.spawn(move |_scope| {
                        (worker..paths.len())
                            .step_by(num_workers)
                            .map(|i| (i, read_valid(reader, paths[i].as_ref())))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            threads
                .into_iter()
                .flat_map(|t| t.join().unwrap_or_else(|err| panic::resume_unwind(err)))
                .collect()
        })
        .unwrap_or_else(|err| panic::resume_unwind(err));
    results.sort_unstable_by_key(|(i, _)| *i);

    let mut report = LoadReport::default();
    for (i, result) in results {
        match result {
            Ok(rollouts) => {
                report.succeeded += 1;
                report.rollouts.extend(rollouts);
            }
            Err(err) => {
                warn!("skipping {}: {}", paths[i].as_ref().display(), err);
                report.failed += 1;
            }
        }
    }
    debug!(
        "Files successfully loaded: {:.2}%",
        100.0 * report.success_ratio()
    );
    report
}

#[cfg(test)]
mod tests {
    use super::super::testing::{make_pool, observation, rollout, store_steps};
    use super::*;
    use ndarray::{array, Array1};
    use std::env;
    use std::fs;
    use std::path::PathBuf;

    /// A fresh scratch directory for one test.
    fn scratch_dir(name: &str) -> PathBuf {
        let dir = env::temp_dir().join(format!("relearn-replay-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn truncate_trims_every_field() {
        let mut r = rollout(0, &[1.0; 5], &[false; 5]);
        r.est_values = vec![0.5; 5];
        r.truncate(3);
        assert_eq!(r.len(), 3);
        assert_eq!(r.observations.len(), 3);
        assert_eq!(r.actions.len(), 3);
        assert_eq!(r.dones.len(), 3);
        assert_eq!(r.logprobs.len(), 3);
        assert_eq!(r.est_values.len(), 3);
        assert!(r.validate().is_ok());
    }

    #[test]
    fn validate_rejects_ragged_rollout() {
        let mut r = rollout(0, &[1.0; 3], &[false; 3]);
        r.dones.pop();
        assert!(matches!(r.validate(), Err(ReplayError::InvalidRollout(_))));
        let mut r = rollout(0, &[1.0; 3], &[false; 3]);
        r.est_values = vec![0.0; 2];
        assert!(matches!(r.validate(), Err(ReplayError::InvalidRollout(_))));
    }

    #[test]
    fn store_rollout_round_trip() {
        let mut pool = make_pool(50, 2, 1);
        let r = rollout(10, &[1.0, 2.0, 3.0, 4.0], &[false, false, false, true]);
        assert_eq!(pool.store_rollout(0, &r).unwrap(), 4);
        assert_eq!(pool.len(), 4);
        assert_eq!(pool.write_state(), WriteState::EpisodeClosed);
        let copy = pool.extract_rollout(0, 4);
        assert_eq!(copy.observations, r.observations);
        assert_eq!(copy.actions, r.actions);
        assert_eq!(copy.rewards, r.rewards);
        assert_eq!(copy.dones, r.dones);
        assert_eq!(copy.logprobs, r.logprobs);
        assert!(copy.est_values.iter().all(|v| v.is_nan()));
        // Bulk steps are not live episodes
        assert!(pool.episodes.take_finished().is_empty());
    }

    #[test]
    fn store_rollout_uses_start_index() {
        let mut pool = make_pool(50, 1, 1);
        pool.store_rollout(100, &rollout(0, &[1.0; 3], &[false; 3]))
            .unwrap();
        assert_eq!(pool.step_index(0), Some(100));
        assert_eq!(pool.step_index(2), Some(102));
    }

    #[test]
    fn invalid_rollout_writes_nothing() {
        let mut pool = make_pool(50, 1, 1);
        let mut r = rollout(0, &[1.0; 3], &[false; 3]);
        r.actions[1] = Array1::zeros(2);
        assert!(matches!(
            pool.store_rollout(0, &r),
            Err(ReplayError::ShapeMismatch { .. })
        ));
        assert!(pool.is_empty());
    }

    #[test]
    fn store_rollout_while_pending_is_rejected() {
        let mut pool = make_pool(50, 1, 1);
        let _pending = pool.store_observation(0, &observation(0)).unwrap();
        assert!(matches!(
            pool.store_rollout(1, &rollout(0, &[1.0], &[true])),
            Err(ReplayError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn rollout_cuts_open_live_episode() {
        let mut pool = make_pool(50, 3, 2);
        store_steps(&mut pool, 0, &[(1.0, false); 3]);
        pool.store_rollout(3, &rollout(50, &[7.0, 8.0], &[false, true]))
            .unwrap();
        // The live episode is not marked done, but no window or history crosses into it
        assert!(!pool.dones[pool.slot(2)]);
        assert!(pool.episode_starts[pool.slot(3)]);
        let steps: Vec<_> = pool.window(2).collect();
        assert_eq!(steps, vec![(1.0, false)]);
        assert_eq!(pool.encode_observation(3).vec, array![[0.0_f32], [0.0], [50.0]]);
        // Nothing open remains to trash
        assert_eq!(pool.trash_current_rollout(), 0);
    }

    #[test]
    fn unterminated_rollout_is_closed() {
        let mut pool = make_pool(50, 2, 1);
        pool.store_rollout(0, &rollout(0, &[1.0; 3], &[false; 3]))
            .unwrap();
        assert_eq!(pool.write_state(), WriteState::EpisodeClosed);
        pool.store_rollout(3, &rollout(10, &[1.0; 3], &[false; 3]))
            .unwrap();
        assert!(pool.episode_starts[pool.slot(3)]);
    }

    #[test]
    fn load_skips_corrupt_files() {
        let dir = scratch_dir("load");
        let paths = vec![dir.join("a.cbor"), dir.join("b.cbor"), dir.join("c.cbor")];
        let first = RolloutFile {
            rollouts: vec![rollout(0, &[1.0; 4], &[false, false, false, true])],
        };
        let third = RolloutFile {
            rollouts: vec![
                rollout(10, &[2.0; 2], &[false, true]),
                rollout(20, &[3.0; 3], &[false, false, true]),
            ],
        };
        write_rollout_file(&paths[0], &first).unwrap();
        fs::write(&paths[1], b"not a rollout file").unwrap();
        write_rollout_file(&paths[2], &third).unwrap();

        let report = load_rollout_files(&CborRolloutReader, &paths);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
        assert!((report.success_ratio() - 2.0 / 3.0).abs() < 1e-12);
        let mut expected = first.rollouts;
        expected.extend(third.rollouts);
        assert_eq!(report.rollouts, expected);
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn ragged_rollout_fails_its_file() {
        let dir = scratch_dir("ragged");
        let paths = vec![dir.join("a.cbor"), dir.join("b.cbor")];
        let mut ragged = rollout(0, &[1.0; 5], &[false; 5]);
        ragged.dones.pop();
        write_rollout_file(
            &paths[0],
            &RolloutFile {
                rollouts: vec![rollout(0, &[1.0; 2], &[false, true]), ragged],
            },
        )
        .unwrap();
        let good = RolloutFile {
            rollouts: vec![rollout(0, &[1.0; 3], &[false, false, true])],
        };
        write_rollout_file(&paths[1], &good).unwrap();

        let report = load_rollout_files(&CborRolloutReader, &paths);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
        // No rollout of the failed file is kept, not even its well-formed one
        assert_eq!(report.rollouts, good.rollouts);
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn missing_file_is_corrupt() {
        let path = scratch_dir("missing").join("none.cbor");
        assert!(matches!(
            CborRolloutReader.read(&path),
            Err(ReplayError::CorruptRollout { .. })
        ));
    }

    #[test]
    fn load_no_files() {
        let report = load_rollout_files::<_, PathBuf>(&CborRolloutReader, &[]);
        assert_eq!(report, LoadReport::default());
        assert_eq!(report.success_ratio(), 1.0);
    }
}

//! Stacked observation histories
use super::RingStore;
use ndarray::{Array2, ArrayD, ArrayViewMut2, ArrayViewMutD, Axis, IxDyn};
use std::iter;

/// The last `H` observation frames ending at some step, oldest first.
///
/// Frames before the start of the episode (or before the oldest held step) are zero.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedObservation {
    /// Image frames, shape `[H, ..im_shape]`.
    pub im: ArrayD<u8>,
    /// Vector frames, shape `[H, vec_dim]`.
    pub vec: Array2<f32>,
}

impl RingStore {
    /// Encode the observation history ending at the logical index `index`.
    ///
    /// `index` may be a committed step or the step awaiting its effect.
    /// Returns all-zero frames for an index that is not held.
    #[must_use]
    pub fn encode_observation(&self, index: u64) -> EncodedObservation {
        let h = self.history_len;
        let im_dim: Vec<usize> = iter::once(h)
            .chain(self.layout.im_shape.iter().copied())
            .collect();
        let mut encoded = EncodedObservation {
            im: ArrayD::zeros(IxDyn(&im_dim)),
            vec: Array2::zeros((h, self.layout.vec_dim)),
        };
        self.write_history(index, encoded.im.view_mut(), encoded.vec.view_mut());
        encoded
    }

    /// Encode the history of the newest observation, pending or committed.
    #[must_use]
    pub fn encode_recent_observation(&self) -> Option<EncodedObservation> {
        let index = match self.state {
            super::WriteState::AwaitingEffect { index } => index,
            _ if self.is_empty() => return None,
            _ => self.end - 1,
        };
        Some(self.encode_observation(index))
    }

    /// Copy the history ending at `index` into the first `H` frames of `im` and `vec`.
    ///
    /// Frames are written newest last at position `H - 1`; positions without a frame are left
    /// untouched. Returns the number of frames written.
    pub(super) fn write_history(
        &self,
        index: u64,
        mut im: ArrayViewMutD<u8>,
        mut vec: ArrayViewMut2<f32>,
    ) -> usize {
        let h = self.history_len;
        let mut frames = 0;
        let mut j = index;
        while frames < h && self.is_readable(j) {
            let slot = self.slot(j);
            let pos = h - 1 - frames;
            im.index_axis_mut(Axis(0), pos)
                .assign(&self.obs_im.index_axis(Axis(0), slot));
            vec.row_mut(pos).assign(&self.obs_vec.row(slot));
            frames += 1;
            if self.episode_starts[slot] || j == self.begin {
                break;
            }
            j -= 1;
        }
        frames
    }

    /// Number of frames available to the history ending at a held index, up to `H`.
    #[allow(clippy::cast_possible_truncation)]
    pub(super) fn history_frames(&self, index: u64) -> usize {
        let h = self.history_len as u64;
        let mut frames = 0;
        let mut j = index;
        while frames < h {
            frames += 1;
            if self.episode_starts[self.slot(j)] || j == self.begin {
                break;
            }
            j -= 1;
        }
        // at most history_len
        frames as usize
    }
}

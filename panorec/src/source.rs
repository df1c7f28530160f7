//! # Viewpoint sources

use crate::entity::Feature;
use crate::prelude::v1::*;
use bytemuck::{Pod, Zeroable};

/// RGBA colour structure.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct RGBA {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl RGBA {
    /// Convert from a slice containing `[r, g, b]` elements.
    pub fn from_rgb_slice(rgb: &[u8]) -> Self {
        Self {
            r: rgb[0],
            g: rgb[1],
            b: rgb[2],
            a: 255,
        }
    }

    /// Average a set of colours channel-wise.
    ///
    /// Returns the default (transparent black) colour on empty input.
    pub fn mean(colors: impl Iterator<Item = RGBA>) -> Self {
        let (cnt, sum) = colors.fold((0u32, [0u32; 4]), |(cnt, mut sum), c| {
            for (s, v) in sum.iter_mut().zip([c.r, c.g, c.b, c.a]) {
                *s += v as u32;
            }
            (cnt + 1, sum)
        });

        if cnt == 0 {
            return Self::default();
        }

        Self {
            r: (sum[0] / cnt) as u8,
            g: (sum[1] / cnt) as u8,
            b: (sum[2] / cnt) as u8,
            a: (sum[3] / cnt) as u8,
        }
    }
}

/// Cross-viewpoint match table.
///
/// Maps a `(feature, slot)` pair to the index of the matched feature in the local viewpoint
/// occupying `slot`. Slot `0` is the oldest viewpoint of the local window, the last slot is the
/// viewpoint captured right before the new one.
#[derive(Clone, Debug, Default)]
pub struct MatchTable {
    features: usize,
    slots: usize,
    matches: Vec<Option<usize>>,
}

impl MatchTable {
    /// Create an empty table (no matches at all).
    ///
    /// # Arguments
    ///
    /// * `features` - number of features in the new viewpoint.
    /// * `slots` - number of local viewpoints the new one was matched against.
    pub fn new(features: usize, slots: usize) -> Self {
        Self {
            features,
            slots,
            matches: vec![None; features * slots],
        }
    }

    /// Number of features of the new viewpoint.
    pub fn features(&self) -> usize {
        self.features
    }

    /// Number of local viewpoint slots.
    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Get the feature matched to `feature` in the viewpoint at `slot`.
    pub fn get(&self, feature: usize, slot: usize) -> Option<usize> {
        if slot >= self.slots {
            return None;
        }

        self.matches.get(feature * self.slots + slot).copied().flatten()
    }

    /// Set (or clear) a match.
    ///
    /// Out of range coordinates are rejected.
    pub fn set(&mut self, feature: usize, slot: usize, matched: Option<usize>) -> Result<()> {
        if slot >= self.slots {
            bail!("slot {} out of range ({} slots)", slot, self.slots);
        }

        if feature >= self.features {
            bail!("feature {} out of range ({} features)", feature, self.features);
        }

        self.matches[feature * self.slots + slot] = matched;

        Ok(())
    }

    /// Iterate all matches of a single feature.
    ///
    /// The resulting iterator yields `(slot, matched_feature)` entries.
    pub fn matches(&self, feature: usize) -> impl Iterator<Item = (usize, usize)> + '_ {
        (0..self.slots).filter_map(move |slot| self.get(feature, slot).map(|m| (slot, m)))
    }
}

/// Data of a single incoming image.
#[derive(Clone, Debug, Default)]
pub struct Frame {
    /// Ray observations in detection order.
    pub features: Vec<Feature>,
    /// Matches of `features` against the most recent viewpoints.
    pub matches: MatchTable,
}

/// Source of viewpoints.
///
/// Sources sit in front of the reconstruction. They may be backed by sparse feature matching,
/// dense flow, or recorded streams. Frames must be yielded in capture order.
pub trait ViewpointSource {
    /// Get the next frame of the stream.
    ///
    /// Returns `Ok(None)` once the stream is exhausted, and `Err` if the frame could not be
    /// produced.
    fn next(&mut self) -> Result<Option<Frame>>;

    /// Check whether there are more frames available.
    fn has_next(&self) -> bool;
}

/// In-memory viewpoint source.
#[derive(Default)]
pub struct VecSource {
    frames: std::collections::VecDeque<Frame>,
}

impl From<Vec<Frame>> for VecSource {
    fn from(frames: Vec<Frame>) -> Self {
        Self {
            frames: frames.into(),
        }
    }
}

impl ViewpointSource for VecSource {
    fn next(&mut self) -> Result<Option<Frame>> {
        Ok(self.frames.pop_front())
    }

    fn has_next(&self) -> bool {
        !self.frames.is_empty()
    }
}

//! # Sliding window control
//!
//! The window controller decides which part of the history takes part in a refinement pass.
//! While the history is short, everything is refined (`Boot`). Afterwards, every batch first
//! refines only the newest viewpoints (`Last`), and then settles the whole history (`Full`).

use crate::entity::{Model, StructureState};
use rayon::prelude::*;
use std::ops::Range;

/// Refinement mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Warm-up over the full history.
    Boot,
    /// Only the most recent `G` viewpoints.
    Last,
    /// Extended head. Refines the full history.
    Head,
    /// Settle pass over the full history.
    Full,
    /// Bulk mode. Poses are kept, only geometry is recomputed and filtered.
    Mass,
}

/// Index ranges and activity floor of a refinement pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WindowState {
    pub viewpoints: Range<usize>,
    pub transforms: Range<usize>,
    pub structures: Range<usize>,
    /// Structures below this state are skipped.
    pub floor: StructureState,
}

impl WindowState {
    /// Compute the window of a mode.
    ///
    /// # Arguments
    ///
    /// * `mode` - refinement mode.
    /// * `group` - window size `G`.
    /// * `viewpoints` - number of viewpoints in the history.
    /// * `structures` - number of structures.
    pub fn new(mode: Mode, group: usize, viewpoints: usize, structures: usize) -> Self {
        let transforms = viewpoints.saturating_sub(1);

        match mode {
            Mode::Last => {
                let start = viewpoints.saturating_sub(group);
                Self {
                    viewpoints: start..viewpoints,
                    transforms: start.min(transforms)..transforms,
                    structures: 0..structures,
                    floor: StructureState::Pioneer,
                }
            }
            Mode::Boot | Mode::Head | Mode::Full | Mode::Mass => Self {
                viewpoints: 0..viewpoints,
                transforms: 0..transforms,
                structures: 0..structures,
                floor: StructureState::Normal,
            },
        }
    }

    /// Check whether a structure state passes the activity floor.
    pub fn is_active(&self, state: StructureState) -> bool {
        state >= self.floor
    }
}

/// Mode state machine.
#[derive(Clone, Debug)]
pub struct WindowController {
    mode: Mode,
    group: usize,
}

impl WindowController {
    /// Create a new controller.
    ///
    /// # Arguments
    ///
    /// * `group` - window size `G`.
    /// * `mass` - run in bulk mode.
    pub fn new(group: usize, mass: bool) -> Self {
        Self {
            mode: if mass { Mode::Mass } else { Mode::Boot },
            group,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Advance the mode after a converged pass.
    ///
    /// `Boot` is kept until the history holds a full window.
    ///
    /// # Arguments
    ///
    /// * `viewpoints` - number of viewpoints in the history.
    pub fn advance(&mut self, viewpoints: usize) {
        self.mode = match self.mode {
            Mode::Boot if viewpoints < self.group => Mode::Boot,
            Mode::Boot | Mode::Full | Mode::Head => Mode::Last,
            Mode::Last => Mode::Full,
            Mode::Mass => Mode::Mass,
        };
    }

    /// Compute the window for the current mode.
    pub fn prepare_state(&self, model: &Model) -> WindowState {
        WindowState::new(
            self.mode,
            self.group,
            model.viewpoints.len(),
            model.structures.len(),
        )
    }

    /// Sort observations and assign activity states.
    ///
    /// A structure becomes a pioneer when its observations cover the whole window ending at the
    /// newest viewpoint. Structures turning into pioneers get their geometry reset, so that they
    /// are triangulated anew under fresh poses.
    pub fn prepare_structures(&self, model: &mut Model) {
        let group = self.group;
        let last = match model.viewpoints.len().checked_sub(1) {
            Some(last) => last,
            None => return,
        };

        model.structures.par_iter_mut().for_each(|s| {
            s.observations.sort_by_key(|o| o.viewpoint);

            if s.state == StructureState::Remove {
                return;
            }

            let obs = &s.observations;

            let pioneer = obs.len() >= group
                && obs[obs.len() - group..]
                    .iter()
                    .enumerate()
                    .all(|(i, o)| o.viewpoint + group == last + 1 + i);

            if pioneer {
                if s.state != StructureState::Pioneer {
                    s.observations.iter_mut().for_each(|o| o.reset());
                }
                s.state = StructureState::Pioneer;
            } else {
                s.state = StructureState::Normal;
            }
        });
    }

    /// Compact removed structures out of the model.
    ///
    /// Order of the remaining structures is preserved and feature bindings are rewritten to the
    /// new indices.
    ///
    /// Returns the number of structures removed.
    pub fn expunge_structures(model: &mut Model) -> usize {
        let before = model.structures.len();

        model
            .structures
            .retain(|s| s.state > StructureState::Remove);
        model.structures.shrink_to_fit();

        let removed = before - model.structures.len();

        if removed > 0 {
            let Model {
                viewpoints,
                structures,
                ..
            } = model;

            for (idx, s) in structures.iter().enumerate() {
                for o in &s.observations {
                    viewpoints[o.viewpoint].features[o.feature].structure = Some(idx);
                }
            }
        }

        removed
    }
}

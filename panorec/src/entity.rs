//! # Reconstruction entities
//!
//! Viewpoints, structures and transforms live in index-stable arenas inside [`Model`]. Entities
//! reference each other by index only:
//!
//! * a [`Feature`] names the structure it is bound to, if any;
//! * an [`Observation`] names the viewpoint and feature it was created from.
//!
//! Viewpoint and transform indices never change. Structure indices change only when removed
//! structures are compacted out, at which point every feature binding is rewritten.

use crate::prelude::v1::*;
use nalgebra as na;
use std::sync::Mutex;

/// Single ray observation in a viewpoint.
#[derive(Clone, Copy, Debug)]
pub struct Feature {
    /// Unit ray direction in the local frame of the viewpoint.
    pub direction: na::Vector3<f64>,
    /// Colour sampled at the observation.
    pub color: RGBA,
    /// Structure the feature is bound to.
    pub structure: Option<usize>,
}

impl Feature {
    /// Create a new unbound feature.
    ///
    /// # Arguments
    ///
    /// * `direction` - ray direction in the viewpoint frame. It gets normalised.
    /// * `color` - colour of the observation.
    pub fn new(direction: na::Vector3<f64>, color: RGBA) -> Self {
        Self {
            direction: direction.normalize(),
            color,
            structure: None,
        }
    }
}

/// Camera pose plus its ray observations.
#[derive(Clone, Debug)]
pub struct Viewpoint {
    /// Capture index. Equal to the position within [`Model::viewpoints`].
    pub index: usize,
    /// Absolute orientation (local to absolute frame).
    pub orientation: na::Matrix3<f64>,
    /// Absolute position.
    pub position: na::Vector3<f64>,
    /// Features in detection order.
    pub features: Vec<Feature>,
}

impl Viewpoint {
    pub fn new(index: usize, features: Vec<Feature>) -> Self {
        Self {
            index,
            orientation: na::Matrix3::identity(),
            position: na::Vector3::zeros(),
            features,
        }
    }
}

/// Activity state of a structure.
///
/// Ordering matters - the refinement only processes structures at or above a given floor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StructureState {
    Remove,
    Normal,
    Pioneer,
}

/// Binding of a feature to a structure, with its refinement state.
#[derive(Clone, Copy, Debug)]
pub struct Observation {
    /// Index of the owning viewpoint.
    pub viewpoint: usize,
    /// Index of the feature within the viewpoint.
    pub feature: usize,
    /// Unit ray direction, local frame.
    pub direction: na::Vector3<f64>,
    /// Colour of the feature.
    pub color: RGBA,
    /// Ray scaled by radius, local frame.
    pub model: na::Vector3<f64>,
    /// Ray rotated into the absolute frame.
    pub oriented: na::Vector3<f64>,
    /// Distance along the ray to the structure.
    pub radius: f64,
    /// Perpendicular residual of the ray, normalised by radius.
    pub disparity: f64,
}

impl Observation {
    /// Create a freshly bound observation.
    pub fn new(viewpoint: &Viewpoint, feature: usize) -> Self {
        let f = &viewpoint.features[feature];

        Self {
            viewpoint: viewpoint.index,
            feature,
            direction: f.direction,
            color: f.color,
            model: f.direction,
            oriented: viewpoint.orientation * f.direction,
            radius: 1.0,
            disparity: 0.0,
        }
    }

    /// Reset geometry, forcing re-triangulation.
    pub fn reset(&mut self) {
        self.radius = 1.0;
        self.disparity = 0.0;
    }
}

/// Reconstructed 3D point.
#[derive(Clone, Debug)]
pub struct Structure {
    pub position: na::Vector3<f64>,
    pub state: StructureState,
    /// Observations, sorted by viewpoint after every structure preparation.
    pub observations: Vec<Observation>,
}

impl Default for Structure {
    fn default() -> Self {
        Self {
            position: na::Vector3::zeros(),
            state: StructureState::Normal,
            observations: vec![],
        }
    }
}

impl Structure {
    /// Check whether the structure observes the given viewpoint.
    pub fn observes(&self, viewpoint: usize) -> bool {
        self.observations.iter().any(|o| o.viewpoint == viewpoint)
    }

    /// Average colour of all observations.
    pub fn color(&self) -> RGBA {
        RGBA::mean(self.observations.iter().map(|o| o.color))
    }
}

/// Per-pass accumulators of a transform.
///
/// Many structures contribute to the same transform concurrently, thus these live behind a
/// mutex in [`Transform`].
#[derive(Clone, Copy, Debug)]
pub struct Accumulator {
    pub first: na::Vector3<f64>,
    pub second: na::Vector3<f64>,
    pub count: usize,
    pub correlation: na::Matrix3<f64>,
}

impl Default for Accumulator {
    fn default() -> Self {
        Self {
            first: na::Vector3::zeros(),
            second: na::Vector3::zeros(),
            count: 0,
            correlation: na::Matrix3::zeros(),
        }
    }
}

/// Relative motion between viewpoints `i` and `i + 1`.
///
/// Solved motion maps models of viewpoint `i` onto models of viewpoint `i + 1`:
/// `second = rotation * first + translation`.
#[derive(Debug)]
pub struct Transform {
    accumulator: Mutex<Accumulator>,
    pub rotation: na::Matrix3<f64>,
    pub translation: na::Vector3<f64>,
    /// Translation of the previous iteration.
    pub previous: na::Vector3<f64>,
    /// Translation norm before scale normalisation.
    pub norm: f64,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            accumulator: Default::default(),
            rotation: na::Matrix3::identity(),
            translation: na::Vector3::zeros(),
            previous: na::Vector3::zeros(),
            norm: 0.0,
        }
    }
}

impl Transform {
    /// Lock the accumulators for concurrent contribution.
    pub fn lock(&self) -> Result<std::sync::MutexGuard<'_, Accumulator>> {
        self.accumulator
            .lock()
            .map_err(|_| anyhow!("transform accumulator poisoned"))
    }

    /// Access the accumulators exclusively.
    pub fn accumulator_mut(&mut self) -> Result<&mut Accumulator> {
        self.accumulator
            .get_mut()
            .map_err(|_| anyhow!("transform accumulator poisoned"))
    }

    /// Snapshot of the accumulators.
    pub fn accumulator(&self) -> Result<Accumulator> {
        self.lock().map(|a| *a)
    }

    /// Change of translation during the last iteration.
    pub fn error(&self) -> f64 {
        (self.previous - self.translation).norm()
    }
}

/// Structure graph together with the camera trajectory.
#[derive(Debug, Default)]
pub struct Model {
    pub viewpoints: Vec<Viewpoint>,
    pub structures: Vec<Structure>,
    pub transforms: Vec<Transform>,
}

impl Model {
    /// Append a new viewpoint and, if needed, the transform linking it to its predecessor.
    ///
    /// Returns the index of the new viewpoint.
    pub fn push_viewpoint(&mut self, features: Vec<Feature>) -> usize {
        let index = self.viewpoints.len();
        self.viewpoints.push(Viewpoint::new(index, features));

        if index > 0 {
            self.transforms.push(Transform::default());
        }

        index
    }

    /// Create a new structure without any observations.
    pub fn push_structure(&mut self) -> usize {
        self.structures.push(Structure::default());
        self.structures.len() - 1
    }

    /// Bind a feature to a structure.
    ///
    /// The feature must not be bound yet - binding a feature twice is an invariant violation.
    pub fn bind(&mut self, structure: usize, viewpoint: usize, feature: usize) -> Result<()> {
        let vp = self
            .viewpoints
            .get_mut(viewpoint)
            .ok_or_else(|| anyhow!("viewpoint {} does not exist", viewpoint))?;

        let f = vp
            .features
            .get_mut(feature)
            .ok_or_else(|| anyhow!("feature {} of viewpoint {} does not exist", feature, viewpoint))?;

        if let Some(bound) = f.structure {
            bail!(
                "feature {} of viewpoint {} is already bound to structure {}",
                feature,
                viewpoint,
                bound
            );
        }

        let s = self
            .structures
            .get_mut(structure)
            .ok_or_else(|| anyhow!("structure {} does not exist", structure))?;

        f.structure = Some(structure);
        s.observations.push(Observation::new(vp, feature));

        Ok(())
    }

    /// Clear structure bindings of the given features.
    pub fn unbind(&mut self, features: impl IntoIterator<Item = (usize, usize)>) {
        for (viewpoint, feature) in features {
            if let Some(f) = self
                .viewpoints
                .get_mut(viewpoint)
                .and_then(|vp| vp.features.get_mut(feature))
            {
                f.structure = None;
            }
        }
    }

    /// Number of structures that are not marked for removal.
    pub fn active_structures(&self) -> usize {
        self.structures
            .iter()
            .filter(|s| s.state > StructureState::Remove)
            .count()
    }
}

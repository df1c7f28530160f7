//! # Panoramic Reconstruction Library
//!
//! This library incrementally reconstructs a camera trajectory and a sparse cloud of 3D points
//! from a sequence of spherical images. Each new image is supplied as a set of ray observations
//! together with a table of matches against the most recent images, and the whole history is
//! refined as the images arrive.
//!
//! The easiest way to use the library is to import its prelude:
//!
//! ```
//! use panorec::prelude::v1::*;
//! ```
//!
//! You may need [`nalgebra`](https://crates.io/crates/nalgebra) to make use of the functionality.

pub mod aggregation;
pub mod camera;
pub mod entity;
pub mod export;
pub mod reconstruction;
pub mod refinement;
pub mod settings;
pub mod source;
pub mod utils;
pub mod window;

pub mod prelude {
    pub mod v1 {
        pub use crate::{
            camera::SphericalCamera,
            entity::{Feature, Model, Observation, Structure, StructureState, Transform, Viewpoint},
            export::{Exporter, OrientationRecord, PositionRecord, StructureRecord},
            reconstruction::Reconstruction,
            refinement::{Convergence, RefinementEngine},
            settings::Settings,
            source::{Frame, MatchTable, VecSource, ViewpointSource, RGBA},
            window::{Mode, WindowController, WindowState},
        };
        pub use anyhow::{anyhow, bail, Error, Result};
    }
}

//! # Model export
//!
//! Exporters receive the model after every batch. Records are flat so that they serialise into
//! plain whitespace or comma separated rows, with fields in declaration order.

use crate::entity::{Model, StructureState};
use crate::prelude::v1::*;

/// Receiver of reconstruction snapshots.
pub trait Exporter {
    /// Export the state of the model after a batch.
    ///
    /// # Arguments
    ///
    /// * `batch` - index of the batch, starting from 0.
    /// * `model` - model to export.
    fn export(&mut self, batch: usize, model: &Model) -> Result<()>;
}

/// Exporter that discards everything.
impl Exporter for () {
    fn export(&mut self, _: usize, _: &Model) -> Result<()> {
        Ok(())
    }
}

/// Structure position with its average colour.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
pub struct StructureRecord {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

/// Viewpoint position.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
pub struct PositionRecord {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Viewpoint position followed by its orientation matrix in row-major order.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
pub struct OrientationRecord {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub r00: f64,
    pub r01: f64,
    pub r02: f64,
    pub r10: f64,
    pub r11: f64,
    pub r12: f64,
    pub r20: f64,
    pub r21: f64,
    pub r22: f64,
}

/// Records of all structures not marked for removal.
pub fn structure_records(model: &Model) -> impl Iterator<Item = StructureRecord> + '_ {
    model
        .structures
        .iter()
        .filter(|s| s.state > StructureState::Remove)
        .map(|s| {
            let c = s.color();
            StructureRecord {
                x: s.position.x,
                y: s.position.y,
                z: s.position.z,
                r: c.r,
                g: c.g,
                b: c.b,
            }
        })
}

/// Records of all viewpoint positions, in capture order.
pub fn position_records(model: &Model) -> impl Iterator<Item = PositionRecord> + '_ {
    model.viewpoints.iter().map(|v| PositionRecord {
        x: v.position.x,
        y: v.position.y,
        z: v.position.z,
    })
}

/// Records of all viewpoint poses, in capture order.
pub fn orientation_records(model: &Model) -> impl Iterator<Item = OrientationRecord> + '_ {
    model.viewpoints.iter().map(|v| {
        let (p, o) = (v.position, v.orientation);
        OrientationRecord {
            x: p.x,
            y: p.y,
            z: p.z,
            r00: o[(0, 0)],
            r01: o[(0, 1)],
            r02: o[(0, 2)],
            r10: o[(1, 0)],
            r11: o[(1, 1)],
            r12: o[(1, 2)],
            r20: o[(2, 0)],
            r21: o[(2, 1)],
            r22: o[(2, 2)],
        }
    })
}

//! # Utility module

use anyhow::{bail, Result};
use nalgebra as na;

/// Determinant below which two rays are considered parallel.
pub const PARALLEL_EPS: f64 = 1e-12;

/// Triangulate the midpoint of closest approach of two rays.
///
/// Returns `None` if the rays are (nearly) parallel and there is no unique solution.
///
/// # Arguments
///
/// * `p1` - origin of the first ray.
/// * `d1` - direction of the first ray.
/// * `p2` - origin of the second ray.
/// * `d2` - direction of the second ray.
pub fn intersect_rays(
    p1: na::Vector3<f64>,
    d1: na::Vector3<f64>,
    p2: na::Vector3<f64>,
    d2: na::Vector3<f64>,
) -> Option<na::Vector3<f64>> {
    // Closest points are P1 + s * d1 and P2 + t * d2, where the segment between them is
    // perpendicular to both directions:
    //
    // (w + s * d1 - t * d2) . d1 = 0
    // (w + s * d1 - t * d2) . d2 = 0
    //
    // with w = P1 - P2. Solving the 2x2 system via dot products gives the expressions below.

    let w = p1 - p2;

    let a = d1.dot(&d1);
    let b = d1.dot(&d2);
    let c = d2.dot(&d2);
    let d = d1.dot(&w);
    let e = d2.dot(&w);

    let den = a * c - b * b;

    if den.abs() <= PARALLEL_EPS * a * c {
        return None;
    }

    let s = (b * e - c * d) / den;
    let t = (a * e - b * d) / den;

    Some(((p1 + d1 * s) + (p2 + d2 * t)) * 0.5)
}

/// Fail if any of the components is not finite.
///
/// # Arguments
///
/// * `what` - description of the value, used in the error.
/// * `values` - values to check.
pub fn ensure_finite<'a>(what: &str, values: impl IntoIterator<Item = &'a f64>) -> Result<()> {
    if values.into_iter().any(|v| !v.is_finite()) {
        bail!("non-finite value in {}", what);
    }
    Ok(())
}

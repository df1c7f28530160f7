//! # Camera abstraction

use crate::prelude::v1::*;
use nalgebra as na;
use std::f64::consts::{PI, TAU};

/// Equirectangular spherical camera
///
/// The sensor covers the full sphere. Horizontal pixel coordinates map linearly to azimuth in
/// `[0; 2π)`, vertical coordinates map linearly to elevation in `[-π/2; π/2]`.
#[derive(Clone, Copy, Debug)]
pub struct SphericalCamera {
    width: usize,
    height: usize,
}

impl SphericalCamera {
    /// Create a new camera
    ///
    /// # Arguments
    ///
    /// * `width` - image width in pixels.
    /// * `height` - image height in pixels. Must be at least 2, so that both poles are covered.
    pub fn new(width: usize, height: usize) -> Result<Self> {
        if width == 0 || height < 2 {
            bail!("invalid sensor size {}x{}", width, height);
        }

        Ok(Self { width, height })
    }

    /// Get width and height of the sensor.
    pub fn dim(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    /// Convert a pixel to a unit ray direction
    ///
    /// # Arguments
    ///
    /// * `pixel` - image-space coordinates of the observation.
    ///
    /// # Examples
    ///
    /// ```
    /// # use assert_approx_eq::assert_approx_eq;
    /// use panorec::camera::SphericalCamera;
    /// use nalgebra as na;
    ///
    /// let camera = SphericalCamera::new(400, 201).unwrap();
    ///
    /// // Quarter of the way across, on the equator.
    /// let ray = camera.ray(na::Point2::new(100.0, 100.0));
    ///
    /// assert_approx_eq!(ray.x, 0.0, 1e-9);
    /// assert_approx_eq!(ray.y, 1.0, 1e-9);
    /// assert_approx_eq!(ray.z, 0.0, 1e-9);
    /// ```
    pub fn ray(&self, pixel: na::Point2<f64>) -> na::Vector3<f64> {
        let azimuth = pixel.x / self.width as f64 * TAU;
        let elevation = (pixel.y / (self.height - 1) as f64 - 0.5) * PI;

        na::Vector3::new(
            elevation.cos() * azimuth.cos(),
            elevation.cos() * azimuth.sin(),
            elevation.sin(),
        )
    }

    /// Project a direction back into image space
    ///
    /// The direction does not need to be normalised. Zero vectors map to the image origin.
    ///
    /// # Arguments
    ///
    /// * `direction` - direction in the camera frame.
    pub fn project(&self, direction: na::Vector3<f64>) -> na::Point2<f64> {
        let norm = direction.norm();

        if norm == 0.0 {
            return na::Point2::origin();
        }

        let d = direction / norm;

        let azimuth = d.y.atan2(d.x).rem_euclid(TAU);
        let elevation = d.z.clamp(-1.0, 1.0).asin();

        na::Point2::new(
            azimuth / TAU * self.width as f64,
            (elevation / PI + 0.5) * (self.height - 1) as f64,
        )
    }
}

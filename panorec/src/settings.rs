//! # Reconstruction settings

use crate::prelude::v1::*;

/// Tunable parameters of the reconstruction.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Settings {
    /// Convergence tolerance on the change of the maximum translation error.
    pub tolerance: f64,
    /// Multiplier applied to disparity standard deviation when filtering outliers.
    pub error_disparity: f64,
    /// Lowest accepted radius.
    pub radial_min: f64,
    /// Highest accepted radius.
    pub radial_max: f64,
    /// Size of the active window (in viewpoints).
    pub group: usize,
    /// Number of most recent viewpoints new viewpoints are matched against.
    pub match_range: usize,
    /// Disparity threshold factor in bulk (MASS) mode.
    pub dense_disparity: f64,
    /// Hard cap on inner refinement iterations.
    pub max_iterations: usize,
    /// Run every batch in bulk (MASS) mode.
    pub mass: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            tolerance: 1e-5,
            error_disparity: 2.0,
            radial_min: 0.0,
            radial_max: 25.0,
            group: 3,
            match_range: 3,
            dense_disparity: 0.01,
            max_iterations: 2048,
            mass: false,
        }
    }
}

impl Settings {
    pub fn tolerance(self, tolerance: f64) -> Self {
        Self { tolerance, ..self }
    }

    pub fn error_disparity(self, error_disparity: f64) -> Self {
        Self {
            error_disparity,
            ..self
        }
    }

    pub fn radial_range(self, radial_min: f64, radial_max: f64) -> Self {
        Self {
            radial_min,
            radial_max,
            ..self
        }
    }

    pub fn group(self, group: usize) -> Self {
        Self { group, ..self }
    }

    pub fn match_range(self, match_range: usize) -> Self {
        Self {
            match_range,
            ..self
        }
    }

    pub fn dense_disparity(self, dense_disparity: f64) -> Self {
        Self {
            dense_disparity,
            ..self
        }
    }

    pub fn max_iterations(self, max_iterations: usize) -> Self {
        Self {
            max_iterations,
            ..self
        }
    }

    pub fn mass(self, mass: bool) -> Self {
        Self { mass, ..self }
    }

    /// Check that the settings describe a usable configuration.
    pub fn validate(&self) -> Result<()> {
        if self.group < 2 {
            bail!("window size must be at least 2, got {}", self.group);
        }

        if self.match_range == 0 {
            bail!("match range must be positive");
        }

        if !(self.tolerance > 0.0) {
            bail!("tolerance must be positive, got {}", self.tolerance);
        }

        if !(self.radial_min <= self.radial_max) {
            bail!(
                "invalid radial range [{}; {}]",
                self.radial_min,
                self.radial_max
            );
        }

        if self.max_iterations == 0 {
            bail!("iteration cap must be positive");
        }

        Ok(())
    }
}

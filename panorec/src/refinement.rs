//! # Iterative pose and structure refinement
//!
//! A single iteration alternates between estimating relative motions from the current geometry,
//! chaining them into absolute poses, and re-triangulating structures under the new poses:
//!
//! 1. models - rays scaled by their radii, in the local viewpoint frame;
//! 2. centroids and correlations of models shared by adjacent viewpoints;
//! 3. relative poses via orthogonal Procrustes alignment, with scale normalisation;
//! 4. absolute poses by chaining relative ones;
//! 5. oriented rays, structure positions, radii and disparities;
//! 6. radial and disparity outlier filtering.
//!
//! Every step is one data-parallel pass over structures or transforms. Steps consume aggregates
//! of the previous ones, so a step only starts once the previous one has finished.

use crate::entity::{Accumulator, Model, Observation, Structure, StructureState};
use crate::prelude::v1::*;
use crate::utils::{ensure_finite, intersect_rays};
use crate::window::{Mode, WindowState};
use log::*;
use nalgebra as na;
use rayon::prelude::*;
use std::f64::consts::TAU;
use std::ops::Range;

/// Mean translation norm below which scale normalisation is skipped.
const NORMALISE_EPS: f64 = 1e-9;

/// Radius below which a ray is considered to pass through its viewpoint.
const RADIUS_EPS: f64 = 1e-9;

/// Clamp a window range to a collection length.
fn clamp(range: &Range<usize>, len: usize) -> Range<usize> {
    range.start.min(len)..range.end.min(len)
}

fn active<'a>(
    structures: &'a [Structure],
    state: &'a WindowState,
) -> impl ParallelIterator<Item = &'a Structure> + 'a {
    structures[clamp(&state.structures, structures.len())]
        .par_iter()
        .filter(move |s| state.is_active(s.state))
}

fn active_mut<'a>(
    structures: &'a mut [Structure],
    state: &'a WindowState,
) -> impl ParallelIterator<Item = &'a mut Structure> + 'a {
    let range = clamp(&state.structures, structures.len());
    structures[range]
        .par_iter_mut()
        .filter(move |s| state.is_active(s.state))
}

fn in_range<'a>(
    observations: &'a [Observation],
    state: &'a WindowState,
) -> impl Iterator<Item = &'a Observation> + 'a {
    observations
        .iter()
        .filter(move |o| state.viewpoints.contains(&o.viewpoint))
}

fn in_range_mut<'a>(
    observations: &'a mut [Observation],
    state: &'a WindowState,
) -> impl Iterator<Item = &'a mut Observation> + 'a {
    observations
        .iter_mut()
        .filter(move |o| state.viewpoints.contains(&o.viewpoint))
}

/// Pairs of observations on temporally adjacent viewpoints, both inside the window.
///
/// The transform linking the pair has the index of the first observation's viewpoint.
fn adjacent<'a>(
    structure: &'a Structure,
    state: &'a WindowState,
) -> impl Iterator<Item = (&'a Observation, &'a Observation)> + 'a {
    structure.observations.windows(2).filter_map(move |w| {
        let (a, b) = (&w[0], &w[1]);
        (a.viewpoint + 1 == b.viewpoint
            && state.transforms.contains(&a.viewpoint)
            && state.viewpoints.contains(&a.viewpoint)
            && state.viewpoints.contains(&b.viewpoint))
        .then(|| (a, b))
    })
}

/// Scale rays by their radii.
pub fn compute_models(model: &mut Model, state: &WindowState) {
    active_mut(&mut model.structures, state).for_each(|s| {
        for o in in_range_mut(&mut s.observations, state) {
            o.model = o.direction * o.radius;
        }
    });
}

/// Accumulate and average centroids of adjacent models per transform.
pub fn compute_centroids(model: &mut Model, state: &WindowState) -> Result<()> {
    let range = clamp(&state.transforms, model.transforms.len());

    model.transforms[range.clone()]
        .par_iter_mut()
        .try_for_each(|t| {
            *t.accumulator_mut()? = Accumulator::default();
            Ok::<_, Error>(())
        })?;

    let transforms = &model.transforms;

    active(&model.structures, state).try_for_each(|s| {
        for (a, b) in adjacent(s, state) {
            let mut acc = transforms[a.viewpoint].lock()?;
            acc.first += a.model;
            acc.second += b.model;
            acc.count += 1;
        }
        Ok::<_, Error>(())
    })?;

    model.transforms[range].par_iter_mut().try_for_each(|t| {
        let acc = t.accumulator_mut()?;
        if acc.count > 0 {
            let cnt = acc.count as f64;
            acc.first /= cnt;
            acc.second /= cnt;
        }
        Ok(())
    })
}

/// Accumulate cross-covariance of centred adjacent models per transform.
///
/// Centroids must have been computed first.
pub fn compute_correlations(model: &mut Model, state: &WindowState) -> Result<()> {
    let transforms = &model.transforms;

    active(&model.structures, state).try_for_each(|s| {
        for (a, b) in adjacent(s, state) {
            let mut acc = transforms[a.viewpoint].lock()?;
            let outer = (a.model - acc.first) * (b.model - acc.second).transpose();
            acc.correlation += outer;
        }
        Ok(())
    })
}

/// Solve the rigid motion of every transform in the window.
///
/// Rotation is the orthogonal Procrustes solution `V * U^T` of the correlation `U * S * V^T`.
/// Reflections are corrected by negating the third column of `V`. Transforms without any
/// contributions keep their previous solution.
pub fn compute_poses(model: &mut Model, state: &WindowState) -> Result<()> {
    let range = clamp(&state.transforms, model.transforms.len());
    let start = range.start;

    model.transforms[range]
        .par_iter_mut()
        .enumerate()
        .try_for_each(|(i, t)| {
            let acc = *t.accumulator_mut()?;

            if acc.count == 0 {
                debug!("transform {} has no contributions", start + i);
                t.previous = t.translation;
                return Ok(());
            }

            ensure_finite(
                "transform accumulators",
                acc.correlation
                    .iter()
                    .chain(acc.first.iter())
                    .chain(acc.second.iter()),
            )?;

            let svd = acc.correlation.svd(true, true);
            let u = svd
                .u
                .ok_or_else(|| anyhow!("failed to decompose correlation {}", start + i))?;
            let mut v = svd
                .v_t
                .ok_or_else(|| anyhow!("failed to decompose correlation {}", start + i))?
                .transpose();

            let mut rotation = v * u.transpose();

            if rotation.determinant() < 0.0 {
                v.column_mut(2).neg_mut();
                rotation = v * u.transpose();
            }

            let translation = acc.second - rotation * acc.first;

            ensure_finite("transform", rotation.iter().chain(translation.iter()))?;

            t.previous = t.translation;
            t.rotation = rotation;
            t.translation = translation;

            Ok(())
        })
}

/// Divide translations by their mean norm over the window.
pub fn compute_normalise_poses(model: &mut Model, state: &WindowState) {
    let range = clamp(&state.transforms, model.transforms.len());

    if range.is_empty() {
        return;
    }

    let transforms = &mut model.transforms[range];

    let mean = transforms
        .iter()
        .map(|t| t.translation.norm())
        .sum::<f64>()
        / transforms.len() as f64;

    for t in transforms {
        t.norm = t.translation.norm();
        if mean > NORMALISE_EPS {
            t.translation /= mean;
        }
    }
}

/// Chain relative motions into absolute viewpoint poses.
pub fn compute_frames(model: &mut Model, state: &WindowState) -> Result<()> {
    let range = clamp(&state.transforms, model.transforms.len());

    for i in range {
        let (orientation, position) = {
            let vp = &model.viewpoints[i];
            let t = &model.transforms[i];
            let orientation = vp.orientation * t.rotation.transpose();
            (orientation, vp.position - orientation * t.translation)
        };

        ensure_finite(
            "viewpoint pose",
            orientation.iter().chain(position.iter()),
        )?;

        let next = &mut model.viewpoints[i + 1];
        next.orientation = orientation;
        next.position = position;
    }

    Ok(())
}

/// Rotate rays into the absolute frame.
pub fn compute_oriented(model: &mut Model, state: &WindowState) {
    let viewpoints = &model.viewpoints;

    active_mut(&mut model.structures, state).for_each(|s| {
        for o in in_range_mut(&mut s.observations, state) {
            o.oriented = viewpoints[o.viewpoint].orientation * o.direction;
        }
    });
}

/// Triangulate structures as the mean of pairwise ray intersections.
///
/// Structures without a single non-parallel pair of rays keep their position.
pub fn compute_optimals(model: &mut Model, state: &WindowState) -> Result<()> {
    let viewpoints = &model.viewpoints;

    active_mut(&mut model.structures, state).try_for_each(|s| {
        let rays = in_range(&s.observations, state)
            .map(|o| (viewpoints[o.viewpoint].position, o.oriented))
            .collect::<Vec<_>>();

        let mut sum = na::Vector3::zeros();
        let mut cnt = 0usize;

        for (i, &(p1, d1)) in rays.iter().enumerate() {
            for &(p2, d2) in &rays[i + 1..] {
                if let Some(x) = intersect_rays(p1, d1, p2, d2) {
                    sum += x;
                    cnt += 1;
                }
            }
        }

        if cnt > 0 {
            let position = sum / cnt as f64;
            ensure_finite("structure position", position.iter())?;
            s.position = position;
        }

        Ok(())
    })
}

/// Compute distance along each ray and its normalised perpendicular residual.
pub fn compute_radii(model: &mut Model, state: &WindowState) {
    let viewpoints = &model.viewpoints;

    active_mut(&mut model.structures, state).for_each(|s| {
        let position = s.position;

        for o in in_range_mut(&mut s.observations, state) {
            let delta = position - viewpoints[o.viewpoint].position;
            o.radius = o.oriented.dot(&delta);

            let residual = (delta - o.oriented * o.radius).norm();

            o.disparity = if o.radius.abs() > RADIUS_EPS {
                residual / o.radius
            } else if residual > RADIUS_EPS {
                f64::INFINITY
            } else {
                0.0
            };
        }
    });
}

/// Disparity distribution over the window.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DisparityStatistics {
    pub count: usize,
    pub mean: f64,
    /// Standard deviation with Bessel's correction.
    pub std: f64,
}

/// Compute mean and standard deviation of finite disparities.
///
/// Returns `None` when fewer than 2 samples exist, since the deviation is undefined then.
pub fn compute_disparity_statistics(
    model: &Model,
    state: &WindowState,
) -> Option<DisparityStatistics> {
    let disparities = |s: &Structure| {
        in_range(&s.observations, state)
            .map(|o| o.disparity)
            .filter(|d| d.is_finite())
            .collect::<Vec<_>>()
    };

    let (sum, count) = active(&model.structures, state)
        .map(|s| {
            let d = disparities(s);
            (d.iter().sum::<f64>(), d.len())
        })
        .reduce(|| (0.0, 0), |a, b| (a.0 + b.0, a.1 + b.1));

    if count <= 1 {
        return None;
    }

    let mean = sum / count as f64;

    let squares = active(&model.structures, state)
        .map(|s| {
            disparities(s)
                .iter()
                .map(|d| (d - mean) * (d - mean))
                .sum::<f64>()
        })
        .sum::<f64>();

    Some(DisparityStatistics {
        count,
        mean,
        std: (squares / (count - 1) as f64).sqrt(),
    })
}

/// Drop in-window observations matching `reject`.
///
/// Structures left with fewer than 2 observations are marked for removal and lose all of them.
///
/// Returns `(viewpoint, feature)` handles of every dropped observation.
fn filter_structure(
    s: &mut Structure,
    state: &WindowState,
    reject: impl Fn(&Observation) -> bool,
) -> Vec<(usize, usize)> {
    let mut removed = vec![];

    s.observations.retain(|o| {
        if state.viewpoints.contains(&o.viewpoint) && reject(o) {
            removed.push((o.viewpoint, o.feature));
            false
        } else {
            true
        }
    });

    if s.observations.len() < 2 {
        s.state = StructureState::Remove;
        removed.extend(s.observations.drain(..).map(|o| (o.viewpoint, o.feature)));
    }

    removed
}

fn filter(
    model: &mut Model,
    state: &WindowState,
    reject: impl Fn(&Observation) -> bool + Sync,
) -> usize {
    let removed = active_mut(&mut model.structures, state)
        .flat_map(|s| filter_structure(s, state, &reject))
        .collect::<Vec<_>>();

    let cnt = removed.len();
    model.unbind(removed);
    cnt
}

/// Unbind observations with radius outside `[min; max]`.
///
/// Returns the number of unbound features.
pub fn filter_radial_range(model: &mut Model, state: &WindowState, min: f64, max: f64) -> usize {
    filter(model, state, |o| !(min..=max).contains(&o.radius))
}

/// Unbind observations with disparity above `threshold`.
///
/// Returns the number of unbound features.
pub fn filter_disparity(model: &mut Model, state: &WindowState, threshold: f64) -> usize {
    filter(model, state, |o| o.disparity > threshold)
}

/// Largest translation change of the last iteration within the window.
pub fn translation_error(model: &Model, state: &WindowState) -> f64 {
    model.transforms[clamp(&state.transforms, model.transforms.len())]
        .iter()
        .map(|t| t.error())
        .fold(0.0, f64::max)
}

/// Outcome of a refinement pass.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Convergence {
    /// Number of inner iterations performed.
    pub iterations: usize,
    /// Final translation error.
    pub error: f64,
    /// True if the iteration cap was hit.
    pub capped: bool,
}

/// Alternating pose and structure estimator.
#[derive(Clone, Debug)]
pub struct RefinementEngine {
    settings: Settings,
    /// Translation error of the previous iteration, kept across passes.
    last_error: f64,
}

impl RefinementEngine {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            last_error: 0.0,
        }
    }

    pub fn last_error(&self) -> f64 {
        self.last_error
    }

    /// Refine the window until convergence.
    ///
    /// Bulk mode performs a single iteration.
    ///
    /// # Arguments
    ///
    /// * `model` - model to refine.
    /// * `state` - window to refine over.
    /// * `mode` - refinement mode.
    pub fn refine(
        &mut self,
        model: &mut Model,
        state: &WindowState,
        mode: Mode,
    ) -> Result<Convergence> {
        if mode == Mode::Last {
            if let Some(first) = model.viewpoints.first_mut() {
                first.orientation = na::Matrix3::identity();
                first.position = na::Vector3::zeros();
            }
        }

        let mut iterations = 0;

        loop {
            iterations += 1;

            self.iterate(model, state, mode)?;

            if mode == Mode::Mass {
                return Ok(Convergence {
                    iterations,
                    error: 0.0,
                    capped: false,
                });
            }

            let error = translation_error(model, state);
            let change = (error - self.last_error).abs();
            self.last_error = error;

            trace!("{:?} iteration {}: error {}", mode, iterations, error);

            if change < self.settings.tolerance {
                return Ok(Convergence {
                    iterations,
                    error,
                    capped: false,
                });
            }

            if iterations >= self.settings.max_iterations {
                warn!(
                    "{:?} refinement did not converge in {} iterations (error {})",
                    mode, iterations, error
                );
                return Ok(Convergence {
                    iterations,
                    error,
                    capped: true,
                });
            }
        }
    }

    /// Perform a single refinement iteration.
    pub fn iterate(&mut self, model: &mut Model, state: &WindowState, mode: Mode) -> Result<()> {
        if mode != Mode::Mass {
            compute_models(model, state);
            compute_centroids(model, state)?;
            compute_correlations(model, state)?;
            compute_poses(model, state)?;
            compute_normalise_poses(model, state);
            compute_frames(model, state)?;
        }

        compute_oriented(model, state);
        compute_optimals(model, state)?;
        compute_radii(model, state);

        let stats = compute_disparity_statistics(model, state);

        let radial = filter_radial_range(
            model,
            state,
            self.settings.radial_min,
            self.settings.radial_max,
        );

        let threshold = match mode {
            Mode::Mass => Some(TAU * self.settings.dense_disparity),
            _ => stats.map(|s| s.std * self.settings.error_disparity),
        };

        let disparity = threshold
            .map(|threshold| filter_disparity(model, state, threshold))
            .unwrap_or_default();

        trace!(
            "filtered {} radial and {} disparity outliers ({:?})",
            radial,
            disparity,
            stats
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Feature;
    use assert_approx_eq::assert_approx_eq;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    /// Build a model observing `points` from the given poses, with poses set to ground truth.
    fn scene(
        poses: &[(na::Matrix3<f64>, na::Vector3<f64>)],
        points: &[na::Vector3<f64>],
    ) -> Model {
        let mut model = Model::default();

        for &(orientation, position) in poses {
            let features = points
                .iter()
                .map(|x| Feature::new(orientation.transpose() * (x - position), RGBA::default()))
                .collect();
            let vp = model.push_viewpoint(features);
            model.viewpoints[vp].orientation = orientation;
            model.viewpoints[vp].position = position;
        }

        for i in 0..points.len() {
            let s = model.push_structure();
            for vp in 0..poses.len() {
                model.bind(s, vp, i).unwrap();
            }
        }

        model
    }

    fn full(model: &Model) -> WindowState {
        WindowState::new(
            Mode::Full,
            3,
            model.viewpoints.len(),
            model.structures.len(),
        )
    }

    fn random_points(rng: &mut StdRng, cnt: usize) -> Vec<na::Vector3<f64>> {
        (0..cnt)
            .map(|_| {
                na::Vector3::new(
                    rng.gen_range(-3.0..3.0),
                    rng.gen_range(-3.0..3.0),
                    rng.gen_range(-3.0..3.0),
                )
            })
            .collect()
    }

    fn assert_rotation(r: &na::Matrix3<f64>) {
        assert!(
            (r * r.transpose() - na::Matrix3::identity()).norm() < 1e-9,
            "not orthogonal: {}",
            r
        );
        assert_approx_eq!(r.determinant(), 1.0, 1e-9);
    }

    /// Two viewpoints with models set directly, where `second = f(first)`.
    fn model_pairs(
        rng: &mut StdRng,
        cnt: usize,
        mut f: impl FnMut(na::Vector3<f64>) -> na::Vector3<f64>,
    ) -> Model {
        let points = random_points(rng, cnt);
        let mut model = scene(
            &[
                (na::Matrix3::identity(), na::Vector3::zeros()),
                (na::Matrix3::identity(), na::Vector3::zeros()),
            ],
            &points,
        );

        for (s, p) in model.structures.iter_mut().zip(&points) {
            s.observations[0].model = *p;
            s.observations[1].model = f(*p);
        }

        model
    }

    fn solve(model: &mut Model) {
        let state = full(model);
        compute_centroids(model, &state).unwrap();
        compute_correlations(model, &state).unwrap();
        compute_poses(model, &state).unwrap();
    }

    #[test]
    fn procrustes_recovers_motion() {
        let rng = &mut StdRng::seed_from_u64(1);

        let rotation = na::Rotation3::from_euler_angles(0.3, -0.2, 1.1).into_inner();
        let translation = na::Vector3::new(0.4, -1.0, 0.25);

        let mut model = model_pairs(rng, 30, |p| rotation * p + translation);
        solve(&mut model);

        let t = &model.transforms[0];
        assert_rotation(&t.rotation);
        assert!((t.rotation - rotation).norm() < 1e-9);
        assert!((t.translation - translation).norm() < 1e-9);
        assert_eq!(t.accumulator().unwrap().count, 30);
    }

    #[test]
    fn procrustes_corrects_reflection() {
        let rng = &mut StdRng::seed_from_u64(2);

        let mirror = na::Matrix3::from_diagonal(&na::Vector3::new(1.0, 1.0, -1.0));

        let mut model = model_pairs(rng, 30, |p| mirror * p);
        solve(&mut model);

        assert_rotation(&model.transforms[0].rotation);
    }

    #[test]
    fn poses_are_rotations() {
        let rng = &mut StdRng::seed_from_u64(3);

        for _ in 0..20 {
            let noise = random_points(rng, 30);
            let mut i = 0;
            let mut model = model_pairs(rng, 30, |p| {
                i += 1;
                p * 0.5 + noise[i - 1]
            });
            solve(&mut model);
            assert_rotation(&model.transforms[0].rotation);
        }
    }

    #[test]
    fn non_finite_models_fail() {
        let rng = &mut StdRng::seed_from_u64(4);

        let mut model = model_pairs(rng, 5, |p| p);
        model.structures[2].observations[1].model.x = f64::NAN;

        let state = full(&model);
        compute_centroids(&mut model, &state).unwrap();
        compute_correlations(&mut model, &state).unwrap();
        assert!(compute_poses(&mut model, &state).is_err());
    }

    #[test]
    fn two_ray_triangulation() {
        let target = na::Vector3::new(0.5, 2.0, 0.3);

        let mut model = scene(
            &[
                (na::Matrix3::identity(), na::Vector3::zeros()),
                (na::Matrix3::identity(), na::Vector3::new(1.0, 0.0, 0.0)),
            ],
            &[target],
        );

        let state = full(&model);

        compute_models(&mut model, &state);
        compute_oriented(&mut model, &state);
        compute_radii(&mut model, &state);
        compute_optimals(&mut model, &state).unwrap();

        assert!((model.structures[0].position - target).norm() < 1e-9);

        compute_radii(&mut model, &state);

        for o in &model.structures[0].observations {
            let expected = (target - model.viewpoints[o.viewpoint].position).norm();
            assert_approx_eq!(o.radius, expected, 1e-9);
            assert!(o.disparity.abs() < 1e-9);
        }
    }

    #[test]
    fn rotated_viewpoints_triangulate() {
        let rng = &mut StdRng::seed_from_u64(5);

        let poses = [
            (na::Matrix3::identity(), na::Vector3::zeros()),
            (
                na::Rotation3::from_euler_angles(0.1, 0.4, -0.3).into_inner(),
                na::Vector3::new(0.8, 0.1, 0.0),
            ),
            (
                na::Rotation3::from_euler_angles(-0.2, 0.0, 0.7).into_inner(),
                na::Vector3::new(1.5, -0.3, 0.2),
            ),
        ];

        let points = random_points(rng, 10)
            .into_iter()
            .map(|p| p + na::Vector3::new(0.0, 0.0, 8.0))
            .collect::<Vec<_>>();

        let mut model = scene(&poses, &points);
        let state = full(&model);

        compute_oriented(&mut model, &state);
        compute_optimals(&mut model, &state).unwrap();

        for (s, p) in model.structures.iter().zip(&points) {
            assert!((s.position - p).norm() < 1e-9, "{} vs {}", s.position, p);
        }
    }

    #[test]
    fn static_scene_converges_immediately() {
        let directions = [
            na::Vector3::new(1.0, 0.2, 0.1),
            na::Vector3::new(-0.3, 1.0, 0.4),
            na::Vector3::new(0.1, -0.5, 1.0),
            na::Vector3::new(-1.0, -0.7, -0.2),
            na::Vector3::new(0.6, 0.3, -1.0),
        ];

        let identity = (na::Matrix3::identity(), na::Vector3::zeros());
        let mut model = scene(&[identity, identity, identity], &directions);
        let state = full(&model);

        let mut engine = RefinementEngine::new(Settings::default());
        let convergence = engine.refine(&mut model, &state, Mode::Boot).unwrap();

        assert_eq!(convergence.iterations, 1);
        assert!(!convergence.capped);
        assert_eq!(model.transforms.len(), 2);

        for t in &model.transforms {
            assert_rotation(&t.rotation);
            assert!((t.rotation - na::Matrix3::identity()).norm() < 1e-9);
            assert!(t.translation.norm() < 1e-9);
        }
    }

    #[test]
    fn iteration_cap() {
        let rng = &mut StdRng::seed_from_u64(6);

        let poses = [
            (na::Matrix3::identity(), na::Vector3::zeros()),
            (na::Matrix3::identity(), na::Vector3::new(1.0, 0.0, 0.0)),
        ];

        let points = random_points(rng, 12)
            .into_iter()
            .map(|p| p + na::Vector3::new(0.0, 6.0, 0.0))
            .collect::<Vec<_>>();

        let mut model = scene(&poses, &points);
        let state = full(&model);

        let mut engine = RefinementEngine::new(Settings::default().tolerance(1e-300).max_iterations(1));
        let convergence = engine.refine(&mut model, &state, Mode::Boot).unwrap();

        assert_eq!(convergence.iterations, 1);
        assert!(convergence.capped);
    }

    #[test]
    fn mass_keeps_poses() {
        let rng = &mut StdRng::seed_from_u64(7);

        let poses = [
            (na::Matrix3::identity(), na::Vector3::zeros()),
            (
                na::Rotation3::from_euler_angles(0.0, 0.0, 0.5).into_inner(),
                na::Vector3::new(1.0, 0.0, 0.0),
            ),
        ];

        let points = random_points(rng, 8)
            .into_iter()
            .map(|p| p + na::Vector3::new(0.0, 0.0, 6.0))
            .collect::<Vec<_>>();

        let mut model = scene(&poses, &points);
        let state = WindowState::new(Mode::Mass, 3, 2, points.len());

        let mut engine = RefinementEngine::new(Settings::default().mass(true));
        let convergence = engine.refine(&mut model, &state, Mode::Mass).unwrap();

        assert_eq!(convergence.iterations, 1);
        assert_eq!(model.viewpoints[1].position, poses[1].1);
        assert_eq!(model.viewpoints[1].orientation, poses[1].0);

        for (s, p) in model.structures.iter().zip(&points) {
            assert_eq!(s.state, StructureState::Normal);
            assert!((s.position - p).norm() < 1e-9);
        }
    }

    #[test]
    fn statistics_use_bessel() {
        let mut model = scene(
            &[
                (na::Matrix3::identity(), na::Vector3::zeros()),
                (na::Matrix3::identity(), na::Vector3::zeros()),
            ],
            &[na::Vector3::new(1.0, 0.0, 0.0), na::Vector3::new(0.0, 1.0, 0.0)],
        );

        let values = [1.0, 2.0, 3.0, 6.0];

        for (o, v) in model
            .structures
            .iter_mut()
            .flat_map(|s| s.observations.iter_mut())
            .zip(values)
        {
            o.disparity = v;
        }

        let stats = compute_disparity_statistics(&model, &full(&model)).unwrap();

        assert_eq!(stats.count, 4);
        assert_approx_eq!(stats.mean, 3.0, 1e-12);
        // Squared deviations 4 + 1 + 0 + 9 = 14, over n - 1 = 3.
        assert_approx_eq!(stats.std, (14.0f64 / 3.0).sqrt(), 1e-12);
    }

    #[test]
    fn statistics_need_two_samples() {
        let mut model = scene(
            &[
                (na::Matrix3::identity(), na::Vector3::zeros()),
                (na::Matrix3::identity(), na::Vector3::zeros()),
            ],
            &[na::Vector3::new(1.0, 0.0, 0.0)],
        );

        // Only viewpoint 1 is inside the window.
        let mut state = full(&model);
        state.viewpoints = 1..2;

        assert_eq!(compute_disparity_statistics(&model, &state), None);

        model.structures[0].state = StructureState::Remove;
        assert_eq!(compute_disparity_statistics(&model, &full(&model)), None);
    }

    #[test]
    fn radial_filter_removes_structures() {
        let mut model = scene(
            &[
                (na::Matrix3::identity(), na::Vector3::zeros()),
                (na::Matrix3::identity(), na::Vector3::zeros()),
                (na::Matrix3::identity(), na::Vector3::zeros()),
            ],
            &[na::Vector3::new(1.0, 0.0, 0.0), na::Vector3::new(0.0, 1.0, 0.0)],
        );

        // Structure 0 loses one observation, structure 1 loses two and collapses.
        model.structures[0].observations[1].radius = 30.0;
        model.structures[1].observations[0].radius = -1.0;
        model.structures[1].observations[2].radius = 25.5;

        let state = full(&model);
        let removed = filter_radial_range(&mut model, &state, 0.0, 25.0);

        assert_eq!(removed, 4);

        let s0 = &model.structures[0];
        assert_eq!(s0.state, StructureState::Normal);
        assert_eq!(
            s0.observations.iter().map(|o| o.viewpoint).collect::<Vec<_>>(),
            vec![0, 2]
        );
        assert_eq!(model.viewpoints[1].features[0].structure, None);

        let s1 = &model.structures[1];
        assert_eq!(s1.state, StructureState::Remove);
        assert!(s1.observations.is_empty());
        assert!(model
            .viewpoints
            .iter()
            .all(|v| v.features[1].structure.is_none()));

        for s in &model.structures {
            assert!(
                s.observations.len() >= 2
                    || (s.state == StructureState::Remove && s.observations.is_empty())
            );
        }
    }

    #[test]
    fn disparity_filter_respects_window() {
        let mut model = scene(
            &[
                (na::Matrix3::identity(), na::Vector3::zeros()),
                (na::Matrix3::identity(), na::Vector3::zeros()),
                (na::Matrix3::identity(), na::Vector3::zeros()),
            ],
            &[na::Vector3::new(1.0, 0.0, 0.0)],
        );

        for o in &mut model.structures[0].observations {
            o.disparity = 0.5;
        }

        let mut state = WindowState::new(Mode::Last, 2, 3, 1);
        state.floor = StructureState::Normal;

        // Only viewpoints 1 and 2 are inside the window.
        assert_eq!(filter_disparity(&mut model, &state, 0.6), 0);
        assert_eq!(filter_disparity(&mut model, &state, 0.4), 3);

        assert_eq!(model.structures[0].state, StructureState::Remove);
        assert!(model.viewpoints.iter().all(|v| v.features[0].structure.is_none()));
    }

    #[test]
    fn inactive_structures_untouched() {
        let mut model = scene(
            &[
                (na::Matrix3::identity(), na::Vector3::zeros()),
                (na::Matrix3::identity(), na::Vector3::new(1.0, 0.0, 0.0)),
            ],
            &[na::Vector3::new(0.5, 2.0, 0.3)],
        );

        let state = WindowState::new(Mode::Last, 2, 2, 1);
        assert_eq!(state.floor, StructureState::Pioneer);

        compute_oriented(&mut model, &state);
        compute_optimals(&mut model, &state).unwrap();

        assert_eq!(model.structures[0].position, na::Vector3::zeros());
    }

    #[test]
    fn chaining_follows_relative_motion() {
        let identity = (na::Matrix3::identity(), na::Vector3::zeros());
        let mut model = scene(
            &[identity, identity, identity],
            &[na::Vector3::new(1.0, 2.0, 3.0)],
        );

        let rotations = [
            na::Rotation3::from_euler_angles(0.0, 0.0, 0.3).into_inner(),
            na::Rotation3::from_euler_angles(-0.2, 0.1, 0.0).into_inner(),
        ];
        let translations = [
            na::Vector3::new(2.0, 0.0, 0.0),
            na::Vector3::new(0.0, 4.0, 0.0),
        ];

        for (t, (r, tr)) in model
            .transforms
            .iter_mut()
            .zip(rotations.iter().zip(&translations))
        {
            t.rotation = *r;
            t.translation = *tr;
        }

        let state = full(&model);

        compute_normalise_poses(&mut model, &state);

        // Norms 2 and 4 average to 3.
        assert_approx_eq!(model.transforms[0].norm, 2.0, 1e-12);
        assert_approx_eq!(model.transforms[1].norm, 4.0, 1e-12);
        assert!(
            (model.transforms[0].translation - na::Vector3::new(2.0 / 3.0, 0.0, 0.0)).norm()
                < 1e-12
        );

        let mean = model
            .transforms
            .iter()
            .map(|t| t.translation.norm())
            .sum::<f64>()
            / 2.0;
        assert_approx_eq!(mean, 1.0, 1e-12);

        compute_frames(&mut model, &state).unwrap();

        let first = &model.viewpoints[1];
        assert!((first.orientation - rotations[0].transpose()).norm() < 1e-12);
        assert!(
            (first.position + rotations[0].transpose() * model.transforms[0].translation).norm()
                < 1e-12
        );

        // Local coordinates of any point must satisfy second = rotation * first + translation.
        let local = |vp: &Viewpoint, x: na::Vector3<f64>| {
            vp.orientation.transpose() * (x - vp.position)
        };

        for x in [na::Vector3::new(1.0, 2.0, 3.0), na::Vector3::new(-4.0, 0.5, 7.0)] {
            for (i, t) in model.transforms.iter().enumerate() {
                let a = local(&model.viewpoints[i], x);
                let b = local(&model.viewpoints[i + 1], x);
                assert!((b - (t.rotation * a + t.translation)).norm() < 1e-12);
            }
        }

        for v in &model.viewpoints {
            assert_rotation(&v.orientation);
        }
    }

    #[test]
    fn normalisation_respects_window() {
        let identity = (na::Matrix3::identity(), na::Vector3::zeros());
        let mut model = scene(
            &[identity, identity, identity],
            &[na::Vector3::new(1.0, 0.0, 0.0)],
        );

        model.transforms[0].translation = na::Vector3::new(0.0, 0.0, 5.0);
        model.transforms[1].translation = na::Vector3::new(0.0, 0.0, 3.0);

        // Only the last transform is inside the window.
        let state = WindowState::new(Mode::Last, 2, 3, 1);
        compute_normalise_poses(&mut model, &state);

        assert_eq!(model.transforms[0].translation, na::Vector3::new(0.0, 0.0, 5.0));
        assert_approx_eq!(model.transforms[1].translation.z, 1.0, 1e-12);
        assert_approx_eq!(model.transforms[1].norm, 3.0, 1e-12);
    }

    #[test]
    fn normalisation_skips_zero_baseline() {
        let identity = (na::Matrix3::identity(), na::Vector3::zeros());
        let mut model = scene(
            &[identity, identity, identity],
            &[na::Vector3::new(1.0, 0.0, 0.0)],
        );

        let state = full(&model);
        compute_normalise_poses(&mut model, &state);

        for t in &model.transforms {
            assert_eq!(t.translation, na::Vector3::zeros());
            assert_eq!(t.norm, 0.0);
        }
    }

    /// Two viewpoints observing a structure through skew rays.
    fn skewed_pair() -> Model {
        let p0 = na::Vector3::new(-1.0, 0.0, 0.0);
        let p1 = na::Vector3::new(1.0, 0.0, 0.0);

        let mut model = Model::default();
        model.push_viewpoint(vec![Feature::new(
            na::Vector3::new(0.0, 0.0, 10.0) - p0,
            RGBA::default(),
        )]);
        model.push_viewpoint(vec![Feature::new(
            na::Vector3::new(0.0, 0.2, 10.0) - p1,
            RGBA::default(),
        )]);
        model.viewpoints[0].position = p0;
        model.viewpoints[1].position = p1;

        let s = model.push_structure();
        model.bind(s, 0, 0).unwrap();
        model.bind(s, 1, 0).unwrap();

        model
    }

    fn mass_pass(dense_disparity: f64) -> Model {
        let mut model = skewed_pair();
        let state = WindowState::new(Mode::Mass, 3, 2, 1);

        let settings = Settings::default()
            .mass(true)
            .dense_disparity(dense_disparity);

        RefinementEngine::new(settings)
            .refine(&mut model, &state, Mode::Mass)
            .unwrap();

        model
    }

    #[test]
    fn mass_threshold_decides_outcome() {
        let model = mass_pass(1.0);
        let s = &model.structures[0];

        assert_eq!(s.state, StructureState::Normal);

        let disparity = s
            .observations
            .iter()
            .map(|o| o.disparity)
            .fold(0.0, f64::max);

        assert!(disparity > 1e-6 && disparity < TAU, "{}", disparity);

        let kept = mass_pass(disparity * (1.0 + 1e-6) / TAU);
        assert_eq!(kept.structures[0].state, StructureState::Normal);
        assert_eq!(kept.structures[0].observations.len(), 2);

        let removed = mass_pass(disparity * (1.0 - 1e-6) / TAU);
        assert_eq!(removed.structures[0].state, StructureState::Remove);
        assert!(removed.structures[0].observations.is_empty());
        assert!(removed
            .viewpoints
            .iter()
            .all(|v| v.features[0].structure.is_none()));
    }
}

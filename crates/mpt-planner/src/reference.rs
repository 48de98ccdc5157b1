//! Reference-point pipeline
//!
//! Reference points are the geometric work unit of the MPT optimizer: the
//! input trajectory resampled to uniform arc-length spacing and annotated
//! with curvature, the optimization-center angle correction, corridor bounds
//! and the anchor state the ego is pinned to.

use log::debug;

use mpt_core::geometry::{
    intersect_normal_with_segment, lateral_offset, normalize_angle, Pose,
};
use mpt_core::spline::Spline2D;
use mpt_core::Point;

use crate::config::EgoNearestConfig;
use crate::solver::OSQP_INF;
use crate::trajectory::TrajectoryPoint;

/// Lateral and yaw error in the Frenet frame of a reference point
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct KinematicState {
    /// Signed lateral error [m], positive left
    pub lat: f64,
    /// Signed yaw error [rad]
    pub yaw: f64,
}

/// Lateral corridor interval in the local normal frame
#[derive(Debug, Clone, Copy)]
pub struct Bounds {
    pub lower_bound: f64,
    pub upper_bound: f64,
}

impl Default for Bounds {
    fn default() -> Self {
        Self {
            lower_bound: -OSQP_INF,
            upper_bound: OSQP_INF,
        }
    }
}

impl Bounds {
    /// Whether the interval admits any lateral position
    pub fn is_valid(&self) -> bool {
        self.lower_bound <= self.upper_bound
    }
}

/// A resampled point of the reference path with optimization annotations
#[derive(Debug, Clone)]
pub struct ReferencePoint {
    pub pose: Pose,
    pub longitudinal_velocity_mps: f64,

    /// Signed path curvature
    pub curvature: f64,
    /// Arc length from the previous reference point; zero at the first
    pub delta_arc_length: f64,
    /// Angle correction from the optimization-center offset
    pub alpha: f64,
    /// Corridor-narrowness cost in [0, 1] for adaptive weights
    pub normalized_avoidance_cost: f64,
    pub bounds: Bounds,

    /// Set only at the anchor point the ego state is pinned to
    pub fixed_kinematic_state: Option<KinematicState>,
    pub optimized_kinematic_state: KinematicState,
    pub optimized_input: f64,
}

impl ReferencePoint {
    fn new(pose: Pose, velocity: f64, curvature: f64, delta_arc_length: f64) -> Self {
        Self {
            pose,
            longitudinal_velocity_mps: velocity,
            curvature,
            delta_arc_length,
            alpha: 0.0,
            normalized_avoidance_cost: 0.0,
            bounds: Bounds::default(),
            fixed_kinematic_state: None,
            optimized_kinematic_state: KinematicState::default(),
            optimized_input: 0.0,
        }
    }
}

/// Resample the input trajectory at uniform spacing via an arc-length spline.
///
/// Returns the reference points and whether the horizon reaches the end of
/// the input path (the goal), which promotes the terminal weight to the goal
/// weight.
pub fn resample_reference_points(
    traj_points: &[TrajectoryPoint],
    delta_arc_length: f64,
    num_points: usize,
) -> (Vec<ReferencePoint>, bool) {
    if traj_points.len() < 2 {
        return (Vec::new(), false);
    }

    let x: Vec<f64> = traj_points.iter().map(|p| p.pose.position.x).collect();
    let y: Vec<f64> = traj_points.iter().map(|p| p.pose.position.y).collect();
    let spline = Spline2D::new(&x, &y);
    let total = spline.total_length();
    if total < delta_arc_length {
        return (Vec::new(), false);
    }

    let knots = spline.knots().to_vec();
    let mut refs = Vec::new();
    let mut s = 0.0;
    let mut prev_s = 0.0;
    while refs.len() < num_points && s <= total + 1e-9 {
        let s_clamped = s.min(total);
        let (px, py) = spline.position(s_clamped);
        let yaw = spline.yaw(s_clamped);
        let curvature = spline.curvature(s_clamped);
        let velocity = interpolate_velocity(traj_points, &knots, s_clamped);

        let ds = if refs.is_empty() { 0.0 } else { s_clamped - prev_s };
        refs.push(ReferencePoint::new(
            Pose::from_xy_yaw(px, py, yaw),
            velocity,
            curvature,
            ds,
        ));
        prev_s = s_clamped;
        s += delta_arc_length;
    }

    let reached_goal = prev_s >= total - 1e-6;
    (refs, reached_goal)
}

fn interpolate_velocity(traj_points: &[TrajectoryPoint], knots: &[f64], s: f64) -> f64 {
    let idx = knots
        .partition_point(|&k| k <= s)
        .saturating_sub(1)
        .min(traj_points.len() - 2);
    let seg = (knots[idx + 1] - knots[idx]).max(1e-9);
    let ratio = ((s - knots[idx]) / seg).clamp(0.0, 1.0);
    let v0 = traj_points[idx].longitudinal_velocity_mps;
    let v1 = traj_points[idx + 1].longitudinal_velocity_mps;
    v0 + (v1 - v0) * ratio
}

/// Moving-average smoothing of the curvature profile
pub fn smooth_curvature(refs: &mut [ReferencePoint], window: usize) {
    if window < 2 || refs.len() < 3 {
        return;
    }
    let half = window / 2;
    let raw: Vec<f64> = refs.iter().map(|r| r.curvature).collect();
    for i in 0..refs.len() {
        let lo = i.saturating_sub(half);
        let hi = (i + half + 1).min(raw.len());
        refs[i].curvature = raw[lo..hi].iter().sum::<f64>() / (hi - lo) as f64;
    }
}

/// alpha = atan(center_offset * curvature), the heading correction between
/// the rear axle and the tracking point
pub fn update_alpha(refs: &mut [ReferencePoint], center_offset: f64) {
    for r in refs.iter_mut() {
        r.alpha = (center_offset * r.curvature).atan();
    }
}

/// Locate the reference point the ego is pinned to and store the ego error
/// state there. Returns the anchor index.
pub fn update_fixed_point(
    refs: &mut [ReferencePoint],
    ego_pose: &Pose,
    ego_nearest: &EgoNearestConfig,
) -> Option<usize> {
    if refs.is_empty() {
        return None;
    }

    let qualified = refs
        .iter()
        .enumerate()
        .filter(|(_, r)| {
            r.pose.distance_xy(ego_pose) <= ego_nearest.dist_threshold
                && normalize_angle(r.pose.yaw() - ego_pose.yaw()).abs()
                    <= ego_nearest.yaw_threshold
        })
        .map(|(i, r)| (i, r.pose.distance_xy(ego_pose)))
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(i, _)| i);

    let anchor = qualified.unwrap_or_else(|| {
        debug!("ego outside nearest thresholds, falling back to plain nearest");
        refs.iter()
            .enumerate()
            .map(|(i, r)| (i, r.pose.distance_xy(ego_pose)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(i, _)| i)
            .unwrap()
    });

    let state = KinematicState {
        lat: lateral_offset(&refs[anchor].pose, &ego_pose.position),
        yaw: normalize_angle(ego_pose.yaw() - refs[anchor].pose.yaw()),
    };
    for r in refs.iter_mut() {
        r.fixed_kinematic_state = None;
    }
    refs[anchor].fixed_kinematic_state = Some(state);
    Some(anchor)
}

/// Project the drivable-area boundaries onto the normal at each reference
/// point and inset by half the vehicle width.
///
/// A boundary that cannot be projected (too short, or the normal misses it)
/// inherits the previous valid bound, or infinity at the start.
pub fn update_bounds(
    refs: &mut [ReferencePoint],
    left_bound: &[Point],
    right_bound: &[Point],
    vehicle_width: f64,
) {
    let half_width = vehicle_width / 2.0;
    let mut prev = Bounds::default();

    for r in refs.iter_mut() {
        let left = project_bound(&r.pose, left_bound);
        let right = project_bound(&r.pose, right_bound);

        let upper = match left {
            Some(t) => t - half_width,
            None => prev.upper_bound,
        };
        let lower = match right {
            Some(t) => t + half_width,
            None => prev.lower_bound,
        };

        r.bounds = Bounds {
            lower_bound: lower,
            upper_bound: upper,
        };
        prev = r.bounds;
    }
}

/// Signed distance along the normal to the nearest crossing of the polyline
fn project_bound(pose: &Pose, bound: &[Point]) -> Option<f64> {
    if bound.len() < 2 {
        return None;
    }
    bound
        .windows(2)
        .filter_map(|seg| intersect_normal_with_segment(pose, &seg[0], &seg[1]))
        .min_by(|a, b| a.abs().total_cmp(&b.abs()))
}

/// Corridor-narrowness cost in [0, 1]: zero with `precision` or more of
/// clearance on both sides, one when the reference touches or leaves the
/// corridor.
pub fn update_avoidance_cost(refs: &mut [ReferencePoint], precision: f64) {
    if precision <= 0.0 {
        return;
    }
    for r in refs.iter_mut() {
        let clearance = r.bounds.upper_bound.min(-r.bounds.lower_bound);
        if !clearance.is_finite() || clearance >= OSQP_INF / 2.0 {
            r.normalized_avoidance_cost = 0.0;
        } else {
            r.normalized_avoidance_cost = (1.0 - clearance / precision).clamp(0.0, 1.0);
        }
    }
}

//! Path and trajectory point types
//!
//! `PathPoint` is the input sample produced by the upstream planner;
//! `TrajectoryPoint` is the optimizer output with control fields filled in.
//! Resampling and nearest-point lookups shared by the pipeline live here.

use mpt_core::geometry::{normalize_angle, Pose};
use mpt_core::spline::Spline2D;

/// A sample of the input reference path
#[derive(Debug, Clone, Copy, Default)]
pub struct PathPoint {
    pub pose: Pose,
    pub longitudinal_velocity_mps: f64,
    pub lateral_velocity_mps: f64,
    pub heading_rate_rps: f64,
}

/// A sample of the optimized output trajectory
#[derive(Debug, Clone, Copy, Default)]
pub struct TrajectoryPoint {
    pub pose: Pose,
    pub longitudinal_velocity_mps: f64,
    pub lateral_velocity_mps: f64,
    pub heading_rate_rps: f64,
    pub acceleration_mps2: f64,
    pub front_wheel_angle_rad: f64,
    pub rear_wheel_angle_rad: f64,
}

impl TrajectoryPoint {
    pub fn from_pose_and_velocity(pose: Pose, velocity: f64) -> Self {
        Self {
            pose,
            longitudinal_velocity_mps: velocity,
            ..Default::default()
        }
    }
}

/// Convert path points into trajectory points, carrying velocity fields over
pub fn path_to_trajectory(path_points: &[PathPoint]) -> Vec<TrajectoryPoint> {
    path_points
        .iter()
        .map(|p| TrajectoryPoint {
            pose: p.pose,
            longitudinal_velocity_mps: p.longitudinal_velocity_mps,
            lateral_velocity_mps: p.lateral_velocity_mps,
            heading_rate_rps: p.heading_rate_rps,
            ..Default::default()
        })
        .collect()
}

/// Cumulative arc length over trajectory points, starting at zero
pub fn arc_lengths(points: &[TrajectoryPoint]) -> Vec<f64> {
    let mut s = Vec::with_capacity(points.len());
    s.push(0.0);
    for i in 1..points.len() {
        let d = points[i].pose.distance_xy(&points[i - 1].pose);
        s.push(s[i - 1] + d);
    }
    s
}

/// Index of the point closest to `pose` by planar distance
pub fn nearest_index(points: &[TrajectoryPoint], pose: &Pose) -> Option<usize> {
    points
        .iter()
        .enumerate()
        .map(|(i, p)| (i, p.pose.distance_xy(pose)))
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(i, _)| i)
}

/// Nearest index accepting only candidates within the distance and yaw
/// thresholds. Falls back to the plain nearest point when nothing qualifies.
pub fn nearest_index_with_thresholds(
    points: &[TrajectoryPoint],
    pose: &Pose,
    dist_threshold: f64,
    yaw_threshold: f64,
) -> Option<usize> {
    let candidate = points
        .iter()
        .enumerate()
        .filter(|(_, p)| {
            p.pose.distance_xy(pose) <= dist_threshold
                && normalize_angle(p.pose.yaw() - pose.yaw()).abs() <= yaw_threshold
        })
        .map(|(i, p)| (i, p.pose.distance_xy(pose)))
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(i, _)| i);

    candidate.or_else(|| nearest_index(points, pose))
}

/// Resample a trajectory to uniform arc-length spacing.
///
/// Positions and headings come from an arc-length spline fit; velocities and
/// the remaining scalar fields are interpolated linearly between the
/// bracketing input points. The final input point is always kept so the
/// output covers the full path length.
pub fn resample_trajectory(points: &[TrajectoryPoint], delta_arc_length: f64) -> Vec<TrajectoryPoint> {
    if points.len() < 2 || delta_arc_length <= 0.0 {
        return points.to_vec();
    }

    let x: Vec<f64> = points.iter().map(|p| p.pose.position.x).collect();
    let y: Vec<f64> = points.iter().map(|p| p.pose.position.y).collect();
    let spline = Spline2D::new(&x, &y);
    let total = spline.total_length();
    if total < 1e-6 {
        return points.to_vec();
    }

    let knots = spline.knots().to_vec();
    let mut out = Vec::new();
    let mut s = 0.0;
    while s < total - 1e-6 {
        out.push(sample_at(points, &spline, &knots, s));
        s += delta_arc_length;
    }
    out.push(sample_at(points, &spline, &knots, total));
    out
}

fn sample_at(
    points: &[TrajectoryPoint],
    spline: &Spline2D,
    knots: &[f64],
    s: f64,
) -> TrajectoryPoint {
    let (px, py) = spline.position(s);
    let yaw = spline.yaw(s);

    // Bracketing input points for the scalar fields
    let idx = knots.partition_point(|&k| k <= s).saturating_sub(1).min(points.len() - 2);
    let seg = (knots[idx + 1] - knots[idx]).max(1e-9);
    let ratio = ((s - knots[idx]) / seg).clamp(0.0, 1.0);
    let p0 = &points[idx];
    let p1 = &points[idx + 1];
    let lerp = |a: f64, b: f64| a + (b - a) * ratio;

    TrajectoryPoint {
        pose: Pose::from_xy_yaw(px, py, yaw),
        longitudinal_velocity_mps: lerp(p0.longitudinal_velocity_mps, p1.longitudinal_velocity_mps),
        lateral_velocity_mps: lerp(p0.lateral_velocity_mps, p1.lateral_velocity_mps),
        heading_rate_rps: lerp(p0.heading_rate_rps, p1.heading_rate_rps),
        acceleration_mps2: lerp(p0.acceleration_mps2, p1.acceleration_mps2),
        front_wheel_angle_rad: lerp(p0.front_wheel_angle_rad, p1.front_wheel_angle_rad),
        rear_wheel_angle_rad: lerp(p0.rear_wheel_angle_rad, p1.rear_wheel_angle_rad),
    }
}

/// Max over the points of `a` of the distance to the nearest point of `b`.
///
/// Used as the shape-change metric between two trajectories.
pub fn max_nearest_distance(a: &[TrajectoryPoint], b: &[TrajectoryPoint]) -> f64 {
    let mut max_dist: f64 = 0.0;
    for pa in a {
        let nearest = b
            .iter()
            .map(|pb| pa.pose.distance_xy(&pb.pose))
            .fold(f64::INFINITY, f64::min);
        max_dist = max_dist.max(nearest);
    }
    if max_dist.is_finite() {
        max_dist
    } else {
        0.0
    }
}

/// Straight-line helper used by tests and examples
pub fn straight_path(length: f64, spacing: f64, velocity: f64) -> Vec<PathPoint> {
    let n = (length / spacing).round() as usize;
    (0..=n)
        .map(|i| PathPoint {
            pose: Pose::from_xy_yaw(i as f64 * spacing, 0.0, 0.0),
            longitudinal_velocity_mps: velocity,
            ..Default::default()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn make_straight(n: usize, spacing: f64) -> Vec<TrajectoryPoint> {
        (0..n)
            .map(|i| {
                TrajectoryPoint::from_pose_and_velocity(
                    Pose::from_xy_yaw(i as f64 * spacing, 0.0, 0.0),
                    2.0,
                )
            })
            .collect()
    }

    #[test]
    fn test_arc_lengths_monotonic() {
        let points = make_straight(10, 1.5);
        let s = arc_lengths(&points);
        assert_eq!(s.len(), 10);
        for i in 1..s.len() {
            assert!(s[i] > s[i - 1]);
        }
        assert_relative_eq!(s[9], 13.5, epsilon = 1e-12);
    }

    #[test]
    fn test_nearest_index_thresholds() {
        let points = make_straight(20, 1.0);
        let ego = Pose::from_xy_yaw(5.3, 0.4, 0.05);
        assert_eq!(nearest_index_with_thresholds(&points, &ego, 3.0, 1.046), Some(5));

        // Heading off by more than the threshold everywhere: falls back to
        // the plain nearest index
        let reversed = Pose::from_xy_yaw(5.3, 0.4, 3.0);
        assert_eq!(nearest_index_with_thresholds(&points, &reversed, 3.0, 0.5), Some(5));
    }

    #[test]
    fn test_resample_spacing_and_endpoint() {
        let points = make_straight(21, 1.0);
        let out = resample_trajectory(&points, 0.5);
        let s = arc_lengths(&out);
        assert_relative_eq!(*s.last().unwrap(), 20.0, epsilon = 1e-6);
        for w in s.windows(2) {
            assert!(w[1] - w[0] > 0.0);
            assert!(w[1] - w[0] < 0.5 + 1e-6);
        }
        // Velocity carried through
        for p in &out {
            assert_relative_eq!(p.longitudinal_velocity_mps, 2.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_max_nearest_distance_identical_is_zero() {
        let points = make_straight(10, 1.0);
        assert_relative_eq!(max_nearest_distance(&points, &points), 0.0);
    }

    #[test]
    fn test_max_nearest_distance_offset() {
        let a = make_straight(10, 1.0);
        let mut b = make_straight(10, 1.0);
        for p in &mut b {
            p.pose.position.y += 0.8;
        }
        assert_relative_eq!(max_nearest_distance(&a, &b), 0.8, epsilon = 1e-12);
    }
}

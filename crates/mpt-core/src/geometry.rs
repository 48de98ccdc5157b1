//! Planar pose utilities
//!
//! Positions are 3D but the planner works in the ground plane; z is carried
//! through untouched. Orientations are unit quaternions, yaw is derived.

use nalgebra::{UnitQuaternion, Vector3};

use crate::{Point, Quat};

/// Position plus orientation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub position: Point,
    pub orientation: Quat,
}

impl Default for Pose {
    fn default() -> Self {
        Self {
            position: Vector3::zeros(),
            orientation: UnitQuaternion::identity(),
        }
    }
}

impl Pose {
    pub fn new(position: Point, orientation: Quat) -> Self {
        Self { position, orientation }
    }

    /// Build a planar pose from x, y and heading
    pub fn from_xy_yaw(x: f64, y: f64, yaw: f64) -> Self {
        Self {
            position: Vector3::new(x, y, 0.0),
            orientation: quat_from_yaw(yaw),
        }
    }

    /// Heading angle in the ground plane
    pub fn yaw(&self) -> f64 {
        self.orientation.euler_angles().2
    }

    /// Euclidean distance in the ground plane
    pub fn distance_xy(&self, other: &Pose) -> f64 {
        let d = self.position - other.position;
        (d.x * d.x + d.y * d.y).sqrt()
    }
}

/// Yaw-only rotation as a unit quaternion
pub fn quat_from_yaw(yaw: f64) -> Quat {
    UnitQuaternion::from_euler_angles(0.0, 0.0, yaw)
}

/// Wrap an angle into (-pi, pi]
pub fn normalize_angle(angle: f64) -> f64 {
    let two_pi = 2.0 * std::f64::consts::PI;
    let mut a = angle % two_pi;
    if a > std::f64::consts::PI {
        a -= two_pi;
    } else if a <= -std::f64::consts::PI {
        a += two_pi;
    }
    a
}

/// Signed lateral offset of `target` in the Frenet frame of `base`.
///
/// Positive to the left of the base heading.
pub fn lateral_offset(base: &Pose, target: &Point) -> f64 {
    let yaw = base.yaw();
    let dx = target.x - base.position.x;
    let dy = target.y - base.position.y;
    -yaw.sin() * dx + yaw.cos() * dy
}

/// Signed longitudinal offset of `target` along the heading of `base`
pub fn longitudinal_offset(base: &Pose, target: &Point) -> f64 {
    let yaw = base.yaw();
    let dx = target.x - base.position.x;
    let dy = target.y - base.position.y;
    yaw.cos() * dx + yaw.sin() * dy
}

/// Shift a position sideways along the normal of the given heading
pub fn offset_along_normal(position: &Point, yaw: f64, lateral: f64) -> Point {
    Vector3::new(
        position.x - yaw.sin() * lateral,
        position.y + yaw.cos() * lateral,
        position.z,
    )
}

/// Intersection of the normal line at `base` with the segment `p1 -> p2`.
///
/// Returns the signed distance along the normal (positive to the left of the
/// base heading) if the segment crosses the normal line.
pub fn intersect_normal_with_segment(base: &Pose, p1: &Point, p2: &Point) -> Option<f64> {
    let yaw = base.yaw();
    // Normal direction at the base pose
    let nx = -yaw.sin();
    let ny = yaw.cos();

    let ex = p2.x - p1.x;
    let ey = p2.y - p1.y;

    // Solve base + t*n == p1 + u*e for (t, u)
    let det = nx * (-ey) - (-ex) * ny;
    if det.abs() < 1e-10 {
        return None;
    }
    let rx = p1.x - base.position.x;
    let ry = p1.y - base.position.y;
    let t = (rx * (-ey) - (-ex) * ry) / det;
    let u = (nx * ry - ny * rx) / det;

    if (-1e-6..=1.0 + 1e-6).contains(&u) {
        Some(t)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_yaw_round_trip() {
        for &yaw in &[-2.9, -1.0, 0.0, 0.5, 1.57, 3.0] {
            let pose = Pose::from_xy_yaw(1.0, 2.0, yaw);
            assert_relative_eq!(pose.yaw(), yaw, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_normalize_angle() {
        assert_relative_eq!(normalize_angle(3.0 * std::f64::consts::PI), std::f64::consts::PI);
        assert_relative_eq!(normalize_angle(-0.1), -0.1);
        assert_relative_eq!(
            normalize_angle(2.0 * std::f64::consts::PI + 0.3),
            0.3,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_lateral_offset_sign() {
        let base = Pose::from_xy_yaw(0.0, 0.0, 0.0);
        // Point to the left of the x axis has positive lateral offset
        assert_relative_eq!(lateral_offset(&base, &Vector3::new(5.0, 1.5, 0.0)), 1.5);
        assert_relative_eq!(lateral_offset(&base, &Vector3::new(5.0, -0.5, 0.0)), -0.5);
    }

    #[test]
    fn test_offset_along_normal_inverts_lateral_offset() {
        let base = Pose::from_xy_yaw(1.0, -2.0, 0.7);
        let shifted = offset_along_normal(&base.position, base.yaw(), 1.3);
        assert_relative_eq!(lateral_offset(&base, &shifted), 1.3, epsilon = 1e-12);
    }

    #[test]
    fn test_intersect_normal_with_segment() {
        let base = Pose::from_xy_yaw(0.0, 0.0, 0.0);
        // Vertical normal at the origin crosses a segment at y = 2
        let t = intersect_normal_with_segment(
            &base,
            &Vector3::new(-1.0, 2.0, 0.0),
            &Vector3::new(1.0, 2.0, 0.0),
        );
        assert_relative_eq!(t.unwrap(), 2.0, epsilon = 1e-12);

        // Segment that does not straddle the normal line
        let miss = intersect_normal_with_segment(
            &base,
            &Vector3::new(1.0, 2.0, 0.0),
            &Vector3::new(3.0, 2.0, 0.0),
        );
        assert!(miss.is_none());
    }
}

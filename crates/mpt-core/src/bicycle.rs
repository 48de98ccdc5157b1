//! Kinematic bicycle model
//!
//! The planner tracks a reference path with a two-state error model per
//! reference point: lateral error and yaw error in the Frenet frame. The
//! model linearizes the bicycle kinematics around the reference steering
//! angle of each segment, yielding a discrete affine recurrence
//!
//! ```text
//! x_{k+1} = Ad * x_k + Bd * u_k + Wd
//! ```
//!
//! with x = [lat_err, yaw_err] and u = [steer].

use nalgebra::{Matrix2, Vector2};
use serde::{Deserialize, Serialize};

/// Static vehicle dimensions and steering limit
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VehicleInfo {
    /// Distance between front and rear axles [m]
    pub wheel_base: f64,
    /// Distance from front axle to front bumper [m]
    pub front_overhang: f64,
    /// Distance from rear axle to rear bumper [m]
    pub rear_overhang: f64,
    /// Overall width [m]
    pub vehicle_width: f64,
    /// Overall length [m]
    pub vehicle_length: f64,
    /// Mechanical steering limit [rad]
    pub max_steer_angle: f64,
}

impl Default for VehicleInfo {
    fn default() -> Self {
        Self {
            wheel_base: 2.79,
            front_overhang: 0.96,
            rear_overhang: 1.02,
            vehicle_width: 1.92,
            vehicle_length: 4.77,
            max_steer_angle: 0.7,
        }
    }
}

/// Bicycle kinematics linearized per path segment
#[derive(Debug, Clone, Copy)]
pub struct KinematicBicycle {
    wheelbase: f64,
    steer_limit: f64,
}

impl KinematicBicycle {
    /// State dimension: [lateral_error, yaw_error]
    pub const DIM_X: usize = 2;
    /// Input dimension: [steering_angle]
    pub const DIM_U: usize = 1;

    pub fn new(wheelbase: f64, steer_limit: f64) -> Self {
        Self { wheelbase, steer_limit }
    }

    pub fn wheelbase(&self) -> f64 {
        self.wheelbase
    }

    pub fn steer_limit(&self) -> f64 {
        self.steer_limit
    }

    /// Discrete one-step matrices (Ad, Bd, Wd) for a segment of length `ds`
    /// with reference curvature `curvature`.
    ///
    /// The reference steering angle is delta_r = atan(L * curvature). The
    /// drift term Wd uses delta_r clamped to the steering limit so the offset
    /// stays finite when the reference curvature is not drivable; the input
    /// response Bd keeps the unclamped angle.
    pub fn linearize(&self, curvature: f64, ds: f64) -> (Matrix2<f64>, Vector2<f64>, Vector2<f64>) {
        let delta_r = (self.wheelbase * curvature).atan();
        let cropped = delta_r.clamp(-self.steer_limit, self.steer_limit);

        let ad = Matrix2::new(1.0, ds, 0.0, 1.0);

        let cos_delta = delta_r.cos();
        let bd = Vector2::new(0.0, ds / self.wheelbase / (cos_delta * cos_delta));

        let cos_cropped = cropped.cos();
        let wd = Vector2::new(
            0.0,
            -ds * curvature
                + ds / self.wheelbase * (cropped.tan() - cropped / (cos_cropped * cos_cropped)),
        );

        (ad, bd, wd)
    }
}

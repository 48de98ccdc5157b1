//! # MPT Core
//!
//! Core library for the Model Predictive Trajectory (MPT) path optimizer.
//!
//! This crate holds the dependency-light building blocks the planner is
//! assembled from:
//!
//! - [`geometry`]: poses, yaw/quaternion conversions, Frenet-frame helpers
//! - [`spline`]: natural cubic splines and arc-length parameterized 2D splines
//! - [`bicycle`]: kinematic bicycle model and its per-segment linearization

pub mod bicycle;
pub mod geometry;
pub mod spline;

use nalgebra::{UnitQuaternion, Vector3};

/// 3D point type used for positions and drivable-area boundaries
pub type Point = Vector3<f64>;

/// Unit quaternion type for orientations
pub type Quat = UnitQuaternion<f64>;

pub use bicycle::{KinematicBicycle, VehicleInfo};
pub use geometry::Pose;
pub use spline::{CubicSpline, Spline2D};

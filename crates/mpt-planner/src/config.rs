//! Planner configuration
//!
//! All tunables for the path optimizer, grouped the way the pipeline is
//! structured. Every struct carries the production defaults and round-trips
//! through serde so deployments can ship partial overrides.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the path optimizer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Output trajectory shaping
    pub trajectory: TrajectoryConfig,
    /// Ego-to-reference matching thresholds
    pub ego_nearest: EgoNearestConfig,
    /// MPT optimization parameters
    pub mpt: MptConfig,
    /// Replan decision thresholds
    pub replan: ReplanConfig,

    /// Insert a stop before the first point leaving the drivable area
    pub enable_outside_drivable_area_stop: bool,
    /// Margin kept before the violating point when stopping [m]
    pub vehicle_stop_margin_outside_drivable_area: f64,
    /// Bypass the QP and convert the input path directly
    pub enable_skip_optimization: bool,
    /// Clear warm-start memory whenever the replan checker fires
    pub enable_reset_prev_optimization: bool,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            trajectory: TrajectoryConfig::default(),
            ego_nearest: EgoNearestConfig::default(),
            mpt: MptConfig::default(),
            replan: ReplanConfig::default(),
            enable_outside_drivable_area_stop: true,
            vehicle_stop_margin_outside_drivable_area: 0.5,
            enable_skip_optimization: false,
            enable_reset_prev_optimization: true,
        }
    }
}

/// Output trajectory resampling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajectoryConfig {
    /// Output point spacing [m]
    pub output_delta_arc_length: f64,
    /// Length of trajectory kept behind the ego [m]
    pub output_backward_traj_length: f64,
    /// Maximum number of output samples
    pub num_sampling_points: usize,
}

impl Default for TrajectoryConfig {
    fn default() -> Self {
        Self {
            output_delta_arc_length: 0.5,
            output_backward_traj_length: 2.0,
            num_sampling_points: 100,
        }
    }
}

/// Thresholds for matching the ego pose to a reference point
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EgoNearestConfig {
    /// Maximum position distance [m]
    pub dist_threshold: f64,
    /// Maximum heading difference [rad]
    pub yaw_threshold: f64,
}

impl Default for EgoNearestConfig {
    fn default() -> Self {
        Self {
            dist_threshold: 3.0,
            // roughly 60 degrees
            yaw_threshold: 1.046,
        }
    }
}

/// MPT horizon, weights and limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MptConfig {
    /// Reference-point spacing along the horizon [m]
    pub delta_arc_length: f64,
    /// Maximum number of reference points
    pub num_points: usize,
    /// Moving-average window for curvature smoothing
    pub num_curvature_sampling_points: usize,
    /// Longitudinal offset of the tracking point from the rear axle [m],
    /// typically 0.8 * wheelbase
    pub optimization_center_offset: f64,

    /// Objective weights
    pub weights: MptWeights,

    /// Steering magnitude limit [rad]
    pub max_steer_rad: f64,
    /// Steering rate limit [rad/s]
    pub max_steer_rate_rad_per_s: f64,

    /// Interpolate weights toward the avoidance set where the corridor
    /// narrows
    pub enable_avoidance: bool,
    /// Corridor clearance below which the avoidance weights take over [m]
    pub avoidance_precision: f64,

    /// Pin the terminal state when the path end is close enough
    pub enable_terminal_constraint: bool,
    pub terminal_lat_error_threshold: f64,
    pub terminal_yaw_error_threshold: f64,

    /// Absolute tolerance handed to the QP solver
    pub qp_eps_abs: f64,
    /// Iteration cap for one QP solve
    pub qp_max_iter: u32,
    /// Wall-clock budget for one planning tick [ms]
    pub max_optimization_time_ms: f64,
}

impl Default for MptConfig {
    fn default() -> Self {
        Self {
            delta_arc_length: 1.0,
            num_points: 100,
            num_curvature_sampling_points: 5,
            optimization_center_offset: 0.0,
            weights: MptWeights::default(),
            max_steer_rad: 0.7,
            max_steer_rate_rad_per_s: 0.5,
            enable_avoidance: true,
            avoidance_precision: 0.5,
            enable_terminal_constraint: true,
            terminal_lat_error_threshold: 0.3,
            terminal_yaw_error_threshold: 0.1,
            qp_eps_abs: 1e-6,
            qp_max_iter: 20_000,
            max_optimization_time_ms: 50.0,
        }
    }
}

/// Objective weights for the MPT quadratic program
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MptWeights {
    /// Lateral tracking error
    pub lat_error_weight: f64,
    /// Yaw tracking error
    pub yaw_error_weight: f64,
    /// Yaw error difference between adjacent points
    pub yaw_error_rate_weight: f64,
    /// Steering magnitude
    pub steer_input_weight: f64,
    /// Steering difference between adjacent inputs
    pub steer_rate_weight: f64,

    /// Lateral/yaw weights at the last horizon point
    pub terminal_lat_error_weight: f64,
    pub terminal_yaw_error_weight: f64,
    /// Lateral/yaw weights when the path goal falls inside the horizon
    pub goal_lat_error_weight: f64,
    pub goal_yaw_error_weight: f64,

    /// Lateral/yaw weights blended in where the avoidance cost is high
    pub avoidance_lat_error_weight: f64,
    pub avoidance_yaw_error_weight: f64,

    /// Linear weight on the L-inf lateral slack
    pub l_inf_weight: f64,
    /// Quadratic penalty on the soft corridor slacks
    pub soft_collision_free_weight: f64,
}

impl Default for MptWeights {
    fn default() -> Self {
        Self {
            lat_error_weight: 1.0,
            yaw_error_weight: 0.0,
            yaw_error_rate_weight: 0.0,
            steer_input_weight: 1.0,
            steer_rate_weight: 1.0,
            terminal_lat_error_weight: 100.0,
            terminal_yaw_error_weight: 0.0,
            goal_lat_error_weight: 1000.0,
            goal_yaw_error_weight: 0.0,
            avoidance_lat_error_weight: 0.0,
            avoidance_yaw_error_weight: 10.0,
            l_inf_weight: 1.0,
            soft_collision_free_weight: 1000.0,
        }
    }
}

/// Replan decision thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplanConfig {
    /// Maximum tolerated shape difference to the previous input [m]
    pub max_path_shape_change_dist: f64,
    /// Maximum ego displacement since the last replan [m]
    pub max_ego_moving_dist: f64,
    /// Maximum age of the previous plan [s]
    pub max_delta_time_sec: f64,
}

impl Default for ReplanConfig {
    fn default() -> Self {
        Self {
            max_path_shape_change_dist: 0.5,
            max_ego_moving_dist: 5.0,
            max_delta_time_sec: 2.0,
        }
    }
}

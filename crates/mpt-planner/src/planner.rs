//! Path optimizer facade
//!
//! Owns the MPT optimizer and the replan checker, drives the per-tick
//! pipeline and shapes the output trajectory: velocity transfer from the
//! input path, resampling, control fields and the stop insertion when the
//! trajectory leaves the drivable area.
//!
//! The facade never propagates errors; every tick produces a best-effort
//! [`OptimizationResult`].

use std::time::Instant;

use log::{debug, warn};

use mpt_core::bicycle::VehicleInfo;
use mpt_core::geometry::Pose;
use mpt_core::Point;

use crate::config::PlannerConfig;
use crate::mpt::MptOptimizer;
use crate::reference::ReferencePoint;
use crate::replan::ReplanChecker;
use crate::trajectory::{
    arc_lengths, nearest_index, path_to_trajectory, resample_trajectory, PathPoint,
    TrajectoryPoint,
};

/// Outcome of one planning tick
#[derive(Debug, Clone, Default)]
pub struct OptimizationResult {
    pub trajectory: Vec<TrajectoryPoint>,
    pub reference_points: Vec<ReferencePoint>,
    pub success: bool,
    pub error_message: String,
    pub computation_time_ms: f64,
}

/// Entry point of the path optimizer
pub struct PathOptimizer {
    config: PlannerConfig,
    vehicle: VehicleInfo,

    mpt: MptOptimizer,
    replan_checker: ReplanChecker,

    prev_optimized_traj: Option<Vec<TrajectoryPoint>>,
    started_at: Instant,
}

impl PathOptimizer {
    pub fn new(config: PlannerConfig, vehicle: VehicleInfo) -> Self {
        let mpt = MptOptimizer::new(config.mpt.clone(), config.ego_nearest.clone(), vehicle);
        let replan_checker = ReplanChecker::new(config.replan.clone());
        Self {
            config,
            vehicle,
            mpt,
            replan_checker,
            prev_optimized_traj: None,
            started_at: Instant::now(),
        }
    }

    pub fn replan_checker(&self) -> &ReplanChecker {
        &self.replan_checker
    }

    /// Optimize one tick, returning only the trajectory
    pub fn optimize_path(
        &mut self,
        path_points: &[PathPoint],
        left_bound: &[Point],
        right_bound: &[Point],
        ego_pose: &Pose,
        ego_velocity: f64,
    ) -> Vec<TrajectoryPoint> {
        self.optimize_path_with_debug(path_points, left_bound, right_bound, ego_pose, ego_velocity)
            .trajectory
    }

    /// Optimize one tick with the full result
    pub fn optimize_path_with_debug(
        &mut self,
        path_points: &[PathPoint],
        left_bound: &[Point],
        right_bound: &[Point],
        ego_pose: &Pose,
        ego_velocity: f64,
    ) -> OptimizationResult {
        let tick_start = Instant::now();

        if path_points.len() < 2 {
            return OptimizationResult {
                error_message: "input path has fewer than 2 points".into(),
                computation_time_ms: tick_start.elapsed().as_secs_f64() * 1000.0,
                ..Default::default()
            };
        }

        let traj_points = path_to_trajectory(path_points);
        let now_sec = self.started_at.elapsed().as_secs_f64();

        if !self.replan_checker.is_replan_required(&traj_points, ego_pose, now_sec) {
            if let Some(prev) = self.prev_optimized_traj.clone() {
                debug!("reusing previous trajectory");
                return OptimizationResult {
                    trajectory: prev,
                    reference_points: self.mpt.reference_points().to_vec(),
                    success: true,
                    error_message: String::new(),
                    computation_time_ms: tick_start.elapsed().as_secs_f64() * 1000.0,
                };
            }
        }

        if self.config.enable_reset_prev_optimization {
            self.mpt.reset();
        }

        let (optimized, success, error_message) = if self.config.enable_skip_optimization {
            (traj_points.clone(), true, String::new())
        } else {
            match self.mpt.optimize(&traj_points, left_bound, right_bound, ego_pose, ego_velocity) {
                Ok(traj) => (traj, true, String::new()),
                Err(e) => {
                    warn!("optimization failed: {}", e);
                    // A failed tick must replan from scratch next time
                    self.replan_checker.reset();
                    let fallback = self
                        .prev_optimized_traj
                        .clone()
                        .unwrap_or_else(|| traj_points.clone());
                    let result = OptimizationResult {
                        trajectory: fallback,
                        reference_points: self.mpt.reference_points().to_vec(),
                        success: false,
                        error_message: e.to_string(),
                        computation_time_ms: tick_start.elapsed().as_secs_f64() * 1000.0,
                    };
                    return result;
                }
            }
        };

        let output = self.postprocess(optimized, path_points, left_bound, right_bound, ego_pose);

        self.replan_checker.update_previous_data(&traj_points, ego_pose, now_sec);
        self.prev_optimized_traj = Some(output.clone());

        OptimizationResult {
            trajectory: output,
            reference_points: self.mpt.reference_points().to_vec(),
            success,
            error_message,
            computation_time_ms: tick_start.elapsed().as_secs_f64() * 1000.0,
        }
    }

    /// Output shaping shared by the optimized and the pass-through paths
    fn postprocess(
        &self,
        traj: Vec<TrajectoryPoint>,
        path_points: &[PathPoint],
        left_bound: &[Point],
        right_bound: &[Point],
        ego_pose: &Pose,
    ) -> Vec<TrajectoryPoint> {
        let mut out = resample_trajectory(&traj, self.config.trajectory.output_delta_arc_length);
        out.truncate(self.config.trajectory.num_sampling_points.max(2));

        trim_backward(&mut out, ego_pose, self.config.trajectory.output_backward_traj_length);
        apply_input_velocity(&mut out, path_points);
        calculate_control_fields(
            &mut out,
            self.vehicle.wheel_base,
            self.config.enable_skip_optimization,
        );

        if self.config.enable_outside_drivable_area_stop {
            insert_stop_outside_drivable_area(
                &mut out,
                left_bound,
                right_bound,
                self.config.vehicle_stop_margin_outside_drivable_area,
            );
        }

        out
    }
}

/// Drop output points more than `backward_length` behind the ego projection
fn trim_backward(points: &mut Vec<TrajectoryPoint>, ego_pose: &Pose, backward_length: f64) {
    let Some(ego_idx) = nearest_index(points, ego_pose) else {
        return;
    };
    let s = arc_lengths(points);
    let keep_from = s[ego_idx] - backward_length;
    if keep_from <= 0.0 {
        return;
    }
    let first_kept = s.partition_point(|&si| si < keep_from);
    points.drain(..first_kept);
}

/// Transfer longitudinal velocity from the input path by nearest position
fn apply_input_velocity(points: &mut [TrajectoryPoint], path_points: &[PathPoint]) {
    if path_points.is_empty() {
        return;
    }
    for p in points.iter_mut() {
        let nearest = path_points
            .iter()
            .min_by(|a, b| {
                a.pose
                    .distance_xy(&p.pose)
                    .total_cmp(&b.pose.distance_xy(&p.pose))
            })
            .unwrap();
        p.longitudinal_velocity_mps = nearest.longitudinal_velocity_mps;
        p.lateral_velocity_mps = nearest.lateral_velocity_mps;
    }
}

/// Fill heading rate (and the front steering angle on the pass-through path)
/// from the output geometry
fn calculate_control_fields(points: &mut [TrajectoryPoint], wheelbase: f64, compute_steer: bool) {
    let n = points.len();
    if n < 2 {
        return;
    }
    for i in 0..n - 1 {
        let ds = points[i].pose.distance_xy(&points[i + 1].pose).max(1e-6);
        let dyaw = mpt_core::geometry::normalize_angle(
            points[i + 1].pose.yaw() - points[i].pose.yaw(),
        );
        points[i].heading_rate_rps = dyaw / ds * points[i].longitudinal_velocity_mps;
        if compute_steer {
            let curvature = dyaw / ds;
            points[i].front_wheel_angle_rad = (wheelbase * curvature).atan();
            points[i].rear_wheel_angle_rad = 0.0;
        }
    }
    points[n - 1].heading_rate_rps = points[n - 2].heading_rate_rps;
    if compute_steer {
        points[n - 1].front_wheel_angle_rad = points[n - 2].front_wheel_angle_rad;
    }
}

/// Whether a point lies between the left and right boundary polylines
fn is_inside_drivable_area(
    point: &TrajectoryPoint,
    left_bound: &[Point],
    right_bound: &[Point],
) -> bool {
    // Positive cross product means the point is left of the directed segment
    let side = |bound: &[Point]| -> Option<f64> {
        if bound.len() < 2 {
            return None;
        }
        let p = &point.pose.position;
        let seg = bound
            .windows(2)
            .min_by(|a, b| {
                let da = dist_point_segment(p, &a[0], &a[1]);
                let db = dist_point_segment(p, &b[0], &b[1]);
                da.total_cmp(&db)
            })
            .unwrap();
        let ex = seg[1].x - seg[0].x;
        let ey = seg[1].y - seg[0].y;
        let px = p.x - seg[0].x;
        let py = p.y - seg[0].y;
        Some(ex * py - ey * px)
    };

    // Outside when left of the left bound or right of the right bound
    if let Some(cross) = side(left_bound) {
        if cross > 0.0 {
            return false;
        }
    }
    if let Some(cross) = side(right_bound) {
        if cross < 0.0 {
            return false;
        }
    }
    true
}

fn dist_point_segment(p: &Point, a: &Point, b: &Point) -> f64 {
    let ex = b.x - a.x;
    let ey = b.y - a.y;
    let len2 = ex * ex + ey * ey;
    let t = if len2 < 1e-12 {
        0.0
    } else {
        (((p.x - a.x) * ex + (p.y - a.y) * ey) / len2).clamp(0.0, 1.0)
    };
    let cx = a.x + t * ex;
    let cy = a.y + t * ey;
    (p.x - cx).hypot(p.y - cy)
}

/// Zero out velocity from `margin` before the first point leaving the
/// drivable area
fn insert_stop_outside_drivable_area(
    points: &mut [TrajectoryPoint],
    left_bound: &[Point],
    right_bound: &[Point],
    margin: f64,
) {
    if left_bound.len() < 2 && right_bound.len() < 2 {
        return;
    }
    let first_outside = points
        .iter()
        .position(|p| !is_inside_drivable_area(p, left_bound, right_bound));
    let Some(violating) = first_outside else {
        return;
    };

    let s = arc_lengths(points);
    let stop_s = (s[violating] - margin).max(0.0);
    let stop_idx = s.partition_point(|&si| si < stop_s).min(points.len() - 1);
    warn!(
        "trajectory leaves the drivable area at {:.1} m, stopping at {:.1} m",
        s[violating], stop_s
    );
    for p in points.iter_mut().skip(stop_idx) {
        p.longitudinal_velocity_mps = 0.0;
        p.lateral_velocity_mps = 0.0;
        p.heading_rate_rps = 0.0;
        p.acceleration_mps2 = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trajectory::straight_path;
    use nalgebra::Vector3;

    fn corridor(y: f64) -> Vec<Point> {
        (0..=6).map(|i| Vector3::new(i as f64 * 5.0, y, 0.0)).collect()
    }

    #[test]
    fn test_empty_input_returns_failure() {
        let mut optimizer = PathOptimizer::new(PlannerConfig::default(), VehicleInfo::default());
        let ego = Pose::from_xy_yaw(0.0, 0.0, 0.0);
        let result = optimizer.optimize_path_with_debug(&[], &[], &[], &ego, 0.0);
        assert!(!result.success);
        assert!(result.trajectory.is_empty());
        assert!(!result.error_message.is_empty());
    }

    #[test]
    fn test_skip_optimization_pass_through() {
        let config = PlannerConfig {
            enable_skip_optimization: true,
            ..Default::default()
        };
        let mut optimizer = PathOptimizer::new(config, VehicleInfo::default());
        let path = straight_path(20.0, 1.0, 3.0);
        let ego = Pose::from_xy_yaw(0.0, 0.0, 0.0);

        let result =
            optimizer.optimize_path_with_debug(&path, &corridor(2.0), &corridor(-2.0), &ego, 3.0);
        assert!(result.success);
        assert!(!result.trajectory.is_empty());
        // Velocities applied from the input path
        for p in &result.trajectory {
            assert_eq!(p.longitudinal_velocity_mps, 3.0);
        }
    }

    #[test]
    fn test_outside_drivable_area_stop() {
        let path = straight_path(20.0, 1.0, 3.0);
        let traj = path_to_trajectory(&path);
        let mut out = resample_trajectory(&traj, 0.5);

        // Corridor that ends at x = 10: the left bound crosses the path
        let left: Vec<Point> = vec![
            Vector3::new(0.0, 2.0, 0.0),
            Vector3::new(10.0, 2.0, 0.0),
            Vector3::new(10.5, -3.0, 0.0),
        ];
        let right: Vec<Point> = vec![Vector3::new(0.0, -2.0, 0.0), Vector3::new(20.0, -2.0, 0.0)];
        insert_stop_outside_drivable_area(&mut out, &left, &right, 0.5);

        let s = arc_lengths(&out);
        let first_stopped = out
            .iter()
            .position(|p| p.longitudinal_velocity_mps == 0.0)
            .expect("a stop must be inserted");
        assert!(s[first_stopped] < 10.5);
        // Everything after the stop is zeroed as well
        for p in &out[first_stopped..] {
            assert_eq!(p.longitudinal_velocity_mps, 0.0);
        }
    }

    #[test]
    fn test_trim_backward_keeps_margin() {
        let path = straight_path(20.0, 1.0, 3.0);
        let mut traj = path_to_trajectory(&path);
        let ego = Pose::from_xy_yaw(10.0, 0.0, 0.0);
        trim_backward(&mut traj, &ego, 2.0);

        let first_x = traj.first().unwrap().pose.position.x;
        assert!(first_x >= 7.9 && first_x <= 8.1);
    }

    #[test]
    fn test_control_fields_on_pass_through() {
        let path = straight_path(10.0, 1.0, 2.0);
        let mut traj = path_to_trajectory(&path);
        calculate_control_fields(&mut traj, 2.79, true);
        for p in &traj {
            assert!(p.front_wheel_angle_rad.abs() < 1e-9);
            assert!(p.heading_rate_rps.abs() < 1e-9);
        }
    }
}

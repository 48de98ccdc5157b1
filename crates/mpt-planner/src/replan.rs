//! Replan checker
//!
//! Decides per tick whether the previous trajectory can be reused or the
//! optimizer has to run again. Without previous data it always replans;
//! afterwards a replan fires when the input path shape drifts, the ego moves
//! too far, or the previous plan gets too old.

use log::debug;

use mpt_core::geometry::Pose;

use crate::config::ReplanConfig;
use crate::trajectory::{max_nearest_distance, TrajectoryPoint};

/// Tracks the previous plan and decides when to replan
#[derive(Debug)]
pub struct ReplanChecker {
    config: ReplanConfig,

    prev_traj_points: Option<Vec<TrajectoryPoint>>,
    prev_ego_pose: Option<Pose>,
    prev_replanned_time_sec: Option<f64>,
}

impl ReplanChecker {
    pub fn new(config: ReplanConfig) -> Self {
        Self {
            config,
            prev_traj_points: None,
            prev_ego_pose: None,
            prev_replanned_time_sec: None,
        }
    }

    /// Whether this tick has to run the optimizer
    pub fn is_replan_required(
        &self,
        current_traj_points: &[TrajectoryPoint],
        ego_pose: &Pose,
        current_time_sec: f64,
    ) -> bool {
        let (prev_traj, prev_ego, prev_time) = match (
            self.prev_traj_points.as_ref(),
            self.prev_ego_pose.as_ref(),
            self.prev_replanned_time_sec,
        ) {
            (Some(t), Some(e), Some(s)) => (t, e, s),
            _ => return true,
        };

        let shape_change = max_nearest_distance(current_traj_points, prev_traj);
        if shape_change > self.config.max_path_shape_change_dist {
            debug!("replan: path shape changed by {:.3} m", shape_change);
            return true;
        }

        let ego_moved = ego_pose.distance_xy(prev_ego);
        if ego_moved > self.config.max_ego_moving_dist {
            debug!("replan: ego moved {:.3} m", ego_moved);
            return true;
        }

        let elapsed = current_time_sec - prev_time;
        if elapsed > self.config.max_delta_time_sec {
            debug!("replan: previous plan is {:.2} s old", elapsed);
            return true;
        }

        false
    }

    /// Record the data the next tick is compared against
    pub fn update_previous_data(
        &mut self,
        traj_points: &[TrajectoryPoint],
        ego_pose: &Pose,
        current_time_sec: f64,
    ) {
        self.prev_traj_points = Some(traj_points.to_vec());
        self.prev_ego_pose = Some(*ego_pose);
        self.prev_replanned_time_sec = Some(current_time_sec);
    }

    /// Drop all previous data; the next tick replans unconditionally
    pub fn reset(&mut self) {
        self.prev_traj_points = None;
        self.prev_ego_pose = None;
        self.prev_replanned_time_sec = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trajectory::{path_to_trajectory, straight_path};

    fn make_traj() -> Vec<TrajectoryPoint> {
        path_to_trajectory(&straight_path(20.0, 1.0, 2.0))
    }

    #[test]
    fn test_replans_without_previous_data() {
        let checker = ReplanChecker::new(ReplanConfig::default());
        let traj = make_traj();
        let ego = Pose::from_xy_yaw(0.0, 0.0, 0.0);
        assert!(checker.is_replan_required(&traj, &ego, 0.0));
    }

    #[test]
    fn test_identical_tick_is_suppressed() {
        let mut checker = ReplanChecker::new(ReplanConfig::default());
        let traj = make_traj();
        let ego = Pose::from_xy_yaw(0.0, 0.0, 0.0);

        checker.update_previous_data(&traj, &ego, 0.0);
        assert!(!checker.is_replan_required(&traj, &ego, 0.1));
    }

    #[test]
    fn test_path_shape_change_triggers() {
        let mut checker = ReplanChecker::new(ReplanConfig::default());
        let traj = make_traj();
        let ego = Pose::from_xy_yaw(0.0, 0.0, 0.0);
        checker.update_previous_data(&traj, &ego, 0.0);

        let mut shifted = make_traj();
        for p in &mut shifted {
            p.pose.position.y += 1.0;
        }
        assert!(checker.is_replan_required(&shifted, &ego, 0.1));
    }

    #[test]
    fn test_ego_motion_triggers() {
        let mut checker = ReplanChecker::new(ReplanConfig::default());
        let traj = make_traj();
        checker.update_previous_data(&traj, &Pose::from_xy_yaw(0.0, 0.0, 0.0), 0.0);

        let far = Pose::from_xy_yaw(6.0, 0.0, 0.0);
        assert!(checker.is_replan_required(&traj, &far, 0.1));
    }

    #[test]
    fn test_elapsed_time_triggers() {
        let mut checker = ReplanChecker::new(ReplanConfig::default());
        let traj = make_traj();
        let ego = Pose::from_xy_yaw(0.0, 0.0, 0.0);
        checker.update_previous_data(&traj, &ego, 0.0);

        assert!(!checker.is_replan_required(&traj, &ego, 1.9));
        assert!(checker.is_replan_required(&traj, &ego, 2.1));
    }

    #[test]
    fn test_reset_forces_replan() {
        let mut checker = ReplanChecker::new(ReplanConfig::default());
        let traj = make_traj();
        let ego = Pose::from_xy_yaw(0.0, 0.0, 0.0);
        checker.update_previous_data(&traj, &ego, 0.0);
        checker.reset();
        assert!(checker.is_replan_required(&traj, &ego, 0.1));
    }
}

//! # Data Store
//!
//! Global data store for the executable: ingress-owned state (odometry
//! latch, risk map, peer reservations, waypoint queue) and monitoring
//! counters. Ingestion does bookkeeping only; all heavy computation runs on
//! the supervisor's tick.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::collections::VecDeque;

use comms_if::ingress::IngressMsg;
use log::{info, warn};
use nalgebra::Vector3;

use crate::deconflict::Mader;
use crate::map::{GridError, RiskMap};
use crate::params::PlanExecParams;
use crate::state::OdomLatch;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Global data store for the executable.
pub struct DataStore {
    pub params: PlanExecParams,

    // Vehicle state
    pub odom: OdomLatch,

    // Risk map
    pub risk_map: RiskMap,

    // Peer reservations
    pub mader: Mader,

    // Goal management
    pub waypoints: VecDeque<Vector3<f64>>,
    pub exec_triggered: bool,

    // Monitoring counters
    /// Number of cycles already executed
    pub num_cycles: u64,

    /// Number of consecutive cycle overruns
    pub num_consec_cycle_overruns: u64,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl DataStore {
    pub fn new(params: PlanExecParams) -> Result<Self, GridError> {
        let mut waypoints = VecDeque::new();
        waypoints.push_back(Vector3::from(params.sup.goal_m));

        Ok(Self {
            odom: OdomLatch::new(params.sup.max_differentiated_current_a),
            risk_map: RiskMap::new(params.map.clone())?,
            mader: Mader::new(params.deconflict.clone(), params.drone_id),
            waypoints,
            exec_triggered: false,
            num_cycles: 0,
            num_consec_cycle_overruns: 0,
            params,
        })
    }

    /// Ingest one message. Called for every message drained from the ingress
    /// channel at the top of a cycle.
    pub fn ingest(&mut self, msg: &IngressMsg, now_s: f64) {
        match msg {
            IngressMsg::Pose(pose) => self.odom.set_pose(pose),

            IngressMsg::Velocity(vel) => self.odom.set_velocity(vel),

            IngressMsg::PointCloud(cloud) => {
                // The cloud is paired with the most recent pose; without one
                // the map has no center to build around
                let pose = match self.odom.get() {
                    Some(s) => s.position_m,
                    None => {
                        warn!("Point cloud received before any pose, dropped");
                        return;
                    }
                };

                self.mader.expire(now_s);
                let peer_slices = self.mader.slice_points(
                    cloud.stamp_s,
                    self.params.map.prediction_slices,
                    self.params.map.time_resolution_s,
                );
                self.risk_map.update(cloud, &pose, &peer_slices);
            }

            IngressMsg::PeerTraj(traj) => {
                self.mader.register_peer_trajectory(traj, now_s);
            }

            IngressMsg::Trigger(trigger) => {
                if !self.exec_triggered {
                    info!("Execution trigger received");
                    self.exec_triggered = true;
                }
                if let Some(goal) = trigger.goal_m {
                    if self.waypoints.is_empty() {
                        info!("New goal received: {:.2}, {:.2}, {:.2}", goal.x, goal.y, goal.z);
                        self.waypoints.push_back(goal);
                    }
                }
            }

            IngressMsg::ObstacleGroundTruth(gt) => {
                self.risk_map.predictor_mut().ingest_ground_truth(gt);
            }
        }
    }

    /// The goal currently being pursued.
    pub fn current_goal(&self) -> Option<Vector3<f64>> {
        self.waypoints.front().copied()
    }

    /// Pop the reached waypoint and reset the trigger, returning to waiting.
    pub fn pop_waypoint(&mut self) {
        self.waypoints.pop_front();
        self.exec_triggered = false;
        info!("Waypoint popped, {} remaining", self.waypoints.len());
    }

    /// True once odometry and at least one map update have been received.
    pub fn inputs_present(&self) -> bool {
        self.odom.is_received() && self.risk_map.is_updated()
    }
}

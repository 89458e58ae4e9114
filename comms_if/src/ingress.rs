//! # Ingress messages
//!
//! Messages consumed by the planner. All stamps are session-elapsed seconds.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::traj::TrajMsg;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Odometry pose of the vehicle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoseMsg {
    /// Position in the world frame, in meters.
    pub position_m: Vector3<f64>,

    /// Attitude of the vehicle in the world frame.
    pub orientation: UnitQuaternion<f64>,

    /// Session time of the measurement, in seconds.
    pub stamp_s: f64,
}

/// Odometry velocity of the vehicle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VelocityMsg {
    /// Linear velocity in the world frame, in meters/second.
    pub linear_ms: Vector3<f64>,

    /// Angular velocity in the body frame, in radians/second.
    pub angular_rads: Vector3<f64>,

    /// Session time of the measurement, in seconds.
    pub stamp_s: f64,
}

/// A sensed point cloud.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointCloudMsg {
    /// Points in the frame given by `frame`.
    pub points_m: Vec<Vector3<f64>>,

    /// Session time of the scan, in seconds.
    pub stamp_s: f64,

    /// Name of the frame the points are expressed in.
    pub frame: String,
}

/// Trigger starting execution, optionally carrying a goal pose.
///
/// If the vehicle already has queued waypoints the goal field is ignored and
/// the head of the queue is used instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerMsg {
    /// Session time the trigger was issued, in seconds.
    pub stamp_s: f64,

    /// Goal position in the world frame, in meters.
    pub goal_m: Option<Vector3<f64>>,
}

/// Ground truth state of the dynamic obstacles, simulation only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObstacleGroundTruthMsg {
    pub markers: Vec<ObstacleMarker>,
}

/// One simulated obstacle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObstacleMarker {
    pub kind: ObstacleKind,

    /// Position of the obstacle reference point in the world frame, in meters.
    pub position_m: Vector3<f64>,

    /// Characteristic width (cylinder radius, ring diameter) in meters.
    pub width_m: f64,

    /// Characteristic height in meters.
    pub height_m: f64,

    /// Velocity of the obstacle in the world frame, in meters/second.
    pub velocity_ms: Vector3<f64>,

    /// Attitude of the obstacle in the world frame.
    pub orientation: UnitQuaternion<f64>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// The class of a simulated obstacle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObstacleKind {
    /// A vertical cylinder, moving in the horizontal plane.
    Cylinder,

    /// A planar ring (gate), possibly tilted.
    Ring,
}

/// Union of all ingress messages, for queueing on a single channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IngressMsg {
    Pose(PoseMsg),
    Velocity(VelocityMsg),
    PointCloud(PointCloudMsg),
    PeerTraj(TrajMsg),
    Trigger(TriggerMsg),
    ObstacleGroundTruth(ObstacleGroundTruthMsg),
}

//! # Egress messages
//!
//! Messages published by the planner for the tracker, peers, and
//! introspection tooling.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

pub use crate::traj::TrajMsg;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// A full kinematic boundary state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BoundaryState {
    pub position_m: Vector3<f64>,
    pub velocity_ms: Vector3<f64>,
    pub acceleration_ms2: Vector3<f64>,
}

/// One face of a convex polytope, as a point on the plane and the outward
/// normal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FaceMsg {
    pub point_m: Vector3<f64>,
    pub normal: Vector3<f64>,
}

/// One timed polytope of a safe flight corridor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolytopeMsg {
    /// Time the trajectory is allowed to spend inside this polytope, seconds.
    pub duration_s: f64,

    pub faces: Vec<FaceMsg>,
}

/// The safe flight corridor of one planning cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorridorMsg {
    /// Session time the corridor was generated, in seconds.
    pub stamp_s: f64,

    /// Boundary state at the corridor entry.
    pub start_state: BoundaryState,

    /// Boundary state at the corridor exit.
    pub end_state: BoundaryState,

    pub polytopes: Vec<PolytopeMsg>,
}

/// Occupied-voxel positions of the current map slice, for introspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OccupancyCloudMsg {
    /// Session time of the underlying map update, in seconds.
    pub stamp_s: f64,

    /// World-frame position of the map center at the update instant.
    pub map_center_m: Vector3<f64>,

    /// World-frame positions of occupied voxel centers.
    pub points_m: Vec<Vector3<f64>>,
}

//! # Planner parameters
//!
//! All configurable values of the executable, nested per module and loaded
//! from a single TOML file via [`util::params::load`].

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use serde::Deserialize;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct PlanExecParams {
    /// Identifier of this vehicle within the swarm.
    pub drone_id: u32,

    /// Dense trajectory sampling step used by collision checks, deconfliction
    /// and corridor satisfaction tests, in seconds.
    pub planning_time_step_s: f64,

    pub map: MapParams,

    pub search: SearchParams,

    pub corridor: CorridorParams,

    pub traj_opt: TrajOptParams,

    pub deconflict: DeconflictParams,

    pub sup: SupervisorParams,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MapParams {
    /// Edge length of one voxel in meters.
    pub voxel_resolution_m: f64,

    /// Number of voxels along the x axis.
    pub map_length_voxels: usize,

    /// Number of voxels along the y axis.
    pub map_width_voxels: usize,

    /// Number of voxels along the z axis.
    pub map_height_voxels: usize,

    /// Number of future time slices held by the risk tensor.
    pub prediction_slices: usize,

    /// Separation between future time slices in seconds.
    pub time_resolution_s: f64,

    /// Risk above which a single voxel is considered occupied.
    pub risk_threshold_single_voxel: f32,

    /// Radius by which obstacles are inflated in collision tests, in meters.
    pub clearance_m: f64,

    /// Which obstacle velocity source backs the future slices.
    pub predictor: PredictorKind,

    /// Gating distance for matching obstacle clusters between scans, in
    /// meters. Only used by the particle predictor.
    pub cluster_match_gate_m: f64,
}

/// Selects the obstacle velocity source of the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictorKind {
    /// Ground-truth obstacle states supplied by the simulator.
    Fake,

    /// Velocities estimated from the cloud by the dynamic-occupancy filter.
    Particle,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchParams {
    /// Duration of one motion primitive, in seconds.
    pub a_star_search_time_step_s: f64,

    /// Acceleration sampling step per axis, in meters/second^2.
    pub a_star_acc_sample_step: f64,

    /// Horizontal velocity bound of the search, in meters/second.
    pub max_vel_ms: f64,

    /// Vertical velocity bound of the search, in meters/second.
    pub max_vel_z_ms: f64,

    /// Acceleration bound per axis, in meters/second^2.
    pub max_acc_ms2: f64,

    /// Whether to sample accelerations in the z axis. If false the search is
    /// planar and primitives keep their initial vertical velocity.
    pub sample_z_acc: bool,

    /// Whether the search constrains node altitude to the height band.
    pub use_height_limit: bool,

    /// Lower edge of the height band, world frame, in meters.
    pub height_limit_min_m: f64,

    /// Upper edge of the height band, world frame, in meters.
    pub height_limit_max_m: f64,

    /// Summed sampled risk above which a motion primitive is rejected.
    pub risk_threshold_motion_primitive: f32,

    /// Margin kept between primitives and the map boundary so corridors have
    /// room to expand, in meters.
    pub expand_safety_distance_m: f64,

    /// Time cost weight of the edge cost.
    pub time_weight: f64,

    /// Control effort weight of the edge cost.
    pub effort_weight: f64,

    /// Risk weight of the edge cost.
    pub risk_weight: f64,

    /// Hard cap on the number of node expansions per search.
    pub max_expansions: usize,

    /// Wall-clock budget of one search, in seconds.
    pub duration_budget_s: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CorridorParams {
    /// One polytope is built per this many reference nodes.
    pub stride: usize,

    /// Maximum distance a polytope face may expand away from its seed
    /// segment, in meters.
    pub bloat_m: f64,

    /// Risk above which a voxel contributes an obstacle point to corridor
    /// construction.
    pub risk_threshold_corridor: f32,

    /// Enable the short-cut pass merging a polytope into its successor.
    pub enable_short_cut: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrajOptParams {
    /// Velocity bound checked on the optimised trajectory, per axis, in
    /// meters/second.
    pub max_vel_optimization: f64,

    /// Acceleration bound checked on the optimised trajectory, per axis, in
    /// meters/second^2.
    pub max_acc_optimization: f64,

    /// Inward margin applied to polytopes when checking and re-optimising, in
    /// meters.
    pub delta_corridor: f64,

    /// Weights of the optimiser cost terms.
    pub factors: OptFactors,

    /// Maximum number of polynomial pieces in one trajectory.
    pub trajectory_piece_max_size: usize,
}

/// Weights of the smoothness functional.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct OptFactors {
    /// Weight on the integral of squared snap.
    pub snap: f64,

    /// Weight on the integral of squared jerk.
    pub jerk: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeconflictParams {
    /// Minimum allowed distance between this vehicle and any peer sample, in
    /// meters.
    pub safety_distance_m: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorParams {
    /// Initial goal position in the world frame, in meters.
    pub goal_m: [f64; 3],

    /// Distance to the goal below which it counts as reached, in meters.
    pub goal_tolerance_m: f64,

    /// Tracking deviation from the committed trajectory above which a replan
    /// is forced, in meters.
    pub replan_tolerance_m: f64,

    /// Time between routine replans while executing, in seconds.
    pub replan_duration_s: f64,

    /// Per-axis cap applied to the differentiated acceleration, in
    /// meters/second^2.
    pub max_differentiated_current_a: f64,

    /// If true, introspection output stays in the map-centered frame rather
    /// than following the vehicle.
    pub is_map_center_locked: bool,
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_default_params_file_parses() {
        let text = include_str!("../plan_exec.toml");
        let params: PlanExecParams = util::params::from_str(text).unwrap();

        assert!(params.map.voxel_resolution_m > 0.0);
        assert!(params.map.prediction_slices > 1);
        assert!(params.search.a_star_search_time_step_s > params.planning_time_step_s);
        assert_eq!(params.corridor.stride, 2);
        assert!(params.traj_opt.delta_corridor >= 0.0);
    }
}

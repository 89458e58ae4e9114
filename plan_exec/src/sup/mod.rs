//! # Planner supervisor
//!
//! The finite state machine driving the replanning cycle. The supervisor
//! runs on a fixed cadence, is the sole writer of the committed trajectory
//! and the sole publisher: each successful plan is committed only after the
//! deconfliction check-and-recheck passes, and an unsafe committed
//! trajectory triggers an emergency replan from the last safe hover point.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

pub mod fsm;

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::egress::{BoundaryState, CorridorMsg, TrajMsg};
use log::{error, info, warn};
use nalgebra::Vector3;

use crate::corridor::{CorridorError, CorridorGen, Polytope};
use crate::data_store::DataStore;
use crate::map::risk_map::Occupancy;
use crate::params::PlanExecParams;
use crate::search::{KinoAstar, SearchError, TimedNode};
use crate::traj_opt::min_snap::MAX_REOPT_ITERATIONS;
use crate::traj_opt::{CorridorMinSnap, TrajOptError, Trajectory};

pub use fsm::{next_state, CycleEvents, FsmState};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// The planner supervisor.
pub struct Supervisor {
    params: PlanExecParams,
    state: FsmState,

    search: KinoAstar,
    corridor_gen: CorridorGen,
    optimizer: CorridorMinSnap,

    /// The committed trajectory currently being executed.
    committed: Option<Trajectory>,

    /// Monotonic id of the last committed trajectory.
    traj_idx: u32,

    /// Heading of the previous cycle's first primitive, fed back into the
    /// search tie-break to damp oscillation.
    ref_heading_rad: Option<f64>,

    /// Session time of the last successful plan.
    last_plan_time_s: f64,

    /// Fall-back hover point for the next emergency plan, world frame.
    emergency_start_m: Option<Vector3<f64>>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Messages emitted by one supervisor tick, to be forwarded by the transport
/// layer.
#[derive(Debug, Clone)]
pub enum Egress {
    /// Committed trajectory for this vehicle's own tracker.
    Traj(TrajMsg),

    /// The same trajectory on the broadcast topic for peer deconfliction.
    BroadcastTraj(TrajMsg),

    /// The corridor of the committed plan, for introspection.
    Corridor(CorridorMsg),
}

/// Why one planning attempt produced no committed trajectory.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("Pose, map or goal not available yet")]
    InputMissing,

    #[error("Search failed: {0}")]
    Search(#[from] SearchError),

    #[error("Corridor generation failed: {0}")]
    Corridor(#[from] CorridorError),

    #[error("Trajectory optimization failed: {0}")]
    TrajOpt(#[from] TrajOptError),

    #[error("Candidate trajectory conflicts with a peer reservation")]
    PeerConflict,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Supervisor {
    pub fn new(params: PlanExecParams) -> Self {
        Self {
            search: KinoAstar::new(params.search.clone(), params.planning_time_step_s),
            corridor_gen: CorridorGen::new(
                params.corridor.clone(),
                params.planning_time_step_s,
                params.traj_opt.delta_corridor,
            ),
            optimizer: CorridorMinSnap::new(&params.traj_opt),
            committed: None,
            traj_idx: 0,
            ref_heading_rad: None,
            last_plan_time_s: 0.0,
            emergency_start_m: None,
            state: FsmState::Init,
            params,
        }
    }

    pub fn state(&self) -> FsmState {
        self.state
    }

    pub fn committed(&self) -> Option<&Trajectory> {
        self.committed.as_ref()
    }

    /// One supervisor cycle. Observes the data store, possibly plans, and
    /// advances the state machine. Returns the messages to publish.
    pub fn tick(&mut self, ds: &mut DataStore, now_s: f64) -> Vec<Egress> {
        ds.num_cycles += 1;
        let mut egress = Vec::new();

        let mut ev = CycleEvents {
            inputs_present: ds.inputs_present(),
            goal_present: ds.exec_triggered && ds.current_goal().is_some(),
            ..Default::default()
        };
        ev.at_goal = match (ds.odom.get(), ds.current_goal()) {
            (Some(state), Some(goal)) => {
                (state.position_m - goal).norm() < self.params.sup.goal_tolerance_m
            }
            _ => false,
        };

        match self.state {
            FsmState::Replan | FsmState::EmergencyReplan => {
                if ev.inputs_present && ev.goal_present && !ev.at_goal {
                    let emergency = self.state == FsmState::EmergencyReplan;
                    match self.plan(ds, now_s, emergency) {
                        Ok(mut out) => {
                            ev.plan_outcome = Some(true);
                            egress.append(&mut out);
                        }
                        Err(e) => {
                            warn!("Replanning failed: {}", e);
                            ev.plan_outcome = Some(false);
                        }
                    }
                }
            }

            FsmState::ExecTraj => {
                ev.committed_unsafe = self.committed_unsafe(ds, now_s);
                if ev.committed_unsafe {
                    // Empty the committed queue; the emergency plan starts
                    // from the stored hover point at rest
                    self.committed = None;
                } else {
                    let deviation = self.tracking_deviation(ds, now_s);
                    ev.replan_due = now_s - self.last_plan_time_s
                        >= self.params.sup.replan_duration_s
                        || deviation > self.params.sup.replan_tolerance_m;
                }
            }

            FsmState::GoalReached => {
                ds.pop_waypoint();
                self.committed = None;
            }

            _ => (),
        }

        let next = next_state(self.state, &ev);
        if next != self.state {
            info!("[FSM] {} >> {}", self.state, next);
            self.state = next;
        }

        egress
    }

    /// Run the full planning pipeline once: snapshot, search, corridor,
    /// optimization, deconfliction, commit.
    fn plan(
        &mut self,
        ds: &mut DataStore,
        now_s: f64,
        emergency: bool,
    ) -> Result<Vec<Egress>, PlanError> {
        if !ds.risk_map.is_updated() {
            return Err(PlanError::InputMissing);
        }
        let snapshot = ds.risk_map.snapshot();
        let odom = ds.odom.get().ok_or(PlanError::InputMissing)?;
        let goal_world = ds.current_goal().ok_or(PlanError::InputMissing)?;

        let sp = &self.params.search;

        // Start state: the emergency plan starts from the fall-back hover
        // point at rest, the routine plan from the current odometry with the
        // velocity truncated to the search bounds
        let (p0, v0, a0) = if emergency {
            let p = self.emergency_start_m.unwrap_or(odom.position_m);
            (p, Vector3::zeros(), Vector3::zeros())
        } else {
            let v = Vector3::new(
                odom.velocity_ms.x.clamp(-sp.max_vel_ms, sp.max_vel_ms),
                odom.velocity_ms.y.clamp(-sp.max_vel_ms, sp.max_vel_ms),
                odom.velocity_ms.z.clamp(-sp.max_vel_z_ms, sp.max_vel_z_ms),
            );
            (odom.position_m, v, odom.acceleration_ms2)
        };

        // Shift into the map-centered frame and pull the goal inside the map
        let center = snapshot.center_m;
        let start = TimedNode {
            time_s: 0.0,
            position_m: p0 - center,
            velocity_ms: v0,
        };
        let inset = sp.expand_safety_distance_m + snapshot.grid.resolution_m;
        let goal_map = Vector3::new(
            (goal_world.x - center.x)
                .clamp(-(snapshot.grid.half_length_m - inset), snapshot.grid.half_length_m - inset),
            (goal_world.y - center.y)
                .clamp(-(snapshot.grid.half_width_m - inset), snapshot.grid.half_width_m - inset),
            (goal_world.z - center.z)
                .clamp(-(snapshot.grid.half_height_m - inset), snapshot.grid.half_height_m - inset),
        );

        let nodes_map = self.search.search(
            &start,
            &goal_map,
            0.0,
            0.5 * self.params.sup.goal_tolerance_m,
            sp.expand_safety_distance_m,
            self.ref_heading_rad,
            &snapshot,
        )?;

        // Back to the world frame for corridors and optimization
        let mut nodes: Vec<TimedNode> = nodes_map
            .iter()
            .map(|n| TimedNode {
                time_s: n.time_s,
                position_m: n.position_m + center,
                velocity_ms: n.velocity_ms,
            })
            .collect();

        // Feed the chosen heading back into the next cycle's tie-break
        if nodes.len() >= 2 {
            let d = nodes[1].position_m - nodes[0].position_m;
            if d.xy().norm() > 1e-6 {
                self.ref_heading_rad = Some(d.y.atan2(d.x));
            }
        }

        // Bound the plan length to the piece budget
        let stride = self.params.corridor.stride.max(1);
        let max_nodes = self.params.traj_opt.trajectory_piece_max_size * stride + 1;
        if nodes.len() > max_nodes {
            nodes.truncate(max_nodes);
        }

        // Corridor construction against map and peer obstacle points
        let mut corridors = {
            let mader = &ds.mader;
            let corridor_thresh = self.params.corridor.risk_threshold_corridor;
            let dt_sample = self.params.planning_time_step_s;
            let snap = &snapshot;
            self.corridor_gen.find_corridors(
                &nodes,
                now_s,
                sp.expand_safety_distance_m,
                |t_lo, t_hi, lo, hi| {
                    let mut pts = Vec::new();
                    snap.get_obstacle_points(&mut pts, t_lo, t_hi, lo, hi, corridor_thresh);
                    mader.get_obstacle_points(&mut pts, t_hi - t_lo, dt_sample, t_lo);
                    pts
                },
            )?
        };

        // The fallback splitting inside corridor generation can exceed the
        // piece budget; drop the tail and end the plan at the last kept
        // corridor's exit node
        let max_pieces = self.params.traj_opt.trajectory_piece_max_size.max(1);
        if corridors.len() > max_pieces {
            corridors.truncate(max_pieces);
        }
        let end_position = corridors[corridors.len() - 1].seed[1];
        let last = nodes
            .iter()
            .find(|n| n.position_m == end_position)
            .copied()
            .unwrap_or(nodes[nodes.len() - 1]);

        // Boundary states and time allocation
        let init = BoundaryState {
            position_m: p0,
            velocity_ms: v0,
            acceleration_ms2: a0,
        };
        let final_state = BoundaryState {
            position_m: last.position_m,
            velocity_ms: last.velocity_ms,
            acceleration_ms2: Vector3::zeros(),
        };

        let durations: Vec<f64> = corridors.iter().map(|c| c.duration_s).collect();
        let junctions: Vec<Vector3<f64>> = corridors
            .iter()
            .take(corridors.len().saturating_sub(1))
            .map(|c| c.seed[1])
            .collect();

        self.optimizer
            .setup(init, final_state, durations, corridors.clone(), junctions)?;
        self.solve()?;

        // Iterative tightening until the corridor and the kinematic caps are
        // satisfied
        let v_max_opt = self.params.traj_opt.max_vel_optimization;
        let a_max_opt = self.params.traj_opt.max_acc_optimization;
        let delta = self.params.traj_opt.delta_corridor;
        let dt_sample = self.params.planning_time_step_s;
        let mut satisfied =
            self.optimizer
                .is_corridor_satisfied(v_max_opt, a_max_opt, delta, dt_sample);
        let mut iterations = 0;
        while !satisfied && iterations < MAX_REOPT_ITERATIONS {
            self.resolve()?;
            satisfied =
                self.optimizer
                    .is_corridor_satisfied(v_max_opt, a_max_opt, delta, dt_sample);
            iterations += 1;
        }
        if !satisfied {
            return Err(PlanError::TrajOpt(TrajOptError::NoSolution));
        }

        let mut traj = self
            .optimizer
            .get_trajectory()
            .ok_or(PlanError::TrajOpt(TrajOptError::NoSolution))?;
        traj.start_time_s = now_s;

        // Deconfliction: check, then recheck for updates which arrived
        // during the optimization window
        if !ds.mader.is_safe_after_opt(&traj, dt_sample, now_s) {
            return Err(PlanError::PeerConflict);
        }
        if !ds.mader.is_safe_after_chk() {
            warn!("Peer update arrived while checking, candidate discarded");
            return Err(PlanError::PeerConflict);
        }

        // Commit and publish
        self.traj_idx += 1;
        let msg = traj.to_msg(self.params.drone_id, self.traj_idx, now_s);
        let corridor_msg = self.corridor_msg(init, final_state, &corridors, &center, now_s);

        info!(
            "Plan {} committed: {} pieces, {:.2} s horizon",
            self.traj_idx,
            traj.pieces.len(),
            traj.total_duration_s()
        );

        self.committed = Some(traj);
        self.last_plan_time_s = now_s;
        self.emergency_start_m = None;

        Ok(vec![
            Egress::Traj(msg.clone()),
            Egress::BroadcastTraj(msg),
            Egress::Corridor(corridor_msg),
        ])
    }

    /// Run the optimizer, converting a crash into `NoSolution` as a
    /// non-fatal plan failure.
    fn solve(&mut self) -> Result<(), PlanError> {
        match self.optimizer.optimize() {
            Err(TrajOptError::OptimizerCrashed) => {
                error!("Optimizer crashed!");
                Err(PlanError::TrajOpt(TrajOptError::NoSolution))
            }
            other => Ok(other?),
        }
    }

    fn resolve(&mut self) -> Result<(), PlanError> {
        match self.optimizer.re_optimize() {
            Err(TrajOptError::OptimizerCrashed) => {
                error!("Optimizer crashed!");
                Err(PlanError::TrajOpt(TrajOptError::NoSolution))
            }
            other => Ok(other?),
        }
    }

    /// Risk and peer checks of the remaining committed trajectory. On
    /// detection the fall-back hover point is stored for the emergency plan.
    fn committed_unsafe(&mut self, ds: &DataStore, now_s: f64) -> bool {
        let traj = match &self.committed {
            Some(t) => t,
            None => return false,
        };

        let t_rel_now = (now_s - traj.start_time_s).max(0.0);
        let total = traj.total_duration_s();
        if t_rel_now >= total {
            return false;
        }

        let snapshot = ds.risk_map.snapshot();
        let dt = self.params.planning_time_step_s;

        let mut risk_sum = 0.0f32;
        let mut last_safe: Option<Vector3<f64>> = None;
        let mut unsafe_seen = false;

        let num = ((total - t_rel_now) / dt).ceil() as usize;
        for j in 0..=num {
            let t_rel = (t_rel_now + j as f64 * dt).min(total);
            let pos = traj.position(t_rel);
            let dt_map = traj.start_time_s + t_rel - snapshot.stamp_s;

            if let Some(r) = snapshot.risk_at_offset(&pos, dt_map) {
                risk_sum += r;
            }
            match snapshot.clear_occupancy(&pos, dt_map) {
                Occupancy::Free => {
                    if !unsafe_seen {
                        last_safe = Some(pos);
                    }
                }
                Occupancy::Occupied => unsafe_seen = true,
                Occupancy::OutOfRange => (),
            }
        }

        let risk_unsafe = risk_sum > self.params.search.risk_threshold_motion_primitive;
        let peer_unsafe = ds.mader.conflicts_with(traj, dt, t_rel_now);

        if risk_unsafe || peer_unsafe {
            warn!(
                "Committed trajectory unsafe (risk sum {:.2}, peer conflict: {})",
                risk_sum, peer_unsafe
            );
            self.emergency_start_m =
                last_safe.or_else(|| ds.odom.get().map(|s| s.position_m));
            true
        } else {
            false
        }
    }

    /// Distance between the vehicle and the committed trajectory's sample at
    /// the current time.
    fn tracking_deviation(&self, ds: &DataStore, now_s: f64) -> f64 {
        match (&self.committed, ds.odom.get()) {
            (Some(traj), Some(state)) => {
                let expected = traj.position(now_s - traj.start_time_s);
                (state.position_m - expected).norm()
            }
            _ => 0.0,
        }
    }

    /// Build the corridor introspection message, optionally re-expressed in
    /// the map-centered frame.
    fn corridor_msg(
        &self,
        mut start_state: BoundaryState,
        mut end_state: BoundaryState,
        corridors: &[Polytope],
        center: &Vector3<f64>,
        now_s: f64,
    ) -> CorridorMsg {
        let shift = if self.params.sup.is_map_center_locked {
            *center
        } else {
            Vector3::zeros()
        };

        start_state.position_m -= shift;
        end_state.position_m -= shift;

        let polytopes = corridors
            .iter()
            .zip(self.optimizer.durations_s())
            .map(|(c, d)| {
                let mut msg = c.to_msg();
                msg.duration_s = *d;
                for face in msg.faces.iter_mut() {
                    face.point_m -= shift;
                }
                msg
            })
            .collect();

        CorridorMsg {
            stamp_s: now_s,
            start_state,
            end_state,
            polytopes,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

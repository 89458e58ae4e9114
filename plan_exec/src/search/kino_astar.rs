//! Risk-aware kinodynamic A* over constant-acceleration motion primitives.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::collections::{BinaryHeap, HashSet};
use std::time::Instant;

use log::{debug, trace};
use nalgebra::Vector3;

use crate::map::RiskSnapshot;
use crate::map::risk_map::Occupancy;
use crate::params::SearchParams;

use super::{SearchError, TimedNode};

// -----------------------------------------------------------------------------------------------
// STRUCTS
// -----------------------------------------------------------------------------------------------

/// The kinodynamic A* planner.
#[derive(Debug, Clone)]
pub struct KinoAstar {
    params: SearchParams,

    /// Dense sampling step along a primitive for risk evaluation, in seconds.
    dt_sample_s: f64,
}

/// An arena node of the search graph.
#[derive(Debug, Clone)]
struct Node {
    position_m: Vector3<f64>,
    velocity_ms: Vector3<f64>,
    time_s: f64,
    depth: usize,
    g: f64,
    parent: Option<usize>,
}

/// A heap entry pointing into the arena.
///
/// Primary key is the total cost `f = g + h`; ties prefer primitives whose
/// planar direction is close to the reference heading from the previous
/// cycle, damping oscillation between near-equal plans.
#[derive(Debug, Clone, Copy)]
struct HeapEntry {
    f: f64,
    heading_penalty: f64,
    id: usize,
}

// -----------------------------------------------------------------------------------------------
// IMPLS
// -----------------------------------------------------------------------------------------------

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.f == other.f && self.heading_penalty == other.heading_penalty
    }
}

impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.partial_cmp(other).expect("Unexpected NaN search cost")
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        // Note that we flip the order here so that the heap will be a
        // min-heap, not a max-heap
        match other.f.partial_cmp(&self.f) {
            Some(std::cmp::Ordering::Equal) => {
                other.heading_penalty.partial_cmp(&self.heading_penalty)
            }
            ord => ord,
        }
    }
}

impl KinoAstar {
    pub fn new(params: SearchParams, dt_sample_s: f64) -> Self {
        Self {
            params,
            dt_sample_s,
        }
    }

    /// Search for a feasible node path from `start` towards `goal_m`, both in
    /// the map-centered frame of the given snapshot.
    ///
    /// `t_start_s` offsets the risk-tensor time axis for all primitive
    /// samples. `safety_margin_m` keeps primitives away from the map boundary
    /// so later corridor expansion has room. `ref_heading_rad` biases tie
    /// breaking towards the heading chosen by the previous cycle.
    pub fn search(
        &self,
        start: &TimedNode,
        goal_m: &Vector3<f64>,
        t_start_s: f64,
        goal_radius_m: f64,
        safety_margin_m: f64,
        ref_heading_rad: Option<f64>,
        snapshot: &RiskSnapshot,
    ) -> Result<Vec<TimedNode>, SearchError> {
        let tic = Instant::now();
        let dt = self.params.a_star_search_time_step_s;

        if !snapshot.grid.is_in_range(&start.position_m) {
            return Err(SearchError::StartOutOfMap);
        }

        let acc_samples = self.acceleration_samples();

        let mut arena: Vec<Node> = vec![Node {
            position_m: start.position_m,
            velocity_ms: start.velocity_ms,
            time_s: t_start_s,
            depth: 0,
            g: 0.0,
            parent: None,
        }];
        let mut open: BinaryHeap<HeapEntry> = BinaryHeap::new();
        let mut closed: HashSet<(usize, (i64, i64, i64))> = HashSet::new();

        open.push(HeapEntry {
            f: self.heuristic(&start.position_m, goal_m),
            heading_penalty: 0.0,
            id: 0,
        });

        let mut expansions = 0usize;

        while let Some(entry) = open.pop() {
            let current = arena[entry.id].clone();

            // Goal test on the popped node
            if (current.position_m - goal_m).norm() <= goal_radius_m && current.depth > 0 {
                let path = self.reconstruct(&arena, entry.id);
                debug!(
                    "Search reached goal ball after {} expansions, {} nodes",
                    expansions,
                    path.len()
                );
                if path.len() <= 1 || path.len() >= 10 {
                    return Err(SearchError::DegeneratePath(path.len()));
                }
                return Ok(path);
            }

            let key = match self.closed_key(&current, snapshot) {
                Some(k) => k,
                None => continue,
            };
            if !closed.insert(key) {
                continue;
            }

            expansions += 1;
            if expansions > self.params.max_expansions
                || tic.elapsed().as_secs_f64() > self.params.duration_budget_s
            {
                trace!("Search budget exhausted after {} expansions", expansions);
                return Err(SearchError::Timeout);
            }

            // Expand one primitive per acceleration sample
            for acc in &acc_samples {
                let vel2 = current.velocity_ms + acc * dt;

                // Per-axis velocity bounds
                if vel2.x.abs() > self.params.max_vel_ms
                    || vel2.y.abs() > self.params.max_vel_ms
                    || vel2.z.abs() > self.params.max_vel_z_ms
                {
                    continue;
                }

                let pos2 =
                    current.position_m + current.velocity_ms * dt + 0.5 * acc * dt * dt;

                // The primitive must stay clear of the map boundary
                if !self.in_map_with_margin(snapshot, &pos2, safety_margin_m) {
                    continue;
                }

                // Height band, applied in the world frame
                if self.params.use_height_limit {
                    let z_world = pos2.z + snapshot.center_m.z;
                    if z_world < self.params.height_limit_min_m
                        || z_world > self.params.height_limit_max_m
                    {
                        continue;
                    }
                }

                // Sample the primitive for risk
                let risk_sum = match self.primitive_risk(
                    snapshot,
                    &current.position_m,
                    &current.velocity_ms,
                    acc,
                    current.time_s,
                ) {
                    Some(r) => r,
                    None => continue,
                };

                let g2 = current.g
                    + self.params.time_weight * dt
                    + self.params.effort_weight * acc.norm_squared()
                    + self.params.risk_weight * risk_sum as f64;

                let id = arena.len();
                arena.push(Node {
                    position_m: pos2,
                    velocity_ms: vel2,
                    time_s: current.time_s + dt,
                    depth: current.depth + 1,
                    g: g2,
                    parent: Some(entry.id),
                });

                open.push(HeapEntry {
                    f: g2 + self.heuristic(&pos2, goal_m),
                    heading_penalty: self.heading_penalty(
                        &current.position_m,
                        &pos2,
                        ref_heading_rad,
                    ),
                    id,
                });
            }
        }

        debug!("Search exhausted the open set after {} expansions", expansions);
        Err(SearchError::NoPath)
    }

    /// The discrete acceleration set: each axis stepped over
    /// `[-max_acc, max_acc]` including zero; z restricted to zero in planar
    /// mode.
    fn acceleration_samples(&self) -> Vec<Vector3<f64>> {
        let step = self.params.a_star_acc_sample_step;
        let n = (self.params.max_acc_ms2 / step).floor() as i64;

        let axis: Vec<f64> = (-n..=n).map(|i| i as f64 * step).collect();
        let z_axis: Vec<f64> = if self.params.sample_z_acc {
            axis.clone()
        } else {
            vec![0.0]
        };

        let mut out = Vec::with_capacity(axis.len() * axis.len() * z_axis.len());
        for &ax in &axis {
            for &ay in &axis {
                for &az in &z_axis {
                    out.push(Vector3::new(ax, ay, az));
                }
            }
        }
        out
    }

    /// Sum of sampled single-voxel risks along a primitive, or `None` if the
    /// primitive must be rejected (inflated collision, out of map, or risk
    /// above the hard thresholds).
    fn primitive_risk(
        &self,
        snapshot: &RiskSnapshot,
        pos: &Vector3<f64>,
        vel: &Vector3<f64>,
        acc: &Vector3<f64>,
        t_node_s: f64,
    ) -> Option<f32> {
        let dt_node = self.params.a_star_search_time_step_s;
        let num = (dt_node / self.dt_sample_s).round().max(1.0) as usize;

        let mut sum = 0.0f32;
        for j in 1..=num {
            let t = j as f64 * self.dt_sample_s;
            let p = pos + vel * t + 0.5 * acc * t * t;
            let world = p + snapshot.center_m;
            let t_query = t_node_s + t;

            match snapshot.clear_occupancy(&world, t_query) {
                Occupancy::Free => (),
                // Out-of-range is unknown, the edge is pruned rather than
                // trusted
                Occupancy::Occupied | Occupancy::OutOfRange => return None,
            }

            let risk = snapshot.risk_at_offset(&world, t_query)?;
            if risk > snapshot.single_voxel_threshold() {
                return None;
            }
            sum += risk;
        }

        if sum > self.params.risk_threshold_motion_primitive {
            return None;
        }
        Some(sum)
    }

    /// Admissible time-optimal lower bound to the goal: the slowest axis at
    /// its velocity cap, weighted by the time cost.
    fn heuristic(&self, pos: &Vector3<f64>, goal: &Vector3<f64>) -> f64 {
        let d = goal - pos;
        let t_xy = d.xy().norm() / self.params.max_vel_ms;
        let t_z = d.z.abs() / self.params.max_vel_z_ms;
        self.params.time_weight * t_xy.max(t_z)
    }

    /// Angle between the primitive's planar direction and the reference
    /// heading, zero when no reference is available.
    fn heading_penalty(
        &self,
        from: &Vector3<f64>,
        to: &Vector3<f64>,
        ref_heading_rad: Option<f64>,
    ) -> f64 {
        let ref_heading = match ref_heading_rad {
            Some(h) => h,
            None => return 0.0,
        };
        let d = to - from;
        if d.xy().norm() < 1e-6 {
            return 0.0;
        }
        let heading = d.y.atan2(d.x);
        util::maths::get_ang_dist_2pi(heading, ref_heading).abs()
    }

    /// Closed-set key: voxel index plus quantized velocity.
    fn closed_key(
        &self,
        node: &Node,
        snapshot: &RiskSnapshot,
    ) -> Option<(usize, (i64, i64, i64))> {
        let idx = snapshot.grid.index_of(&node.position_m)?;
        let v_res = self.params.a_star_acc_sample_step * self.params.a_star_search_time_step_s;
        let bin = |v: f64| (v / (0.5 * v_res)).floor() as i64;
        Some((
            idx,
            (
                bin(node.velocity_ms.x),
                bin(node.velocity_ms.y),
                bin(node.velocity_ms.z),
            ),
        ))
    }

    fn in_map_with_margin(
        &self,
        snapshot: &RiskSnapshot,
        pos: &Vector3<f64>,
        margin_m: f64,
    ) -> bool {
        let g = &snapshot.grid;
        pos.x.abs() < g.half_length_m - margin_m
            && pos.y.abs() < g.half_width_m - margin_m
            && pos.z.abs() < g.half_height_m - margin_m
    }

    /// Walk parent ids from the goal node back to the start.
    fn reconstruct(&self, arena: &[Node], goal_id: usize) -> Vec<TimedNode> {
        let mut path = Vec::new();
        let mut id = Some(goal_id);
        while let Some(i) = id {
            let n = &arena[i];
            path.push(TimedNode {
                time_s: n.time_s,
                position_m: n.position_m,
                velocity_ms: n.velocity_ms,
            });
            id = n.parent;
        }
        path.reverse();
        path
    }
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

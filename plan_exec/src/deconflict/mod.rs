//! # Inter-agent deconfliction
//!
//! Maintains the set of peer trajectory reservations received over the
//! broadcast topic and validates this vehicle's candidate trajectories
//! against them. The discipline is asynchronous check-and-recheck: a
//! candidate passes [`Mader::is_safe_after_opt`] against the reservations
//! known at optimization time, and is only committed if
//! [`Mader::is_safe_after_chk`] confirms that no peer update arrived while
//! the check was in flight.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::collections::HashMap;

use comms_if::traj::TrajMsg;
use log::{debug, warn};
use nalgebra::Vector3;

use crate::params::DeconflictParams;
use crate::traj_opt::{bezier_position, Trajectory};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// A peer's reserved trajectory.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub agent_id: u32,
    pub traj_id: u32,
    pub start_time_s: f64,
    order: usize,
    durations_s: Vec<f64>,
    control_points: Vec<Vector3<f64>>,
}

/// The deconfliction module.
pub struct Mader {
    params: DeconflictParams,

    /// This vehicle's id, whose broadcasts are ignored.
    ego_id: u32,

    /// Most recent reservation per peer.
    reservations: HashMap<u32, Reservation>,

    /// Session time of the last accepted peer update.
    last_update_s: Option<f64>,

    /// Session time of the last optimization-side safety check.
    opt_check_s: Option<f64>,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Reservation {
    fn from_msg(msg: &TrajMsg) -> Option<Self> {
        let per_piece = msg.order as usize + 1;
        if msg.control_points.len() != per_piece * msg.durations_s.len() {
            warn!(
                "Peer {} reservation has inconsistent control point count",
                msg.drone_id
            );
            return None;
        }
        Some(Self {
            agent_id: msg.drone_id,
            traj_id: msg.traj_id,
            start_time_s: msg.start_time_s,
            order: msg.order as usize,
            durations_s: msg.durations_s.clone(),
            control_points: msg.control_points.clone(),
        })
    }

    pub fn total_duration_s(&self) -> f64 {
        self.durations_s.iter().sum()
    }

    /// Sample the reservation at an absolute session time. `None` outside
    /// the reservation's horizon.
    pub fn position_at(&self, t_s: f64) -> Option<Vector3<f64>> {
        let mut t = t_s - self.start_time_s;
        if t < 0.0 || t > self.total_duration_s() {
            return None;
        }

        for (i, d) in self.durations_s.iter().enumerate() {
            if t <= *d {
                let per_piece = self.order + 1;
                let cpts = &self.control_points[i * per_piece..(i + 1) * per_piece];
                return Some(bezier_position(cpts, t / d));
            }
            t -= d;
        }

        None
    }
}

impl Mader {
    pub fn new(params: DeconflictParams, ego_id: u32) -> Self {
        Self {
            params,
            ego_id,
            reservations: HashMap::new(),
            last_update_s: None,
            opt_check_s: None,
        }
    }

    /// Ingest a peer's broadcast trajectory, replacing any previous
    /// reservation of the same agent.
    pub fn register_peer_trajectory(&mut self, msg: &TrajMsg, now_s: f64) {
        if msg.drone_id == self.ego_id {
            return;
        }
        let reservation = match Reservation::from_msg(msg) {
            Some(r) => r,
            None => return,
        };
        debug!(
            "Reservation of agent {} traj {} registered",
            reservation.agent_id, reservation.traj_id
        );
        self.reservations.insert(msg.drone_id, reservation);
        self.last_update_s = Some(now_s);
    }

    /// Drop reservations whose horizon has elapsed.
    pub fn expire(&mut self, now_s: f64) {
        self.reservations
            .retain(|_, r| r.start_time_s + r.total_duration_s() >= now_s);
    }

    /// Number of currently active reservations.
    pub fn num_active(&self) -> usize {
        self.reservations.len()
    }

    /// Append world-frame samples of every active reservation, sampled every
    /// `dt_sample_s` from `now_s` up to `now_s + horizon_s`.
    pub fn get_obstacle_points(
        &self,
        out: &mut Vec<Vector3<f64>>,
        horizon_s: f64,
        dt_sample_s: f64,
        now_s: f64,
    ) {
        let num = (horizon_s / dt_sample_s).ceil() as usize;
        for reservation in self.reservations.values() {
            for j in 0..=num {
                if let Some(p) = reservation.position_at(now_s + j as f64 * dt_sample_s) {
                    out.push(p);
                }
            }
        }
    }

    /// Peer positions per future time slice, for overlay onto the risk map.
    pub fn slice_points(
        &self,
        now_s: f64,
        slices: usize,
        time_resolution_s: f64,
    ) -> Vec<Vec<Vector3<f64>>> {
        (0..slices)
            .map(|k| {
                let t = now_s + k as f64 * time_resolution_s;
                self.reservations
                    .values()
                    .filter_map(|r| r.position_at(t))
                    .collect()
            })
            .collect()
    }

    /// True if the trajectory's samples come within the safety distance of
    /// any time-aligned peer sample. Sampling starts `from_rel_s` seconds
    /// into the trajectory.
    pub fn conflicts_with(&self, traj: &Trajectory, dt_sample_s: f64, from_rel_s: f64) -> bool {
        let total = traj.total_duration_s();
        let num = (total / dt_sample_s).ceil() as usize;

        for reservation in self.reservations.values() {
            for j in 0..=num {
                let t_rel = (from_rel_s + j as f64 * dt_sample_s).min(total);
                let t_abs = traj.start_time_s + t_rel;

                if let Some(peer) = reservation.position_at(t_abs) {
                    let d = (traj.position(t_rel) - peer).norm();
                    if d < self.params.safety_distance_m {
                        warn!(
                            "Trajectory within {:.2} m of agent {} at t={:.2} s",
                            d, reservation.agent_id, t_abs
                        );
                        return true;
                    }
                }
            }
        }

        false
    }

    /// Check the candidate trajectory against all reservations known now.
    ///
    /// Samples both trajectories at the same absolute times; any pair closer
    /// than the safety distance fails the check.
    pub fn is_safe_after_opt(&mut self, traj: &Trajectory, dt_sample_s: f64, now_s: f64) -> bool {
        self.opt_check_s = Some(now_s);
        !self.conflicts_with(traj, dt_sample_s, 0.0)
    }

    /// Re-validate after the optimization window: any peer update received
    /// since [`Mader::is_safe_after_opt`] invalidates the candidate.
    pub fn is_safe_after_chk(&self) -> bool {
        match (self.opt_check_s, self.last_update_s) {
            (Some(opt), Some(update)) => update <= opt,
            _ => true,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use crate::traj_opt::{PolyPiece, PIECE_COEFFS};

    fn params() -> DeconflictParams {
        DeconflictParams {
            safety_distance_m: 0.6,
        }
    }

    /// A straight-line constant-velocity trajectory as a degree-1 Bezier
    /// message.
    fn peer_msg(
        agent: u32,
        from: Vector3<f64>,
        to: Vector3<f64>,
        start_s: f64,
        duration_s: f64,
    ) -> TrajMsg {
        TrajMsg {
            drone_id: agent,
            traj_id: 1,
            start_time_s: start_s,
            pub_time_s: start_s,
            order: 1,
            durations_s: vec![duration_s],
            control_points: vec![from, to],
        }
    }

    /// A straight-line constant-velocity ego trajectory.
    fn ego_traj(from: Vector3<f64>, vel: Vector3<f64>, start_s: f64, duration_s: f64) -> Trajectory {
        let mut coeffs = vec![Vector3::zeros(); PIECE_COEFFS];
        coeffs[0] = from;
        coeffs[1] = vel;
        Trajectory {
            pieces: vec![PolyPiece {
                coeffs,
                duration_s,
            }],
            start_time_s: start_s,
        }
    }

    #[test]
    fn test_reservation_sampling() {
        let msg = peer_msg(
            1,
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::new(2.0, 0.0, 1.0),
            10.0,
            2.0,
        );
        let r = Reservation::from_msg(&msg).unwrap();

        assert!(r.position_at(9.9).is_none());
        assert!((r.position_at(11.0).unwrap() - Vector3::new(1.0, 0.0, 1.0)).norm() < 1e-9);
        assert!(r.position_at(12.5).is_none());
    }

    #[test]
    fn test_conflict_detected() {
        let mut mader = Mader::new(params(), 0);

        // Peer passes through (1.5, 0, 1) at t = 1 s
        mader.register_peer_trajectory(
            &peer_msg(
                1,
                Vector3::new(1.5, -2.0, 1.0),
                Vector3::new(1.5, 2.0, 1.0),
                0.0,
                2.0,
            ),
            0.0,
        );

        // Ego plans through (1.5, 0, 1) at t = 1 s
        let traj = ego_traj(
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::new(1.5, 0.0, 0.0),
            0.0,
            2.0,
        );

        assert!(!mader.is_safe_after_opt(&traj, 0.1, 0.0));
    }

    #[test]
    fn test_time_separation_is_safe() {
        let mut mader = Mader::new(params(), 0);

        // Same crossing point, but the peer arrives 3 s later
        mader.register_peer_trajectory(
            &peer_msg(
                1,
                Vector3::new(1.5, -2.0, 1.0),
                Vector3::new(1.5, 2.0, 1.0),
                3.0,
                2.0,
            ),
            0.0,
        );

        let traj = ego_traj(
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::new(1.5, 0.0, 0.0),
            0.0,
            2.0,
        );

        assert!(mader.is_safe_after_opt(&traj, 0.1, 0.0));
    }

    #[test]
    fn test_late_peer_update_invalidates() {
        let mut mader = Mader::new(params(), 0);
        let traj = ego_traj(
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::new(1.0, 0.0, 0.0),
            0.0,
            2.0,
        );

        assert!(mader.is_safe_after_opt(&traj, 0.1, 5.0));
        assert!(mader.is_safe_after_chk());

        // A peer update lands between opt and chk
        mader.register_peer_trajectory(
            &peer_msg(
                2,
                Vector3::new(10.0, 10.0, 1.0),
                Vector3::new(12.0, 10.0, 1.0),
                5.0,
                2.0,
            ),
            5.1,
        );
        assert!(!mader.is_safe_after_chk());
    }

    #[test]
    fn test_expiry_and_own_broadcast_ignored() {
        let mut mader = Mader::new(params(), 7);

        // Own broadcast is not a reservation
        mader.register_peer_trajectory(
            &peer_msg(7, Vector3::zeros(), Vector3::x(), 0.0, 2.0),
            0.0,
        );
        assert_eq!(mader.num_active(), 0);

        mader.register_peer_trajectory(
            &peer_msg(1, Vector3::zeros(), Vector3::x(), 0.0, 2.0),
            0.0,
        );
        assert_eq!(mader.num_active(), 1);

        mader.expire(5.0);
        assert_eq!(mader.num_active(), 0);
    }

    #[test]
    fn test_slice_points_follow_reservation() {
        let mut mader = Mader::new(params(), 0);
        mader.register_peer_trajectory(
            &peer_msg(
                1,
                Vector3::new(0.0, 0.0, 1.0),
                Vector3::new(4.0, 0.0, 1.0),
                0.0,
                4.0,
            ),
            0.0,
        );

        let slices = mader.slice_points(0.0, 3, 1.0);
        assert_eq!(slices.len(), 3);
        assert!((slices[1][0] - Vector3::new(1.0, 0.0, 1.0)).norm() < 1e-9);
        assert!((slices[2][0] - Vector3::new(2.0, 0.0, 1.0)).norm() < 1e-9);
    }
}

//! # Trajectory message
//!
//! The piecewise Bezier trajectory message, published on the vehicle's private
//! topic for its own tracker and on the broadcast topic for peer vehicles.
//! Peers ingest the broadcast form as a reservation of the sender's future
//! volume.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// A committed piecewise Bezier trajectory.
///
/// Each piece of order `order` has `order + 1` control points; the
/// `control_points` vector concatenates the pieces in flight order, so its
/// length is `durations.len() * (order + 1)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajMsg {
    /// Identifier of the vehicle which committed this trajectory.
    pub drone_id: u32,

    /// Per-vehicle monotonically increasing trajectory counter.
    pub traj_id: u32,

    /// Session time at which the trajectory starts, in seconds.
    pub start_time_s: f64,

    /// Session time at which the trajectory was published, in seconds.
    pub pub_time_s: f64,

    /// Polynomial order of each Bezier piece.
    pub order: u32,

    /// Duration of each piece in seconds.
    pub durations_s: Vec<f64>,

    /// Concatenated control points of all pieces.
    pub control_points: Vec<Vector3<f64>>,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl TrajMsg {
    /// Total duration of the trajectory in seconds.
    pub fn total_duration_s(&self) -> f64 {
        self.durations_s.iter().sum()
    }

    /// Number of pieces in the trajectory.
    pub fn num_pieces(&self) -> usize {
        self.durations_s.len()
    }

    /// Control points of the `i`-th piece, or `None` if `i` is out of range or
    /// the control point vector is inconsistent with `order`.
    pub fn piece_control_points(&self, i: usize) -> Option<&[Vector3<f64>]> {
        let n = self.order as usize + 1;
        let start = i * n;
        let end = start + n;
        if i >= self.num_pieces() || end > self.control_points.len() {
            return None;
        }
        Some(&self.control_points[start..end])
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    fn example_msg() -> TrajMsg {
        TrajMsg {
            drone_id: 3,
            traj_id: 17,
            start_time_s: 12.625,
            pub_time_s: 12.5,
            order: 2,
            durations_s: vec![0.8, 1.2],
            control_points: vec![
                Vector3::new(0.0, 0.0, 1.0),
                Vector3::new(0.1, 0.0, 1.0),
                Vector3::new(0.3, 0.1, 1.0),
                Vector3::new(0.3, 0.1, 1.0),
                Vector3::new(0.5, 0.2, 1.0),
                Vector3::new(0.9, 0.2, 1.1),
            ],
        }
    }

    #[test]
    fn test_piece_access() {
        let msg = example_msg();
        assert_eq!(msg.num_pieces(), 2);
        assert_eq!(msg.piece_control_points(0).unwrap().len(), 3);
        assert_eq!(
            msg.piece_control_points(1).unwrap()[2],
            Vector3::new(0.9, 0.2, 1.1)
        );
        assert!(msg.piece_control_points(2).is_none());
    }

    #[test]
    fn test_serde_round_trip() {
        let msg = example_msg();

        let json = serde_json::to_string(&msg).unwrap();
        let back: TrajMsg = serde_json::from_str(&json).unwrap();

        assert_eq!(back.drone_id, msg.drone_id);
        assert_eq!(back.traj_id, msg.traj_id);
        assert_eq!(back.order, msg.order);
        for (a, b) in back.durations_s.iter().zip(msg.durations_s.iter()) {
            assert!((a - b).abs() < 1e-9);
        }
        for (a, b) in back.control_points.iter().zip(msg.control_points.iter()) {
            assert!((a - b).norm() < 1e-9);
        }
    }
}

//! # Kinodynamic search module
//!
//! Searches a discrete-time motion-primitive graph for a risk-bounded,
//! kinematically feasible reference path. Vertices are primitive terminal
//! states `(t, p, v)`; edges are constant-acceleration primitives of fixed
//! duration.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

pub mod kino_astar;

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use nalgebra::Vector3;

// ------------------------------------------------------------------------------------------------
// EXPORTS
// ------------------------------------------------------------------------------------------------

pub use kino_astar::KinoAstar;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// One timed node of the reference path.
#[derive(Debug, Clone, Copy)]
pub struct TimedNode {
    /// Time of the node, in seconds from the start of the plan.
    pub time_s: f64,

    /// Position, in meters. The search emits map-centered coordinates; the
    /// supervisor shifts them to the world frame before corridor generation.
    pub position_m: Vector3<f64>,

    /// Velocity, in meters/second.
    pub velocity_ms: Vector3<f64>,
}

/// One dense sample of a reference path or trajectory.
#[derive(Debug, Clone, Copy)]
pub struct TrajSample {
    pub time_s: f64,
    pub position_m: Vector3<f64>,
    pub velocity_ms: Vector3<f64>,
    pub acceleration_ms2: Vector3<f64>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("No path to the goal exists in the current map")]
    NoPath,

    #[error("Search exceeded its expansion or wall-clock budget")]
    Timeout,

    #[error("Search produced a degenerate path of {0} nodes")]
    DegeneratePath(usize),

    #[error("Search start state lies outside the map")]
    StartOutOfMap,
}

// ------------------------------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Reconstruct dense samples along a node path by integrating the constant
/// acceleration of each primitive.
///
/// The first sample of each primitive after the first is skipped, since it
/// coincides with the last sample of the previous one.
pub fn sample_path(nodes: &[TimedNode], dt_sample_s: f64) -> Vec<TrajSample> {
    let mut out = Vec::new();
    if nodes.is_empty() {
        return out;
    }

    for pair in nodes.windows(2) {
        let (n1, n2) = (&pair[0], &pair[1]);
        let dt_node = n2.time_s - n1.time_s;
        if dt_node <= 0.0 {
            continue;
        }
        let acc = (n2.velocity_ms - n1.velocity_ms) / dt_node;

        let num = (dt_node / dt_sample_s).round().max(1.0) as usize;
        let start_j = if out.is_empty() { 0 } else { 1 };
        for j in start_j..=num {
            let t = if j == num {
                dt_node
            } else {
                j as f64 * dt_sample_s
            };
            out.push(TrajSample {
                time_s: n1.time_s + t,
                position_m: n1.position_m + n1.velocity_ms * t + 0.5 * acc * t * t,
                velocity_ms: n1.velocity_ms + acc * t,
                acceleration_ms2: acc,
            });
        }
    }

    out
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_sample_path_constant_acceleration() {
        let nodes = vec![
            TimedNode {
                time_s: 0.0,
                position_m: Vector3::zeros(),
                velocity_ms: Vector3::zeros(),
            },
            TimedNode {
                time_s: 1.0,
                position_m: Vector3::new(0.5, 0.0, 0.0),
                velocity_ms: Vector3::new(1.0, 0.0, 0.0),
            },
        ];

        let samples = sample_path(&nodes, 0.25);

        // a = 1.0 m/s^2; at t = 0.5 the position is 0.125 m
        let s = samples
            .iter()
            .find(|s| (s.time_s - 0.5).abs() < 1e-9)
            .unwrap();
        assert!((s.position_m.x - 0.125).abs() < 1e-9);
        assert!((s.velocity_ms.x - 0.5).abs() < 1e-9);
        assert!((s.acceleration_ms2.x - 1.0).abs() < 1e-9);

        // The last sample is the terminal node
        let last = samples.last().unwrap();
        assert!((last.position_m.x - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_sample_path_no_duplicate_junction_samples() {
        let nodes = vec![
            TimedNode {
                time_s: 0.0,
                position_m: Vector3::zeros(),
                velocity_ms: Vector3::new(1.0, 0.0, 0.0),
            },
            TimedNode {
                time_s: 1.0,
                position_m: Vector3::new(1.0, 0.0, 0.0),
                velocity_ms: Vector3::new(1.0, 0.0, 0.0),
            },
            TimedNode {
                time_s: 2.0,
                position_m: Vector3::new(2.0, 0.0, 0.0),
                velocity_ms: Vector3::new(1.0, 0.0, 0.0),
            },
        ];

        let samples = sample_path(&nodes, 0.5);
        for pair in samples.windows(2) {
            assert!(pair[1].time_s > pair[0].time_s);
        }
    }
}

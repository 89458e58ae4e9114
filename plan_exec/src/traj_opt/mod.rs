//! # Trajectory module
//!
//! Piecewise-polynomial trajectories and the corridor-constrained minimum
//! snap optimizer. Pieces are degree-7 polynomials in monomial form; the
//! broadcast representation converts each piece to Bezier control points,
//! whose convex-hull property peers rely on for conservative checks.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

pub mod min_snap;

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::traj::TrajMsg;
use nalgebra::Vector3;

use crate::search::TrajSample;

// ------------------------------------------------------------------------------------------------
// EXPORTS
// ------------------------------------------------------------------------------------------------

pub use min_snap::CorridorMinSnap;

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Polynomial degree of each trajectory piece.
pub const PIECE_DEGREE: usize = 7;

/// Number of coefficients (and Bezier control points) per piece.
pub const PIECE_COEFFS: usize = PIECE_DEGREE + 1;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// One polynomial piece: `p(t) = sum_j coeffs[j] * t^j`, `t in [0, duration]`.
#[derive(Debug, Clone)]
pub struct PolyPiece {
    pub coeffs: Vec<Vector3<f64>>,
    pub duration_s: f64,
}

/// An ordered sequence of polynomial pieces, C2 across junctions.
#[derive(Debug, Clone)]
pub struct Trajectory {
    pub pieces: Vec<PolyPiece>,

    /// Session time at which the trajectory starts, in seconds.
    pub start_time_s: f64,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TrajOptError {
    #[error("The optimizer's linear solve failed")]
    OptimizerCrashed,

    #[error("No feasible trajectory found for these corridors")]
    NoSolution,

    #[error("Optimizer inputs are inconsistent: {0}")]
    InconsistentInput(String),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl PolyPiece {
    pub fn position(&self, t: f64) -> Vector3<f64> {
        let mut pos = Vector3::zeros();
        let mut ti = 1.0;
        for c in &self.coeffs {
            pos += c * ti;
            ti *= t;
        }
        pos
    }

    pub fn velocity(&self, t: f64) -> Vector3<f64> {
        let mut vel = Vector3::zeros();
        let mut ti = 1.0;
        for (j, c) in self.coeffs.iter().enumerate().skip(1) {
            vel += c * (j as f64) * ti;
            ti *= t;
        }
        vel
    }

    pub fn acceleration(&self, t: f64) -> Vector3<f64> {
        let mut acc = Vector3::zeros();
        let mut ti = 1.0;
        for (j, c) in self.coeffs.iter().enumerate().skip(2) {
            acc += c * (j * (j - 1)) as f64 * ti;
            ti *= t;
        }
        acc
    }

    /// Bezier control points of this piece by exact monomial-to-Bernstein
    /// conversion.
    pub fn control_points(&self) -> Vec<Vector3<f64>> {
        let n = self.coeffs.len() - 1;

        // Coefficients of the unit-interval polynomial p(s), s = t / duration
        let scaled: Vec<Vector3<f64>> = self
            .coeffs
            .iter()
            .enumerate()
            .map(|(j, c)| c * self.duration_s.powi(j as i32))
            .collect();

        (0..=n)
            .map(|i| {
                let mut p = Vector3::zeros();
                for j in 0..=i {
                    p += scaled[j] * (binomial(i, j) / binomial(n, j));
                }
                p
            })
            .collect()
    }
}

impl Trajectory {
    pub fn total_duration_s(&self) -> f64 {
        self.pieces.iter().map(|p| p.duration_s).sum()
    }

    /// Locate the piece containing `t_rel` seconds after the trajectory
    /// start, returning the piece index and the local time. Times beyond the
    /// end clamp to the end of the last piece.
    fn locate(&self, t_rel_s: f64) -> (usize, f64) {
        let mut t = t_rel_s.max(0.0);
        for (i, piece) in self.pieces.iter().enumerate() {
            if t <= piece.duration_s || i == self.pieces.len() - 1 {
                return (i, t.min(piece.duration_s));
            }
            t -= piece.duration_s;
        }
        (0, 0.0)
    }

    pub fn position(&self, t_rel_s: f64) -> Vector3<f64> {
        let (i, t) = self.locate(t_rel_s);
        self.pieces[i].position(t)
    }

    pub fn velocity(&self, t_rel_s: f64) -> Vector3<f64> {
        let (i, t) = self.locate(t_rel_s);
        self.pieces[i].velocity(t)
    }

    pub fn acceleration(&self, t_rel_s: f64) -> Vector3<f64> {
        let (i, t) = self.locate(t_rel_s);
        self.pieces[i].acceleration(t)
    }

    /// Dense samples over the whole trajectory, with times relative to the
    /// trajectory start.
    pub fn sample(&self, dt_s: f64) -> Vec<TrajSample> {
        let total = self.total_duration_s();
        let num = (total / dt_s).ceil() as usize;

        let mut out = Vec::with_capacity(num + 1);
        for j in 0..=num {
            let t = (j as f64 * dt_s).min(total);
            out.push(TrajSample {
                time_s: t,
                position_m: self.position(t),
                velocity_ms: self.velocity(t),
                acceleration_ms2: self.acceleration(t),
            });
        }
        out
    }

    /// Build the broadcast message for this trajectory.
    pub fn to_msg(&self, drone_id: u32, traj_id: u32, pub_time_s: f64) -> TrajMsg {
        let mut control_points = Vec::with_capacity(self.pieces.len() * PIECE_COEFFS);
        for piece in &self.pieces {
            control_points.extend(piece.control_points());
        }

        TrajMsg {
            drone_id,
            traj_id,
            start_time_s: self.start_time_s,
            pub_time_s,
            order: PIECE_DEGREE as u32,
            durations_s: self.pieces.iter().map(|p| p.duration_s).collect(),
            control_points,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Evaluate a Bezier curve at normalized parameter `s in [0, 1]` by de
/// Casteljau's algorithm.
pub fn bezier_position(cpts: &[Vector3<f64>], s: f64) -> Vector3<f64> {
    let mut work: Vec<Vector3<f64>> = cpts.to_vec();
    let n = work.len();
    for level in 1..n {
        for i in 0..(n - level) {
            work[i] = work[i] * (1.0 - s) + work[i + 1] * s;
        }
    }
    work[0]
}

/// Binomial coefficient as a float.
pub fn binomial(n: usize, k: usize) -> f64 {
    let mut out = 1.0;
    for i in 0..k {
        out *= (n - i) as f64 / (k - i) as f64;
    }
    out
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    fn linear_piece() -> PolyPiece {
        // p(t) = (1, 0, 2) + (2, 1, 0) t
        let mut coeffs = vec![Vector3::zeros(); PIECE_COEFFS];
        coeffs[0] = Vector3::new(1.0, 0.0, 2.0);
        coeffs[1] = Vector3::new(2.0, 1.0, 0.0);
        PolyPiece {
            coeffs,
            duration_s: 2.0,
        }
    }

    #[test]
    fn test_piece_evaluation() {
        let piece = linear_piece();
        assert_eq!(piece.position(0.0), Vector3::new(1.0, 0.0, 2.0));
        assert_eq!(piece.position(2.0), Vector3::new(5.0, 2.0, 2.0));
        assert_eq!(piece.velocity(1.3), Vector3::new(2.0, 1.0, 0.0));
        assert_eq!(piece.acceleration(1.3), Vector3::zeros());
    }

    #[test]
    fn test_bezier_conversion_matches_polynomial() {
        let mut coeffs = vec![Vector3::zeros(); PIECE_COEFFS];
        coeffs[0] = Vector3::new(0.5, -1.0, 1.0);
        coeffs[1] = Vector3::new(1.0, 0.3, 0.0);
        coeffs[2] = Vector3::new(-0.4, 0.2, 0.1);
        coeffs[3] = Vector3::new(0.05, -0.02, 0.0);
        let piece = PolyPiece {
            coeffs,
            duration_s: 1.5,
        };

        let cpts = piece.control_points();
        assert_eq!(cpts.len(), PIECE_COEFFS);

        for k in 0..=10 {
            let s = k as f64 / 10.0;
            let from_bezier = bezier_position(&cpts, s);
            let from_poly = piece.position(s * piece.duration_s);
            assert!(
                (from_bezier - from_poly).norm() < 1e-9,
                "mismatch at s={}: {:?} vs {:?}",
                s,
                from_bezier,
                from_poly
            );
        }
    }

    #[test]
    fn test_trajectory_locate_and_clamp() {
        let traj = Trajectory {
            pieces: vec![linear_piece(), linear_piece()],
            start_time_s: 0.0,
        };

        assert_eq!(traj.total_duration_s(), 4.0);

        // Into the second piece
        let p = traj.position(3.0);
        assert_eq!(p, Vector3::new(3.0, 1.0, 2.0));

        // Beyond the end clamps to the terminal state
        assert_eq!(traj.position(10.0), traj.position(4.0));
    }

    #[test]
    fn test_msg_round_trip_control_points() {
        let traj = Trajectory {
            pieces: vec![linear_piece()],
            start_time_s: 1.0,
        };
        let msg = traj.to_msg(0, 1, 1.0);

        assert_eq!(msg.order as usize, PIECE_DEGREE);
        assert_eq!(msg.control_points.len(), PIECE_COEFFS);

        // The message's Bezier samples reproduce the polynomial
        let cpts = msg.piece_control_points(0).unwrap();
        let mid = bezier_position(cpts, 0.5);
        assert!((mid - traj.position(1.0)).norm() < 1e-9);
    }

    #[test]
    fn test_binomial() {
        assert_eq!(binomial(7, 0), 1.0);
        assert_eq!(binomial(7, 3), 35.0);
        assert_eq!(binomial(4, 2), 6.0);
    }
}

//! Corridor-constrained minimum snap optimizer.
//!
//! Each corridor polytope receives one degree-7 polynomial piece. Per axis
//! the piece coefficients minimise a weighted integral of squared snap and
//! jerk subject to linear equality constraints: boundary states at both ends,
//! C2 continuity at junctions, junction positions seeded on the reference
//! path, and any waypoint pins accumulated by the tightening loop. The
//! resulting equality-constrained QP is solved through its KKT system with a
//! dense LU factorisation.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::egress::BoundaryState;
use log::{debug, trace, warn};
use nalgebra::{DMatrix, Vector3};

use crate::corridor::Polytope;
use crate::params::{OptFactors, TrajOptParams};

use super::{PolyPiece, TrajOptError, Trajectory, PIECE_COEFFS};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Maximum number of tightening iterations.
pub const MAX_REOPT_ITERATIONS: usize = 10;

/// Maximum number of waypoint pins accepted per piece. Each piece only has
/// eight degrees of freedom per axis; more pins would exhaust them.
const MAX_PINS_PER_PIECE: usize = 3;

/// Tikhonov term keeping the KKT system non-singular.
const REGULARISATION: f64 = 1e-8;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// A position equality constraint at a fraction of a piece's duration.
#[derive(Debug, Clone, Copy)]
struct Pin {
    piece: usize,
    t_frac: f64,
    target_m: Vector3<f64>,
}

/// The optimizer. Call [`CorridorMinSnap::setup`] once per plan, then
/// [`CorridorMinSnap::optimize`], and drive the tightening loop with
/// [`CorridorMinSnap::is_corridor_satisfied`] /
/// [`CorridorMinSnap::re_optimize`].
#[derive(Debug)]
pub struct CorridorMinSnap {
    factors: OptFactors,
    delta_m: f64,

    init: BoundaryState,
    final_state: BoundaryState,
    durations_s: Vec<f64>,
    polytopes: Vec<Polytope>,
    junctions_m: Vec<Vector3<f64>>,
    pins: Vec<Pin>,

    traj: Option<Trajectory>,

    /// Corrections staged by the last satisfaction check.
    staged_pins: Vec<Pin>,
    staged_dilation: f64,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl CorridorMinSnap {
    pub fn new(params: &TrajOptParams) -> Self {
        Self {
            factors: params.factors,
            delta_m: params.delta_corridor,
            init: zero_state(),
            final_state: zero_state(),
            durations_s: Vec::new(),
            polytopes: Vec::new(),
            junctions_m: Vec::new(),
            pins: Vec::new(),
            traj: None,
            staged_pins: Vec::new(),
            staged_dilation: 1.0,
        }
    }

    /// Load a new problem: boundary states, the per-piece time allocation,
    /// the polytope sequence and the reference positions at the piece
    /// junctions.
    pub fn setup(
        &mut self,
        init: BoundaryState,
        final_state: BoundaryState,
        durations_s: Vec<f64>,
        polytopes: Vec<Polytope>,
        junctions_m: Vec<Vector3<f64>>,
    ) -> Result<(), TrajOptError> {
        if durations_s.is_empty() || durations_s.len() != polytopes.len() {
            return Err(TrajOptError::InconsistentInput(format!(
                "{} durations against {} polytopes",
                durations_s.len(),
                polytopes.len()
            )));
        }
        if junctions_m.len() + 1 != durations_s.len() {
            return Err(TrajOptError::InconsistentInput(format!(
                "{} junctions against {} pieces",
                junctions_m.len(),
                durations_s.len()
            )));
        }
        if durations_s.iter().any(|d| *d <= 0.0) {
            return Err(TrajOptError::InconsistentInput(
                "non-positive piece duration".into(),
            ));
        }

        // Pull each junction seed into the intersection of its two adjacent
        // polytopes, shrunk by the corridor margin, so the seeded positions
        // cannot themselves violate the tightened corridor.
        let mut junctions = junctions_m;
        for (i, w) in junctions.iter_mut().enumerate() {
            let clamped = polytopes[i].clamp_inside(w, self.delta_m);
            *w = polytopes[i + 1].clamp_inside(&clamped, self.delta_m);
        }

        self.init = init;
        self.final_state = final_state;
        self.durations_s = durations_s;
        self.polytopes = polytopes;
        self.junctions_m = junctions;
        self.pins.clear();
        self.staged_pins.clear();
        self.staged_dilation = 1.0;
        self.traj = None;

        Ok(())
    }

    /// Solve the QP and store the resulting trajectory.
    pub fn optimize(&mut self) -> Result<(), TrajOptError> {
        let m = self.durations_s.len();
        let vars = m * PIECE_COEFFS;

        let (a, b) = self.constraints();
        let rows = a.nrows();

        // KKT system: [2Q A'; A 0] [x; l] = [0; b]
        let q = self.hessian();
        let dim = vars + rows;
        let mut kkt = DMatrix::<f64>::zeros(dim, dim);
        kkt.view_mut((0, 0), (vars, vars)).copy_from(&(2.0 * &q));
        kkt.view_mut((0, vars), (vars, rows)).copy_from(&a.transpose());
        kkt.view_mut((vars, 0), (rows, vars)).copy_from(&a);

        let mut rhs = DMatrix::<f64>::zeros(dim, 3);
        rhs.view_mut((vars, 0), (rows, 3)).copy_from(&b);

        let solution = kkt
            .lu()
            .solve(&rhs)
            .ok_or(TrajOptError::OptimizerCrashed)?;

        // The solve works in normalized time s = t / T per piece; convert
        // the coefficients back to the t basis
        let mut pieces = Vec::with_capacity(m);
        for p in 0..m {
            let duration = self.durations_s[p];
            let coeffs = (0..PIECE_COEFFS)
                .map(|j| {
                    let row = p * PIECE_COEFFS + j;
                    Vector3::new(solution[(row, 0)], solution[(row, 1)], solution[(row, 2)])
                        / duration.powi(j as i32)
                })
                .collect();
            pieces.push(PolyPiece {
                coeffs,
                duration_s: duration,
            });
        }

        self.traj = Some(Trajectory {
            pieces,
            start_time_s: 0.0,
        });

        trace!("Optimized {} pieces with {} constraint rows", m, rows);
        Ok(())
    }

    /// The optimized trajectory, if a solve has succeeded.
    pub fn get_trajectory(&self) -> Option<Trajectory> {
        self.traj.clone()
    }

    /// Final time allocation, after any dilation applied by the tightening
    /// loop.
    pub fn durations_s(&self) -> &[f64] {
        &self.durations_s
    }

    /// Densely resample the trajectory and check every sample for corridor
    /// membership (inward margin `margin_m`) and the kinematic caps.
    ///
    /// Violations are staged for the next [`CorridorMinSnap::re_optimize`].
    pub fn is_corridor_satisfied(
        &mut self,
        v_max: f64,
        a_max: f64,
        margin_m: f64,
        dt_sample_s: f64,
    ) -> bool {
        let traj = match &self.traj {
            Some(t) => t,
            None => return false,
        };

        self.staged_pins.clear();
        self.staged_dilation = 1.0;

        let total = traj.total_duration_s();
        let mut vel_ratio: f64 = 1.0;
        let mut acc_ratio: f64 = 1.0;

        let num = (total / dt_sample_s).ceil() as usize;
        for j in 0..=num {
            let t = (j as f64 * dt_sample_s).min(total);
            let pos = traj.position(t);
            let vel = traj.velocity(t);
            let acc = traj.acceleration(t);

            vel_ratio = vel_ratio.max(vel.amax() / v_max);
            acc_ratio = acc_ratio.max(acc.amax() / a_max);

            let (piece, t_local) = self.piece_at(t);
            if !self.polytopes[piece].contains(&pos, margin_m) {
                // Endpoint samples are fixed by the boundary rows; pinning
                // them would contradict those constraints
                if t > dt_sample_s && t < total - dt_sample_s {
                    let target =
                        self.polytopes[piece].clamp_inside(&pos, margin_m + 1e-3);
                    self.staged_pins.push(Pin {
                        piece,
                        t_frac: t_local / self.durations_s[piece],
                        target_m: target,
                    });
                }
            }
        }

        let dilation = vel_ratio.max(acc_ratio.sqrt());
        if dilation > 1.0 {
            self.staged_dilation = dilation * 1.05;
        }

        self.staged_pins.is_empty() && self.staged_dilation == 1.0
    }

    /// Apply the staged corrections (waypoint pins for corridor violations,
    /// time dilation for kinematic violations) and re-solve.
    pub fn re_optimize(&mut self) -> Result<(), TrajOptError> {
        if self.staged_dilation > 1.0 {
            for d in self.durations_s.iter_mut() {
                *d *= self.staged_dilation;
            }
            debug!("Time allocation dilated by {:.3}", self.staged_dilation);
            self.staged_dilation = 1.0;
        }

        for pin in self.staged_pins.drain(..) {
            let existing = self
                .pins
                .iter_mut()
                .find(|p| p.piece == pin.piece && (p.t_frac - pin.t_frac).abs() < 0.05);
            match existing {
                Some(p) => p.target_m = pin.target_m,
                None => {
                    let count = self.pins.iter().filter(|p| p.piece == pin.piece).count();
                    if count < MAX_PINS_PER_PIECE {
                        self.pins.push(pin);
                    } else {
                        warn!("Pin budget of piece {} exhausted", pin.piece);
                    }
                }
            }
        }

        self.optimize()
    }

    /// Piece index and local time of a global trajectory time.
    fn piece_at(&self, t_rel_s: f64) -> (usize, f64) {
        let mut t = t_rel_s.max(0.0);
        for (i, d) in self.durations_s.iter().enumerate() {
            if t <= *d || i == self.durations_s.len() - 1 {
                return (i, t.min(*d));
            }
            t -= d;
        }
        (0, 0.0)
    }

    /// Block-diagonal Hessian of the smoothness functional, in the
    /// normalized-time basis of each piece.
    fn hessian(&self) -> DMatrix<f64> {
        let m = self.durations_s.len();
        let vars = m * PIECE_COEFFS;
        let mut q = DMatrix::<f64>::zeros(vars, vars);

        for (p, duration) in self.durations_s.iter().enumerate() {
            let base = p * PIECE_COEFFS;
            for j in 0..PIECE_COEFFS {
                for k in 0..PIECE_COEFFS {
                    let mut v = 0.0;

                    // Integral of squared snap
                    if j >= 4 && k >= 4 {
                        let cj = (j * (j - 1) * (j - 2) * (j - 3)) as f64;
                        let ck = (k * (k - 1) * (k - 2) * (k - 3)) as f64;
                        let pow = (j + k) as f64 - 7.0;
                        v += self.factors.snap * cj * ck / (pow * duration.powi(7));
                    }

                    // Integral of squared jerk
                    if j >= 3 && k >= 3 {
                        let cj = (j * (j - 1) * (j - 2)) as f64;
                        let ck = (k * (k - 1) * (k - 2)) as f64;
                        let pow = (j + k) as f64 - 5.0;
                        v += self.factors.jerk * cj * ck / (pow * duration.powi(5));
                    }

                    q[(base + j, base + k)] += v;
                }
                q[(base + j, base + j)] += REGULARISATION;
            }
        }

        q
    }

    /// The equality constraint system `A x = b`, with one right-hand-side
    /// column per axis. Rows are expressed in the normalized-time basis:
    /// a constraint term is `(piece, s, derivative, sign)` with `s in [0,1]`,
    /// and a time derivative of order `d` carries a `T^-d` factor.
    fn constraints(&self) -> (DMatrix<f64>, DMatrix<f64>) {
        let m = self.durations_s.len();
        let vars = m * PIECE_COEFFS;
        let rows = 6 + 4 * (m - 1) + self.pins.len();

        let mut a = DMatrix::<f64>::zeros(rows, vars);
        let mut b = DMatrix::<f64>::zeros(rows, 3);
        let mut r = 0;

        let durations = self.durations_s.clone();
        let mut put = move |a: &mut DMatrix<f64>,
                            b: &mut DMatrix<f64>,
                            r: &mut usize,
                            terms: &[(usize, f64, usize, f64)],
                            rhs: Vector3<f64>| {
            for &(piece, s, der, sign) in terms {
                let scale = durations[piece].powi(-(der as i32));
                for j in der..PIECE_COEFFS {
                    let mut c = 1.0;
                    for d in 0..der {
                        c *= (j - d) as f64;
                    }
                    a[(*r, piece * PIECE_COEFFS + j)] +=
                        sign * scale * c * s.powi((j - der) as i32);
                }
            }
            for axis in 0..3 {
                b[(*r, axis)] = rhs[axis];
            }
            *r += 1;
        };

        // Initial boundary state
        put(&mut a, &mut b, &mut r, &[(0, 0.0, 0, 1.0)], self.init.position_m);
        put(&mut a, &mut b, &mut r, &[(0, 0.0, 1, 1.0)], self.init.velocity_ms);
        put(
            &mut a,
            &mut b,
            &mut r,
            &[(0, 0.0, 2, 1.0)],
            self.init.acceleration_ms2,
        );

        // Final boundary state
        put(
            &mut a,
            &mut b,
            &mut r,
            &[(m - 1, 1.0, 0, 1.0)],
            self.final_state.position_m,
        );
        put(
            &mut a,
            &mut b,
            &mut r,
            &[(m - 1, 1.0, 1, 1.0)],
            self.final_state.velocity_ms,
        );
        put(
            &mut a,
            &mut b,
            &mut r,
            &[(m - 1, 1.0, 2, 1.0)],
            self.final_state.acceleration_ms2,
        );

        // Junctions: seeded position on both sides, C1 and C2 continuity
        for i in 0..(m - 1) {
            let w = self.junctions_m[i];
            put(&mut a, &mut b, &mut r, &[(i, 1.0, 0, 1.0)], w);
            put(&mut a, &mut b, &mut r, &[(i + 1, 0.0, 0, 1.0)], w);
            put(
                &mut a,
                &mut b,
                &mut r,
                &[(i, 1.0, 1, 1.0), (i + 1, 0.0, 1, -1.0)],
                Vector3::zeros(),
            );
            put(
                &mut a,
                &mut b,
                &mut r,
                &[(i, 1.0, 2, 1.0), (i + 1, 0.0, 2, -1.0)],
                Vector3::zeros(),
            );
        }

        // Waypoint pins from the tightening loop
        for pin in &self.pins {
            put(
                &mut a,
                &mut b,
                &mut r,
                &[(pin.piece, pin.t_frac, 0, 1.0)],
                pin.target_m,
            );
        }

        (a, b)
    }
}

// ------------------------------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ------------------------------------------------------------------------------------------------

fn zero_state() -> BoundaryState {
    BoundaryState {
        position_m: Vector3::zeros(),
        velocity_ms: Vector3::zeros(),
        acceleration_ms2: Vector3::zeros(),
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use crate::search::TimedNode;

    fn params() -> TrajOptParams {
        TrajOptParams {
            max_vel_optimization: 4.0,
            max_acc_optimization: 6.0,
            delta_corridor: 0.1,
            factors: OptFactors {
                snap: 1.0,
                jerk: 0.01,
            },
            trajectory_piece_max_size: 5,
        }
    }

    fn state(p: Vector3<f64>, v: Vector3<f64>) -> BoundaryState {
        BoundaryState {
            position_m: p,
            velocity_ms: v,
            acceleration_ms2: Vector3::zeros(),
        }
    }

    fn wide_polytope(x_lo: f64, x_hi: f64, duration: f64) -> Polytope {
        let vel = Vector3::new((x_hi - x_lo) / duration, 0.0, 0.0);
        let nodes = [
            TimedNode {
                time_s: 0.0,
                position_m: Vector3::new(x_lo, 0.0, 1.0),
                velocity_ms: vel,
            },
            TimedNode {
                time_s: duration,
                position_m: Vector3::new(x_hi, 0.0, 1.0),
                velocity_ms: vel,
            },
        ];
        let gen = crate::corridor::CorridorGen::new(
            crate::params::CorridorParams {
                stride: 1,
                bloat_m: 3.0,
                risk_threshold_corridor: 0.2,
                enable_short_cut: false,
            },
            0.1,
            0.1,
        );
        let mut polys = gen
            .find_corridors(&nodes, 0.0, 0.25, |_, _, _, _| vec![])
            .unwrap();
        polys.remove(0)
    }

    #[test]
    fn test_single_piece_rest_to_rest() {
        let mut opt = CorridorMinSnap::new(&params());
        opt.setup(
            state(Vector3::new(0.0, 0.0, 1.0), Vector3::zeros()),
            state(Vector3::new(2.0, 0.0, 1.0), Vector3::zeros()),
            vec![2.0],
            vec![wide_polytope(0.0, 2.0, 2.0)],
            vec![],
        )
        .unwrap();
        opt.optimize().unwrap();

        let traj = opt.get_trajectory().unwrap();

        // Boundary conditions hold
        assert!((traj.position(0.0) - Vector3::new(0.0, 0.0, 1.0)).norm() < 1e-6);
        assert!((traj.position(2.0) - Vector3::new(2.0, 0.0, 1.0)).norm() < 1e-6);
        assert!(traj.velocity(0.0).norm() < 1e-6);
        assert!(traj.velocity(2.0).norm() < 1e-6);
        assert!(traj.acceleration(0.0).norm() < 1e-6);

        // A rest-to-rest 2 m / 2 s motion is well within the caps
        assert!(opt.is_corridor_satisfied(4.0, 6.0, 0.1, 0.05));
    }

    #[test]
    fn test_two_pieces_c2_continuity() {
        let mut opt = CorridorMinSnap::new(&params());
        opt.setup(
            state(Vector3::new(0.0, 0.0, 1.0), Vector3::zeros()),
            state(Vector3::new(3.0, 0.5, 1.0), Vector3::zeros()),
            vec![1.5, 1.5],
            vec![
                wide_polytope(0.0, 1.5, 1.5),
                wide_polytope(1.5, 3.0, 1.5),
            ],
            vec![Vector3::new(1.5, 0.2, 1.0)],
        )
        .unwrap();
        opt.optimize().unwrap();

        let traj = opt.get_trajectory().unwrap();
        let eps = 1e-4;

        // Continuity of position, velocity and acceleration at the junction
        let before = 1.5 - eps;
        let after = 1.5 + eps;
        assert!((traj.position(before) - traj.position(after)).norm() < 1e-3);
        assert!((traj.velocity(before) - traj.velocity(after)).norm() < 1e-3);
        assert!((traj.acceleration(before) - traj.acceleration(after)).norm() < 1e-2);

        // The junction passes through its (possibly clamped) seed in xy
        assert!((traj.position(1.5).x - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_kinematic_violation_dilates_time() {
        let mut opt = CorridorMinSnap::new(&params());

        // 4 m in 0.5 s forces a velocity violation
        opt.setup(
            state(Vector3::new(0.0, 0.0, 1.0), Vector3::zeros()),
            state(Vector3::new(4.0, 0.0, 1.0), Vector3::zeros()),
            vec![0.5],
            vec![wide_polytope(0.0, 4.0, 0.5)],
            vec![],
        )
        .unwrap();
        opt.optimize().unwrap();

        assert!(!opt.is_corridor_satisfied(4.0, 6.0, 0.1, 0.05));

        let mut ok = false;
        for _ in 0..MAX_REOPT_ITERATIONS {
            opt.re_optimize().unwrap();
            if opt.is_corridor_satisfied(4.0, 6.0, 0.1, 0.05) {
                ok = true;
                break;
            }
        }
        assert!(ok, "tightening loop failed to restore feasibility");
        assert!(opt.durations_s()[0] > 0.5);
    }

    #[test]
    fn test_inconsistent_setup_rejected() {
        let mut opt = CorridorMinSnap::new(&params());
        let result = opt.setup(
            state(Vector3::zeros(), Vector3::zeros()),
            state(Vector3::zeros(), Vector3::zeros()),
            vec![1.0, 1.0],
            vec![wide_polytope(0.0, 1.0, 1.0)],
            vec![],
        );
        assert!(matches!(result, Err(TrajOptError::InconsistentInput(_))));
    }
}

//! # Vehicle state handling
//!
//! Odometry ingestion for the planner: a latched pose/attitude store and the
//! acceleration estimator which differentiates the odometry velocity.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::ingress::{PoseMsg, VelocityMsg};
use nalgebra::{UnitQuaternion, Vector3};
use util::maths::clamp_abs_vec3;

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Differentiated accelerations below this magnitude are treated as zero,
/// per axis. The raw odometry velocity is too noisy to trust smaller values.
const ACC_DEAD_ZONE_MS2: f64 = 0.2;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// The full kinematic state of the vehicle as seen by the planner.
#[derive(Debug, Clone, Copy)]
pub struct VehicleState {
    /// Position in the world frame, in meters.
    pub position_m: Vector3<f64>,

    /// Velocity in the world frame, in meters/second.
    pub velocity_ms: Vector3<f64>,

    /// Acceleration in the world frame, estimated by differentiation, in
    /// meters/second^2.
    pub acceleration_ms2: Vector3<f64>,

    /// Attitude in the world frame.
    pub attitude_q: UnitQuaternion<f64>,

    /// Session time of the last pose update, in seconds.
    pub stamp_s: f64,
}

/// Latched odometry store.
///
/// The write path sets a single flag while the pose pair is being updated so
/// a reader never sees a half-written `(position, attitude)`; writes arriving
/// while the latch is held are skipped rather than blocked on.
#[derive(Debug)]
pub struct OdomLatch {
    state: VehicleState,
    locked: bool,
    pose_received: bool,
    vel_received: bool,
    accel_est: AccelEstimator,
}

/// Estimates acceleration by first-differencing the odometry velocity.
///
/// The pair `(prev_vel, prev_stamp)` is the only persistent state. Every
/// sample after the first produces an estimate; each axis passes through a
/// dead zone and is clipped to the configured maximum.
#[derive(Debug)]
pub struct AccelEstimator {
    prev: Option<(Vector3<f64>, f64)>,
    max_acc_ms2: f64,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Default for VehicleState {
    fn default() -> Self {
        Self {
            position_m: Vector3::zeros(),
            velocity_ms: Vector3::zeros(),
            acceleration_ms2: Vector3::zeros(),
            attitude_q: UnitQuaternion::identity(),
            stamp_s: 0.0,
        }
    }
}

impl OdomLatch {
    pub fn new(max_differentiated_a: f64) -> Self {
        Self {
            state: VehicleState::default(),
            locked: false,
            pose_received: false,
            vel_received: false,
            accel_est: AccelEstimator::new(max_differentiated_a),
        }
    }

    /// Ingest a pose message. Skipped if the latch is held.
    pub fn set_pose(&mut self, msg: &PoseMsg) {
        if self.locked {
            return;
        }
        self.locked = true;

        self.state.position_m = msg.position_m;
        self.state.attitude_q = msg.orientation;
        self.state.stamp_s = msg.stamp_s;
        self.pose_received = true;

        self.locked = false;
    }

    /// Ingest a velocity message, updating the acceleration estimate.
    pub fn set_velocity(&mut self, msg: &VelocityMsg) {
        self.state.velocity_ms = msg.linear_ms;
        self.state.acceleration_ms2 = self.accel_est.update(&msg.linear_ms, msg.stamp_s);
        self.vel_received = true;
    }

    /// Latest state, or `None` while the latch is held or no pose has been
    /// received yet.
    pub fn get(&self) -> Option<VehicleState> {
        if self.locked || !self.pose_received {
            return None;
        }
        Some(self.state)
    }

    pub fn is_received(&self) -> bool {
        self.pose_received && self.vel_received
    }
}

impl AccelEstimator {
    pub fn new(max_acc_ms2: f64) -> Self {
        Self {
            prev: None,
            max_acc_ms2,
        }
    }

    /// Feed one velocity sample, returning the current acceleration estimate.
    ///
    /// The first sample cannot be differentiated and returns zero.
    pub fn update(&mut self, vel_ms: &Vector3<f64>, stamp_s: f64) -> Vector3<f64> {
        let acc = match self.prev {
            Some((prev_vel, prev_stamp)) => {
                let dt = stamp_s - prev_stamp;
                if dt <= 0.0 {
                    // Out of order or repeated stamp, keep the previous pair
                    return Vector3::zeros();
                }

                let mut acc = (vel_ms - prev_vel) / dt;
                for i in 0..3 {
                    if acc[i].abs() < ACC_DEAD_ZONE_MS2 {
                        acc[i] = 0.0;
                    }
                }
                clamp_abs_vec3(
                    &acc,
                    &Vector3::new(self.max_acc_ms2, self.max_acc_ms2, self.max_acc_ms2),
                )
            }
            None => Vector3::zeros(),
        };

        self.prev = Some((*vel_ms, stamp_s));
        acc
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_constant_velocity_gives_zero_accel() {
        let mut est = AccelEstimator::new(2.0);
        let v = Vector3::new(1.2, -0.4, 0.1);

        assert_eq!(est.update(&v, 0.0), Vector3::zeros());
        for i in 1..10 {
            assert_eq!(est.update(&v, 0.1 * i as f64), Vector3::zeros());
        }
    }

    #[test]
    fn test_differentiates_every_sample() {
        let mut est = AccelEstimator::new(10.0);

        est.update(&Vector3::zeros(), 0.0);
        let a1 = est.update(&Vector3::new(0.5, 0.0, 0.0), 1.0);
        assert!((a1.x - 0.5).abs() < 1e-12);

        // A second ramp must also be differentiated, not skipped
        let a2 = est.update(&Vector3::new(1.5, 0.0, 0.0), 2.0);
        assert!((a2.x - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_dead_zone_and_clip() {
        let mut est = AccelEstimator::new(2.0);

        est.update(&Vector3::zeros(), 0.0);

        // 0.1 m/s over 1 s is below the dead zone
        let a = est.update(&Vector3::new(0.1, 0.0, 0.0), 1.0);
        assert_eq!(a.x, 0.0);

        // 10 m/s over 1 s clips to the configured maximum
        let a = est.update(&Vector3::new(10.1, 0.0, 0.0), 2.0);
        assert_eq!(a.x, 2.0);
    }

    #[test]
    fn test_odom_latch() {
        let mut latch = OdomLatch::new(2.0);
        assert!(latch.get().is_none());

        latch.set_pose(&PoseMsg {
            position_m: Vector3::new(1.0, 2.0, 3.0),
            orientation: UnitQuaternion::identity(),
            stamp_s: 0.5,
        });
        latch.set_velocity(&VelocityMsg {
            linear_ms: Vector3::new(0.1, 0.0, 0.0),
            angular_rads: Vector3::zeros(),
            stamp_s: 0.5,
        });

        let state = latch.get().unwrap();
        assert_eq!(state.position_m, Vector3::new(1.0, 2.0, 3.0));
        assert!(latch.is_received());
    }
}

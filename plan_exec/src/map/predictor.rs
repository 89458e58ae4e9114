//! # Obstacle velocity prediction
//!
//! The risk map propagates occupied voxels into future time slices under a
//! per-voxel world velocity. Two sources provide that velocity behind the
//! same query surface:
//!
//! - [`GroundTruthPredictor`] - obstacle states supplied by the simulator
//!   ("fake" map variant).
//! - [`ParticleFlowPredictor`] - a lightweight dynamic-occupancy filter which
//!   clusters occupied voxels and tracks cluster centroids between scans.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::collections::{HashSet, VecDeque};

use comms_if::ingress::{ObstacleGroundTruthMsg, ObstacleKind, ObstacleMarker};
use log::{debug, warn};
use nalgebra::Vector3;

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Exponential smoothing factor applied to tracked cluster velocities.
const VELOCITY_EMA_ALPHA: f64 = 0.6;

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Obstacle velocity source, dispatching to the configured variant.
#[derive(Debug)]
pub enum Predictor {
    Fake(GroundTruthPredictor),
    Particle(ParticleFlowPredictor),
}

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Velocity source backed by simulator ground truth markers.
#[derive(Debug, Default)]
pub struct GroundTruthPredictor {
    markers: Vec<ObstacleMarker>,

    /// Membership tolerance added to each marker's extent, in meters.
    clearance_m: f64,

    /// Voxel resolution, used for the ring membership band.
    resolution_m: f64,
}

/// Velocity source estimated from consecutive scans.
#[derive(Debug)]
pub struct ParticleFlowPredictor {
    /// Clusters tracked at the last observation.
    clusters: Vec<Cluster>,

    /// Session time of the last observation.
    last_stamp_s: Option<f64>,

    /// Maximum centroid displacement accepted when matching clusters between
    /// scans, in meters.
    match_gate_m: f64,
}

/// One tracked group of occupied voxels.
#[derive(Debug, Clone)]
struct Cluster {
    /// World-frame centroid, in meters.
    centroid_m: Vector3<f64>,

    /// Largest centroid-to-member distance, in meters.
    radius_m: f64,

    /// Smoothed world-frame velocity, in meters/second.
    velocity_ms: Vector3<f64>,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Predictor {
    /// World velocity assigned to an occupied voxel at the given world
    /// position. Unmatched voxels are treated as static.
    pub fn velocity_at(&self, world_m: &Vector3<f64>) -> Vector3<f64> {
        match self {
            Predictor::Fake(p) => p.velocity_at(world_m),
            Predictor::Particle(p) => p.velocity_at(world_m),
        }
    }

    /// Ingest a ground truth message. Ignored with a warning for the particle
    /// variant, which estimates motion from the cloud alone.
    pub fn ingest_ground_truth(&mut self, msg: &ObstacleGroundTruthMsg) {
        match self {
            Predictor::Fake(p) => p.ingest(msg),
            Predictor::Particle(_) => {
                warn!("Ground truth received but the particle predictor is configured, ignored");
            }
        }
    }

    /// Observe the occupied voxels of a fresh scan. No-op for the ground
    /// truth variant.
    pub fn observe(
        &mut self,
        occupied: &[(Vector3<i64>, Vector3<f64>)],
        resolution_m: f64,
        stamp_s: f64,
    ) {
        if let Predictor::Particle(p) = self {
            p.observe(occupied, resolution_m, stamp_s);
        }
    }
}

impl GroundTruthPredictor {
    pub fn new(clearance_m: f64, resolution_m: f64) -> Self {
        Self {
            markers: Vec::new(),
            clearance_m,
            resolution_m,
        }
    }

    fn ingest(&mut self, msg: &ObstacleGroundTruthMsg) {
        self.markers = msg.markers.clone();
    }

    /// Velocity of the marker containing the given point, or zero if the
    /// point belongs to no marker (static structure).
    fn velocity_at(&self, world_m: &Vector3<f64>) -> Vector3<f64> {
        for marker in &self.markers {
            match marker.kind {
                ObstacleKind::Cylinder => {
                    // Horizontal distance to the cylinder axis
                    let axis_pt =
                        Vector3::new(marker.position_m.x, marker.position_m.y, world_m.z);
                    if (world_m - axis_pt).norm() <= marker.width_m + self.clearance_m {
                        return Vector3::new(marker.velocity_ms.x, marker.velocity_ms.y, 0.0);
                    }
                }
                ObstacleKind::Ring => {
                    // Membership band around the ring: close to the ring's
                    // plane and near the ring radius within it
                    let normal = marker.orientation * Vector3::z();
                    let to_point = world_m - marker.position_m;
                    let dist_to_plane = to_point.dot(&normal).abs();
                    let in_plane = to_point - to_point.dot(&normal) * normal;
                    let dist_to_radius = (in_plane.norm() - marker.width_m / 2.0).abs();

                    if dist_to_plane < 2.0 * self.resolution_m
                        && dist_to_radius < 2.0 * self.resolution_m
                    {
                        return Vector3::new(marker.velocity_ms.x, marker.velocity_ms.y, 0.0);
                    }
                }
            }
        }
        Vector3::zeros()
    }
}

impl ParticleFlowPredictor {
    pub fn new(match_gate_m: f64) -> Self {
        Self {
            clusters: Vec::new(),
            last_stamp_s: None,
            match_gate_m,
        }
    }

    /// Velocity of the cluster containing the given point, or zero if the
    /// point is outside every tracked cluster.
    fn velocity_at(&self, world_m: &Vector3<f64>) -> Vector3<f64> {
        for cluster in &self.clusters {
            if (world_m - cluster.centroid_m).norm() <= cluster.radius_m + self.match_gate_m * 0.5 {
                return cluster.velocity_ms;
            }
        }
        Vector3::zeros()
    }

    /// Cluster the occupied voxels of a scan and update tracked velocities by
    /// nearest-centroid matching against the previous scan.
    ///
    /// `occupied` pairs each occupied voxel's integer coordinates with its
    /// world-frame center.
    fn observe(
        &mut self,
        occupied: &[(Vector3<i64>, Vector3<f64>)],
        resolution_m: f64,
        stamp_s: f64,
    ) {
        let fresh = Self::cluster(occupied, resolution_m);

        let dt = self.last_stamp_s.map(|t| stamp_s - t);

        let mut next = Vec::with_capacity(fresh.len());
        for (centroid_m, radius_m) in fresh {
            // Match against the nearest previous cluster within the gate
            let matched = self
                .clusters
                .iter()
                .map(|c| ((c.centroid_m - centroid_m).norm(), c))
                .filter(|(d, _)| *d <= self.match_gate_m)
                .min_by(|a, b| a.0.partial_cmp(&b.0).expect("Unexpected NaN distance"));

            let velocity_ms = match (matched, dt) {
                (Some((_, prev)), Some(dt)) if dt > 0.0 => {
                    let raw = (centroid_m - prev.centroid_m) / dt;
                    prev.velocity_ms * (1.0 - VELOCITY_EMA_ALPHA) + raw * VELOCITY_EMA_ALPHA
                }
                _ => Vector3::zeros(),
            };

            next.push(Cluster {
                centroid_m,
                radius_m,
                velocity_ms,
            });
        }

        debug!("Tracking {} obstacle clusters", next.len());
        self.clusters = next;
        self.last_stamp_s = Some(stamp_s);
    }

    /// Group occupied voxels into 6-connected clusters, returning each
    /// cluster's world centroid and radius.
    fn cluster(
        occupied: &[(Vector3<i64>, Vector3<f64>)],
        resolution_m: f64,
    ) -> Vec<(Vector3<f64>, f64)> {
        let coords: HashSet<(i64, i64, i64)> = occupied
            .iter()
            .map(|(c, _)| (c.x, c.y, c.z))
            .collect();

        let mut visited: HashSet<(i64, i64, i64)> = HashSet::new();
        let mut out = Vec::new();

        for (c, _) in occupied {
            let key = (c.x, c.y, c.z);
            if visited.contains(&key) {
                continue;
            }

            // Flood fill from this voxel
            let mut members = Vec::new();
            let mut queue = VecDeque::new();
            queue.push_back(key);
            visited.insert(key);

            while let Some(v) = queue.pop_front() {
                members.push(v);
                for (dx, dy, dz) in [
                    (1, 0, 0),
                    (-1, 0, 0),
                    (0, 1, 0),
                    (0, -1, 0),
                    (0, 0, 1),
                    (0, 0, -1),
                ] {
                    let n = (v.0 + dx, v.1 + dy, v.2 + dz);
                    if coords.contains(&n) && visited.insert(n) {
                        queue.push_back(n);
                    }
                }
            }

            // Centroid and radius in world frame. Member coordinates are
            // converted back through the lookup of the original pairs.
            let mut centroid = Vector3::zeros();
            let mut world_members = Vec::with_capacity(members.len());
            for (coords_i, world) in occupied {
                if members.contains(&(coords_i.x, coords_i.y, coords_i.z)) {
                    centroid += world;
                    world_members.push(*world);
                }
            }
            centroid /= world_members.len() as f64;

            let radius = world_members
                .iter()
                .map(|w| (w - centroid).norm())
                .fold(0.0f64, f64::max)
                .max(resolution_m);

            out.push((centroid, radius));
        }

        out
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use nalgebra::UnitQuaternion;

    fn cylinder_marker(x: f64, y: f64, vx: f64, vy: f64) -> ObstacleMarker {
        ObstacleMarker {
            kind: ObstacleKind::Cylinder,
            position_m: Vector3::new(x, y, 0.0),
            width_m: 0.3,
            height_m: 2.0,
            velocity_ms: Vector3::new(vx, vy, 0.0),
            orientation: UnitQuaternion::identity(),
        }
    }

    #[test]
    fn test_ground_truth_cylinder_membership() {
        let mut p = GroundTruthPredictor::new(0.2, 0.1);
        p.ingest(&ObstacleGroundTruthMsg {
            markers: vec![cylinder_marker(2.0, 0.0, 0.0, 1.0)],
        });

        // Inside the inflated cylinder
        let v = p.velocity_at(&Vector3::new(2.1, 0.1, 1.0));
        assert_eq!(v, Vector3::new(0.0, 1.0, 0.0));

        // Far away, static
        assert_eq!(p.velocity_at(&Vector3::new(5.0, 5.0, 1.0)), Vector3::zeros());
    }

    #[test]
    fn test_particle_flow_tracks_moving_cluster() {
        let mut p = ParticleFlowPredictor::new(1.0);

        let scan_at = |x0: f64| -> Vec<(Vector3<i64>, Vector3<f64>)> {
            (0..3)
                .map(|i| {
                    (
                        Vector3::new((x0 * 10.0) as i64 + i, 0, 0),
                        Vector3::new(x0 + 0.1 * i as f64, 0.0, 1.0),
                    )
                })
                .collect()
        };

        p.observe(&scan_at(1.0), 0.1, 0.0);
        p.observe(&scan_at(1.5), 0.1, 1.0);

        // Cluster moved 0.5 m in 1 s, EMA from zero gives 0.6 * 0.5
        let v = p.velocity_at(&Vector3::new(1.6, 0.0, 1.0));
        assert!((v.x - 0.3).abs() < 1e-9);
        assert_eq!(v.y, 0.0);
    }

    #[test]
    fn test_particle_flow_static_cluster() {
        let mut p = ParticleFlowPredictor::new(1.0);

        let scan: Vec<(Vector3<i64>, Vector3<f64>)> = vec![
            (Vector3::new(0, 0, 0), Vector3::new(0.0, 0.0, 1.0)),
            (Vector3::new(1, 0, 0), Vector3::new(0.1, 0.0, 1.0)),
        ];

        p.observe(&scan, 0.1, 0.0);
        p.observe(&scan, 0.1, 0.5);

        let v = p.velocity_at(&Vector3::new(0.05, 0.0, 1.0));
        assert!(v.norm() < 1e-9);
    }

    #[test]
    fn test_cluster_separation() {
        let scan: Vec<(Vector3<i64>, Vector3<f64>)> = vec![
            (Vector3::new(0, 0, 0), Vector3::new(0.0, 0.0, 0.0)),
            (Vector3::new(1, 0, 0), Vector3::new(0.1, 0.0, 0.0)),
            // Disconnected second group
            (Vector3::new(10, 10, 0), Vector3::new(1.0, 1.0, 0.0)),
        ];

        let clusters = ParticleFlowPredictor::cluster(&scan, 0.1);
        assert_eq!(clusters.len(), 2);
    }
}

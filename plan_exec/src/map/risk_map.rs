//! # Risk voxel map
//!
//! Maintains the spatio-temporal risk tensor: per voxel, an occupancy
//! probability at each of several future time slices, centered on the vehicle
//! at the last update instant. The planner never reads the working buffer
//! directly; each update swaps in a freshly built [`RiskSnapshot`] and a
//! planning cycle holds one snapshot for its whole duration.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::sync::Arc;

use comms_if::{egress::OccupancyCloudMsg, ingress::PointCloudMsg};
use log::debug;
use nalgebra::Vector3;
use ndarray::Array2;

use crate::params::{MapParams, PredictorKind};

use super::grid::{GridError, VoxelGrid};
use super::predictor::{GroundTruthPredictor, ParticleFlowPredictor, Predictor};

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Result of an occupancy query.
///
/// Out-of-range queries are reported as such, never defaulted to free or
/// occupied; the caller decides how unknown space is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occupancy {
    Free,
    Occupied,
    OutOfRange,
}

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// An immutable snapshot of the risk tensor, valid for one planning cycle.
#[derive(Debug)]
pub struct RiskSnapshot {
    /// Grid geometry at the snapshot instant.
    pub grid: VoxelGrid,

    /// World-frame position of the map center (the vehicle pose at the
    /// update instant).
    pub center_m: Vector3<f64>,

    /// Session time of the update, in seconds.
    pub stamp_s: f64,

    /// Separation between time slices, in seconds.
    pub time_resolution_s: f64,

    /// Risk values, shape `(voxel_count, prediction_slices)`.
    risk: Array2<f32>,

    /// Integer offsets of the clearance sphere used for query-time inflation.
    kernel: Vec<Vector3<i64>>,

    /// Summed kernel risk above which a query is occupied.
    threshold: f32,
}

/// The risk voxel map updater.
pub struct RiskMap {
    params: MapParams,
    grid: VoxelGrid,
    predictor: Predictor,
    kernel: Vec<Vector3<i64>>,
    snapshot: Arc<RiskSnapshot>,
    updated: bool,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl RiskSnapshot {
    /// Number of future time slices.
    pub fn num_slices(&self) -> usize {
        self.risk.ncols()
    }

    /// Risk above which a single voxel counts as occupied.
    pub fn single_voxel_threshold(&self) -> f32 {
        self.threshold
    }

    /// Raw risk of the single voxel containing the world-frame point at the
    /// given slice, or `None` if the point is outside the map.
    pub fn risk_at(&self, world_m: &Vector3<f64>, slice: usize) -> Option<f32> {
        let rel = world_m - self.center_m;
        let idx = self.grid.index_of(&rel)?;
        let slice = slice.min(self.num_slices() - 1);
        Some(self.risk[[idx, slice]])
    }

    /// Raw risk at a future offset `dt_s` from the update instant, using the
    /// nearest slice at or below the offset.
    pub fn risk_at_offset(&self, world_m: &Vector3<f64>, dt_s: f64) -> Option<f32> {
        let slice = ((dt_s / self.time_resolution_s).floor().max(0.0)) as usize;
        self.risk_at(world_m, slice)
    }

    /// Inflated occupancy of the world-frame point at the given slice.
    ///
    /// Sums the risk over the clearance kernel and compares the sum to the
    /// single-voxel threshold. Kernel offsets falling outside the map are
    /// skipped; a query point outside the map is `OutOfRange`.
    pub fn inflate_occupancy(&self, world_m: &Vector3<f64>, slice: usize) -> Occupancy {
        let rel = world_m - self.center_m;
        let coords = self.grid.coords_of(&rel);
        if !self.grid.coords_in_range(&coords) {
            return Occupancy::OutOfRange;
        }
        let slice = slice.min(self.num_slices() - 1);

        let mut sum = 0.0f32;
        for offset in &self.kernel {
            let c = coords + offset;
            if !self.grid.coords_in_range(&c) {
                continue;
            }
            sum += self.risk[[self.grid.index_of_coords(&c), slice]];
            if sum > self.threshold {
                return Occupancy::Occupied;
            }
        }
        Occupancy::Free
    }

    /// Inflated occupancy at a fractional future offset.
    ///
    /// Free only if both the floor and ceil bracketing slices are free;
    /// out-of-range dominates.
    pub fn clear_occupancy(&self, world_m: &Vector3<f64>, dt_s: f64) -> Occupancy {
        let dt = dt_s.max(0.0) / self.time_resolution_s;
        let last = self.num_slices() - 1;
        let lo = (dt.floor() as usize).min(last);
        let hi = (dt.ceil() as usize).min(last);

        match (
            self.inflate_occupancy(world_m, lo),
            self.inflate_occupancy(world_m, hi),
        ) {
            (Occupancy::OutOfRange, _) | (_, Occupancy::OutOfRange) => Occupancy::OutOfRange,
            (Occupancy::Free, Occupancy::Free) => Occupancy::Free,
            _ => Occupancy::Occupied,
        }
    }

    /// Append the world-frame centers of voxels whose risk exceeds
    /// `threshold` in any slice overlapping the session-time window
    /// `[t_lo_s, t_hi_s]`, restricted to the world-frame box `[lo_m, hi_m]`.
    pub fn get_obstacle_points(
        &self,
        out: &mut Vec<Vector3<f64>>,
        t_lo_s: f64,
        t_hi_s: f64,
        lo_m: &Vector3<f64>,
        hi_m: &Vector3<f64>,
        threshold: f32,
    ) {
        let last = self.num_slices() - 1;
        let s_lo = (((t_lo_s - self.stamp_s) / self.time_resolution_s).floor().max(0.0) as usize)
            .min(last);
        let s_hi = (((t_hi_s - self.stamp_s) / self.time_resolution_s).ceil().max(0.0) as usize)
            .min(last);

        for idx in 0..self.grid.voxel_count() {
            let occupied = (s_lo..=s_hi).any(|s| self.risk[[idx, s]] > threshold);
            if !occupied {
                continue;
            }

            let world = self.grid.voxel_center(idx) + self.center_m;
            if world.x >= lo_m.x
                && world.x <= hi_m.x
                && world.y >= lo_m.y
                && world.y <= hi_m.y
                && world.z >= lo_m.z
                && world.z <= hi_m.z
            {
                out.push(world);
            }
        }
    }
}

impl RiskMap {
    pub fn new(params: MapParams) -> Result<Self, GridError> {
        let grid = VoxelGrid::new(&params)?;

        let predictor = match params.predictor {
            PredictorKind::Fake => Predictor::Fake(GroundTruthPredictor::new(
                params.clearance_m,
                params.voxel_resolution_m,
            )),
            PredictorKind::Particle => {
                Predictor::Particle(ParticleFlowPredictor::new(params.cluster_match_gate_m))
            }
        };

        let kernel = Self::build_kernel(params.clearance_m, params.voxel_resolution_m);
        debug!("Inflation kernel size: {}", kernel.len());

        let snapshot = Arc::new(RiskSnapshot {
            grid,
            center_m: Vector3::zeros(),
            stamp_s: 0.0,
            time_resolution_s: params.time_resolution_s,
            risk: Array2::zeros((grid.voxel_count(), params.prediction_slices)),
            kernel: kernel.clone(),
            threshold: params.risk_threshold_single_voxel,
        });

        Ok(Self {
            params,
            grid,
            predictor,
            kernel,
            snapshot,
            updated: false,
        })
    }

    /// Integer offsets within the clearance sphere.
    fn build_kernel(clearance_m: f64, resolution_m: f64) -> Vec<Vector3<i64>> {
        let steps = (clearance_m / resolution_m).floor() as i64;
        let mut kernel = Vec::new();
        for x in -steps..=steps {
            for y in -steps..=steps {
                for z in -steps..=steps {
                    let off = Vector3::new(x, y, z);
                    if (off.map(|v| v as f64) * resolution_m).norm() <= clearance_m {
                        kernel.push(off);
                    }
                }
            }
        }
        kernel
    }

    /// Rebuild the tensor from a fresh point cloud synchronized with the
    /// vehicle pose, then swap the published snapshot.
    ///
    /// `peer_slices` holds, per time slice, the world-frame points at which
    /// peer reservations are active; these are overlaid as occupied.
    pub fn update(
        &mut self,
        cloud: &PointCloudMsg,
        pose_m: &Vector3<f64>,
        peer_slices: &[Vec<Vector3<f64>>],
    ) {
        let slices = self.params.prediction_slices;
        let mut risk = Array2::<f32>::zeros((self.grid.voxel_count(), slices));

        // Slice 0: every voxel hit by a surviving point is occupied
        for pt in &cloud.points_m {
            let rel = pt - pose_m;
            if let Some(idx) = self.grid.index_of(&rel) {
                risk[[idx, 0]] = 1.0;
            }
        }

        // Collect occupied voxels with their world centers
        let mut occupied = Vec::new();
        for idx in 0..self.grid.voxel_count() {
            if risk[[idx, 0]] > self.params.risk_threshold_single_voxel {
                occupied.push((
                    self.grid.coords_of_index(idx),
                    self.grid.voxel_center(idx) + pose_m,
                ));
            }
        }

        // Let the dynamic-occupancy filter see the fresh scan before velocity
        // queries
        self.predictor
            .observe(&occupied, self.params.voxel_resolution_m, cloud.stamp_s);

        // Propagate each occupied voxel linearly under its world velocity
        for (_, world) in &occupied {
            let vel = self.predictor.velocity_at(world);
            for k in 1..slices {
                let pred_rel =
                    world + vel * self.params.time_resolution_s * k as f64 - pose_m;
                if let Some(idx) = self.grid.index_of(&pred_rel) {
                    risk[[idx, k]] = 1.0;
                }
            }
        }

        // Overlay peer reserved volumes
        for (k, pts) in peer_slices.iter().enumerate().take(slices) {
            for pt in pts {
                if let Some(idx) = self.grid.index_of(&(pt - pose_m)) {
                    risk[[idx, k]] = 1.0;
                }
            }
        }

        self.snapshot = Arc::new(RiskSnapshot {
            grid: self.grid,
            center_m: *pose_m,
            stamp_s: cloud.stamp_s,
            time_resolution_s: self.params.time_resolution_s,
            risk,
            kernel: self.kernel.clone(),
            threshold: self.params.risk_threshold_single_voxel,
        });
        self.updated = true;
    }

    /// The snapshot built by the most recent update. Cheap to clone; valid
    /// for one planning cycle.
    pub fn snapshot(&self) -> Arc<RiskSnapshot> {
        Arc::clone(&self.snapshot)
    }

    /// True once at least one update has been ingested.
    pub fn is_updated(&self) -> bool {
        self.updated
    }

    pub fn predictor_mut(&mut self) -> &mut Predictor {
        &mut self.predictor
    }

    /// Occupied voxel centers of slice 0, for introspection.
    pub fn publish(&self) -> OccupancyCloudMsg {
        let snap = &self.snapshot;
        let mut points = Vec::new();
        for idx in 0..snap.grid.voxel_count() {
            if snap.risk[[idx, 0]] > self.params.risk_threshold_single_voxel {
                points.push(snap.grid.voxel_center(idx) + snap.center_m);
            }
        }
        OccupancyCloudMsg {
            stamp_s: snap.stamp_s,
            map_center_m: snap.center_m,
            points_m: points,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use comms_if::ingress::{ObstacleGroundTruthMsg, ObstacleKind, ObstacleMarker};
    use nalgebra::UnitQuaternion;

    fn test_params(predictor: PredictorKind) -> MapParams {
        MapParams {
            voxel_resolution_m: 0.1,
            map_length_voxels: 60,
            map_width_voxels: 60,
            map_height_voxels: 20,
            prediction_slices: 5,
            time_resolution_s: 0.5,
            risk_threshold_single_voxel: 0.2,
            clearance_m: 0.2,
            predictor,
            cluster_match_gate_m: 1.0,
        }
    }

    fn cloud_of(points: Vec<Vector3<f64>>, stamp_s: f64) -> PointCloudMsg {
        PointCloudMsg {
            points_m: points,
            stamp_s,
            frame: "world".into(),
        }
    }

    /// Cloud sampling a small vertical column at the given xy position.
    fn column_cloud(x: f64, y: f64, stamp_s: f64) -> PointCloudMsg {
        let mut pts = Vec::new();
        for i in 0..10 {
            pts.push(Vector3::new(x, y, 0.55 + 0.1 * i as f64));
        }
        cloud_of(pts, stamp_s)
    }

    #[test]
    fn test_propagation_under_ground_truth_velocity() {
        let mut map = RiskMap::new(test_params(PredictorKind::Fake)).unwrap();

        // A cylinder at (1, 0) moving +y at 1 m/s
        map.predictor_mut().ingest_ground_truth(&ObstacleGroundTruthMsg {
            markers: vec![ObstacleMarker {
                kind: ObstacleKind::Cylinder,
                position_m: Vector3::new(1.0, 0.0, 0.0),
                width_m: 0.2,
                height_m: 2.0,
                velocity_ms: Vector3::new(0.0, 1.0, 0.0),
                orientation: UnitQuaternion::identity(),
            }],
        });

        map.update(&column_cloud(1.0, 0.0, 0.0), &Vector3::zeros(), &[]);
        let snap = map.snapshot();

        // Slice 0 occupied at the observed position
        assert!(snap.risk_at(&Vector3::new(1.0, 0.0, 1.0), 0).unwrap() > 0.5);

        // Slice k occupied at the propagated position p + u * k * dt
        for k in 1..5usize {
            let shifted = Vector3::new(1.0, 0.5 * k as f64, 1.0);
            assert!(
                snap.risk_at(&shifted, k).unwrap() > 0.5,
                "expected occupancy at slice {} position {:?}",
                k,
                shifted
            );
        }

        // The original position is clear of risk in the far slices
        assert!(snap.risk_at(&Vector3::new(1.0, 0.0, 1.0), 4).unwrap() < 0.5);
    }

    #[test]
    fn test_out_of_range_is_distinguished() {
        let mut map = RiskMap::new(test_params(PredictorKind::Fake)).unwrap();
        map.update(&cloud_of(vec![], 0.0), &Vector3::zeros(), &[]);
        let snap = map.snapshot();

        assert_eq!(
            snap.inflate_occupancy(&Vector3::new(50.0, 0.0, 0.0), 0),
            Occupancy::OutOfRange
        );
        assert_eq!(
            snap.clear_occupancy(&Vector3::new(50.0, 0.0, 0.0), 0.3),
            Occupancy::OutOfRange
        );
        assert!(snap.risk_at(&Vector3::new(50.0, 0.0, 0.0), 0).is_none());
    }

    #[test]
    fn test_inflation_covers_clearance() {
        let mut map = RiskMap::new(test_params(PredictorKind::Fake)).unwrap();
        map.update(&column_cloud(1.0, 0.0, 0.0), &Vector3::zeros(), &[]);
        let snap = map.snapshot();

        // Just beside the column but within the clearance radius
        assert_eq!(
            snap.inflate_occupancy(&Vector3::new(1.15, 0.0, 1.0), 0),
            Occupancy::Occupied
        );

        // Well clear of the column
        assert_eq!(
            snap.inflate_occupancy(&Vector3::new(2.0, 0.0, 1.0), 0),
            Occupancy::Free
        );
    }

    #[test]
    fn test_fractional_query_is_union_of_bracketing_slices() {
        let mut map = RiskMap::new(test_params(PredictorKind::Fake)).unwrap();

        map.predictor_mut().ingest_ground_truth(&ObstacleGroundTruthMsg {
            markers: vec![ObstacleMarker {
                kind: ObstacleKind::Cylinder,
                position_m: Vector3::new(1.0, 0.0, 0.0),
                width_m: 0.2,
                height_m: 2.0,
                velocity_ms: Vector3::new(1.0, 0.0, 0.0),
                orientation: UnitQuaternion::identity(),
            }],
        });
        map.update(&column_cloud(1.0, 0.0, 0.0), &Vector3::zeros(), &[]);
        let snap = map.snapshot();

        // At slice 1 the obstacle is at x = 1.5. A query at t = 0.75 s
        // brackets slices 1 and 2; x = 1.5 is occupied at slice 1 so the
        // union is occupied even though slice 2 is clear there.
        assert_eq!(
            snap.clear_occupancy(&Vector3::new(1.5, 0.0, 1.0), 0.75),
            Occupancy::Occupied
        );

        // A position never touched by the obstacle is free in both slices
        assert_eq!(
            snap.clear_occupancy(&Vector3::new(1.0, 1.5, 1.0), 0.75),
            Occupancy::Free
        );
    }

    #[test]
    fn test_peer_overlay() {
        let mut map = RiskMap::new(test_params(PredictorKind::Fake)).unwrap();

        let peer_slices: Vec<Vec<Vector3<f64>>> = (0..5)
            .map(|k| vec![Vector3::new(0.5 + 0.2 * k as f64, 1.0, 1.0)])
            .collect();

        map.update(&cloud_of(vec![], 0.0), &Vector3::zeros(), &peer_slices);
        let snap = map.snapshot();

        for k in 0..5usize {
            let p = Vector3::new(0.5 + 0.2 * k as f64, 1.0, 1.0);
            assert!(snap.risk_at(&p, k).unwrap() > 0.5);
        }
    }

    #[test]
    fn test_obstacle_points_time_window() {
        let mut map = RiskMap::new(test_params(PredictorKind::Fake)).unwrap();
        map.update(&column_cloud(1.0, 0.0, 10.0), &Vector3::zeros(), &[]);
        let snap = map.snapshot();

        let lo = Vector3::new(-3.0, -3.0, 0.0);
        let hi = Vector3::new(3.0, 3.0, 2.0);

        let mut pts = Vec::new();
        snap.get_obstacle_points(&mut pts, 10.0, 10.5, &lo, &hi, 0.2);
        assert!(!pts.is_empty());

        // All returned points are near the column in xy
        for p in &pts {
            assert!((p.xy() - Vector3::new(1.0, 0.0, 0.0).xy()).norm() < 0.2);
        }
    }
}

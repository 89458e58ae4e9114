//! # Voxel grid geometry
//!
//! Index arithmetic for the map-centered voxel grid. Positions handled here
//! are *relative to the map center*; conversion from the world frame is the
//! caller's job. The flat index layout is row-major with `z` slowest:
//! `idx = z * Lx * Ly + y * Lx + x`.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use nalgebra::Vector3;

use crate::params::MapParams;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Geometry of the voxel grid.
#[derive(Debug, Clone, Copy)]
pub struct VoxelGrid {
    /// Number of voxels along x.
    pub length_vox: usize,

    /// Number of voxels along y.
    pub width_vox: usize,

    /// Number of voxels along z.
    pub height_vox: usize,

    /// Edge length of one voxel in meters.
    pub resolution_m: f64,

    /// Half extent of the grid along x, in meters.
    pub half_length_m: f64,

    /// Half extent of the grid along y, in meters.
    pub half_width_m: f64,

    /// Half extent of the grid along z, in meters.
    pub half_height_m: f64,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum GridError {
    #[error("Grid dimensions must all be non-zero")]
    ZeroDimension,

    #[error("Voxel resolution must be positive, got {0}")]
    NonPositiveResolution(f64),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl VoxelGrid {
    pub fn new(params: &MapParams) -> Result<Self, GridError> {
        if params.map_length_voxels == 0
            || params.map_width_voxels == 0
            || params.map_height_voxels == 0
        {
            return Err(GridError::ZeroDimension);
        }
        if params.voxel_resolution_m <= 0.0 {
            return Err(GridError::NonPositiveResolution(params.voxel_resolution_m));
        }

        let res = params.voxel_resolution_m;

        Ok(Self {
            length_vox: params.map_length_voxels,
            width_vox: params.map_width_voxels,
            height_vox: params.map_height_voxels,
            resolution_m: res,
            half_length_m: params.map_length_voxels as f64 * res / 2.0,
            half_width_m: params.map_width_voxels as f64 * res / 2.0,
            half_height_m: params.map_height_voxels as f64 * res / 2.0,
        })
    }

    /// Total number of voxels in one time slice.
    pub fn voxel_count(&self) -> usize {
        self.length_vox * self.width_vox * self.height_vox
    }

    /// True if the map-relative position lies inside the grid.
    pub fn is_in_range(&self, rel_m: &Vector3<f64>) -> bool {
        rel_m.x > -self.half_length_m
            && rel_m.x < self.half_length_m
            && rel_m.y > -self.half_width_m
            && rel_m.y < self.half_width_m
            && rel_m.z > -self.half_height_m
            && rel_m.z < self.half_height_m
    }

    /// True if the integer voxel coordinates lie inside the grid.
    pub fn coords_in_range(&self, coords: &Vector3<i64>) -> bool {
        coords.x >= 0
            && (coords.x as usize) < self.length_vox
            && coords.y >= 0
            && (coords.y as usize) < self.width_vox
            && coords.z >= 0
            && (coords.z as usize) < self.height_vox
    }

    /// Integer voxel coordinates of a map-relative position. The result may
    /// be outside the grid; check with [`VoxelGrid::coords_in_range`].
    pub fn coords_of(&self, rel_m: &Vector3<f64>) -> Vector3<i64> {
        Vector3::new(
            ((rel_m.x + self.half_length_m) / self.resolution_m).floor() as i64,
            ((rel_m.y + self.half_width_m) / self.resolution_m).floor() as i64,
            ((rel_m.z + self.half_height_m) / self.resolution_m).floor() as i64,
        )
    }

    /// Flat index of in-range voxel coordinates.
    pub fn index_of_coords(&self, coords: &Vector3<i64>) -> usize {
        coords.z as usize * self.length_vox * self.width_vox
            + coords.y as usize * self.length_vox
            + coords.x as usize
    }

    /// Flat index of a map-relative position, or `None` if out of range.
    pub fn index_of(&self, rel_m: &Vector3<f64>) -> Option<usize> {
        let coords = self.coords_of(rel_m);
        if self.coords_in_range(&coords) {
            Some(self.index_of_coords(&coords))
        } else {
            None
        }
    }

    /// Voxel coordinates of a flat index.
    pub fn coords_of_index(&self, idx: usize) -> Vector3<i64> {
        let slab = self.length_vox * self.width_vox;
        Vector3::new(
            (idx % self.length_vox) as i64,
            ((idx / self.length_vox) % self.width_vox) as i64,
            (idx / slab) as i64,
        )
    }

    /// Map-relative position of the center of the voxel at the given index.
    pub fn voxel_center(&self, idx: usize) -> Vector3<f64> {
        let coords = self.coords_of_index(idx);
        Vector3::new(
            (coords.x as f64 + 0.5) * self.resolution_m - self.half_length_m,
            (coords.y as f64 + 0.5) * self.resolution_m - self.half_width_m,
            (coords.z as f64 + 0.5) * self.resolution_m - self.half_height_m,
        )
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    fn test_params() -> MapParams {
        MapParams {
            voxel_resolution_m: 0.1,
            map_length_voxels: 40,
            map_width_voxels: 40,
            map_height_voxels: 20,
            prediction_slices: 5,
            time_resolution_s: 0.2,
            risk_threshold_single_voxel: 0.2,
            clearance_m: 0.2,
            predictor: crate::params::PredictorKind::Fake,
            cluster_match_gate_m: 1.0,
        }
    }

    #[test]
    fn test_extents() {
        let grid = VoxelGrid::new(&test_params()).unwrap();

        assert_eq!(grid.voxel_count(), 40 * 40 * 20);
        assert!(grid.is_in_range(&Vector3::new(0.0, 0.0, 0.0)));
        assert!(grid.is_in_range(&Vector3::new(1.99, -1.99, 0.99)));
        assert!(!grid.is_in_range(&Vector3::new(2.01, 0.0, 0.0)));
        assert!(!grid.is_in_range(&Vector3::new(0.0, 0.0, -1.01)));
    }

    #[test]
    fn test_index_layout_z_slowest() {
        let grid = VoxelGrid::new(&test_params()).unwrap();

        // (x, y, z) = (1, 2, 3) -> 3*40*40 + 2*40 + 1
        let coords = Vector3::new(1i64, 2, 3);
        assert_eq!(grid.index_of_coords(&coords), 3 * 1600 + 2 * 40 + 1);
        assert_eq!(grid.coords_of_index(3 * 1600 + 2 * 40 + 1), coords);
    }

    #[test]
    fn test_position_index_round_trip() {
        let grid = VoxelGrid::new(&test_params()).unwrap();

        for p in [
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(1.23, -0.77, 0.31),
            Vector3::new(-1.99, 1.99, -0.99),
        ] {
            let idx = grid.index_of(&p).unwrap();
            let center = grid.voxel_center(idx);

            // The voxel center must lie in the same voxel as the query
            assert_eq!(grid.index_of(&center).unwrap(), idx);
            assert!((center - p).abs().max() <= grid.resolution_m);
        }
    }

    #[test]
    fn test_out_of_range_index_is_none() {
        let grid = VoxelGrid::new(&test_params()).unwrap();
        assert!(grid.index_of(&Vector3::new(5.0, 0.0, 0.0)).is_none());
    }
}

//! # Risk map module
//!
//! Voxelised probabilistic occupancy over a rolling spatio-temporal window
//! centered on the vehicle. The map ingests synchronized cloud/pose pairs,
//! predicts obstacle motion over the future time slices, and serves inflated
//! occupancy queries to the rest of the planner through per-cycle snapshots.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

pub mod grid;
pub mod predictor;
pub mod risk_map;

// ------------------------------------------------------------------------------------------------
// EXPORTS
// ------------------------------------------------------------------------------------------------

pub use grid::{GridError, VoxelGrid};
pub use predictor::Predictor;
pub use risk_map::{Occupancy, RiskMap, RiskSnapshot};

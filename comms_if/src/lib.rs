//! # Communications interface crate.
//!
//! Provides all common message definitions for the software. Messages are
//! plain serde-serializable data types; the transport carrying them is out of
//! the scope of this crate.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

/// Messages flowing into the planner (odometry, sensing, peers, triggers)
pub mod ingress;

/// Messages published by the planner (trajectories, corridors, introspection)
pub mod egress;

/// The broadcast trajectory message, shared between ingress and egress
pub mod traj;

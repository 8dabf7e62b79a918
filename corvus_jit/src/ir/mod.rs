//! Flowgraph and statement-tree IR consumed by the profile subsystem.

pub mod flowgraph;
pub mod tree;

//! Profile-guided flowgraph weights for the Corvus JIT.
//!
//! Two compilation modes meet here:
//! - An *instrumentation* compile plans a probe schema, asks the runtime for
//!   a counter buffer, and rewrites the flowgraph to bump counters and feed
//!   class-profile histograms.
//! - An *optimizing* compile reads the counters back, scales them for
//!   inlinees, and solves for per-block weights, a called count, and
//!   per-edge `[min, max]` ranges that respect flow conservation.
#![deny(unsafe_op_in_unsafe_fn)]
pub mod config;
pub mod ir;
pub mod opt;
pub mod profile;

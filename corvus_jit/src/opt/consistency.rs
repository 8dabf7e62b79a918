//! Post-solve profile consistency checking.
//!
//! For each profiled block the flow of counts in, the block weight, and the
//! flow of counts out should agree. Edges only carry `[min, max]` ranges,
//! so agreement means the block weight falls inside the summed range for
//! each direction. EH flow has no explicit edges and is expected to be
//! small, so the affected direction is skipped at EH boundaries.

use crate::config::ProfileCheckLevel;
use crate::ir::flowgraph::{FlowGraph, JumpKind, Weight, ZERO_WEIGHT};
use log::{debug, warn};

// =============================================================================
// Check Report
// =============================================================================

/// Outcome of one consistency check.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProfileCheckReport {
    pub profiled_blocks: u32,
    pub unprofiled_blocks: u32,
    pub problem_blocks: u32,
    /// Combined weight of profiled entry blocks.
    pub entry_weight: Weight,
    /// Combined weight of profiled return/throw blocks.
    pub exit_weight: Weight,
}

impl ProfileCheckReport {
    pub fn is_consistent(&self) -> bool {
        self.problem_blocks == 0
    }
}

// =============================================================================
// Checker
// =============================================================================

/// Verify the profile is self-consistent (or nearly so).
///
/// Returns `None` when checking is disabled. Under
/// [`ProfileCheckLevel::Assert`] a non-zero problem count aborts.
pub fn check_profile(fg: &FlowGraph, level: ProfileCheckLevel) -> Option<ProfileCheckReport> {
    if level == ProfileCheckLevel::Off {
        return None;
    }
    debug!("checking profile data");

    let mut report = ProfileCheckReport::default();
    let mut entry_profiled = false;
    let mut exit_profiled = false;
    let first = fg.first_block();

    for (id, block) in fg.iter() {
        if !block.has_profile_weight {
            report.unprofiled_blocks += 1;
            continue;
        }
        report.profiled_blocks += 1;

        let block_weight = block.weight;
        let mut verify_incoming = true;
        let mut verify_outgoing = true;

        // Calls into the method reach the entry without an edge.
        if Some(id) == first {
            report.entry_weight += block_weight;
            entry_profiled = true;
            verify_incoming = false;
        }

        // Terminal blocks flow out of the method entirely.
        if matches!(block.kind, JumpKind::Return | JumpKind::Throw) {
            report.exit_weight += block_weight;
            exit_profiled = true;
            verify_outgoing = false;
        }

        if block.eh_boundary_in {
            verify_incoming = false;
        }
        if block.eh_boundary_out {
            verify_outgoing = false;
        }

        let mut problem = false;

        if verify_incoming {
            if block.preds.is_empty() {
                debug!("  block {} - expected to see predecessors", id.0);
                problem = true;
            } else {
                let mut in_min = ZERO_WEIGHT;
                let mut in_max = ZERO_WEIGHT;
                for edge in &block.preds {
                    in_min += edge.weight_min();
                    in_max += edge.weight_max();
                }
                if in_min > in_max {
                    debug!("  block {} - incoming min {in_min} > incoming max {in_max}", id.0);
                    problem = true;
                } else if block_weight < in_min {
                    debug!("  block {} - weight {block_weight} < incoming min {in_min}", id.0);
                    problem = true;
                } else if block_weight > in_max {
                    debug!("  block {} - weight {block_weight} > incoming max {in_max}", id.0);
                    problem = true;
                }
            }
        }

        if verify_outgoing {
            let succs = block.successors();
            if succs.is_empty() {
                debug!("  block {} - expected to see successors", id.0);
                problem = true;
            } else {
                let mut out_min = ZERO_WEIGHT;
                let mut out_max = ZERO_WEIGHT;
                let mut missing_edges = 0;
                for &succ in &succs {
                    match fg.pred_edge(succ, id) {
                        Some(edge) => {
                            out_min += edge.weight_min();
                            out_max += edge.weight_max();
                        }
                        None => {
                            debug!("  block {} - no edge to successor {}", id.0, succ.0);
                            missing_edges += 1;
                        }
                    }
                }
                if missing_edges > 0 {
                    problem = true;
                } else if out_min > out_max {
                    debug!("  block {} - outgoing min {out_min} > outgoing max {out_max}", id.0);
                    problem = true;
                } else if block_weight < out_min {
                    debug!("  block {} - weight {block_weight} < outgoing min {out_min}", id.0);
                    problem = true;
                } else if block_weight > out_max {
                    debug!("  block {} - weight {block_weight} > outgoing max {out_max}", id.0);
                    problem = true;
                }
            }
        }

        if problem {
            report.problem_blocks += 1;
        }
    }

    // What enters the method should leave it.
    if entry_profiled && exit_profiled && report.entry_weight != report.exit_weight {
        debug!(
            "  entry {} exit {} mismatch",
            report.entry_weight, report.exit_weight
        );
        report.problem_blocks += 1;
    }

    if report.is_consistent() {
        if report.profiled_blocks == 0 {
            debug!("no blocks were profiled, so nothing to check");
        } else {
            debug!(
                "profile is self-consistent ({} profiled blocks, {} unprofiled)",
                report.profiled_blocks, report.unprofiled_blocks
            );
        }
    } else {
        warn!(
            "profile is NOT self-consistent, found {} problems ({} profiled blocks, {} unprofiled)",
            report.problem_blocks, report.profiled_blocks, report.unprofiled_blocks
        );
        assert!(
            level != ProfileCheckLevel::Assert,
            "inconsistent profile: {} problem blocks",
            report.problem_blocks
        );
    }

    Some(report)
}

// =============================================================================
// Tests
// =============================================================================

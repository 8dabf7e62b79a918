//! Block and edge weight solving.
//!
//! Raw counts from instrumentation are sparse and mildly inaccurate: not
//! every block carries a probe, and unsynchronized counter updates lose the
//! occasional increment. This pass fills in weights for unmeasured blocks
//! where the structure forces a unique answer, derives how often the method
//! itself is called, and then iteratively tightens a `[min, max]` range on
//! every edge until the ranges are consistent with the block weights under
//! a per-edge slop. Inputs that cannot be reconciled even with slop mark
//! the whole solve invalid rather than producing wrong "exact" answers.

use crate::ir::flowgraph::{
    slop_fraction, BlockId, FlowGraph, JumpKind, Weight, MAX_WEIGHT, UNITY_WEIGHT, ZERO_WEIGHT,
};
use crate::profile::reader::ProfileReader;
use crate::profile::scale::InlineContext;
use log::debug;

/// Iteration cap for missing-weight propagation. Downstream opts can leave
/// flow cycles whose inferred weights never settle.
const MAX_PROPAGATION_PASSES: u32 = 10;

/// Iteration cap for edge-range refinement.
const MAX_REFINEMENT_PASSES: u32 = 8;

// =============================================================================
// Solve Result
// =============================================================================

/// Everything the solver determined for one method.
///
/// This value is the only channel for solver output; the solver never
/// writes compiler-global state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightSolveResult {
    /// Estimated number of times the method is called.
    pub called_count: Weight,
    /// Edge ranges are trustworthy; false when inputs were inconsistent or
    /// refinement never ran.
    pub valid_edge_weights: bool,
    /// Some range update needed the slop allowance.
    pub slop_used: bool,
    /// At least one surviving edge still has `min < max`.
    pub range_used: bool,
    pub edge_count: u32,
    pub exact_edge_count: u32,
    /// Refinement passes executed.
    pub passes: u32,
    /// Profile data contradicted itself beyond slop.
    pub inconsistent: bool,
}

impl Default for WeightSolveResult {
    fn default() -> Self {
        Self {
            called_count: UNITY_WEIGHT,
            valid_edge_weights: false,
            slop_used: false,
            range_used: false,
            edge_count: 0,
            exact_edge_count: 0,
            passes: 0,
            inconsistent: false,
        }
    }
}

// =============================================================================
// Profile Ingestion
// =============================================================================

/// Stamp profile-derived weights onto the flowgraph's imported blocks.
///
/// For an inlinee the counts are mapped into the caller's frame of
/// reference by the precomputed scale; an inlinee without a known scale
/// gets no profile weights at all.
pub fn apply_profile_weights(
    fg: &mut FlowGraph,
    reader: &ProfileReader<'_>,
    inline: Option<&InlineContext>,
) {
    let scale = match inline {
        None => 1.0,
        Some(ctx) => match ctx.scale_factor() {
            Some(factor) => factor,
            None => return,
        },
    };
    for id in fg.block_ids() {
        let block = fg.block(id);
        if !block.imported || block.internal {
            continue;
        }
        let offset = block.il_offset;
        if let Some(weight) = reader.block_weight(offset) {
            fg.block_mut(id).set_profile_weight(weight * scale);
        }
    }
}

// =============================================================================
// Top-Level Solve
// =============================================================================

/// Solve block weights, the called count, and edge ranges.
pub fn compute_block_and_edge_weights(
    fg: &mut FlowGraph,
    using_profile: bool,
    optimizing: bool,
) -> WeightSolveResult {
    debug!("computing block and edge weights");

    let return_weight = compute_missing_block_weights(fg);

    let called_count = if using_profile {
        compute_called_count(fg, return_weight)
    } else {
        debug!("no profile data, using default called count");
        UNITY_WEIGHT
    };

    compute_edge_weights(fg, called_count, using_profile, optimizing)
}

// =============================================================================
// Missing-Weight Propagation
// =============================================================================

/// Infer weights for unprofiled blocks whose structure admits exactly one
/// answer, and sum the weights of profiled exit blocks.
///
/// Returns the combined weight of all profiled `Return`/`Throw` blocks,
/// needed when back-edges reach the entry block.
pub fn compute_missing_block_weights(fg: &mut FlowGraph) -> Weight {
    let ids = fg.block_ids();
    let mut return_weight = ZERO_WEIGHT;
    let mut iterations = 0;
    let mut modified = false;

    loop {
        let mut changed = false;
        return_weight = ZERO_WEIGHT;
        iterations += 1;

        for &id in &ids {
            let dst = fg.block(id);
            if !dst.has_profile_weight && !dst.preds.is_empty() {
                let mut candidate: Option<Weight> = None;

                // A lone predecessor that can only flow here pins our weight.
                if dst.count_of_in_edges() == 1 {
                    let src = fg.block(dst.preds[0].source());
                    if src.sole_flow_target() == Some(id) && src.has_profile_weight {
                        candidate = Some(src.weight);
                    }
                }

                // Flowing only into a block we solely feed pins it too.
                if let Some(succ_id) = dst.sole_flow_target() {
                    let succ = fg.block(succ_id);
                    if succ.count_of_in_edges() == 1 {
                        debug_assert_eq!(succ.preds[0].source(), id);
                        candidate = Some(succ.weight);
                    }
                }

                if let Some(new_weight) = candidate {
                    if fg.block(id).weight != new_weight {
                        changed = true;
                        modified = true;
                        fg.block_mut(id).set_weight(new_weight);
                    }
                }
            }

            let dst = fg.block(id);
            if dst.has_profile_weight
                && matches!(dst.kind, JumpKind::Return | JumpKind::Throw)
            {
                return_weight += dst.weight;
            }
        }

        if !changed || iterations >= MAX_PROPAGATION_PASSES {
            break;
        }
    }

    if modified {
        debug!("missing-weight propagation adjusted some blocks ({iterations} passes)");
    }
    return_weight
}

// =============================================================================
// Called-Count Derivation
// =============================================================================

/// Estimate how often the method is called, from the entry block or the
/// combined exit weight.
pub fn compute_called_count(fg: &mut FlowGraph, return_weight: Weight) -> Weight {
    let first = match fg.first_block() {
        Some(first) => first,
        None => return UNITY_WEIGHT,
    };

    // Skip past internal blocks synthesized ahead of the first IL block.
    let mut first_il = first;
    while fg.block(first_il).internal {
        match fg.block(first_il).next {
            Some(next) => first_il = next,
            None => break,
        }
    }
    if first_il != first {
        debug_assert!(fg.block(first_il).has_profile_weight);
    }

    // With a single ref into the entry its weight is the call count.
    // Otherwise back-edges inflate it and the exit weights are the better
    // estimate, unless the method never returns.
    let first_il_block = fg.block(first_il);
    let called_count =
        if first_il_block.count_of_in_edges() == 1 || return_weight == ZERO_WEIGHT {
            debug_assert!(first_il_block.has_profile_weight);
            first_il_block.weight
        } else {
            return_weight
        };

    if fg.first_is_scratch() {
        fg.block_mut(first).set_profile_weight(called_count);
    }

    debug!("using profile weights; called count is {called_count}");
    called_count
}

// =============================================================================
// Edge-Range Refinement
// =============================================================================

/// Seed and iteratively tighten every edge's `[min, max]` range.
pub fn compute_edge_weights(
    fg: &mut FlowGraph,
    called_count: Weight,
    using_profile: bool,
    optimizing: bool,
) -> WeightSolveResult {
    let mut result = WeightSolveResult {
        called_count,
        ..WeightSolveResult::default()
    };

    if !optimizing || !using_profile {
        debug!("not optimizing or no profile data, so not computing edge weights");
        return result;
    }

    let ids = fg.block_ids();
    let first = fg.first_block();
    let mut inconsistent = false;
    let mut used_slop = false;
    let mut num_edges = 0u32;

    // Seed each edge range from its source's jump kind and both endpoint
    // weights.
    'seed: for &dst_id in &ids {
        let dst = fg.block(dst_id);
        let dst_raw_weight = dst.weight;
        let dst_has_profile = dst.has_profile_weight;
        let mut dst_weight = dst_raw_weight;
        // The entry also absorbs the calls into the method; its in-edges
        // only account for the remainder.
        if Some(dst_id) == first {
            dst_weight -= called_count;
        }

        let pred_info: Vec<(JumpKind, Weight, bool)> = dst
            .preds
            .iter()
            .map(|e| {
                let src = fg.block(e.source());
                (src.kind, src.weight, src.has_profile_weight)
            })
            .collect();

        for (i, &(src_kind, src_weight, src_has_profile)) in pred_info.iter().enumerate() {
            num_edges += 1;
            let slop = slop_fraction(src_weight, dst_raw_weight) + 1.0;
            let edge = &mut fg.block_mut(dst_id).preds[i];

            // Without exact weights on both ends any previous range is
            // meaningless.
            if !src_has_profile || !dst_has_profile {
                edge.set_weights(ZERO_WEIGHT, MAX_WEIGHT);
            }

            let mut ok = true;
            match src_kind {
                JumpKind::Always
                | JumpKind::Fallthrough
                | JumpKind::CallFinally
                | JumpKind::EhCatchRet => {
                    // Sole out-edge: it carries the source's full weight.
                    ok &= edge.set_min_checked(src_weight, slop, &mut used_slop);
                    ok &= edge.set_max_checked(src_weight, slop, &mut used_slop);
                }
                JumpKind::Cond
                | JumpKind::Switch
                | JumpKind::EhFinallyRet
                | JumpKind::EhFilterRet => {
                    if edge.weight_max() > src_weight {
                        ok &= edge.set_max_checked(src_weight, slop, &mut used_slop);
                    }
                }
                JumpKind::Return | JumpKind::Throw => {
                    unreachable!("flow edge out of a terminal block")
                }
            }

            // No edge can outweigh its destination.
            if edge.weight_max() > dst_weight {
                ok &= edge.set_max_checked(dst_weight, slop, &mut used_slop);
            }

            if !ok {
                inconsistent = true;
                break 'seed;
            }
        }
    }

    result.edge_count = num_edges;

    let mut good_prev;
    let mut good_cur = 0u32;
    let mut iterations = 0u32;
    let mut incomplete = false;

    if !inconsistent {
        'refine: loop {
            iterations += 1;
            good_prev = good_cur;
            good_cur = 0;
            incomplete = false;

            // Balance the two out-edges of every conditional branch against
            // the branch weight.
            for &src_id in &ids {
                let src = fg.block(src_id);
                if src.kind != JumpKind::Cond {
                    continue;
                }
                let (next_id, dest_id) = match (src.next, src.jump_dest) {
                    (Some(n), Some(d)) => (n, d),
                    _ => continue,
                };
                let src_weight = src.weight;
                let slop_next = slop_fraction(src_weight, fg.block(next_id).weight) + 1.0;
                let slop_dest = slop_fraction(src_weight, fg.block(dest_id).weight) + 1.0;

                let (e1, e2) = match fg.pred_edge_pair_mut(next_id, dest_id, src_id) {
                    Some(pair) => pair,
                    None => continue,
                };
                debug_assert!(e1.weight_min() <= e1.weight_max());
                debug_assert!(e2.weight_min() <= e2.weight_max());

                let mut ok = true;
                let diff = src_weight - (e1.weight_min() + e2.weight_max());
                if diff > 0.0 {
                    ok &= e1.set_min_checked(e1.weight_min() + diff, slop_next, &mut used_slop);
                } else if diff < 0.0 {
                    ok &= e2.set_max_checked(e2.weight_max() + diff, slop_dest, &mut used_slop);
                }

                let diff = src_weight - (e2.weight_min() + e1.weight_max());
                if diff > 0.0 {
                    ok &= e2.set_min_checked(e2.weight_min() + diff, slop_dest, &mut used_slop);
                } else if diff < 0.0 {
                    ok &= e1.set_max_checked(e1.weight_max() + diff, slop_next, &mut used_slop);
                }

                if !ok {
                    inconsistent = true;
                    break 'refine;
                }

                // Both pairings now bracket the branch weight within slop.
                let slop_max = slop_next.max(slop_dest);
                debug_assert!(
                    (src_weight - (e1.weight_min() + e2.weight_max())).abs() <= slop_max
                );
                debug_assert!(
                    (src_weight - (e2.weight_min() + e1.weight_max())).abs() <= slop_max
                );
            }

            // Squeeze each in-edge between the destination weight and the
            // other in-edges' bounds.
            for &dst_id in &ids {
                let dst_raw_weight = fg.block(dst_id).weight;
                if dst_raw_weight == MAX_WEIGHT {
                    inconsistent = true;
                    break 'refine;
                }
                let mut dst_weight = dst_raw_weight;
                if Some(dst_id) == first {
                    dst_weight -= called_count;
                }

                let preds = &fg.block(dst_id).preds;
                let mut min_sum = ZERO_WEIGHT;
                let mut max_sum = ZERO_WEIGHT;
                for edge in preds {
                    min_sum += edge.weight_min();
                    max_sum += edge.weight_max();
                }
                let slops: Vec<Weight> = preds
                    .iter()
                    .map(|e| slop_fraction(fg.block(e.source()).weight, dst_raw_weight) + 1.0)
                    .collect();

                for i in 0..slops.len() {
                    let edge = &fg.block(dst_id).preds[i];
                    let edge_min = edge.weight_min();
                    let edge_max = edge.weight_max();
                    debug_assert!(max_sum >= edge_max);
                    debug_assert!(min_sum >= edge_min);
                    let others_max_sum = max_sum - edge_max;
                    let others_min_sum = min_sum - edge_min;
                    let slop = slops[i];

                    let mut ok = true;
                    let edge = &mut fg.block_mut(dst_id).preds[i];

                    // Lower bound: what must flow here when every other
                    // in-edge runs at its maximum.
                    if dst_weight >= others_max_sum {
                        let min_calc = dst_weight - others_max_sum;
                        if min_calc > edge_min {
                            ok &= edge.set_min_checked(min_calc, slop, &mut used_slop);
                        }
                    }

                    // Upper bound: what is left when every other in-edge
                    // runs at its minimum.
                    if dst_weight >= others_min_sum {
                        let max_calc = dst_weight - others_min_sum;
                        if max_calc < edge_max {
                            ok &= edge.set_max_checked(max_calc, slop, &mut used_slop);
                        }
                    }

                    if !ok {
                        inconsistent = true;
                        break 'refine;
                    }

                    if edge.is_exact() {
                        good_cur += 1;
                    } else {
                        incomplete = true;
                    }
                }
            }

            if num_edges == good_cur {
                debug_assert!(!incomplete);
                break;
            }
            if !(incomplete && good_cur > good_prev && iterations < MAX_REFINEMENT_PASSES) {
                break;
            }
        }
    }

    // The loop can settle with every edge exact yet a conditional branch
    // over-subscribed beyond slop; conservation at branches has to hold
    // before the ranges are declared trustworthy.
    if !inconsistent {
        for &src_id in &ids {
            let src = fg.block(src_id);
            if src.kind != JumpKind::Cond {
                continue;
            }
            let (next_id, dest_id) = match (src.next, src.jump_dest) {
                (Some(n), Some(d)) => (n, d),
                _ => continue,
            };
            if next_id == dest_id {
                continue;
            }
            let (e1, e2) = match (
                fg.pred_edge(next_id, src_id),
                fg.pred_edge(dest_id, src_id),
            ) {
                (Some(e1), Some(e2)) => (e1, e2),
                _ => continue,
            };
            let slop = slop_fraction(src.weight, fg.block(next_id).weight)
                .max(slop_fraction(src.weight, fg.block(dest_id).weight))
                + 1.0;
            let low = e1.weight_min() + e2.weight_min();
            let high = e1.weight_max() + e2.weight_max();
            if src.weight < low - slop || src.weight > high + slop {
                inconsistent = true;
                break;
            }
        }
    }

    if inconsistent {
        debug!("found inconsistent profile data, not using the edge weights");
    } else if incomplete {
        debug!(
            "computed exact weights for {good_cur} of {num_edges} edges, using {iterations} passes"
        );
    } else {
        debug!("computed exact weights for all {num_edges} edges, using {iterations} passes");
    }

    // Record whether any surviving edge still spans a range.
    let mut range_used = false;
    'scan: for &dst_id in &ids {
        for edge in &fg.block(dst_id).preds {
            if !edge.is_exact() {
                range_used = true;
                break 'scan;
            }
        }
    }

    result.slop_used = used_slop;
    result.range_used = range_used;
    result.exact_edge_count = good_cur;
    result.passes = iterations;
    result.inconsistent = inconsistent;
    result.valid_edge_weights = !inconsistent;
    result
}

// =============================================================================
// Tests
// =============================================================================

//! End-to-end profile flow tests: instrument, simulate a run, read the
//! counters back, solve weights, and validate consistency.

use corvus_jit::config::{JitConfig, ProfileCheckLevel};
use corvus_jit::ir::flowgraph::{BlockId, FlowGraph, JumpKind, Weight};
use corvus_jit::opt::consistency::check_profile;
use corvus_jit::opt::weights::{
    apply_profile_weights, compute_block_and_edge_weights, compute_missing_block_weights,
};
use corvus_jit::profile::instrument::{Instrumenter, MethodInfo};
use corvus_jit::profile::reader::ProfileReader;
use corvus_jit::profile::runtime::{CounterHandle, InProcessRuntime, MethodHandle, PgoRuntime};
use corvus_jit::profile::scale::{compute_profile_scale, InlineContext, ProfileScaleState};
use corvus_jit::profile::schema::{SchemaEntry, SchemaKind};

fn edge_range(fg: &FlowGraph, dst: BlockId, src: BlockId) -> (Weight, Weight) {
    let e = fg.pred_edge(dst, src).expect("edge missing");
    (e.weight_min(), e.weight_max())
}

fn assert_ranges_ordered(fg: &FlowGraph) {
    for (_, block) in fg.iter() {
        for edge in &block.preds {
            assert!(edge.weight_min() <= edge.weight_max());
        }
    }
}

/// A diamond: A conditionally branches to B or C, both rejoin at D.
fn diamond() -> (FlowGraph, [BlockId; 4]) {
    let mut fg = FlowGraph::new();
    let a = fg.add_block(0, JumpKind::Cond);
    let b = fg.add_block(4, JumpKind::Always);
    let c = fg.add_block(8, JumpKind::Always);
    let d = fg.add_block(12, JumpKind::Return);
    fg.block_mut(a).jump_dest = Some(c);
    fg.block_mut(b).jump_dest = Some(d);
    fg.block_mut(c).jump_dest = Some(d);
    fg.add_edge(a, b);
    fg.add_edge(a, c);
    fg.add_edge(b, d);
    fg.add_edge(c, d);
    (fg, [a, b, c, d])
}

// =============================================================================
// Weight Solving Scenarios
// =============================================================================

#[test]
fn diamond_with_measured_split_solves_exactly() {
    let (mut fg, [a, b, c, d]) = diamond();
    fg.block_mut(a).set_profile_weight(100.0);
    fg.block_mut(b).set_profile_weight(50.0);
    fg.block_mut(c).set_profile_weight(50.0);
    fg.block_mut(d).set_profile_weight(100.0);

    let result = compute_block_and_edge_weights(&mut fg, true, true);
    assert!(result.valid_edge_weights);
    assert_eq!(result.called_count, 100.0);
    assert_eq!(result.edge_count, 4);
    assert_eq!(result.exact_edge_count, 4);
    assert_eq!(fg.block(b).weight, 50.0);
    assert_eq!(fg.block(c).weight, 50.0);
    assert_eq!(edge_range(&fg, b, a), (50.0, 50.0));
    assert_eq!(edge_range(&fg, c, a), (50.0, 50.0));
    assert_eq!(edge_range(&fg, d, b), (50.0, 50.0));
    assert_eq!(edge_range(&fg, d, c), (50.0, 50.0));
    assert_ranges_ordered(&fg);

    let report = check_profile(&fg, ProfileCheckLevel::Warn).unwrap();
    assert!(report.is_consistent());
}

#[test]
fn diamond_with_silent_middle_is_rejected() {
    // Only the endpoints were measured; the middle blocks read back as
    // measured-zero, which contradicts the endpoints beyond slop.
    let (mut fg, [a, b, c, d]) = diamond();
    fg.block_mut(a).set_profile_weight(100.0);
    fg.block_mut(b).set_profile_weight(0.0);
    fg.block_mut(c).set_profile_weight(0.0);
    fg.block_mut(d).set_profile_weight(100.0);

    let result = compute_block_and_edge_weights(&mut fg, true, true);
    assert!(!result.valid_edge_weights);
    assert!(result.inconsistent);
    assert_ranges_ordered(&fg);
}

#[test]
fn missing_middle_weight_is_propagated() {
    // A(10) falls into B (unmeasured) which falls into C(10); both
    // structural rules pin B at 10.
    let mut fg = FlowGraph::new();
    let a = fg.add_block(0, JumpKind::Fallthrough);
    let b = fg.add_block(4, JumpKind::Fallthrough);
    let c = fg.add_block(8, JumpKind::Return);
    fg.add_edge(a, b);
    fg.add_edge(b, c);
    fg.block_mut(a).set_profile_weight(10.0);
    fg.block_mut(c).set_profile_weight(10.0);

    compute_missing_block_weights(&mut fg);
    assert_eq!(fg.block(b).weight, 10.0);
    assert!(!fg.block(b).run_rarely);
}

#[test]
fn overcommitted_branch_flags_inconsistent_data() {
    // The branch's two targets claim 60 + 60 against a branch weight of
    // 100; no slop absorbs that, and the solve must fail without panicking.
    let mut fg = FlowGraph::new();
    let a = fg.add_block(0, JumpKind::Cond);
    let b = fg.add_block(4, JumpKind::Return);
    let c = fg.add_block(8, JumpKind::Return);
    fg.block_mut(a).jump_dest = Some(c);
    fg.add_edge(a, b);
    fg.add_edge(a, c);
    fg.block_mut(a).set_profile_weight(100.0);
    fg.block_mut(b).set_profile_weight(60.0);
    fg.block_mut(c).set_profile_weight(60.0);

    let result = compute_block_and_edge_weights(&mut fg, true, true);
    assert!(result.inconsistent);
    assert!(!result.valid_edge_weights);
    assert_ranges_ordered(&fg);
}

#[test]
fn propagation_oscillator_terminates_and_solver_completes() {
    // An unreachable ring whose inferred weights rotate forever: the
    // propagation cap must fire and edge refinement must still run.
    let mut fg = FlowGraph::new();
    let a = fg.add_block(0, JumpKind::Return);
    fg.block_mut(a).set_profile_weight(7.0);
    let x = fg.add_block(4, JumpKind::Always);
    let y = fg.add_block(8, JumpKind::Always);
    let z = fg.add_block(12, JumpKind::Always);
    fg.block_mut(x).jump_dest = Some(y);
    fg.block_mut(y).jump_dest = Some(z);
    fg.block_mut(z).jump_dest = Some(x);
    fg.add_edge(x, y);
    fg.add_edge(y, z);
    fg.add_edge(z, x);
    fg.block_mut(x).set_weight(1.0);
    fg.block_mut(y).set_weight(2.0);
    fg.block_mut(z).set_weight(3.0);

    let result = compute_block_and_edge_weights(&mut fg, true, true);
    // Refinement ran regardless of the propagation bailout.
    assert!(result.passes >= 1);
    assert_eq!(result.called_count, 7.0);
    assert_ranges_ordered(&fg);
}

#[test]
fn run_rarely_tracks_zero_weight() {
    let mut fg = FlowGraph::new();
    let a = fg.add_block(0, JumpKind::Fallthrough);
    let b = fg.add_block(4, JumpKind::Fallthrough);
    let c = fg.add_block(8, JumpKind::Return);
    fg.add_edge(a, b);
    fg.add_edge(b, c);
    fg.block_mut(a).set_profile_weight(0.0);
    fg.block_mut(c).set_profile_weight(0.0);

    compute_block_and_edge_weights(&mut fg, true, true);
    for (_, block) in fg.iter() {
        assert_eq!(block.run_rarely, block.weight == 0.0);
    }
}

// =============================================================================
// Inlinee Scale Scenarios
// =============================================================================

#[test]
fn inlinee_scale_known() {
    let schema = vec![SchemaEntry::block_count(0)];
    let data = 40u32.to_le_bytes().to_vec();
    let callee = ProfileReader::new(&schema, &data);

    let mut caller = FlowGraph::new();
    let site = caller.add_block(0, JumpKind::Fallthrough);
    caller.block_mut(site).set_profile_weight(10.0);

    let mut ctx = InlineContext::new();
    compute_profile_scale(&mut ctx, caller.block(site), &callee);
    assert_eq!(ctx.scale_state(), ProfileScaleState::Known);
    assert_eq!(ctx.scale_factor(), Some(0.25));
}

#[test]
fn inlinee_scale_refuses_upscaling() {
    let schema = vec![SchemaEntry::block_count(0)];
    let data = 5u32.to_le_bytes().to_vec();
    let callee = ProfileReader::new(&schema, &data);

    let mut caller = FlowGraph::new();
    let site = caller.add_block(0, JumpKind::Fallthrough);
    caller.block_mut(site).set_profile_weight(10.0);

    let mut ctx = InlineContext::new();
    compute_profile_scale(&mut ctx, caller.block(site), &callee);
    assert_eq!(ctx.scale_state(), ProfileScaleState::Unavailable);
}

// =============================================================================
// Instrumentation Round Trips
// =============================================================================

#[test]
fn minimal_profiling_bails_out_on_tiny_method() {
    let mut fg = FlowGraph::new();
    fg.add_block(0, JumpKind::Return);
    let runtime = InProcessRuntime::new();
    let config = JitConfig {
        minimal_profiling: true,
        ..JitConfig::default()
    };
    let outcome = Instrumenter::new(&config, &runtime)
        .instrument_method(
            &mut fg,
            &MethodInfo {
                handle: MethodHandle(1),
                class_probe_count: 0,
                prejit: false,
            },
        )
        .unwrap();
    assert!(!outcome.instrumented);
    assert!(outcome.buffer.is_none());
    assert_eq!(outcome.schema.len(), 1);
}

#[test]
fn schema_buffer_round_trip() {
    // Instrument a three-block chain, write counts through the runtime,
    // and read every block counter back through the profile reader.
    let mut fg = FlowGraph::new();
    let a = fg.add_block(0, JumpKind::Fallthrough);
    let b = fg.add_block(4, JumpKind::Fallthrough);
    let c = fg.add_block(8, JumpKind::Return);
    fg.add_edge(a, b);
    fg.add_edge(b, c);

    let runtime = InProcessRuntime::new();
    let config = JitConfig::default();
    let outcome = Instrumenter::new(&config, &runtime)
        .instrument_method(
            &mut fg,
            &MethodInfo {
                handle: MethodHandle(7),
                class_probe_count: 0,
                prejit: false,
            },
        )
        .unwrap();
    assert!(outcome.instrumented);
    let buffer = outcome.buffer.unwrap();

    let counts = [(0u32, 500u32), (4, 300), (8, 500)];
    for entry in &outcome.schema {
        assert_eq!(entry.kind, SchemaKind::BlockIntCount);
        let (_, count) = counts
            .iter()
            .find(|(offset, _)| *offset == entry.il_offset as u32)
            .unwrap();
        runtime.write_counter(
            CounterHandle {
                buffer,
                offset: entry.offset,
            },
            *count,
        );
    }

    let data = runtime.snapshot(buffer).unwrap();
    let reader = ProfileReader::new(&outcome.schema, &data);
    assert!(reader.have_profile_data());
    for (offset, count) in counts {
        assert_eq!(reader.weight_for_il_offset(offset), Some(count as Weight));
    }
    // Unprobed offsets read as measured-zero, not absent.
    assert_eq!(reader.weight_for_il_offset(100), Some(0.0));
}

#[test]
fn instrument_execute_optimize_pipeline() {
    // The full loop: plan probes, simulate the instrumented body running,
    // then solve weights in a fresh optimizing compile of the same method.
    let mut fg = FlowGraph::new();
    let a = fg.add_block(0, JumpKind::Cond);
    let b = fg.add_block(4, JumpKind::Always);
    let c = fg.add_block(8, JumpKind::Always);
    let d = fg.add_block(12, JumpKind::Return);
    fg.block_mut(a).jump_dest = Some(c);
    fg.block_mut(b).jump_dest = Some(d);
    fg.block_mut(c).jump_dest = Some(d);
    fg.add_edge(a, b);
    fg.add_edge(a, c);
    fg.add_edge(b, d);
    fg.add_edge(c, d);

    let runtime = InProcessRuntime::new();
    let config = JitConfig::default();
    let outcome = Instrumenter::new(&config, &runtime)
        .instrument_method(
            &mut fg,
            &MethodInfo {
                handle: MethodHandle(9),
                class_probe_count: 0,
                prejit: false,
            },
        )
        .unwrap();
    let buffer = outcome.buffer.unwrap();

    // 20 calls: 14 take the branch to c, 6 fall through to b.
    let executed = [(0u32, 20u32), (4, 6), (8, 14), (12, 20)];
    for entry in &outcome.schema {
        let (_, count) = executed
            .iter()
            .find(|(offset, _)| *offset == entry.il_offset as u32)
            .unwrap();
        let handle = CounterHandle {
            buffer,
            offset: entry.offset,
        };
        for _ in 0..*count {
            runtime.bump_counter(handle);
        }
    }

    // Optimizing compile: fresh flowgraph for the same IL.
    let mut opt_fg = FlowGraph::new();
    let a = opt_fg.add_block(0, JumpKind::Cond);
    let b = opt_fg.add_block(4, JumpKind::Always);
    let c = opt_fg.add_block(8, JumpKind::Always);
    let d = opt_fg.add_block(12, JumpKind::Return);
    opt_fg.block_mut(a).jump_dest = Some(c);
    opt_fg.block_mut(b).jump_dest = Some(d);
    opt_fg.block_mut(c).jump_dest = Some(d);
    opt_fg.add_edge(a, b);
    opt_fg.add_edge(a, c);
    opt_fg.add_edge(b, d);
    opt_fg.add_edge(c, d);

    let data = runtime.snapshot(buffer).unwrap();
    let reader = ProfileReader::new(&outcome.schema, &data);
    apply_profile_weights(&mut opt_fg, &reader, None);
    let result = compute_block_and_edge_weights(&mut opt_fg, reader.have_profile_data(), true);

    assert!(result.valid_edge_weights);
    assert_eq!(result.called_count, 20.0);
    assert_eq!(edge_range(&opt_fg, b, a), (6.0, 6.0));
    assert_eq!(edge_range(&opt_fg, c, a), (14.0, 14.0));
    assert_ranges_ordered(&opt_fg);

    let report = check_profile(&opt_fg, ProfileCheckLevel::Warn).unwrap();
    assert!(report.is_consistent());
    assert_eq!(report.entry_weight, report.exit_weight);
}

#[test]
fn not_implemented_allocation_keeps_compiling() {
    struct NotImplementedRuntime;
    impl PgoRuntime for NotImplementedRuntime {
        fn alloc_pgo_instrumentation_by_schema(
            &self,
            _method: MethodHandle,
            _schema: &mut [SchemaEntry],
        ) -> Result<corvus_jit::profile::runtime::BufferId, corvus_jit::profile::runtime::AllocError>
        {
            Err(corvus_jit::profile::runtime::AllocError::NotImplemented)
        }
        fn resolve_token(
            &self,
            method: MethodHandle,
        ) -> corvus_jit::profile::runtime::ResolvedToken {
            corvus_jit::profile::runtime::ResolvedToken { token: 0, method }
        }
    }

    let mut fg = FlowGraph::new();
    let a = fg.add_block(0, JumpKind::Fallthrough);
    let b = fg.add_block(4, JumpKind::Return);
    fg.add_edge(a, b);

    let config = JitConfig::default();
    let outcome = Instrumenter::new(&config, &NotImplementedRuntime)
        .instrument_method(
            &mut fg,
            &MethodInfo {
                handle: MethodHandle(3),
                class_probe_count: 0,
                prejit: false,
            },
        )
        .unwrap();
    assert!(!outcome.instrumented);
    // No probes planted anywhere.
    for (_, block) in fg.iter() {
        assert!(block.statements.is_empty());
    }
}

// =============================================================================
// Stress Mode
// =============================================================================

#[test]
fn stress_mode_supersedes_measured_counts() {
    let schema = vec![SchemaEntry::block_count(0)];
    let data = 1234u32.to_le_bytes().to_vec();
    let reader = ProfileReader::new(&schema, &data).with_stress(0x5EED, 3);

    let stressed = reader.block_weight(0).unwrap();
    assert_ne!(stressed, 1234.0);
    // Entry weight is never stressed to zero.
    assert!(stressed > 0.0);
}

#[test]
fn stressed_solve_stays_well_formed() {
    // Whatever weights stress mode invents, the solver must uphold its
    // range invariant and terminate.
    for seed in [3u32, 11, 64, 1009] {
        let (mut fg, ids) = diamond();
        let schema: Vec<SchemaEntry> = Vec::new();
        let reader = ProfileReader::new(&schema, &[]).with_stress(0xBADF00D, seed);
        for id in ids {
            let offset = fg.block(id).il_offset;
            let weight = reader.block_weight(offset).unwrap();
            fg.block_mut(id).set_profile_weight(weight);
        }
        compute_block_and_edge_weights(&mut fg, true, true);
        assert_ranges_ordered(&fg);
    }
}

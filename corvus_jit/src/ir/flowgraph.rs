//! Basic blocks, flow edges, and the method flowgraph.
//!
//! Blocks live in a layout chain (`first` → `next` → …). Edges are owned by
//! their destination block's predecessor list and carry a `[min, max]`
//! weight range that the solver tightens toward an exact value. The range
//! update operations tolerate a per-edge slop so that mildly inaccurate
//! raw counts do not torpedo the whole solve.

use super::tree::{Stmt, TempAllocator};
use smallvec::SmallVec;

// =============================================================================
// Weights
// =============================================================================

/// Execution weight: a non-negative finite count estimate.
pub type Weight = f64;

/// Weight of a block that never runs.
pub const ZERO_WEIGHT: Weight = 0.0;

/// Default weight of a block with no profile information.
pub const UNITY_WEIGHT: Weight = 100.0;

/// Sentinel for "unknown / unbounded"; only edge maxima and unresolved
/// block weights may hold it.
pub const MAX_WEIGHT: Weight = f64::MAX;

/// Per-edge tolerance for inconsistency in raw counts, proportional to the
/// heavier endpoint of the edge.
pub fn slop_fraction(w1: Weight, w2: Weight) -> Weight {
    w1.max(w2) / 100.0
}

// =============================================================================
// Block Identity and Jump Kinds
// =============================================================================

/// A basic block identifier (index into the flowgraph's block storage).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl BlockId {
    #[inline]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// How control leaves a basic block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JumpKind {
    /// Falls into the next block in layout order.
    Fallthrough,
    /// Unconditional jump to `jump_dest`.
    Always,
    /// Conditional: `jump_dest` when taken, next block otherwise.
    Cond,
    /// Multi-way jump to `switch_targets`.
    Switch,
    /// Method return.
    Return,
    /// Throws an exception.
    Throw,
    /// Calls a finally region at `jump_dest`.
    CallFinally,
    /// Leaves a catch, resuming at `jump_dest`.
    EhCatchRet,
    /// Returns from a filter; targets in `switch_targets`.
    EhFilterRet,
    /// Returns from a finally; targets in `switch_targets`.
    EhFinallyRet,
}

// =============================================================================
// Flow Edge
// =============================================================================

/// A directed control-flow edge, stored on the destination block.
///
/// The `[min, max]` weight range starts fully unknown and is narrowed by the
/// solver; `min == max` means the edge weight is exact.
#[derive(Debug, Clone)]
pub struct FlowEdge {
    source: BlockId,
    weight_min: Weight,
    weight_max: Weight,
}

impl FlowEdge {
    /// Create a fresh edge with a fully-unknown weight range.
    pub fn new(source: BlockId) -> Self {
        Self {
            source,
            weight_min: ZERO_WEIGHT,
            weight_max: MAX_WEIGHT,
        }
    }

    /// Source block of this edge.
    #[inline]
    pub fn source(&self) -> BlockId {
        self.source
    }

    #[inline]
    pub fn weight_min(&self) -> Weight {
        self.weight_min
    }

    #[inline]
    pub fn weight_max(&self) -> Weight {
        self.weight_max
    }

    /// Whether the range has collapsed to a single value.
    #[inline]
    pub fn is_exact(&self) -> bool {
        self.weight_min == self.weight_max
    }

    /// Overwrite both bounds unconditionally.
    pub fn set_weights(&mut self, min: Weight, max: Weight) {
        debug_assert!(min <= max);
        self.weight_min = min;
        self.weight_max = max;
    }

    /// Try to set the lower bound to `new`.
    ///
    /// A `new` outside the current range is accepted when it lands within
    /// `slop` of the violated bound; the range then shifts toward `new`,
    /// which can move both endpoints. Returns false when even slop cannot
    /// absorb the update, which callers treat as inconsistent profile data.
    pub fn set_min_checked(&mut self, new: Weight, slop: Weight, used_slop: &mut bool) -> bool {
        if new >= self.weight_min && new <= self.weight_max {
            self.weight_min = new;
            return true;
        }
        if slop > 0.0 {
            if self.weight_max < new {
                if new <= self.weight_max + slop {
                    if self.weight_max != ZERO_WEIGHT {
                        self.weight_min = self.weight_max;
                        self.weight_max = new;
                    }
                    *used_slop = true;
                    return true;
                }
            } else {
                debug_assert!(self.weight_min > new);
                if new + slop >= self.weight_min {
                    self.weight_min = new;
                    *used_slop = true;
                    return true;
                }
            }
        }
        false
    }

    /// Try to set the upper bound to `new`. Same slop contract as
    /// [`FlowEdge::set_min_checked`].
    pub fn set_max_checked(&mut self, new: Weight, slop: Weight, used_slop: &mut bool) -> bool {
        if new >= self.weight_min && new <= self.weight_max {
            self.weight_max = new;
            return true;
        }
        if slop > 0.0 {
            if self.weight_max < new {
                if new <= self.weight_max + slop {
                    if self.weight_max != ZERO_WEIGHT {
                        self.weight_max = new;
                    }
                    *used_slop = true;
                    return true;
                }
            } else {
                debug_assert!(self.weight_min > new);
                if new + slop >= self.weight_min {
                    debug_assert!(self.weight_max != ZERO_WEIGHT);
                    self.weight_max = self.weight_min;
                    self.weight_min = new;
                    *used_slop = true;
                    return true;
                }
            }
        }
        false
    }
}

// =============================================================================
// Basic Block
// =============================================================================

/// A basic block in the method flowgraph.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    /// IL offset of the block's first instruction (0 for the entry).
    pub il_offset: u32,
    /// Terminator kind.
    pub kind: JumpKind,
    /// Next block in layout order.
    pub next: Option<BlockId>,
    /// Jump target for `Always`, `Cond`, `CallFinally`, `EhCatchRet`.
    pub jump_dest: Option<BlockId>,
    /// Targets for `Switch` and the EH return kinds.
    pub switch_targets: SmallVec<[BlockId; 4]>,
    /// Estimated execution weight.
    pub weight: Weight,
    /// Whether the importer produced this block.
    pub imported: bool,
    /// Compiler-synthesized block with no IL of its own.
    pub internal: bool,
    /// Block contains virtual call sites flagged for class profiling.
    pub has_class_profile: bool,
    /// Block weight came straight from profile data.
    pub has_profile_weight: bool,
    /// Block is believed to (almost) never run.
    pub run_rarely: bool,
    /// Control enters this block across an EH boundary.
    pub eh_boundary_in: bool,
    /// Control leaves this block across an EH boundary.
    pub eh_boundary_out: bool,
    /// Incoming edges; this list owns the edge weight ranges.
    pub preds: Vec<FlowEdge>,
    /// Statements executed by this block.
    pub statements: Vec<Stmt>,
}

impl BasicBlock {
    fn new(il_offset: u32, kind: JumpKind) -> Self {
        Self {
            il_offset,
            kind,
            next: None,
            jump_dest: None,
            switch_targets: SmallVec::new(),
            weight: UNITY_WEIGHT,
            imported: true,
            internal: false,
            has_class_profile: false,
            has_profile_weight: false,
            run_rarely: false,
            eh_boundary_in: false,
            eh_boundary_out: false,
            preds: Vec::new(),
            statements: Vec::new(),
        }
    }

    /// Number of incoming edges.
    #[inline]
    pub fn count_of_in_edges(&self) -> usize {
        self.preds.len()
    }

    /// Assign a weight backed by profile data, keeping `run_rarely` in sync.
    pub fn set_profile_weight(&mut self, weight: Weight) {
        self.weight = weight;
        self.has_profile_weight = true;
        self.run_rarely = weight == ZERO_WEIGHT;
    }

    /// Assign an estimated (non-profile) weight, keeping `run_rarely` in sync.
    pub fn set_weight(&mut self, weight: Weight) {
        self.weight = weight;
        self.run_rarely = weight == ZERO_WEIGHT;
    }

    /// The single block this one must flow to, when the terminator permits
    /// no other successor.
    pub fn sole_flow_target(&self) -> Option<BlockId> {
        match self.kind {
            JumpKind::Fallthrough => self.next,
            JumpKind::Always => self.jump_dest,
            _ => None,
        }
    }

    /// All successor blocks, in terminator order.
    pub fn successors(&self) -> SmallVec<[BlockId; 2]> {
        let mut succs = SmallVec::new();
        match self.kind {
            JumpKind::Fallthrough => succs.extend(self.next),
            JumpKind::Always | JumpKind::CallFinally | JumpKind::EhCatchRet => {
                succs.extend(self.jump_dest)
            }
            JumpKind::Cond => {
                succs.extend(self.next);
                succs.extend(self.jump_dest);
            }
            JumpKind::Switch | JumpKind::EhFilterRet | JumpKind::EhFinallyRet => {
                succs.extend_from_slice(&self.switch_targets)
            }
            JumpKind::Return | JumpKind::Throw => {}
        }
        succs
    }
}

// =============================================================================
// Flowgraph
// =============================================================================

/// The per-method flowgraph.
///
/// Storage is append-only; layout order is the `first` → `next` chain so a
/// scratch entry can be prepended without renumbering.
#[derive(Debug, Clone, Default)]
pub struct FlowGraph {
    blocks: Vec<BasicBlock>,
    first: Option<BlockId>,
    last: Option<BlockId>,
    scratch_entry: bool,
    temps: TempAllocator,
}

impl FlowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a block at the end of the layout chain.
    pub fn add_block(&mut self, il_offset: u32, kind: JumpKind) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BasicBlock::new(il_offset, kind));
        match self.last {
            Some(prev) => self.blocks[prev.as_usize()].next = Some(id),
            None => self.first = Some(id),
        }
        self.last = Some(id);
        id
    }

    /// Record the control-flow edge `src` → `dst`.
    pub fn add_edge(&mut self, src: BlockId, dst: BlockId) {
        self.blocks[dst.as_usize()].preds.push(FlowEdge::new(src));
    }

    /// First block in layout order.
    pub fn first_block(&self) -> Option<BlockId> {
        self.first
    }

    /// Whether the entry is a synthesized scratch block.
    pub fn first_is_scratch(&self) -> bool {
        self.scratch_entry
    }

    /// Number of blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    #[inline]
    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.as_usize()]
    }

    #[inline]
    pub fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        &mut self.blocks[id.as_usize()]
    }

    /// Local temp allocator for probe expansion.
    pub fn temps_mut(&mut self) -> &mut TempAllocator {
        &mut self.temps
    }

    /// Block ids in layout order.
    pub fn block_ids(&self) -> Vec<BlockId> {
        let mut ids = Vec::with_capacity(self.blocks.len());
        let mut cursor = self.first;
        while let Some(id) = cursor {
            ids.push(id);
            cursor = self.blocks[id.as_usize()].next;
        }
        ids
    }

    /// Iterate blocks in layout order.
    pub fn iter(&self) -> impl Iterator<Item = (BlockId, &BasicBlock)> {
        let mut cursor = self.first;
        std::iter::from_fn(move || {
            let id = cursor?;
            let block = &self.blocks[id.as_usize()];
            cursor = block.next;
            Some((id, block))
        })
    }

    /// Find the edge `src` → `dst`, if recorded.
    pub fn pred_edge(&self, dst: BlockId, src: BlockId) -> Option<&FlowEdge> {
        self.blocks[dst.as_usize()]
            .preds
            .iter()
            .find(|e| e.source() == src)
    }

    pub fn pred_edge_mut(&mut self, dst: BlockId, src: BlockId) -> Option<&mut FlowEdge> {
        self.blocks[dst.as_usize()]
            .preds
            .iter_mut()
            .find(|e| e.source() == src)
    }

    /// Borrow the edges `src` → `d1` and `src` → `d2` simultaneously.
    ///
    /// Returns None when the destinations coincide (a degenerate branch has
    /// only one effective edge) or either edge is missing.
    pub fn pred_edge_pair_mut(
        &mut self,
        d1: BlockId,
        d2: BlockId,
        src: BlockId,
    ) -> Option<(&mut FlowEdge, &mut FlowEdge)> {
        if d1 == d2 {
            return None;
        }
        let (i, j) = (d1.as_usize(), d2.as_usize());
        let (b1, b2) = if i < j {
            let (lo, hi) = self.blocks.split_at_mut(j);
            (&mut lo[i], &mut hi[0])
        } else {
            let (lo, hi) = self.blocks.split_at_mut(i);
            (&mut hi[0], &mut lo[j])
        };
        let e1 = b1.preds.iter_mut().find(|e| e.source() == src)?;
        let e2 = b2.preds.iter_mut().find(|e| e.source() == src)?;
        Some((e1, e2))
    }

    /// Make sure the entry block is a synthesized scratch block, creating
    /// and linking one if needed. Returns the scratch block's id.
    pub fn ensure_scratch_entry(&mut self) -> BlockId {
        if self.scratch_entry {
            return self.first.expect("scratch entry flagged on empty graph");
        }
        let old_first = self.first;
        let id = BlockId(self.blocks.len() as u32);
        let mut scratch = BasicBlock::new(0, JumpKind::Fallthrough);
        scratch.internal = true;
        scratch.next = old_first;
        self.blocks.push(scratch);
        self.first = Some(id);
        if self.last.is_none() {
            self.last = Some(id);
        }
        if let Some(old) = old_first {
            self.add_edge(id, old);
        }
        self.scratch_entry = true;
        id
    }
}

// =============================================================================
// Tests
// =============================================================================

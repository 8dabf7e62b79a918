//! Scaling inlinee profile counts into the caller's frame of reference.
//!
//! A callee's counters were gathered across every caller; when inlining we
//! only want the share attributable to this call site. The scale is the
//! ratio of call-site weight to callee entry weight and is only ever used
//! to scale counts *down*; a callee that appears colder than the call site
//! is treated as having no usable data.

use super::reader::ProfileReader;
use crate::ir::flowgraph::{BasicBlock, Weight, ZERO_WEIGHT};
use log::debug;

// =============================================================================
// Scale State
// =============================================================================

/// Whether an inlinee's profile scale has been worked out yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileScaleState {
    /// Not yet computed.
    Undetermined,
    /// Computation ran and the callee's counts are unusable.
    Unavailable,
    /// Scale factor is known.
    Known,
}

/// Per-inlinee compilation state.
#[derive(Debug, Clone)]
pub struct InlineContext {
    state: ProfileScaleState,
    scale: Weight,
    /// Weight of the block containing the call site in the caller.
    pub call_site_weight: Option<Weight>,
}

impl InlineContext {
    pub fn new() -> Self {
        Self {
            state: ProfileScaleState::Undetermined,
            scale: 0.0,
            call_site_weight: None,
        }
    }

    pub fn scale_state(&self) -> ProfileScaleState {
        self.state
    }

    /// The scale factor, present only once the state is `Known`.
    pub fn scale_factor(&self) -> Option<Weight> {
        match self.state {
            ProfileScaleState::Known => Some(self.scale),
            _ => None,
        }
    }
}

impl Default for InlineContext {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Scale Computation
// =============================================================================

/// Determine how much to scale the callee's raw counts.
///
/// Idempotent: once the state leaves `Undetermined` further calls return
/// immediately.
pub fn compute_profile_scale(
    ctx: &mut InlineContext,
    call_site_block: &BasicBlock,
    callee: &ProfileReader<'_>,
) {
    if ctx.state != ProfileScaleState::Undetermined {
        return;
    }
    debug!("computing inlinee profile scale");

    if !call_site_block.has_profile_weight {
        debug!("   ... call site not profiled");
        ctx.state = ProfileScaleState::Unavailable;
        return;
    }
    let call_site_weight = call_site_block.weight;
    ctx.call_site_weight = Some(call_site_weight);

    if call_site_weight == ZERO_WEIGHT {
        debug!("   ... zero call site count");
        ctx.state = ProfileScaleState::Unavailable;
        return;
    }

    if !callee.have_profile_data() {
        debug!("   ... no callee profile data");
        ctx.state = ProfileScaleState::Unavailable;
        return;
    }

    let callee_weight = match callee.block_weight(0) {
        Some(w) => w,
        None => {
            debug!("   ... no callee profile data for entry block");
            ctx.state = ProfileScaleState::Unavailable;
            return;
        }
    };

    // Refusing to upscale keeps the factor in (0, 1].
    if callee_weight < call_site_weight {
        debug!(
            "   ... callee entry count {callee_weight} is less than call site count {call_site_weight}"
        );
        ctx.state = ProfileScaleState::Unavailable;
        return;
    }

    let scale = call_site_weight / callee_weight;
    ctx.scale = scale;
    ctx.state = ProfileScaleState::Known;
    debug!(
        "   call site count {call_site_weight} callee entry count {callee_weight} scale {scale}"
    );
}

// =============================================================================
// Tests
// =============================================================================

//! Instrumentation planning: probe schema construction and flowgraph
//! rewriting for an instrumentation-mode compile.
//!
//! Two passes over the flowgraph. The first builds the schema without
//! touching any IR; the second, after the runtime has allocated counter
//! storage, expands class probes at virtual call sites and plants a counter
//! increment at the head of every non-internal imported block. When the
//! runtime declines to allocate we still make the second pass, because the
//! saved dispatch-stub addresses on profiled calls must be restored either
//! way.

use super::runtime::{AllocError, BufferId, CounterHandle, HelperId, MethodHandle, PgoRuntime};
use super::schema::SchemaEntry;
use crate::config::JitConfig;
use crate::ir::flowgraph::FlowGraph;
use crate::ir::tree::{walk_stmt_calls, CallExpr, CallKind, CallVisitor, Expr, Stmt, TempAllocator};
use log::debug;
use std::fmt;

// =============================================================================
// Planner Inputs and Outputs
// =============================================================================

/// Facts about the method being instrumented.
#[derive(Debug, Clone, Copy)]
pub struct MethodInfo {
    pub handle: MethodHandle,
    /// Class-profile candidate call sites tallied during import.
    pub class_probe_count: u32,
    /// Compiling ahead-of-time; adds the entry-callback guard.
    pub prejit: bool,
}

/// What instrumentation planning produced.
#[derive(Debug, Clone)]
pub struct InstrumentOutcome {
    /// Whether probes were actually inserted.
    pub instrumented: bool,
    /// The schema built in pass 1 (offsets filled in when allocated).
    pub schema: Vec<SchemaEntry>,
    /// Runtime buffer backing the counters, when allocated.
    pub buffer: Option<BufferId>,
    pub block_probe_count: u32,
    pub class_probe_count: u32,
}

/// Fatal instrumentation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrumentError {
    /// The runtime allocator failed for a reason other than "not
    /// supported for this method".
    Allocator(i32),
}

impl fmt::Display for InstrumentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allocator(code) => write!(f, "profile buffer allocation failed: {code:#x}"),
        }
    }
}

impl std::error::Error for InstrumentError {}

pub type InstrumentResult<T> = Result<T, InstrumentError>;

// =============================================================================
// Pass 1: Schema Construction
// =============================================================================

struct SchemaBuilder<'s> {
    schema: &'s mut Vec<SchemaEntry>,
}

impl CallVisitor for SchemaBuilder<'_> {
    fn visit_call(&mut self, call: &mut CallExpr) {
        let info = match call.candidate {
            Some(info) => info,
            None => {
                debug_assert!(false, "profiled call without candidate info");
                return;
            }
        };
        let interface_site = match call.kind {
            CallKind::VirtualStub => true,
            other => {
                debug_assert_eq!(other, CallKind::VirtualVtable);
                false
            }
        };
        self.schema
            .extend(SchemaEntry::class_histogram(info.il_offset, interface_site));
    }
}

// =============================================================================
// Pass 2: Probe Insertion
// =============================================================================

struct ProbeInserter<'s> {
    schema: &'s [SchemaEntry],
    buffer: Option<BufferId>,
    cursor: &'s mut usize,
    temps: &'s mut TempAllocator,
    visited: u32,
}

impl CallVisitor for ProbeInserter<'_> {
    fn visit_call(&mut self, call: &mut CallExpr) {
        self.visited += 1;
        if let Some(buffer) = self.buffer {
            // The histogram's storage starts at the count entry of the pair.
            let table = CounterHandle {
                buffer,
                offset: self.schema[*self.cursor].offset,
            };
            *self.cursor += 2;

            // (CALL this, ...) becomes
            // (CALL (COMMA (ASG tmp, this)
            //              (COMMA (HELPER classprofile tmp, &table) tmp)), ...)
            // so the receiver is still evaluated exactly once.
            let tmp = self.temps.alloc();
            let receiver = std::mem::replace(&mut *call.this, Expr::Nothing);
            let helper = Expr::HelperCall(
                HelperId::ClassProfile,
                vec![Expr::Local(tmp), Expr::CounterAddr(table)],
            );
            *call.this = Expr::Comma(
                Box::new(Expr::Assign(tmp, Box::new(receiver))),
                Box::new(Expr::Comma(Box::new(helper), Box::new(Expr::Local(tmp)))),
            );
        }

        // Restore the stub address whether or not we instrumented.
        if let Some(info) = call.candidate {
            call.stub_addr = Some(info.stub_addr);
        }
    }
}

/// Statement incrementing the 32-bit counter behind `handle`.
fn counter_increment(handle: CounterHandle) -> Stmt {
    Stmt::new(Expr::StoreCounter(
        handle,
        Box::new(Expr::Add(
            Box::new(Expr::LoadCounter(handle)),
            Box::new(Expr::ConstInt(1)),
        )),
    ))
}

// =============================================================================
// Instrumenter
// =============================================================================

/// Plans and applies instrumentation for one method.
pub struct Instrumenter<'a, R: PgoRuntime> {
    config: &'a JitConfig,
    runtime: &'a R,
}

impl<'a, R: PgoRuntime> Instrumenter<'a, R> {
    pub fn new(config: &'a JitConfig, runtime: &'a R) -> Self {
        Self { config, runtime }
    }

    /// Instrument `fg`. Only called for a non-inlinee instrumentation-mode
    /// compile.
    pub fn instrument_method(
        &self,
        fg: &mut FlowGraph,
        method: &MethodInfo,
    ) -> InstrumentResult<InstrumentOutcome> {
        // Pass 1: build the schema. No flowgraph mutation.
        let mut schema: Vec<SchemaEntry> = Vec::new();
        let mut block_probe_count = 0u32;
        for id in fg.block_ids() {
            let block = fg.block_mut(id);
            if !block.imported {
                continue;
            }
            if block.has_class_profile {
                let mut builder = SchemaBuilder {
                    schema: &mut schema,
                };
                for stmt in &mut block.statements {
                    walk_stmt_calls(stmt, &mut builder);
                }
            }
            if block.internal {
                continue;
            }
            schema.push(SchemaEntry::block_count(block.il_offset));
            block_probe_count += 1;
        }

        let class_probe_count = method.class_probe_count;
        debug_assert_eq!(
            schema.len(),
            (2 * class_probe_count + block_probe_count) as usize,
            "schema length disagrees with import-time probe tally"
        );

        // Trivially small methods are not worth a buffer, but a method with
        // profiled call sites must continue: their stub addresses need
        // restoring.
        if self.config.minimal_profiling && block_probe_count < 3 && class_probe_count == 0 {
            debug!(
                "not instrumenting method: {block_probe_count} blocks and {class_probe_count} calls"
            );
            return Ok(InstrumentOutcome {
                instrumented: false,
                schema,
                buffer: None,
                block_probe_count,
                class_probe_count,
            });
        }

        debug!("instrumenting method, {block_probe_count} blocks and {class_probe_count} calls");

        let buffer = match self
            .runtime
            .alloc_pgo_instrumentation_by_schema(method.handle, &mut schema)
        {
            Ok(buffer) => Some(buffer),
            Err(AllocError::NotImplemented) => {
                debug!("unable to instrument: counter allocation not implemented");
                None
            }
            Err(AllocError::Failed(code)) => return Err(InstrumentError::Allocator(code)),
        };

        // Pass 2: expand class probes, restore stub addresses, and plant
        // block counters.
        let mut cursor = 0usize;
        let mut first_count_slot: Option<CounterHandle> = None;
        let mut blocks_remaining = block_probe_count;
        let mut calls_remaining = class_probe_count;

        for id in fg.block_ids() {
            if !fg.block(id).imported {
                continue;
            }

            // Class probes can show up in internal blocks after call-site
            // splitting, so handle them before the internal check.
            if self.config.class_profiling && fg.block(id).has_class_profile {
                debug_assert!(!method.prejit);
                let mut stmts = std::mem::take(&mut fg.block_mut(id).statements);
                let visited = {
                    let mut inserter = ProbeInserter {
                        schema: &schema,
                        buffer,
                        cursor: &mut cursor,
                        temps: fg.temps_mut(),
                        visited: 0,
                    };
                    for stmt in &mut stmts {
                        walk_stmt_calls(stmt, &mut inserter);
                    }
                    inserter.visited
                };
                fg.block_mut(id).statements = stmts;
                debug_assert!(visited <= calls_remaining);
                calls_remaining = calls_remaining.saturating_sub(visited);
            }

            if fg.block(id).internal {
                continue;
            }
            blocks_remaining = blocks_remaining.saturating_sub(1);

            if let Some(buffer) = buffer {
                let entry = schema[cursor];
                debug_assert_eq!(entry.il_offset as u32, fg.block(id).il_offset);
                cursor += 1;
                let handle = CounterHandle {
                    buffer,
                    offset: entry.offset,
                };
                if first_count_slot.is_none() {
                    first_count_slot = Some(handle);
                }
                fg.block_mut(id).statements.insert(0, counter_increment(handle));
            }
        }

        if buffer.is_none() {
            return Ok(InstrumentOutcome {
                instrumented: false,
                schema,
                buffer: None,
                block_probe_count,
                class_probe_count,
            });
        }

        debug_assert_eq!(blocks_remaining, 0);
        debug_assert_eq!(calls_remaining, 0);

        // Ahead-of-time compiles notify the runtime on the cold-start
        // transition: fire the helper only while the entry counter is zero.
        if method.prejit {
            if let Some(first_slot) = first_count_slot {
                let token = self.runtime.resolve_token(method.handle);
                let callback = Expr::Ternary {
                    cond: Box::new(Expr::Ne(
                        Box::new(Expr::LoadCounter(first_slot)),
                        Box::new(Expr::ConstInt(0)),
                    )),
                    then_expr: Box::new(Expr::Nothing),
                    else_expr: Box::new(Expr::HelperCall(
                        HelperId::BbtFcnEnter,
                        vec![Expr::MethodHandle(token.method)],
                    )),
                };
                let scratch = fg.ensure_scratch_entry();
                fg.block_mut(scratch).statements.push(Stmt::new(callback));
            }
        }

        Ok(InstrumentOutcome {
            instrumented: true,
            schema,
            buffer,
            block_probe_count,
            class_probe_count,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

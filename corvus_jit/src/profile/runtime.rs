//! Runtime services consumed by the profile subsystem.
//!
//! The JIT never owns counter storage. It describes what it needs with a
//! schema, and the runtime hands back a buffer it keeps alive for the
//! lifetime of the compiled body. Counter slots are plain 32-bit integers;
//! instrumented code updates them without synchronization and the runtime
//! accepts the occasional lost update as noise.

use super::schema::{buffer_size, SchemaEntry};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::fmt;

// =============================================================================
// Handles
// =============================================================================

/// Opaque handle identifying a method to the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodHandle(pub u64);

/// Identifies one runtime-allocated profile buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u32);

/// A typed reference to one counter slot: buffer plus byte offset.
///
/// This is the only form in which slot addresses appear in IR trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CounterHandle {
    pub buffer: BufferId,
    pub offset: u32,
}

/// Runtime helpers the planner emits calls to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HelperId {
    /// Records a receiver type into a class-profile histogram.
    ClassProfile,
    /// Ahead-of-time method-entry notification.
    BbtFcnEnter,
}

/// Result of resolving a method's metadata token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedToken {
    pub token: u32,
    pub method: MethodHandle,
}

// =============================================================================
// Allocation Errors
// =============================================================================

/// Failure from the runtime's schema allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The runtime cannot instrument this method (cross-assembly generics).
    /// Compilation proceeds without probes.
    NotImplemented,
    /// Any other failure; aborts compilation.
    Failed(i32),
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotImplemented => write!(f, "instrumentation not implemented for this method"),
            Self::Failed(code) => write!(f, "profile buffer allocation failed: {code:#x}"),
        }
    }
}

impl std::error::Error for AllocError {}

// =============================================================================
// Runtime Interface
// =============================================================================

/// The slice of runtime behavior the profile subsystem depends on.
pub trait PgoRuntime {
    /// Allocate zero-initialized counter storage for `schema`, assigning
    /// each entry's buffer offset. The schema is only borrowed for the
    /// duration of the call.
    fn alloc_pgo_instrumentation_by_schema(
        &self,
        method: MethodHandle,
        schema: &mut [SchemaEntry],
    ) -> Result<BufferId, AllocError>;

    /// Resolve a method's metadata token for the entry-callback path.
    fn resolve_token(&self, method: MethodHandle) -> ResolvedToken;
}

// =============================================================================
// In-Process Runtime
// =============================================================================

#[derive(Default)]
struct BufferRegistry {
    next_id: u32,
    buffers: FxHashMap<u32, Vec<u8>>,
}

/// Runtime implementation backed by process memory.
///
/// Used by tests and by in-process tiering, where the interpreter executing
/// the instrumented body and the optimizing compile reading it back share
/// one address space.
#[derive(Default)]
pub struct InProcessRuntime {
    registry: Mutex<BufferRegistry>,
}

impl InProcessRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bump the 32-bit counter behind `handle`, as instrumented code would.
    pub fn bump_counter(&self, handle: CounterHandle) {
        let mut registry = self.registry.lock();
        if let Some(buf) = registry.buffers.get_mut(&handle.buffer.0) {
            let value = read_u32(buf, handle.offset as usize);
            write_u32(buf, handle.offset as usize, value.wrapping_add(1));
        }
    }

    /// Store an absolute counter value.
    pub fn write_counter(&self, handle: CounterHandle, value: u32) {
        let mut registry = self.registry.lock();
        if let Some(buf) = registry.buffers.get_mut(&handle.buffer.0) {
            write_u32(buf, handle.offset as usize, value);
        }
    }

    /// Quiesced copy of a buffer for the optimizing compile to read.
    pub fn snapshot(&self, buffer: BufferId) -> Option<Vec<u8>> {
        self.registry.lock().buffers.get(&buffer.0).cloned()
    }
}

impl PgoRuntime for InProcessRuntime {
    fn alloc_pgo_instrumentation_by_schema(
        &self,
        _method: MethodHandle,
        schema: &mut [SchemaEntry],
    ) -> Result<BufferId, AllocError> {
        let mut offset = 0u32;
        for entry in schema.iter_mut() {
            entry.offset = offset;
            offset += entry.slot_size() as u32;
        }
        debug_assert_eq!(offset as usize, buffer_size(schema));

        let mut registry = self.registry.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.buffers.insert(id, vec![0u8; offset as usize]);
        Ok(BufferId(id))
    }

    fn resolve_token(&self, method: MethodHandle) -> ResolvedToken {
        ResolvedToken {
            token: method.0 as u32,
            method,
        }
    }
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

// =============================================================================
// Tests
// =============================================================================

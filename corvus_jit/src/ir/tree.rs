//! Statement and expression trees.
//!
//! Just enough tree shape for the instrumentation planner: counter slot
//! loads/stores, helper calls, comma chains, and virtual call sites with
//! their saved dispatch-stub candidates. Counter slots appear only as typed
//! [`CounterHandle`] leaves; trees never carry raw addresses.

use crate::profile::runtime::{CounterHandle, HelperId, MethodHandle};

// =============================================================================
// Temps
// =============================================================================

/// Identifier of a compiler-introduced local temp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TempId(pub u32);

/// Hands out fresh temp ids for probe expansion.
#[derive(Debug, Clone, Default)]
pub struct TempAllocator {
    next: u32,
}

impl TempAllocator {
    pub fn alloc(&mut self) -> TempId {
        let id = TempId(self.next);
        self.next += 1;
        id
    }

    /// Number of temps allocated so far.
    pub fn count(&self) -> u32 {
        self.next
    }
}

// =============================================================================
// Calls
// =============================================================================

/// Dispatch mechanism of a call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// Direct (devirtualized or static) call.
    Direct,
    /// Virtual dispatch through a resolution stub.
    VirtualStub,
    /// Virtual dispatch through the vtable.
    VirtualVtable,
    /// Indirect call through a computed pointer.
    Indirect,
}

impl CallKind {
    /// Whether this is a virtual dispatch the class profiler can observe.
    pub fn is_profilable_virtual(self) -> bool {
        matches!(self, CallKind::VirtualStub | CallKind::VirtualVtable)
    }
}

/// Stub/offset information saved when the importer flagged this call as a
/// class-profile candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfileCandidateInfo {
    /// IL offset of the call instruction.
    pub il_offset: u32,
    /// Original dispatch-stub address, restored after planning.
    pub stub_addr: u64,
}

/// A call expression.
#[derive(Debug, Clone)]
pub struct CallExpr {
    pub kind: CallKind,
    /// Receiver; evaluated exactly once even after probe expansion.
    pub this: Box<Expr>,
    pub args: Vec<Expr>,
    /// Current dispatch-stub address for stub calls.
    pub stub_addr: Option<u64>,
    /// Present iff the importer marked this site for class profiling.
    pub candidate: Option<ProfileCandidateInfo>,
}

// =============================================================================
// Expressions and Statements
// =============================================================================

/// An expression tree node.
#[derive(Debug, Clone)]
pub enum Expr {
    /// No-op placeholder.
    Nothing,
    /// Integer constant.
    ConstInt(i64),
    /// Method-handle constant for runtime helpers.
    MethodHandle(MethodHandle),
    /// Read of a local temp.
    Local(TempId),
    /// 32-bit load of a profile counter slot.
    LoadCounter(CounterHandle),
    /// 32-bit store to a profile counter slot.
    StoreCounter(CounterHandle, Box<Expr>),
    /// Address of a profile table slot, passed to helpers.
    CounterAddr(CounterHandle),
    Add(Box<Expr>, Box<Expr>),
    Ne(Box<Expr>, Box<Expr>),
    /// Store into a local temp.
    Assign(TempId, Box<Expr>),
    /// Evaluate left for effect, yield right.
    Comma(Box<Expr>, Box<Expr>),
    /// Call to a named runtime helper.
    HelperCall(HelperId, Vec<Expr>),
    /// `cond ? then : else` for void-typed guards.
    Ternary {
        cond: Box<Expr>,
        then_expr: Box<Expr>,
        else_expr: Box<Expr>,
    },
    Call(CallExpr),
}

/// A rooted statement.
#[derive(Debug, Clone)]
pub struct Stmt {
    pub root: Expr,
}

impl Stmt {
    pub fn new(root: Expr) -> Self {
        Self { root }
    }
}

// =============================================================================
// Call Visitor
// =============================================================================

/// Visitor over the profilable virtual call sites of a tree.
///
/// The planner's two passes are the two implementations: one builds schema
/// entries, the other expands probes and restores stub addresses.
pub trait CallVisitor {
    fn visit_call(&mut self, call: &mut CallExpr);
}

/// Walk a statement pre-order, invoking the visitor on every virtual
/// non-indirect call.
pub fn walk_stmt_calls<V: CallVisitor>(stmt: &mut Stmt, visitor: &mut V) {
    walk_expr_calls(&mut stmt.root, visitor);
}

fn walk_expr_calls<V: CallVisitor>(expr: &mut Expr, visitor: &mut V) {
    match expr {
        Expr::Call(call) => {
            if call.kind.is_profilable_virtual() {
                visitor.visit_call(call);
            }
            walk_expr_calls(&mut call.this, visitor);
            for arg in &mut call.args {
                walk_expr_calls(arg, visitor);
            }
        }
        Expr::StoreCounter(_, v) => walk_expr_calls(v, visitor),
        Expr::Add(a, b) | Expr::Ne(a, b) | Expr::Comma(a, b) => {
            walk_expr_calls(a, visitor);
            walk_expr_calls(b, visitor);
        }
        Expr::Assign(_, v) => walk_expr_calls(v, visitor),
        Expr::HelperCall(_, args) => {
            for arg in args {
                walk_expr_calls(arg, visitor);
            }
        }
        Expr::Ternary {
            cond,
            then_expr,
            else_expr,
        } => {
            walk_expr_calls(cond, visitor);
            walk_expr_calls(then_expr, visitor);
            walk_expr_calls(else_expr, visitor);
        }
        Expr::Nothing
        | Expr::ConstInt(_)
        | Expr::MethodHandle(_)
        | Expr::Local(_)
        | Expr::LoadCounter(_)
        | Expr::CounterAddr(_) => {}
    }
}

// =============================================================================
// Tests
// =============================================================================

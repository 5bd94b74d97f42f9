//! Heap-side collaborators of the compilation pipeline
//!
//! The pipeline core does not own an object model. What lives here are the
//! thin descriptors it reads and writes at the heap boundary: generated code
//! objects, function and script descriptors, feedback storage, and the opaque
//! identifiers (heap shapes, OSR sites) that dependency tracking and
//! on-stack replacement are keyed by.

use bitflags::bitflags;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

// ==================== Identifiers ====================

/// Opaque reference to a heap shape (hidden class) that optimized code
/// speculated on. Violating the shape revokes the code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShapeId(pub u64);

/// Identifier of a loop back-edge site targeted by on-stack replacement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OsrSiteId(pub u32);

// ==================== Bailout reasons ====================

/// Why an optimization attempt declined or was shut off
///
/// Recorded on the compilation unit when a phase bails out, and on the shared
/// function descriptor when optimization is disabled permanently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BailoutReason {
    #[default]
    None,
    FunctionTooBig,
    WithStatement,
    DirectEval,
    DebuggerStatement,
    TryCatchStatement,
    OptimizationDisabled,
    GraphBuildFailed,
    DependencyChanged,
    FunctionUnreachable,
}

impl fmt::Display for BailoutReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            BailoutReason::None => "no reason",
            BailoutReason::FunctionTooBig => "function is too big to optimize",
            BailoutReason::WithStatement => "with statement",
            BailoutReason::DirectEval => "direct call to eval",
            BailoutReason::DebuggerStatement => "debugger statement",
            BailoutReason::TryCatchStatement => "try/catch statement",
            BailoutReason::OptimizationDisabled => "optimization disabled",
            BailoutReason::GraphBuildFailed => "graph construction failed",
            BailoutReason::DependencyChanged => "dependency changed during compilation",
            BailoutReason::FunctionUnreachable => "function became unreachable",
        };
        f.write_str(msg)
    }
}

// ==================== Code objects ====================

/// Kind of a generated code object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeKind {
    /// First, non-optimizing compilation; always available as a fallback
    Baseline,
    /// Speculative optimized code
    Optimized,
    /// Compiled stub routine
    Stub,
}

bitflags! {
    /// Codegen provenance recorded on the generated routine
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CodeFlags: u8 {
        /// The routine has an OSR entry point at a loop back-edge
        const OSR_ENTRY = 1 << 0;
        /// Compiled with debugger support
        const DEBUG = 1 << 1;
        /// Saves double caller registers that it clobbers
        const SAVES_CALLER_DOUBLES = 1 << 2;
    }
}

static CODE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// A generated routine. Shared and immutable apart from the deoptimization
/// mark, which invalidation sweeps flip from any thread.
#[derive(Debug)]
pub struct Code {
    id: u64,
    kind: CodeKind,
    flags: CodeFlags,
    size: usize,
    marked_for_deoptimization: AtomicBool,
}

/// Shared handle to a generated routine
pub type CodeRef = Arc<Code>;

impl Code {
    pub fn new(kind: CodeKind, flags: CodeFlags, size: usize) -> CodeRef {
        Arc::new(Self {
            id: CODE_ID_COUNTER.fetch_add(1, Ordering::SeqCst),
            kind,
            flags,
            size,
            marked_for_deoptimization: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> CodeKind {
        self.kind
    }

    pub fn flags(&self) -> CodeFlags {
        self.flags
    }

    /// Size of the generated routine in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_optimized(&self) -> bool {
        self.kind == CodeKind::Optimized
    }

    /// Mark this routine for deoptimization. Called by invalidation sweeps
    /// when a heap-shape assumption the code baked in is violated.
    pub fn mark_for_deoptimization(&self) {
        self.marked_for_deoptimization.store(true, Ordering::SeqCst);
    }

    pub fn is_marked_for_deoptimization(&self) -> bool {
        self.marked_for_deoptimization.load(Ordering::SeqCst)
    }
}

// ==================== Feedback storage ====================

/// Per-function type feedback storage. Owned by the shared function
/// descriptor; generated code reads and writes it, the pipeline only holds a
/// reference.
#[derive(Debug)]
pub struct FeedbackVector {
    slots: Mutex<Vec<u64>>,
}

impl FeedbackVector {
    pub fn new(slot_count: usize) -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(vec![0; slot_count]),
        })
    }

    pub fn slot_count(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    pub fn record(&self, slot: usize, value: u64) {
        let mut slots = self.slots.lock().unwrap();
        if slot < slots.len() {
            slots[slot] = value;
        }
    }

    pub fn get(&self, slot: usize) -> Option<u64> {
        self.slots.lock().unwrap().get(slot).copied()
    }
}

// ==================== Parser products ====================

/// AST root produced by the external parser for the function being compiled
#[derive(Debug, Clone)]
pub struct FunctionLiteral {
    pub name: String,
    pub parameter_count: usize,
    /// Byte length of the function body in source
    pub body_size: usize,
}

/// Resolved lexical scope produced by scope analysis
#[derive(Debug, Clone)]
pub struct LexicalScope {
    pub num_heap_slots: usize,
    pub is_global: bool,
}

// ==================== Function descriptors ====================

static SHARED_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct SharedFunctionData {
    id: u64,
    name: String,
    source: String,
    baseline_code: Mutex<Option<CodeRef>>,
    optimization_disabled: AtomicBool,
    disable_reason: Mutex<BailoutReason>,
    feedback: Arc<FeedbackVector>,
    opt_count: AtomicU32,
}

/// Persistent descriptor shared by every closure instantiated from the same
/// function source. Survives individual compilation attempts; the permanent
/// "never optimize this again" sink lives here, not on the transient unit.
#[derive(Debug, Clone)]
pub struct SharedFunction {
    data: Arc<SharedFunctionData>,
}

impl SharedFunction {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            data: Arc::new(SharedFunctionData {
                id: SHARED_ID_COUNTER.fetch_add(1, Ordering::SeqCst),
                name: name.into(),
                source: source.into(),
                baseline_code: Mutex::new(None),
                optimization_disabled: AtomicBool::new(false),
                disable_reason: Mutex::new(BailoutReason::None),
                feedback: FeedbackVector::new(8),
                opt_count: AtomicU32::new(0),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.data.id
    }

    pub fn name(&self) -> &str {
        &self.data.name
    }

    pub fn source(&self) -> &str {
        &self.data.source
    }

    pub fn baseline_code(&self) -> Option<CodeRef> {
        self.data.baseline_code.lock().unwrap().clone()
    }

    pub fn set_baseline_code(&self, code: CodeRef) {
        *self.data.baseline_code.lock().unwrap() = Some(code);
    }

    pub fn is_compiled(&self) -> bool {
        self.data.baseline_code.lock().unwrap().is_some()
    }

    /// Permanently flag this function as non-optimizable. Irreversible.
    pub fn disable_optimization(&self, reason: BailoutReason) {
        self.data.optimization_disabled.store(true, Ordering::SeqCst);
        *self.data.disable_reason.lock().unwrap() = reason;
        tracing::debug!(function = %self.data.name, %reason, "optimization disabled");
    }

    pub fn optimization_disabled(&self) -> bool {
        self.data.optimization_disabled.load(Ordering::SeqCst)
    }

    pub fn disable_reason(&self) -> BailoutReason {
        *self.data.disable_reason.lock().unwrap()
    }

    pub fn feedback_vector(&self) -> Arc<FeedbackVector> {
        Arc::clone(&self.data.feedback)
    }

    /// Number of optimization attempts made for this function
    pub fn opt_count(&self) -> u32 {
        self.data.opt_count.load(Ordering::SeqCst)
    }

    pub fn increment_opt_count(&self) -> u32 {
        self.data.opt_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Identity comparison; two handles are the same function iff they point
    /// at the same descriptor.
    pub fn is_identical_to(&self, other: &SharedFunction) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

#[derive(Debug)]
struct ClosureData {
    shared: SharedFunction,
    optimized_code: Mutex<Option<CodeRef>>,
    context_id: u64,
}

/// A function instance bound to a context. Install target for optimized code.
#[derive(Debug, Clone)]
pub struct Closure {
    data: Arc<ClosureData>,
}

impl Closure {
    pub fn new(shared: SharedFunction, context_id: u64) -> Self {
        Self {
            data: Arc::new(ClosureData {
                shared,
                optimized_code: Mutex::new(None),
                context_id,
            }),
        }
    }

    pub fn shared(&self) -> &SharedFunction {
        &self.data.shared
    }

    pub fn context_id(&self) -> u64 {
        self.data.context_id
    }

    /// Code the closure would run right now: optimized if installed,
    /// otherwise the shared baseline.
    pub fn code(&self) -> Option<CodeRef> {
        self.data
            .optimized_code
            .lock()
            .unwrap()
            .clone()
            .or_else(|| self.data.shared.baseline_code())
    }

    pub fn optimized_code(&self) -> Option<CodeRef> {
        self.data.optimized_code.lock().unwrap().clone()
    }

    /// Install optimized code on this closure
    pub fn install_code(&self, code: CodeRef) {
        *self.data.optimized_code.lock().unwrap() = Some(code);
    }

    /// Discard installed optimized code, falling back to baseline
    pub fn deoptimize(&self) {
        *self.data.optimized_code.lock().unwrap() = None;
    }
}

// ==================== Scripts and stubs ====================

/// A top-level script being compiled
#[derive(Debug, Clone)]
pub struct Script {
    pub name: String,
    pub source: String,
}

impl Script {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }
}

/// Kind of compiled stub routine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubKind {
    LoadIc,
    StoreIc,
    KeyedLoadIc,
    BinaryOp,
}

/// Descriptor of a stub compilation
#[derive(Debug, Clone)]
pub struct StubDescriptor {
    pub kind: StubKind,
}

impl StubDescriptor {
    pub fn new(kind: StubKind) -> Self {
        Self { kind }
    }

    pub fn name(&self) -> &'static str {
        match self.kind {
            StubKind::LoadIc => "LoadIC",
            StubKind::StoreIc => "StoreIC",
            StubKind::KeyedLoadIc => "KeyedLoadIC",
            StubKind::BinaryOp => "BinaryOp",
        }
    }
}

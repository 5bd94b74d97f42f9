//! The compilation unit: shared context for one compilation attempt
//!
//! A [`CompilationUnit`] is created by the pipeline facade for a single
//! compilation, threads configuration and intermediate artifacts through
//! every phase, and is torn down once the attempt reaches a terminal state.
//! It owns the arena all transient artifacts are allocated from, so its
//! lifetime bounds theirs, and it carries the not-yet-committed dependency
//! lists whose commit-or-rollback resolution must happen before teardown.
//!
//! Mutators are narrow and assertion-guarded: violating a precondition (a
//! set-once field set twice, an eager-only flag on a lazy unit, a mode
//! transition out of order) is a defect in the caller and aborts immediately
//! rather than producing an error value.

use crate::arena::Arena;
use crate::deps::{DependencyEntry, DependencyGroup, DependencyRegistry};
use crate::objects::{
    BailoutReason, Closure, CodeRef, FeedbackVector, FunctionLiteral, LexicalScope, OsrSiteId,
    Script, SharedFunction, StubDescriptor,
};
use rustc_hash::FxHashMap as HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

// ==================== Modes and flag domains ====================

/// Compilation mode of a unit
///
/// `Base` is non-optimizing compilation, optionally prepared for bailouts.
/// `Optimize` is the speculative optimizing tier. `NonOpt` is baseline code
/// that is never recompiled; once a unit (or its function) sinks there it
/// stays there. `Stub` compiles a stub routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompilationMode {
    Base,
    Optimize,
    NonOpt,
    Stub,
}

/// Language mode the source is compiled under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrictMode {
    #[default]
    Sloppy,
    Strict,
}

/// Restriction on the set of valid statements in a unit of compilation.
/// Violations are syntax errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseRestriction {
    /// All expressions are allowed
    #[default]
    None,
    /// Only a single expression is allowed
    SingleExpressionOnly,
}

/// Whether a serialized-code cache blob is consumed, produced, or absent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachedDataMode {
    #[default]
    None,
    Consume,
    Produce,
}

/// What is being compiled
#[derive(Debug, Clone)]
pub enum CompileTarget {
    Closure(Closure),
    SharedFunction(SharedFunction),
    Script(Script),
    Stub(StubDescriptor),
}

// ==================== Flags ====================

/// Independent named compilation properties, all false/default until set.
///
/// Kept as plain fields rather than packed bits; every setter lives on
/// [`CompilationUnit`] so the write-once and mode preconditions are explicit
/// checks, not bit-math.
#[derive(Debug, Clone, Default)]
pub struct CompileFlags {
    is_lazy: bool,
    is_eval: bool,
    is_global: bool,
    is_debug: bool,
    strict_mode: StrictMode,
    is_native: bool,
    supports_deoptimization: bool,
    is_compiling_for_debugging: bool,
    is_deferred_calling: bool,
    is_non_deferred_calling: bool,
    saves_caller_doubles: bool,
    parse_restriction: ParseRestriction,
    requires_frame: bool,
    must_not_have_eager_frame: bool,
}

// ==================== Dependency resolution state ====================

/// Exactly-once resolution of a unit's accumulated dependencies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DependencyState {
    Pending,
    Committed,
    RolledBack,
}

/// Foreground-held handle used to cancel an in-flight concurrent job.
///
/// The unit itself moves to the worker thread with its job; this handle stays
/// behind so the foreground can flag the attempt for abortion. The flag is
/// only acted on when the worker result is finalized on the foreground
/// thread — workers are never preempted.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    flag: Arc<AtomicBool>,
}

impl AbortHandle {
    /// Request that the attempt be aborted because a dependency it relies on
    /// changed while compilation was in flight.
    pub fn request_abort(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_abort_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

static NEXT_OPTIMIZATION_ID: AtomicU32 = AtomicU32::new(1);

// ==================== CompilationUnit ====================

/// Shared, mutable context for one compilation attempt
pub struct CompilationUnit {
    target: CompileTarget,
    mode: CompilationMode,
    flags: CompileFlags,
    osr_target: Option<OsrSiteId>,

    // Fields filled in by the compilation pipeline.
    function: Option<FunctionLiteral>,
    scope: Option<LexicalScope>,
    global_scope: Option<LexicalScope>,
    code: Option<CodeRef>,
    /// The baseline code an OSR attempt patched against. Tracked separately
    /// because the shared baseline may be replaced while the attempt runs.
    unoptimized_code: Option<CodeRef>,
    /// Parameter count for stub compilations that take arguments
    parameter_count: Option<usize>,

    cached_data: Option<Vec<u8>>,
    cached_data_mode: CachedDataMode,

    dependencies: HashMap<DependencyGroup, Vec<DependencyEntry>>,
    dep_state: DependencyState,
    registry: DependencyRegistry,

    bailout_reason: BailoutReason,
    feedback: Option<Arc<FeedbackVector>>,
    optimization_id: Option<u32>,
    abort_handle: AbortHandle,

    arena: Arena,
}

impl CompilationUnit {
    fn new(target: CompileTarget, mode: CompilationMode, lazy: bool, registry: DependencyRegistry) -> Self {
        let feedback = match &target {
            CompileTarget::Closure(closure) => Some(closure.shared().feedback_vector()),
            CompileTarget::SharedFunction(shared) => Some(shared.feedback_vector()),
            _ => None,
        };
        Self {
            target,
            mode,
            flags: CompileFlags {
                is_lazy: lazy,
                ..CompileFlags::default()
            },
            osr_target: None,
            function: None,
            scope: None,
            global_scope: None,
            code: None,
            unoptimized_code: None,
            parameter_count: None,
            cached_data: None,
            cached_data_mode: CachedDataMode::None,
            dependencies: HashMap::default(),
            dep_state: DependencyState::Pending,
            registry,
            bailout_reason: BailoutReason::None,
            feedback,
            optimization_id: None,
            abort_handle: AbortHandle::default(),
            arena: Arena::new(),
        }
    }

    /// Unit for optimizing (or re-)compiling a live closure
    pub fn for_closure(closure: Closure, registry: DependencyRegistry) -> Self {
        Self::new(CompileTarget::Closure(closure), CompilationMode::Base, true, registry)
    }

    /// Unit for lazily compiling a function from its shared descriptor
    pub fn for_shared(shared: SharedFunction, registry: DependencyRegistry) -> Self {
        Self::new(
            CompileTarget::SharedFunction(shared),
            CompilationMode::Base,
            true,
            registry,
        )
    }

    /// Unit for eagerly compiling a top-level script
    pub fn for_script(script: Script, registry: DependencyRegistry) -> Self {
        Self::new(CompileTarget::Script(script), CompilationMode::Base, false, registry)
    }

    /// Unit for compiling a stub routine
    pub fn for_stub(stub: StubDescriptor, registry: DependencyRegistry) -> Self {
        Self::new(CompileTarget::Stub(stub), CompilationMode::Stub, false, registry)
    }

    // ==================== Identity accessors ====================

    pub fn target(&self) -> &CompileTarget {
        &self.target
    }

    pub fn closure(&self) -> Option<&Closure> {
        match &self.target {
            CompileTarget::Closure(closure) => Some(closure),
            _ => None,
        }
    }

    /// The persistent function descriptor, reachable through either a
    /// closure or a shared-function target.
    pub fn shared(&self) -> Option<&SharedFunction> {
        match &self.target {
            CompileTarget::Closure(closure) => Some(closure.shared()),
            CompileTarget::SharedFunction(shared) => Some(shared),
            _ => None,
        }
    }

    pub fn script(&self) -> Option<&Script> {
        match &self.target {
            CompileTarget::Script(script) => Some(script),
            _ => None,
        }
    }

    pub fn stub(&self) -> Option<&StubDescriptor> {
        match &self.target {
            CompileTarget::Stub(stub) => Some(stub),
            _ => None,
        }
    }

    /// Source text of the target, used by the frontend and backend
    pub fn source(&self) -> &str {
        match &self.target {
            CompileTarget::Closure(closure) => closure.shared().source(),
            CompileTarget::SharedFunction(shared) => shared.source(),
            CompileTarget::Script(script) => &script.source,
            CompileTarget::Stub(_) => "",
        }
    }

    /// Human-readable name of the target, for trace output
    pub fn debug_name(&self) -> &str {
        match &self.target {
            CompileTarget::Closure(closure) => closure.shared().name(),
            CompileTarget::SharedFunction(shared) => shared.name(),
            CompileTarget::Script(script) => &script.name,
            CompileTarget::Stub(stub) => stub.name(),
        }
    }

    // ==================== Mode ====================

    pub fn mode(&self) -> CompilationMode {
        self.mode
    }

    pub fn is_optimizing(&self) -> bool {
        self.mode == CompilationMode::Optimize
    }

    /// A unit is optimizable while still in baseline mode
    pub fn is_optimizable(&self) -> bool {
        self.mode == CompilationMode::Base
    }

    pub fn is_stub(&self) -> bool {
        self.mode == CompilationMode::Stub
    }

    /// Enter optimizing mode. Happens at most once per attempt; requires a
    /// known shared function and baseline mode.
    pub fn set_optimizing(&mut self, osr_target: Option<OsrSiteId>, unoptimized: CodeRef) {
        assert!(
            self.shared().is_some(),
            "SetOptimizing requires a shared function descriptor"
        );
        assert_eq!(
            self.mode,
            CompilationMode::Base,
            "SetOptimizing on a unit not in Base mode"
        );
        self.mode = CompilationMode::Optimize;
        self.osr_target = osr_target;
        self.unoptimized_code = Some(unoptimized);
        self.optimization_id = Some(NEXT_OPTIMIZATION_ID.fetch_add(1, Ordering::SeqCst));
        tracing::debug!(
            function = %self.debug_name(),
            optimization_id = self.optimization_id.unwrap(),
            osr = self.is_osr(),
            "entering optimizing mode"
        );
    }

    /// Sink this unit into NonOpt and record why. Irreversible; the function
    /// falls back to baseline code and is never recompiled from this unit.
    pub fn disable_optimization(&mut self, reason: BailoutReason) {
        self.set_bailout_reason(reason);
        self.mode = CompilationMode::NonOpt;
    }

    pub fn optimization_id(&self) -> Option<u32> {
        self.optimization_id
    }

    // ==================== OSR ====================

    pub fn is_osr(&self) -> bool {
        self.osr_target.is_some()
    }

    pub fn osr_target(&self) -> Option<OsrSiteId> {
        self.osr_target
    }

    /// True iff this unit is the same OSR attempt: same back-edge site on the
    /// same underlying function.
    pub fn has_same_osr_entry(&self, shared: &SharedFunction, osr: OsrSiteId) -> bool {
        self.osr_target == Some(osr)
            && self.shared().is_some_and(|s| s.is_identical_to(shared))
    }

    // ==================== Flags ====================

    pub fn is_lazy(&self) -> bool {
        self.flags.is_lazy
    }

    pub fn is_eval(&self) -> bool {
        self.flags.is_eval
    }

    pub fn is_global(&self) -> bool {
        self.flags.is_global
    }

    pub fn is_debug(&self) -> bool {
        self.flags.is_debug
    }

    pub fn strict_mode(&self) -> StrictMode {
        self.flags.strict_mode
    }

    pub fn is_native(&self) -> bool {
        self.flags.is_native
    }

    pub fn supports_deoptimization(&self) -> bool {
        self.flags.supports_deoptimization
    }

    pub fn is_compiling_for_debugging(&self) -> bool {
        self.flags.is_compiling_for_debugging
    }

    pub fn is_deferred_calling(&self) -> bool {
        self.flags.is_deferred_calling
    }

    pub fn is_non_deferred_calling(&self) -> bool {
        self.flags.is_non_deferred_calling
    }

    /// The compiled code contains calls that require building a frame
    pub fn is_calling(&self) -> bool {
        self.flags.is_deferred_calling || self.flags.is_non_deferred_calling
    }

    pub fn saves_caller_doubles(&self) -> bool {
        self.flags.saves_caller_doubles
    }

    pub fn parse_restriction(&self) -> ParseRestriction {
        self.flags.parse_restriction
    }

    pub fn requires_frame(&self) -> bool {
        self.flags.requires_frame
    }

    pub fn must_not_have_eager_frame(&self) -> bool {
        self.flags.must_not_have_eager_frame
    }

    /// Eval compilation is only legal for eager units
    pub fn mark_as_eval(&mut self) {
        assert!(!self.is_lazy(), "MarkAsEval on a lazy unit");
        self.flags.is_eval = true;
    }

    /// Global-scope compilation is only legal for eager units
    pub fn mark_as_global(&mut self) {
        assert!(!self.is_lazy(), "MarkAsGlobal on a lazy unit");
        self.flags.is_global = true;
    }

    pub fn mark_as_debug(&mut self) {
        self.flags.is_debug = true;
    }

    /// Strict mode is sticky: once strict, it may only be re-set to the same
    /// value.
    pub fn set_strict_mode(&mut self, strict_mode: StrictMode) {
        assert!(
            self.flags.strict_mode == StrictMode::Sloppy || self.flags.strict_mode == strict_mode,
            "strict mode cannot be relaxed"
        );
        self.flags.strict_mode = strict_mode;
    }

    pub fn mark_as_native(&mut self) {
        self.flags.is_native = true;
    }

    /// Baseline code may be prepared for deoptimization so optimized code can
    /// bail into it. Only meaningful while the unit is still optimizable.
    pub fn enable_deoptimization_support(&mut self) {
        assert!(
            self.is_optimizable(),
            "deoptimization support must be enabled before optimizing"
        );
        self.flags.supports_deoptimization = true;
    }

    pub fn mark_compiling_for_debugging(&mut self) {
        self.flags.is_compiling_for_debugging = true;
    }

    // Frame-policy hints for stack walking. Opaque to the pipeline.

    pub fn mark_as_deferred_calling(&mut self) {
        self.flags.is_deferred_calling = true;
    }

    pub fn mark_as_non_deferred_calling(&mut self) {
        self.flags.is_non_deferred_calling = true;
    }

    pub fn mark_as_saves_caller_doubles(&mut self) {
        self.flags.saves_caller_doubles = true;
    }

    pub fn set_parse_restriction(&mut self, restriction: ParseRestriction) {
        self.flags.parse_restriction = restriction;
    }

    pub fn mark_requires_frame(&mut self) {
        self.flags.requires_frame = true;
    }

    pub fn mark_must_not_have_eager_frame(&mut self) {
        self.flags.must_not_have_eager_frame = true;
    }

    // ==================== Parser products (set-once) ====================

    pub fn function(&self) -> Option<&FunctionLiteral> {
        self.function.as_ref()
    }

    /// Install the parsed AST root. Fatal if called twice.
    pub fn set_function(&mut self, literal: FunctionLiteral) {
        assert!(self.function.is_none(), "SetFunction called twice");
        self.function = Some(literal);
    }

    pub fn scope(&self) -> Option<&LexicalScope> {
        self.scope.as_ref()
    }

    /// Install the analyzed function scope. Fatal if called twice.
    pub fn prepare_for_compilation(&mut self, scope: LexicalScope) {
        assert!(self.scope.is_none(), "PrepareForCompilation called twice");
        self.scope = Some(scope);
    }

    pub fn global_scope(&self) -> Option<&LexicalScope> {
        self.global_scope.as_ref()
    }

    /// Install the global scope. Fatal if called twice.
    pub fn set_global_scope(&mut self, scope: LexicalScope) {
        assert!(self.global_scope.is_none(), "SetGlobalScope called twice");
        self.global_scope = Some(scope);
    }

    pub fn num_parameters(&self) -> usize {
        match (&self.function, self.parameter_count) {
            (Some(literal), _) => literal.parameter_count,
            (None, Some(count)) => count,
            (None, None) => 0,
        }
    }

    pub fn num_heap_slots(&self) -> usize {
        self.scope.as_ref().map_or(0, |s| s.num_heap_slots)
    }

    /// Parameter count for argument-taking stubs
    pub fn set_parameter_count(&mut self, count: usize) {
        assert!(self.is_stub(), "parameter count is only set on stub units");
        self.parameter_count = Some(count);
    }

    // ==================== Code artifacts ====================

    pub fn code(&self) -> Option<&CodeRef> {
        self.code.as_ref()
    }

    pub fn set_code(&mut self, code: CodeRef) {
        self.code = Some(code);
    }

    pub fn unoptimized_code(&self) -> Option<&CodeRef> {
        self.unoptimized_code.as_ref()
    }

    // ==================== Cached data ====================

    pub fn cached_data(&self) -> Option<&[u8]> {
        self.cached_data.as_deref()
    }

    pub fn cached_data_mode(&self) -> CachedDataMode {
        self.cached_data_mode
    }

    /// Attach a serialized-code cache blob. Cache consumption and production
    /// only apply to eager compilation.
    pub fn set_cached_data(&mut self, blob: Option<Vec<u8>>, mode: CachedDataMode) {
        self.cached_data_mode = mode;
        if mode == CachedDataMode::None {
            self.cached_data = None;
        } else {
            assert!(!self.is_lazy(), "cached data on a lazy unit");
            self.cached_data = blob;
        }
    }

    // ==================== Feedback ====================

    pub fn feedback_vector(&self) -> Option<&Arc<FeedbackVector>> {
        self.feedback.as_ref()
    }

    // ==================== Bailout bookkeeping ====================

    pub fn bailout_reason(&self) -> BailoutReason {
        self.bailout_reason
    }

    /// Record why the attempt declined. The first meaningful reason wins;
    /// `BailoutReason::None` never overwrites anything.
    pub fn set_bailout_reason(&mut self, reason: BailoutReason) {
        if reason != BailoutReason::None && self.bailout_reason == BailoutReason::None {
            self.bailout_reason = reason;
        }
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort_handle.clone()
    }

    pub fn is_abort_requested(&self) -> bool {
        self.abort_handle.is_abort_requested()
    }

    // ==================== Dependencies ====================

    /// The accumulating dependency list for `group`, created on first access.
    pub fn dependencies(&mut self, group: DependencyGroup) -> &mut Vec<DependencyEntry> {
        assert_eq!(
            self.dep_state,
            DependencyState::Pending,
            "dependencies recorded after commit or rollback"
        );
        self.dependencies.entry(group).or_default()
    }

    /// Number of accumulated, not-yet-committed entries in `group`
    pub fn dependency_count(&self, group: DependencyGroup) -> usize {
        self.dependencies.get(&group).map_or(0, |v| v.len())
    }

    /// Register every accumulated dependency, across all groups, against
    /// `code` in the registry, then clear the lists. A no-op when nothing was
    /// accumulated. Mutually exclusive with
    /// [`rollback_dependencies`](Self::rollback_dependencies); exactly one of
    /// the two resolves a unit before it is destroyed.
    pub fn commit_dependencies(&mut self, code: &CodeRef) {
        assert_ne!(
            self.dep_state,
            DependencyState::RolledBack,
            "CommitDependencies after rollback"
        );
        if self.dependencies.values().all(|v| v.is_empty()) {
            self.dep_state = DependencyState::Committed;
            return;
        }
        assert_eq!(
            self.dep_state,
            DependencyState::Pending,
            "CommitDependencies called twice"
        );
        let entries: Vec<DependencyEntry> = self.dependencies.values().flatten().copied().collect();
        self.registry.commit(code, &entries);
        self.dependencies.clear();
        self.dep_state = DependencyState::Committed;
    }

    /// Discard all accumulated dependency lists without registering them.
    /// Runs automatically at teardown if the unit is still unresolved.
    pub fn rollback_dependencies(&mut self) {
        assert_ne!(
            self.dep_state,
            DependencyState::Committed,
            "RollbackDependencies after commit"
        );
        self.dependencies.clear();
        self.dep_state = DependencyState::RolledBack;
    }

    pub fn dependencies_committed(&self) -> bool {
        self.dep_state == DependencyState::Committed
    }

    pub fn dependencies_rolled_back(&self) -> bool {
        self.dep_state == DependencyState::RolledBack
    }

    // ==================== Resources ====================

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    pub fn registry(&self) -> &DependencyRegistry {
        &self.registry
    }
}

impl Drop for CompilationUnit {
    fn drop(&mut self) {
        // A unit that never reached committed success discards its private
        // lists before the arena is released.
        if self.dep_state == DependencyState::Pending {
            self.rollback_dependencies();
        }
    }
}

impl std::fmt::Debug for CompilationUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompilationUnit")
            .field("target", &self.debug_name())
            .field("mode", &self.mode)
            .field("osr", &self.osr_target)
            .field("optimization_id", &self.optimization_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::{Code, CodeFlags, CodeKind, ShapeId};

    fn script_unit() -> CompilationUnit {
        CompilationUnit::for_script(Script::new("test.js", "1 + 2"), DependencyRegistry::new())
    }

    fn closure_unit() -> (CompilationUnit, SharedFunction, DependencyRegistry) {
        let shared = SharedFunction::new("f", "function f() { return 1; }");
        let registry = DependencyRegistry::new();
        let closure = Closure::new(shared.clone(), 1);
        (CompilationUnit::for_closure(closure, registry.clone()), shared, registry)
    }

    fn baseline() -> CodeRef {
        Code::new(CodeKind::Baseline, CodeFlags::empty(), 100)
    }

    #[test]
    fn test_modes_by_constructor() {
        let (unit, _, _) = closure_unit();
        assert_eq!(unit.mode(), CompilationMode::Base);
        assert!(unit.is_optimizable());

        let stub = CompilationUnit::for_stub(
            StubDescriptor::new(crate::objects::StubKind::LoadIc),
            DependencyRegistry::new(),
        );
        assert!(stub.is_stub());
    }

    #[test]
    fn test_set_optimizing_assigns_monotone_ids() {
        let (mut a, _, _) = closure_unit();
        let (mut b, _, _) = closure_unit();
        a.set_optimizing(None, baseline());
        b.set_optimizing(None, baseline());
        assert!(a.optimization_id().unwrap() < b.optimization_id().unwrap());
        assert!(a.is_optimizing());
    }

    #[test]
    #[should_panic(expected = "SetOptimizing on a unit not in Base mode")]
    fn test_set_optimizing_twice_is_fatal() {
        let (mut unit, _, _) = closure_unit();
        unit.set_optimizing(None, baseline());
        unit.set_optimizing(None, baseline());
    }

    #[test]
    #[should_panic(expected = "requires a shared function descriptor")]
    fn test_set_optimizing_on_script_is_fatal() {
        let mut unit = script_unit();
        unit.set_optimizing(None, baseline());
    }

    #[test]
    fn test_disable_optimization_is_absorbing() {
        let (mut unit, _, _) = closure_unit();
        unit.disable_optimization(BailoutReason::WithStatement);
        assert_eq!(unit.mode(), CompilationMode::NonOpt);
        assert_eq!(unit.bailout_reason(), BailoutReason::WithStatement);
        unit.disable_optimization(BailoutReason::DirectEval);
        assert_eq!(unit.mode(), CompilationMode::NonOpt);
        // first meaningful reason wins
        assert_eq!(unit.bailout_reason(), BailoutReason::WithStatement);
    }

    #[test]
    fn test_flags_are_independent() {
        let mut unit = script_unit();
        unit.mark_as_eval();
        assert!(unit.is_eval());
        assert!(!unit.is_global());
        assert!(!unit.is_debug());
        assert_eq!(unit.strict_mode(), StrictMode::Sloppy);

        unit.mark_as_global();
        unit.set_strict_mode(StrictMode::Strict);
        assert!(unit.is_eval() && unit.is_global());
        assert_eq!(unit.strict_mode(), StrictMode::Strict);
    }

    #[test]
    #[should_panic(expected = "MarkAsEval on a lazy unit")]
    fn test_eval_on_lazy_unit_is_fatal() {
        let (mut unit, _, _) = closure_unit();
        assert!(unit.is_lazy());
        unit.mark_as_eval();
    }

    #[test]
    fn test_strict_mode_may_be_reset_to_same_value() {
        let mut unit = script_unit();
        unit.set_strict_mode(StrictMode::Strict);
        unit.set_strict_mode(StrictMode::Strict);
        assert_eq!(unit.strict_mode(), StrictMode::Strict);
    }

    #[test]
    #[should_panic(expected = "strict mode cannot be relaxed")]
    fn test_strict_mode_relaxation_is_fatal() {
        let mut unit = script_unit();
        unit.set_strict_mode(StrictMode::Strict);
        unit.set_strict_mode(StrictMode::Sloppy);
    }

    #[test]
    fn test_calling_flags_are_opaque_hints() {
        let mut unit = script_unit();
        assert!(!unit.is_calling());
        unit.mark_as_deferred_calling();
        assert!(unit.is_calling());
        assert!(!unit.is_non_deferred_calling());
        unit.mark_as_non_deferred_calling();
        assert!(unit.is_deferred_calling() && unit.is_non_deferred_calling());
    }

    #[test]
    #[should_panic(expected = "SetFunction called twice")]
    fn test_set_function_twice_is_fatal() {
        let mut unit = script_unit();
        let literal = FunctionLiteral {
            name: "f".into(),
            parameter_count: 0,
            body_size: 5,
        };
        unit.set_function(literal.clone());
        unit.set_function(literal);
    }

    #[test]
    #[should_panic(expected = "SetGlobalScope called twice")]
    fn test_set_global_scope_twice_is_fatal() {
        let mut unit = script_unit();
        let scope = LexicalScope {
            num_heap_slots: 0,
            is_global: true,
        };
        unit.set_global_scope(scope.clone());
        unit.set_global_scope(scope);
    }

    #[test]
    #[should_panic(expected = "parameter count is only set on stub units")]
    fn test_parameter_count_requires_stub_mode() {
        let mut unit = script_unit();
        unit.set_parameter_count(2);
    }

    #[test]
    #[should_panic(expected = "cached data on a lazy unit")]
    fn test_cached_data_requires_eager_unit() {
        let (mut unit, _, _) = closure_unit();
        unit.set_cached_data(Some(vec![1, 2, 3]), CachedDataMode::Consume);
    }

    #[test]
    fn test_dependency_lists_lazily_created() {
        let (mut unit, _, _) = closure_unit();
        assert_eq!(unit.dependency_count(DependencyGroup::Prototype), 0);
        unit.dependencies(DependencyGroup::Prototype)
            .push(DependencyEntry::new(ShapeId(1), DependencyGroup::Prototype));
        unit.dependencies(DependencyGroup::Prototype)
            .push(DependencyEntry::new(ShapeId(2), DependencyGroup::Prototype));
        assert_eq!(unit.dependency_count(DependencyGroup::Prototype), 2);
    }

    #[test]
    fn test_commit_registers_and_clears() {
        let (mut unit, _, registry) = closure_unit();
        unit.dependencies(DependencyGroup::Transition)
            .push(DependencyEntry::new(ShapeId(9), DependencyGroup::Transition));
        let code = Code::new(CodeKind::Optimized, CodeFlags::empty(), 50);
        unit.commit_dependencies(&code);
        assert!(unit.dependencies_committed());
        assert_eq!(registry.dependent_count(ShapeId(9), DependencyGroup::Transition), 1);
        assert_eq!(unit.dependency_count(DependencyGroup::Transition), 0);
        // committing again with empty lists is a no-op
        unit.commit_dependencies(&code);
    }

    #[test]
    fn test_rollback_discards_without_registering() {
        let (mut unit, _, registry) = closure_unit();
        unit.dependencies(DependencyGroup::FieldType)
            .push(DependencyEntry::new(ShapeId(4), DependencyGroup::FieldType));
        unit.rollback_dependencies();
        assert!(unit.dependencies_rolled_back());
        assert_eq!(registry.total_registrations(), 0);
    }

    #[test]
    #[should_panic(expected = "RollbackDependencies after commit")]
    fn test_rollback_after_commit_is_fatal() {
        let (mut unit, _, _) = closure_unit();
        let code = Code::new(CodeKind::Optimized, CodeFlags::empty(), 50);
        unit.dependencies(DependencyGroup::Prototype)
            .push(DependencyEntry::new(ShapeId(1), DependencyGroup::Prototype));
        unit.commit_dependencies(&code);
        unit.rollback_dependencies();
    }

    #[test]
    fn test_drop_rolls_back_unresolved_unit() {
        let registry = DependencyRegistry::new();
        {
            let shared = SharedFunction::new("f", "function f() {}");
            let closure = Closure::new(shared, 1);
            let mut unit = CompilationUnit::for_closure(closure, registry.clone());
            unit.dependencies(DependencyGroup::Prototype)
                .push(DependencyEntry::new(ShapeId(5), DependencyGroup::Prototype));
            // dropped unresolved
        }
        assert_eq!(registry.total_registrations(), 0);
    }

    #[test]
    fn test_has_same_osr_entry() {
        let (mut unit, shared, _) = closure_unit();
        unit.set_optimizing(Some(OsrSiteId(42)), baseline());
        assert!(unit.is_osr());
        assert!(unit.has_same_osr_entry(&shared, OsrSiteId(42)));
        assert!(!unit.has_same_osr_entry(&shared, OsrSiteId(43)));
        let other = SharedFunction::new("g", "function g() {}");
        assert!(!unit.has_same_osr_entry(&other, OsrSiteId(42)));
    }

    #[test]
    fn test_abort_handle_outlives_borrow() {
        let (unit, _, _) = closure_unit();
        let handle = unit.abort_handle();
        assert!(!unit.is_abort_requested());
        handle.request_abort();
        assert!(unit.is_abort_requested());
    }
}

//! Boundary to the optimizer and code generator
//!
//! The pipeline drives three opaque operations — build a graph from the
//! unit's AST, optimize it, lower it to installable code — and never inspects
//! the graph itself. Each operation reports a tri-state outcome: succeeded,
//! bailed out (the optimizer declined an unsupported construct; expected, not
//! a bug), or failed (an unexpected internal error). Known unsupported
//! patterns must be reported as bail-outs; a hard failure is never silently
//! downgraded to one.
//!
//! Baseline compilation also crosses this boundary because the parser and
//! full code generator live behind it; unlike the optimizing operations it
//! can fail with a user-visible syntax error.

use crate::arena::Arena;
use crate::deps::{DependencyEntry, DependencyGroup};
use crate::error::{Error, Result, SourceLocation};
use crate::objects::{
    BailoutReason, Code, CodeFlags, CodeKind, CodeRef, FunctionLiteral, LexicalScope, OsrSiteId,
    ShapeId,
};
use crate::unit::{CompilationUnit, ParseRestriction};
use std::hash::{Hash, Hasher};

// ==================== Phase outcomes ====================

/// Tri-state result of one optimizing operation
#[must_use]
#[derive(Debug)]
pub enum PhaseOutcome<T> {
    /// The operation produced its artifact
    Succeeded(T),
    /// The optimizer declined to handle a construct. The caller falls back
    /// to baseline code; this is an expected outcome, not an error.
    BailedOut(BailoutReason),
    /// Unexpected internal error. Distinguished from a bail-out in
    /// diagnostics even though the caller recovers the same way.
    Failed(String),
}

// ==================== Opaque graph ====================

/// Optimizer-internal intermediate representation, opaque to the pipeline.
///
/// The pipeline only threads it between phases and harvests the speculative
/// assumptions the optimizer baked in, so they can be committed against the
/// generated code.
#[derive(Debug)]
pub struct Graph {
    /// Number of IR nodes, used for code-size estimation and stats
    pub node_count: usize,
    /// Heap-shape assumptions accumulated so far
    pub assumptions: Vec<DependencyEntry>,
    /// Echo of the OSR entry this graph was built for, if any
    pub osr_entry: Option<OsrSiteId>,
}

// ==================== Backend trait ====================

/// The optimizer/codegen backend driven by the pipeline.
///
/// Implementations must be deterministic: every outcome may depend only on
/// the unit's inputs (source, flags, OSR target), never on thread identity,
/// timing, or scheduling. The pipeline relies on this to guarantee that a
/// concurrent job finalized later produces the same code a synchronous run
/// would have.
pub trait Backend: Send + Sync {
    /// Parse the unit's source and produce baseline code. Installs the AST
    /// root and scope on the unit. Fails with a user-visible
    /// [`Error::CompileError`] on invalid source.
    fn compile_baseline(&self, unit: &mut CompilationUnit) -> Result<CodeRef>;

    /// Build the optimizer's IR from the unit's AST and scope
    fn build_graph(&self, unit: &CompilationUnit, scratch: &Arena) -> PhaseOutcome<Graph>;

    /// Run optimization passes over the IR
    fn optimize_graph(&self, unit: &CompilationUnit, graph: Graph, scratch: &Arena)
        -> PhaseOutcome<Graph>;

    /// Lower the optimized IR to an installable code object
    fn generate_code(&self, unit: &CompilationUnit, graph: &Graph) -> PhaseOutcome<CodeRef>;
}

// ==================== Reference backend ====================

/// Source marker that forces an internal codegen failure, for exercising the
/// hard-failure path the way runtime test natives do.
const CRASH_MARKER: &str = "%CrashOptimizer()";

/// Functions above this source size are not worth optimizing
const MAX_OPTIMIZABLE_SIZE: usize = 60_000;

/// Deterministic in-tree backend.
///
/// Performs just enough parsing to reject malformed source, bails out on the
/// constructs the optimizing tier never supports (`with`, direct `eval`,
/// `debugger`, `try`/`catch`, oversized functions), and derives speculative
/// shape assumptions from the source text so repeated runs of the same unit
/// produce identical results regardless of scheduling.
#[derive(Debug, Default)]
pub struct ReferenceBackend;

impl ReferenceBackend {
    pub fn new() -> Self {
        Self
    }

    fn source_shape(source: &str) -> ShapeId {
        let mut hasher = rustc_hash::FxHasher::default();
        source.hash(&mut hasher);
        ShapeId(hasher.finish())
    }

    /// Minimal well-formedness scan: balanced `()`, `{}`, `[]` outside
    /// string literals, with line/column tracking for diagnostics.
    fn check_source(source: &str, restriction: ParseRestriction) -> Result<()> {
        let mut stack: Vec<(char, SourceLocation)> = Vec::new();
        let mut line = 1u32;
        let mut column = 0u32;
        let mut in_string: Option<char> = None;
        let mut statements = 0usize;

        for (offset, ch) in source.char_indices() {
            column += 1;
            let loc = SourceLocation::new(line, column, offset);
            if ch == '\n' {
                line += 1;
                column = 0;
                continue;
            }
            if let Some(quote) = in_string {
                if ch == quote {
                    in_string = None;
                }
                continue;
            }
            match ch {
                '\'' | '"' | '`' => in_string = Some(ch),
                '(' | '{' | '[' => stack.push((ch, loc)),
                ')' | ']' | '}' => {
                    let expected = match ch {
                        ')' => '(',
                        ']' => '[',
                        _ => '{',
                    };
                    match stack.pop() {
                        Some((open, _)) if open == expected => {}
                        _ => {
                            return Err(Error::compile_error(
                                format!("unexpected token '{}'", ch),
                                loc,
                            ));
                        }
                    }
                }
                ';' if stack.is_empty() => statements += 1,
                _ => {}
            }
        }

        if let Some((open, loc)) = stack.pop() {
            return Err(Error::compile_error(format!("unmatched '{}'", open), loc));
        }
        if restriction == ParseRestriction::SingleExpressionOnly && statements > 1 {
            return Err(Error::compile_error(
                "only a single expression is allowed",
                SourceLocation::new(1, 1, 0),
            ));
        }
        Ok(())
    }

    fn count_parameters(source: &str) -> usize {
        // Arity of the first parameter list, if any
        let Some(open) = source.find('(') else { return 0 };
        let Some(close) = source[open..].find(')') else { return 0 };
        let params = &source[open + 1..open + close];
        if params.trim().is_empty() {
            0
        } else {
            params.split(',').count()
        }
    }

    fn code_flags(unit: &CompilationUnit) -> CodeFlags {
        let mut flags = CodeFlags::empty();
        if unit.is_osr() {
            flags |= CodeFlags::OSR_ENTRY;
        }
        if unit.is_debug() || unit.is_compiling_for_debugging() {
            flags |= CodeFlags::DEBUG;
        }
        if unit.saves_caller_doubles() {
            flags |= CodeFlags::SAVES_CALLER_DOUBLES;
        }
        flags
    }
}

impl Backend for ReferenceBackend {
    fn compile_baseline(&self, unit: &mut CompilationUnit) -> Result<CodeRef> {
        if unit.is_stub() {
            // stubs have no source; descriptor and arity determine the code
            let flags = Self::code_flags(unit);
            return Ok(Code::new(CodeKind::Stub, flags, 16 + unit.num_parameters() * 8));
        }
        let source = unit.source().to_string();
        Self::check_source(&source, unit.parse_restriction())?;

        unit.set_function(FunctionLiteral {
            name: unit.debug_name().to_string(),
            parameter_count: Self::count_parameters(&source),
            body_size: source.len(),
        });
        unit.prepare_for_compilation(LexicalScope {
            num_heap_slots: source.matches("var ").count() + source.matches("let ").count(),
            is_global: unit.is_global(),
        });

        let flags = Self::code_flags(unit);
        Ok(Code::new(CodeKind::Baseline, flags, source.len() * 3))
    }

    fn build_graph(&self, unit: &CompilationUnit, scratch: &Arena) -> PhaseOutcome<Graph> {
        let source = unit.source();
        if source.len() > MAX_OPTIMIZABLE_SIZE {
            return PhaseOutcome::BailedOut(BailoutReason::FunctionTooBig);
        }
        if source.contains("with (") || source.contains("with(") {
            return PhaseOutcome::BailedOut(BailoutReason::WithStatement);
        }
        if source.contains("eval(") {
            return PhaseOutcome::BailedOut(BailoutReason::DirectEval);
        }
        if source.contains("debugger") {
            return PhaseOutcome::BailedOut(BailoutReason::DebuggerStatement);
        }

        // Graph construction scratch is charged to the phase arena
        scratch.alloc_bytes(source.len());

        let shape = Self::source_shape(source);
        let mut assumptions = Vec::new();
        if source.contains('.') {
            assumptions.push(DependencyEntry::new(shape, DependencyGroup::Transition));
        }
        if source.contains("new ") {
            assumptions.push(DependencyEntry::new(shape, DependencyGroup::InitialMap));
            assumptions.push(DependencyEntry::new(shape, DependencyGroup::AllocationSite));
        }

        PhaseOutcome::Succeeded(Graph {
            node_count: source.split_whitespace().count().max(1),
            assumptions,
            osr_entry: unit.osr_target(),
        })
    }

    fn optimize_graph(
        &self,
        unit: &CompilationUnit,
        mut graph: Graph,
        scratch: &Arena,
    ) -> PhaseOutcome<Graph> {
        let source = unit.source();
        if source.contains("try {") || source.contains("try{") {
            return PhaseOutcome::BailedOut(BailoutReason::TryCatchStatement);
        }

        scratch.alloc_bytes(graph.node_count * 8);

        // Redundancy elimination shrinks the graph; global loads speculate on
        // property cells staying stable.
        graph.node_count = (graph.node_count * 3 / 4).max(1);
        if source.contains("globalThis") {
            graph.assumptions.push(DependencyEntry::new(
                Self::source_shape(source),
                DependencyGroup::PropertyCell,
            ));
        }
        PhaseOutcome::Succeeded(graph)
    }

    fn generate_code(&self, unit: &CompilationUnit, graph: &Graph) -> PhaseOutcome<CodeRef> {
        if unit.source().contains(CRASH_MARKER) {
            return PhaseOutcome::Failed("code generation fault injected".to_string());
        }
        let flags = Self::code_flags(unit);
        PhaseOutcome::Succeeded(Code::new(CodeKind::Optimized, flags, graph.node_count * 4))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deps::DependencyRegistry;
    use crate::objects::{Closure, Script, SharedFunction};

    fn unit_for(source: &str) -> CompilationUnit {
        let shared = SharedFunction::new("f", source);
        let closure = Closure::new(shared, 1);
        let mut unit = CompilationUnit::for_closure(closure, DependencyRegistry::new());
        let baseline = Code::new(CodeKind::Baseline, CodeFlags::empty(), 10);
        unit.set_optimizing(None, baseline);
        unit
    }

    #[test]
    fn test_baseline_rejects_unbalanced_source() {
        let backend = ReferenceBackend::new();
        let mut unit = CompilationUnit::for_script(
            Script::new("bad.js", "function f( { return 1; }"),
            DependencyRegistry::new(),
        );
        let err = backend.compile_baseline(&mut unit).unwrap_err();
        assert!(matches!(err, Error::CompileError { .. }));
    }

    #[test]
    fn test_baseline_sets_ast_and_scope() {
        let backend = ReferenceBackend::new();
        let mut unit = CompilationUnit::for_script(
            Script::new("ok.js", "function add(a, b) { return a + b; }"),
            DependencyRegistry::new(),
        );
        let code = backend.compile_baseline(&mut unit).unwrap();
        assert_eq!(code.kind(), CodeKind::Baseline);
        assert_eq!(unit.function().unwrap().parameter_count, 2);
        assert!(unit.scope().is_some());
    }

    #[test]
    fn test_parse_restriction_single_expression() {
        let backend = ReferenceBackend::new();
        let mut unit = CompilationUnit::for_script(
            Script::new("eval.js", "1 + 1; 2 + 2;"),
            DependencyRegistry::new(),
        );
        unit.set_parse_restriction(ParseRestriction::SingleExpressionOnly);
        assert!(backend.compile_baseline(&mut unit).is_err());
    }

    #[test]
    fn test_build_graph_bails_on_with_statement() {
        let backend = ReferenceBackend::new();
        let unit = unit_for("function f(o) { with (o) { return x; } }");
        let scratch = Arena::new();
        match backend.build_graph(&unit, &scratch) {
            PhaseOutcome::BailedOut(reason) => assert_eq!(reason, BailoutReason::WithStatement),
            other => panic!("expected bailout, got {:?}", other),
        }
    }

    #[test]
    fn test_optimize_graph_bails_on_try_catch() {
        let backend = ReferenceBackend::new();
        let unit = unit_for("function f() { try { g(); } catch (e) {} }");
        let scratch = Arena::new();
        let graph = match backend.build_graph(&unit, &scratch) {
            PhaseOutcome::Succeeded(graph) => graph,
            other => panic!("expected graph, got {:?}", other),
        };
        match backend.optimize_graph(&unit, graph, &scratch) {
            PhaseOutcome::BailedOut(reason) => assert_eq!(reason, BailoutReason::TryCatchStatement),
            other => panic!("expected bailout, got {:?}", other),
        }
    }

    #[test]
    fn test_generate_code_failure_marker() {
        let backend = ReferenceBackend::new();
        let unit = unit_for("function f() { %CrashOptimizer() }");
        let scratch = Arena::new();
        let graph = match backend.build_graph(&unit, &scratch) {
            PhaseOutcome::Succeeded(graph) => graph,
            other => panic!("expected graph, got {:?}", other),
        };
        match backend.generate_code(&unit, &graph) {
            PhaseOutcome::Failed(_) => {}
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_assumptions_are_deterministic() {
        let backend = ReferenceBackend::new();
        let source = "function f(o) { return new o.Point(); }";
        let scratch = Arena::new();
        let a = match backend.build_graph(&unit_for(source), &scratch) {
            PhaseOutcome::Succeeded(graph) => graph.assumptions,
            other => panic!("expected graph, got {:?}", other),
        };
        let b = match backend.build_graph(&unit_for(source), &scratch) {
            PhaseOutcome::Succeeded(graph) => graph.assumptions,
            other => panic!("expected graph, got {:?}", other),
        };
        assert_eq!(a, b);
        assert!(!a.is_empty());
    }
}

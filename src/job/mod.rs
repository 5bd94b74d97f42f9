//! The optimizing compilation job
//!
//! An [`OptimizationJob`] drives the three phases of optimizing compilation —
//! CreateGraph, OptimizeGraph, GenerateCode — over one compilation unit and
//! keeps track of its state. Each phase can succeed, bail out to baseline
//! code, or fail; apart from the returned status, the status of the phase
//! last run can be checked with [`last_status`](OptimizationJob::last_status).
//!
//! The phase order is a hard contract: calling a phase out of order, or
//! calling any phase after a terminal outcome, is a defect in the caller and
//! aborts immediately. The job is the unit of scheduling — it is either run
//! inline on the foreground thread or moved whole to a background worker and
//! back.

use crate::backend::{Backend, Graph, PhaseOutcome};
use crate::objects::{BailoutReason, CodeRef};
use crate::phase::CompilationPhase;
use crate::unit::CompilationUnit;
use std::sync::Arc;
use std::time::Duration;

/// Status of the phase last run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// No phase has succeeded yet, or an internal error occurred
    Failed,
    /// The optimizer declined; baseline code stays authoritative
    BailedOut,
    Succeeded,
}

/// Progression through the phase sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobPhase {
    Initial,
    GraphCreated,
    GraphOptimized,
    CodeGenerated,
}

/// A three-phase optimizing compilation over one unit
pub struct OptimizationJob {
    unit: CompilationUnit,
    backend: Arc<dyn Backend>,
    graph: Option<Graph>,
    phase: JobPhase,
    last_status: JobStatus,
    terminal: bool,
    awaiting_install: bool,
    time_taken_to_create_graph: Duration,
    time_taken_to_optimize: Duration,
    time_taken_to_codegen: Duration,
}

impl OptimizationJob {
    /// Wrap a unit that has already entered optimizing mode
    pub fn new(unit: CompilationUnit, backend: Arc<dyn Backend>) -> Self {
        assert!(unit.is_optimizing(), "job created for a non-optimizing unit");
        Self {
            unit,
            backend,
            graph: None,
            phase: JobPhase::Initial,
            last_status: JobStatus::Failed,
            terminal: false,
            awaiting_install: false,
            time_taken_to_create_graph: Duration::ZERO,
            time_taken_to_optimize: Duration::ZERO,
            time_taken_to_codegen: Duration::ZERO,
        }
    }

    pub fn unit(&self) -> &CompilationUnit {
        &self.unit
    }

    pub fn unit_mut(&mut self) -> &mut CompilationUnit {
        &mut self.unit
    }

    pub fn last_status(&self) -> JobStatus {
        self.last_status
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    fn set_last_status(&mut self, status: JobStatus) -> JobStatus {
        self.last_status = status;
        status
    }

    fn check_phase(&self, expected: JobPhase, name: &str) {
        assert!(!self.terminal, "{} called on a terminal job", name);
        assert!(self.phase == expected, "{} called out of order", name);
    }

    /// Harvest the assumptions a phase baked into the graph so far
    fn absorb_assumptions(&mut self, graph: &mut Graph) {
        for entry in graph.assumptions.drain(..) {
            self.unit.dependencies(entry.group).push(entry);
        }
    }

    /// Phase 1: build the optimizer's IR from the unit's AST and scope
    pub fn create_graph(&mut self) -> JobStatus {
        self.check_phase(JobPhase::Initial, "CreateGraph");
        let backend = Arc::clone(&self.backend);
        let (outcome, elapsed) = {
            let phase = CompilationPhase::new("CreateGraph", &self.unit);
            let outcome = backend.build_graph(&self.unit, phase.scratch());
            (outcome, phase.elapsed())
        };
        self.time_taken_to_create_graph = elapsed;
        match outcome {
            PhaseOutcome::Succeeded(mut graph) => {
                self.absorb_assumptions(&mut graph);
                self.graph = Some(graph);
                self.phase = JobPhase::GraphCreated;
                self.set_last_status(JobStatus::Succeeded)
            }
            PhaseOutcome::BailedOut(reason) => self.abort_optimization(reason),
            PhaseOutcome::Failed(message) => self.fail("CreateGraph", message),
        }
    }

    /// Phase 2: run optimization passes over the IR
    pub fn optimize_graph(&mut self) -> JobStatus {
        self.check_phase(JobPhase::GraphCreated, "OptimizeGraph");
        let graph = self.graph.take().expect("graph missing after CreateGraph");
        let backend = Arc::clone(&self.backend);
        let (outcome, elapsed) = {
            let phase = CompilationPhase::new("OptimizeGraph", &self.unit);
            let outcome = backend.optimize_graph(&self.unit, graph, phase.scratch());
            (outcome, phase.elapsed())
        };
        self.time_taken_to_optimize = elapsed;
        match outcome {
            PhaseOutcome::Succeeded(mut graph) => {
                self.absorb_assumptions(&mut graph);
                self.graph = Some(graph);
                self.phase = JobPhase::GraphOptimized;
                self.set_last_status(JobStatus::Succeeded)
            }
            PhaseOutcome::BailedOut(reason) => self.abort_optimization(reason),
            PhaseOutcome::Failed(message) => self.fail("OptimizeGraph", message),
        }
    }

    /// Phase 3: lower the optimized IR to installable code, commit the
    /// accumulated dependencies against it, and install it on the unit.
    ///
    /// OSR jobs do not install immediately: the on-stack frame being replaced
    /// must not be mid-execution of stale code, so the job parks in
    /// awaiting-install state and the owner installs at a safe point.
    pub fn generate_code(&mut self) -> JobStatus {
        self.check_phase(JobPhase::GraphOptimized, "GenerateCode");
        let graph = self.graph.as_ref().expect("graph missing after OptimizeGraph");
        let backend = Arc::clone(&self.backend);
        let (outcome, elapsed) = {
            let phase = CompilationPhase::new("GenerateCode", &self.unit);
            let outcome = backend.generate_code(&self.unit, graph);
            (outcome, phase.elapsed())
        };
        self.time_taken_to_codegen = elapsed;
        match outcome {
            PhaseOutcome::Succeeded(code) => {
                self.unit.commit_dependencies(&code);
                self.unit.set_code(Arc::clone(&code));
                if self.unit.is_osr() {
                    self.awaiting_install = true;
                }
                self.phase = JobPhase::CodeGenerated;
                self.terminal = true;
                self.record_optimization_stats(&code);
                self.set_last_status(JobStatus::Succeeded)
            }
            PhaseOutcome::BailedOut(reason) => self.abort_optimization(reason),
            PhaseOutcome::Failed(message) => self.fail("GenerateCode", message),
        }
    }

    /// Abort this attempt. Records the reason, rolls the unit's accumulated
    /// dependencies back, and leaves the job terminal with BailedOut status.
    /// Future optimization attempts for the same function stay permitted.
    pub fn abort_optimization(&mut self, reason: BailoutReason) -> JobStatus {
        assert!(
            !self.unit.dependencies_committed(),
            "AbortOptimization after dependencies were committed"
        );
        self.unit.set_bailout_reason(reason);
        self.unit.rollback_dependencies();
        self.terminal = true;
        tracing::debug!(
            function = %self.unit.debug_name(),
            reason = %self.unit.bailout_reason(),
            "optimization aborted"
        );
        self.set_last_status(JobStatus::BailedOut)
    }

    /// Abort this attempt and permanently flag the underlying function as
    /// non-optimizable. Used when the failure is a property of the function
    /// itself, not a transient condition.
    pub fn abort_and_disable_optimization(&mut self, reason: BailoutReason) -> JobStatus {
        self.unit.set_bailout_reason(reason);
        if let Some(shared) = self.unit.shared() {
            shared.disable_optimization(self.unit.bailout_reason());
        }
        self.abort_optimization(reason)
    }

    /// Unexpected internal error: terminal, rolled back, never downgraded to
    /// a bail-out.
    fn fail(&mut self, phase: &str, message: String) -> JobStatus {
        self.unit.rollback_dependencies();
        self.terminal = true;
        tracing::warn!(
            function = %self.unit.debug_name(),
            phase,
            message = %message,
            "optimization failed"
        );
        self.set_last_status(JobStatus::Failed)
    }

    /// True iff code generation succeeded for an OSR job and the code has not
    /// been installed into the running frame yet
    pub fn is_waiting_for_install(&self) -> bool {
        self.awaiting_install
    }

    /// The owner installed the OSR code at a safe point
    pub fn mark_installed(&mut self) {
        assert!(self.awaiting_install, "mark_installed on a job not awaiting install");
        self.awaiting_install = false;
    }

    fn record_optimization_stats(&self, code: &CodeRef) {
        tracing::debug!(
            function = %self.unit.debug_name(),
            optimization_id = ?self.unit.optimization_id(),
            code_size = code.size(),
            create_graph_us = self.time_taken_to_create_graph.as_micros() as u64,
            optimize_us = self.time_taken_to_optimize.as_micros() as u64,
            codegen_us = self.time_taken_to_codegen.as_micros() as u64,
            "optimized compilation finished"
        );
    }
}

impl std::fmt::Debug for OptimizationJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimizationJob")
            .field("unit", &self.unit)
            .field("phase", &self.phase)
            .field("last_status", &self.last_status)
            .field("awaiting_install", &self.awaiting_install)
            .finish()
    }
}

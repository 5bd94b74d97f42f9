//! The compilation pipeline facade
//!
//! Entry point for embedders: resolves baseline code, decides whether an
//! optimization request runs inline or on the background worker pool, and
//! finalizes completed background jobs back onto the requesting function.
//! All facade methods run on the foreground thread; the only thing that
//! leaves it is a whole [`OptimizationJob`] handed to the pool for its front
//! phases.

mod worker;

pub use worker::OptimizationWorkerPool;

use crate::backend::{Backend, ReferenceBackend};
use crate::deps::DependencyRegistry;
use crate::error::{Error, Result};
use crate::job::{JobStatus, OptimizationJob};
use crate::objects::{
    BailoutReason, Closure, Code, CodeFlags, CodeKind, CodeRef, OsrSiteId, Script, SharedFunction,
    StubDescriptor,
};
use crate::unit::{CachedDataMode, CompilationUnit};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

// ==================== Configuration ====================

/// Optimization attempts per function before it is shut off for good
const MAX_OPT_COUNT: u32 = 10;

const DEFAULT_WORKER_COUNT: usize = 2;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Background optimization threads
    pub worker_count: usize,
    /// Cap on optimization attempts per function
    pub max_opt_count: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            max_opt_count: MAX_OPT_COUNT,
        }
    }
}

// ==================== Results and stats ====================

/// How an optimization request should be scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyMode {
    /// All three phases inline on the calling thread
    Synchronous,
    /// Front phases on a worker; caller finalizes later
    Concurrent,
}

/// Outcome of an optimization request
#[derive(Debug, Clone)]
pub enum OptimizedResult {
    /// Optimized code generated and installed (reachable from the closure)
    Installed(CodeRef),
    /// Handed to the worker pool; poll and finalize later
    Queued,
    /// No optimized code: bailed out, failed, or refused
    Failed,
}

/// Compilation event counters
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    pub baseline_compilations: usize,
    pub cache_hits: usize,
    pub cache_stores: usize,
    pub optimizations_requested: usize,
    pub optimizations_installed: usize,
    pub optimizations_bailed_out: usize,
    pub optimizations_failed: usize,
    pub jobs_queued: usize,
    pub jobs_aborted: usize,
    pub osr_requests_deduplicated: usize,
}

// ==================== Code cache blob ====================

const CACHE_FORMAT_VERSION: u32 = 1;

/// Serialized baseline-code record, consulted before compiling a script.
/// Opaque bytes to everyone but this module.
#[derive(Debug, Serialize, Deserialize)]
struct CachedCodeBlob {
    version: u32,
    source_hash: u64,
    flag_bits: u8,
    code_size: usize,
}

fn source_hash(source: &str) -> u64 {
    let mut hasher = rustc_hash::FxHasher::default();
    source.hash(&mut hasher);
    hasher.finish()
}

// ==================== Facade ====================

/// The compilation pipeline
pub struct Pipeline {
    backend: Arc<dyn Backend>,
    registry: DependencyRegistry,
    pool: OptimizationWorkerPool,
    /// In-flight OSR attempts, keyed by function identity and loop site.
    /// Foreground-only; retired when the attempt terminates or installs.
    osr_in_flight: FxHashSet<(u64, OsrSiteId)>,
    stats: PipelineStats,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(registry: DependencyRegistry) -> Self {
        Self::with_backend(
            PipelineConfig::default(),
            Arc::new(ReferenceBackend::new()),
            registry,
        )
    }

    pub fn with_backend(
        config: PipelineConfig,
        backend: Arc<dyn Backend>,
        registry: DependencyRegistry,
    ) -> Self {
        let pool = OptimizationWorkerPool::new(config.worker_count);
        Self {
            backend,
            registry,
            pool,
            osr_in_flight: FxHashSet::default(),
            stats: PipelineStats::default(),
            config,
        }
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn registry(&self) -> &DependencyRegistry {
        &self.registry
    }

    // ==================== Baseline compilation ====================

    /// Runnable code for `closure`, compiling baseline code on demand.
    /// Optimized code already installed on the closure takes precedence.
    pub fn get_unoptimized_code(&mut self, closure: &Closure) -> Result<CodeRef> {
        if let Some(code) = closure.shared().baseline_code() {
            return Ok(code);
        }
        let mut unit = CompilationUnit::for_closure(closure.clone(), self.registry.clone());
        self.compile_baseline_unit(&mut unit)
    }

    /// Baseline code for a function that has no instance yet
    pub fn get_unoptimized_code_for_shared(&mut self, shared: &SharedFunction) -> Result<CodeRef> {
        if let Some(code) = shared.baseline_code() {
            return Ok(code);
        }
        let mut unit = CompilationUnit::for_shared(shared.clone(), self.registry.clone());
        self.compile_baseline_unit(&mut unit)
    }

    /// True iff the closure has runnable code after the call. Compile errors
    /// are reported through tracing, not surfaced.
    pub fn ensure_compiled(&mut self, closure: &Closure) -> bool {
        if closure.shared().is_compiled() {
            return true;
        }
        match self.get_unoptimized_code(closure) {
            Ok(_) => true,
            Err(error) => {
                tracing::debug!(function = closure.shared().name(), %error, "baseline compilation failed");
                false
            }
        }
    }

    /// Compile a stub routine. Stubs carry no source; the descriptor and
    /// parameter count fully determine the code.
    pub fn compile_stub(
        &mut self,
        stub: StubDescriptor,
        parameter_count: usize,
    ) -> Result<CodeRef> {
        let mut unit = CompilationUnit::for_stub(stub, self.registry.clone());
        unit.set_parameter_count(parameter_count);
        self.compile_baseline_unit(&mut unit)
    }

    fn compile_baseline_unit(&mut self, unit: &mut CompilationUnit) -> Result<CodeRef> {
        let code = self.backend.compile_baseline(unit)?;
        if let Some(shared) = unit.shared() {
            shared.set_baseline_code(Arc::clone(&code));
        }
        self.stats.baseline_compilations += 1;
        tracing::debug!(
            function = %unit.debug_name(),
            code_size = code.size(),
            "baseline compilation finished"
        );
        Ok(code)
    }

    /// Compile a whole script, consulting the serialized-code cache.
    ///
    /// `Consume` deserializes `cached` and skips compilation when the blob
    /// matches this source; a stale or corrupt blob is discarded and the
    /// script recompiled. `Produce` compiles and returns a fresh blob for the
    /// embedder to persist.
    pub fn compile_script(
        &mut self,
        script: Script,
        cached: Option<Vec<u8>>,
        mode: CachedDataMode,
    ) -> Result<(CodeRef, Option<Vec<u8>>)> {
        let mut unit = CompilationUnit::for_script(script, self.registry.clone());
        unit.set_cached_data(cached, mode);

        if unit.cached_data_mode() == CachedDataMode::Consume {
            if let Some(code) = self.try_consume_cache(&unit) {
                return Ok((code, None));
            }
        }

        let code = self.compile_baseline_unit(&mut unit)?;

        let blob = if unit.cached_data_mode() == CachedDataMode::Produce {
            let record = CachedCodeBlob {
                version: CACHE_FORMAT_VERSION,
                source_hash: source_hash(unit.source()),
                flag_bits: code.flags().bits(),
                code_size: code.size(),
            };
            let bytes = bincode::serialize(&record)
                .map_err(|e| Error::CacheError(e.to_string()))?;
            self.stats.cache_stores += 1;
            Some(bytes)
        } else {
            None
        };

        Ok((code, blob))
    }

    fn try_consume_cache(&mut self, unit: &CompilationUnit) -> Option<CodeRef> {
        let blob = unit.cached_data()?;
        let record: CachedCodeBlob = match bincode::deserialize(blob) {
            Ok(record) => record,
            Err(error) => {
                tracing::warn!(%error, "cached code blob rejected, recompiling");
                return None;
            }
        };
        if record.version != CACHE_FORMAT_VERSION
            || record.source_hash != source_hash(unit.source())
        {
            tracing::warn!(
                script = %unit.debug_name(),
                "cached code blob is stale, recompiling"
            );
            return None;
        }
        self.stats.cache_hits += 1;
        tracing::debug!(script = %unit.debug_name(), "baseline code restored from cache");
        Some(Code::new(
            CodeKind::Baseline,
            CodeFlags::from_bits_truncate(record.flag_bits),
            record.code_size,
        ))
    }

    // ==================== Optimizing compilation ====================

    /// Request optimized code for `closure`.
    ///
    /// Synchronous mode runs the whole job inline and returns the installed
    /// code or `Failed`. Concurrent mode hands the job's front phases to the
    /// worker pool and returns `Queued`; the caller retrieves the job with
    /// [`poll_completed`](Self::poll_completed) and finalizes it with
    /// [`get_concurrently_optimized_code`](Self::get_concurrently_optimized_code).
    pub fn get_optimized_code(
        &mut self,
        closure: &Closure,
        mode: ConcurrencyMode,
        osr: Option<OsrSiteId>,
    ) -> OptimizedResult {
        let shared = closure.shared();

        if shared.optimization_disabled() {
            tracing::debug!(
                function = shared.name(),
                reason = %shared.disable_reason(),
                "optimization refused: function disabled"
            );
            return OptimizedResult::Failed;
        }
        if shared.opt_count() >= self.config.max_opt_count {
            shared.disable_optimization(BailoutReason::OptimizationDisabled);
            tracing::debug!(function = shared.name(), "optimization refused: attempt cap reached");
            return OptimizedResult::Failed;
        }

        if let Some(site) = osr {
            let key = (shared.id(), site);
            if self.osr_in_flight.contains(&key) {
                self.stats.osr_requests_deduplicated += 1;
                tracing::trace!(function = shared.name(), osr = site.0, "OSR attempt already in flight");
                return OptimizedResult::Queued;
            }
        }

        let unoptimized = match shared.baseline_code() {
            Some(code) => code,
            None => match self.get_unoptimized_code(closure) {
                Ok(code) => code,
                Err(error) => {
                    tracing::debug!(function = shared.name(), %error, "optimization refused: no baseline");
                    return OptimizedResult::Failed;
                }
            },
        };

        let mut unit = CompilationUnit::for_closure(closure.clone(), self.registry.clone());
        unit.set_optimizing(osr, unoptimized);
        shared.increment_opt_count();
        self.stats.optimizations_requested += 1;
        if let Some(site) = osr {
            self.osr_in_flight.insert((shared.id(), site));
        }

        let mut job = OptimizationJob::new(unit, Arc::clone(&self.backend));
        match mode {
            ConcurrencyMode::Synchronous => self.run_job_inline(&mut job),
            ConcurrencyMode::Concurrent => {
                self.pool.submit(job);
                self.stats.jobs_queued += 1;
                OptimizedResult::Queued
            }
        }
    }

    fn run_job_inline(&mut self, job: &mut OptimizationJob) -> OptimizedResult {
        let succeeded = job.create_graph() == JobStatus::Succeeded
            && job.optimize_graph() == JobStatus::Succeeded
            && job.generate_code() == JobStatus::Succeeded;
        if !succeeded {
            self.record_unsuccessful(job);
            self.retire_osr_attempt(job);
            return OptimizedResult::Failed;
        }
        if job.is_waiting_for_install() {
            // the synchronous caller is at a safe point by definition
            job.mark_installed();
        }
        let code = self.install_generated_code(job);
        OptimizedResult::Installed(code)
    }

    /// Retrieve the next job the worker pool has finished, if any
    pub fn poll_completed(&mut self) -> Option<OptimizationJob> {
        self.pool.try_next_completed()
    }

    /// Bounded wait for the next finished job
    pub fn wait_completed(&mut self, timeout: Duration) -> Option<OptimizationJob> {
        self.pool.next_completed(timeout)
    }

    /// Jobs handed to the pool and not yet retrieved
    pub fn jobs_in_flight(&self) -> usize {
        self.pool.in_flight()
    }

    /// Finalize a job that came back from the worker pool. Must run on the
    /// thread that owns the heap references, because installation touches
    /// live objects.
    ///
    /// Applies the cancellation policy first: a function disabled while the
    /// job was in flight aborts it for good; an abort requested because a
    /// committed assumption changed under the job aborts this attempt only.
    /// Otherwise runs GenerateCode and installs, except OSR jobs stay parked
    /// until [`install_osr_code`](Self::install_osr_code).
    pub fn get_concurrently_optimized_code(
        &mut self,
        job: &mut OptimizationJob,
    ) -> Option<CodeRef> {
        if job.is_terminal() {
            self.record_unsuccessful(job);
            self.retire_osr_attempt(job);
            return None;
        }

        if let Some(shared) = job.unit().shared() {
            if shared.optimization_disabled() {
                let reason = shared.disable_reason();
                let _ = job.abort_and_disable_optimization(reason);
                self.stats.jobs_aborted += 1;
                self.retire_osr_attempt(job);
                return None;
            }
        }
        if job.unit().is_abort_requested() {
            let _ = job.abort_optimization(BailoutReason::DependencyChanged);
            self.stats.jobs_aborted += 1;
            self.retire_osr_attempt(job);
            return None;
        }

        if job.generate_code() != JobStatus::Succeeded {
            self.record_unsuccessful(job);
            self.retire_osr_attempt(job);
            return None;
        }

        if job.is_waiting_for_install() {
            // OSR code becomes reachable only at the owner's safe point
            let code = job.unit().code().cloned();
            debug_assert!(code.is_some());
            return code;
        }
        Some(self.install_generated_code(job))
    }

    /// Install OSR code generated by a finished job, at a safe point of the
    /// frame being replaced. Clears the job's awaiting-install state and
    /// retires the in-flight OSR attempt.
    pub fn install_osr_code(&mut self, job: &mut OptimizationJob) -> CodeRef {
        assert!(
            job.is_waiting_for_install(),
            "install_osr_code on a job not awaiting install"
        );
        job.mark_installed();
        self.install_generated_code(job)
    }

    fn install_generated_code(&mut self, job: &OptimizationJob) -> CodeRef {
        let code = job
            .unit()
            .code()
            .cloned()
            .expect("successful job has generated code");
        if let Some(closure) = job.unit().closure() {
            closure.install_code(Arc::clone(&code));
        }
        self.retire_osr_attempt(job);
        self.stats.optimizations_installed += 1;
        tracing::debug!(
            function = %job.unit().debug_name(),
            optimization_id = ?job.unit().optimization_id(),
            code_size = code.size(),
            osr = job.unit().is_osr(),
            "optimized code installed"
        );
        code
    }

    fn record_unsuccessful(&mut self, job: &OptimizationJob) {
        match job.last_status() {
            JobStatus::BailedOut => self.stats.optimizations_bailed_out += 1,
            JobStatus::Failed => self.stats.optimizations_failed += 1,
            JobStatus::Succeeded => {}
        }
    }

    fn retire_osr_attempt(&mut self, job: &OptimizationJob) {
        let key = job
            .unit()
            .shared()
            .map(|shared| shared.id())
            .zip(job.unit().osr_target());
        if let Some(key) = key {
            self.osr_in_flight.remove(&key);
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("workers", &self.pool.worker_count())
            .field("in_flight", &self.pool.in_flight())
            .field("stats", &self.stats)
            .finish()
    }
}

//! Background optimization workers
//!
//! A small fixed pool of named threads runs the expensive front half of
//! optimizing compilation (CreateGraph and OptimizeGraph) off the foreground
//! thread. Jobs move whole into the pool and come back whole on a completion
//! queue; there is no shared mutation of a job in flight. The foreground
//! thread never blocks on a worker — it polls the completion queue on its own
//! schedule and runs GenerateCode itself, because installation touches live
//! heap state.

use crate::job::{JobStatus, OptimizationJob};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

// ==================== Queues ====================

enum Task {
    Run(Box<OptimizationJob>),
    Shutdown,
}

struct IntakeQueue {
    queue: Mutex<VecDeque<Task>>,
    available: Condvar,
}

impl IntakeQueue {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }

    fn push(&self, task: Task) {
        self.queue.lock().unwrap().push_back(task);
        self.available.notify_one();
    }

    fn pop(&self) -> Task {
        let mut queue = self.queue.lock().unwrap();
        loop {
            if let Some(task) = queue.pop_front() {
                return task;
            }
            queue = self.available.wait(queue).unwrap();
        }
    }
}

struct CompletionQueue {
    queue: Mutex<VecDeque<Box<OptimizationJob>>>,
    available: Condvar,
}

impl CompletionQueue {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }

    fn push(&self, job: Box<OptimizationJob>) {
        self.queue.lock().unwrap().push_back(job);
        self.available.notify_one();
    }

    fn try_pop(&self) -> Option<Box<OptimizationJob>> {
        self.queue.lock().unwrap().pop_front()
    }

    fn pop_timeout(&self, timeout: Duration) -> Option<Box<OptimizationJob>> {
        let deadline = std::time::Instant::now() + timeout;
        let mut queue = self.queue.lock().unwrap();
        loop {
            if let Some(job) = queue.pop_front() {
                return Some(job);
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, result) = self.available.wait_timeout(queue, deadline - now).unwrap();
            queue = guard;
            if result.timed_out() && queue.is_empty() {
                return None;
            }
        }
    }
}

// ==================== Pool ====================

/// Fixed pool of background optimization threads
pub struct OptimizationWorkerPool {
    intake: Arc<IntakeQueue>,
    completed: Arc<CompletionQueue>,
    in_flight: AtomicUsize,
    handles: Vec<JoinHandle<()>>,
}

impl OptimizationWorkerPool {
    pub fn new(worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        let intake = Arc::new(IntakeQueue::new());
        let completed = Arc::new(CompletionQueue::new());

        let mut handles = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let intake = Arc::clone(&intake);
            let completed = Arc::clone(&completed);
            let handle = thread::Builder::new()
                .name(format!("optimizer-{}", index))
                .spawn(move || worker_loop(index, &intake, &completed))
                .expect("failed to spawn optimization worker");
            handles.push(handle);
        }

        Self {
            intake,
            completed,
            in_flight: AtomicUsize::new(0),
            handles,
        }
    }

    /// Hand a job to the pool. The job must already have entered optimizing
    /// mode; the worker runs CreateGraph and OptimizeGraph and parks the job
    /// on the completion queue whatever the outcome.
    pub fn submit(&self, job: OptimizationJob) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(function = %job.unit().debug_name(), "job queued for background optimization");
        self.intake.push(Task::Run(Box::new(job)));
    }

    /// Non-blocking poll of the completion queue
    pub fn try_next_completed(&self) -> Option<OptimizationJob> {
        let job = self.completed.try_pop()?;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Some(*job)
    }

    /// Bounded wait for the next completed job. The foreground uses this
    /// between dispatch ticks; `Duration::ZERO` degenerates to a poll.
    pub fn next_completed(&self, timeout: Duration) -> Option<OptimizationJob> {
        let job = self.completed.pop_timeout(timeout)?;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Some(*job)
    }

    /// Jobs submitted but not yet retrieved from the completion queue
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }
}

impl Drop for OptimizationWorkerPool {
    fn drop(&mut self) {
        for _ in &self.handles {
            self.intake.push(Task::Shutdown);
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(index: usize, intake: &IntakeQueue, completed: &CompletionQueue) {
    loop {
        match intake.pop() {
            Task::Run(mut job) => {
                let status = job.create_graph();
                let status = if status == JobStatus::Succeeded {
                    job.optimize_graph()
                } else {
                    status
                };
                tracing::trace!(
                    worker = index,
                    function = %job.unit().debug_name(),
                    status = ?status,
                    "background phases finished"
                );
                completed.push(job);
            }
            Task::Shutdown => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ReferenceBackend;
    use crate::deps::DependencyRegistry;
    use crate::objects::{Closure, Code, CodeFlags, CodeKind, SharedFunction};
    use crate::unit::CompilationUnit;

    fn optimizing_job(source: &str) -> OptimizationJob {
        let shared = SharedFunction::new("f", source);
        let baseline = Code::new(CodeKind::Baseline, CodeFlags::empty(), 20);
        shared.set_baseline_code(baseline.clone());
        let mut unit = CompilationUnit::for_closure(
            Closure::new(shared, 1),
            DependencyRegistry::new(),
        );
        unit.set_optimizing(None, baseline);
        OptimizationJob::new(unit, Arc::new(ReferenceBackend::new()))
    }

    #[test]
    fn test_pool_runs_front_phases() {
        let pool = OptimizationWorkerPool::new(2);
        pool.submit(optimizing_job("function f() { return 1; }"));

        let mut job = pool
            .next_completed(Duration::from_secs(5))
            .expect("job completes");
        assert_eq!(job.last_status(), JobStatus::Succeeded);
        assert!(!job.is_terminal());
        // codegen stays with the caller
        assert_eq!(job.generate_code(), JobStatus::Succeeded);
        assert_eq!(pool.in_flight(), 0);
    }

    #[test]
    fn test_bailed_out_job_comes_back_terminal() {
        let pool = OptimizationWorkerPool::new(1);
        pool.submit(optimizing_job("function f(o) { with (o) {} }"));

        let job = pool
            .next_completed(Duration::from_secs(5))
            .expect("job completes");
        assert_eq!(job.last_status(), JobStatus::BailedOut);
        assert!(job.is_terminal());
        assert!(job.unit().dependencies_rolled_back());
    }

    #[test]
    fn test_completion_order_is_per_job_not_lost() {
        let pool = OptimizationWorkerPool::new(2);
        for _ in 0..4 {
            pool.submit(optimizing_job("function f() { return 1; }"));
        }
        let mut seen = 0;
        while seen < 4 {
            if pool.next_completed(Duration::from_secs(5)).is_some() {
                seen += 1;
            }
        }
        assert_eq!(pool.in_flight(), 0);
        assert!(pool.try_next_completed().is_none());
    }

    #[test]
    fn test_drop_joins_workers() {
        let pool = OptimizationWorkerPool::new(3);
        assert_eq!(pool.worker_count(), 3);
        drop(pool); // must not hang
    }
}

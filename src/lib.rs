//! Cinnabar: tiered-compilation plumbing for a JavaScript engine
//!
//! Cinnabar is the job-management layer of an optimizing compilation
//! pipeline: the bookkeeping that sits between a baseline compiler and an
//! optimizing backend. It owns the per-attempt compilation unit, the
//! three-phase optimization job, the speculative-dependency commit/rollback
//! protocol, and the foreground/worker scheduling that moves jobs off the
//! main thread — everything except parsing and code generation themselves,
//! which plug in behind the [`backend::Backend`] trait.
//!
//! # Quick Start
//!
//! ```no_run
//! use cinnabar::deps::DependencyRegistry;
//! use cinnabar::objects::{Closure, SharedFunction};
//! use cinnabar::pipeline::{ConcurrencyMode, Pipeline};
//!
//! fn main() -> cinnabar::Result<()> {
//!     let mut pipeline = Pipeline::new(DependencyRegistry::new());
//!     let f = Closure::new(SharedFunction::new("f", "function f(o) { return o.x; }"), 1);
//!
//!     let baseline = pipeline.get_unoptimized_code(&f)?;
//!     println!("baseline: {} bytes", baseline.size());
//!
//!     let result = pipeline.get_optimized_code(&f, ConcurrencyMode::Synchronous, None);
//!     println!("optimized: {:?}", result);
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! A request flows: [`pipeline`] → [`unit`] → [`job`] phases against a
//! [`backend`] → dependency commit into [`deps`] → code installed on
//! [`objects`].
//!
//! | Category | Modules |
//! |----------|---------|
//! | **Core** | [`unit`], [`job`], [`pipeline`], [`error`](Error) |
//! | **Heap side** | [`objects`], [`deps`] |
//! | **Support** | [`arena`], [`phase`], [`backend`] |

pub mod arena;
pub mod backend;
pub mod deps;
pub mod job;
pub mod objects;
pub mod phase;
pub mod pipeline;
pub mod unit;

mod error;

pub use error::{Error, Result, SourceLocation};
pub use job::{JobStatus, OptimizationJob};
pub use pipeline::{ConcurrencyMode, OptimizedResult, Pipeline, PipelineConfig, PipelineStats};
pub use unit::{CompilationMode, CompilationUnit};

/// Cinnabar version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Install a process-wide tracing subscriber honoring `RUST_LOG`.
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

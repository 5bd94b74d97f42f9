//! Shared test helpers for integration tests

use cinnabar::deps::DependencyRegistry;
use cinnabar::objects::{Closure, SharedFunction};
use cinnabar::pipeline::Pipeline;

/// A pipeline with its registry, on the default deterministic backend
pub fn pipeline() -> (Pipeline, DependencyRegistry) {
    let registry = DependencyRegistry::new();
    (Pipeline::new(registry.clone()), registry)
}

/// A closure over a fresh function with the given source
pub fn closure(name: &str, source: &str) -> Closure {
    Closure::new(SharedFunction::new(name, source), 1)
}

/// A second instance of the same function in another context
#[allow(dead_code)]
pub fn closure_in_context(shared: &SharedFunction, context_id: u64) -> Closure {
    Closure::new(shared.clone(), context_id)
}

//! Dependency tracking between optimized code and heap-shape assumptions
//!
//! Optimized code bakes in speculative assumptions about the heap: a shape
//! stays stable, a prototype chain does not change, a property cell keeps its
//! value. Each assumption is recorded while the code is being built and, on
//! successful code generation, committed into the process-wide
//! [`DependencyRegistry`]. When the runtime later violates an assumption it
//! sweeps the registry and marks every dependent routine for deoptimization.
//!
//! Until a unit commits, its accumulated entries are private to it; a unit
//! that does not reach committed success rolls them back instead. Commit and
//! rollback are mutually exclusive and exactly one happens per unit.

use crate::objects::{CodeRef, ShapeId};
use rustc_hash::FxHashMap as HashMap;
use std::sync::{Arc, Mutex};

/// Invalidation group: the class of heap assumption a dependency belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DependencyGroup {
    /// A shape transition the code assumed would not happen
    Transition,
    /// Prototype chain stability
    Prototype,
    /// A global property cell keeping its value
    PropertyCell,
    /// A field keeping its representation
    FieldType,
    /// The initial map of a constructor staying unchanged
    InitialMap,
    /// An allocation site keeping its pretenuring decision
    AllocationSite,
}

impl DependencyGroup {
    /// All groups, for iteration in tests and sweeps
    pub const ALL: [DependencyGroup; 6] = [
        DependencyGroup::Transition,
        DependencyGroup::Prototype,
        DependencyGroup::PropertyCell,
        DependencyGroup::FieldType,
        DependencyGroup::InitialMap,
        DependencyGroup::AllocationSite,
    ];
}

/// One recorded assumption: a heap object plus its invalidation group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DependencyEntry {
    pub target: ShapeId,
    pub group: DependencyGroup,
}

impl DependencyEntry {
    pub fn new(target: ShapeId, group: DependencyGroup) -> Self {
        Self { target, group }
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    /// Code objects dependent on each (target, group) assumption
    dependents: HashMap<(ShapeId, DependencyGroup), Vec<CodeRef>>,
}

/// Process-wide store of committed dependencies
///
/// Mutated only through [`commit`](DependencyRegistry::commit) (append-only
/// per code object) and [`invalidate`](DependencyRegistry::invalidate)
/// sweeps triggered by heap mutations. Not-yet-committed entries never touch
/// the registry; they are rolled back at the unit level.
#[derive(Debug, Clone, Default)]
pub struct DependencyRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl DependencyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every entry against `code`. Called once per unit, on
    /// successful code generation.
    pub fn commit(&self, code: &CodeRef, entries: &[DependencyEntry]) {
        if entries.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        for entry in entries {
            inner
                .dependents
                .entry((entry.target, entry.group))
                .or_default()
                .push(Arc::clone(code));
        }
        tracing::debug!(
            code_id = code.id(),
            count = entries.len(),
            "dependencies committed"
        );
    }

    /// Invalidation sweep: mark every routine registered against
    /// `(target, group)` for deoptimization and drop the registrations.
    /// Returns how many routines were revoked.
    pub fn invalidate(&self, target: ShapeId, group: DependencyGroup) -> usize {
        let revoked = {
            let mut inner = self.inner.lock().unwrap();
            inner.dependents.remove(&(target, group)).unwrap_or_default()
        };
        for code in &revoked {
            code.mark_for_deoptimization();
        }
        if !revoked.is_empty() {
            tracing::debug!(?target, ?group, count = revoked.len(), "dependency group invalidated");
        }
        revoked.len()
    }

    /// Number of routines currently registered against `(target, group)`
    pub fn dependent_count(&self, target: ShapeId, group: DependencyGroup) -> usize {
        self.inner
            .lock()
            .unwrap()
            .dependents
            .get(&(target, group))
            .map_or(0, |v| v.len())
    }

    /// Total registrations across all assumptions
    pub fn total_registrations(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .dependents
            .values()
            .map(|v| v.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::{Code, CodeFlags, CodeKind};

    fn optimized_code() -> CodeRef {
        Code::new(CodeKind::Optimized, CodeFlags::empty(), 64)
    }

    #[test]
    fn test_commit_registers_per_group() {
        let registry = DependencyRegistry::new();
        let code = optimized_code();
        registry.commit(
            &code,
            &[
                DependencyEntry::new(ShapeId(1), DependencyGroup::Transition),
                DependencyEntry::new(ShapeId(1), DependencyGroup::Prototype),
                DependencyEntry::new(ShapeId(2), DependencyGroup::Transition),
            ],
        );
        assert_eq!(registry.dependent_count(ShapeId(1), DependencyGroup::Transition), 1);
        assert_eq!(registry.dependent_count(ShapeId(1), DependencyGroup::Prototype), 1);
        assert_eq!(registry.dependent_count(ShapeId(2), DependencyGroup::Transition), 1);
        assert_eq!(registry.total_registrations(), 3);
    }

    #[test]
    fn test_commit_empty_is_noop() {
        let registry = DependencyRegistry::new();
        let code = optimized_code();
        registry.commit(&code, &[]);
        assert_eq!(registry.total_registrations(), 0);
    }

    #[test]
    fn test_invalidate_marks_and_removes() {
        let registry = DependencyRegistry::new();
        let a = optimized_code();
        let b = optimized_code();
        let entry = DependencyEntry::new(ShapeId(7), DependencyGroup::FieldType);
        registry.commit(&a, &[entry]);
        registry.commit(&b, &[entry]);

        let revoked = registry.invalidate(ShapeId(7), DependencyGroup::FieldType);
        assert_eq!(revoked, 2);
        assert!(a.is_marked_for_deoptimization());
        assert!(b.is_marked_for_deoptimization());
        assert_eq!(registry.dependent_count(ShapeId(7), DependencyGroup::FieldType), 0);
    }

    #[test]
    fn test_invalidate_unrelated_group_leaves_code_alone() {
        let registry = DependencyRegistry::new();
        let code = optimized_code();
        registry.commit(
            &code,
            &[DependencyEntry::new(ShapeId(3), DependencyGroup::InitialMap)],
        );
        assert_eq!(registry.invalidate(ShapeId(3), DependencyGroup::Prototype), 0);
        assert!(!code.is_marked_for_deoptimization());
    }
}

//! Arena allocation for transient compilation artifacts
//!
//! Every compilation unit owns one [`Arena`]. All scratch data produced while
//! compiling that unit is carved out of it and freed in bulk when the unit is
//! torn down; there is no individual deallocation. The arena is a plain owned
//! value: handing a compilation job to a background worker moves the arena
//! with it, and finishing the job moves it back. It is deliberately `Send`
//! but not `Sync` — safety comes from single-writer ownership handoff, never
//! from sharing.

use std::cell::Cell;
use typed_arena::Arena as ByteArena;

/// A bulk-allocated, bulk-freed memory region with byte accounting.
pub struct Arena {
    bytes: ByteArena<u8>,
    allocated: Cell<usize>,
}

impl Arena {
    /// Create an empty arena
    pub fn new() -> Self {
        Self {
            bytes: ByteArena::new(),
            allocated: Cell::new(0),
        }
    }

    /// Allocate a zeroed byte slice that lives as long as the arena
    pub fn alloc_bytes(&self, len: usize) -> &mut [u8] {
        self.allocated.set(self.allocated.get() + len);
        self.bytes.alloc_extend(std::iter::repeat(0u8).take(len))
    }

    /// Copy a byte slice into the arena
    pub fn alloc_slice(&self, data: &[u8]) -> &mut [u8] {
        self.allocated.set(self.allocated.get() + data.len());
        self.bytes.alloc_extend(data.iter().copied())
    }

    /// Total bytes handed out so far
    ///
    /// Compilation phases snapshot this on entry and report the delta on
    /// exit, so per-phase allocation shows up in trace output.
    pub fn allocated_bytes(&self) -> usize {
        self.allocated.get()
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("allocated_bytes", &self.allocated.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_accounting() {
        let arena = Arena::new();
        assert_eq!(arena.allocated_bytes(), 0);
        arena.alloc_bytes(128);
        arena.alloc_bytes(64);
        assert_eq!(arena.allocated_bytes(), 192);
    }

    #[test]
    fn test_arena_alloc_slice_copies() {
        let arena = Arena::new();
        let copied = arena.alloc_slice(&[1, 2, 3]);
        assert_eq!(copied, &[1, 2, 3]);
        assert_eq!(arena.allocated_bytes(), 3);
    }

    #[test]
    fn test_arena_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<Arena>();
    }

    #[test]
    fn test_arena_moves_across_threads() {
        let arena = Arena::new();
        arena.alloc_bytes(16);
        let arena = std::thread::spawn(move || {
            arena.alloc_bytes(16);
            arena
        })
        .join()
        .unwrap();
        assert_eq!(arena.allocated_bytes(), 32);
    }
}

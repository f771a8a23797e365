//! Advisory hierarchy-level locking boundary.
//!
//! A collaborator may hold an advisory lock across the whole overlay
//! lifetime; the cache acquires it eagerly when the overlay is created and
//! releases it after merge-back. The cache itself only defines the boundary.

use canopy_core::{CanopyResult, StoreError};
use std::sync::atomic::{AtomicBool, Ordering};

/// Advisory lock held for the lifetime of an overlay.
pub trait HierarchyLevelLocker: Send + Sync {
    /// Acquire the lock. Failure poisons the overlay initialization.
    fn lock(&self) -> CanopyResult<()>;

    /// Release the lock. Called after merge-back at teardown.
    fn unlock(&self) -> CanopyResult<()>;
}

/// Locker for deployments without cross-instance coordination.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLevelLocker;

impl HierarchyLevelLocker for NoopLevelLocker {
    fn lock(&self) -> CanopyResult<()> {
        Ok(())
    }

    fn unlock(&self) -> CanopyResult<()> {
        Ok(())
    }
}

/// Single-acquisition in-process locker. Mostly useful in tests asserting
/// the acquire/release lifecycle.
#[derive(Debug, Default)]
pub struct InProcessLevelLocker {
    held: AtomicBool,
}

impl InProcessLevelLocker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the lock is currently held.
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }
}

impl HierarchyLevelLocker for InProcessLevelLocker {
    fn lock(&self) -> CanopyResult<()> {
        if self.held.swap(true, Ordering::SeqCst) {
            return Err(StoreError::Busy {
                reason: "hierarchy level lock already held".to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn unlock(&self) -> CanopyResult<()> {
        self.held.store(false, Ordering::SeqCst);
        Ok(())
    }
}

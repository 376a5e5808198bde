//! Target process handles
//!
//! Connection lifecycle and reference counting live outside the transport
//! core. What the core needs from them is small: a resolved handle for the
//! destination process and a definitive answer to "does its memory space
//! still exist". `TargetProcess` carries exactly that.

use crate::mem::MemorySpace;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::RwLock;

/// Process ID counter
static NEXT_PID: AtomicU64 = AtomicU64::new(1);

/// Process identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u64);

impl ProcessId {
    /// Allocate a new process ID
    pub fn new() -> Self {
        Self(NEXT_PID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get raw value
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for ProcessId {
    fn default() -> Self {
        Self::new()
    }
}

/// A resolved transfer destination
///
/// The space slot is cleared when the owning process tears down; from that
/// point every transfer to this target fails with `TargetGone`.
pub struct TargetProcess {
    pid: ProcessId,
    space: RwLock<Option<Arc<MemorySpace>>>,
}

impl TargetProcess {
    /// Wrap a process's memory space as a transfer target
    pub fn new(space: Arc<MemorySpace>) -> Self {
        Self {
            pid: ProcessId::new(),
            space: RwLock::new(Some(space)),
        }
    }

    /// Process ID of the target
    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    /// Resolve the target's memory space, `None` once torn down
    pub fn memory_space(&self) -> Option<Arc<MemorySpace>> {
        self.space.read().clone()
    }

    /// Drop the memory space; in-flight pins stay valid until released
    pub fn tear_down(&self) {
        let mut space = self.space.write();
        if space.take().is_some() {
            log::debug!("target process {} torn down", self.pid.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_after_teardown() {
        let target = TargetProcess::new(Arc::new(MemorySpace::new()));
        assert!(target.memory_space().is_some());

        target.tear_down();
        assert!(target.memory_space().is_none());

        // Second teardown is harmless
        target.tear_down();
    }

    #[test]
    fn test_pid_is_unique() {
        let a = TargetProcess::new(Arc::new(MemorySpace::new()));
        let b = TargetProcess::new(Arc::new(MemorySpace::new()));
        assert_ne!(a.pid(), b.pid());
    }
}

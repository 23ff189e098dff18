//! Cross-core spin lock
//!
//! One atomic word in shared memory: zero when unowned, `core id + 1` when
//! held. The host environment guarantees that atomic read-modify-write on
//! this word is coherent across cores even though ordinary data caches are
//! not. Waiting is always an active spin; there is no scheduler to yield to
//! from arbitrary interrupt contexts.

use core::sync::atomic::{AtomicU32, Ordering};

use crossflow_platform::{CoreId, ExecContext};

const UNOWNED: u32 = 0;

/// Spin lock word recording the owning core.
///
/// Unlike an anonymous spin lock, the owner identity is readable; the
/// synchronization wrappers use it to tell "contended by another core"
/// apart from "re-entered by this core", which is the deadlock condition in
/// a non-preemptible context.
#[derive(Debug)]
pub struct SpinLock {
    word: AtomicU32,
}

impl SpinLock {
    pub const fn new() -> Self {
        Self {
            word: AtomicU32::new(UNOWNED),
        }
    }

    /// Single acquisition attempt on behalf of `core`.
    pub fn try_lock(&self, core: CoreId) -> bool {
        self.word
            .compare_exchange(
                UNOWNED,
                core.0 as u32 + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Spins until the lock is acquired by the executing core.
    pub fn lock(&self, platform: &impl ExecContext) {
        let core = platform.core_id();
        while !self.try_lock(core) {
            platform.spin_wait();
        }
    }

    /// Releases the lock held by `core`.
    pub fn unlock(&self, core: CoreId) {
        let released = self.word.compare_exchange(
            core.0 as u32 + 1,
            UNOWNED,
            Ordering::Release,
            Ordering::Relaxed,
        );
        debug_assert!(released.is_ok(), "unlock by non-owner");
        let _ = released;
    }

    /// Core currently holding the lock, if any.
    pub fn owner(&self) -> Option<CoreId> {
        match self.word.load(Ordering::Relaxed) {
            UNOWNED => None,
            id => Some(CoreId((id - 1) as u8)),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.word.load(Ordering::Relaxed) != UNOWNED
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

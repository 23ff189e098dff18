//! Exclusive cross-core wrapper with deadlock detection
//!
//! [`SharedRw`] admits exactly one accessor at a time, read or write. It is
//! the discipline of choice for descriptors that are always read-modified
//! (buffer bookkeeping, pipeline state), where grading readers would buy
//! nothing.
//!
//! The acquisition path watches for the one lock-up spinning cannot
//! resolve: the lock is already held by the executing core while the
//! current context is non-preemptible, so the earlier holder can never run
//! again to release it. The condition is detected exactly and surfaced as
//! [`StreamError::WouldDeadlock`]; whether to halt, reset the pipeline, or
//! restart the firmware is the host's call.

use core::cell::UnsafeCell;
use core::mem::size_of;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

use crossflow_platform::Platform;

use super::spinlock::SpinLock;
use super::CacheAligned;
use crate::error::{StreamError, StreamResult};

/// Exclusive cross-core wrapper around one object.
pub struct SharedRw<T, P: Platform> {
    lock: SpinLock,
    /// Deadlock detections since construction, kept for post-mortem
    /// diagnostics.
    deadlocks: AtomicU32,
    platform: P,
    obj: CacheAligned<T>,
}

// Safety: the inner object is only reachable through a guard, and guards
// exist only while the spin lock is held by the creating core.
unsafe impl<T: Send, P: Platform> Send for SharedRw<T, P> {}
unsafe impl<T: Send, P: Platform> Sync for SharedRw<T, P> {}

impl<T, P: Platform> SharedRw<T, P> {
    /// Wraps `obj` for exclusive cross-core access, flushing the freshly
    /// initialized object to backing memory.
    pub fn new(obj: T, platform: P) -> Self {
        let rw = Self {
            lock: SpinLock::new(),
            deadlocks: AtomicU32::new(0),
            platform,
            obj: CacheAligned(UnsafeCell::new(obj)),
        };
        rw.platform
            .write_back(rw.obj_ptr() as *const u8, size_of::<T>());
        rw
    }

    fn obj_ptr(&self) -> *mut T {
        self.obj.0.get()
    }

    /// Acquires exclusive access, invalidating this core's cached view so
    /// the access starts from backing memory. The released guard writes the
    /// object back.
    ///
    /// Spins while another core holds the lock. Re-entry by the executing
    /// core in a non-preemptible context is reported as
    /// [`StreamError::WouldDeadlock`] instead of spinning forever.
    pub fn lock(&self) -> StreamResult<SharedRwGuard<'_, T, P>> {
        self.acquire(false)
    }

    /// Like [`lock`](Self::lock), but the release skips the write-back.
    /// For callers that manage coherence of the object themselves and only
    /// need the mutual exclusion.
    pub fn lock_light(&self) -> StreamResult<SharedRwGuard<'_, T, P>> {
        self.acquire(true)
    }

    fn acquire(&self, light: bool) -> StreamResult<SharedRwGuard<'_, T, P>> {
        let me = self.platform.core_id();
        while !self.lock.try_lock(me) {
            // a non-preemptible context spinning on its own lock will never
            // observe a release
            if self.platform.interrupts_masked() && self.lock.owner() == Some(me) {
                self.deadlocks.fetch_add(1, Ordering::Relaxed);
                return Err(StreamError::WouldDeadlock {
                    core: me.0,
                    owner: me.0,
                });
            }
            self.platform.spin_wait();
        }
        self.platform
            .invalidate(self.obj_ptr() as *mut u8, size_of::<T>());
        Ok(SharedRwGuard {
            shared: self,
            light,
        })
    }

    /// Runs `f` under both the critical section and the lock, for accesses
    /// that must also exclude local interrupt-level code.
    pub fn with_masked<R>(&self, f: impl FnOnce(&mut T) -> R) -> StreamResult<R> {
        critical_section::with(|_| {
            let mut guard = self.lock()?;
            Ok(f(&mut *guard))
        })
    }

    /// Deadlock detections since construction.
    pub fn deadlock_count(&self) -> u32 {
        self.deadlocks.load(Ordering::Relaxed)
    }
}

/// Exclusive access to a [`SharedRw`] object.
pub struct SharedRwGuard<'a, T, P: Platform> {
    shared: &'a SharedRw<T, P>,
    light: bool,
}

impl<T, P: Platform> Deref for SharedRwGuard<'_, T, P> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the spin lock is held for the guard's lifetime.
        unsafe { &*self.shared.obj_ptr() }
    }
}

impl<T, P: Platform> DerefMut for SharedRwGuard<'_, T, P> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: see Deref.
        unsafe { &mut *self.shared.obj_ptr() }
    }
}

impl<T, P: Platform> core::fmt::Debug for SharedRwGuard<'_, T, P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SharedRwGuard")
            .field("light", &self.light)
            .finish()
    }
}

impl<T, P: Platform> Drop for SharedRwGuard<'_, T, P> {
    fn drop(&mut self) {
        let shared = self.shared;
        if !self.light {
            // write back and invalidate, so no dirty line lingers in this
            // core's cache after the release
            shared
                .platform
                .write_back_invalidate(shared.obj_ptr() as *mut u8, size_of::<T>());
        }
        shared.lock.unlock(shared.platform.core_id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossflow_platform::{CacheOps, CoreId, ExecContext, PlatformAdapter};

    struct NullPlatform;

    impl PlatformAdapter for NullPlatform {
        fn platform_name() -> &'static str {
            "null"
        }
        fn core_id(&self) -> CoreId {
            CoreId(0)
        }
        fn core_count(&self) -> usize {
            2
        }
    }

    impl CacheOps for NullPlatform {
        fn write_back(&self, _region: *const u8, _len: usize) {}
        fn invalidate(&self, _region: *mut u8, _len: usize) {}
    }

    impl ExecContext for NullPlatform {
        fn interrupts_masked(&self) -> bool {
            false
        }
        fn spin_wait(&self) {}
    }

    /// Every context reports as non-preemptible.
    struct MaskedPlatform;

    impl PlatformAdapter for MaskedPlatform {
        fn platform_name() -> &'static str {
            "masked"
        }
        fn core_id(&self) -> CoreId {
            CoreId(0)
        }
        fn core_count(&self) -> usize {
            2
        }
    }

    impl CacheOps for MaskedPlatform {
        fn write_back(&self, _region: *const u8, _len: usize) {}
        fn invalidate(&self, _region: *mut u8, _len: usize) {}
    }

    impl ExecContext for MaskedPlatform {
        fn interrupts_masked(&self) -> bool {
            true
        }
        fn spin_wait(&self) {}
    }

    #[test]
    fn lock_gives_exclusive_mutable_access() {
        let rw = SharedRw::new(0u32, NullPlatform);
        {
            let mut guard = rw.lock().unwrap();
            *guard = 5;
        }
        let guard = rw.lock().unwrap();
        assert_eq!(*guard, 5);
    }

    #[test]
    fn reentry_in_masked_context_would_deadlock() {
        let rw = SharedRw::new(0u32, MaskedPlatform);
        let guard = rw.lock().unwrap();

        let err = rw.lock().unwrap_err();
        assert_eq!(err, StreamError::WouldDeadlock { core: 0, owner: 0 });
        assert_eq!(rw.deadlock_count(), 1);

        drop(guard);
        assert!(rw.lock().is_ok());
        assert_eq!(rw.deadlock_count(), 1);
    }

    #[test]
    fn with_masked_runs_under_lock() {
        let rw = SharedRw::new(1u32, NullPlatform);
        let doubled = rw.with_masked(|v| {
            *v *= 2;
            *v
        });
        assert_eq!(doubled, Ok(2));
        assert_eq!(*rw.lock().unwrap(), 2);
    }

    #[test]
    fn lock_light_releases_lock() {
        let rw = SharedRw::new(3u32, NullPlatform);
        {
            let mut guard = rw.lock_light().unwrap();
            *guard += 1;
        }
        assert_eq!(*rw.lock().unwrap(), 4);
    }
}

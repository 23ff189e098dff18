//! Cross-core shared-object synchronization
//!
//! Cores in the target cluster do not keep their data caches coherent.
//! An object shared between cores is therefore wrapped together with a
//! cache-line-sized control block, and every access follows an explicit
//! protocol: acquire (refresh the local cached view if it is stale), use,
//! release (flush the modified view and mark every other core stale).
//!
//! Two access disciplines are offered:
//!
//! - [`Shared`] grades access: many concurrent readers or one exclusive
//!   writer, tracked by a reader count. The control-block lock is held only
//!   for bookkeeping on the read side, and for the whole access on the
//!   write side.
//! - [`SharedRw`] is exclusive-only: one accessor at a time, read or write,
//!   with explicit detection of the one lock-up no amount of spinning can
//!   resolve (re-entry by the owning core in a non-preemptible context).
//!
//! A write on one core becomes visible to a reader on another only after
//! the writer's release (write-back) and the reader's next acquire
//! (invalidate). There is no visibility guarantee outside the protocol;
//! objects that must bypass it belong in a hardware-coherent address range
//! instead.
//!
//! The control-block words themselves (lock, reader count, invalidate
//! mask, dirty flag) are atomics the host guarantees coherent across cores,
//! so the protocol metadata needs no cache maintenance of its own; the
//! injected [`CacheOps`](crossflow_platform::CacheOps) maintenance applies
//! to the wrapped object.

mod rw;
mod spinlock;

pub use rw::{SharedRw, SharedRwGuard};
pub use spinlock::SpinLock;

use core::cell::UnsafeCell;
use core::mem::size_of;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crossflow_platform::Platform;

/// Coherence metadata for one shared object. Must stay within a single
/// cache line so maintenance on the wrapped object never touches it.
#[repr(C, align(64))]
pub(crate) struct CtrlBlock {
    lock: SpinLock,
    reader_cnt: AtomicU32,
    invalidate_mask: AtomicU32,
    dirty: AtomicBool,
}

const _: () = assert!(
    size_of::<CtrlBlock>() <= 64,
    "control block exceeds one cache line"
);

impl CtrlBlock {
    const fn new() -> Self {
        Self {
            lock: SpinLock::new(),
            reader_cnt: AtomicU32::new(0),
            invalidate_mask: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
        }
    }
}

/// Cache-line alignment for the wrapped object, so object maintenance
/// cannot clip neighbouring data.
#[repr(align(64))]
pub(crate) struct CacheAligned<T>(pub(crate) UnsafeCell<T>);

/// Graded cross-core wrapper: many readers or one exclusive writer.
///
/// The wrapper owns the object and its control block for their common
/// lifetime; neither is ever reallocated. No core owns the pair — whichever
/// core holds the write access logically owns the backing memory for that
/// duration, all others hold lazily-invalidated views.
pub struct Shared<T, P: Platform> {
    ctrl: CtrlBlock,
    platform: P,
    obj: CacheAligned<T>,
}

// Safety: access to the inner object is mediated by the control block
// protocol - shared references only while the reader count is nonzero,
// exclusive references only under the control-block lock with zero readers.
unsafe impl<T: Send, P: Platform> Send for Shared<T, P> {}
unsafe impl<T: Send + Sync, P: Platform> Sync for Shared<T, P> {}

impl<T, P: Platform> Shared<T, P> {
    /// Wraps `obj` for cross-core sharing.
    ///
    /// The constructing core flushes the freshly initialized object to
    /// backing memory and marks every other core's view stale.
    pub fn new(obj: T, platform: P) -> Self {
        let shared = Self {
            ctrl: CtrlBlock::new(),
            platform,
            obj: CacheAligned(UnsafeCell::new(obj)),
        };
        shared
            .platform
            .write_back(shared.obj_ptr() as *const u8, size_of::<T>());
        let stale = shared.platform.all_cores_mask() & !shared.platform.core_id().bit();
        shared.ctrl.invalidate_mask.store(stale, Ordering::Release);
        shared
    }

    fn obj_ptr(&self) -> *mut T {
        self.obj.0.get()
    }

    /// Refreshes this core's view when its invalidate bit is set.
    /// Caller holds the control-block lock.
    fn invalidate_if_stale(&self) {
        let me = self.platform.core_id().bit();
        let mask = self.ctrl.invalidate_mask.load(Ordering::Relaxed);
        if mask & me != 0 {
            self.platform
                .invalidate(self.obj_ptr() as *mut u8, size_of::<T>());
            self.ctrl.invalidate_mask.store(mask & !me, Ordering::Relaxed);
        }
    }

    /// Acquires shared read access.
    ///
    /// The control-block lock is held only while the reader count is
    /// updated and the local view refreshed, not for the duration of the
    /// read.
    pub fn read(&self) -> SharedReadGuard<'_, T, P> {
        self.ctrl.lock.lock(&self.platform);
        self.ctrl.reader_cnt.fetch_add(1, Ordering::Relaxed);
        self.invalidate_if_stale();
        self.ctrl.lock.unlock(self.platform.core_id());
        SharedReadGuard { shared: self }
    }

    /// Acquires exclusive write access, waiting for active readers to
    /// drain. The local view is refreshed before access so read-modify
    /// sequences see the latest data; the object is marked possibly dirty.
    ///
    /// Must not be called while this core already holds a guard on the same
    /// object; the graded wrapper performs no re-entry detection.
    pub fn write(&self) -> SharedWriteGuard<'_, T, P> {
        self.ctrl.lock.lock(&self.platform);
        while self.ctrl.reader_cnt.load(Ordering::Relaxed) > 0 {
            // let readers drain without holding the bookkeeping lock
            self.ctrl.lock.unlock(self.platform.core_id());
            self.platform.spin_wait();
            self.ctrl.lock.lock(&self.platform);
        }
        self.ctrl.dirty.store(true, Ordering::Relaxed);
        self.invalidate_if_stale();
        // the lock stays held until the write guard drops
        SharedWriteGuard { shared: self }
    }

    /// Read guards currently outstanding across all cores.
    pub fn reader_count(&self) -> u32 {
        self.ctrl.reader_cnt.load(Ordering::Relaxed)
    }

    /// Mask of cores whose cached view of the object is stale.
    pub fn stale_cores(&self) -> u32 {
        self.ctrl.invalidate_mask.load(Ordering::Relaxed)
    }
}

/// Shared read access to a [`Shared`] object.
pub struct SharedReadGuard<'a, T, P: Platform> {
    shared: &'a Shared<T, P>,
}

impl<T, P: Platform> Deref for SharedReadGuard<'_, T, P> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the reader count is nonzero while this guard lives, and
        // writers wait for it to reach zero before taking exclusive access.
        unsafe { &*self.shared.obj_ptr() }
    }
}

impl<T, P: Platform> Drop for SharedReadGuard<'_, T, P> {
    fn drop(&mut self) {
        let shared = self.shared;
        shared.ctrl.lock.lock(&shared.platform);
        shared.ctrl.reader_cnt.fetch_sub(1, Ordering::Relaxed);
        shared.ctrl.lock.unlock(shared.platform.core_id());
    }
}

/// Exclusive write access to a [`Shared`] object. Holds the control-block
/// lock for its whole lifetime.
pub struct SharedWriteGuard<'a, T, P: Platform> {
    shared: &'a Shared<T, P>,
}

impl<T, P: Platform> Deref for SharedWriteGuard<'_, T, P> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: exclusive - the control-block lock is held and the reader
        // count was zero when the guard was created.
        unsafe { &*self.shared.obj_ptr() }
    }
}

impl<T, P: Platform> DerefMut for SharedWriteGuard<'_, T, P> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: see Deref.
        unsafe { &mut *self.shared.obj_ptr() }
    }
}

impl<T, P: Platform> Drop for SharedWriteGuard<'_, T, P> {
    fn drop(&mut self) {
        let shared = self.shared;
        if shared.ctrl.dirty.swap(false, Ordering::Relaxed) {
            shared
                .platform
                .write_back(shared.obj_ptr() as *const u8, size_of::<T>());
            // this core's view stays valid, everyone else must refresh
            let stale =
                shared.platform.all_cores_mask() & !shared.platform.core_id().bit();
            shared.ctrl.invalidate_mask.store(stale, Ordering::Relaxed);
        }
        shared.ctrl.lock.unlock(shared.platform.core_id());
    }
}

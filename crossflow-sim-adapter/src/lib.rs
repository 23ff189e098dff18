//! Simulated multi-core platform for crossflow
//!
//! This crate provides a host-side (std) implementation of the
//! [`crossflow_platform`] traits for testing the cross-core coherence
//! protocol without hardware:
//!
//! - **Core identity**: a thread-local "core register" set by
//!   [`SimPlatform::run_as`], so one test thread can act as several cores
//!   in sequence, or several threads can act as one core each.
//! - **Cache emulation**: `write_back` snapshots a region into a
//!   backing-memory image; `invalidate` copies the image back over the
//!   region. A write that skips the protocol's write-back is therefore
//!   *observably lost* as soon as another core invalidates - the same
//!   failure mode as on hardware, minus the nondeterminism.
//! - **Critical sections**: a process-wide `critical-section`
//!   implementation whose nesting depth doubles as the "interrupts masked"
//!   state reported to lock acquisition paths.
//!
//! Every maintenance operation is recorded in a chronological log
//! ([`SimPlatform::ops`]) so tests can assert protocol steps, and emitted
//! as `tracing` events for debugging.
//!
//! # Fidelity limits
//!
//! The emulation keys backing images by region address; an object moved
//! after construction simply orphans its old image. Regions never written
//! back read as their live memory, which matches the "never cached by more
//! than one core" behavior of a hardware-aliased coherent range.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crossflow_platform::{CacheOps, CoreId, ExecContext, PlatformAdapter};

thread_local! {
    /// Simulated processor-id register of the executing thread.
    static CURRENT_CORE: Cell<u8> = const { Cell::new(0) };
    /// Critical-section nesting depth of the executing thread.
    static CS_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Process-wide critical-section implementation.
///
/// One global lock stands in for "interrupts raised to the critical level
/// on this core": while any simulated context holds it, no other context
/// may enter a critical section, and the holder reports as non-preemptible.
struct SimCriticalSection;

static CS_LOCK: AtomicBool = AtomicBool::new(false);

critical_section::set_impl!(SimCriticalSection);

unsafe impl critical_section::Impl for SimCriticalSection {
    unsafe fn acquire() -> critical_section::RawRestoreState {
        CS_DEPTH.with(|depth| {
            if depth.get() == 0 {
                while CS_LOCK
                    .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                    .is_err()
                {
                    std::thread::yield_now();
                }
            }
            depth.set(depth.get() + 1);
        });
    }

    unsafe fn release(_restore_state: critical_section::RawRestoreState) {
        CS_DEPTH.with(|depth| {
            depth.set(depth.get() - 1);
            if depth.get() == 0 {
                CS_LOCK.store(false, Ordering::Release);
            }
        });
    }
}

/// Kind of a recorded cache-maintenance operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOpKind {
    WriteBack,
    Invalidate,
}

/// One recorded cache-maintenance operation.
#[derive(Debug, Clone, Copy)]
pub struct CacheOp {
    pub core: CoreId,
    pub kind: CacheOpKind,
    pub addr: usize,
    pub len: usize,
}

struct Cluster {
    core_count: usize,
    /// Backing-memory images keyed by region address.
    backing: Mutex<BTreeMap<usize, Vec<u8>>>,
    /// Chronological maintenance log.
    ops: Mutex<Vec<CacheOp>>,
}

/// Cloneable handle to a simulated multi-core cluster.
///
/// All clones share the same backing memory and maintenance log; which core
/// a call acts as is decided per thread via [`run_as`](Self::run_as).
#[derive(Clone)]
pub struct SimPlatform {
    cluster: Arc<Cluster>,
}

impl SimPlatform {
    /// Creates a cluster of `core_count` cores. The executing thread starts
    /// out as core 0.
    pub fn new(core_count: usize) -> Self {
        assert!(
            (1..=8).contains(&core_count),
            "unsupported cluster size {core_count}"
        );
        Self {
            cluster: Arc::new(Cluster {
                core_count,
                backing: Mutex::new(BTreeMap::new()),
                ops: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Runs `f` with the executing thread's core register set to `core`.
    pub fn run_as<R>(&self, core: CoreId, f: impl FnOnce() -> R) -> R {
        assert!(
            (core.0 as usize) < self.cluster.core_count,
            "{core} outside the cluster"
        );
        let previous = CURRENT_CORE.with(|c| c.replace(core.0));
        let result = f();
        CURRENT_CORE.with(|c| c.set(previous));
        result
    }

    /// Runs `f` inside a critical section; the executing context reports as
    /// non-preemptible for the duration.
    pub fn masked<R>(&self, f: impl FnOnce() -> R) -> R {
        critical_section::with(|_| f())
    }

    /// Chronological log of all maintenance operations so far.
    pub fn ops(&self) -> Vec<CacheOp> {
        self.cluster.ops.lock().unwrap().clone()
    }

    /// Discards the maintenance log.
    pub fn clear_ops(&self) {
        self.cluster.ops.lock().unwrap().clear();
    }

    fn log(&self, kind: CacheOpKind, addr: usize, len: usize) {
        let core = self.core_id();
        tracing::trace!(%core, ?kind, addr, len, "cache maintenance");
        self.cluster.ops.lock().unwrap().push(CacheOp {
            core,
            kind,
            addr,
            len,
        });
    }
}

impl PlatformAdapter for SimPlatform {
    fn platform_name() -> &'static str {
        "sim"
    }

    fn core_id(&self) -> CoreId {
        CoreId(CURRENT_CORE.with(|c| c.get()))
    }

    fn core_count(&self) -> usize {
        self.cluster.core_count
    }
}

impl CacheOps for SimPlatform {
    fn write_back(&self, region: *const u8, len: usize) {
        // Safety: per the CacheOps contract, `region` is valid for `len`
        // bytes of reads for the duration of the call.
        let bytes = unsafe { std::slice::from_raw_parts(region, len) }.to_vec();
        self.cluster
            .backing
            .lock()
            .unwrap()
            .insert(region as usize, bytes);
        self.log(CacheOpKind::WriteBack, region as usize, len);
    }

    fn invalidate(&self, region: *mut u8, len: usize) {
        {
            let backing = self.cluster.backing.lock().unwrap();
            if let Some(image) = backing.get(&(region as usize)) {
                let n = image.len().min(len);
                // Safety: per the CacheOps contract, `region` is valid for
                // `len` bytes of reads and writes. The copy runs only when
                // the bytes differ, which under a correctly followed
                // protocol implies no concurrent reader of the region.
                let current = unsafe { std::slice::from_raw_parts(region as *const u8, n) };
                if current != &image[..n] {
                    unsafe { std::ptr::copy_nonoverlapping(image.as_ptr(), region, n) };
                }
            }
        }
        self.log(CacheOpKind::Invalidate, region as usize, len);
    }
}

impl ExecContext for SimPlatform {
    fn interrupts_masked(&self) -> bool {
        CS_DEPTH.with(|depth| depth.get()) > 0
    }

    fn spin_wait(&self) {
        std::thread::yield_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_register_switches_per_thread() {
        let platform = SimPlatform::new(2);
        assert_eq!(platform.core_id(), CoreId(0));
        platform.run_as(CoreId(1), || {
            assert_eq!(platform.core_id(), CoreId(1));
        });
        assert_eq!(platform.core_id(), CoreId(0));
    }

    #[test]
    #[should_panic(expected = "outside the cluster")]
    fn core_register_rejects_foreign_cores() {
        let platform = SimPlatform::new(2);
        platform.run_as(CoreId(2), || {});
    }

    #[test]
    fn masked_sections_nest() {
        let platform = SimPlatform::new(1);
        assert!(!platform.interrupts_masked());
        platform.masked(|| {
            assert!(platform.interrupts_masked());
            platform.masked(|| assert!(platform.interrupts_masked()));
            assert!(platform.interrupts_masked());
        });
        assert!(!platform.interrupts_masked());
    }

    #[test]
    fn invalidate_restores_written_back_image() {
        let platform = SimPlatform::new(2);
        let mut data = [1u8, 2, 3, 4];
        let addr = data.as_mut_ptr();

        platform.write_back(addr, data.len());
        data = [9, 9, 9, 9];
        platform.invalidate(addr, 4);
        assert_eq!(data, [1, 2, 3, 4]);
    }

    #[test]
    fn invalidate_without_image_is_a_no_op() {
        let platform = SimPlatform::new(2);
        let mut data = [5u8, 6];
        let addr = data.as_mut_ptr();
        platform.invalidate(addr, 2);
        assert_eq!(data, [5, 6]);
    }

    #[test]
    fn maintenance_log_records_core_and_kind() {
        let platform = SimPlatform::new(2);
        let mut data = [0u8; 2];
        let addr = data.as_mut_ptr();

        platform.write_back(addr, 2);
        platform.run_as(CoreId(1), || platform.invalidate(addr, 2));

        let ops = platform.ops();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].kind, CacheOpKind::WriteBack);
        assert_eq!(ops[0].core, CoreId(0));
        assert_eq!(ops[1].kind, CacheOpKind::Invalidate);
        assert_eq!(ops[1].core, CoreId(1));
        assert_eq!(ops[1].addr, addr as usize);
    }
}

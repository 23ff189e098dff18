//! crossflow core
//!
//! The streaming-data and cross-core synchronization substrate of a
//! real-time audio processing pipeline: the mechanism by which sample
//! chunks move between processing stages and between processor cores whose
//! data caches are not kept coherent by hardware.
//!
//! Two tightly coupled pieces:
//!
//! - [`ring::RingBuffer`] - a position-queued circular buffer letting one
//!   producer and one consumer reserve, fill, and commit variable-size
//!   chunks of a fixed-capacity region without copying, including
//!   wrap-around handling, deferred commits, temporary capacity hiding, and
//!   staging-area linearization for decoders.
//! - [`shared::Shared`] / [`shared::SharedRw`] - wrappers implementing the
//!   explicit write-back/invalidate protocol that makes such a buffer (or
//!   any fixed-size object) safe to access from multiple cores, with
//!   detection of unresolvable lock re-entry.
//!
//! No dynamic allocation: buffers borrow their storage from an external
//! allocator, synchronization wrappers embed their control metadata. Every
//! fallible path returns a [`StreamError`] status; nothing panics in
//! release operation.
//!
//! Host-environment services (cache maintenance, core identity,
//! preemptibility queries) are injected through the traits in
//! [`crossflow_platform`]; interrupt-masked snapshot sections come from the
//! `critical-section` crate.

#![cfg_attr(not(feature = "std"), no_std)]

mod error;
pub mod ring;
pub mod shared;

pub use error::{StreamError, StreamResult};
pub use ring::RingBuffer;
pub use shared::{Shared, SharedRw};

// Platform traits are part of the public API surface.
pub use crossflow_platform as platform;

#[cfg(test)]
extern crate std;

/// Process-wide critical-section implementation for the unit-test binary.
/// Adapter crates provide the real one on their targets.
#[cfg(test)]
mod host_critical_section {
    use core::sync::atomic::{AtomicBool, Ordering};
    use std::cell::Cell;

    std::thread_local! {
        static DEPTH: Cell<u32> = const { Cell::new(0) };
    }

    static LOCKED: AtomicBool = AtomicBool::new(false);

    struct HostCriticalSection;
    critical_section::set_impl!(HostCriticalSection);

    unsafe impl critical_section::Impl for HostCriticalSection {
        unsafe fn acquire() -> critical_section::RawRestoreState {
            DEPTH.with(|depth| {
                if depth.get() == 0 {
                    while LOCKED
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
            DEPTH.with(|depth| {
                depth.set(depth.get() - 1);
                if depth.get() == 0 {
                    LOCKED.store(false, Ordering::Release);
                }
            });
        }
    }
}

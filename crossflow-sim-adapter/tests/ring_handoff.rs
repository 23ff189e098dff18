//! Cross-core sample handoff through a synchronized ring buffer
//!
//! A ring buffer whose bookkeeping descriptor is shared through the
//! exclusive coherence wrapper, the way a queue spanning two cores is
//! deployed. The sample region itself lives in coherent host memory,
//! standing in for the hardware-aliased address range the queue allocator
//! reserves for cross-core sample data; only the descriptor state crosses
//! cores through the protocol.

use crossflow_core::{RingBuffer, SharedRw, StreamError};
use crossflow_platform::CoreId;
use crossflow_sim_adapter::SimPlatform;

#[test]
fn producer_and_consumer_on_different_cores() {
    let platform = SimPlatform::new(2);
    let mut samples = [0i16; 16];
    let ring = RingBuffer::new(&mut samples).unwrap();
    let queue = SharedRw::new(ring, platform.clone());

    // producer on core 0
    let written: Vec<i16> = (1..=10).collect();
    {
        let mut guard = queue.lock().unwrap();
        let view = guard.writeable(10).unwrap();
        view.copy_from_slice(&written);
        guard.commit_write(10, true).unwrap();
    }

    // consumer on core 1
    platform.run_as(CoreId(1), || {
        let mut guard = queue.lock().unwrap();
        assert_eq!(guard.data_len(), 10);
        let view = guard.readable(10).unwrap();
        assert_eq!(view, &written[..]);
        guard.commit_read(10, true).unwrap();
    });

    // the consumed space is visible back on core 0
    let guard = queue.lock().unwrap();
    assert_eq!(guard.free_len(), 16);
}

#[test]
fn alternating_chunks_wrap_across_cores() {
    let platform = SimPlatform::new(2);
    let mut samples = [0i16; 8];
    let ring = RingBuffer::new(&mut samples).unwrap();
    let queue = SharedRw::new(ring, platform.clone());

    let mut produced = Vec::new();
    let mut consumed = Vec::new();
    let mut next: i16 = 0;

    for _ in 0..6 {
        platform.run_as(CoreId(0), || {
            let mut guard = queue.lock().unwrap();
            let run = guard.max_writeable().min(5);
            if run > 0 {
                let view = guard.writeable(run).unwrap();
                for slot in view.iter_mut() {
                    *slot = next;
                    produced.push(next);
                    next += 1;
                }
                guard.commit_write(run, true).unwrap();
            }
        });
        platform.run_as(CoreId(1), || {
            let mut guard = queue.lock().unwrap();
            let run = guard.max_readable().min(3);
            if run > 0 {
                let view = guard.readable(run).unwrap();
                consumed.extend_from_slice(view);
                guard.commit_read(run, true).unwrap();
            }
        });
    }

    platform.run_as(CoreId(1), || {
        let mut guard = queue.lock().unwrap();
        while !guard.is_empty() {
            let run = guard.max_readable();
            let view = guard.readable(run).unwrap();
            consumed.extend_from_slice(view);
            guard.commit_read(run, true).unwrap();
        }
    });

    assert_eq!(consumed, produced);
}

/// Reservation conflicts surface identically through the wrapper.
#[test]
fn reservation_conflicts_cross_cores() {
    let platform = SimPlatform::new(2);
    let mut samples = [0i16; 8];
    let ring = RingBuffer::new(&mut samples).unwrap();
    let queue = SharedRw::new(ring, platform.clone());

    {
        let mut guard = queue.lock().unwrap();
        let _ = guard.writeable(4).unwrap();
        // the reservation outlives the lock release
    }

    platform.run_as(CoreId(1), || {
        let mut guard = queue.lock().unwrap();
        assert_eq!(guard.writeable(2).unwrap_err(), StreamError::Busy);
        // the reservation survived the handoff; completing it unblocks
        guard.commit_write(4, true).unwrap();
        assert_eq!(guard.data_len(), 4);
    });
}

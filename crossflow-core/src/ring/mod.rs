//! Position-queued ring buffers for zero-copy streaming
//!
//! A [`RingBuffer`] moves variable-size chunks of samples between one
//! producer and one consumer without copying: each side reserves a
//! contiguous view into the backing region, fills or drains it in place, and
//! commits the transfer afterwards. Reservations may be committed in several
//! steps; the final commit releases whatever part of the reservation went
//! unused.
//!
//! # Capacity hiding
//!
//! When a write reservation does not fit between the write position and the
//! physical end of the region, but does fit in the consumed space at the
//! region's head, the buffer temporarily *hides* its tail: the logical
//! capacity shrinks to the current write position and the reservation
//! restarts at index zero. The hidden tail reappears the moment the read
//! position wraps past zero. Consumers never trigger hiding; their
//! reservations are clipped to the natural contiguous run.
//!
//! # Staging region and unwinding
//!
//! A buffer may be constructed with a staging prefix carved out of the same
//! backing region ([`RingBuffer::with_staging`]). [`RingBuffer::unwind`]
//! uses it to hand decoders one linear view of data that straddles the wrap
//! point, by copying the tail-crossing portion in front of the region head.
//! Keeping the staging area a prefix of the backing slice makes the two
//! spans contiguous by construction.
//!
//! # Concurrency
//!
//! One producer and one consumer per buffer instance, each driving only its
//! own side. Derived multi-field queries snapshot their state inside a
//! critical section so a producer or consumer running at interrupt level
//! cannot tear them. Sharing a buffer *across cores* additionally requires
//! the coherence wrappers from [`crate::shared`], or placement in a
//! hardware-coherent address range by the queue allocator.

mod position;

pub use position::Position;

use crate::error::{StreamError, StreamResult};

/// Per-buffer operation counters, compiled in with the `debug-counters`
/// feature.
#[cfg(feature = "debug-counters")]
#[derive(Debug, Default, Clone, Copy)]
pub struct RingCounters {
    pub write_commits: u32,
    pub read_commits: u32,
    pub data_received: u32,
    pub data_consumed: u32,
    pub writeable_reservations: u32,
    pub readable_reservations: u32,
    pub write_queued_total: u32,
    pub read_queued_total: u32,
    pub write_displacements: u32,
    pub read_displacements: u32,
}

macro_rules! bump {
    ($self:ident, $field:ident, $n:expr) => {
        #[cfg(feature = "debug-counters")]
        {
            $self.counters.$field = $self.counters.$field.wrapping_add($n as u32);
        }
    };
}

/// Position-queued circular buffer over a borrowed storage region.
///
/// The buffer does not own its storage; it borrows the region from an
/// external allocator and uses it exclusively for its lifetime. Element
/// counts, not bytes, everywhere.
#[derive(Debug)]
pub struct RingBuffer<'a, T> {
    region: &'a mut [T],
    /// Start of the ring storage within `region`; everything before it is
    /// the staging area used by `unwind`.
    origin: usize,
    /// Committed, unread elements.
    data_len: usize,
    /// Capacity currently visible to both sides; equals `capacity()` except
    /// while the tail is hidden.
    logical_len: usize,
    read: Position,
    write: Position,
    #[cfg(feature = "debug-counters")]
    counters: RingCounters,
}

impl<'a, T: Copy> RingBuffer<'a, T> {
    /// Creates a buffer over `region` with no staging area.
    pub fn new(region: &'a mut [T]) -> StreamResult<Self> {
        Self::with_layout(region, 0, 0, 0)
    }

    /// Creates a buffer whose first `staging_len` elements form the staging
    /// area for [`unwind`](Self::unwind); the remainder is the ring storage.
    pub fn with_staging(region: &'a mut [T], staging_len: usize) -> StreamResult<Self> {
        if staging_len == 0 || staging_len >= region.len() {
            return Err(StreamError::InvalidParameter);
        }
        Self::with_layout(region, staging_len, 0, 0)
    }

    /// Reattaches to a region whose contents survived a restart or
    /// low-power transition: `read_pos` and `data_len` describe the
    /// persisted occupancy.
    pub fn restore(region: &'a mut [T], read_pos: usize, data_len: usize) -> StreamResult<Self> {
        Self::with_layout(region, 0, read_pos, data_len)
    }

    fn with_layout(
        region: &'a mut [T],
        origin: usize,
        read_pos: usize,
        data_len: usize,
    ) -> StreamResult<Self> {
        let capacity = region.len() - origin;
        if capacity == 0 || data_len > capacity {
            return Err(StreamError::InvalidParameter);
        }
        let mut buffer = Self {
            region,
            origin,
            data_len,
            logical_len: capacity,
            read: Position::new(),
            write: Position::new(),
            #[cfg(feature = "debug-counters")]
            counters: RingCounters::default(),
        };
        buffer.read.safe_set(read_pos, capacity)?;
        buffer.write.safe_set((read_pos + data_len) % capacity, capacity)?;
        Ok(buffer)
    }

    /// Total physical capacity. May differ from
    /// [`logical_capacity`](Self::logical_capacity) while the tail is hidden.
    pub fn capacity(&self) -> usize {
        self.region.len() - self.origin
    }

    /// Capacity currently visible to producer and consumer.
    pub fn logical_capacity(&self) -> usize {
        self.logical_len
    }

    /// Size of the staging area, zero when none was configured.
    pub fn staging_capacity(&self) -> usize {
        self.origin
    }

    /// Committed elements available for the next read operation.
    pub fn data_len(&self) -> usize {
        critical_section::with(|_| self.data_len - self.read.queued_len())
    }

    /// Free elements: logical capacity minus committed data and the
    /// outstanding write reservation.
    pub fn free_len(&self) -> usize {
        critical_section::with(|_| {
            self.logical_len - (self.data_len + self.write.queued_len())
        })
    }

    pub fn is_full(&self) -> bool {
        self.logical_len == self.data_len()
    }

    pub fn is_empty(&self) -> bool {
        self.data_len() == 0
    }

    /// True when the committed data straddles the wrap point.
    pub fn is_wrapped(&self) -> bool {
        self.read.committed() + self.data_len() > self.logical_len
    }

    /// Longest contiguous run available to a read reservation.
    pub fn max_readable(&self) -> usize {
        critical_section::with(|_| {
            let available = self.data_len - self.read.queued_len();
            (self.logical_len - self.read.queued()).min(available)
        })
    }

    /// Longest contiguous run available to a write reservation at the tail.
    /// Does not account for relocating the reservation to the region head.
    pub fn max_writeable(&self) -> usize {
        critical_section::with(|_| {
            let free = self.logical_len - (self.data_len + self.write.queued_len());
            (self.logical_len - self.write.queued()).min(free)
        })
    }

    /// Committed read index.
    pub fn read_position(&self) -> usize {
        self.read.committed()
    }

    /// Committed write index.
    pub fn write_position(&self) -> usize {
        self.write.committed()
    }

    /// Elements covered by the outstanding read reservation.
    pub fn queued_read_len(&self) -> usize {
        self.read.queued_len()
    }

    /// Elements covered by the outstanding write reservation.
    pub fn queued_write_len(&self) -> usize {
        self.write.queued_len()
    }

    /// Address of the committed read index, for DMA drivers that mirror
    /// buffer positions into hardware registers. Read-only for the holder.
    pub fn read_position_addr(&self) -> *const usize {
        self.read.committed_addr()
    }

    /// Address of the committed write index. See
    /// [`read_position_addr`](Self::read_position_addr).
    pub fn write_position_addr(&self) -> *const usize {
        self.write.committed_addr()
    }

    #[cfg(feature = "debug-counters")]
    pub fn counters(&self) -> &RingCounters {
        &self.counters
    }

    /// Reserves a contiguous writable view of exactly `len` elements, or of
    /// the longest contiguous run when `len == 0`.
    ///
    /// When the tail run is too short but the consumed space at the region
    /// head fits the request, the tail is hidden (logical capacity shrinks
    /// to the current write position) and the reservation restarts at index
    /// zero. Fails `Busy` while another write reservation is outstanding,
    /// `OutOfResources` when neither tail nor head can hold the request.
    pub fn writeable(&mut self, len: usize) -> StreamResult<&mut [T]> {
        if self.write.has_queued() {
            return Err(StreamError::Busy);
        }
        let len = if len == 0 {
            let max = self.max_writeable();
            if max == 0 {
                return Err(StreamError::OutOfResources {
                    requested: 0,
                    available: 0,
                });
            }
            max
        } else {
            len
        };
        let free = self.free_len();
        if free < len {
            return Err(StreamError::OutOfResources {
                requested: len,
                available: free,
            });
        }
        let start = if self.write.queued() + len <= self.logical_len {
            let start = self.write.queued();
            critical_section::with(|_| self.write.advance_queued(len, self.logical_len));
            start
        } else if len <= self.read.committed() {
            // Hide the tail and restart the reservation at the head; the
            // head room is bounded by the committed read index so the
            // reservation cannot race ahead of unread data.
            critical_section::with(|_| {
                self.logical_len = self.write.queued();
                self.write.restart_queued(len);
            });
            0
        } else {
            let tail_run = self.logical_len - self.write.queued();
            return Err(StreamError::OutOfResources {
                requested: len,
                available: tail_run.max(self.read.committed()),
            });
        };
        bump!(self, writeable_reservations, 1);
        bump!(self, write_queued_total, len);
        let origin = self.origin;
        Ok(&mut self.region[origin + start..origin + start + len])
    }

    /// Reserves a contiguous readable view of exactly `len` elements, or of
    /// the longest contiguous run when `len == 0`.
    ///
    /// Reads never relocate or shrink capacity; a request longer than the
    /// natural contiguous run fails `OutOfResources` (see
    /// [`unwind`](Self::unwind) for linearizing wrapped data).
    pub fn readable(&mut self, len: usize) -> StreamResult<&[T]> {
        if self.read.has_queued() {
            return Err(StreamError::Busy);
        }
        let max = self.max_readable();
        let len = if len == 0 {
            if max == 0 {
                return Err(StreamError::OutOfResources {
                    requested: 0,
                    available: 0,
                });
            }
            max
        } else {
            if len > max {
                return Err(StreamError::OutOfResources {
                    requested: len,
                    available: max,
                });
            }
            len
        };
        let start = self.read.queued();
        critical_section::with(|_| self.read.advance_queued(len, self.logical_len));
        bump!(self, readable_reservations, 1);
        bump!(self, read_queued_total, len);
        let origin = self.origin;
        Ok(&self.region[origin + start..origin + start + len])
    }

    /// Commits `len` elements of the outstanding write reservation as
    /// durable data. With `final_commit`, the rest of the reservation is
    /// discarded.
    pub fn commit_write(&mut self, len: usize, final_commit: bool) -> StreamResult<()> {
        if len > self.write.queued_len() {
            return Err(StreamError::InvalidParameter);
        }
        critical_section::with(|_| {
            if len + self.data_len > self.logical_len {
                return Err(StreamError::Overrun {
                    requested: len,
                    capacity: self.logical_len - self.data_len,
                });
            }
            self.write.commit_queued(len, self.logical_len);
            self.data_len += len;
            if final_commit {
                self.write.reset_queued();
            }
            Ok(())
        })?;
        bump!(self, write_commits, 1);
        bump!(self, data_received, len);
        Ok(())
    }

    /// Commits `len` elements of the outstanding read reservation as
    /// consumed. With `final_commit`, the rest of the reservation is
    /// discarded.
    ///
    /// A commit that wraps the read index past zero restores any hidden
    /// tail: the logical capacity returns to the physical one.
    pub fn commit_read(&mut self, len: usize, final_commit: bool) -> StreamResult<()> {
        critical_section::with(|_| {
            if len > self.data_len {
                return Err(StreamError::Underrun {
                    requested: len,
                    available: self.data_len,
                });
            }
            if len > self.read.queued_len() {
                return Err(StreamError::InvalidParameter);
            }
            let wrapped = self.read.commit_queued(len, self.logical_len);
            self.data_len -= len;
            if wrapped && self.logical_len < self.capacity() {
                self.logical_len = self.capacity();
            }
            if final_commit {
                self.read.reset_queued();
            }
            Ok(())
        })?;
        bump!(self, read_commits, 1);
        bump!(self, data_consumed, len);
        Ok(())
    }

    /// Appends a single element. Fails `OutOfResources` when full and
    /// `Busy` while a bulk write reservation is outstanding.
    pub fn push(&mut self, element: T) -> StreamResult<()> {
        if self.is_full() {
            return Err(StreamError::OutOfResources {
                requested: 1,
                available: 0,
            });
        }
        if self.write.has_queued() {
            return Err(StreamError::Busy);
        }
        let index = self.write.advance(1, self.logical_len);
        self.region[self.origin + index] = element;
        self.data_len += 1;
        Ok(())
    }

    /// Removes and returns the oldest element. Fails `OutOfResources` when
    /// empty and `Busy` while a bulk read reservation is outstanding.
    pub fn pop(&mut self) -> StreamResult<T> {
        if self.is_empty() {
            return Err(StreamError::OutOfResources {
                requested: 1,
                available: 0,
            });
        }
        if self.read.has_queued() {
            return Err(StreamError::Busy);
        }
        let index = self.read.advance(1, self.logical_len);
        let element = self.region[self.origin + index];
        if self.read.committed() == 0 && self.logical_len < self.capacity() {
            // read side wrapped, un-hide the tail
            self.logical_len = self.capacity();
        }
        self.data_len -= 1;
        Ok(element)
    }

    /// Catches the read bookkeeping up with data an external agent (a DMA
    /// engine) already consumed, given the new hardware read index.
    ///
    /// A zero delta means one full lap (the entire buffer was consumed),
    /// not a no-op. Fails `Busy` while the tail is hidden: the pending
    /// relocation must resolve before positions may be rewritten.
    pub fn displace_read(&mut self, new_index: usize) -> StreamResult<()> {
        let capacity = self.capacity();
        if self.logical_len != capacity {
            return Err(StreamError::Busy);
        }
        let delta = (new_index + capacity - self.read.committed()) % capacity;
        let consumed = if delta == 0 { capacity } else { delta };
        if consumed > self.data_len {
            return Err(StreamError::Underrun {
                requested: consumed,
                available: self.data_len,
            });
        }
        self.read.safe_set(new_index, capacity)?;
        self.data_len -= consumed;
        bump!(self, read_displacements, 1);
        bump!(self, data_consumed, consumed);
        Ok(())
    }

    /// Catches the write bookkeeping up with data an external agent already
    /// produced, given the new hardware write index.
    ///
    /// A zero delta means one full lap (the entire buffer was filled).
    /// Fails `Busy` while the tail is hidden.
    pub fn displace_write(&mut self, new_index: usize) -> StreamResult<()> {
        let capacity = self.capacity();
        if self.logical_len != capacity {
            return Err(StreamError::Busy);
        }
        let delta = (new_index + capacity - self.write.committed()) % capacity;
        let incoming = if delta == 0 { capacity } else { delta };
        if incoming + self.data_len > capacity {
            return Err(StreamError::Overrun {
                requested: incoming,
                capacity: capacity - self.data_len,
            });
        }
        self.write.safe_set(new_index, capacity)?;
        self.data_len += incoming;
        bump!(self, write_displacements, 1);
        bump!(self, data_received, incoming);
        Ok(())
    }

    /// Marks `len` elements starting at the committed write position as
    /// durable data without a reservation; a relative form of
    /// [`displace_write`](Self::displace_write).
    pub fn insert(&mut self, len: usize) -> StreamResult<()> {
        self.displace_write((self.write.committed() + len) % self.capacity())
    }

    /// Produces one linear view of up to `max_len` committed elements even
    /// when they straddle the wrap point, by copying the tail-crossing
    /// portion into the staging area directly in front of the region head.
    /// `max_len == 0` requests all committed data.
    ///
    /// Delegates to [`readable`](Self::readable) when the data is not
    /// wrapped or the request fits the natural contiguous run. Fails `Busy`
    /// while a read reservation is outstanding, `InvalidRequest` without a
    /// staging area, `OutOfResources` when the tail-crossing portion
    /// exceeds the staging capacity. The view counts as a read reservation
    /// and is consumed through [`commit_read`](Self::commit_read).
    pub fn unwind(&mut self, max_len: usize) -> StreamResult<&[T]> {
        if self.read.has_queued() {
            return Err(StreamError::Busy);
        }
        let available = self.data_len();
        let max_len = if max_len == 0 {
            available
        } else {
            max_len.min(available)
        };
        let contiguous = self.max_readable();
        if !self.is_wrapped() || max_len <= contiguous {
            return self.readable(max_len.min(contiguous));
        }
        if self.origin == 0 {
            return Err(StreamError::InvalidRequest);
        }
        // tail-crossing portion: committed read index up to the logical end
        let copy_len = contiguous;
        if copy_len > self.origin {
            return Err(StreamError::OutOfResources {
                requested: copy_len,
                available: self.origin,
            });
        }
        // place the copy at the end of the staging area so it lines up with
        // the region head
        let dst = self.origin - copy_len;
        let src = self.origin + self.read.committed();
        self.region.copy_within(src..src + copy_len, dst);
        critical_section::with(|_| self.read.advance_queued(max_len, self.logical_len));
        bump!(self, readable_reservations, 1);
        bump!(self, read_queued_total, max_len);
        Ok(&self.region[dst..dst + max_len])
    }

    /// Returns the buffer to its freshly constructed state. Outstanding
    /// reservations are discarded.
    pub fn reset(&mut self) {
        self.read.reset();
        self.write.reset();
        self.data_len = 0;
        self.logical_len = self.capacity();
    }

    /// Resets and then adopts a persisted occupancy, as if constructed via
    /// [`restore`](Self::restore) at `read_pos` with `data_len` elements.
    pub fn reinitialize(&mut self, read_pos: usize, data_len: usize) -> StreamResult<()> {
        let capacity = self.capacity();
        if data_len > capacity {
            return Err(StreamError::InvalidParameter);
        }
        self.reset();
        self.read.safe_set(read_pos, capacity)?;
        self.write.safe_set((read_pos + data_len) % capacity, capacity)?;
        self.data_len = data_len;
        Ok(())
    }

    /// Rebinds the buffer to a new region. All positions reset and the
    /// staging area is detached.
    pub fn reconstruct(&mut self, region: &'a mut [T]) -> StreamResult<()> {
        if region.is_empty() {
            return Err(StreamError::InvalidParameter);
        }
        self.region = region;
        self.origin = 0;
        self.reset();
        Ok(())
    }
}

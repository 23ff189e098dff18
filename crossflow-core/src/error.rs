//! Error handling for crossflow operations
//!
//! One unified status type covers every fallible operation in the substrate:
//! buffer reservations and commits, position displacement, and the
//! cross-core synchronization protocol. Operations return status values, not
//! panics; the only condition that is not locally recoverable is the
//! cross-core deadlock, which is surfaced as [`StreamError::WouldDeadlock`]
//! and left to the host to escalate.
//!
//! # Error Code System
//!
//! Each error has an associated numeric code for embedded environments where
//! string formatting is not available or optimal. Error codes are organized
//! by category:
//!
//! - **Capacity** (0x2000-0x2FFF): no space, overrun/underrun violations
//! - **Reservation** (0x3000-0x3FFF): conflicting in-flight reservations
//! - **Usage** (0x4000-0x4FFF): invalid parameters or requests
//! - **Protocol** (0x5000-0x5FFF): cross-core synchronization violations
//!
//! # Platform-Specific Display Behavior
//!
//! - **std mode**: rich error messages via thiserror (e.g. "out of
//!   resources: requested 8, available 3")
//! - **no_std mode**: compact format with error codes (e.g. "Error 0x2001:
//!   out of resources")

/// Unified status type for all crossflow operations
///
/// Capacity and protocol variants carry small numeric payloads only, so the
/// type stays cheap to return by value on embedded targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(thiserror::Error))]
pub enum StreamError {
    /// Not enough free space or contiguous run to satisfy a reservation
    #[cfg_attr(
        feature = "std",
        error("out of resources: requested {requested}, available {available}")
    )]
    OutOfResources {
        /// Element count the caller asked for
        requested: usize,
        /// Elements actually available for the operation
        available: usize,
    },

    /// A commit or displacement would exceed the writable capacity
    #[cfg_attr(
        feature = "std",
        error("overrun: {requested} elements do not fit {capacity}")
    )]
    Overrun {
        /// Element count of the offending transfer
        requested: usize,
        /// Capacity the transfer was checked against
        capacity: usize,
    },

    /// A commit or displacement would consume more data than is committed
    #[cfg_attr(
        feature = "std",
        error("underrun: {requested} elements requested, {available} committed")
    )]
    Underrun {
        /// Element count of the offending transfer
        requested: usize,
        /// Committed elements actually present
        available: usize,
    },

    /// The operation conflicts with an outstanding reservation, or a
    /// capacity shrink is still pending on the read side
    #[cfg_attr(feature = "std", error("busy: conflicting reservation outstanding"))]
    Busy,

    /// A parameter is outside its valid range
    #[cfg_attr(feature = "std", error("invalid parameter"))]
    InvalidParameter,

    /// The operation is not available in the buffer's current configuration
    /// (e.g. unwinding without a staging region)
    #[cfg_attr(feature = "std", error("invalid request"))]
    InvalidRequest,

    /// A referenced object does not exist
    #[cfg_attr(feature = "std", error("not found"))]
    NotFound,

    /// Acquiring the lock can never succeed: it is already held by this core
    /// and the current context cannot be preempted to release it
    #[cfg_attr(
        feature = "std",
        error("would deadlock: core {core} re-entered its own lock (owner {owner})")
    )]
    WouldDeadlock {
        /// Core that attempted the acquisition
        core: u8,
        /// Core currently holding the lock
        owner: u8,
    },
}

#[cfg(not(feature = "std"))]
impl core::fmt::Display for StreamError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        // Compact form for embedded environments: code plus brief description
        let message = match self {
            StreamError::OutOfResources { .. } => "out of resources",
            StreamError::Overrun { .. } => "overrun",
            StreamError::Underrun { .. } => "underrun",
            StreamError::Busy => "busy",
            StreamError::InvalidParameter => "invalid parameter",
            StreamError::InvalidRequest => "invalid request",
            StreamError::NotFound => "not found",
            StreamError::WouldDeadlock { .. } => "would deadlock",
        };
        write!(f, "Error 0x{:04X}: {}", self.error_code(), message)
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for StreamError {
    fn format(&self, f: defmt::Formatter) {
        match self {
            Self::OutOfResources {
                requested,
                available,
            } => defmt::write!(f, "OutOfResources({}/{})", requested, available),
            Self::Overrun {
                requested,
                capacity,
            } => defmt::write!(f, "Overrun({}/{})", requested, capacity),
            Self::Underrun {
                requested,
                available,
            } => defmt::write!(f, "Underrun({}/{})", requested, available),
            Self::Busy => defmt::write!(f, "Busy"),
            Self::InvalidParameter => defmt::write!(f, "InvalidParameter"),
            Self::InvalidRequest => defmt::write!(f, "InvalidRequest"),
            Self::NotFound => defmt::write!(f, "NotFound"),
            Self::WouldDeadlock { core, owner } => {
                defmt::write!(f, "WouldDeadlock(core{} vs core{})", core, owner)
            }
        }
    }
}

impl StreamError {
    /// Returns a numeric error code for embedded environments
    ///
    /// Codes are stable and organized by category range, so hosts can branch
    /// on whole categories without matching individual variants.
    pub const fn error_code(&self) -> u32 {
        match self {
            // Capacity errors: 0x2000-0x2FFF
            StreamError::OutOfResources { .. } => 0x2001,
            StreamError::Overrun { .. } => 0x2002,
            StreamError::Underrun { .. } => 0x2003,

            // Reservation conflicts: 0x3000-0x3FFF
            StreamError::Busy => 0x3001,

            // Usage errors: 0x4000-0x4FFF
            StreamError::InvalidParameter => 0x4001,
            StreamError::InvalidRequest => 0x4002,
            StreamError::NotFound => 0x4003,

            // Cross-core protocol violations: 0x5000-0x5FFF
            StreamError::WouldDeadlock { .. } => 0x5001,
        }
    }

    /// Returns the error category based on the error code
    pub const fn error_category(&self) -> u32 {
        self.error_code() & 0xF000
    }

    /// Returns true if this is a capacity-related error
    pub const fn is_capacity_error(&self) -> bool {
        self.error_category() == 0x2000
    }

    /// Returns true if this is a reservation-conflict error
    pub const fn is_reservation_error(&self) -> bool {
        self.error_category() == 0x3000
    }

    /// Returns true if this is a usage error
    pub const fn is_usage_error(&self) -> bool {
        self.error_category() == 0x4000
    }

    /// Returns true if this is a cross-core protocol violation
    ///
    /// Protocol violations are not locally recoverable; the host decides
    /// whether to tear down the owning pipeline or halt.
    pub const fn is_protocol_error(&self) -> bool {
        self.error_category() == 0x5000
    }
}

/// Type alias for Results using StreamError
pub type StreamResult<T> = Result<T, StreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_size_constraint() {
        // StreamError is returned by value on every fallible path; keep it
        // within a few machine words
        let size = core::mem::size_of::<StreamError>();
        assert!(
            size <= 24,
            "StreamError size ({} bytes) exceeds return-by-value budget",
            size
        );
    }

    #[test]
    fn error_codes_match_categories() {
        let oor = StreamError::OutOfResources {
            requested: 8,
            available: 3,
        };
        assert_eq!(oor.error_code(), 0x2001);
        assert_eq!(oor.error_category(), 0x2000);
        assert!(oor.is_capacity_error());

        assert!(StreamError::Overrun {
            requested: 1,
            capacity: 0
        }
        .is_capacity_error());
        assert!(StreamError::Underrun {
            requested: 1,
            available: 0
        }
        .is_capacity_error());

        assert!(StreamError::Busy.is_reservation_error());
        assert!(StreamError::InvalidParameter.is_usage_error());
        assert!(StreamError::InvalidRequest.is_usage_error());
        assert!(StreamError::NotFound.is_usage_error());

        let deadlock = StreamError::WouldDeadlock { core: 0, owner: 0 };
        assert_eq!(deadlock.error_code(), 0x5001);
        assert!(deadlock.is_protocol_error());
        assert!(!deadlock.is_capacity_error());
    }

    #[test]
    fn error_code_uniqueness() {
        let errors = [
            StreamError::OutOfResources {
                requested: 0,
                available: 0,
            },
            StreamError::Overrun {
                requested: 0,
                capacity: 0,
            },
            StreamError::Underrun {
                requested: 0,
                available: 0,
            },
            StreamError::Busy,
            StreamError::InvalidParameter,
            StreamError::InvalidRequest,
            StreamError::NotFound,
            StreamError::WouldDeadlock { core: 0, owner: 0 },
        ];

        for (i, a) in errors.iter().enumerate() {
            for b in errors.iter().skip(i + 1) {
                assert_ne!(
                    a.error_code(),
                    b.error_code(),
                    "duplicate error code 0x{:04X}",
                    a.error_code()
                );
            }
        }
    }

    #[cfg(feature = "std")]
    #[test]
    fn std_display_formatting() {
        let error = StreamError::OutOfResources {
            requested: 8,
            available: 3,
        };
        let display_msg = format!("{}", error);
        assert!(display_msg.contains("requested 8"));
        assert!(display_msg.contains("available 3"));

        // StreamError implements std::error::Error
        let _: &dyn std::error::Error = &error;
    }

    #[cfg(not(feature = "std"))]
    #[test]
    fn no_std_display_with_codes() {
        use core::fmt::Write;

        let mut buffer = heapless::String::<64>::new();
        write!(
            &mut buffer,
            "{}",
            StreamError::OutOfResources {
                requested: 8,
                available: 3
            }
        )
        .unwrap();
        assert_eq!(buffer.as_str(), "Error 0x2001: out of resources");

        buffer.clear();
        write!(&mut buffer, "{}", StreamError::Busy).unwrap();
        assert_eq!(buffer.as_str(), "Error 0x3001: busy");
    }
}

//! # Ember Error Handling
//!
//! Error types for operations that can fail for reasons outside the
//! allocator's control.
//!
//! Running out of space in a heap, ring or free list is not an error:
//! allocators report it with `None` or a null allocation and the caller
//! decides whether to grow, wait or drop work. [`Error`] is reserved for
//! platform failures (heap/buffer creation, submission) and bad
//! configuration.

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// Ember Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// Ember unified error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // GENERIC ERRORS
    // =========================================================================
    /// Invalid parameter provided
    InvalidParameter,
    /// Resource not found
    NotFound,
    /// Operation not supported by the backend
    NotSupported,

    // =========================================================================
    // DEVICE ERRORS
    // =========================================================================
    /// The backend failed to create a descriptor heap
    HeapCreationFailed,
    /// The backend failed to create a buffer
    BufferCreationFailed,
    /// The device ran out of memory
    OutOfDeviceMemory,
    /// The device was removed or reset
    DeviceRemoved,

    // =========================================================================
    // QUEUE ERRORS
    // =========================================================================
    /// Queue index out of range
    InvalidQueue,
    /// Command submission failed
    SubmissionFailed,

    // =========================================================================
    // MEMORY ERRORS
    // =========================================================================
    /// A CPU mapping was required but the buffer is not CPU accessible
    MappingFailed,
    /// Requested size can never be satisfied
    AllocationTooLarge,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Generic
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::NotFound => write!(f, "resource not found"),
            Self::NotSupported => write!(f, "operation not supported"),

            // Device
            Self::HeapCreationFailed => write!(f, "descriptor heap creation failed"),
            Self::BufferCreationFailed => write!(f, "buffer creation failed"),
            Self::OutOfDeviceMemory => write!(f, "out of device memory"),
            Self::DeviceRemoved => write!(f, "device removed"),

            // Queue
            Self::InvalidQueue => write!(f, "invalid command queue index"),
            Self::SubmissionFailed => write!(f, "command submission failed"),

            // Memory
            Self::MappingFailed => write!(f, "buffer is not CPU accessible"),
            Self::AllocationTooLarge => write!(f, "allocation too large"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_display_messages() {
        assert_eq!(Error::OutOfDeviceMemory.to_string(), "out of device memory");
        assert_eq!(Error::InvalidQueue.to_string(), "invalid command queue index");
    }
}

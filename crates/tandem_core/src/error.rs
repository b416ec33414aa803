//! # Resource Error Types
//!
//! Two layers:
//! - [`DeviceError`]: what a [`DeviceBackend`](crate::device::DeviceBackend) reports.
//! - [`ResourceError`]: what a [`DualBuffer`](crate::DualBuffer) reports, with the
//!   operation, buffer size, direction and role attached.

use thiserror::Error;

use crate::buffer::{Direction, Role};
use crate::device::{DeviceId, DevicePtr, GraphicsBufferId};

/// Errors reported by a device backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// Device memory exhausted.
    #[error("out of device memory: requested {requested} bytes, {available} available")]
    OutOfMemory {
        /// Bytes requested.
        requested: usize,
        /// Bytes still available on the device.
        available: usize,
    },

    /// Host memory could not be reserved.
    #[error("host allocation of {bytes} bytes failed")]
    HostAllocation {
        /// Bytes requested.
        bytes: usize,
    },

    /// Device index outside the backend's device range.
    #[error("unknown device {0}")]
    UnknownDevice(DeviceId),

    /// Address not owned by any live allocation or mapping.
    #[error("invalid device pointer {0}")]
    InvalidPointer(DevicePtr),

    /// Address belongs to a device other than the calling thread's current one.
    #[error("pointer {ptr} belongs to device {owner}, current device is {current}")]
    WrongContext {
        /// Address accessed.
        ptr: DevicePtr,
        /// Device owning the address.
        owner: DeviceId,
        /// Device selected on the calling thread.
        current: DeviceId,
    },

    /// Access past the end of an allocation.
    #[error("access of {len} bytes at offset {offset} exceeds allocation of {size} bytes")]
    OutOfBounds {
        /// Byte offset of the access.
        offset: usize,
        /// Length of the access in bytes.
        len: usize,
        /// Size of the allocation in bytes.
        size: usize,
    },

    /// Graphics buffer object does not exist.
    #[error("unknown graphics buffer {0}")]
    UnknownGraphicsBuffer(GraphicsBufferId),

    /// Graphics buffer is not registered for device access.
    #[error("graphics buffer {0} is not registered")]
    NotRegistered(GraphicsBufferId),

    /// Graphics buffer is already registered.
    #[error("graphics buffer {0} is already registered")]
    AlreadyRegistered(GraphicsBufferId),

    /// Graphics buffer is still registered and cannot be deleted.
    #[error("graphics buffer {0} is still registered")]
    StillRegistered(GraphicsBufferId),

    /// Graphics buffer is already mapped for device access.
    #[error("graphics buffer {0} is already mapped")]
    AlreadyMapped(GraphicsBufferId),

    /// Graphics buffer is not mapped.
    #[error("graphics buffer {0} is not mapped")]
    NotMapped(GraphicsBufferId),

    /// Graphics buffer is mapped and owned by the device side.
    #[error("graphics buffer {0} is mapped for device access")]
    StillMapped(GraphicsBufferId),

    /// Failure injected by a test backend.
    #[error("injected {0} failure")]
    Injected(&'static str),

    /// Failure reported by the underlying API.
    #[error("backend failure: {0}")]
    Backend(String),
}

/// Result type for backend operations.
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Misuse of the map/unmap protocol.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InteropFault {
    /// Mapped twice without an intervening unmap.
    #[error("buffer object is already mapped")]
    AlreadyMapped,

    /// Unmapped twice, or device pointer requested while unmapped.
    #[error("buffer object is not mapped")]
    NotMapped,

    /// The backend rejected the map or unmap.
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Programmer errors against the buffer lifecycle.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageFault {
    /// Buffer used before `alloc` or after `free`.
    #[error("buffer is not allocated")]
    NotAllocated,

    /// `alloc` called on an allocated buffer.
    #[error("buffer is already allocated")]
    AlreadyAllocated,

    /// `alloc` with zero elements.
    #[error("buffer size must be at least one element")]
    EmptyBuffer,

    /// Element count times element size overflows `usize`.
    #[error("{elements} elements overflow the addressable size")]
    SizeOverflow {
        /// Requested element count.
        elements: usize,
    },

    /// `swap` on a single-buffered instance.
    #[error("swap requires a double-buffered instance")]
    SwapSingleBuffered,

    /// Host data of the wrong length.
    #[error("expected {expected} host elements, got {actual}")]
    HostLengthMismatch {
        /// Buffer length in elements.
        expected: usize,
        /// Length supplied.
        actual: usize,
    },

    /// Element range outside the buffer.
    #[error("range {start}..{start}+{count} is outside a buffer of {len} elements")]
    RangeOutOfBounds {
        /// First element.
        start: usize,
        /// Element count.
        count: usize,
        /// Buffer length in elements.
        len: usize,
    },
}

/// Coarse classification used by callers to choose between retry and abort.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No buffer means no progress.
    Allocation,
    /// Map/unmap protocol violated.
    Interop,
    /// Lifecycle misuse.
    Usage,
    /// Copy failed, contents untouched.
    Transfer,
}

/// Errors surfaced by [`DualBuffer`](crate::DualBuffer) operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    /// Host, device or graphics allocation failed (or its release did).
    #[error("allocation error in {op}: {elements} elements ({bytes} bytes): {source}")]
    Allocation {
        /// Failing operation.
        op: &'static str,
        /// Buffer size in elements.
        elements: usize,
        /// Buffer size in bytes.
        bytes: usize,
        /// Backend cause.
        source: DeviceError,
    },

    /// Map/unmap misuse or device access while unmapped.
    #[error("interop error in {op} on slot {slot} ({role} role): {fault}")]
    Interop {
        /// Failing operation.
        op: &'static str,
        /// Device slot index (0 or 1).
        slot: usize,
        /// Role the slot held at the time.
        role: Role,
        /// What went wrong.
        #[source]
        fault: InteropFault,
    },

    /// Lifecycle misuse.
    #[error("usage error in {op}: {fault}")]
    Usage {
        /// Failing operation.
        op: &'static str,
        /// What went wrong.
        fault: UsageFault,
    },

    /// Host/device copy failed. Retryable.
    #[error(
        "transfer error in {op}: {direction} of {count} elements at {start} \
         (buffer of {len} elements, {role} role): {source}"
    )]
    Transfer {
        /// Failing operation.
        op: &'static str,
        /// Copy direction.
        direction: Direction,
        /// First element.
        start: usize,
        /// Element count.
        count: usize,
        /// Buffer length in elements.
        len: usize,
        /// Role of the device slot involved.
        role: Role,
        /// Backend cause.
        source: DeviceError,
    },
}

impl ResourceError {
    pub(crate) const fn usage(op: &'static str, fault: UsageFault) -> Self {
        Self::Usage { op, fault }
    }

    pub(crate) const fn allocation(
        op: &'static str,
        elements: usize,
        bytes: usize,
        source: DeviceError,
    ) -> Self {
        Self::Allocation {
            op,
            elements,
            bytes,
            source,
        }
    }

    pub(crate) const fn interop(
        op: &'static str,
        slot: usize,
        role: Role,
        fault: InteropFault,
    ) -> Self {
        Self::Interop {
            op,
            slot,
            role,
            fault,
        }
    }

    /// Returns the error class.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Allocation { .. } => ErrorKind::Allocation,
            Self::Interop { .. } => ErrorKind::Interop,
            Self::Usage { .. } => ErrorKind::Usage,
            Self::Transfer { .. } => ErrorKind::Transfer,
        }
    }

    /// Returns the name of the failing operation.
    #[must_use]
    pub const fn op(&self) -> &'static str {
        match self {
            Self::Allocation { op, .. }
            | Self::Interop { op, .. }
            | Self::Usage { op, .. }
            | Self::Transfer { op, .. } => *op,
        }
    }

    /// True when the operation may succeed if simply repeated.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transfer { .. })
    }
}

/// Result type for buffer operations.
pub type ResourceResult<T> = Result<T, ResourceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_message_names_everything() {
        let err = ResourceError::Transfer {
            op: "copy",
            direction: Direction::DeviceToHost,
            start: 2,
            count: 8,
            len: 16,
            role: Role::Read,
            source: DeviceError::Injected("copy"),
        };
        let msg = err.to_string();
        assert!(msg.contains("copy"));
        assert!(msg.contains("device-to-host"));
        assert!(msg.contains("16 elements"));
        assert!(msg.contains("read role"));
        assert!(err.is_retryable());
        assert_eq!(err.kind(), ErrorKind::Transfer);
    }

    #[test]
    fn test_usage_is_not_retryable() {
        let err = ResourceError::usage("swap", UsageFault::SwapSingleBuffered);
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert_eq!(err.op(), "swap");
        assert!(!err.is_retryable());
    }
}

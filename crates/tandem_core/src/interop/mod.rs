//! # Graphics Interop
//!
//! A graphics buffer object is owned by exactly one side at a time:
//!
//! ```text
//!   Unmapped (graphics owns it, renderer may bind)
//!       │ map ──> device address handed out
//!       ▼
//!   Mapped (device owns it, kernels may write)
//!       │ unmap ──> address invalid, renderer may bind again
//!       ▼
//!   Unmapped
//! ```
//!
//! [`GraphicsInteropHandle`] tracks that state for one buffer object and
//! refuses double maps, double unmaps and device access while unmapped.
//! [`InteropSession`] is the scoped form: map on entry, unmap on drop.

mod session;

pub use session::InteropSession;

use crate::device::{BufferTarget, DeviceBackend, DevicePtr, GraphicsBufferId, MapFlags};
use crate::error::{DeviceResult, InteropFault};

/// Map state of a registered graphics buffer object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapState {
    /// The graphics subsystem owns the buffer.
    Unmapped,
    /// The device owns the buffer at this address.
    Mapped(DevicePtr),
}

/// A graphics buffer object registered for device access.
#[derive(Debug, PartialEq, Eq)]
pub struct GraphicsInteropHandle {
    buffer: GraphicsBufferId,
    state: MapState,
}

impl GraphicsInteropHandle {
    /// Creates a graphics buffer object and registers it write-discard.
    ///
    /// The object is deleted again if registration fails.
    pub(crate) fn create(backend: &dyn DeviceBackend, bytes: usize, target: BufferTarget) -> DeviceResult<Self> {
        let buffer = backend.create_graphics_buffer(bytes, target)?;
        if let Err(err) = backend.register_graphics_buffer(buffer, MapFlags::WriteDiscard) {
            if let Err(delete_err) = backend.delete_graphics_buffer(buffer) {
                tracing::warn!(%buffer, error = %delete_err, "failed to delete unregistered graphics buffer");
            }
            return Err(err);
        }
        Ok(Self {
            buffer,
            state: MapState::Unmapped,
        })
    }

    /// The graphics buffer object.
    #[inline]
    #[must_use]
    pub fn buffer(&self) -> GraphicsBufferId {
        self.buffer
    }

    /// Current map state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> MapState {
        self.state
    }

    /// True while the device owns the buffer.
    #[inline]
    #[must_use]
    pub fn is_mapped(&self) -> bool {
        matches!(self.state, MapState::Mapped(_))
    }

    /// Hands the buffer to the device.
    ///
    /// # Errors
    ///
    /// [`InteropFault::AlreadyMapped`] or a backend failure.
    pub fn map(&mut self, backend: &dyn DeviceBackend) -> Result<DevicePtr, InteropFault> {
        if self.is_mapped() {
            return Err(InteropFault::AlreadyMapped);
        }
        let ptr = backend.map_graphics_buffer(self.buffer)?;
        self.state = MapState::Mapped(ptr);
        Ok(ptr)
    }

    /// Hands the buffer back to the graphics subsystem.
    ///
    /// # Errors
    ///
    /// [`InteropFault::NotMapped`] or a backend failure. On backend failure
    /// the handle stays mapped.
    pub fn unmap(&mut self, backend: &dyn DeviceBackend) -> Result<(), InteropFault> {
        if !self.is_mapped() {
            return Err(InteropFault::NotMapped);
        }
        backend.unmap_graphics_buffer(self.buffer)?;
        self.state = MapState::Unmapped;
        Ok(())
    }

    /// Device address while mapped.
    ///
    /// # Errors
    ///
    /// [`InteropFault::NotMapped`] while the graphics subsystem owns the buffer.
    pub fn device_ptr(&self) -> Result<DevicePtr, InteropFault> {
        match self.state {
            MapState::Mapped(ptr) => Ok(ptr),
            MapState::Unmapped => Err(InteropFault::NotMapped),
        }
    }

    /// Device address while mapped, [`DevicePtr::NULL`] otherwise.
    #[must_use]
    pub fn device_ptr_or_null(&self) -> DevicePtr {
        self.device_ptr().unwrap_or(DevicePtr::NULL)
    }

    /// Unmaps if mapped. Release paths only.
    pub(crate) fn unmap_if_mapped(&mut self, backend: &dyn DeviceBackend) -> DeviceResult<()> {
        if self.is_mapped() {
            backend.unmap_graphics_buffer(self.buffer)?;
            self.state = MapState::Unmapped;
        }
        Ok(())
    }

    /// Unregisters the buffer. Must be unmapped.
    pub(crate) fn unregister(&self, backend: &dyn DeviceBackend) -> DeviceResult<()> {
        backend.unregister_graphics_buffer(self.buffer)
    }

    /// Deletes the buffer object. Must be unregistered.
    pub(crate) fn delete(self, backend: &dyn DeviceBackend) -> DeviceResult<()> {
        backend.delete_graphics_buffer(self.buffer)
    }
}

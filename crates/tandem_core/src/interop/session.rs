//! Scoped map/unmap of a graphics-backed `DualBuffer`.

use bytemuck::Pod;

use crate::buffer::{DualBuffer, Role};
use crate::device::DevicePtr;
use crate::error::ResourceResult;

/// Device-side ownership of a buffer's graphics slots.
///
/// Created by [`DualBuffer::interop_session`]. Both roles' device addresses
/// are valid while the session lives; `end()` or drop hands the buffer back
/// to the graphics subsystem. A session over a buffer that was already mapped
/// (or uses raw device memory) leaves the mapping as it found it.
#[must_use = "the buffer is unmapped as soon as the session is dropped"]
pub struct InteropSession<'a, T: Pod> {
    buffer: &'a mut DualBuffer<T>,
    owns_mapping: bool,
}

impl<T: Pod> DualBuffer<T> {
    /// Maps the graphics slots until the returned session ends.
    ///
    /// # Errors
    ///
    /// Usage if not allocated, interop if mapping fails.
    pub fn interop_session(&mut self) -> ResourceResult<InteropSession<'_, T>> {
        self.check_allocated("interop_session")?;
        let owns_mapping = self.uses_graphics_buffer() && !self.is_mapped();
        if owns_mapping {
            self.map_slots("interop_session")?;
        }
        Ok(InteropSession {
            buffer: self,
            owns_mapping,
        })
    }
}

impl<T: Pod> InteropSession<'_, T> {
    /// Device address of the read slot.
    ///
    /// # Errors
    ///
    /// Propagated from [`DualBuffer::device_ptr`].
    pub fn device_ptr(&self) -> ResourceResult<DevicePtr> {
        self.buffer.device_ptr()
    }

    /// Device address of the write slot.
    ///
    /// # Errors
    ///
    /// Propagated from [`DualBuffer::device_write_ptr`].
    pub fn device_write_ptr(&self) -> ResourceResult<DevicePtr> {
        self.buffer.device_write_ptr()
    }

    /// Writes `data` into the slot holding `role`.
    ///
    /// # Errors
    ///
    /// Propagated from [`DualBuffer::write_device`].
    pub fn write(&self, role: Role, start: usize, data: &[T]) -> ResourceResult<()> {
        self.buffer.write_device(role, start, data)
    }

    /// Reads the slot holding `role`.
    ///
    /// # Errors
    ///
    /// Propagated from [`DualBuffer::read_device`].
    pub fn read(&self, role: Role, start: usize, out: &mut [T]) -> ResourceResult<()> {
        self.buffer.read_device(role, start, out)
    }

    /// The buffer under the session.
    #[must_use]
    pub fn buffer(&self) -> &DualBuffer<T> {
        &*self.buffer
    }

    /// Ends the session, surfacing unmap failures.
    ///
    /// # Errors
    ///
    /// Interop error if the unmap fails.
    pub fn end(mut self) -> ResourceResult<()> {
        self.release()
    }

    fn release(&mut self) -> ResourceResult<()> {
        if !self.owns_mapping {
            return Ok(());
        }
        self.owns_mapping = false;
        self.buffer.unmap_slots("interop_session")
    }
}

impl<T: Pod> Drop for InteropSession<'_, T> {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            tracing::warn!(error = %err, "interop session failed to unmap");
        }
    }
}

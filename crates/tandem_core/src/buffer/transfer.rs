//! Host/device transfers on a `DualBuffer`.
//!
//! Every transfer runs inside a [`ContextGuard`](crate::ContextGuard) for the
//! buffer's device, so the caller's device selection is the same afterwards,
//! whether the transfer succeeded or not.

use std::mem;
use std::ops::Range;

use bytemuck::Pod;

use super::dual_buffer::DualBuffer;
use super::{Direction, Role};
use crate::error::{DeviceError, ResourceError, ResourceResult, UsageFault};

/// What a transfer error reports about the failed call.
#[derive(Clone, Copy)]
struct TransferContext {
    op: &'static str,
    direction: Direction,
    start: usize,
    count: usize,
    len: usize,
    role: Role,
}

impl TransferContext {
    fn error(self, source: DeviceError) -> ResourceError {
        ResourceError::Transfer {
            op: self.op,
            direction: self.direction,
            start: self.start,
            count: self.count,
            len: self.len,
            role: self.role,
            source,
        }
    }
}

impl<T: Pod> DualBuffer<T> {
    /// Copies `count` elements from `start` between host storage and the read slot.
    ///
    /// `count == 0` means everything from `start` to the end. Graphics slots
    /// are mapped for the duration of the copy unless already mapped.
    ///
    /// # Errors
    ///
    /// - Usage: not allocated, range out of bounds.
    /// - Interop: the graphics slots could not be mapped.
    /// - Transfer: the backend copy failed. Retryable, contents untouched.
    pub fn copy(&mut self, direction: Direction, start: usize, count: usize) -> ResourceResult<()> {
        self.transfer("copy", direction, Role::Read, start, count)
    }

    /// Copies the whole buffer. Same as `copy(direction, 0, 0)`.
    ///
    /// # Errors
    ///
    /// See [`DualBuffer::copy`].
    pub fn copy_all(&mut self, direction: Direction) -> ResourceResult<()> {
        self.copy(direction, 0, 0)
    }

    /// Uploads host storage into the write slot (e.g. seeding the next step).
    ///
    /// # Errors
    ///
    /// See [`DualBuffer::copy`].
    pub fn upload_to_write(&mut self, start: usize, count: usize) -> ResourceResult<()> {
        self.transfer("upload_to_write", Direction::HostToDevice, Role::Write, start, count)
    }

    /// Sets `count` elements of the read slot from `start` to `value`.
    ///
    /// # Errors
    ///
    /// See [`DualBuffer::copy`].
    pub fn fill(&mut self, value: T, start: usize, count: usize) -> ResourceResult<()> {
        const OP: &str = "fill";
        let range = self.resolve_range(OP, start, count)?;
        let ctx = TransferContext {
            op: OP,
            direction: Direction::HostToDevice,
            start: range.start,
            count: range.len(),
            len: self.len,
            role: Role::Read,
        };
        let _guard = self.device.enter().map_err(|err| ctx.error(err))?;
        let auto_map = self.uses_graphics_buffer && !self.is_mapped();
        if auto_map {
            self.map_slots(OP)?;
        }

        let filled = self.slot_ptr(OP, self.current_read).and_then(|ptr| {
            self.device
                .backend()
                .fill(ptr, range.start * mem::size_of::<T>(), bytemuck::bytes_of(&value), range.len())
                .map_err(|err| ctx.error(err))
        });
        self.finish_auto_map(OP, auto_map, filled)
    }

    /// Writes `data` into the device slot holding `role`, at element `start`.
    ///
    /// Graphics slots must already be mapped (see
    /// [`DualBuffer::interop_session`](crate::DualBuffer::interop_session)).
    ///
    /// # Errors
    ///
    /// - Usage: not allocated, range out of bounds.
    /// - Interop: graphics slot not mapped.
    /// - Transfer: the backend copy failed.
    pub fn write_device(&self, role: Role, start: usize, data: &[T]) -> ResourceResult<()> {
        const OP: &str = "write_device";
        let range = self.checked_range(OP, start, data.len())?;
        let index = self.slot_index(role);
        let ptr = self.slot_ptr(OP, index)?;
        let ctx = TransferContext {
            op: OP,
            direction: Direction::HostToDevice,
            start,
            count: range.len(),
            len: self.len,
            role,
        };
        let _guard = self.device.enter().map_err(|err| ctx.error(err))?;
        self.device
            .backend()
            .copy_to_device(ptr, start * mem::size_of::<T>(), bytemuck::cast_slice(data))
            .map_err(|err| ctx.error(err))
    }

    /// Reads the device slot holding `role` at element `start` into `out`.
    ///
    /// Graphics slots must already be mapped.
    ///
    /// # Errors
    ///
    /// Same as [`DualBuffer::write_device`].
    pub fn read_device(&self, role: Role, start: usize, out: &mut [T]) -> ResourceResult<()> {
        const OP: &str = "read_device";
        let range = self.checked_range(OP, start, out.len())?;
        let index = self.slot_index(role);
        let ptr = self.slot_ptr(OP, index)?;
        let ctx = TransferContext {
            op: OP,
            direction: Direction::DeviceToHost,
            start,
            count: range.len(),
            len: self.len,
            role,
        };
        let _guard = self.device.enter().map_err(|err| ctx.error(err))?;
        self.device
            .backend()
            .copy_to_host(ptr, start * mem::size_of::<T>(), bytemuck::cast_slice_mut(out))
            .map_err(|err| ctx.error(err))
    }

    fn transfer(
        &mut self,
        op: &'static str,
        direction: Direction,
        role: Role,
        start: usize,
        count: usize,
    ) -> ResourceResult<()> {
        let range = self.resolve_range(op, start, count)?;
        let ctx = TransferContext {
            op,
            direction,
            start: range.start,
            count: range.len(),
            len: self.len,
            role,
        };
        let _guard = self.device.enter().map_err(|err| ctx.error(err))?;
        let auto_map = self.uses_graphics_buffer && !self.is_mapped();
        if auto_map {
            self.map_slots(op)?;
        }

        let index = self.slot_index(role);
        let copied = self.slot_ptr(op, index).and_then(|ptr| {
            let offset = range.start * mem::size_of::<T>();
            let backend = self.device.backend();
            let host = &mut self.host[range.clone()];
            let result = match direction {
                Direction::HostToDevice => backend.copy_to_device(ptr, offset, bytemuck::cast_slice(&*host)),
                Direction::DeviceToHost => backend.copy_to_host(ptr, offset, bytemuck::cast_slice_mut(host)),
            };
            result.map_err(|err| ctx.error(err))
        });
        self.finish_auto_map(op, auto_map, copied)
    }

    /// Undoes an automatic map. The transfer's own error wins over an unmap error.
    fn finish_auto_map(&mut self, op: &'static str, auto_map: bool, result: ResourceResult<()>) -> ResourceResult<()> {
        if !auto_map {
            return result;
        }
        let unmapped = self.unmap_slots(op);
        result.and(unmapped)
    }

    fn slot_index(&self, role: Role) -> usize {
        match role {
            Role::Read => self.current_read,
            Role::Write => self.current_write,
        }
    }

    /// `count == 0` expands to the rest of the buffer from `start`.
    fn resolve_range(&self, op: &'static str, start: usize, count: usize) -> ResourceResult<Range<usize>> {
        self.check_allocated(op)?;
        let count = if count == 0 {
            self.len.checked_sub(start).ok_or(ResourceError::usage(
                op,
                UsageFault::RangeOutOfBounds {
                    start,
                    count,
                    len: self.len,
                },
            ))?
        } else {
            count
        };
        self.checked_range(op, start, count)
    }

    fn checked_range(&self, op: &'static str, start: usize, count: usize) -> ResourceResult<Range<usize>> {
        self.check_allocated(op)?;
        match start.checked_add(count) {
            Some(end) if end <= self.len => Ok(start..end),
            _ => Err(ResourceError::usage(
                op,
                UsageFault::RangeOutOfBounds {
                    start,
                    count,
                    len: self.len,
                },
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::device::{BufferTarget, DeviceHandle, DeviceId, EmulatedDevice};
    use crate::error::ErrorKind;
    use crate::BufferConfig;

    use super::*;

    fn buffer(config: BufferConfig) -> (Arc<EmulatedDevice>, DualBuffer<u32>) {
        let device = Arc::new(EmulatedDevice::default());
        let mut buf = DualBuffer::new(DeviceHandle::new(device.clone(), DeviceId(0)));
        buf.alloc(config).unwrap();
        (device, buf)
    }

    #[test]
    fn test_count_zero_means_rest_of_buffer() {
        let (_device, mut buf) = buffer(BufferConfig::device(8));
        buf.host_mut().copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        buf.copy(Direction::HostToDevice, 0, 0).unwrap();

        buf.host_mut().fill(0);
        buf.copy(Direction::DeviceToHost, 5, 0).unwrap();
        assert_eq!(buf.host(), &[0, 0, 0, 0, 0, 6, 7, 8]);
    }

    #[test]
    fn test_range_checked() {
        let (_device, mut buf) = buffer(BufferConfig::device(8));
        let err = buf.copy(Direction::HostToDevice, 6, 4).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert!(buf.copy(Direction::HostToDevice, 9, 0).is_err());
        // start == len with count 0 is an empty transfer.
        buf.copy(Direction::HostToDevice, 8, 0).unwrap();
    }

    #[test]
    fn test_fill_sets_device_range() {
        let (_device, mut buf) = buffer(BufferConfig::device(6));
        buf.fill(9, 2, 3).unwrap();
        buf.copy_all(Direction::DeviceToHost).unwrap();
        assert_eq!(buf.host(), &[0, 0, 9, 9, 9, 0]);
    }

    #[test]
    fn test_copy_auto_maps_graphics_slots() {
        let (device, mut buf) = buffer(BufferConfig::graphics(4, BufferTarget::Vertex));
        buf.host_mut().copy_from_slice(&[10, 20, 30, 40]);
        buf.copy_all(Direction::HostToDevice).unwrap();

        assert!(!buf.is_mapped());
        let stats = device.stats();
        assert_eq!((stats.maps, stats.unmaps), (1, 1));

        let id = buf.graphics_buffer().unwrap();
        let bytes = device.graphics_contents(id).unwrap();
        assert_eq!(bytes, bytemuck::cast_slice::<u32, u8>(&[10, 20, 30, 40]));
    }

    #[test]
    fn test_copy_keeps_caller_mapping() {
        let (device, mut buf) = buffer(BufferConfig::graphics(4, BufferTarget::Vertex));
        buf.map().unwrap();
        buf.copy_all(Direction::HostToDevice).unwrap();
        assert!(buf.is_mapped());
        assert_eq!(device.stats().maps, 1);
        buf.unmap().unwrap();
    }

    #[test]
    fn test_write_device_requires_mapping() {
        let (_device, mut buf) = buffer(BufferConfig::graphics(4, BufferTarget::Vertex).double_buffered());
        let err = buf.write_device(Role::Write, 0, &[1, 2]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Interop);

        buf.map().unwrap();
        buf.write_device(Role::Write, 2, &[1, 2]).unwrap();
        let mut out = [0; 2];
        buf.read_device(Role::Write, 2, &mut out).unwrap();
        assert_eq!(out, [1, 2]);
        buf.unmap().unwrap();
    }

    #[test]
    fn test_injected_copy_failure_is_retryable() {
        let (device, mut buf) = buffer(BufferConfig::device(4));
        device.fail_next_copies(1);
        let err = buf.copy_all(Direction::HostToDevice).unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(
            err,
            ResourceError::Transfer { direction: Direction::HostToDevice, start: 0, count: 4, len: 4, .. }
        ));
        buf.copy_all(Direction::HostToDevice).unwrap();
    }
}

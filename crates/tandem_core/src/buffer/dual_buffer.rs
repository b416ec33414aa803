//! `DualBuffer` lifecycle: alloc, swap, map/unmap, free.

use std::fmt;
use std::mem;

use bytemuck::Pod;

use super::Role;
use crate::device::{BufferTarget, DeviceBackend, DeviceHandle, DevicePtr, GraphicsBufferId};
use crate::error::{DeviceError, DeviceResult, ResourceError, ResourceResult, UsageFault};
use crate::interop::GraphicsInteropHandle;

/// Allocation parameters for [`DualBuffer::alloc`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferConfig {
    /// Element count.
    pub size: usize,
    /// Back device slots with registered graphics buffer objects.
    pub use_graphics_buffer: bool,
    /// Allocate two device slots.
    pub double_buffered: bool,
    /// Binding target of graphics buffer objects.
    pub target: BufferTarget,
}

impl BufferConfig {
    /// Single-buffered raw device memory.
    #[must_use]
    pub fn device(size: usize) -> Self {
        Self {
            size,
            use_graphics_buffer: false,
            double_buffered: false,
            target: BufferTarget::Vertex,
        }
    }

    /// Single-buffered graphics buffer objects bound to `target`.
    #[must_use]
    pub fn graphics(size: usize, target: BufferTarget) -> Self {
        Self {
            size,
            use_graphics_buffer: true,
            double_buffered: false,
            target,
        }
    }

    /// Same, double-buffered.
    #[must_use]
    pub fn double_buffered(mut self) -> Self {
        self.double_buffered = true;
        self
    }
}

/// What backs one device slot.
pub(super) enum DeviceSlot {
    Empty,
    Raw(DevicePtr),
    Graphics(GraphicsInteropHandle),
}

impl DeviceSlot {
    fn create(backend: &dyn DeviceBackend, bytes: usize, config: &BufferConfig) -> DeviceResult<Self> {
        if config.use_graphics_buffer {
            GraphicsInteropHandle::create(backend, bytes, config.target).map(Self::Graphics)
        } else {
            backend.malloc(bytes).map(Self::Raw)
        }
    }
}

/// Host array mirrored by one or two device arrays with read/write roles.
///
/// ## Usage
///
/// ```rust
/// use std::sync::Arc;
/// use tandem_core::{BufferConfig, DeviceHandle, DeviceId, Direction, DualBuffer, EmulatedDevice};
///
/// let device = DeviceHandle::new(Arc::new(EmulatedDevice::default()), DeviceId(0));
/// let mut positions: DualBuffer<f32> = DualBuffer::new(device);
/// positions.alloc(BufferConfig::device(4).double_buffered())?;
///
/// positions.host_mut().copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
/// positions.copy(Direction::HostToDevice, 0, 0)?;
/// positions.swap()?;
/// # Ok::<(), tandem_core::ResourceError>(())
/// ```
pub struct DualBuffer<T: Pod> {
    pub(super) device: DeviceHandle,
    pub(super) len: usize,
    pub(super) host: Vec<T>,
    pub(super) slots: [DeviceSlot; 2],
    pub(super) current_read: usize,
    pub(super) current_write: usize,
    pub(super) uses_graphics_buffer: bool,
    pub(super) double_buffered: bool,
    pub(super) target: BufferTarget,
    pub(super) allocated: bool,
}

impl<T: Pod> DualBuffer<T> {
    /// Creates an unallocated buffer bound to `device`.
    #[must_use]
    pub fn new(device: DeviceHandle) -> Self {
        Self {
            device,
            len: 0,
            host: Vec::new(),
            slots: [DeviceSlot::Empty, DeviceSlot::Empty],
            current_read: 0,
            current_write: 0,
            uses_graphics_buffer: false,
            double_buffered: false,
            target: BufferTarget::Vertex,
            allocated: false,
        }
    }

    /// Allocates host storage and one or two device slots.
    ///
    /// Everything acquired is released again if any step fails.
    ///
    /// # Errors
    ///
    /// - Usage: already allocated, zero size, size overflow.
    /// - Allocation: host, device or graphics allocation failed.
    pub fn alloc(&mut self, config: BufferConfig) -> ResourceResult<()> {
        const OP: &str = "alloc";
        if self.allocated {
            return Err(ResourceError::usage(OP, UsageFault::AlreadyAllocated));
        }
        if config.size == 0 {
            return Err(ResourceError::usage(OP, UsageFault::EmptyBuffer));
        }
        let bytes = config
            .size
            .checked_mul(mem::size_of::<T>())
            .ok_or(ResourceError::usage(OP, UsageFault::SizeOverflow { elements: config.size }))?;
        let failed = |source| ResourceError::allocation(OP, config.size, bytes, source);

        let mut host = Vec::new();
        host.try_reserve_exact(config.size)
            .map_err(|_| failed(DeviceError::HostAllocation { bytes }))?;
        host.resize(config.size, T::zeroed());

        let _ctx = self.device.enter().map_err(failed)?;
        let backend = self.device.backend();
        let first = DeviceSlot::create(backend, bytes, &config).map_err(failed)?;
        let second = if config.double_buffered {
            match DeviceSlot::create(backend, bytes, &config) {
                Ok(slot) => slot,
                Err(err) => {
                    let mut acquired = [first, DeviceSlot::Empty];
                    if let Err(release_err) = release_slots(backend, &mut acquired) {
                        tracing::warn!(error = %release_err, "rollback after failed alloc did not complete");
                    }
                    return Err(failed(err));
                }
            }
        } else {
            DeviceSlot::Empty
        };

        self.slots = [first, second];
        self.host = host;
        self.len = config.size;
        self.current_read = 0;
        self.current_write = usize::from(config.double_buffered);
        self.uses_graphics_buffer = config.use_graphics_buffer;
        self.double_buffered = config.double_buffered;
        self.target = config.target;
        self.allocated = true;

        tracing::debug!(
            elements = config.size,
            bytes,
            graphics = config.use_graphics_buffer,
            double_buffered = config.double_buffered,
            device = %self.device.id(),
            "dual buffer allocated"
        );
        Ok(())
    }

    /// Releases everything: unmap, unregister, device memory, host memory.
    ///
    /// Idempotent. Every resource is released even if an earlier release
    /// fails; the first failure is returned. If the owning device cannot be
    /// selected nothing is released and the buffer stays allocated, so a
    /// later `free` (or drop) retries.
    ///
    /// # Errors
    ///
    /// Allocation error wrapping the first backend failure.
    pub fn free(&mut self) -> ResourceResult<()> {
        if !self.allocated {
            return Ok(());
        }
        let elements = self.len;
        let bytes = elements * mem::size_of::<T>();

        let ctx = match self.device.enter() {
            Ok(ctx) => ctx,
            Err(err) => {
                tracing::warn!(elements, bytes, device = %self.device.id(), error = %err, "free deferred, device unavailable");
                return Err(ResourceError::allocation("free", elements, bytes, err));
            }
        };
        let released = release_slots(self.device.backend(), &mut self.slots);
        drop(ctx);
        self.host = Vec::new();
        self.len = 0;
        self.current_read = 0;
        self.current_write = 0;
        self.uses_graphics_buffer = false;
        self.double_buffered = false;
        self.allocated = false;

        match released {
            Ok(()) => {
                tracing::debug!(elements, bytes, device = %self.device.id(), "dual buffer freed");
                Ok(())
            }
            Err(err) => {
                tracing::warn!(elements, bytes, error = %err, "dual buffer freed with errors");
                Err(ResourceError::allocation("free", elements, bytes, err))
            }
        }
    }

    /// Exchanges the read and write roles. Nothing is copied.
    ///
    /// # Errors
    ///
    /// Usage: not allocated, or single-buffered.
    pub fn swap(&mut self) -> ResourceResult<()> {
        self.check_allocated("swap")?;
        if !self.double_buffered {
            return Err(ResourceError::usage("swap", UsageFault::SwapSingleBuffered));
        }
        mem::swap(&mut self.current_read, &mut self.current_write);
        Ok(())
    }

    /// Maps every graphics slot for device access. No-op for raw device memory.
    ///
    /// # Errors
    ///
    /// Interop: already mapped or the backend refused. Slots mapped before
    /// the failure are unmapped again.
    pub fn map(&mut self) -> ResourceResult<()> {
        self.map_slots("map")
    }

    /// Returns every graphics slot to the graphics subsystem. No-op for raw
    /// device memory.
    ///
    /// # Errors
    ///
    /// Interop: not mapped or the backend refused. The remaining slots are
    /// still unmapped; the first failure is returned.
    pub fn unmap(&mut self) -> ResourceResult<()> {
        self.unmap_slots("unmap")
    }

    pub(crate) fn map_slots(&mut self, op: &'static str) -> ResourceResult<()> {
        self.check_allocated(op)?;
        if !self.uses_graphics_buffer {
            return Ok(());
        }
        let roles = self.roles();
        let _ctx = self
            .device
            .enter()
            .map_err(|err| ResourceError::interop(op, self.current_read, Role::Read, err.into()))?;
        let backend = self.device.backend();

        for index in 0..self.slot_count() {
            let DeviceSlot::Graphics(handle) = &mut self.slots[index] else {
                continue;
            };
            if let Err(fault) = handle.map(backend) {
                for earlier in &mut self.slots[..index] {
                    if let DeviceSlot::Graphics(handle) = earlier {
                        if let Err(err) = handle.unmap(backend) {
                            tracing::warn!(buffer = %handle.buffer(), error = %err, "rollback unmap failed");
                        }
                    }
                }
                return Err(ResourceError::interop(op, index, roles[index], fault));
            }
        }
        Ok(())
    }

    pub(crate) fn unmap_slots(&mut self, op: &'static str) -> ResourceResult<()> {
        self.check_allocated(op)?;
        if !self.uses_graphics_buffer {
            return Ok(());
        }
        let roles = self.roles();
        let _ctx = self
            .device
            .enter()
            .map_err(|err| ResourceError::interop(op, self.current_read, Role::Read, err.into()))?;
        let backend = self.device.backend();

        let mut first = None;
        for index in 0..self.slot_count() {
            if let DeviceSlot::Graphics(handle) = &mut self.slots[index] {
                if let Err(fault) = handle.unmap(backend) {
                    first.get_or_insert(ResourceError::interop(op, index, roles[index], fault));
                }
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Device address of the read slot.
    ///
    /// # Errors
    ///
    /// Usage if not allocated, interop if the graphics slot is unmapped.
    pub fn device_ptr(&self) -> ResourceResult<DevicePtr> {
        self.slot_ptr("device_ptr", self.current_read)
    }

    /// Device address of the write slot.
    ///
    /// # Errors
    ///
    /// Usage if not allocated, interop if the graphics slot is unmapped.
    pub fn device_write_ptr(&self) -> ResourceResult<DevicePtr> {
        self.slot_ptr("device_write_ptr", self.current_write)
    }

    /// Device address of the read slot, [`DevicePtr::NULL`] when there is none.
    #[must_use]
    pub fn device_ptr_or_null(&self) -> DevicePtr {
        self.device_ptr().unwrap_or(DevicePtr::NULL)
    }

    /// Graphics buffer object of the read slot.
    #[must_use]
    pub fn graphics_buffer(&self) -> Option<GraphicsBufferId> {
        self.graphics_handle(self.current_read).map(GraphicsInteropHandle::buffer)
    }

    /// Graphics buffer object of the write slot.
    #[must_use]
    pub fn write_graphics_buffer(&self) -> Option<GraphicsBufferId> {
        self.graphics_handle(self.current_write).map(GraphicsInteropHandle::buffer)
    }

    /// Host storage (shared by both roles).
    #[inline]
    #[must_use]
    pub fn host(&self) -> &[T] {
        &self.host
    }

    /// Host storage, mutable.
    #[inline]
    #[must_use]
    pub fn host_mut(&mut self) -> &mut [T] {
        &mut self.host
    }

    /// Replaces the host contents.
    ///
    /// # Errors
    ///
    /// Usage: not allocated, or `data.len() != self.len()`.
    pub fn set_host(&mut self, data: &[T]) -> ResourceResult<()> {
        self.check_allocated("set_host")?;
        if data.len() != self.len {
            return Err(ResourceError::usage(
                "set_host",
                UsageFault::HostLengthMismatch {
                    expected: self.len,
                    actual: data.len(),
                },
            ));
        }
        self.host.copy_from_slice(data);
        Ok(())
    }

    /// Element count (0 when unallocated).
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when unallocated.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Index of the read slot.
    #[inline]
    #[must_use]
    pub fn current_read(&self) -> usize {
        self.current_read
    }

    /// Index of the write slot.
    #[inline]
    #[must_use]
    pub fn current_write(&self) -> usize {
        self.current_write
    }

    /// True with two device slots.
    #[inline]
    #[must_use]
    pub fn is_double_buffered(&self) -> bool {
        self.double_buffered
    }

    /// True when device slots are graphics buffer objects.
    #[inline]
    #[must_use]
    pub fn uses_graphics_buffer(&self) -> bool {
        self.uses_graphics_buffer
    }

    /// True while the graphics slots are mapped for device access.
    #[must_use]
    pub fn is_mapped(&self) -> bool {
        self.graphics_handle(self.current_read)
            .is_some_and(GraphicsInteropHandle::is_mapped)
    }

    /// True between a successful `alloc` and `free`.
    #[inline]
    #[must_use]
    pub fn is_allocated(&self) -> bool {
        self.allocated
    }

    /// Binding target of the graphics slots.
    #[inline]
    #[must_use]
    pub fn target(&self) -> BufferTarget {
        self.target
    }

    /// Device this buffer lives on.
    #[inline]
    #[must_use]
    pub fn device(&self) -> &DeviceHandle {
        &self.device
    }

    pub(crate) fn check_allocated(&self, op: &'static str) -> ResourceResult<()> {
        if self.allocated {
            Ok(())
        } else {
            Err(ResourceError::usage(op, UsageFault::NotAllocated))
        }
    }

    pub(super) fn slot_count(&self) -> usize {
        if self.double_buffered {
            2
        } else {
            1
        }
    }

    /// Role each slot index plays right now.
    pub(super) fn roles(&self) -> [Role; 2] {
        let mut roles = [Role::Write; 2];
        roles[self.current_read] = Role::Read;
        roles
    }

    pub(super) fn slot_ptr(&self, op: &'static str, index: usize) -> ResourceResult<DevicePtr> {
        self.check_allocated(op)?;
        match &self.slots[index] {
            DeviceSlot::Raw(ptr) => Ok(*ptr),
            DeviceSlot::Graphics(handle) => handle
                .device_ptr()
                .map_err(|fault| ResourceError::interop(op, index, self.roles()[index], fault)),
            DeviceSlot::Empty => Err(ResourceError::usage(op, UsageFault::NotAllocated)),
        }
    }

    fn graphics_handle(&self, index: usize) -> Option<&GraphicsInteropHandle> {
        match &self.slots[index] {
            DeviceSlot::Graphics(handle) => Some(handle),
            DeviceSlot::Raw(_) | DeviceSlot::Empty => None,
        }
    }
}

/// Releases both slots in reverse acquisition order and leaves them empty.
fn release_slots(backend: &dyn DeviceBackend, slots: &mut [DeviceSlot; 2]) -> DeviceResult<()> {
    let mut first: Option<DeviceError> = None;

    for slot in slots.iter_mut() {
        if let DeviceSlot::Graphics(handle) = slot {
            if let Err(err) = handle.unmap_if_mapped(backend).and_then(|()| handle.unregister(backend)) {
                first.get_or_insert(err);
            }
        }
    }

    for slot in slots.iter_mut() {
        let released = match mem::replace(slot, DeviceSlot::Empty) {
            DeviceSlot::Raw(ptr) => backend.free(ptr),
            DeviceSlot::Graphics(handle) => handle.delete(backend),
            DeviceSlot::Empty => Ok(()),
        };
        if let Err(err) = released {
            first.get_or_insert(err);
        }
    }

    first.map_or(Ok(()), Err)
}

impl<T: Pod> Drop for DualBuffer<T> {
    fn drop(&mut self) {
        if let Err(err) = self.free() {
            tracing::error!(error = %err, "dual buffer leaked device resources on drop");
        }
    }
}

impl<T: Pod> fmt::Debug for DualBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DualBuffer")
            .field("device", &self.device)
            .field("len", &self.len)
            .field("current_read", &self.current_read)
            .field("current_write", &self.current_write)
            .field("uses_graphics_buffer", &self.uses_graphics_buffer)
            .field("double_buffered", &self.double_buffered)
            .field("mapped", &self.is_mapped())
            .field("allocated", &self.allocated)
            .finish()
    }
}

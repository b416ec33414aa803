//! # Device Backends
//!
//! Everything a [`DualBuffer`](crate::DualBuffer) needs from the hardware goes
//! through [`DeviceBackend`]:
//!
//! ```text
//!   host memory ──copy_to_device──> device memory <──map── graphics buffer object
//!               <──copy_to_host───                ──unmap─>  (graphics-owned)
//! ```
//!
//! ## Device Contexts
//!
//! The current device is per thread. There is no process-wide "current device":
//! callers hold a [`DeviceHandle`] naming the device they want and enter it
//! with [`DeviceHandle::enter`]. The returned [`ContextGuard`] restores the
//! previously selected device when dropped, so a transfer issued from the
//! render thread never leaves the compute thread's device selected.

mod emulated;
#[cfg(feature = "wgpu")]
mod wgpu_backend;

pub use emulated::{EmulatedConfig, EmulatedDevice, EmulatedStats};
#[cfg(feature = "wgpu")]
pub use wgpu_backend::WgpuDevice;

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::DeviceResult;

/// Index of a compute device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Device-visible address.
///
/// [`DevicePtr::NULL`] is the sentinel handed out for "no valid address",
/// e.g. the device pointer of a graphics buffer that is not mapped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DevicePtr(u64);

impl DevicePtr {
    /// The null sentinel.
    pub const NULL: Self = Self(0);

    /// Wraps a raw address.
    #[must_use]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Returns the raw address.
    #[must_use]
    pub const fn addr(self) -> u64 {
        self.0
    }

    /// True for the null sentinel.
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Handle of a graphics buffer object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GraphicsBufferId(u32);

impl GraphicsBufferId {
    /// Wraps a raw handle.
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw handle (what the renderer binds).
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for GraphicsBufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gfx:{}", self.0)
    }
}

/// Binding target of a graphics buffer object.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferTarget {
    /// Vertex attributes (positions, colors).
    #[default]
    Vertex,
    /// Element indices.
    Index,
}

/// How the device side may use a registered graphics buffer when mapped.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum MapFlags {
    /// Contents survive the map.
    #[default]
    ReadWrite,
    /// Device writes, graphics consumes: prior contents may be dropped on map.
    WriteDiscard,
}

/// Which device each stage runs on. Passed explicitly to every component.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceConfig {
    /// Device advancing the simulation.
    pub compute: DeviceId,
    /// Device owning graphics buffers (may equal `compute`).
    pub render: DeviceId,
}

/// Device memory, transfers and graphics interop.
///
/// Allocation, transfer and mapping act on the calling thread's current
/// device (see [`DeviceBackend::set_current_device`]).
pub trait DeviceBackend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Number of devices addressable through this backend.
    fn device_count(&self) -> u32;

    /// Device selected on the calling thread.
    fn current_device(&self) -> DeviceId;

    /// Selects the device for the calling thread.
    ///
    /// # Errors
    ///
    /// [`DeviceError::UnknownDevice`](crate::DeviceError::UnknownDevice) if out of range.
    fn set_current_device(&self, device: DeviceId) -> DeviceResult<()>;

    /// Allocates `bytes` of device memory on the current device.
    ///
    /// # Errors
    ///
    /// Out of memory or backend failure.
    fn malloc(&self, bytes: usize) -> DeviceResult<DevicePtr>;

    /// Releases device memory. Freeing an unknown address is an error.
    ///
    /// # Errors
    ///
    /// Invalid pointer or backend failure.
    fn free(&self, ptr: DevicePtr) -> DeviceResult<()>;

    /// Copies `src` to device address `dst + offset`.
    ///
    /// # Errors
    ///
    /// Invalid pointer, wrong context, out of bounds or backend failure.
    fn copy_to_device(&self, dst: DevicePtr, offset: usize, src: &[u8]) -> DeviceResult<()>;

    /// Copies device bytes at `src + offset` into `dst`.
    ///
    /// # Errors
    ///
    /// Invalid pointer, wrong context, out of bounds or backend failure.
    fn copy_to_host(&self, src: DevicePtr, offset: usize, dst: &mut [u8]) -> DeviceResult<()>;

    /// Writes `pattern` `count` times starting at `dst + offset`.
    ///
    /// # Errors
    ///
    /// Same as [`DeviceBackend::copy_to_device`].
    fn fill(&self, dst: DevicePtr, offset: usize, pattern: &[u8], count: usize) -> DeviceResult<()> {
        let mut bytes = Vec::with_capacity(pattern.len() * count);
        for _ in 0..count {
            bytes.extend_from_slice(pattern);
        }
        self.copy_to_device(dst, offset, &bytes)
    }

    /// Creates a graphics buffer object of `bytes` bound to `target`.
    ///
    /// # Errors
    ///
    /// Backend failure.
    fn create_graphics_buffer(&self, bytes: usize, target: BufferTarget) -> DeviceResult<GraphicsBufferId>;

    /// Deletes a graphics buffer object. It must be unregistered first.
    ///
    /// # Errors
    ///
    /// Unknown or still registered buffer.
    fn delete_graphics_buffer(&self, id: GraphicsBufferId) -> DeviceResult<()>;

    /// Registers a graphics buffer for device access on the current device.
    ///
    /// # Errors
    ///
    /// Unknown or already registered buffer.
    fn register_graphics_buffer(&self, id: GraphicsBufferId, flags: MapFlags) -> DeviceResult<()>;

    /// Unregisters a graphics buffer. It must be unmapped first.
    ///
    /// # Errors
    ///
    /// Unknown, unregistered or still mapped buffer.
    fn unregister_graphics_buffer(&self, id: GraphicsBufferId) -> DeviceResult<()>;

    /// Maps a registered graphics buffer, returning its device address.
    ///
    /// # Errors
    ///
    /// Unknown, unregistered or already mapped buffer.
    fn map_graphics_buffer(&self, id: GraphicsBufferId) -> DeviceResult<DevicePtr>;

    /// Returns a mapped graphics buffer to the graphics subsystem.
    /// The address handed out by the map becomes invalid.
    ///
    /// # Errors
    ///
    /// Unknown or unmapped buffer.
    fn unmap_graphics_buffer(&self, id: GraphicsBufferId) -> DeviceResult<()>;
}

/// A backend plus the device a component works on.
#[derive(Clone)]
pub struct DeviceHandle {
    backend: Arc<dyn DeviceBackend>,
    id: DeviceId,
}

impl DeviceHandle {
    /// Creates a handle for `id` on `backend`.
    #[must_use]
    pub fn new(backend: Arc<dyn DeviceBackend>, id: DeviceId) -> Self {
        Self { backend, id }
    }

    /// Same backend, another device.
    #[must_use]
    pub fn with_device(&self, id: DeviceId) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            id,
        }
    }

    /// Device this handle targets.
    #[inline]
    #[must_use]
    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// The backend.
    #[inline]
    #[must_use]
    pub fn backend(&self) -> &dyn DeviceBackend {
        self.backend.as_ref()
    }

    /// Selects this handle's device on the calling thread until the guard drops.
    ///
    /// # Errors
    ///
    /// Fails if the backend rejects the device.
    pub fn enter(&self) -> DeviceResult<ContextGuard> {
        let previous = self.backend.current_device();
        if previous != self.id {
            self.backend.set_current_device(self.id)?;
        }
        Ok(ContextGuard {
            backend: Arc::clone(&self.backend),
            previous,
            entered: self.id,
            _thread_bound: PhantomData,
        })
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("backend", &self.backend.name())
            .field("id", &self.id)
            .finish()
    }
}

/// Scoped device selection. Restores the previous device on drop.
///
/// Not `Send`: the selection belongs to the thread that made it.
#[must_use = "the previous device is restored as soon as the guard is dropped"]
pub struct ContextGuard {
    backend: Arc<dyn DeviceBackend>,
    previous: DeviceId,
    entered: DeviceId,
    _thread_bound: PhantomData<*const ()>,
}

impl ContextGuard {
    /// Device selected while the guard lives.
    #[must_use]
    pub fn device(&self) -> DeviceId {
        self.entered
    }

    /// Device restored on drop.
    #[must_use]
    pub fn previous(&self) -> DeviceId {
        self.previous
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        if self.previous != self.entered {
            if let Err(err) = self.backend.set_current_device(self.previous) {
                tracing::warn!(
                    previous = %self.previous,
                    entered = %self.entered,
                    error = %err,
                    "failed to restore device context"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_devices() -> Arc<EmulatedDevice> {
        Arc::new(EmulatedDevice::new(EmulatedConfig {
            device_count: 2,
            ..EmulatedConfig::default()
        }))
    }

    #[test]
    fn test_guard_restores_previous_device() {
        let backend = two_devices();
        let handle = DeviceHandle::new(backend.clone(), DeviceId(1));

        assert_eq!(backend.current_device(), DeviceId(0));
        {
            let guard = handle.enter().unwrap();
            assert_eq!(guard.device(), DeviceId(1));
            assert_eq!(guard.previous(), DeviceId(0));
            assert_eq!(backend.current_device(), DeviceId(1));
        }
        assert_eq!(backend.current_device(), DeviceId(0));
    }

    #[test]
    fn test_nested_guards_unwind_in_order() {
        let backend = two_devices();
        let zero = DeviceHandle::new(backend.clone(), DeviceId(0));
        let one = zero.with_device(DeviceId(1));

        let outer = one.enter().unwrap();
        {
            let _inner = zero.enter().unwrap();
            assert_eq!(backend.current_device(), DeviceId(0));
        }
        assert_eq!(backend.current_device(), DeviceId(1));
        drop(outer);
        assert_eq!(backend.current_device(), DeviceId(0));
    }

    #[test]
    fn test_enter_unknown_device_fails() {
        let backend = two_devices();
        let handle = DeviceHandle::new(backend.clone(), DeviceId(7));
        assert!(handle.enter().is_err());
        assert_eq!(backend.current_device(), DeviceId(0));
    }

    #[test]
    fn test_null_sentinel() {
        assert!(DevicePtr::NULL.is_null());
        assert!(!DevicePtr::new(0x1000).is_null());
        assert_eq!(DevicePtr::new(0x1000).to_string(), "0x1000");
    }
}

//! # TANDEM Core
//!
//! Device-side resources for a simulation pipeline that overlaps compute,
//! snapshot writing and rendering:
//! - [`DualBuffer`]: host array plus one or two device slots with read/write roles
//! - [`InteropSession`]: scoped device access to graphics-owned buffers
//! - [`DeviceBackend`]: the seam to the hardware ([`EmulatedDevice`] always,
//!   `WgpuDevice` behind the `wgpu` feature)
//!
//! ## Architecture Rules
//!
//! 1. **Every resource released exactly once** - `free` is idempotent and `Drop` calls it
//! 2. **No process-wide device** - the current device is per thread and scoped by [`ContextGuard`]
//! 3. **Typed failures** - every operation returns a [`ResourceError`] the caller can classify
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use tandem_core::{BufferConfig, DeviceHandle, DeviceId, Direction, DualBuffer, EmulatedDevice, Role};
//!
//! let device = DeviceHandle::new(Arc::new(EmulatedDevice::default()), DeviceId(0));
//! let mut buf: DualBuffer<f32> = DualBuffer::new(device);
//! buf.alloc(BufferConfig::device(4).double_buffered())?;
//!
//! buf.write_device(Role::Write, 0, &[1.0, 2.0, 3.0, 4.0])?;
//! buf.swap()?;
//! buf.copy(Direction::DeviceToHost, 0, 0)?;
//! assert_eq!(buf.host(), &[1.0, 2.0, 3.0, 4.0]);
//! # Ok::<(), tandem_core::ResourceError>(())
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod buffer;
pub mod device;
pub mod error;
pub mod interop;

pub use buffer::{BufferConfig, Direction, DualBuffer, Role};
#[cfg(feature = "wgpu")]
pub use device::WgpuDevice;
pub use device::{
    BufferTarget, ContextGuard, DeviceBackend, DeviceConfig, DeviceHandle, DeviceId, DevicePtr,
    EmulatedConfig, EmulatedDevice, EmulatedStats, GraphicsBufferId, MapFlags,
};
pub use error::{
    DeviceError, DeviceResult, ErrorKind, InteropFault, ResourceError, ResourceResult, UsageFault,
};
pub use interop::{GraphicsInteropHandle, InteropSession, MapState};

//! In-process emulated device.
//!
//! Device memory is host memory owned by the backend, addressed through
//! opaque [`DevicePtr`]s that are never reused. Graphics buffer objects live
//! in a separate table and are only reachable from the device side while
//! mapped. Every allocation, registration and mapping is counted so tests
//! can assert that resources are released exactly once.

use std::collections::HashMap;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;

use super::{BufferTarget, DeviceBackend, DeviceId, DevicePtr, GraphicsBufferId, MapFlags};
use crate::error::{DeviceError, DeviceResult};

/// Alignment of emulated device addresses.
const ADDRESS_ALIGNMENT: u64 = 256;

/// First address handed out (keeps [`DevicePtr::NULL`] unambiguous).
const BASE_ADDRESS: u64 = 0x1000_0000;

/// Byte written over graphics buffers mapped with [`MapFlags::WriteDiscard`]
/// when [`EmulatedConfig::discard_on_map`] is set.
pub const DISCARD_POISON: u8 = 0xCD;

/// Configuration for [`EmulatedDevice`].
#[derive(Clone, Debug)]
pub struct EmulatedConfig {
    /// Number of devices.
    pub device_count: u32,
    /// Device memory per device in bytes.
    pub memory_per_device: usize,
    /// Poison write-discard buffers on every map.
    pub discard_on_map: bool,
}

impl Default for EmulatedConfig {
    fn default() -> Self {
        Self {
            device_count: 1,
            memory_per_device: 256 * 1024 * 1024,
            discard_on_map: false,
        }
    }
}

/// Resource counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EmulatedStats {
    /// Successful `malloc` calls.
    pub device_allocs: u64,
    /// Successful `free` calls.
    pub device_frees: u64,
    /// Graphics buffers created.
    pub graphics_created: u64,
    /// Graphics buffers deleted.
    pub graphics_deleted: u64,
    /// Registrations.
    pub registrations: u64,
    /// Unregistrations.
    pub unregistrations: u64,
    /// Maps.
    pub maps: u64,
    /// Unmaps.
    pub unmaps: u64,
    /// Bytes copied host to device.
    pub bytes_to_device: u64,
    /// Bytes copied device to host.
    pub bytes_to_host: u64,
}

impl EmulatedStats {
    /// Device allocations not yet freed.
    #[must_use]
    pub const fn live_device_allocations(&self) -> u64 {
        self.device_allocs - self.device_frees
    }

    /// Graphics buffers not yet deleted.
    #[must_use]
    pub const fn live_graphics_buffers(&self) -> u64 {
        self.graphics_created - self.graphics_deleted
    }

    /// Registrations not yet undone.
    #[must_use]
    pub const fn live_registrations(&self) -> u64 {
        self.registrations - self.unregistrations
    }

    /// Mappings not yet undone.
    #[must_use]
    pub const fn live_mappings(&self) -> u64 {
        self.maps - self.unmaps
    }

    /// True when nothing is held.
    #[must_use]
    pub const fn is_quiescent(&self) -> bool {
        self.live_device_allocations() == 0
            && self.live_graphics_buffers() == 0
            && self.live_registrations() == 0
            && self.live_mappings() == 0
    }
}

struct Allocation {
    device: DeviceId,
    bytes: Vec<u8>,
}

struct Registration {
    device: DeviceId,
    flags: MapFlags,
    mapped: Option<DevicePtr>,
}

struct GraphicsObject {
    bytes: Vec<u8>,
    target: BufferTarget,
    registration: Option<Registration>,
}

/// Countdowns; `Some(0)` fails the next call.
#[derive(Default)]
struct Faults {
    malloc_after: Option<u32>,
    graphics_after: Option<u32>,
    copies: u32,
    context_switches: u32,
}

impl Faults {
    fn trip(countdown: &mut Option<u32>) -> bool {
        match countdown {
            Some(0) => {
                *countdown = None;
                true
            }
            Some(n) => {
                *n -= 1;
                false
            }
            None => false,
        }
    }
}

struct State {
    next_addr: u64,
    next_graphics: u32,
    used: Vec<usize>,
    allocations: HashMap<DevicePtr, Allocation>,
    mappings: HashMap<DevicePtr, GraphicsBufferId>,
    graphics: HashMap<GraphicsBufferId, GraphicsObject>,
    stats: EmulatedStats,
    faults: Faults,
}

impl State {
    fn next_address(&mut self, bytes: usize) -> DevicePtr {
        let ptr = DevicePtr::new(self.next_addr);
        let span = (bytes as u64).max(1).div_ceil(ADDRESS_ALIGNMENT) * ADDRESS_ALIGNMENT;
        self.next_addr += span;
        ptr
    }

    /// Resolves a device address to its owning device and backing bytes.
    fn region_mut(&mut self, ptr: DevicePtr) -> DeviceResult<(DeviceId, &mut Vec<u8>)> {
        if self.allocations.contains_key(&ptr) {
            let alloc = self
                .allocations
                .get_mut(&ptr)
                .ok_or(DeviceError::InvalidPointer(ptr))?;
            return Ok((alloc.device, &mut alloc.bytes));
        }
        let id = *self.mappings.get(&ptr).ok_or(DeviceError::InvalidPointer(ptr))?;
        let object = self
            .graphics
            .get_mut(&id)
            .ok_or(DeviceError::UnknownGraphicsBuffer(id))?;
        let device = object
            .registration
            .as_ref()
            .map(|reg| reg.device)
            .ok_or(DeviceError::NotRegistered(id))?;
        Ok((device, &mut object.bytes))
    }

    fn object_mut(&mut self, id: GraphicsBufferId) -> DeviceResult<&mut GraphicsObject> {
        self.graphics
            .get_mut(&id)
            .ok_or(DeviceError::UnknownGraphicsBuffer(id))
    }
}

fn check_bounds(offset: usize, len: usize, size: usize) -> DeviceResult<std::ops::Range<usize>> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(offset..end),
        _ => Err(DeviceError::OutOfBounds { offset, len, size }),
    }
}

/// In-process device backend.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use tandem_core::{BufferConfig, DeviceHandle, DeviceId, DualBuffer, EmulatedDevice};
///
/// let device = Arc::new(EmulatedDevice::default());
/// let mut buffer: DualBuffer<f32> = DualBuffer::new(DeviceHandle::new(device.clone(), DeviceId(0)));
/// buffer.alloc(BufferConfig::device(16)).unwrap();
/// buffer.free().unwrap();
/// assert!(device.stats().is_quiescent());
/// ```
pub struct EmulatedDevice {
    config: EmulatedConfig,
    state: Mutex<State>,
    current: Mutex<HashMap<ThreadId, DeviceId>>,
}

impl EmulatedDevice {
    /// Creates an emulated backend.
    #[must_use]
    pub fn new(config: EmulatedConfig) -> Self {
        let devices = config.device_count.max(1) as usize;
        Self {
            state: Mutex::new(State {
                next_addr: BASE_ADDRESS,
                next_graphics: 1,
                used: vec![0; devices],
                allocations: HashMap::new(),
                mappings: HashMap::new(),
                graphics: HashMap::new(),
                stats: EmulatedStats::default(),
                faults: Faults::default(),
            }),
            current: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Snapshot of the resource counters.
    #[must_use]
    pub fn stats(&self) -> EmulatedStats {
        self.state.lock().stats
    }

    /// Bytes of device memory in use on `device`.
    #[must_use]
    pub fn used_bytes(&self, device: DeviceId) -> usize {
        self.state
            .lock()
            .used
            .get(device.0 as usize)
            .copied()
            .unwrap_or(0)
    }

    /// Fails the `malloc` that follows `after` successful ones.
    pub fn fail_malloc_after(&self, after: u32) {
        self.state.lock().faults.malloc_after = Some(after);
    }

    /// Fails the graphics buffer creation that follows `after` successful ones.
    pub fn fail_graphics_after(&self, after: u32) {
        self.state.lock().faults.graphics_after = Some(after);
    }

    /// Fails the next `count` host/device copies before they touch memory.
    pub fn fail_next_copies(&self, count: u32) {
        self.state.lock().faults.copies = count;
    }

    /// Fails the next `count` device selections on any thread.
    pub fn fail_next_context_switches(&self, count: u32) {
        self.state.lock().faults.context_switches = count;
    }

    /// Threads with a non-default device selected.
    #[must_use]
    pub fn selected_threads(&self) -> usize {
        self.current.lock().len()
    }

    /// Reads a graphics buffer the way the renderer consumes it.
    ///
    /// # Errors
    ///
    /// [`DeviceError::StillMapped`] while the device side owns the buffer.
    pub fn graphics_contents(&self, id: GraphicsBufferId) -> DeviceResult<Vec<u8>> {
        let mut state = self.state.lock();
        let object = state.object_mut(id)?;
        if object
            .registration
            .as_ref()
            .is_some_and(|reg| reg.mapped.is_some())
        {
            return Err(DeviceError::StillMapped(id));
        }
        Ok(object.bytes.clone())
    }

    /// Binding target a graphics buffer was created with.
    #[must_use]
    pub fn graphics_target(&self, id: GraphicsBufferId) -> Option<BufferTarget> {
        self.state.lock().graphics.get(&id).map(|object| object.target)
    }

    fn check_device(&self, device: DeviceId) -> DeviceResult<()> {
        if device.0 < self.config.device_count.max(1) {
            Ok(())
        } else {
            Err(DeviceError::UnknownDevice(device))
        }
    }

    fn check_context(&self, ptr: DevicePtr, owner: DeviceId) -> DeviceResult<()> {
        let current = self.current_device();
        if current == owner {
            Ok(())
        } else {
            Err(DeviceError::WrongContext {
                ptr,
                owner,
                current,
            })
        }
    }
}

impl Default for EmulatedDevice {
    fn default() -> Self {
        Self::new(EmulatedConfig::default())
    }
}

impl std::fmt::Debug for EmulatedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmulatedDevice")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl DeviceBackend for EmulatedDevice {
    fn name(&self) -> &'static str {
        "emulated"
    }

    fn device_count(&self) -> u32 {
        self.config.device_count.max(1)
    }

    fn current_device(&self) -> DeviceId {
        self.current
            .lock()
            .get(&thread::current().id())
            .copied()
            .unwrap_or_default()
    }

    fn set_current_device(&self, device: DeviceId) -> DeviceResult<()> {
        self.check_device(device)?;
        {
            let mut state = self.state.lock();
            if state.faults.context_switches > 0 {
                state.faults.context_switches -= 1;
                return Err(DeviceError::Injected("set_current_device"));
            }
        }
        let mut current = self.current.lock();
        if device == DeviceId::default() {
            current.remove(&thread::current().id());
        } else {
            current.insert(thread::current().id(), device);
        }
        Ok(())
    }

    fn malloc(&self, bytes: usize) -> DeviceResult<DevicePtr> {
        let device = self.current_device();
        let mut state = self.state.lock();
        if Faults::trip(&mut state.faults.malloc_after) {
            return Err(DeviceError::Injected("malloc"));
        }
        let used = state.used[device.0 as usize];
        let available = self.config.memory_per_device.saturating_sub(used);
        if bytes > available {
            return Err(DeviceError::OutOfMemory {
                requested: bytes,
                available,
            });
        }
        let ptr = state.next_address(bytes);
        state.allocations.insert(
            ptr,
            Allocation {
                device,
                bytes: vec![0; bytes],
            },
        );
        state.used[device.0 as usize] += bytes;
        state.stats.device_allocs += 1;
        Ok(ptr)
    }

    fn free(&self, ptr: DevicePtr) -> DeviceResult<()> {
        let mut state = self.state.lock();
        let alloc = state
            .allocations
            .remove(&ptr)
            .ok_or(DeviceError::InvalidPointer(ptr))?;
        state.used[alloc.device.0 as usize] -= alloc.bytes.len();
        state.stats.device_frees += 1;
        Ok(())
    }

    fn copy_to_device(&self, dst: DevicePtr, offset: usize, src: &[u8]) -> DeviceResult<()> {
        let current = self.current_device();
        let mut state = self.state.lock();
        if state.faults.copies > 0 {
            state.faults.copies -= 1;
            return Err(DeviceError::Injected("copy"));
        }
        let (owner, bytes) = state.region_mut(dst)?;
        if owner != current {
            return Err(DeviceError::WrongContext {
                ptr: dst,
                owner,
                current,
            });
        }
        let range = check_bounds(offset, src.len(), bytes.len())?;
        bytes[range].copy_from_slice(src);
        state.stats.bytes_to_device += src.len() as u64;
        Ok(())
    }

    fn copy_to_host(&self, src: DevicePtr, offset: usize, dst: &mut [u8]) -> DeviceResult<()> {
        let current = self.current_device();
        let mut state = self.state.lock();
        if state.faults.copies > 0 {
            state.faults.copies -= 1;
            return Err(DeviceError::Injected("copy"));
        }
        let (owner, bytes) = state.region_mut(src)?;
        if owner != current {
            return Err(DeviceError::WrongContext {
                ptr: src,
                owner,
                current,
            });
        }
        let range = check_bounds(offset, dst.len(), bytes.len())?;
        dst.copy_from_slice(&bytes[range]);
        state.stats.bytes_to_host += dst.len() as u64;
        Ok(())
    }

    fn create_graphics_buffer(&self, bytes: usize, target: BufferTarget) -> DeviceResult<GraphicsBufferId> {
        let mut state = self.state.lock();
        if Faults::trip(&mut state.faults.graphics_after) {
            return Err(DeviceError::Injected("graphics buffer creation"));
        }
        let id = GraphicsBufferId::new(state.next_graphics);
        state.next_graphics += 1;
        state.graphics.insert(
            id,
            GraphicsObject {
                bytes: vec![0; bytes],
                target,
                registration: None,
            },
        );
        state.stats.graphics_created += 1;
        Ok(id)
    }

    fn delete_graphics_buffer(&self, id: GraphicsBufferId) -> DeviceResult<()> {
        let mut state = self.state.lock();
        if state.object_mut(id)?.registration.is_some() {
            return Err(DeviceError::StillRegistered(id));
        }
        state.graphics.remove(&id);
        state.stats.graphics_deleted += 1;
        Ok(())
    }

    fn register_graphics_buffer(&self, id: GraphicsBufferId, flags: MapFlags) -> DeviceResult<()> {
        let device = self.current_device();
        let mut state = self.state.lock();
        let object = state.object_mut(id)?;
        if object.registration.is_some() {
            return Err(DeviceError::AlreadyRegistered(id));
        }
        object.registration = Some(Registration {
            device,
            flags,
            mapped: None,
        });
        state.stats.registrations += 1;
        Ok(())
    }

    fn unregister_graphics_buffer(&self, id: GraphicsBufferId) -> DeviceResult<()> {
        let mut state = self.state.lock();
        let object = state.object_mut(id)?;
        match &object.registration {
            None => return Err(DeviceError::NotRegistered(id)),
            Some(reg) if reg.mapped.is_some() => return Err(DeviceError::StillMapped(id)),
            Some(_) => object.registration = None,
        }
        state.stats.unregistrations += 1;
        Ok(())
    }

    fn map_graphics_buffer(&self, id: GraphicsBufferId) -> DeviceResult<DevicePtr> {
        let discard = self.config.discard_on_map;
        let mut state = self.state.lock();
        let (owner, len) = {
            let object = state.object_mut(id)?;
            let reg = object
                .registration
                .as_ref()
                .ok_or(DeviceError::NotRegistered(id))?;
            if reg.mapped.is_some() {
                return Err(DeviceError::AlreadyMapped(id));
            }
            (reg.device, object.bytes.len())
        };
        self.check_context(DevicePtr::NULL, owner)?;

        let ptr = state.next_address(len);
        let object = state.object_mut(id)?;
        if let Some(reg) = object.registration.as_mut() {
            reg.mapped = Some(ptr);
            if discard && reg.flags == MapFlags::WriteDiscard {
                object.bytes.fill(DISCARD_POISON);
            }
        }
        state.mappings.insert(ptr, id);
        state.stats.maps += 1;
        Ok(ptr)
    }

    fn unmap_graphics_buffer(&self, id: GraphicsBufferId) -> DeviceResult<()> {
        let mut state = self.state.lock();
        let object = state.object_mut(id)?;
        let ptr = object
            .registration
            .as_mut()
            .ok_or(DeviceError::NotRegistered(id))?
            .mapped
            .take()
            .ok_or(DeviceError::NotMapped(id))?;
        state.mappings.remove(&ptr);
        state.stats.unmaps += 1;
        Ok(())
    }
}

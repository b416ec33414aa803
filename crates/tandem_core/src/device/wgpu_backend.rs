//! wgpu-backed device.
//!
//! Device memory is a `STORAGE` buffer, graphics buffer objects are `VERTEX`
//! or `INDEX` buffers the renderer can bind directly. wgpu has no separate
//! "registered for compute" state, so registration and mapping are tracked
//! here and a map hands out a fresh alias address for the same buffer.
//!
//! Host writes go through [`wgpu::Queue::write_buffer`]; reads copy into a
//! `MAP_READ` staging buffer and block on `poll(Maintain::Wait)`.

use std::collections::HashMap;
use std::sync::mpsc;

use parking_lot::Mutex;

use super::{BufferTarget, DeviceBackend, DeviceId, DevicePtr, GraphicsBufferId, MapFlags};
use crate::error::{DeviceError, DeviceResult};

const BASE_ADDRESS: u64 = 0x1000_0000;

struct GraphicsEntry {
    buffer: wgpu::Buffer,
    registered: bool,
    mapped: Option<DevicePtr>,
}

#[derive(Default)]
struct State {
    next_addr: u64,
    next_graphics: u32,
    allocations: HashMap<DevicePtr, wgpu::Buffer>,
    graphics: HashMap<GraphicsBufferId, GraphicsEntry>,
    mappings: HashMap<DevicePtr, GraphicsBufferId>,
}

impl State {
    fn next_address(&mut self, bytes: u64) -> DevicePtr {
        let ptr = DevicePtr::new(self.next_addr);
        self.next_addr += bytes.max(1).div_ceil(256) * 256;
        ptr
    }

    fn buffer(&self, ptr: DevicePtr) -> DeviceResult<&wgpu::Buffer> {
        if let Some(buffer) = self.allocations.get(&ptr) {
            return Ok(buffer);
        }
        let id = self.mappings.get(&ptr).ok_or(DeviceError::InvalidPointer(ptr))?;
        self.graphics
            .get(id)
            .map(|entry| &entry.buffer)
            .ok_or(DeviceError::UnknownGraphicsBuffer(*id))
    }
}

fn check_alignment(offset: usize, len: usize) -> DeviceResult<()> {
    let align = wgpu::COPY_BUFFER_ALIGNMENT as usize;
    if offset % align == 0 && len % align == 0 {
        Ok(())
    } else {
        Err(DeviceError::Backend(format!(
            "transfer of {len} bytes at offset {offset} is not {align}-byte aligned"
        )))
    }
}

fn check_bounds(buffer: &wgpu::Buffer, offset: usize, len: usize) -> DeviceResult<()> {
    let size = buffer.size() as usize;
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(DeviceError::OutOfBounds { offset, len, size }),
    }
}

/// Single-device backend on top of wgpu.
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    state: Mutex<State>,
}

impl WgpuDevice {
    /// Wraps an existing device and queue (e.g. the renderer's).
    #[must_use]
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        Self {
            device,
            queue,
            state: Mutex::new(State {
                next_addr: BASE_ADDRESS,
                next_graphics: 1,
                ..State::default()
            }),
        }
    }

    /// Requests the default adapter and a device on it.
    ///
    /// # Errors
    ///
    /// [`DeviceError::Backend`] if no adapter is available or the device request fails.
    pub fn request() -> DeviceResult<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))
            .ok_or_else(|| DeviceError::Backend("no suitable adapter".to_string()))?;
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor::default(), None))
            .map_err(|err| DeviceError::Backend(err.to_string()))?;
        tracing::info!(adapter = ?adapter.get_info().name, "wgpu device ready");
        Ok(Self::new(device, queue))
    }

    /// Runs `f` on the wgpu buffer behind a graphics buffer object.
    pub fn with_graphics_buffer<R>(&self, id: GraphicsBufferId, f: impl FnOnce(&wgpu::Buffer) -> R) -> Option<R> {
        self.state.lock().graphics.get(&id).map(|entry| f(&entry.buffer))
    }

    fn usage_for(target: Option<BufferTarget>) -> wgpu::BufferUsages {
        let base = wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST;
        match target {
            None => base,
            Some(BufferTarget::Vertex) => base | wgpu::BufferUsages::VERTEX,
            Some(BufferTarget::Index) => base | wgpu::BufferUsages::INDEX,
        }
    }

    fn create(&self, bytes: usize, target: Option<BufferTarget>) -> wgpu::Buffer {
        let size = (bytes as u64).div_ceil(wgpu::COPY_BUFFER_ALIGNMENT) * wgpu::COPY_BUFFER_ALIGNMENT;
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("tandem"),
            size: size.max(wgpu::COPY_BUFFER_ALIGNMENT),
            usage: Self::usage_for(target),
            mapped_at_creation: false,
        })
    }
}

impl std::fmt::Debug for WgpuDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("WgpuDevice")
            .field("allocations", &state.allocations.len())
            .field("graphics", &state.graphics.len())
            .finish_non_exhaustive()
    }
}

impl DeviceBackend for WgpuDevice {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn device_count(&self) -> u32 {
        1
    }

    fn current_device(&self) -> DeviceId {
        DeviceId(0)
    }

    fn set_current_device(&self, device: DeviceId) -> DeviceResult<()> {
        if device == DeviceId(0) {
            Ok(())
        } else {
            Err(DeviceError::UnknownDevice(device))
        }
    }

    fn malloc(&self, bytes: usize) -> DeviceResult<DevicePtr> {
        let buffer = self.create(bytes, None);
        let mut state = self.state.lock();
        let ptr = state.next_address(buffer.size());
        state.allocations.insert(ptr, buffer);
        Ok(ptr)
    }

    fn free(&self, ptr: DevicePtr) -> DeviceResult<()> {
        let buffer = self
            .state
            .lock()
            .allocations
            .remove(&ptr)
            .ok_or(DeviceError::InvalidPointer(ptr))?;
        buffer.destroy();
        Ok(())
    }

    fn copy_to_device(&self, dst: DevicePtr, offset: usize, src: &[u8]) -> DeviceResult<()> {
        check_alignment(offset, src.len())?;
        let state = self.state.lock();
        let buffer = state.buffer(dst)?;
        check_bounds(buffer, offset, src.len())?;
        self.queue.write_buffer(buffer, offset as u64, src);
        self.queue.submit(std::iter::empty());
        Ok(())
    }

    fn copy_to_host(&self, src: DevicePtr, offset: usize, dst: &mut [u8]) -> DeviceResult<()> {
        check_alignment(offset, dst.len())?;
        if dst.is_empty() {
            return Ok(());
        }
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("tandem readback"),
            size: dst.len() as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        {
            let state = self.state.lock();
            let buffer = state.buffer(src)?;
            check_bounds(buffer, offset, dst.len())?;
            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("tandem readback") });
            encoder.copy_buffer_to_buffer(buffer, offset as u64, &staging, 0, dst.len() as u64);
            self.queue.submit(Some(encoder.finish()));
        }

        let slice = staging.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        if !self.device.poll(wgpu::Maintain::Wait).is_queue_empty() {
            tracing::warn!(offset, bytes = dst.len(), "readback poll returned with work still queued");
        }
        rx.recv()
            .map_err(|_| DeviceError::Backend("readback callback dropped".to_string()))?
            .map_err(|err| DeviceError::Backend(err.to_string()))?;
        dst.copy_from_slice(&slice.get_mapped_range());
        staging.unmap();
        Ok(())
    }

    fn create_graphics_buffer(&self, bytes: usize, target: BufferTarget) -> DeviceResult<GraphicsBufferId> {
        let buffer = self.create(bytes, Some(target));
        let mut state = self.state.lock();
        let id = GraphicsBufferId::new(state.next_graphics);
        state.next_graphics += 1;
        state.graphics.insert(
            id,
            GraphicsEntry {
                buffer,
                registered: false,
                mapped: None,
            },
        );
        Ok(id)
    }

    fn delete_graphics_buffer(&self, id: GraphicsBufferId) -> DeviceResult<()> {
        let mut state = self.state.lock();
        match state.graphics.get(&id) {
            None => return Err(DeviceError::UnknownGraphicsBuffer(id)),
            Some(entry) if entry.registered => return Err(DeviceError::StillRegistered(id)),
            Some(_) => {}
        }
        if let Some(entry) = state.graphics.remove(&id) {
            entry.buffer.destroy();
        }
        Ok(())
    }

    fn register_graphics_buffer(&self, id: GraphicsBufferId, _flags: MapFlags) -> DeviceResult<()> {
        let mut state = self.state.lock();
        let entry = state
            .graphics
            .get_mut(&id)
            .ok_or(DeviceError::UnknownGraphicsBuffer(id))?;
        if entry.registered {
            return Err(DeviceError::AlreadyRegistered(id));
        }
        entry.registered = true;
        Ok(())
    }

    fn unregister_graphics_buffer(&self, id: GraphicsBufferId) -> DeviceResult<()> {
        let mut state = self.state.lock();
        let entry = state
            .graphics
            .get_mut(&id)
            .ok_or(DeviceError::UnknownGraphicsBuffer(id))?;
        if !entry.registered {
            return Err(DeviceError::NotRegistered(id));
        }
        if entry.mapped.is_some() {
            return Err(DeviceError::StillMapped(id));
        }
        entry.registered = false;
        Ok(())
    }

    fn map_graphics_buffer(&self, id: GraphicsBufferId) -> DeviceResult<DevicePtr> {
        let mut state = self.state.lock();
        let size = {
            let entry = state.graphics.get(&id).ok_or(DeviceError::UnknownGraphicsBuffer(id))?;
            if !entry.registered {
                return Err(DeviceError::NotRegistered(id));
            }
            if entry.mapped.is_some() {
                return Err(DeviceError::AlreadyMapped(id));
            }
            entry.buffer.size()
        };
        let ptr = state.next_address(size);
        if let Some(entry) = state.graphics.get_mut(&id) {
            entry.mapped = Some(ptr);
        }
        state.mappings.insert(ptr, id);
        Ok(ptr)
    }

    fn unmap_graphics_buffer(&self, id: GraphicsBufferId) -> DeviceResult<()> {
        let mut state = self.state.lock();
        let entry = state
            .graphics
            .get_mut(&id)
            .ok_or(DeviceError::UnknownGraphicsBuffer(id))?;
        if !entry.registered {
            return Err(DeviceError::NotRegistered(id));
        }
        let ptr = entry.mapped.take().ok_or(DeviceError::NotMapped(id))?;
        state.mappings.remove(&ptr);
        Ok(())
    }
}

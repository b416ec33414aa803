//! Integration tests for the DualBuffer lifecycle against the emulated device.

use std::sync::Arc;

use tandem_core::{
    BufferConfig, BufferTarget, DeviceBackend, DeviceHandle, DeviceId, Direction, DualBuffer,
    EmulatedConfig, EmulatedDevice, ErrorKind, ResourceError, Role,
};

fn device(count: u32) -> Arc<EmulatedDevice> {
    Arc::new(EmulatedDevice::new(EmulatedConfig {
        device_count: count,
        ..EmulatedConfig::default()
    }))
}

fn configs(size: usize) -> Vec<BufferConfig> {
    let mut all = Vec::new();
    for graphics in [false, true] {
        let base = if graphics {
            BufferConfig::graphics(size, BufferTarget::Vertex)
        } else {
            BufferConfig::device(size)
        };
        all.push(base);
        all.push(base.double_buffered());
    }
    all
}

#[test]
fn test_alloc_free_releases_everything_once() {
    for size in [1, 7, 1024] {
        for config in configs(size) {
            let backend = device(1);
            let mut buf: DualBuffer<f32> = DualBuffer::new(DeviceHandle::new(backend.clone(), DeviceId(0)));
            buf.alloc(config).unwrap();

            let slots = if config.double_buffered { 2 } else { 1 };
            let stats = backend.stats();
            if config.use_graphics_buffer {
                assert_eq!(stats.graphics_created, slots);
                assert_eq!(stats.registrations, slots);
                assert_eq!(stats.device_allocs, 0);
            } else {
                assert_eq!(stats.device_allocs, slots);
                assert_eq!(stats.graphics_created, 0);
            }

            buf.free().unwrap();
            buf.free().unwrap();
            let stats = backend.stats();
            assert!(stats.is_quiescent(), "{config:?} left {stats:?}");
            assert_eq!(stats.device_frees, stats.device_allocs);
            assert_eq!(stats.graphics_deleted, stats.graphics_created);
            assert_eq!(backend.used_bytes(DeviceId(0)), 0);
        }
    }
}

#[test]
fn test_drop_frees() {
    let backend = device(1);
    {
        let mut buf: DualBuffer<u64> = DualBuffer::new(DeviceHandle::new(backend.clone(), DeviceId(0)));
        buf.alloc(BufferConfig::graphics(32, BufferTarget::Index).double_buffered())
            .unwrap();
        buf.map().unwrap();
    }
    assert!(backend.stats().is_quiescent());
}

#[test]
fn test_failed_alloc_leaks_nothing() {
    let backend = device(1);
    backend.fail_malloc_after(1);
    let mut buf: DualBuffer<f32> = DualBuffer::new(DeviceHandle::new(backend.clone(), DeviceId(0)));

    let err = buf.alloc(BufferConfig::device(64).double_buffered()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Allocation);
    assert!(!buf.is_allocated());
    assert!(backend.stats().is_quiescent());
    assert_eq!(backend.stats().device_allocs, 1);
    buf.free().unwrap();

    backend.fail_graphics_after(1);
    let err = buf
        .alloc(BufferConfig::graphics(64, BufferTarget::Vertex).double_buffered())
        .unwrap_err();
    assert!(matches!(err, ResourceError::Allocation { elements: 64, bytes: 256, .. }));
    assert!(backend.stats().is_quiescent());
}

#[test]
fn test_out_of_memory_is_allocation_error() {
    let backend = Arc::new(EmulatedDevice::new(EmulatedConfig {
        memory_per_device: 1024,
        ..EmulatedConfig::default()
    }));
    let mut buf: DualBuffer<f32> = DualBuffer::new(DeviceHandle::new(backend.clone(), DeviceId(0)));
    let err = buf.alloc(BufferConfig::device(200).double_buffered()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Allocation);
    assert!(!err.is_retryable());
    assert_eq!(backend.used_bytes(DeviceId(0)), 0);
}

#[test]
fn test_swap_is_an_involution() {
    let backend = device(1);
    let mut buf: DualBuffer<f32> = DualBuffer::new(DeviceHandle::new(backend, DeviceId(0)));
    buf.alloc(BufferConfig::device(16).double_buffered()).unwrap();
    let read = buf.device_ptr().unwrap();
    let write = buf.device_write_ptr().unwrap();

    for _ in 0..5 {
        buf.swap().unwrap();
        assert_ne!(buf.current_read(), buf.current_write());
    }
    assert_eq!(buf.device_ptr().unwrap(), write);
    buf.swap().unwrap();
    assert_eq!(buf.device_ptr().unwrap(), read);
    assert_eq!(buf.device_write_ptr().unwrap(), write);
}

#[test]
fn test_write_role_swap_then_download() {
    let backend = device(1);
    let mut buf: DualBuffer<f32> = DualBuffer::new(DeviceHandle::new(backend, DeviceId(0)));
    buf.alloc(BufferConfig::device(4).double_buffered()).unwrap();

    buf.write_device(Role::Write, 0, &[1.0, 2.0, 3.0, 4.0]).unwrap();
    buf.swap().unwrap();
    buf.copy(Direction::DeviceToHost, 0, 0).unwrap();
    assert_eq!(buf.host(), &[1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn test_context_restored_after_copy() {
    let backend = device(2);
    let mut buf: DualBuffer<u32> = DualBuffer::new(DeviceHandle::new(backend.clone(), DeviceId(1)));
    buf.alloc(BufferConfig::device(8)).unwrap();
    assert_eq!(backend.current_device(), DeviceId(0));

    buf.copy_all(Direction::HostToDevice).unwrap();
    assert_eq!(backend.current_device(), DeviceId(0));

    backend.fail_next_copies(1);
    assert!(buf.copy_all(Direction::DeviceToHost).is_err());
    assert_eq!(backend.current_device(), DeviceId(0));

    assert!(buf.copy(Direction::HostToDevice, 4, 8).is_err());
    assert_eq!(backend.current_device(), DeviceId(0));
}

#[test]
fn test_render_device_buffers_from_compute_thread() {
    let backend = device(2);
    let compute = DeviceHandle::new(backend.clone(), DeviceId(0));
    let render = compute.with_device(DeviceId(1));

    let mut positions: DualBuffer<f32> = DualBuffer::new(compute);
    let mut vertices: DualBuffer<f32> = DualBuffer::new(render);
    positions.alloc(BufferConfig::device(4)).unwrap();
    vertices.alloc(BufferConfig::graphics(4, BufferTarget::Vertex)).unwrap();

    positions.set_host(&[0.5, 1.5, 2.5, 3.5]).unwrap();
    positions.copy_all(Direction::HostToDevice).unwrap();
    vertices.set_host(positions.host()).unwrap();
    vertices.copy_all(Direction::HostToDevice).unwrap();

    assert_eq!(backend.current_device(), DeviceId(0));
    let id = vertices.graphics_buffer().unwrap();
    assert_eq!(
        backend.graphics_contents(id).unwrap(),
        bytemuck::cast_slice::<f32, u8>(&[0.5, 1.5, 2.5, 3.5])
    );
}

#[test]
fn test_transfer_failure_leaves_contents() {
    let backend = device(1);
    let mut buf: DualBuffer<u32> = DualBuffer::new(DeviceHandle::new(backend.clone(), DeviceId(0)));
    buf.alloc(BufferConfig::device(4)).unwrap();
    buf.set_host(&[1, 2, 3, 4]).unwrap();
    buf.copy_all(Direction::HostToDevice).unwrap();

    buf.set_host(&[9, 9, 9, 9]).unwrap();
    backend.fail_next_copies(1);
    let err = buf.copy_all(Direction::HostToDevice).unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(buf.host(), &[9, 9, 9, 9]);

    backend.fail_next_copies(1);
    assert!(buf.copy_all(Direction::DeviceToHost).is_err());
    assert_eq!(buf.host(), &[9, 9, 9, 9]);

    buf.copy_all(Direction::DeviceToHost).unwrap();
    assert_eq!(buf.host(), &[1, 2, 3, 4]);
}

#[test]
fn test_set_host_length_checked() {
    let backend = device(1);
    let mut buf: DualBuffer<u32> = DualBuffer::new(DeviceHandle::new(backend, DeviceId(0)));
    buf.alloc(BufferConfig::device(4)).unwrap();
    let err = buf.set_host(&[1, 2, 3]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Usage);
    assert!(err.to_string().contains("expected 4 host elements, got 3"));
}

#[test]
fn test_free_retried_when_device_cannot_be_selected() {
    let backend = device(2);
    let mut buf: DualBuffer<f32> = DualBuffer::new(DeviceHandle::new(backend.clone(), DeviceId(1)));
    buf.alloc(BufferConfig::graphics(16, BufferTarget::Vertex).double_buffered())
        .unwrap();

    backend.fail_next_context_switches(1);
    let err = buf.free().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Allocation);
    assert!(buf.is_allocated());
    let stats = backend.stats();
    assert_eq!(stats.graphics_deleted, 0);
    assert!(!stats.is_quiescent());

    buf.free().unwrap();
    assert!(!buf.is_allocated());
    let stats = backend.stats();
    assert!(stats.is_quiescent(), "{stats:?}");
    assert_eq!(stats.graphics_deleted, 2);
}

#[test]
fn test_drop_after_deferred_free_releases() {
    let backend = device(2);
    {
        let mut buf: DualBuffer<u32> = DualBuffer::new(DeviceHandle::new(backend.clone(), DeviceId(1)));
        buf.alloc(BufferConfig::device(8)).unwrap();
        backend.fail_next_context_switches(1);
        assert!(buf.free().is_err());
    }
    assert!(backend.stats().is_quiescent());
}

#[test]
fn test_context_selection_does_not_accumulate_threads() {
    let backend = device(2);
    let handle = DeviceHandle::new(backend.clone(), DeviceId(1));
    let workers: Vec<_> = (0..8)
        .map(|_| {
            let handle = handle.clone();
            std::thread::spawn(move || {
                let ctx = handle.enter().unwrap();
                assert_eq!(ctx.device(), DeviceId(1));
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(backend.selected_threads(), 0);

    let ctx = handle.enter().unwrap();
    assert_eq!(backend.selected_threads(), 1);
    drop(ctx);
    assert_eq!(backend.selected_threads(), 0);
}

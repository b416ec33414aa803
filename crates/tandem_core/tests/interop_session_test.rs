//! Graphics interop: device writes bracketed by map/unmap.

use std::sync::Arc;

use tandem_core::{
    BufferConfig, BufferTarget, DeviceError, DeviceHandle, DeviceId, DevicePtr, DualBuffer,
    EmulatedConfig, EmulatedDevice, ErrorKind, InteropFault, ResourceError, Role,
};

fn graphics_buffer(backend: &Arc<EmulatedDevice>, size: usize) -> DualBuffer<f32> {
    let mut buf = DualBuffer::new(DeviceHandle::new(backend.clone(), DeviceId(0)));
    buf.alloc(BufferConfig::graphics(size, BufferTarget::Vertex).double_buffered())
        .unwrap();
    buf
}

#[test]
fn test_map_write_unmap_invalidates_pointer() {
    let backend = Arc::new(EmulatedDevice::default());
    let mut buf = graphics_buffer(&backend, 4);

    buf.map().unwrap();
    let ptr = buf.device_write_ptr().unwrap();
    assert_ne!(ptr, DevicePtr::NULL);
    buf.write_device(Role::Write, 0, &[1.0, 2.0, 3.0, 4.0]).unwrap();
    buf.unmap().unwrap();

    let err = buf.device_write_ptr().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Interop);
    assert!(matches!(
        err,
        ResourceError::Interop { slot: 1, role: Role::Write, fault: InteropFault::NotMapped, .. }
    ));
    assert!(buf.device_ptr_or_null().is_null());

    // The renderer sees what the device wrote.
    let id = buf.write_graphics_buffer().unwrap();
    assert_eq!(
        backend.graphics_contents(id).unwrap(),
        bytemuck::cast_slice::<f32, u8>(&[1.0, 2.0, 3.0, 4.0])
    );
}

#[test]
fn test_graphics_consumer_refused_while_mapped() {
    let backend = Arc::new(EmulatedDevice::default());
    let mut buf = graphics_buffer(&backend, 4);
    let id = buf.graphics_buffer().unwrap();

    let session = buf.interop_session().unwrap();
    assert_eq!(backend.graphics_contents(id), Err(DeviceError::StillMapped(id)));
    session.end().unwrap();
    assert!(backend.graphics_contents(id).is_ok());
}

#[test]
fn test_swap_moves_graphics_handles_with_roles() {
    let backend = Arc::new(EmulatedDevice::default());
    let mut buf = graphics_buffer(&backend, 2);
    let read = buf.graphics_buffer().unwrap();
    let write = buf.write_graphics_buffer().unwrap();
    assert_ne!(read, write);

    buf.swap().unwrap();
    assert_eq!(buf.graphics_buffer(), Some(write));
    assert_eq!(buf.write_graphics_buffer(), Some(read));
}

#[test]
fn test_write_discard_contents_dropped_on_map() {
    let backend = Arc::new(EmulatedDevice::new(EmulatedConfig {
        discard_on_map: true,
        ..EmulatedConfig::default()
    }));
    let mut buf = graphics_buffer(&backend, 1);

    {
        let session = buf.interop_session().unwrap();
        session.write(Role::Read, 0, &[42.0]).unwrap();
    }
    let mut out = [0.0f32];
    let session = buf.interop_session().unwrap();
    session.read(Role::Read, 0, &mut out).unwrap();
    assert_ne!(out[0], 42.0);
}

//! Property tests for host/device transfers.
//!
//! Upload then download over the same range must reproduce the host data,
//! for raw and graphics-backed slots alike.

use std::sync::Arc;

use proptest::prelude::*;
use tandem_core::{BufferConfig, BufferTarget, DeviceHandle, DeviceId, Direction, DualBuffer, EmulatedDevice};

// ── Strategies ───────────────────────────────────────────────────────────

/// Host contents plus a `(start, count)` inside them. `count == 0` is included.
fn data_and_range() -> impl Strategy<Value = (Vec<u32>, usize, usize)> {
    prop::collection::vec(any::<u32>(), 1..=64).prop_flat_map(|data| {
        let len = data.len();
        (0..=len).prop_flat_map(move |count| {
            let data = data.clone();
            (0..=len - count).prop_map(move |start| (data.clone(), start, count))
        })
    })
}

fn config(len: usize, graphics: bool, double: bool) -> BufferConfig {
    let base = if graphics {
        BufferConfig::graphics(len, BufferTarget::Vertex)
    } else {
        BufferConfig::device(len)
    };
    if double {
        base.double_buffered()
    } else {
        base
    }
}

proptest! {
    #[test]
    fn upload_download_reproduces_host(
        (data, start, count) in data_and_range(),
        graphics in any::<bool>(),
        double in any::<bool>(),
    ) {
        let backend = Arc::new(EmulatedDevice::default());
        let mut buf: DualBuffer<u32> = DualBuffer::new(DeviceHandle::new(backend.clone(), DeviceId(0)));
        buf.alloc(config(data.len(), graphics, double)).unwrap();

        buf.set_host(&data).unwrap();
        buf.copy(Direction::HostToDevice, start, count).unwrap();
        buf.host_mut().fill(0);
        buf.copy(Direction::DeviceToHost, start, count).unwrap();

        let end = if count == 0 { data.len() } else { start + count };
        prop_assert_eq!(&buf.host()[start..end], &data[start..end]);
        prop_assert!(buf.host()[..start].iter().all(|&v| v == 0));
        prop_assert!(buf.host()[end..].iter().all(|&v| v == 0));

        buf.free().unwrap();
        prop_assert!(backend.stats().is_quiescent());
    }

    #[test]
    fn out_of_range_is_rejected(len in 1usize..32, start in 0usize..64, count in 1usize..64) {
        prop_assume!(start + count > len);
        let backend = Arc::new(EmulatedDevice::default());
        let mut buf: DualBuffer<u32> = DualBuffer::new(DeviceHandle::new(backend.clone(), DeviceId(0)));
        buf.alloc(BufferConfig::device(len)).unwrap();

        let err = buf.copy(Direction::HostToDevice, start, count).unwrap_err();
        prop_assert_eq!(err.kind(), tandem_core::ErrorKind::Usage);
        prop_assert_eq!(backend.stats().bytes_to_device, 0);
    }
}

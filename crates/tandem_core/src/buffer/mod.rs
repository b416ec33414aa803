//! # Dual Buffers
//!
//! One host array mirrored by one or two device-side arrays:
//!
//! ```text
//!                 ┌──────────────────────────────────┐
//!                 │          DualBuffer<T>           │
//!                 │                                  │
//!                 │   host: [T; len]                 │
//!                 │                                  │
//!                 │   slot 0 ──┐        ┌── slot 1   │
//!                 │            ▼        ▼            │
//!                 │   ┌──────────┐  ┌──────────┐     │
//!                 │   │ raw ptr  │  │ raw ptr  │     │
//!                 │   │   or     │  │   or     │     │
//!                 │   │ gfx buf  │  │ gfx buf  │     │
//!                 │   └──────────┘  └──────────┘     │
//!                 │  current_read    current_write   │
//!                 └──────────────────────────────────┘
//! ```
//!
//! Single-buffered instances have one slot and both roles point at it.
//! `swap` exchanges the roles of a double-buffered pair, nothing is copied.

mod dual_buffer;
mod transfer;

pub use dual_buffer::{BufferConfig, DualBuffer};

use std::fmt;

/// Role a device slot plays in a [`DualBuffer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    /// Consumed this step.
    Read,
    /// Produced this step.
    Write,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::Write => "write",
        })
    }
}

/// Direction of a host/device copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Upload host contents to the device.
    HostToDevice,
    /// Download device contents to the host.
    DeviceToHost,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::HostToDevice => "host-to-device",
            Self::DeviceToHost => "device-to-host",
        })
    }
}

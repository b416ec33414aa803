//! Compute kernels.
//!
//! A kernel reads the read role of each particle buffer and writes the next
//! state into the write role. The pipeline swaps roles afterwards.

use tandem_core::{DualBuffer, ResourceResult, Role};
use tandem_handoff::Float4;

/// Device-resident particle state, both buffers double-buffered.
#[derive(Debug)]
pub struct ParticleBuffers {
    /// Positions, `w` is the mass.
    pub positions: DualBuffer<Float4>,
    /// Velocities.
    pub velocities: DualBuffer<Float4>,
}

impl ParticleBuffers {
    /// Number of particles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// True before allocation.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

/// One simulation step on the device.
pub trait StepKernel {
    /// Advances the state by `dt`, read role in, write role out.
    ///
    /// # Errors
    ///
    /// Any device operation failure. The pipeline does not swap on error.
    fn step(&mut self, particles: &mut ParticleBuffers, dt: f64) -> ResourceResult<()>;
}

/// Constant-velocity drift: `p += v * dt`.
///
/// Stages through host scratch, so it works on any backend.
#[derive(Debug, Default)]
pub struct DriftKernel {
    positions: Vec<Float4>,
    velocities: Vec<Float4>,
}

impl DriftKernel {
    /// Creates a kernel with empty scratch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StepKernel for DriftKernel {
    #[allow(clippy::cast_possible_truncation)]
    fn step(&mut self, particles: &mut ParticleBuffers, dt: f64) -> ResourceResult<()> {
        let len = particles.len();
        self.positions.resize(len, Float4::ZERO);
        self.velocities.resize(len, Float4::ZERO);

        particles.positions.read_device(Role::Read, 0, &mut self.positions)?;
        particles.velocities.read_device(Role::Read, 0, &mut self.velocities)?;

        let dt = dt as f32;
        for (p, v) in self.positions.iter_mut().zip(&self.velocities) {
            p.x += v.x * dt;
            p.y += v.y * dt;
            p.z += v.z * dt;
        }

        particles.positions.write_device(Role::Write, 0, &self.positions)?;
        particles.velocities.write_device(Role::Write, 0, &self.velocities)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tandem_core::{BufferConfig, DeviceHandle, DeviceId, Direction, EmulatedDevice};

    use super::*;

    fn particles(positions: &[Float4], velocities: &[Float4]) -> ParticleBuffers {
        let device = DeviceHandle::new(Arc::new(EmulatedDevice::default()), DeviceId(0));
        let make = |data: &[Float4]| {
            let mut buf = DualBuffer::new(device.clone());
            buf.alloc(BufferConfig::device(data.len()).double_buffered()).unwrap();
            buf.set_host(data).unwrap();
            buf.copy_all(Direction::HostToDevice).unwrap();
            buf
        };
        ParticleBuffers {
            positions: make(positions),
            velocities: make(velocities),
        }
    }

    #[test]
    fn test_drift_writes_next_state_to_write_role() {
        let mut state = particles(
            &[Float4::new(0.0, 0.0, 0.0, 1.0), Float4::new(1.0, 1.0, 1.0, 2.0)],
            &[Float4::new(1.0, 0.0, -2.0, 0.0), Float4::ZERO],
        );
        DriftKernel::new().step(&mut state, 0.5).unwrap();

        // Read role untouched until the swap.
        state.positions.copy_all(Direction::DeviceToHost).unwrap();
        assert_eq!(state.positions.host()[0], Float4::new(0.0, 0.0, 0.0, 1.0));

        state.positions.swap().unwrap();
        state.positions.copy_all(Direction::DeviceToHost).unwrap();
        assert_eq!(
            state.positions.host(),
            &[Float4::new(0.5, 0.0, -1.0, 1.0), Float4::new(1.0, 1.0, 1.0, 2.0)]
        );
    }
}

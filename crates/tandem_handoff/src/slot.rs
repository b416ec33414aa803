//! Snapshot payload.

use bytemuck::{Pod, Zeroable};

use crate::error::{HandoffError, HandoffResult};

/// Four packed floats. For positions `w` carries the mass.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Float4 {
    /// X component.
    pub x: f32,
    /// Y component.
    pub y: f32,
    /// Z component.
    pub z: f32,
    /// W component (mass for positions).
    pub w: f32,
}

impl Float4 {
    /// All zeros.
    pub const ZERO: Self = Self::new(0.0, 0.0, 0.0, 0.0);

    /// Creates a value from its components.
    #[must_use]
    pub const fn new(x: f32, y: f32, z: f32, w: f32) -> Self {
        Self { x, y, z, w }
    }
}

/// One snapshot in flight: a valid-element count, a time tag and three
/// parallel arrays.
///
/// The arrays may be longer than `element_count` (a recycled slot keeps its
/// capacity); only the first `element_count` entries are meaningful.
#[derive(Clone, Default, PartialEq)]
pub struct SnapshotSlot {
    element_count: usize,
    simulation_time: f64,
    positions: Vec<Float4>,
    velocities: Vec<Float4>,
    ids: Vec<u64>,
}

impl SnapshotSlot {
    /// Builds a slot from owned arrays.
    ///
    /// # Errors
    ///
    /// [`HandoffError::MismatchedLengths`] if the arrays differ in length,
    /// [`HandoffError::CountOutOfRange`] if `element_count` exceeds them.
    pub fn new(
        element_count: usize,
        simulation_time: f64,
        positions: Vec<Float4>,
        velocities: Vec<Float4>,
        ids: Vec<u64>,
    ) -> HandoffResult<Self> {
        check_lengths(positions.len(), velocities.len(), ids.len())?;
        if element_count > positions.len() {
            return Err(HandoffError::CountOutOfRange {
                count: element_count,
                len: positions.len(),
            });
        }
        Ok(Self {
            element_count,
            simulation_time,
            positions,
            velocities,
            ids,
        })
    }

    /// An empty slot able to hold `capacity` elements without reallocating.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            element_count: 0,
            simulation_time: 0.0,
            positions: Vec::with_capacity(capacity),
            velocities: Vec::with_capacity(capacity),
            ids: Vec::with_capacity(capacity),
        }
    }

    /// Overwrites the slot with copies of the given arrays, reusing its storage.
    ///
    /// # Errors
    ///
    /// [`HandoffError::MismatchedLengths`] if the arrays differ in length.
    pub fn fill_from(
        &mut self,
        simulation_time: f64,
        positions: &[Float4],
        velocities: &[Float4],
        ids: &[u64],
    ) -> HandoffResult<()> {
        check_lengths(positions.len(), velocities.len(), ids.len())?;
        self.clear();
        self.positions.extend_from_slice(positions);
        self.velocities.extend_from_slice(velocities);
        self.ids.extend_from_slice(ids);
        self.element_count = positions.len();
        self.simulation_time = simulation_time;
        Ok(())
    }

    /// Empties the arrays, keeping their capacity.
    pub fn clear(&mut self) {
        self.positions.clear();
        self.velocities.clear();
        self.ids.clear();
        self.element_count = 0;
        self.simulation_time = 0.0;
    }

    /// Grows the arrays so `capacity` elements fit without reallocating.
    pub fn reserve(&mut self, capacity: usize) {
        self.positions.reserve(capacity.saturating_sub(self.positions.len()));
        self.velocities.reserve(capacity.saturating_sub(self.velocities.len()));
        self.ids.reserve(capacity.saturating_sub(self.ids.len()));
    }

    /// Number of valid elements.
    #[inline]
    #[must_use]
    pub fn element_count(&self) -> usize {
        self.element_count
    }

    /// Simulation time the snapshot was taken at.
    #[inline]
    #[must_use]
    pub fn simulation_time(&self) -> f64 {
        self.simulation_time
    }

    /// Valid positions.
    #[must_use]
    pub fn positions(&self) -> &[Float4] {
        &self.positions[..self.element_count]
    }

    /// Valid velocities.
    #[must_use]
    pub fn velocities(&self) -> &[Float4] {
        &self.velocities[..self.element_count]
    }

    /// Valid identifiers.
    #[must_use]
    pub fn ids(&self) -> &[u64] {
        &self.ids[..self.element_count]
    }

    /// Elements the slot can hold without reallocating.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.positions
            .capacity()
            .min(self.velocities.capacity())
            .min(self.ids.capacity())
    }
}

fn check_lengths(positions: usize, velocities: usize, ids: usize) -> HandoffResult<()> {
    if positions == velocities && velocities == ids {
        Ok(())
    } else {
        Err(HandoffError::MismatchedLengths {
            positions,
            velocities,
            ids,
        })
    }
}

impl std::fmt::Debug for SnapshotSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotSlot")
            .field("element_count", &self.element_count)
            .field("simulation_time", &self.simulation_time)
            .field("capacity", &self.capacity())
            .finish()
    }
}

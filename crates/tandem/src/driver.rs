//! # Pipeline Driver
//!
//! ```text
//! Step N:
//! ┌──────────────────────────────────────────────────────────────────┐
//! │ 1. SNAPSHOT (if simulation time reached the next interval)       │
//! │    ├─ Copy read roles device -> host                             │
//! │    ├─ Fill a recycled slot                                       │
//! │    └─ Publish (never waits on disk)                              │
//! │                                                                  │
//! │ 2. COMPUTE                                                       │
//! │    └─ Kernel reads read roles, writes write roles                │
//! │                                                                  │
//! │ 3. SWAP                                                          │
//! │    └─ Write roles become read roles                              │
//! │                                                                  │
//! │ 4. RENDER (optional)                                             │
//! │    └─ Positions -> graphics buffer, mapped only for the copy     │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The writer thread runs beside this loop. On a compute failure the
//! producer is finished with [`FinishMode::Abandon`] so the writer exits.

use crossbeam_channel::Receiver;
use tandem_core::{BufferConfig, DeviceHandle, Direction, DualBuffer, ResourceError};
use tandem_handoff::{
    channel, FinishMode, Float4, HandoffProducer, HandoffStats, PublishError, Published, SnapshotWriter,
    WriterEvent, WriterHandle, WriterStats,
};

use crate::config::TandemConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::kernel::{ParticleBuffers, StepKernel};

/// Initial particle arrays, all of the configured length.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InitialState {
    /// Positions, `w` is the mass.
    pub positions: Vec<Float4>,
    /// Velocities.
    pub velocities: Vec<Float4>,
    /// Particle identifiers.
    pub ids: Vec<u64>,
}

impl InitialState {
    /// Unit-mass particles on a cubic lattice, drifting outward from the origin.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn lattice(count: usize) -> Self {
        let side = (count as f64).cbrt().ceil().max(1.0) as usize;
        let half = side as f32 / 2.0;
        let mut state = Self {
            positions: Vec::with_capacity(count),
            velocities: Vec::with_capacity(count),
            ids: Vec::with_capacity(count),
        };
        for i in 0..count {
            let x = (i % side) as f32 - half;
            let y = ((i / side) % side) as f32 - half;
            let z = (i / (side * side)) as f32 - half;
            state.positions.push(Float4::new(x, y, z, 1.0));
            state.velocities.push(Float4::new(x * 0.1, y * 0.1, z * 0.1, 0.0));
            state.ids.push(i as u64);
        }
        state
    }
}

/// What happened to the snapshot due this step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnapshotOutcome {
    /// Not due.
    NotDue,
    /// Handed to the writer.
    Published,
    /// Due, but the channel was busy or the writer gone. Not retried.
    Skipped,
}

/// Result of one [`Pipeline::step`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StepReport {
    /// Step index (0-based).
    pub step: u64,
    /// Simulation time after the step.
    pub time: f64,
    /// Snapshot taken before the compute.
    pub snapshot: SnapshotOutcome,
    /// Positions were copied to the graphics buffer.
    pub rendered: bool,
}

/// Running totals.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Steps completed.
    pub steps: u64,
    /// Snapshots handed to the writer.
    pub snapshots_published: u64,
    /// Snapshots due but not handed over.
    pub snapshots_skipped: u64,
    /// Published snapshots taken back undrained at shutdown.
    pub snapshots_reclaimed: u64,
    /// Render copies.
    pub render_copies: u64,
}

/// Everything known after shutdown.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PipelineSummary {
    /// Final simulation time.
    pub time: f64,
    /// Driver counters.
    pub stats: PipelineStats,
    /// Channel counters, if snapshots were enabled.
    pub handoff: Option<HandoffStats>,
    /// Writer totals, if snapshots were enabled.
    pub writer: Option<WriterStats>,
}

/// Reference driver: compute, swap, snapshot, render.
pub struct Pipeline<K: StepKernel> {
    kernel: K,
    particles: ParticleBuffers,
    ids: Vec<u64>,
    render: Option<DualBuffer<Float4>>,
    producer: Option<HandoffProducer>,
    writer: Option<WriterHandle>,
    dt: f64,
    time: f64,
    step: u64,
    interval: Option<f64>,
    next_snapshot: f64,
    stats: PipelineStats,
}

impl<K: StepKernel> Pipeline<K> {
    /// Allocates device state on the configured devices, uploads `initial`
    /// and, if snapshots are enabled, starts the writer thread.
    ///
    /// `device` supplies the backend; the device ids come from `config.device`.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::Config`]: the config does not validate.
    /// - [`PipelineError::InitialState`]: array lengths differ from the particle count.
    /// - [`PipelineError::Setup`]: allocation or upload failed. Nothing leaks.
    /// - [`PipelineError::Writer`]: the writer thread could not start.
    pub fn new<W>(
        config: &TandemConfig,
        device: &DeviceHandle,
        initial: InitialState,
        kernel: K,
        writer: W,
    ) -> PipelineResult<Self>
    where
        W: SnapshotWriter + 'static,
    {
        config.validate()?;
        let count = config.simulation.particles;
        for (what, actual) in [
            ("positions", initial.positions.len()),
            ("velocities", initial.velocities.len()),
            ("ids", initial.ids.len()),
        ] {
            if actual != count {
                return Err(PipelineError::InitialState {
                    what,
                    expected: count,
                    actual,
                });
            }
        }

        let compute = device.with_device(config.device.compute);
        let upload = |data: &[Float4]| -> Result<DualBuffer<Float4>, ResourceError> {
            let mut buf = DualBuffer::new(compute.clone());
            buf.alloc(BufferConfig::device(count).double_buffered())?;
            buf.set_host(data)?;
            buf.copy_all(Direction::HostToDevice)?;
            Ok(buf)
        };
        let particles = ParticleBuffers {
            positions: upload(&initial.positions).map_err(PipelineError::Setup)?,
            velocities: upload(&initial.velocities).map_err(PipelineError::Setup)?,
        };

        let render = if config.render.enabled {
            let mut buf = DualBuffer::new(device.with_device(config.device.render));
            buf.alloc(BufferConfig::graphics(count, config.render.target))
                .map_err(PipelineError::Setup)?;
            Some(buf)
        } else {
            None
        };

        let interval = config.snapshot.enabled_interval();
        let (producer, writer) = match interval {
            Some(_) => {
                let (producer, consumer) = channel(config.handoff);
                let handle = tandem_handoff::spawn_writer(consumer, config.snapshot.naming(), writer)?;
                (Some(producer), Some(handle))
            }
            None => (None, None),
        };

        tracing::info!(
            particles = count,
            compute = %config.device.compute,
            render = config.render.enabled,
            snapshot_interval = ?interval,
            policy = ?config.handoff.policy,
            "pipeline ready"
        );

        Ok(Self {
            kernel,
            particles,
            ids: initial.ids,
            render,
            producer,
            writer,
            dt: config.simulation.dt,
            time: 0.0,
            step: 0,
            interval,
            next_snapshot: 0.0,
            stats: PipelineStats::default(),
        })
    }

    /// Runs one step: snapshot if due, compute, swap, render copy.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Step`] from any device operation; roles are not
    /// swapped if the kernel fails.
    pub fn step(&mut self) -> PipelineResult<StepReport> {
        let step = self.step;
        let at = |source| PipelineError::Step { step, source };

        let snapshot = self.snapshot_if_due()?;

        self.kernel.step(&mut self.particles, self.dt).map_err(at)?;
        self.particles.positions.swap().map_err(at)?;
        self.particles.velocities.swap().map_err(at)?;
        self.time += self.dt;

        let rendered = self.render_copy().map_err(at)?;

        self.step += 1;
        self.stats.steps += 1;
        tracing::trace!(step, time = self.time, ?snapshot, rendered, "step complete");
        Ok(StepReport {
            step,
            time: self.time,
            snapshot,
            rendered,
        })
    }

    /// Runs `steps` steps, takes a final snapshot if due, and shuts down.
    ///
    /// On failure the writer is stopped (pending snapshot abandoned) before
    /// the error is returned.
    ///
    /// # Errors
    ///
    /// The first step or shutdown failure.
    pub fn run(mut self, steps: u64) -> PipelineResult<PipelineSummary> {
        match self.run_steps(steps) {
            Ok(()) => self.shutdown(FinishMode::Drain),
            Err(err) => {
                tracing::error!(step = self.step, error = %err, "pipeline failed, stopping writer");
                if let Err(teardown) = self.shutdown(FinishMode::Abandon) {
                    tracing::warn!(error = %teardown, "shutdown after failure also failed");
                }
                Err(err)
            }
        }
    }

    /// Drains the writer and releases device state.
    ///
    /// # Errors
    ///
    /// Writer thread or device release failure.
    pub fn finish(mut self) -> PipelineResult<PipelineSummary> {
        self.shutdown(FinishMode::Drain)
    }

    /// Simulation time.
    #[must_use]
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Driver counters.
    #[must_use]
    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    /// Device particle state.
    #[must_use]
    pub fn particles(&self) -> &ParticleBuffers {
        &self.particles
    }

    /// Graphics buffer holding the latest positions, if rendering is enabled.
    #[must_use]
    pub fn render_buffer(&self) -> Option<&DualBuffer<Float4>> {
        self.render.as_ref()
    }

    /// Writer reports, if snapshots are enabled.
    #[must_use]
    pub fn writer_events(&self) -> Option<&Receiver<WriterEvent>> {
        self.writer.as_ref().map(WriterHandle::events)
    }

    fn run_steps(&mut self, steps: u64) -> PipelineResult<()> {
        for _ in 0..steps {
            self.step()?;
        }
        self.snapshot_if_due().map(drop)
    }

    fn snapshot_due(&self) -> bool {
        // Tolerates accumulated rounding in `time`.
        self.interval.is_some() && self.time >= self.next_snapshot - self.dt * 1e-6
    }

    fn snapshot_if_due(&mut self) -> PipelineResult<SnapshotOutcome> {
        let (Some(interval), true) = (self.interval, self.snapshot_due()) else {
            return Ok(SnapshotOutcome::NotDue);
        };
        while self.next_snapshot <= self.time + self.dt * 1e-6 {
            self.next_snapshot += interval;
        }

        let step = self.step;
        let at = |source| PipelineError::Step { step, source };
        let Some(producer) = self.producer.as_mut() else {
            return Ok(SnapshotOutcome::NotDue);
        };
        self.particles.positions.copy_all(Direction::DeviceToHost).map_err(at)?;
        self.particles.velocities.copy_all(Direction::DeviceToHost).map_err(at)?;

        let mut slot = producer.acquire_slot(self.ids.len());
        slot.fill_from(
            self.time,
            self.particles.positions.host(),
            self.particles.velocities.host(),
            &self.ids,
        )?;

        let outcome = match producer.publish(slot) {
            Ok(Published::Delivered) => SnapshotOutcome::Published,
            Ok(Published::Dropped(_)) | Err(PublishError::Occupied(_)) => {
                tracing::debug!(time = self.time, "snapshot skipped, writer busy");
                SnapshotOutcome::Skipped
            }
            Err(PublishError::Disconnected(_)) => {
                tracing::warn!(time = self.time, "snapshot skipped, writer gone");
                SnapshotOutcome::Skipped
            }
        };
        match outcome {
            SnapshotOutcome::Published => self.stats.snapshots_published += 1,
            _ => self.stats.snapshots_skipped += 1,
        }
        Ok(outcome)
    }

    fn render_copy(&mut self) -> Result<bool, ResourceError> {
        let Some(render) = self.render.as_mut() else {
            return Ok(false);
        };
        self.particles.positions.copy_all(Direction::DeviceToHost)?;
        render.set_host(self.particles.positions.host())?;
        render.copy_all(Direction::HostToDevice)?;
        self.stats.render_copies += 1;
        Ok(true)
    }

    fn shutdown(&mut self, mode: FinishMode) -> PipelineResult<PipelineSummary> {
        let mut handoff = None;
        if let Some(producer) = self.producer.take() {
            let stats = producer.stats();
            if producer.finish(mode).is_some() {
                self.stats.snapshots_reclaimed += 1;
            }
            handoff = Some(stats);
        }
        let writer = self.writer.take().map(WriterHandle::join).transpose()?;

        let mut released = self.particles.positions.free();
        for result in [
            self.particles.velocities.free(),
            self.render.as_mut().map_or(Ok(()), DualBuffer::free),
        ] {
            if released.is_ok() {
                released = result;
            }
        }
        released.map_err(PipelineError::Teardown)?;

        tracing::info!(
            steps = self.stats.steps,
            time = self.time,
            published = self.stats.snapshots_published,
            skipped = self.stats.snapshots_skipped,
            ?mode,
            "pipeline stopped"
        );
        Ok(PipelineSummary {
            time: self.time,
            stats: self.stats,
            handoff,
            writer,
        })
    }
}

impl<K: StepKernel> Drop for Pipeline<K> {
    fn drop(&mut self) {
        if self.producer.is_some() || self.writer.is_some() {
            if let Err(err) = self.shutdown(FinishMode::Abandon) {
                tracing::error!(error = %err, "pipeline dropped without shutdown, teardown failed");
            }
        }
    }
}

impl<K: StepKernel> std::fmt::Debug for Pipeline<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("particles", &self.particles.len())
            .field("time", &self.time)
            .field("step", &self.step)
            .field("snapshots", &self.interval.is_some())
            .field("render", &self.render.is_some())
            .finish()
    }
}

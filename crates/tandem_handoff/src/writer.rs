//! # Snapshot Writer
//!
//! The I/O side of the handoff: a dedicated thread drains the channel and
//! hands each snapshot to a [`SnapshotWriter`].
//!
//! ```text
//!   HandoffConsumer ──> [writer thread] ──> SnapshotWriter ──> disk
//!                             │
//!                             └──> WriterEvent stream (crossbeam) ──> driver
//! ```
//!
//! ## File Naming
//!
//! `{base}_{time:010.4}` when every process writes into one shared file,
//! `{base}_{time:010.4}-{rank}` when each process writes its own. Per-process
//! files are used once the process count exceeds the threshold.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};

use crate::channel::HandoffConsumer;
use crate::error::{WriterError, WriterResult};
use crate::slot::{Float4, SnapshotSlot};

/// Process count above which each process writes its own file.
pub const DEFAULT_PER_PROCESS_THRESHOLD: u32 = 16;

/// Capacity of the report stream. Reports beyond it are dropped.
const REPORT_CAPACITY: usize = 64;

/// Magic bytes of the raw snapshot format.
pub const RAW_MAGIC: [u8; 4] = *b"TNDM";

/// Version of the raw snapshot format.
pub const RAW_VERSION: u32 = 1;

/// Whether processes share one file per snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteStrategy {
    /// One file for all processes.
    SharedFile,
    /// One file per process, suffixed with the rank.
    PerProcess,
}

/// Where snapshots go and how they are named.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotNaming {
    /// Output directory.
    pub directory: PathBuf,
    /// File name prefix.
    pub base: String,
    /// Rank of this process.
    pub rank: u32,
    /// Number of cooperating processes.
    pub process_count: u32,
    /// Process count above which files are per process.
    pub per_process_threshold: u32,
}

impl SnapshotNaming {
    /// Single-process naming in `directory`.
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>, base: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            base: base.into(),
            rank: 0,
            process_count: 1,
            per_process_threshold: DEFAULT_PER_PROCESS_THRESHOLD,
        }
    }

    /// Strategy implied by the process count.
    #[must_use]
    pub fn strategy(&self) -> WriteStrategy {
        if self.process_count > self.per_process_threshold {
            WriteStrategy::PerProcess
        } else {
            WriteStrategy::SharedFile
        }
    }

    /// File name for a snapshot taken at `time`.
    #[must_use]
    pub fn file_name(&self, time: f64) -> String {
        match self.strategy() {
            WriteStrategy::SharedFile => format!("{}_{time:010.4}", self.base),
            WriteStrategy::PerProcess => format!("{}_{time:010.4}-{}", self.base, self.rank),
        }
    }

    /// Full target for a snapshot taken at `time`.
    #[must_use]
    pub fn target(&self, time: f64) -> SnapshotTarget {
        SnapshotTarget {
            path: self.directory.join(self.file_name(time)),
            strategy: self.strategy(),
            rank: self.rank,
            process_count: self.process_count,
        }
    }
}

/// One resolved output file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotTarget {
    /// File to write.
    pub path: PathBuf,
    /// Shared or per-process.
    pub strategy: WriteStrategy,
    /// Rank of this process.
    pub rank: u32,
    /// Number of cooperating processes.
    pub process_count: u32,
}

/// Encodes snapshots. The format is the implementor's choice.
pub trait SnapshotWriter: Send {
    /// Writes one snapshot, returning the bytes written.
    ///
    /// # Errors
    ///
    /// Any I/O or encoding failure. The writer loop logs it and carries on.
    fn write(&mut self, target: &SnapshotTarget, slot: &SnapshotSlot) -> WriterResult<u64>;

    /// Called once after the last snapshot.
    ///
    /// # Errors
    ///
    /// Any failure flushing buffered output.
    fn finish(&mut self) -> WriterResult<()> {
        Ok(())
    }
}

/// Reference little-endian format: header, positions, velocities, ids.
///
/// ```text
/// [magic:4 "TNDM"][version:4][count:8][time:8][rank:4][processes:4]
/// [positions: count * 16][velocities: count * 16][ids: count * 8]
/// ```
#[derive(Debug, Default)]
pub struct RawSnapshotWriter {
    buffer_capacity: usize,
}

impl RawSnapshotWriter {
    /// Header size in bytes.
    pub const HEADER_LEN: usize = 32;

    /// Creates a writer with a 64 KiB write buffer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer_capacity: 64 * 1024,
        }
    }
}

impl SnapshotWriter for RawSnapshotWriter {
    fn write(&mut self, target: &SnapshotTarget, slot: &SnapshotSlot) -> WriterResult<u64> {
        let io_err = |source| WriterError::Io {
            path: target.path.clone(),
            source,
        };
        let file = File::create(&target.path).map_err(io_err)?;
        let mut out = BufWriter::with_capacity(self.buffer_capacity.max(1), file);

        let count = slot.element_count() as u64;
        out.write_all(&RAW_MAGIC).map_err(io_err)?;
        out.write_all(&RAW_VERSION.to_le_bytes()).map_err(io_err)?;
        out.write_all(&count.to_le_bytes()).map_err(io_err)?;
        out.write_all(&slot.simulation_time().to_le_bytes()).map_err(io_err)?;
        out.write_all(&target.rank.to_le_bytes()).map_err(io_err)?;
        out.write_all(&target.process_count.to_le_bytes()).map_err(io_err)?;
        write_le_floats(&mut out, slot.positions()).map_err(io_err)?;
        write_le_floats(&mut out, slot.velocities()).map_err(io_err)?;
        for id in slot.ids() {
            out.write_all(&id.to_le_bytes()).map_err(io_err)?;
        }
        out.flush().map_err(io_err)?;

        Ok(Self::HEADER_LEN as u64 + count * 40)
    }
}

fn write_le_floats(out: &mut impl Write, values: &[Float4]) -> std::io::Result<()> {
    if cfg!(target_endian = "little") {
        return out.write_all(bytemuck::cast_slice(values));
    }
    for v in values {
        for c in [v.x, v.y, v.z, v.w] {
            out.write_all(&c.to_le_bytes())?;
        }
    }
    Ok(())
}

/// Reads a file produced by [`RawSnapshotWriter`].
///
/// # Errors
///
/// I/O failure or a malformed file.
pub fn read_raw_snapshot(path: &Path) -> WriterResult<SnapshotSlot> {
    let io_err = |source| WriterError::Io {
        path: path.to_path_buf(),
        source,
    };
    let malformed = |reason: &str| WriterError::Malformed {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    let file = File::open(path).map_err(io_err)?;
    let file_len = file.metadata().map_err(io_err)?.len();
    let mut input = BufReader::new(file);
    let mut header = [0u8; RawSnapshotWriter::HEADER_LEN];
    input.read_exact(&mut header).map_err(io_err)?;
    if header[0..4] != RAW_MAGIC {
        return Err(malformed("bad magic"));
    }
    let field = |range: std::ops::Range<usize>| -> [u8; 8] {
        let mut bytes = [0u8; 8];
        bytes[..range.len()].copy_from_slice(&header[range]);
        bytes
    };
    let version = u64::from_le_bytes(field(4..8));
    if version != u64::from(RAW_VERSION) {
        return Err(malformed("unsupported version"));
    }
    let raw_count = u64::from_le_bytes(field(8..16));
    let expected_len = raw_count
        .checked_mul(40)
        .and_then(|body| body.checked_add(RawSnapshotWriter::HEADER_LEN as u64));
    if expected_len != Some(file_len) {
        return Err(malformed("element count does not match file length"));
    }
    let count = usize::try_from(raw_count).map_err(|_| malformed("count overflows"))?;
    let time = f64::from_le_bytes(field(16..24));

    let mut read_float4s = |len: usize| -> WriterResult<Vec<Float4>> {
        let mut values = vec![Float4::ZERO; len];
        let mut bytes = [0u8; 16];
        for value in &mut values {
            input.read_exact(&mut bytes).map_err(io_err)?;
            let c = |i: usize| f32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
            *value = Float4::new(c(0), c(4), c(8), c(12));
        }
        Ok(values)
    };
    let positions = read_float4s(count)?;
    let velocities = read_float4s(count)?;
    let mut ids = Vec::with_capacity(count);
    let mut bytes = [0u8; 8];
    for _ in 0..count {
        input.read_exact(&mut bytes).map_err(io_err)?;
        ids.push(u64::from_le_bytes(bytes));
    }

    Ok(SnapshotSlot::new(count, time, positions, velocities, ids)?)
}

/// Progress reported by the writer thread.
#[derive(Clone, Debug, PartialEq)]
pub enum WriterEvent {
    /// A snapshot reached the writer and was written.
    Written {
        /// Simulation time of the snapshot.
        time: f64,
        /// File written.
        path: PathBuf,
        /// Bytes written.
        bytes: u64,
    },
    /// A snapshot could not be written. The loop carries on.
    Failed {
        /// Simulation time of the snapshot.
        time: f64,
        /// File attempted.
        path: PathBuf,
        /// Rendered error.
        error: String,
    },
}

/// Writer thread totals.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct WriterStats {
    /// Snapshots written.
    pub snapshots_written: u64,
    /// Snapshots that failed.
    pub failures: u64,
    /// Bytes written.
    pub bytes_written: u64,
    /// Time spent inside [`SnapshotWriter::write`].
    pub write_time: Duration,
}

/// Running writer thread.
#[derive(Debug)]
pub struct WriterHandle {
    thread: JoinHandle<WriterResult<WriterStats>>,
    events: Receiver<WriterEvent>,
}

impl WriterHandle {
    /// Progress reports. Bounded: reports are dropped if nobody reads them.
    #[must_use]
    pub fn events(&self) -> &Receiver<WriterEvent> {
        &self.events
    }

    /// Waits for the writer to exit (after the producer finished).
    ///
    /// # Errors
    ///
    /// The writer's `finish` failure, or [`WriterError::Panicked`].
    pub fn join(self) -> WriterResult<WriterStats> {
        self.thread.join().map_err(|_| WriterError::Panicked)?
    }
}

/// Starts the writer thread on `consumer`.
///
/// The thread runs until the producer finishes, writing each snapshot once
/// and releasing it back to the producer afterwards.
///
/// # Errors
///
/// [`WriterError::Spawn`] if the thread cannot be created.
pub fn spawn_writer<W>(consumer: HandoffConsumer, naming: SnapshotNaming, writer: W) -> WriterResult<WriterHandle>
where
    W: SnapshotWriter + 'static,
{
    let (events_tx, events) = crossbeam_channel::bounded(REPORT_CAPACITY);
    let thread = thread::Builder::new()
        .name("tandem-writer".to_string())
        .spawn(move || writer_loop(&consumer, &naming, writer, &events_tx))
        .map_err(WriterError::Spawn)?;
    Ok(WriterHandle { thread, events })
}

fn writer_loop<W: SnapshotWriter>(
    consumer: &HandoffConsumer,
    naming: &SnapshotNaming,
    mut writer: W,
    events: &Sender<WriterEvent>,
) -> WriterResult<WriterStats> {
    let mut stats = WriterStats::default();
    tracing::info!(
        directory = %naming.directory.display(),
        strategy = ?naming.strategy(),
        "snapshot writer started"
    );

    while let Some(slot) = consumer.consume_blocking() {
        let time = slot.simulation_time();
        let target = naming.target(time);

        let started = Instant::now();
        let result = writer.write(&target, &slot);
        stats.write_time += started.elapsed();
        slot.release();

        let event = match result {
            Ok(bytes) => {
                stats.snapshots_written += 1;
                stats.bytes_written += bytes;
                tracing::info!(time, path = %target.path.display(), bytes, "snapshot written");
                WriterEvent::Written {
                    time,
                    path: target.path,
                    bytes,
                }
            }
            Err(err) => {
                stats.failures += 1;
                tracing::error!(time, path = %target.path.display(), error = %err, "snapshot write failed");
                WriterEvent::Failed {
                    time,
                    path: target.path,
                    error: err.to_string(),
                }
            }
        };
        if let Err(TrySendError::Full(_)) = events.try_send(event) {
            tracing::debug!("writer report dropped, stream full");
        }
    }

    writer.finish()?;
    tracing::info!(
        written = stats.snapshots_written,
        failures = stats.failures,
        bytes = stats.bytes_written,
        "snapshot writer stopped"
    );
    Ok(stats)
}

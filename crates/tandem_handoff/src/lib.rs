//! # TANDEM Handoff
//!
//! Moves completed snapshots from the compute thread to an asynchronous
//! writer without ever making compute wait on disk:
//! - [`SnapshotSlot`]: positions, velocities and ids tagged with simulation time
//! - [`channel`]: one producer, one consumer, one slot, atomic `Idle/Ready`
//! - [`spawn_writer`]: the I/O thread that drains the channel
//!
//! ## Architecture Rules
//!
//! 1. **One snapshot in flight** - never a queue, never unbounded memory
//! 2. **Overwrite policy is explicit** - reject (default), drop newest, or block
//! 3. **Slots are recycled** - steady state allocates nothing
//!
//! ## Example
//!
//! ```rust
//! use tandem_handoff::{channel, FinishMode, Float4, HandoffConfig};
//!
//! let (mut producer, consumer) = channel(HandoffConfig::default());
//!
//! let mut slot = producer.acquire_slot(2);
//! slot.fill_from(0.5, &[Float4::ZERO; 2], &[Float4::ZERO; 2], &[1, 2]).unwrap();
//! producer.publish(slot).unwrap();
//!
//! let drained = consumer.try_consume().unwrap();
//! assert_eq!(drained.ids(), &[1, 2]);
//! drained.release();
//!
//! let _ = producer.finish(FinishMode::Drain);
//! assert!(consumer.consume_blocking().is_none());
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod channel;
pub mod error;
pub mod slot;
pub mod writer;

pub use channel::{
    channel, ConsumedSlot, FinishMode, HandoffConfig, HandoffConsumer, HandoffProducer, HandoffState,
    HandoffStats, OverwritePolicy, Published, WaitStrategy, DEFAULT_POLL_INTERVAL,
};
pub use error::{HandoffError, HandoffResult, PublishError, WriterError, WriterResult};
pub use slot::{Float4, SnapshotSlot};
pub use writer::{
    read_raw_snapshot, spawn_writer, RawSnapshotWriter, SnapshotNaming, SnapshotTarget, SnapshotWriter,
    WriteStrategy, WriterEvent, WriterHandle, WriterStats, DEFAULT_PER_PROCESS_THRESHOLD,
};

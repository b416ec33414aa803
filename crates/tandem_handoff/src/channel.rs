//! # Single-Slot Handoff
//!
//! One producer (compute), one consumer (I/O), one slot:
//!
//! ```text
//!   producer                          consumer
//!   ────────                          ────────
//!   fill slot
//!   publish ──── Idle → Ready ────>   try_consume / consume_blocking
//!                                     write to disk
//!   acquire_slot <── recycled ──────  release ──── Ready → Idle
//! ```
//!
//! ## Memory Ordering
//!
//! The payload is moved into a mutex before the `Release` store of `Ready`;
//! the consumer's `Acquire` load of `Ready` happens-before it takes the
//! payload. The consumer's release stores `Idle` with `Release` after giving
//! up the payload; the producer reads it with `Acquire`.
//!
//! ## Termination
//!
//! The terminal flag is separate from `Idle/Ready`. The producer sets it once
//! through [`HandoffProducer::finish`] (or by being dropped). The consumer's
//! blocking wait returns `None` once the flag is set and nothing is pending.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::error::{HandoffError, HandoffResult, PublishError};
use crate::slot::SnapshotSlot;

const IDLE: u8 = 0;
const READY: u8 = 1;

/// Default sleep between polls while waiting.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_micros(100);

/// Observable channel state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandoffState {
    /// Slot empty, the producer may publish.
    Idle,
    /// Slot full (or being drained), the consumer owns it.
    Ready,
}

/// What `publish` does when a snapshot is still pending.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverwritePolicy {
    /// Refuse with [`PublishError::Occupied`].
    #[default]
    Reject,
    /// Keep the pending snapshot, hand the new one back as [`Published::Dropped`].
    DropNewest,
    /// Wait until the consumer releases the pending snapshot.
    BlockProducer,
}

/// How blocking calls wait.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitStrategy {
    /// Sleep for the poll interval between checks.
    #[default]
    Poll,
    /// Park on a condition variable, woken by the other side.
    Park,
}

/// How the producer ends the stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinishMode {
    /// Wait until the last published snapshot has been drained.
    Drain,
    /// Take back an undrained snapshot and stop immediately.
    Abandon,
}

/// Channel configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HandoffConfig {
    /// Poll interval in microseconds (also the park timeout).
    pub poll_interval_us: u64,
    /// Overwrite policy.
    pub policy: OverwritePolicy,
    /// Wait strategy for blocking calls.
    pub wait: WaitStrategy,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            poll_interval_us: 100,
            policy: OverwritePolicy::Reject,
            wait: WaitStrategy::Poll,
        }
    }
}

impl HandoffConfig {
    /// Poll interval as a duration.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }

    /// Rejects a zero poll interval.
    ///
    /// # Errors
    ///
    /// [`HandoffError::InvalidConfig`].
    pub fn validate(&self) -> HandoffResult<()> {
        if self.poll_interval_us == 0 {
            return Err(HandoffError::InvalidConfig("poll interval must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Outcome of a successful `publish`.
#[derive(Debug)]
pub enum Published {
    /// The snapshot is now pending for the consumer.
    Delivered,
    /// Policy [`OverwritePolicy::DropNewest`]: the snapshot was not taken.
    Dropped(SnapshotSlot),
}

/// Channel counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HandoffStats {
    /// Snapshots delivered.
    pub published: u64,
    /// Snapshots taken by the consumer.
    pub consumed: u64,
    /// Publishes refused (occupied or disconnected).
    pub rejected: u64,
    /// Publishes dropped under `DropNewest`.
    pub dropped: u64,
    /// Publishes that had to wait under `BlockProducer`.
    pub blocked_waits: u64,
    /// Undrained snapshots taken back on abandon.
    pub reclaimed: u64,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    consumed: AtomicU64,
    rejected: AtomicU64,
    dropped: AtomicU64,
    blocked_waits: AtomicU64,
    reclaimed: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> HandoffStats {
        HandoffStats {
            published: self.published.load(Ordering::Relaxed),
            consumed: self.consumed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            blocked_waits: self.blocked_waits.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
        }
    }
}

struct Shared {
    state: AtomicU8,
    payload: Mutex<Option<SnapshotSlot>>,
    spare: Mutex<Option<SnapshotSlot>>,
    terminated: AtomicBool,
    consumer_gone: AtomicBool,
    wake_lock: Mutex<()>,
    wake: Condvar,
    config: HandoffConfig,
    counters: Counters,
}

impl Shared {
    fn state(&self) -> HandoffState {
        if self.state.load(Ordering::Acquire) == READY {
            HandoffState::Ready
        } else {
            HandoffState::Idle
        }
    }

    fn notify(&self) {
        let _guard = self.wake_lock.lock();
        self.wake.notify_all();
    }

    /// Waits once according to the wait strategy, unless `done` already holds.
    fn wait_step(&self, done: impl Fn() -> bool) {
        self.wait_step_within(self.config.poll_interval(), done);
    }

    /// One wait of at most `limit`, skipped if `done` already holds.
    fn wait_step_within(&self, limit: Duration, done: impl Fn() -> bool) {
        let interval = self.config.poll_interval().min(limit).max(Duration::from_micros(1));
        match self.config.wait {
            WaitStrategy::Poll => {
                if !done() {
                    thread::sleep(interval);
                }
            }
            WaitStrategy::Park => {
                let mut guard = self.wake_lock.lock();
                if !done() {
                    // Timed so a missed wakeup costs one interval, not a hang.
                    let _ = self.wake.wait_for(&mut guard, interval);
                }
            }
        }
    }

    /// A pending snapshot or termination is visible to the consumer.
    fn consumable(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
            || (self.state.load(Ordering::Acquire) == READY && self.payload.lock().is_some())
    }

    /// Consumer side: empties the slot and hands the storage back.
    fn release(&self, mut slot: SnapshotSlot) {
        slot.clear();
        {
            let mut spare = self.spare.lock();
            if spare.is_none() {
                *spare = Some(slot);
            }
        }
        self.mark_idle();
    }

    fn mark_idle(&self) {
        self.state.store(IDLE, Ordering::Release);
        self.notify();
    }
}

/// Creates a connected producer/consumer pair.
#[must_use]
pub fn channel(config: HandoffConfig) -> (HandoffProducer, HandoffConsumer) {
    let shared = Arc::new(Shared {
        state: AtomicU8::new(IDLE),
        payload: Mutex::new(None),
        spare: Mutex::new(None),
        terminated: AtomicBool::new(false),
        consumer_gone: AtomicBool::new(false),
        wake_lock: Mutex::new(()),
        wake: Condvar::new(),
        config,
        counters: Counters::default(),
    });
    (
        HandoffProducer {
            shared: Arc::clone(&shared),
            finished: false,
        },
        HandoffConsumer { shared },
    )
}

/// The publishing end. Exactly one exists per channel.
pub struct HandoffProducer {
    shared: Arc<Shared>,
    finished: bool,
}

impl HandoffProducer {
    /// Hands a completed snapshot to the consumer.
    ///
    /// # Errors
    ///
    /// - [`PublishError::Occupied`] under [`OverwritePolicy::Reject`] while a
    ///   snapshot is pending or being drained.
    /// - [`PublishError::Disconnected`] once the consumer is gone.
    ///
    /// The slot is returned inside the error.
    pub fn publish(&mut self, slot: SnapshotSlot) -> Result<Published, PublishError> {
        let shared = &*self.shared;
        if shared.consumer_gone.load(Ordering::Acquire) {
            Counters::bump(&shared.counters.rejected);
            return Err(PublishError::Disconnected(slot));
        }

        if shared.state.load(Ordering::Acquire) == READY {
            match shared.config.policy {
                OverwritePolicy::Reject => {
                    Counters::bump(&shared.counters.rejected);
                    tracing::debug!(time = slot.simulation_time(), "publish rejected, slot occupied");
                    return Err(PublishError::Occupied(slot));
                }
                OverwritePolicy::DropNewest => {
                    Counters::bump(&shared.counters.dropped);
                    tracing::debug!(time = slot.simulation_time(), "publish dropped, slot occupied");
                    return Ok(Published::Dropped(slot));
                }
                OverwritePolicy::BlockProducer => {
                    Counters::bump(&shared.counters.blocked_waits);
                    let released = || {
                        shared.state.load(Ordering::Acquire) == IDLE
                            || shared.consumer_gone.load(Ordering::Acquire)
                    };
                    while !released() {
                        shared.wait_step(released);
                    }
                    if shared.consumer_gone.load(Ordering::Acquire) {
                        Counters::bump(&shared.counters.rejected);
                        return Err(PublishError::Disconnected(slot));
                    }
                }
            }
        }

        *shared.payload.lock() = Some(slot);
        shared.state.store(READY, Ordering::Release);
        Counters::bump(&shared.counters.published);
        shared.notify();
        Ok(Published::Delivered)
    }

    /// A slot for the next snapshot: the recycled one if available.
    ///
    /// Steady state allocates nothing: at most the pending slot and one
    /// spare ever exist.
    #[must_use]
    pub fn acquire_slot(&mut self, capacity: usize) -> SnapshotSlot {
        match self.shared.spare.lock().take() {
            Some(mut slot) => {
                slot.reserve(capacity);
                slot
            }
            None => SnapshotSlot::with_capacity(capacity),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> HandoffState {
        self.shared.state()
    }

    /// True once the consumer has been dropped.
    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        self.shared.consumer_gone.load(Ordering::Acquire)
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> HandoffStats {
        self.shared.counters.snapshot()
    }

    /// Ends the stream.
    ///
    /// `Drain` waits until the consumer has released the last snapshot (or
    /// is gone). `Abandon` takes back a snapshot the consumer has not
    /// started on and returns it.
    pub fn finish(mut self, mode: FinishMode) -> Option<SnapshotSlot> {
        self.terminate(mode)
    }

    fn terminate(&mut self, mode: FinishMode) -> Option<SnapshotSlot> {
        if self.finished {
            return None;
        }
        self.finished = true;
        let shared = &*self.shared;

        let reclaimed = match mode {
            FinishMode::Drain => {
                let drained = || {
                    shared.state.load(Ordering::Acquire) == IDLE
                        || shared.consumer_gone.load(Ordering::Acquire)
                };
                while !drained() {
                    shared.wait_step(drained);
                }
                None
            }
            FinishMode::Abandon => {
                let mut payload = shared.payload.lock();
                let taken = payload.take();
                if taken.is_some() {
                    // Consumer had not started on it; the slot is free again.
                    shared.state.store(IDLE, Ordering::Release);
                    Counters::bump(&shared.counters.reclaimed);
                }
                taken
            }
        };

        shared.terminated.store(true, Ordering::Release);
        shared.notify();
        tracing::debug!(?mode, reclaimed = reclaimed.is_some(), "handoff finished");
        reclaimed
    }
}

impl Drop for HandoffProducer {
    fn drop(&mut self) {
        if let Some(slot) = self.terminate(FinishMode::Abandon) {
            tracing::warn!(time = slot.simulation_time(), "producer dropped with an undrained snapshot");
        }
    }
}

impl std::fmt::Debug for HandoffProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandoffProducer")
            .field("state", &self.state())
            .field("finished", &self.finished)
            .finish()
    }
}

/// The draining end. Exactly one exists per channel.
pub struct HandoffConsumer {
    shared: Arc<Shared>,
}

impl HandoffConsumer {
    /// Takes the pending snapshot without blocking.
    ///
    /// Returns `None` when the channel is idle, and also while a previously
    /// taken snapshot has not been released yet.
    #[must_use]
    pub fn try_consume(&self) -> Option<ConsumedSlot> {
        let shared = &self.shared;
        if shared.state.load(Ordering::Acquire) != READY {
            return None;
        }
        let slot = shared.payload.lock().take()?;
        Counters::bump(&shared.counters.consumed);
        Some(ConsumedSlot {
            slot,
            shared: Arc::clone(shared),
            released: false,
        })
    }

    /// Waits for a snapshot. Returns `None` once the producer has finished and
    /// nothing is pending.
    #[must_use]
    pub fn consume_blocking(&self) -> Option<ConsumedSlot> {
        let shared = &*self.shared;
        loop {
            if let Some(slot) = self.try_consume() {
                return Some(slot);
            }
            if shared.terminated.load(Ordering::Acquire) {
                // A publish may have landed just before the flag.
                return self.try_consume();
            }
            shared.wait_step(|| shared.consumable());
        }
    }

    /// Like [`HandoffConsumer::consume_blocking`] with an upper bound on the wait.
    #[must_use]
    pub fn consume_timeout(&self, timeout: Duration) -> Option<ConsumedSlot> {
        let deadline = Instant::now() + timeout;
        let shared = &*self.shared;
        loop {
            if let Some(slot) = self.try_consume() {
                return Some(slot);
            }
            let now = Instant::now();
            if shared.terminated.load(Ordering::Acquire) || now >= deadline {
                return self.try_consume();
            }
            shared.wait_step_within(deadline - now, || shared.consumable());
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> HandoffState {
        self.shared.state()
    }

    /// True once the producer has finished.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.shared.terminated.load(Ordering::Acquire)
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> HandoffStats {
        self.shared.counters.snapshot()
    }
}

impl Drop for HandoffConsumer {
    fn drop(&mut self) {
        self.shared.consumer_gone.store(true, Ordering::Release);
        self.shared.notify();
    }
}

impl std::fmt::Debug for HandoffConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandoffConsumer")
            .field("state", &self.state())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

/// A drained snapshot. The channel stays `Ready` until this is released.
///
/// Dropping it (or [`ConsumedSlot::release`]) recycles the storage and sets
/// the channel `Idle`.
#[must_use = "the channel becomes Idle as soon as the slot is dropped"]
pub struct ConsumedSlot {
    slot: SnapshotSlot,
    shared: Arc<Shared>,
    released: bool,
}

impl ConsumedSlot {
    /// Releases the snapshot and sets the channel `Idle`.
    pub fn release(self) {
        drop(self);
    }

    /// Keeps the snapshot by value. The channel becomes `Idle` immediately;
    /// nothing is recycled.
    #[must_use]
    pub fn into_inner(mut self) -> SnapshotSlot {
        self.released = true;
        self.shared.mark_idle();
        std::mem::take(&mut self.slot)
    }
}

impl Deref for ConsumedSlot {
    type Target = SnapshotSlot;

    fn deref(&self) -> &SnapshotSlot {
        &self.slot
    }
}

impl Drop for ConsumedSlot {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.shared.release(std::mem::take(&mut self.slot));
        }
    }
}

impl std::fmt::Debug for ConsumedSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ConsumedSlot").field(&self.slot).finish()
    }
}

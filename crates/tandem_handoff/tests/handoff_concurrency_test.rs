//! Producer/consumer on separate threads.

use std::collections::HashSet;
use std::thread;
use std::time::Duration;

use tandem_handoff::{
    channel, FinishMode, Float4, HandoffConfig, OverwritePolicy, PublishError, SnapshotSlot, WaitStrategy,
};

const SLOTS: u64 = 100;

fn tagged(producer: &mut tandem_handoff::HandoffProducer, tag: u64) -> SnapshotSlot {
    let mut slot = producer.acquire_slot(4);
    #[allow(clippy::cast_precision_loss)]
    let time = tag as f64;
    slot.fill_from(time, &[Float4::ZERO; 4], &[Float4::ZERO; 4], &[tag; 4]).unwrap();
    slot
}

/// Publishes every tag, retrying while the slot is occupied.
fn run(config: HandoffConfig) -> (Vec<u64>, u64) {
    let (mut producer, consumer) = channel(config);

    let reader = thread::spawn(move || {
        let mut seen = Vec::new();
        while let Some(slot) = consumer.consume_blocking() {
            assert!(slot.ids().iter().all(|&id| id == slot.ids()[0]));
            seen.push(slot.ids()[0]);
        }
        seen
    });

    let mut retries = 0;
    for tag in 0..SLOTS {
        let mut slot = tagged(&mut producer, tag);
        loop {
            match producer.publish(slot) {
                Ok(_) => break,
                Err(PublishError::Occupied(back)) => {
                    retries += 1;
                    slot = back;
                    thread::yield_now();
                }
                Err(err) => panic!("unexpected publish failure: {err}"),
            }
        }
    }
    let stats = producer.stats();
    assert!(producer.finish(FinishMode::Drain).is_none());
    assert_eq!(stats.published, SLOTS);

    (reader.join().unwrap(), retries)
}

fn assert_delivered_in_order(seen: &[u64]) {
    assert_eq!(seen.len() as u64, SLOTS, "every publish drained exactly once");
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "tags out of order: {seen:?}");
    let unique: HashSet<_> = seen.iter().collect();
    assert_eq!(unique.len(), seen.len(), "duplicate drain");
}

#[test]
fn test_hundred_slots_polling() {
    let (seen, _) = run(HandoffConfig::default());
    assert_delivered_in_order(&seen);
}

#[test]
fn test_hundred_slots_parking() {
    let (seen, _) = run(HandoffConfig {
        wait: WaitStrategy::Park,
        ..HandoffConfig::default()
    });
    assert_delivered_in_order(&seen);
}

#[test]
fn test_hundred_slots_blocking_producer() {
    let (seen, retries) = run(HandoffConfig {
        policy: OverwritePolicy::BlockProducer,
        wait: WaitStrategy::Park,
        ..HandoffConfig::default()
    });
    assert_delivered_in_order(&seen);
    assert_eq!(retries, 0);
}

#[test]
fn test_drop_newest_never_duplicates() {
    let (mut producer, consumer) = channel(HandoffConfig {
        policy: OverwritePolicy::DropNewest,
        ..HandoffConfig::default()
    });

    let reader = thread::spawn(move || {
        let mut seen = Vec::new();
        while let Some(slot) = consumer.consume_blocking() {
            seen.push(slot.ids()[0]);
            thread::sleep(Duration::from_micros(200));
        }
        seen
    });

    for tag in 0..SLOTS {
        let slot = tagged(&mut producer, tag);
        let _ = producer.publish(slot).unwrap();
    }
    let stats = producer.stats();
    let _ = producer.finish(FinishMode::Drain);
    let seen = reader.join().unwrap();

    assert_eq!(stats.published + stats.dropped, SLOTS);
    assert_eq!(seen.len() as u64, stats.published);
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn test_compute_failure_still_terminates_writer() {
    let (mut producer, consumer) = channel(HandoffConfig::default());
    let reader = thread::spawn(move || {
        let mut count = 0;
        while consumer.consume_blocking().is_some() {
            count += 1;
        }
        count
    });

    let compute = thread::spawn(move || {
        let slot = tagged(&mut producer, 0);
        producer.publish(slot).unwrap();
        panic!("simulated kernel failure");
    });
    assert!(compute.join().is_err());
    // The panicking thread dropped the producer, which abandons the stream.
    let drained = reader.join().unwrap();
    assert!(drained <= 1);
}

//! Pipeline end to end on the emulated device.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tandem::{DriftKernel, InitialState, Pipeline, PipelineError, SnapshotOutcome, TandemConfig};
use tandem_core::{DeviceHandle, DeviceId, EmulatedConfig, EmulatedDevice};
use tandem_handoff::{
    read_raw_snapshot, Float4, RawSnapshotWriter, SnapshotSlot, SnapshotTarget, SnapshotWriter, WriterResult,
};

fn backend(devices: u32) -> Arc<EmulatedDevice> {
    Arc::new(EmulatedDevice::new(EmulatedConfig {
        device_count: devices,
        ..EmulatedConfig::default()
    }))
}

fn handle(backend: &Arc<EmulatedDevice>) -> DeviceHandle {
    DeviceHandle::new(backend.clone(), DeviceId(0))
}

fn temp_dir() -> PathBuf {
    let id = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("tandem_pipeline_{id}"));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn config(extra: &str) -> TandemConfig {
    TandemConfig::from_toml_str(&format!("[simulation]\nparticles = 8\ndt = 0.125\n{extra}")).unwrap()
}

/// Keeps every snapshot it is handed, optionally slowly.
#[derive(Clone, Default)]
struct Recording {
    seen: Arc<Mutex<Vec<(String, SnapshotSlot)>>>,
    delay: Duration,
}

impl SnapshotWriter for Recording {
    fn write(&mut self, target: &SnapshotTarget, slot: &SnapshotSlot) -> WriterResult<u64> {
        thread::sleep(self.delay);
        let name = target.path.file_name().unwrap().to_string_lossy().into_owned();
        self.seen.lock().unwrap().push((name, slot.clone()));
        Ok(0)
    }
}

#[test]
fn test_snapshot_cadence_follows_simulation_time() {
    let backend = backend(1);
    let config = config(
        "[handoff]\npolicy = \"block_producer\"\nwait = \"park\"\n\
         [snapshot]\nbase = \"snap\"\ninterval = 0.25\n",
    );
    let initial = InitialState::lattice(8);
    let recording = Recording::default();
    let pipeline = Pipeline::new(&config, &handle(&backend), initial.clone(), DriftKernel::new(), recording.clone())
        .unwrap();

    let summary = pipeline.run(8).unwrap();
    assert_eq!(summary.time, 1.0);
    assert_eq!(summary.stats.snapshots_published, 5);
    assert_eq!(summary.stats.snapshots_skipped, 0);
    assert_eq!(summary.writer.unwrap().snapshots_written, 5);

    let seen = recording.seen.lock().unwrap();
    let names: Vec<_> = seen.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(
        names,
        ["snap_00000.0000", "snap_00000.2500", "snap_00000.5000", "snap_00000.7500", "snap_00001.0000"]
    );

    // First snapshot is the initial state, the last one has drifted for t = 1.
    let (_, first) = &seen[0];
    assert_eq!(first.positions(), initial.positions.as_slice());
    assert_eq!(first.ids(), initial.ids.as_slice());
    let (_, last) = &seen[4];
    for ((p, p0), v) in last.positions().iter().zip(&initial.positions).zip(&initial.velocities) {
        assert!((p.x - (p0.x + v.x)).abs() < 1e-5);
        assert!((p.z - (p0.z + v.z)).abs() < 1e-5);
        assert_eq!(p.w, p0.w);
    }
    assert!(backend.stats().is_quiescent());
}

#[test]
fn test_busy_writer_skips_without_blocking_compute() {
    let backend = backend(1);
    let config = config("[snapshot]\ninterval = 0.125\n");
    let recording = Recording {
        delay: Duration::from_millis(20),
        ..Recording::default()
    };
    let mut pipeline = Pipeline::new(
        &config,
        &handle(&backend),
        InitialState::lattice(8),
        DriftKernel::new(),
        recording.clone(),
    )
    .unwrap();

    let mut outcomes = Vec::new();
    for _ in 0..20 {
        outcomes.push(pipeline.step().unwrap().snapshot);
    }
    assert!(outcomes.iter().all(|outcome| *outcome != SnapshotOutcome::NotDue));
    assert_eq!(outcomes[0], SnapshotOutcome::Published);

    let summary = pipeline.finish().unwrap();
    let stats = summary.stats;
    assert_eq!(stats.snapshots_published + stats.snapshots_skipped, 20);
    assert!(stats.snapshots_skipped > 0);
    assert_eq!(recording.seen.lock().unwrap().len() as u64, stats.snapshots_published);
}

#[test]
fn test_compute_failure_stops_writer() {
    let backend = backend(1);
    let config = config(
        "[handoff]\npolicy = \"block_producer\"\nwait = \"park\"\n\
         [snapshot]\ninterval = 0.125\n",
    );
    let recording = Recording::default();
    let mut pipeline = Pipeline::new(
        &config,
        &handle(&backend),
        InitialState::lattice(8),
        DriftKernel::new(),
        recording.clone(),
    )
    .unwrap();
    pipeline.step().unwrap();
    pipeline.step().unwrap();

    backend.fail_next_copies(u32::MAX);
    let err = pipeline.run(10).unwrap_err();
    assert!(matches!(err, PipelineError::Step { step: 2, .. }), "{err}");
    assert!(err.is_retryable());

    // Returning at all means the writer thread was joined. The second
    // snapshot may have been taken back undrained.
    let written = recording.seen.lock().unwrap().len();
    assert!((1..=2).contains(&written), "{written}");
    assert!(backend.stats().is_quiescent());
}

#[test]
fn test_render_copy_reaches_graphics_buffer() {
    let backend = backend(2);
    let config = config("[device]\ncompute = 0\nrender = 1\n[render]\nenabled = true\n");
    let mut pipeline = Pipeline::new(
        &config,
        &handle(&backend),
        InitialState::lattice(8),
        DriftKernel::new(),
        RawSnapshotWriter::new(),
    )
    .unwrap();

    let report = pipeline.step().unwrap();
    assert!(report.rendered);
    assert_eq!(report.snapshot, SnapshotOutcome::NotDue);

    let render = pipeline.render_buffer().unwrap();
    assert!(!render.is_mapped());
    assert_eq!(render.device().id(), DeviceId(1));
    let id = render.graphics_buffer().unwrap();
    let host: &[Float4] = pipeline.particles().positions.host();
    assert_eq!(backend.graphics_contents(id).unwrap(), bytemuck::cast_slice::<Float4, u8>(host));

    let summary = pipeline.finish().unwrap();
    assert_eq!(summary.stats.render_copies, 1);
    assert!(summary.writer.is_none());
    assert!(backend.stats().is_quiescent());
}

#[test]
fn test_raw_snapshots_on_disk() {
    let dir = temp_dir();
    let backend = backend(1);
    let config = config(&format!(
        "[handoff]\npolicy = \"block_producer\"\n[snapshot]\ndirectory = {:?}\nbase = \"raw\"\ninterval = 0.5\n",
        dir.to_string_lossy()
    ));
    let pipeline = Pipeline::new(
        &config,
        &handle(&backend),
        InitialState::lattice(8),
        DriftKernel::new(),
        RawSnapshotWriter::new(),
    )
    .unwrap();
    let summary = pipeline.run(4).unwrap();
    assert_eq!(summary.writer.unwrap().snapshots_written, 2);

    let last = read_raw_snapshot(&dir.join("raw_00000.5000")).unwrap();
    assert_eq!(last.simulation_time(), 0.5);
    assert_eq!(last.element_count(), 8);
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_setup_errors_leak_nothing() {
    let backend = backend(1);
    let config = config("");

    let short = InitialState::lattice(4);
    let err = Pipeline::new(&config, &handle(&backend), short, DriftKernel::new(), RawSnapshotWriter::new())
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::InitialState { what: "positions", expected: 8, actual: 4 }
    ));

    backend.fail_malloc_after(1);
    let err = Pipeline::new(&config, &handle(&backend), InitialState::lattice(8), DriftKernel::new(), RawSnapshotWriter::new())
        .unwrap_err();
    assert!(matches!(err, PipelineError::Setup(_)));
    assert!(backend.stats().is_quiescent());
}

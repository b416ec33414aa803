//! # TANDEM Runner
//!
//! Headless driver on the emulated device backend.
//!
//! ```bash
//! # Defaults, 100 steps, no snapshots
//! ./tandem_run --steps 100
//!
//! # From a config file, verbose
//! RUST_LOG=tandem=debug ./tandem_run --config tandem.toml --steps 1000
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tandem::{DriftKernel, InitialState, Pipeline, PipelineError, TandemConfig};
use tandem_core::{DeviceHandle, EmulatedConfig, EmulatedDevice};
use tandem_handoff::{RawSnapshotWriter, WriterError};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "tandem_run")]
#[command(about = "Run the compute/snapshot/render pipeline on the emulated device")]
struct Cli {
    /// TOML config file (defaults apply when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of simulation steps
    #[arg(short, long, default_value = "100")]
    steps: u64,
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tandem=info"));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let cli = Cli::parse();
    if let Err(err) = run(&cli) {
        eprintln!("tandem_run: {err}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<(), PipelineError> {
    let config = match &cli.config {
        Some(path) => TandemConfig::load(path)?,
        None => TandemConfig::default(),
    };

    if config.snapshot.enabled_interval().is_some() {
        std::fs::create_dir_all(&config.snapshot.directory).map_err(|source| {
            WriterError::Io {
                path: config.snapshot.directory.clone(),
                source,
            }
        })?;
    }

    let devices = config.device.compute.0.max(config.device.render.0) + 1;
    let backend = Arc::new(EmulatedDevice::new(EmulatedConfig {
        device_count: devices,
        ..EmulatedConfig::default()
    }));
    let device = DeviceHandle::new(backend, config.device.compute);

    let pipeline = Pipeline::new(
        &config,
        &device,
        InitialState::lattice(config.simulation.particles),
        DriftKernel::new(),
        RawSnapshotWriter::new(),
    )?;
    let summary = pipeline.run(cli.steps)?;

    tracing::info!(
        steps = summary.stats.steps,
        time = summary.time,
        snapshots = summary.writer.map_or(0, |w| w.snapshots_written),
        failures = summary.writer.map_or(0, |w| w.failures),
        "run complete"
    );
    Ok(())
}

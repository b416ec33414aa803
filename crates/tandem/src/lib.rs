//! # TANDEM
//!
//! Reference pipeline on top of [`tandem_core`] and [`tandem_handoff`]:
//! - [`TandemConfig`]: TOML configuration, validated once at startup
//! - [`StepKernel`]: the compute seam ([`DriftKernel`] as the reference)
//! - [`Pipeline`]: compute, role swap, snapshot handoff, optional render copy
//!
//! ## Architecture Rules
//!
//! 1. **Compute never waits on disk** - snapshots leave through the handoff channel
//! 2. **Failures stop the writer** - an aborted run finishes the producer before returning
//! 3. **Devices come from config** - nothing selects a process-wide device
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use tandem::{DriftKernel, InitialState, Pipeline, TandemConfig};
//! use tandem_core::{DeviceHandle, DeviceId, EmulatedDevice};
//! use tandem_handoff::RawSnapshotWriter;
//!
//! let config = TandemConfig::from_toml_str("[simulation]\nparticles = 8\ndt = 0.5\n")?;
//! let device = DeviceHandle::new(Arc::new(EmulatedDevice::default()), DeviceId(0));
//! let pipeline = Pipeline::new(
//!     &config,
//!     &device,
//!     InitialState::lattice(8),
//!     DriftKernel::new(),
//!     RawSnapshotWriter::new(),
//! )?;
//!
//! let summary = pipeline.run(4)?;
//! assert_eq!(summary.stats.steps, 4);
//! assert_eq!(summary.time, 2.0);
//! # Ok::<(), tandem::PipelineError>(())
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod config;
pub mod driver;
pub mod error;
pub mod kernel;

pub use config::{RenderConfig, SimulationConfig, SnapshotConfig, TandemConfig};
pub use driver::{InitialState, Pipeline, PipelineStats, PipelineSummary, SnapshotOutcome, StepReport};
pub use error::{ConfigError, ConfigResult, PipelineError, PipelineResult};
pub use kernel::{DriftKernel, ParticleBuffers, StepKernel};

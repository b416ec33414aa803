//! # Pipeline Configuration
//!
//! One TOML file, read once at startup. Every section and field is optional;
//! missing values take the defaults below.
//!
//! ```toml
//! [device]
//! compute = 0
//! render = 0
//!
//! [simulation]
//! particles = 4096
//! dt = 0.01
//!
//! [handoff]
//! poll_interval_us = 100
//! policy = "reject"        # reject | drop_newest | block_producer
//! wait = "poll"            # poll | park
//!
//! [snapshot]
//! directory = "snapshots"
//! base = "snapshot"
//! interval = 0.25          # omit (or negative) to disable
//! rank = 0
//! process_count = 1
//!
//! [render]
//! enabled = false
//! target = "vertex"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tandem_core::{BufferTarget, DeviceConfig};
use tandem_handoff::{HandoffConfig, SnapshotNaming, DEFAULT_PER_PROCESS_THRESHOLD};

use crate::error::{ConfigError, ConfigResult};

/// Top-level configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TandemConfig {
    /// Compute and render devices.
    pub device: DeviceConfig,
    /// Particle count and time step.
    pub simulation: SimulationConfig,
    /// Handoff channel behavior.
    pub handoff: HandoffConfig,
    /// Snapshot cadence and file naming.
    pub snapshot: SnapshotConfig,
    /// Optional render copy.
    pub render: RenderConfig,
}

/// Particle count and time step.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulationConfig {
    /// Number of particles.
    pub particles: usize,
    /// Simulation time advanced per step.
    pub dt: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            particles: 1024,
            dt: 0.01,
        }
    }
}

/// Snapshot cadence and naming.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SnapshotConfig {
    /// Output directory.
    pub directory: PathBuf,
    /// File name prefix.
    pub base: String,
    /// Simulation time between snapshots. `None` or negative disables.
    pub interval: Option<f64>,
    /// Rank of this process.
    pub rank: u32,
    /// Number of cooperating processes.
    pub process_count: u32,
    /// Process count above which each process writes its own file.
    pub per_process_threshold: u32,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("snapshots"),
            base: "snapshot".to_string(),
            interval: None,
            rank: 0,
            process_count: 1,
            per_process_threshold: DEFAULT_PER_PROCESS_THRESHOLD,
        }
    }
}

impl SnapshotConfig {
    /// The effective interval: `Some` only when snapshots are enabled.
    #[must_use]
    pub fn enabled_interval(&self) -> Option<f64> {
        self.interval.filter(|interval| *interval > 0.0)
    }

    /// Naming for the writer thread.
    #[must_use]
    pub fn naming(&self) -> SnapshotNaming {
        SnapshotNaming {
            directory: self.directory.clone(),
            base: self.base.clone(),
            rank: self.rank,
            process_count: self.process_count,
            per_process_threshold: self.per_process_threshold,
        }
    }
}

/// Render copy settings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RenderConfig {
    /// Copy positions into a graphics buffer after every step.
    pub enabled: bool,
    /// Binding target of the graphics buffer.
    pub target: BufferTarget,
}

impl TandemConfig {
    /// Reads, parses and validates a config file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Read`], [`ConfigError::Parse`] or [`ConfigError::Invalid`].
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!(path = %path.display(), "config loaded");
        Ok(config)
    }

    /// Parses and validates TOML text.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] or [`ConfigError::Invalid`].
    pub fn from_toml_str(text: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> ConfigResult<()> {
        self.handoff
            .validate()
            .map_err(|err| ConfigError::invalid("handoff", "poll_interval_us", err.to_string()))?;

        if self.simulation.particles == 0 {
            return Err(ConfigError::invalid("simulation", "particles", "must be non-zero"));
        }
        if !(self.simulation.dt.is_finite() && self.simulation.dt > 0.0) {
            return Err(ConfigError::invalid("simulation", "dt", "must be positive and finite"));
        }

        let snapshot = &self.snapshot;
        if snapshot.base.is_empty() {
            return Err(ConfigError::invalid("snapshot", "base", "must not be empty"));
        }
        if snapshot.rank >= snapshot.process_count {
            return Err(ConfigError::invalid(
                "snapshot",
                "rank",
                format!("rank {} not below process count {}", snapshot.rank, snapshot.process_count),
            ));
        }
        if let Some(interval) = snapshot.interval {
            // Negative disables.
            if interval == 0.0 || !interval.is_finite() {
                return Err(ConfigError::invalid("snapshot", "interval", "must be positive (or negative to disable)"));
            }
        }
        Ok(())
    }
}

//! # Pipeline Error Types
//!
//! Configuration problems are fatal at startup. Pipeline errors carry the
//! step they occurred on; the caller decides whether to retry or abort.

use std::io;
use std::path::PathBuf;

use tandem_core::ResourceError;
use tandem_handoff::{HandoffError, WriterError};
use thiserror::Error;

/// Errors loading or validating a [`TandemConfig`](crate::TandemConfig).
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config {}: {source}", .path.display())]
    Read {
        /// File attempted.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },

    /// The file is not valid TOML for this schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range.
    #[error("invalid config: {section}.{field}: {reason}")]
    Invalid {
        /// Section name.
        section: &'static str,
        /// Field name.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(section: &'static str, field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            section,
            field,
            reason: reason.into(),
        }
    }
}

/// Result type for configuration.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors from building or running a [`Pipeline`](crate::Pipeline).
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Rejected configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Initial particle arrays of the wrong shape.
    #[error("initial state: expected {expected} {what}, got {actual}")]
    InitialState {
        /// Array at fault.
        what: &'static str,
        /// Particle count from the config.
        expected: usize,
        /// Length supplied.
        actual: usize,
    },

    /// Buffer allocation or upload failed before the first step.
    #[error("pipeline setup failed: {0}")]
    Setup(#[source] ResourceError),

    /// A device operation failed during a step.
    #[error("step {step} failed: {source}")]
    Step {
        /// Step index (0-based).
        step: u64,
        /// Underlying error.
        source: ResourceError,
    },

    /// Releasing device state at shutdown failed.
    #[error("pipeline teardown failed: {0}")]
    Teardown(#[source] ResourceError),

    /// Snapshot slot could not be filled.
    #[error(transparent)]
    Handoff(#[from] HandoffError),

    /// The writer thread failed.
    #[error(transparent)]
    Writer(#[from] WriterError),
}

impl PipelineError {
    /// True if the failure came from a retryable device transfer.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Setup(source) | Self::Teardown(source) | Self::Step { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

/// Result type for the pipeline.
pub type PipelineResult<T> = Result<T, PipelineError>;

// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// Failures surfaced by the engine core.
///
/// Presentation staleness (out-of-date / suboptimal surfaces) is not an error:
/// it travels as a regular result value and is handled by recreating the
/// image chain.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A file the engine depends on (shader bytecode) could not be read.
    #[error("failed to read `{}`", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The caller handed over an incomplete or inconsistent description.
    #[error("precondition violated: {0}")]
    Precondition(String),

    /// The graphics driver rejected an operation it was expected to accept.
    #[error("device error in {op}: {reason}")]
    Device { op: &'static str, reason: String },
}

impl EngineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    pub fn device(op: &'static str, reason: impl std::fmt::Display) -> Self {
        Self::Device {
            op,
            reason: reason.to_string(),
        }
    }

    /// True for programming-contract violations that should abort loudly.
    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::Precondition(_))
    }
}

pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .try_init();
    tracing::debug!("tracing initialised");
}

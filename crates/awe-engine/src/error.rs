//! Error types for the AWE engine binary.
//!
//! [`EngineError`] is the top-level error type that wraps all possible
//! failure modes during engine startup and the run itself.

use std::path::PathBuf;

/// Top-level error for the engine binary.
///
/// Each variant wraps a specific subsystem error, providing a single
/// error type that `main` can propagate with `?`.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: awe_core::ConfigError,
    },

    /// The initial population could not be built.
    #[error("population error: {source}")]
    System {
        /// The underlying system error.
        #[from]
        source: awe_core::SystemError,
    },

    /// The resampler could not be configured.
    #[error("resampler error: {source}")]
    Resample {
        /// The underlying resampler error.
        #[from]
        source: awe_core::ResampleError,
    },

    /// The checkpoint store could not be opened.
    #[error("checkpoint store error: {source}")]
    Store {
        /// The underlying store error.
        #[from]
        source: awe_store::StoreError,
    },

    /// The run stopped on a fatal error.
    #[error("run failed ({class}): {source}")]
    Run {
        /// Failure class for operators.
        class: awe_core::controller::FailureClass,
        /// The underlying controller error.
        source: awe_core::ControllerError,
    },

    /// An initial walker snapshot could not be read.
    #[error("failed to read walker snapshot {}: {source}", path.display())]
    Snapshot {
        /// The snapshot file.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// NATS connection or messaging failed.
    #[error("NATS error: {message}")]
    Nats {
        /// Description of the NATS failure.
        message: String,
    },

    /// Startup wiring failed.
    #[error("setup error: {message}")]
    Setup {
        /// Description of the failure.
        message: String,
    },
}

impl From<awe_core::ControllerError> for EngineError {
    fn from(source: awe_core::ControllerError) -> Self {
        Self::Run {
            class: source.failure_class(),
            source,
        }
    }
}

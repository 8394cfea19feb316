//! Custom error types for the application.
//!
//! This module defines the primary error type, `AcqError`, for the entire
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different kinds of failures that can occur
//! during a recording, from configuration and I/O issues to device faults.
//!
//! ## Error taxonomy
//!
//! - **Fatal**: `BufferOverflow`. The camera ring buffer discarded frames
//!   mid-sequence, so frame/metadata correlation can no longer be trusted.
//!   This aborts the current acquisition and must bubble up to the caller.
//! - **Recoverable**: `Device`, `Processing`, serial faults. These are
//!   contained at the producer or consumer that raised them and logged, so one
//!   misbehaving device cannot halt acquisition from the others.
//! - **Expected non-errors** (no variant here): a producer returning no new
//!   sample, or a duplicate stream registration, are reported through
//!   `Option`/`bool` returns rather than errors.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AcqResult<T> = std::result::Result<T, AcqError>;

#[derive(Error, Debug)]
pub enum AcqError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The camera-side ring buffer discarded data during a triggered
    /// sequence. Unrecoverable mid-acquisition: the operator must reset the
    /// hardware before retrying.
    #[error(
        "camera '{camera}' ring buffer overflowed after {frames_yielded} frames; \
         frame/metadata correlation cannot be trusted - reset the hardware before retrying"
    )]
    BufferOverflow {
        camera: String,
        frames_yielded: usize,
    },

    #[error("Device error: {0}")]
    Device(String),

    #[error("Serial port not connected")]
    SerialPortNotConnected,

    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,

    #[error("Data processing error: {0}")]
    Processing(String),
}

impl AcqError {
    /// Whether the caller may retry after this error without a hardware
    /// reset. Buffer overflow is the one fault that invalidates in-flight
    /// data.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AcqError::BufferOverflow { .. })
    }
}

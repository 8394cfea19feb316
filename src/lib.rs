//! Synchronized multi-device acquisition for wheel-running imaging rigs.
//!
//! One widefield (and optionally one pupil) camera is driven through
//! hardware-triggered frame sequences while a rotary wheel encoder and a DAQ
//! edge counter sample concurrently, all timestamped against a single
//! session clock so behavior can be aligned with imaging offline.
//!
//! The crate splits into:
//! - [`engine`]: triggered camera sequencing and the lazy frame drain
//! - [`data`]: producer/consumer streams, the shared event queue, and
//!   session output writers
//! - [`hardware`]: the encoder and DAQ producers
//! - [`procedure`]: end-to-end session orchestration

pub mod config;
pub mod core;
pub mod data;
pub mod engine;
pub mod error;
pub mod hardware;
pub mod paths;
pub mod procedure;

pub use config::{ExperimentConfig, Settings};
pub use error::{AcqError, AcqResult};

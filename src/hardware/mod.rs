//! Device producers: the wheel encoder and the DAQ edge counter.

pub mod daq;
pub mod encoder;

pub use daq::{DaqInterface, EdgeCounterWorker, SimulatedDaq};
pub use encoder::{EncoderSample, EncoderWorker};

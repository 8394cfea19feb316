//! Data handling: bounded buffers, producer/consumer streams, the shared
//! device event queue, and session output writers.

pub mod buffer;
pub mod database;
pub mod queue;
pub mod saver;
pub mod stream;

pub use buffer::{DataBuffer, DEFAULT_BUFFER_SIZE};
pub use database::{SessionDatabase, SessionRecord};
pub use queue::{DataPacket, DataQueue, QueueLogger};
pub use saver::DataSaver;
pub use stream::{DataStream, StreamRegistry};

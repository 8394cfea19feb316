//! Core traits and data types for the acquisition stack.
use crate::error::AcqResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Instant;

/// A single heterogeneous device sample.
///
/// Every producer emits one of these variants; the streaming framework never
/// needs to know about concrete device types.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum Reading {
    /// Raw encoder tick delta since the previous poll.
    Ticks(i64),
    /// Derived linear speed in meters per second.
    Speed(f64),
    /// Host timestamps of newly observed DAQ counter edges, one per edge.
    EdgeTimes(Vec<f64>),
    Scalar(f64),
    Text(String),
}

impl fmt::Display for Reading {
    /// The `data` cell written to exported CSV files.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reading::Ticks(v) => write!(f, "{v}"),
            Reading::Speed(v) | Reading::Scalar(v) => write!(f, "{v}"),
            Reading::EdgeTimes(ts) => {
                let joined = ts
                    .iter()
                    .map(|t| t.to_string())
                    .collect::<Vec<_>>()
                    .join(";");
                write!(f, "{joined}")
            }
            Reading::Text(s) => write!(f, "{s}"),
        }
    }
}

/// A timestamped sample captured from one producer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub data: Reading,
    /// Seconds since the shared session clock was established.
    pub timestamp: f64,
    pub metadata: BTreeMap<String, String>,
}

/// Shared monotonic reference clock for one session.
///
/// Established at most once (by the stream registry on first start, or by
/// the procedure at construction); every producer's samples and the engine's
/// frame tags are measured against the same epoch.
#[derive(Clone, Debug)]
pub struct SessionClock {
    epoch: Instant,
}

impl SessionClock {
    pub fn start() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }
}

/// Trait for any component that originates timestamped samples.
///
/// `get_data` returning `None` is not an error; it signals "no new sample
/// this poll". Start/stop failures are reported as errors so the registry
/// can log them and report a boolean failure, never a panic.
pub trait DataProducer: Send + Sync {
    /// Unique name of the producer; doubles as the stream name.
    fn name(&self) -> &str;

    /// Kind of data this producer generates (matched against consumers).
    fn producer_type(&self) -> &str;

    fn start(&self) -> AcqResult<()>;

    fn stop(&self) -> AcqResult<()>;

    /// Latest unconsumed reading, if any.
    fn get_data(&self) -> Option<Reading>;

    /// Static metadata merged into every emitted `DataPoint`.
    fn metadata(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

/// Trait for components that process samples as they arrive.
///
/// A failing consumer is isolated per-call: its error is logged by the
/// collection loop and must not starve other consumers or the stream.
pub trait DataConsumer: Send + Sync {
    fn name(&self) -> &str;

    /// Producer types this consumer wants to be attached to.
    fn accepted_types(&self) -> Vec<String>;

    fn process_data(&self, point: &DataPoint) -> AcqResult<()>;
}

/// Capability set every hardware device exposes.
///
/// Cameras, the wheel encoder, and the DAQ all satisfy this; the framework
/// depends only on the capability set, never on concrete device types.
pub trait HardwareDevice: Send + Sync {
    fn device_id(&self) -> &str;

    fn device_type(&self) -> &str;

    fn initialize(&self) -> AcqResult<()> {
        Ok(())
    }

    fn start(&self) -> AcqResult<()>;

    fn stop(&self) -> AcqResult<()>;

    fn shutdown(&self) -> AcqResult<()>;

    /// Persist the device's accumulated session data to `path`.
    fn save_data(&self, path: &Path) -> AcqResult<()>;

    /// File extension of the device's primary output.
    fn file_extension(&self) -> &str {
        "csv"
    }

    /// BIDS subdirectory for the device's primary output, if any.
    fn bids_type(&self) -> Option<&str> {
        None
    }

    fn started_at(&self) -> Option<chrono::DateTime<chrono::Utc>>;

    fn stopped_at(&self) -> Option<chrono::DateTime<chrono::Utc>>;
}

/// One camera exposure within a hardware-triggered sequence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MdaEvent {
    pub index: usize,
    pub exposure_ms: f64,
}

/// An ordered, dispatch-once unit of an MDA sequence.
///
/// Immutable once dispatched; owned by the caller and consumed by the
/// acquisition engine exactly once.
#[derive(Clone, Debug)]
pub struct SequencedEvent {
    pub events: Vec<MdaEvent>,
    /// Start reference on the session clock, in seconds; `None` means the
    /// engine records "now" when the event is executed.
    pub runner_t0: Option<f64>,
    pub metadata: BTreeMap<String, String>,
}

impl SequencedEvent {
    /// A uniform N-frame sequence with a single exposure time.
    pub fn uniform(n_frames: usize, exposure_ms: f64) -> Self {
        let events = (0..n_frames)
            .map(|index| MdaEvent { index, exposure_ms })
            .collect();
        Self {
            events,
            runner_t0: None,
            metadata: BTreeMap::new(),
        }
    }
}

/// Raw pixels popped from the camera ring buffer.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameData {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u16>,
}

/// Per-frame metadata attached to every yielded image.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameMeta {
    pub camera_id: String,
    /// Offset of the sequence start relative to `runner_t0`, milliseconds.
    pub event_t0_ms: f64,
    /// Elapsed time since `t0` when this frame was popped, milliseconds.
    pub elapsed_ms: f64,
    /// Images left in the hardware buffer after this pop.
    pub remaining_in_buffer: usize,
}

/// (pixel array, originating event, per-frame metadata).
///
/// Ownership transfers to the downstream writer immediately; the engine
/// never caches more than the frame in flight.
#[derive(Clone, Debug)]
pub struct ImagePayload {
    pub frame: FrameData,
    pub event: MdaEvent,
    pub event_index: usize,
    pub channel_index: usize,
    pub meta: FrameMeta,
}

/// Summary returned by `setup_sequence`, describing what the engine will
/// drive the camera through.
#[derive(Clone, Debug, Serialize)]
pub struct SummaryMetadata {
    pub camera_id: String,
    pub n_events: usize,
    pub n_channels: usize,
    pub expected_frames: usize,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reading_display_matches_csv_cells() {
        assert_eq!(Reading::Ticks(7).to_string(), "7");
        assert_eq!(Reading::Text("a".into()).to_string(), "a");
        assert_eq!(Reading::EdgeTimes(vec![1.0, 1.0]).to_string(), "1;1");
    }

    #[test]
    fn uniform_sequence_orders_events() {
        let seq = SequencedEvent::uniform(3, 10.0);
        let indices: Vec<usize> = seq.events.iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn session_clock_is_monotonic() {
        let clock = SessionClock::start();
        let a = clock.elapsed_secs();
        let b = clock.elapsed_secs();
        assert!(b >= a);
    }
}

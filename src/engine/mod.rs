//! Sequenced acquisition engine.
//!
//! `AcquisitionEngine` drives one camera through a hardware-triggered MDA
//! sequence: `setup_sequence` programs the trigger source,
//! `exec_sequenced_event` gates, arms the camera, and returns a
//! `SequenceDrain` that lazily yields frames from the device ring buffer,
//! and `teardown_sequence` releases the trigger and persists the
//! co-running encoder's samples.

pub mod camera;

pub use camera::{CameraCore, SimulatedCamera};

use crate::core::{
    FrameMeta, ImagePayload, MdaEvent, SequencedEvent, SessionClock, SummaryMetadata,
};
use crate::data::saver::DataSaver;
use crate::error::{AcqError, AcqResult};
use crate::hardware::daq::DaqInterface;
use crate::hardware::encoder::EncoderWorker;
use std::sync::Arc;
use std::time::Duration;

/// Ring-buffer poll backoff while waiting for the next exposure.
const DRAIN_BACKOFF: Duration = Duration::from_micros(500);

/// How long a digital-input gate may stay low before the run is abandoned.
const GATE_TIMEOUT: Duration = Duration::from_secs(30);

/// Direction of the DAQ line used for external gating.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DigitalIo {
    /// Pulse the line to trigger the downstream hardware ourselves.
    Output,
    /// Wait for an external source to raise the line.
    Input,
}

/// How a sequence is started on the rig.
#[derive(Clone, Debug)]
pub enum TriggerMode {
    /// Development mode: arm and go, no hardware gate.
    Untriggered,
    /// Widefield rig: the camera cycles a programmed LED bank pattern.
    LedPattern(Vec<String>),
    /// Externally gated through a DAQ digital line.
    DigitalLine { io: DigitalIo },
}

pub struct AcquisitionEngine<C: CameraCore> {
    core: Arc<C>,
    trigger: TriggerMode,
    clock: SessionClock,
    daq: Option<Arc<dyn DaqInterface>>,
    encoder: Option<Arc<EncoderWorker>>,
    saver: Option<DataSaver>,
    pulse_width: Duration,
}

fn device_err(e: anyhow::Error) -> AcqError {
    AcqError::Device(format!("{e:#}"))
}

impl<C: CameraCore> AcquisitionEngine<C> {
    pub fn new(core: Arc<C>, trigger: TriggerMode, clock: SessionClock) -> Self {
        Self {
            core,
            trigger,
            clock,
            daq: None,
            encoder: None,
            saver: None,
            pulse_width: Duration::from_millis(1),
        }
    }

    pub fn with_daq(mut self, daq: Arc<dyn DaqInterface>, pulse_width: Duration) -> Self {
        self.daq = Some(daq);
        self.pulse_width = pulse_width;
        self
    }

    pub fn with_encoder(mut self, encoder: Arc<EncoderWorker>) -> Self {
        self.encoder = Some(encoder);
        self
    }

    pub fn with_saver(mut self, saver: DataSaver) -> Self {
        self.saver = Some(saver);
        self
    }

    pub fn camera(&self) -> &Arc<C> {
        &self.core
    }

    /// Program the trigger source and report what the sequence will do.
    pub async fn setup_sequence(&self, seq: &SequencedEvent) -> AcqResult<SummaryMetadata> {
        if let TriggerMode::LedPattern(pattern) = &self.trigger {
            self.core
                .load_trigger_pattern(pattern)
                .await
                .map_err(device_err)?;
            self.core
                .start_trigger_sequence()
                .await
                .map_err(device_err)?;
            log::info!(
                "camera '{}' cycling LED pattern {:?}",
                self.core.camera_id(),
                pattern
            );
        }
        let n_channels = self.core.camera_channel_count().max(1);
        Ok(SummaryMetadata {
            camera_id: self.core.camera_id().to_string(),
            n_events: seq.events.len(),
            n_channels,
            expected_frames: seq.events.len() * n_channels,
            started_at: chrono::Utc::now(),
        })
    }

    /// Block until the sequence may begin, per the trigger mode.
    async fn gate(&self) -> AcqResult<()> {
        let TriggerMode::DigitalLine { io } = &self.trigger else {
            return Ok(());
        };
        let daq = self
            .daq
            .as_ref()
            .ok_or_else(|| AcqError::Device("digital gating requires a DAQ".to_string()))?;
        match io {
            DigitalIo::Output => {
                daq.write_line(true).map_err(device_err)?;
                tokio::time::sleep(self.pulse_width).await;
                daq.write_line(false).map_err(device_err)?;
                Ok(())
            }
            DigitalIo::Input => {
                let deadline = tokio::time::Instant::now() + GATE_TIMEOUT;
                while !daq.read_line().map_err(device_err)? {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(AcqError::Device(format!(
                            "gate line stayed low for {GATE_TIMEOUT:?}"
                        )));
                    }
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                Ok(())
            }
        }
    }

    /// Gate, record `t0`, arm the camera, and hand back the frame drain.
    ///
    /// The sequence is consumed: the drain is finite and cannot be
    /// restarted.
    pub async fn exec_sequenced_event(&self, seq: SequencedEvent) -> AcqResult<SequenceDrain<C>> {
        self.gate().await?;
        let t0 = seq.runner_t0.unwrap_or_else(|| self.clock.elapsed_secs());
        let n_channels = self.core.camera_channel_count().max(1);
        let expected = seq.events.len() * n_channels;
        self.core
            .start_sequence_acquisition(expected, true)
            .await
            .map_err(device_err)?;
        log::info!(
            "camera '{}' armed for {expected} frames ({} events x {n_channels} channels)",
            self.core.camera_id(),
            seq.events.len()
        );
        Ok(SequenceDrain {
            core: Arc::clone(&self.core),
            clock: self.clock.clone(),
            events: seq.events,
            t0,
            n_channels,
            expected,
            yielded: 0,
            finished: expected == 0,
        })
    }

    /// Release the trigger source, stop the co-running encoder, and persist
    /// its samples plus a configuration snapshot.
    pub async fn teardown_sequence(&self) -> AcqResult<()> {
        if matches!(self.trigger, TriggerMode::LedPattern(_)) {
            if let Err(e) = self.core.stop_trigger_sequence().await {
                log::error!("stopping trigger sequence failed: {e:#}");
            }
        }
        if let Some(encoder) = &self.encoder {
            if let Err(e) = crate::core::DataProducer::stop(encoder.as_ref()) {
                log::error!("stopping encoder failed: {e}");
            }
            if let Some(saver) = &self.saver {
                saver.save_encoder_samples("encoder", &encoder.samples())?;
            }
        }
        if let Some(saver) = &self.saver {
            saver.save_configuration()?;
        }
        Ok(())
    }
}

/// Lazy, finite, non-restartable drain of one armed sequence.
///
/// Frame `i` is tagged `(i / n_channels, i % n_channels)` so an interleaved
/// multi-channel sequence comes out in cartesian event x channel order.
#[derive(Debug)]
pub struct SequenceDrain<C: CameraCore> {
    core: Arc<C>,
    clock: SessionClock,
    events: Vec<MdaEvent>,
    t0: f64,
    n_channels: usize,
    expected: usize,
    yielded: usize,
    finished: bool,
}

impl<C: CameraCore> SequenceDrain<C> {
    pub fn expected_frames(&self) -> usize {
        self.expected
    }

    pub fn yielded_frames(&self) -> usize {
        self.yielded
    }

    /// Next frame of the sequence, `Ok(None)` once it is exhausted.
    ///
    /// A latched hardware buffer overflow ends the drain with the fatal
    /// `BufferOverflow` error; frames already yielded stay valid, nothing
    /// further is yielded.
    pub async fn next_frame(&mut self) -> AcqResult<Option<ImagePayload>> {
        if self.finished {
            return Ok(None);
        }
        loop {
            if self.core.is_buffer_overflowed().await.map_err(device_err)? {
                self.finished = true;
                if let Err(e) = self.core.stop_sequence_acquisition().await {
                    log::error!("stopping overflowed sequence failed: {e:#}");
                }
                return Err(AcqError::BufferOverflow {
                    camera: self.core.camera_id().to_string(),
                    frames_yielded: self.yielded,
                });
            }

            let remaining = self.core.remaining_image_count().await.map_err(device_err)?;
            if remaining > 0 {
                if self.yielded >= self.expected {
                    log::warn!(
                        "camera '{}' produced more than the {} expected frames; discarding surplus",
                        self.core.camera_id(),
                        self.expected
                    );
                    self.finished = true;
                    if let Err(e) = self.core.stop_sequence_acquisition().await {
                        log::error!("stopping overrunning sequence failed: {e:#}");
                    }
                    return Ok(None);
                }
                let frame = self.core.pop_next_image().await.map_err(device_err)?;
                let frame_index = self.yielded;
                let event_index = frame_index / self.n_channels;
                let channel_index = frame_index % self.n_channels;
                let payload = ImagePayload {
                    frame,
                    event: self.events[event_index].clone(),
                    event_index,
                    channel_index,
                    meta: FrameMeta {
                        camera_id: self.core.camera_id().to_string(),
                        event_t0_ms: self.t0 * 1000.0,
                        elapsed_ms: (self.clock.elapsed_secs() - self.t0) * 1000.0,
                        remaining_in_buffer: remaining - 1,
                    },
                };
                self.yielded += 1;
                if self.yielded == self.expected {
                    self.finished = true;
                }
                return Ok(Some(payload));
            }

            if !self.core.is_sequence_running().await.map_err(device_err)? {
                self.finished = true;
                if self.yielded < self.expected {
                    log::warn!(
                        "camera '{}' sequence ended short: {} of {} frames",
                        self.core.camera_id(),
                        self.yielded,
                        self.expected
                    );
                }
                return Ok(None);
            }

            tokio::time::sleep(DRAIN_BACKOFF).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(camera: SimulatedCamera, trigger: TriggerMode) -> AcquisitionEngine<SimulatedCamera> {
        AcquisitionEngine::new(Arc::new(camera), trigger, SessionClock::start())
    }

    #[tokio::test]
    async fn drain_tags_frames_in_cartesian_order() {
        let engine = engine(
            SimulatedCamera::new("meso").with_channels(2),
            TriggerMode::Untriggered,
        );
        let seq = SequencedEvent::uniform(2, 10.0);
        let mut drain = engine.exec_sequenced_event(seq).await.unwrap();

        let mut tags = Vec::new();
        while let Some(payload) = drain.next_frame().await.unwrap() {
            tags.push((payload.event_index, payload.channel_index));
            assert_eq!(payload.event.index, payload.event_index);
        }
        assert_eq!(tags, vec![(0, 0), (0, 1), (1, 0), (1, 1)]);
        assert_eq!(drain.yielded_frames(), 4);
    }

    #[tokio::test]
    async fn drain_is_exhausted_after_completion() {
        let engine = engine(SimulatedCamera::new("meso"), TriggerMode::Untriggered);
        let mut drain = engine
            .exec_sequenced_event(SequencedEvent::uniform(2, 10.0))
            .await
            .unwrap();
        while drain.next_frame().await.unwrap().is_some() {}
        assert!(drain.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_sequence_yields_nothing() {
        let engine = engine(SimulatedCamera::new("meso"), TriggerMode::Untriggered);
        let mut drain = engine
            .exec_sequenced_event(SequencedEvent::uniform(0, 10.0))
            .await
            .unwrap();
        assert!(drain.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn overflow_is_fatal_and_ends_the_drain() {
        let camera = SimulatedCamera::new("meso");
        camera.force_overflow();
        let engine = engine(camera, TriggerMode::Untriggered);
        let mut drain = engine
            .exec_sequenced_event(SequencedEvent::uniform(5, 10.0))
            .await
            .unwrap();

        let err = drain.next_frame().await.unwrap_err();
        assert!(err.is_fatal());
        match err {
            AcqError::BufferOverflow { camera, frames_yielded } => {
                assert_eq!(camera, "meso");
                assert_eq!(frames_yielded, 0);
            }
            other => panic!("expected BufferOverflow, got {other:?}"),
        }
        // Nothing further after the fatal error.
        assert!(drain.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn led_setup_programs_and_starts_the_pattern() {
        let camera = Arc::new(SimulatedCamera::new("meso"));
        let pattern = vec!["4".to_string(), "4".to_string(), "2".to_string(), "2".to_string()];
        let engine = AcquisitionEngine::new(
            Arc::clone(&camera),
            TriggerMode::LedPattern(pattern.clone()),
            SessionClock::start(),
        );
        let summary = engine
            .setup_sequence(&SequencedEvent::uniform(3, 10.0))
            .await
            .unwrap();
        assert_eq!(camera.loaded_pattern(), pattern);
        assert!(camera.trigger_running());
        assert_eq!(summary.expected_frames, 3);

        engine.teardown_sequence().await.unwrap();
        assert!(!camera.trigger_running());
    }

    #[tokio::test]
    async fn output_gate_pulses_the_daq_line() {
        use crate::hardware::daq::{DaqInterface, SimulatedDaq};
        let daq = Arc::new(SimulatedDaq::new());
        let engine = AcquisitionEngine::new(
            Arc::new(SimulatedCamera::new("pupil")),
            TriggerMode::DigitalLine { io: DigitalIo::Output },
            SessionClock::start(),
        )
        .with_daq(Arc::clone(&daq) as Arc<dyn DaqInterface>, Duration::from_millis(1));

        let mut drain = engine
            .exec_sequenced_event(SequencedEvent::uniform(1, 10.0))
            .await
            .unwrap();
        assert!(drain.next_frame().await.unwrap().is_some());
        // The gate pulse completed: exactly one edge on the counter.
        assert_eq!(daq.read_edge_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn input_gate_waits_for_the_line() {
        use crate::hardware::daq::{DaqInterface, SimulatedDaq};
        let daq = Arc::new(SimulatedDaq::new());
        daq.open_gate();
        let engine = AcquisitionEngine::new(
            Arc::new(SimulatedCamera::new("pupil")),
            TriggerMode::DigitalLine { io: DigitalIo::Input },
            SessionClock::start(),
        )
        .with_daq(Arc::clone(&daq) as Arc<dyn DaqInterface>, Duration::from_millis(1));

        let drain = engine
            .exec_sequenced_event(SequencedEvent::uniform(1, 10.0))
            .await
            .unwrap();
        assert_eq!(drain.expected_frames(), 1);
    }

    #[tokio::test]
    async fn gating_without_a_daq_is_an_error() {
        let engine = engine(
            SimulatedCamera::new("pupil"),
            TriggerMode::DigitalLine { io: DigitalIo::Output },
        );
        let err = engine
            .exec_sequenced_event(SequencedEvent::uniform(1, 10.0))
            .await
            .unwrap_err();
        assert!(matches!(err, AcqError::Device(_)));
    }
}

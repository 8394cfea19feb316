//! End-to-end session orchestration.
//!
//! A `Procedure` wires one configured session together: it builds the
//! encoder and DAQ producers against a shared clock and queue, registers
//! them with the streaming framework, drives the camera engine through
//! setup / drain / teardown while feeding frames to a `FrameSink`, and on
//! finish stops everything, flushes buffers to disk, and commits the
//! session's output paths to the session database.

use crate::config::ExperimentConfig;
use crate::core::{
    DataProducer, HardwareDevice, ImagePayload, SequencedEvent, SessionClock,
};
use crate::data::buffer::DEFAULT_BUFFER_SIZE;
use crate::data::database::{SessionDatabase, SessionRecord};
use crate::data::queue::{DataQueue, QueueLogger};
use crate::data::saver::DataSaver;
use crate::data::stream::StreamRegistry;
use crate::engine::{AcquisitionEngine, CameraCore, TriggerMode};
use crate::error::AcqResult;
use crate::hardware::daq::{DaqInterface, EdgeCounterWorker};
use crate::hardware::encoder::EncoderWorker;
use crate::paths::DataPaths;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Destination for acquired frames; stands in for the external image
/// writer.
pub trait FrameSink: Send {
    fn write_frame(&mut self, payload: &ImagePayload) -> AcqResult<()>;

    fn finalize(&mut self) -> AcqResult<()> {
        Ok(())
    }
}

/// Sink that records per-frame metadata rows to CSV, dropping the pixels.
pub struct FrameMetadataSink {
    writer: csv::Writer<std::fs::File>,
    frames: usize,
}

impl FrameMetadataSink {
    pub fn create(path: &std::path::Path) -> AcqResult<Self> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record([
            "camera_id",
            "event_index",
            "channel_index",
            "elapsed_ms",
            "remaining_in_buffer",
        ])?;
        Ok(Self { writer, frames: 0 })
    }

    pub fn frames_written(&self) -> usize {
        self.frames
    }
}

impl FrameSink for FrameMetadataSink {
    fn write_frame(&mut self, payload: &ImagePayload) -> AcqResult<()> {
        self.writer.write_record([
            payload.meta.camera_id.clone(),
            payload.event_index.to_string(),
            payload.channel_index.to_string(),
            payload.meta.elapsed_ms.to_string(),
            payload.meta.remaining_in_buffer.to_string(),
        ])?;
        self.frames += 1;
        Ok(())
    }

    fn finalize(&mut self) -> AcqResult<()> {
        self.writer.flush()?;
        Ok(())
    }
}

pub struct Procedure<C: CameraCore> {
    config: Arc<ExperimentConfig>,
    registry: StreamRegistry,
    queue: Arc<DataQueue>,
    encoder: Arc<EncoderWorker>,
    daq_worker: Arc<EdgeCounterWorker>,
    devices: Vec<Arc<dyn HardwareDevice>>,
    engine: AcquisitionEngine<C>,
    paths: DataPaths,
    saver: DataSaver,
    queue_logger: Option<QueueLogger>,
}

impl<C: CameraCore> Procedure<C> {
    pub fn new(
        config: Arc<ExperimentConfig>,
        camera: Arc<C>,
        trigger: TriggerMode,
        daq: Arc<dyn DaqInterface>,
    ) -> AcqResult<Self> {
        let clock = SessionClock::start();
        let queue = DataQueue::new();
        let encoder = Arc::new(EncoderWorker::new(
            config.settings.encoder.clone(),
            Arc::clone(&queue),
            clock.clone(),
        ));
        let daq_worker = Arc::new(EdgeCounterWorker::new(
            config.settings.daq.clone(),
            Arc::clone(&daq),
            Arc::clone(&queue),
            clock.clone(),
        ));
        let devices: Vec<Arc<dyn HardwareDevice>> = vec![
            Arc::clone(&encoder) as Arc<dyn HardwareDevice>,
            Arc::clone(&daq_worker) as Arc<dyn HardwareDevice>,
        ];
        let paths = DataPaths::build(&config, &devices)?;
        let pulse_width = Duration::from_millis(config.settings.daq.pulse_width_ms);
        let engine = AcquisitionEngine::new(camera, trigger, clock.clone())
            .with_daq(daq, pulse_width)
            .with_encoder(Arc::clone(&encoder))
            .with_saver(DataSaver::new(Arc::clone(&config), paths.clone()));
        let saver = DataSaver::new(Arc::clone(&config), paths.clone());

        Ok(Self {
            config,
            registry: StreamRegistry::with_clock(clock),
            queue,
            encoder,
            daq_worker,
            devices,
            engine,
            paths,
            saver,
            queue_logger: None,
        })
    }

    pub fn paths(&self) -> &DataPaths {
        &self.paths
    }

    pub fn registry(&self) -> &StreamRegistry {
        &self.registry
    }

    pub fn add_note(&self, note: &str) {
        self.config.add_note(note);
    }

    /// Register every producer with the streaming framework and run device
    /// init hooks.
    pub fn initialize(&mut self) -> AcqResult<()> {
        for device in &self.devices {
            device.initialize()?;
        }
        self.registry.register_producer(
            Arc::clone(&self.encoder) as Arc<dyn DataProducer>,
            DEFAULT_BUFFER_SIZE,
        );
        self.registry.register_producer(
            Arc::clone(&self.daq_worker) as Arc<dyn DataProducer>,
            DEFAULT_BUFFER_SIZE,
        );
        Ok(())
    }

    /// Run the full acquisition: start the queue logger and all streams,
    /// drive the camera through one sequenced acquisition, feed every frame
    /// to `sink`. Returns the number of frames delivered.
    pub async fn run(&mut self, sink: &mut dyn FrameSink) -> AcqResult<usize> {
        self.queue_logger = Some(QueueLogger::start(&self.queue, self.paths.queue_log.clone())?);
        if !self.registry.start_all() {
            log::warn!("not all data streams started");
        }

        let settings = &self.config.settings;
        let exposure_ms = 1000.0 / settings.frame_rate;
        let seq = SequencedEvent::uniform(settings.frames_for_duration(), exposure_ms);

        let summary = self.engine.setup_sequence(&seq).await?;
        log::info!(
            "sequence armed on '{}': {} frames expected",
            summary.camera_id,
            summary.expected_frames
        );

        let mut drain = self.engine.exec_sequenced_event(seq).await?;
        while let Some(payload) = drain.next_frame().await? {
            sink.write_frame(&payload)?;
        }
        self.engine.teardown_sequence().await?;
        sink.finalize()?;
        Ok(drain.yielded_frames())
    }

    /// Stop everything, flush buffers and outputs, and commit the session
    /// record.
    pub async fn finish(&mut self) -> AcqResult<()> {
        self.registry.stop_all().await;
        for device in &self.devices {
            if let Err(e) = device.shutdown() {
                log::error!("shutting down '{}' failed: {e}", device.device_id());
            }
        }
        if let Some(logger) = self.queue_logger.take() {
            logger.stop();
        }

        self.saver.save_notes()?;
        self.saver.save_timestamps(&self.devices)?;
        self.saver.save_device_data(&self.devices);
        self.registry
            .export_all_to_directory(&self.config.bids_dir().join("streams"))?;

        let db_path = PathBuf::from(&self.config.settings.save_dir).join("sessions.json");
        let mut database = SessionDatabase::open(db_path)?;
        database.update(SessionRecord {
            subject: self.config.settings.subject.clone(),
            session: self.config.settings.session.clone(),
            task: self.config.settings.task.clone(),
            paths: self.paths.as_rows(),
        })?;
        Ok(())
    }
}

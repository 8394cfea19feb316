//! Session output writer.
//!
//! `DataSaver` turns in-memory session state into the files named by
//! `DataPaths`: a flattened configuration snapshot, free-text notes, device
//! start/stop timestamps, and per-device data dumps. Individual device save
//! failures are logged and skipped so one bad device cannot lose the rest of
//! the session.

use crate::config::ExperimentConfig;
use crate::core::HardwareDevice;
use crate::error::AcqResult;
use crate::hardware::encoder::EncoderSample;
use crate::paths::DataPaths;
use std::io::Write;
use std::sync::Arc;

pub struct DataSaver {
    cfg: Arc<ExperimentConfig>,
    paths: DataPaths,
}

impl DataSaver {
    pub fn new(cfg: Arc<ExperimentConfig>, paths: DataPaths) -> Self {
        Self { cfg, paths }
    }

    pub fn paths(&self) -> &DataPaths {
        &self.paths
    }

    /// Flattened `Parameter,Value` snapshot of the full configuration.
    pub fn save_configuration(&self) -> AcqResult<()> {
        let mut writer = csv::Writer::from_path(&self.paths.configuration)?;
        writer.write_record(["Parameter", "Value"])?;
        for (key, value) in self.cfg.flattened()? {
            writer.write_record([key.as_str(), value.as_str()])?;
        }
        writer.flush()?;
        Ok(())
    }

    /// One note per line, already timestamped by `add_note`.
    pub fn save_notes(&self) -> AcqResult<()> {
        let notes = self.cfg.notes();
        let mut file = std::fs::File::create(&self.paths.notes)?;
        for note in &notes {
            writeln!(file, "{note}")?;
        }
        Ok(())
    }

    /// Dispatch each device's own `save_data` to its precomputed path.
    pub fn save_device_data(&self, devices: &[Arc<dyn HardwareDevice>]) {
        for device in devices {
            let Some(path) = self.paths.device(device.device_id()) else {
                log::warn!("no output path for device '{}'", device.device_id());
                continue;
            };
            if let Err(e) = device.save_data(path) {
                log::error!(
                    "saving data for device '{}' failed: {e}",
                    device.device_id()
                );
            }
        }
    }

    /// `device_id,started,stopped` rows; blank cell when a device never
    /// reached that state.
    pub fn save_timestamps(&self, devices: &[Arc<dyn HardwareDevice>]) -> AcqResult<()> {
        let mut writer = csv::Writer::from_path(&self.paths.timestamps)?;
        writer.write_record(["device_id", "started", "stopped"])?;
        for device in devices {
            let started = device
                .started_at()
                .map(|t| t.to_rfc3339())
                .unwrap_or_default();
            let stopped = device
                .stopped_at()
                .map(|t| t.to_rfc3339())
                .unwrap_or_default();
            writer.write_record([device.device_id(), &started, &stopped])?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Bulk encoder dump, `timestamp,clicks,speed` per sample.
    pub fn save_encoder_samples(&self, device_id: &str, samples: &[EncoderSample]) -> AcqResult<()> {
        let Some(path) = self.paths.device(device_id) else {
            log::warn!("no output path for encoder '{device_id}'; samples not saved");
            return Ok(());
        };
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(["timestamp", "clicks", "speed"])?;
        for sample in samples {
            writer.write_record([
                sample.timestamp.to_string(),
                sample.clicks.to_string(),
                sample.speed.to_string(),
            ])?;
        }
        writer.flush()?;
        Ok(())
    }
}

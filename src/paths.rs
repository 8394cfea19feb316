//! BIDS-scoped output path bookkeeping.
//!
//! `make_path` produces deterministic, collision-avoiding file paths under a
//! subject/session-scoped directory; `DataPaths` computes the full set of
//! output paths for one experiment instance exactly once, before any device
//! starts writing.

use crate::config::ExperimentConfig;
use crate::core::HardwareDevice;
use crate::error::AcqResult;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

impl ExperimentConfig {
    /// Root of the subject/session directory tree:
    /// `<save_dir>/data/<protocol>/sub-<subject>/ses-<session>`.
    pub fn bids_dir(&self) -> PathBuf {
        let s = &self.settings;
        PathBuf::from(&s.save_dir)
            .join("data")
            .join(&s.protocol)
            .join(format!("sub-{}", s.subject))
            .join(format!("ses-{}", s.session))
    }

    /// Build a unique output path
    /// `<bids_dir>[/<bids_type>]/<protocol>-sub-<subject>_ses-<session>_task-<task>_<suffix>.<extension>`,
    /// appending a counter if the file already exists. Creates the directory.
    pub fn make_path(
        &self,
        suffix: &str,
        extension: &str,
        bids_type: Option<&str>,
    ) -> AcqResult<PathBuf> {
        let mut dir = self.bids_dir();
        if let Some(sub) = bids_type {
            dir = dir.join(sub);
        }
        std::fs::create_dir_all(&dir)?;

        let s = &self.settings;
        let stem = format!(
            "{}-sub-{}_ses-{}_task-{}_{}",
            s.protocol, s.subject, s.session, s.task, suffix
        );
        let mut candidate = dir.join(format!("{stem}.{extension}"));
        let mut counter = 1;
        while candidate.exists() {
            candidate = dir.join(format!("{stem}_{counter}.{extension}"));
            counter += 1;
        }
        Ok(candidate)
    }
}

/// The full set of output file paths for one experiment instance, built once
/// at session start and immutable thereafter.
#[derive(Clone, Debug)]
pub struct DataPaths {
    pub configuration: PathBuf,
    pub notes: PathBuf,
    pub timestamps: PathBuf,
    pub queue_log: PathBuf,
    /// Primary output path per hardware device id.
    pub devices: BTreeMap<String, PathBuf>,
}

impl DataPaths {
    pub fn build(
        cfg: &ExperimentConfig,
        devices: &[Arc<dyn HardwareDevice>],
    ) -> AcqResult<Self> {
        let mut device_paths = BTreeMap::new();
        for device in devices {
            let path = cfg.make_path(
                device.device_id(),
                device.file_extension(),
                device.bids_type(),
            )?;
            device_paths.insert(device.device_id().to_string(), path);
        }
        Ok(Self {
            configuration: cfg.make_path("configuration", "csv", None)?,
            notes: cfg.make_path("notes", "txt", None)?,
            timestamps: cfg.make_path("timestamps", "csv", None)?,
            queue_log: cfg.make_path("dataqueue", "csv", Some("beh"))?,
            devices: device_paths,
        })
    }

    pub fn device(&self, device_id: &str) -> Option<&PathBuf> {
        self.devices.get(device_id)
    }

    /// All paths as (label, path) rows for the session database.
    pub fn as_rows(&self) -> BTreeMap<String, PathBuf> {
        let mut rows = BTreeMap::new();
        rows.insert("configuration".to_string(), self.configuration.clone());
        rows.insert("notes".to_string(), self.notes.clone());
        rows.insert("timestamps".to_string(), self.timestamps.clone());
        rows.insert("queue_log".to_string(), self.queue_log.clone());
        for (id, path) in &self.devices {
            rows.insert(format!("device/{id}"), path.clone());
        }
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    fn config(save_dir: &str) -> ExperimentConfig {
        let mut settings = Settings {
            subject: "001".to_string(),
            session: "01".to_string(),
            task: "wheel".to_string(),
            protocol: "meso".to_string(),
            save_dir: save_dir.to_string(),
            duration_secs: 1,
            frame_rate: 30.0,
            led_pattern: vec![],
            encoder: Default::default(),
            daq: Default::default(),
        };
        settings.led_pattern = vec!["4".to_string()];
        ExperimentConfig::new(settings).unwrap()
    }

    #[test]
    fn make_path_is_bids_scoped() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path().to_str().unwrap());
        let path = cfg.make_path("encoder-data", "csv", Some("beh")).unwrap();
        let s = path.to_string_lossy();
        assert!(s.contains("sub-001"));
        assert!(s.contains("ses-01"));
        assert!(s.ends_with("meso-sub-001_ses-01_task-wheel_encoder-data.csv"));
        assert!(path.parent().unwrap().ends_with("beh"));
    }

    #[test]
    fn make_path_avoids_collisions() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path().to_str().unwrap());
        let first = cfg.make_path("notes", "txt", None).unwrap();
        std::fs::write(&first, "x").unwrap();
        let second = cfg.make_path("notes", "txt", None).unwrap();
        assert_ne!(first, second);
        assert!(second.to_string_lossy().ends_with("_notes_1.txt"));
    }
}

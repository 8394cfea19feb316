//! Experiment configuration management.
//!
//! Settings are loaded through the `config` crate from a TOML or JSON file
//! and deserialized into plain serde structs. Parse failures surface as
//! `AcqError::Config`; values that parse but are logically wrong (an empty
//! subject, a zero encoder resolution) are caught by `validate` and surface
//! as `AcqError::Configuration`.

use crate::error::{AcqError, AcqResult};
use config::Config;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    pub subject: String,
    pub session: String,
    pub task: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub save_dir: String,
    #[serde(default = "default_duration")]
    pub duration_secs: u64,
    #[serde(default = "default_frame_rate")]
    pub frame_rate: f64,
    #[serde(default = "default_led_pattern")]
    pub led_pattern: Vec<String>,
    #[serde(default)]
    pub encoder: EncoderSettings,
    #[serde(default)]
    pub daq: DaqSettings,
}

fn default_protocol() -> String {
    "protocol".to_string()
}

fn default_duration() -> u64 {
    60
}

fn default_frame_rate() -> f64 {
    30.0
}

fn default_led_pattern() -> Vec<String> {
    ["4", "4", "2", "2"].map(String::from).to_vec()
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct EncoderSettings {
    pub port: String,
    pub baud_rate: u32,
    pub sample_interval_ms: u64,
    pub wheel_diameter_mm: f64,
    /// Encoder counts per wheel revolution.
    pub cpr: u32,
    /// Development mode: generate pseudo-random ticks instead of reading
    /// the serial port.
    pub simulated: bool,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            port: "COM4".to_string(),
            baud_rate: 57_600,
            sample_interval_ms: 20,
            wheel_diameter_mm: 80.0,
            cpr: 2400,
            simulated: true,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct DaqSettings {
    pub device_name: String,
    /// Digital output lines used as the external camera trigger.
    pub lines: String,
    /// Edge counter channel.
    pub counter: String,
    /// "DO" pulses the trigger line before arming; "DI" waits on the gate.
    pub io_type: String,
    pub pulse_width_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for DaqSettings {
    fn default() -> Self {
        Self {
            device_name: "Dev1".to_string(),
            lines: "port0/line0".to_string(),
            counter: "ctr0".to_string(),
            io_type: "DO".to_string(),
            pulse_width_ms: 1,
            poll_interval_ms: 10,
        }
    }
}

impl Settings {
    /// Load settings from a TOML or JSON file (extension resolved by the
    /// `config` crate).
    pub fn from_file(path: &str) -> AcqResult<Self> {
        let s = Config::builder()
            .add_source(config::File::with_name(path))
            .build()
            .map_err(AcqError::Config)?;
        let settings: Settings = s.try_deserialize().map_err(AcqError::Config)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> AcqResult<()> {
        if self.subject.is_empty() || self.session.is_empty() || self.task.is_empty() {
            return Err(AcqError::Configuration(
                "subject, session, and task must be non-empty".to_string(),
            ));
        }
        if self.encoder.cpr == 0 {
            return Err(AcqError::Configuration(
                "encoder cpr must be positive".to_string(),
            ));
        }
        if self.encoder.wheel_diameter_mm <= 0.0 {
            return Err(AcqError::Configuration(
                "encoder wheel_diameter_mm must be positive".to_string(),
            ));
        }
        if self.encoder.sample_interval_ms == 0 {
            return Err(AcqError::Configuration(
                "encoder sample_interval_ms must be positive".to_string(),
            ));
        }
        if self.frame_rate <= 0.0 {
            return Err(AcqError::Configuration(
                "frame_rate must be positive".to_string(),
            ));
        }
        match self.daq.io_type.as_str() {
            "DO" | "DI" => Ok(()),
            other => Err(AcqError::Configuration(format!(
                "daq io_type must be \"DO\" or \"DI\", got \"{other}\""
            ))),
        }
    }

    /// Frames a camera should capture for the configured duration.
    pub fn frames_for_duration(&self) -> usize {
        (self.frame_rate * self.duration_secs as f64).round() as usize
    }
}

/// Validated settings plus the mutable session state that accumulates while
/// an experiment runs (free-text notes).
#[derive(Debug)]
pub struct ExperimentConfig {
    pub settings: Settings,
    notes: Mutex<Vec<String>>,
}

impl ExperimentConfig {
    pub fn new(settings: Settings) -> AcqResult<Self> {
        settings.validate()?;
        Ok(Self {
            settings,
            notes: Mutex::new(Vec::new()),
        })
    }

    pub fn from_file(path: &str) -> AcqResult<Self> {
        Self::new(Settings::from_file(path)?)
    }

    /// Append a timestamped free-text note.
    pub fn add_note(&self, note: &str) {
        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        if let Ok(mut notes) = self.notes.lock() {
            notes.push(format!("{stamp}: {note}"));
        }
    }

    pub fn notes(&self) -> Vec<String> {
        self.notes.lock().map(|n| n.clone()).unwrap_or_default()
    }

    /// Flatten the settings into (parameter, value) rows for the
    /// configuration snapshot CSV.
    pub fn flattened(&self) -> AcqResult<Vec<(String, String)>> {
        let value = serde_json::to_value(&self.settings)?;
        let mut rows = Vec::new();
        flatten_value("", &value, &mut rows);
        Ok(rows)
    }
}

fn flatten_value(prefix: &str, value: &serde_json::Value, rows: &mut Vec<(String, String)>) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_value(&path, child, rows);
            }
        }
        serde_json::Value::Array(items) => {
            let joined = items
                .iter()
                .map(|v| match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(",");
            rows.push((prefix.to_string(), joined));
        }
        serde_json::Value::String(s) => rows.push((prefix.to_string(), s.clone())),
        other => rows.push((prefix.to_string(), other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        Settings {
            subject: "001".to_string(),
            session: "01".to_string(),
            task: "widefield".to_string(),
            protocol: default_protocol(),
            save_dir: "/tmp/mesodaq".to_string(),
            duration_secs: 60,
            frame_rate: 30.0,
            led_pattern: default_led_pattern(),
            encoder: EncoderSettings::default(),
            daq: DaqSettings::default(),
        }
    }

    #[test]
    fn valid_settings_pass_validation() {
        assert!(settings().validate().is_ok());
    }

    #[test]
    fn empty_subject_is_rejected() {
        let mut s = settings();
        s.subject.clear();
        assert!(matches!(s.validate(), Err(AcqError::Configuration(_))));
    }

    #[test]
    fn zero_cpr_is_rejected() {
        let mut s = settings();
        s.encoder.cpr = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn bad_io_type_is_rejected() {
        let mut s = settings();
        s.daq.io_type = "AO".to_string();
        assert!(s.validate().is_err());
    }

    #[test]
    fn frames_for_duration_rounds() {
        let mut s = settings();
        s.duration_secs = 2;
        s.frame_rate = 30.0;
        assert_eq!(s.frames_for_duration(), 60);
    }

    #[test]
    fn flattened_includes_nested_sections() {
        let cfg = ExperimentConfig::new(settings()).unwrap();
        let rows = cfg.flattened().unwrap();
        assert!(rows.iter().any(|(k, v)| k == "subject" && v == "001"));
        assert!(rows.iter().any(|(k, _)| k == "encoder.cpr"));
        assert!(rows.iter().any(|(k, v)| k == "led_pattern" && v == "4,4,2,2"));
    }

    #[test]
    fn notes_are_timestamped_in_order() {
        let cfg = ExperimentConfig::new(settings()).unwrap();
        cfg.add_note("first");
        cfg.add_note("second");
        let notes = cfg.notes();
        assert_eq!(notes.len(), 2);
        assert!(notes[0].ends_with("first"));
        assert!(notes[1].ends_with("second"));
    }
}

//! Rotary wheel encoder producer.
//!
//! An `EncoderWorker` owns one polling thread that reads tick deltas either
//! from a serial-attached microcontroller (one integer per line) or from a
//! pseudo-random simulator, converts them to linear speed from the wheel
//! geometry, and publishes each sample three ways: a "latest reading" slot
//! for the streaming framework, an in-memory sample log for the bulk CSV
//! dump, and raw/derived packets on the shared `DataQueue`.

use crate::config::EncoderSettings;
use crate::core::{DataProducer, HardwareDevice, Reading, SessionClock};
use crate::data::queue::{DataPacket, DataQueue};
use crate::error::{AcqError, AcqResult};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// One encoder observation in session-clock time.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EncoderSample {
    pub timestamp: f64,
    pub clicks: i64,
    /// Linear wheel-surface speed in metres per second.
    pub speed: f64,
}

pub struct EncoderWorker {
    settings: EncoderSettings,
    queue: Arc<DataQueue>,
    clock: SessionClock,
    stop: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
    latest: Arc<Mutex<Option<Reading>>>,
    samples: Arc<Mutex<Vec<EncoderSample>>>,
    started_at: Mutex<Option<DateTime<Utc>>>,
    stopped_at: Mutex<Option<DateTime<Utc>>>,
}

/// Linear speed from a tick delta over one sample interval.
fn speed_from_ticks(ticks: i64, settings: &EncoderSettings) -> f64 {
    let revolutions = ticks as f64 / settings.cpr as f64;
    let circumference_m = std::f64::consts::PI * settings.wheel_diameter_mm / 1000.0;
    let interval_secs = settings.sample_interval_ms as f64 / 1000.0;
    revolutions * circumference_m / interval_secs
}

impl EncoderWorker {
    pub fn new(settings: EncoderSettings, queue: Arc<DataQueue>, clock: SessionClock) -> Self {
        Self {
            settings,
            queue,
            clock,
            stop: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
            latest: Arc::new(Mutex::new(None)),
            samples: Arc::new(Mutex::new(Vec::new())),
            started_at: Mutex::new(None),
            stopped_at: Mutex::new(None),
        }
    }

    /// Samples accumulated so far, in arrival order.
    pub fn samples(&self) -> Vec<EncoderSample> {
        self.samples.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn spawn(&self) -> AcqResult<()> {
        {
            let handle = self.handle.lock().ok();
            if handle.as_ref().is_some_and(|h| h.is_some()) {
                return Ok(());
            }
        }
        self.stop.store(false, Ordering::Relaxed);
        let ctx = WorkerCtx {
            settings: self.settings.clone(),
            queue: Arc::clone(&self.queue),
            clock: self.clock.clone(),
            stop: Arc::clone(&self.stop),
            latest: Arc::clone(&self.latest),
            samples: Arc::clone(&self.samples),
        };
        let handle = if self.settings.simulated {
            std::thread::spawn(move || ctx.run_simulated())
        } else {
            self.spawn_serial(ctx)?
        };
        if let Ok(mut slot) = self.handle.lock() {
            *slot = Some(handle);
        }
        if let Ok(mut started) = self.started_at.lock() {
            started.get_or_insert_with(Utc::now);
        }
        Ok(())
    }

    #[cfg(feature = "instrument_serial")]
    fn spawn_serial(&self, ctx: WorkerCtx) -> AcqResult<JoinHandle<()>> {
        let port = serialport::new(&self.settings.port, self.settings.baud_rate)
            .timeout(Duration::from_millis(self.settings.sample_interval_ms.max(1) * 5))
            .open()
            .map_err(|e| {
                log::error!("opening encoder port '{}' failed: {e}", self.settings.port);
                AcqError::SerialPortNotConnected
            })?;
        Ok(std::thread::spawn(move || ctx.run_serial(port)))
    }

    #[cfg(not(feature = "instrument_serial"))]
    fn spawn_serial(&self, _ctx: WorkerCtx) -> AcqResult<JoinHandle<()>> {
        Err(AcqError::SerialFeatureDisabled)
    }

    fn halt(&self) -> AcqResult<()> {
        self.stop.store(true, Ordering::Relaxed);
        let handle = self.handle.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("encoder thread panicked");
            }
        }
        if let Ok(mut stopped) = self.stopped_at.lock() {
            stopped.get_or_insert_with(Utc::now);
        }
        Ok(())
    }
}

struct WorkerCtx {
    settings: EncoderSettings,
    queue: Arc<DataQueue>,
    clock: SessionClock,
    stop: Arc<AtomicBool>,
    latest: Arc<Mutex<Option<Reading>>>,
    samples: Arc<Mutex<Vec<EncoderSample>>>,
}

impl WorkerCtx {
    fn record(&self, ticks: i64) {
        let timestamp = self.clock.elapsed_secs();
        let speed = speed_from_ticks(ticks, &self.settings);
        if let Ok(mut latest) = self.latest.lock() {
            *latest = Some(Reading::Ticks(ticks));
        }
        if let Ok(mut samples) = self.samples.lock() {
            samples.push(EncoderSample {
                timestamp,
                clicks: ticks,
                speed,
            });
        }
        self.queue.push(DataPacket::with_device_ts(
            "encoder",
            timestamp,
            ticks.to_string(),
        ));
        self.queue.push(DataPacket::with_device_ts(
            "encoder",
            timestamp,
            format!("speed={speed:.6}"),
        ));
    }

    fn run_simulated(self) {
        let mut rng = rand::thread_rng();
        let interval = Duration::from_millis(self.settings.sample_interval_ms);
        while !self.stop.load(Ordering::Relaxed) {
            std::thread::sleep(interval);
            self.record(rng.gen_range(1..=10));
        }
        log::debug!("simulated encoder loop exited");
    }

    /// Line-level protocol: one integer tick delta per line. Malformed
    /// lines are skipped and logged; EOF or a non-timeout read error ends
    /// the loop cleanly.
    fn run_lines<R: std::io::BufRead>(&self, reader: &mut R) {
        let mut line = String::new();
        while !self.stop.load(Ordering::Relaxed) {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => match line.trim().parse::<i64>() {
                    Ok(ticks) => self.record(ticks),
                    Err(_) => {
                        log::warn!("malformed encoder line skipped: {:?}", line.trim());
                    }
                },
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                Err(e) => {
                    log::error!("encoder serial read failed, stopping: {e}");
                    break;
                }
            }
        }
    }

    #[cfg(feature = "instrument_serial")]
    fn run_serial(self, port: Box<dyn serialport::SerialPort>) {
        let mut reader = std::io::BufReader::new(port);
        self.run_lines(&mut reader);
        // Port closes when the reader drops.
        log::debug!("serial encoder loop exited");
    }
}

impl DataProducer for EncoderWorker {
    fn name(&self) -> &str {
        "encoder"
    }

    fn producer_type(&self) -> &str {
        "encoder"
    }

    fn start(&self) -> AcqResult<()> {
        self.spawn()
    }

    fn stop(&self) -> AcqResult<()> {
        self.halt()
    }

    /// Latest-sample slot: a reading is handed out once, then the slot is
    /// empty until the next poll fills it.
    fn get_data(&self) -> Option<Reading> {
        self.latest.lock().ok()?.take()
    }

    fn metadata(&self) -> std::collections::BTreeMap<String, String> {
        let mut meta = std::collections::BTreeMap::new();
        meta.insert("port".to_string(), self.settings.port.clone());
        meta.insert(
            "sample_interval_ms".to_string(),
            self.settings.sample_interval_ms.to_string(),
        );
        meta.insert("simulated".to_string(), self.settings.simulated.to_string());
        meta
    }
}

impl HardwareDevice for EncoderWorker {
    fn device_id(&self) -> &str {
        "encoder"
    }

    fn device_type(&self) -> &str {
        "encoder"
    }

    fn start(&self) -> AcqResult<()> {
        self.spawn()
    }

    fn stop(&self) -> AcqResult<()> {
        self.halt()
    }

    fn shutdown(&self) -> AcqResult<()> {
        self.halt()
    }

    fn save_data(&self, path: &Path) -> AcqResult<()> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(["timestamp", "clicks", "speed"])?;
        for sample in self.samples() {
            writer.write_record([
                sample.timestamp.to_string(),
                sample.clicks.to_string(),
                sample.speed.to_string(),
            ])?;
        }
        writer.flush()?;
        Ok(())
    }

    fn bids_type(&self) -> Option<&str> {
        Some("beh")
    }

    fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at.lock().ok().and_then(|t| *t)
    }

    fn stopped_at(&self) -> Option<DateTime<Utc>> {
        self.stopped_at.lock().ok().and_then(|t| *t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_settings() -> EncoderSettings {
        EncoderSettings {
            sample_interval_ms: 5,
            simulated: true,
            ..Default::default()
        }
    }

    #[test]
    fn speed_scales_with_ticks() {
        let settings = EncoderSettings {
            cpr: 2400,
            wheel_diameter_mm: 80.0,
            sample_interval_ms: 20,
            ..Default::default()
        };
        let one = speed_from_ticks(1, &settings);
        let ten = speed_from_ticks(10, &settings);
        assert!(one > 0.0);
        assert!((ten - one * 10.0).abs() < 1e-12);
        // Full revolution in one interval: circumference / interval.
        let full = speed_from_ticks(2400, &settings);
        assert!((full - std::f64::consts::PI * 0.08 / 0.02).abs() < 1e-9);
    }

    #[test]
    fn simulated_worker_accumulates_samples_and_packets() {
        let queue = DataQueue::new();
        let receiver = queue.take_receiver().unwrap();
        let worker = EncoderWorker::new(fast_settings(), Arc::clone(&queue), SessionClock::start());

        DataProducer::start(&worker).unwrap();
        std::thread::sleep(Duration::from_millis(60));
        DataProducer::stop(&worker).unwrap();

        let samples = worker.samples();
        assert!(!samples.is_empty());
        assert!(samples.iter().all(|s| (1..=10).contains(&s.clicks)));
        for pair in samples.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }

        // Raw tick and derived speed packet per sample.
        let packets: Vec<DataPacket> = receiver.try_iter().collect();
        assert_eq!(packets.len(), samples.len() * 2);
        assert!(packets.iter().all(|p| p.device_id == "encoder"));
        assert!(packets.iter().any(|p| p.payload.starts_with("speed=")));
    }

    #[test]
    fn latest_reading_is_taken_once() {
        let queue = DataQueue::new();
        let worker = EncoderWorker::new(fast_settings(), queue, SessionClock::start());
        DataProducer::start(&worker).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        DataProducer::stop(&worker).unwrap();

        assert!(worker.get_data().is_some());
        assert!(worker.get_data().is_none());
    }

    fn line_ctx(queue: Arc<DataQueue>) -> WorkerCtx {
        WorkerCtx {
            settings: fast_settings(),
            queue,
            clock: SessionClock::start(),
            stop: Arc::new(AtomicBool::new(false)),
            latest: Arc::new(Mutex::new(None)),
            samples: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn recorded_clicks(ctx: &WorkerCtx) -> Vec<i64> {
        ctx.samples
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.clicks)
            .collect()
    }

    struct BrokenPipe;

    impl std::io::Read for BrokenPipe {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "device unplugged",
            ))
        }
    }

    #[test]
    fn malformed_lines_are_skipped_valid_ones_recorded() {
        let queue = DataQueue::new();
        let ctx = line_ctx(queue);
        let mut reader = std::io::Cursor::new(b"5\ngarbage\n\n7\n12.5\n-3\n".to_vec());
        ctx.run_lines(&mut reader);
        assert_eq!(recorded_clicks(&ctx), vec![5, 7, -3]);
    }

    #[test]
    fn read_error_ends_the_loop_after_the_valid_prefix() {
        use std::io::Read;
        let queue = DataQueue::new();
        let ctx = line_ctx(queue);
        let mut reader =
            std::io::BufReader::new(std::io::Cursor::new(b"3\n".to_vec()).chain(BrokenPipe));
        ctx.run_lines(&mut reader);
        assert_eq!(recorded_clicks(&ctx), vec![3]);
    }

    #[test]
    fn device_timestamps_bracket_the_run() {
        let queue = DataQueue::new();
        let worker = EncoderWorker::new(fast_settings(), queue, SessionClock::start());
        assert!(worker.started_at().is_none());
        HardwareDevice::start(&worker).unwrap();
        std::thread::sleep(Duration::from_millis(10));
        HardwareDevice::stop(&worker).unwrap();
        let started = worker.started_at().unwrap();
        let stopped = worker.stopped_at().unwrap();
        assert!(started <= stopped);
    }
}

//! DAQ digital I/O and edge counting.
//!
//! `DaqInterface` is the consumed contract for the digital acquisition board
//! (trigger line writes, gate reads, a monotone hardware edge counter).
//! `EdgeCounterWorker` owns one polling thread that pulses the trigger line
//! and timestamps counter edges: each newly observed edge is assigned the
//! host timestamp read at the top of the poll in which it appeared. That is
//! a deliberate approximation (edges arriving between polls share one
//! timestamp) and downstream analysis relies on it staying exactly this
//! way.

use crate::config::DaqSettings;
use crate::core::{DataProducer, HardwareDevice, Reading, SessionClock};
use crate::data::queue::{DataPacket, DataQueue};
use crate::error::AcqResult;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Digital I/O capability of the acquisition board.
///
/// Errors are anyhow-typed at this seam; callers decide what is fatal.
pub trait DaqInterface: Send + Sync {
    /// Drive the trigger output line high or low.
    fn write_line(&self, high: bool) -> anyhow::Result<()>;

    /// Read the gate input line.
    fn read_line(&self) -> anyhow::Result<bool>;

    /// Current value of the monotone hardware edge counter.
    fn read_edge_count(&self) -> anyhow::Result<u64>;

    /// Return the board to an idle state (line low, tasks released).
    fn reset(&self) -> anyhow::Result<()>;
}

#[derive(Default)]
struct SimState {
    line_high: bool,
    gate_high: bool,
    edges: u64,
}

/// Development-mode board: completing a pulse (high then low) registers
/// `edges_per_pulse` counter edges.
pub struct SimulatedDaq {
    state: Mutex<SimState>,
    edges_per_pulse: u64,
}

impl SimulatedDaq {
    pub fn new() -> Self {
        Self::with_edges_per_pulse(1)
    }

    pub fn with_edges_per_pulse(edges_per_pulse: u64) -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            edges_per_pulse,
        }
    }

    /// Raise the gate input, as an external trigger source would.
    pub fn open_gate(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.gate_high = true;
        }
    }
}

impl Default for SimulatedDaq {
    fn default() -> Self {
        Self::new()
    }
}

impl DaqInterface for SimulatedDaq {
    fn write_line(&self, high: bool) -> anyhow::Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow::anyhow!("simulated daq state poisoned"))?;
        if state.line_high && !high {
            state.edges += self.edges_per_pulse;
        }
        state.line_high = high;
        Ok(())
    }

    fn read_line(&self) -> anyhow::Result<bool> {
        let state = self
            .state
            .lock()
            .map_err(|_| anyhow::anyhow!("simulated daq state poisoned"))?;
        Ok(state.gate_high)
    }

    fn read_edge_count(&self) -> anyhow::Result<u64> {
        let state = self
            .state
            .lock()
            .map_err(|_| anyhow::anyhow!("simulated daq state poisoned"))?;
        Ok(state.edges)
    }

    fn reset(&self) -> anyhow::Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow::anyhow!("simulated daq state poisoned"))?;
        state.line_high = false;
        state.gate_high = false;
        Ok(())
    }
}

/// Polling thread that pulses the trigger line and timestamps counter edges.
pub struct EdgeCounterWorker {
    settings: DaqSettings,
    daq: Arc<dyn DaqInterface>,
    queue: Arc<DataQueue>,
    clock: SessionClock,
    stop: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
    latest: Arc<Mutex<Option<Reading>>>,
    edge_times: Arc<Mutex<Vec<f64>>>,
    started_at: Mutex<Option<DateTime<Utc>>>,
    stopped_at: Mutex<Option<DateTime<Utc>>>,
}

impl EdgeCounterWorker {
    pub fn new(
        settings: DaqSettings,
        daq: Arc<dyn DaqInterface>,
        queue: Arc<DataQueue>,
        clock: SessionClock,
    ) -> Self {
        Self {
            settings,
            daq,
            queue,
            clock,
            stop: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
            latest: Arc::new(Mutex::new(None)),
            edge_times: Arc::new(Mutex::new(Vec::new())),
            started_at: Mutex::new(None),
            stopped_at: Mutex::new(None),
        }
    }

    /// All edge timestamps recorded so far, in observation order.
    pub fn edge_times(&self) -> Vec<f64> {
        self.edge_times.lock().map(|t| t.clone()).unwrap_or_default()
    }

    fn spawn(&self) -> AcqResult<()> {
        {
            let handle = self.handle.lock().ok();
            if handle.as_ref().is_some_and(|h| h.is_some()) {
                return Ok(());
            }
        }
        self.stop.store(false, Ordering::Relaxed);
        let daq = Arc::clone(&self.daq);
        let queue = Arc::clone(&self.queue);
        let clock = self.clock.clone();
        let stop = Arc::clone(&self.stop);
        let latest = Arc::clone(&self.latest);
        let edge_times = Arc::clone(&self.edge_times);
        let pulse_width = Duration::from_millis(self.settings.pulse_width_ms);
        let poll_interval = Duration::from_millis(self.settings.poll_interval_ms);

        let handle = std::thread::spawn(move || {
            let mut last_count = match daq.read_edge_count() {
                Ok(count) => count,
                Err(e) => {
                    log::error!("daq initial counter read failed: {e}");
                    return;
                }
            };
            while !stop.load(Ordering::Relaxed) {
                let ts = clock.elapsed_secs();
                let pulsed = daq
                    .write_line(true)
                    .and_then(|()| {
                        std::thread::sleep(pulse_width);
                        daq.write_line(false)
                    })
                    .and_then(|()| daq.read_edge_count());
                let count = match pulsed {
                    Ok(count) => count,
                    Err(e) => {
                        log::error!("daq poll failed, stopping edge counter: {e}");
                        break;
                    }
                };
                if count > last_count {
                    let new_edges = (count - last_count) as usize;
                    let times = vec![ts; new_edges];
                    if let Ok(mut slot) = latest.lock() {
                        *slot = Some(Reading::EdgeTimes(times.clone()));
                    }
                    if let Ok(mut all) = edge_times.lock() {
                        all.extend_from_slice(&times);
                    }
                    queue.push(DataPacket::with_device_ts(
                        "daq",
                        ts,
                        format!("edges={new_edges}"),
                    ));
                    last_count = count;
                }
                std::thread::sleep(poll_interval);
            }
            if let Err(e) = daq.reset() {
                log::error!("daq reset failed: {e}");
            }
            log::debug!("edge counter loop exited");
        });

        if let Ok(mut slot) = self.handle.lock() {
            *slot = Some(handle);
        }
        if let Ok(mut started) = self.started_at.lock() {
            started.get_or_insert_with(Utc::now);
        }
        Ok(())
    }

    fn halt(&self) -> AcqResult<()> {
        self.stop.store(true, Ordering::Relaxed);
        let handle = self.handle.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("edge counter thread panicked");
            }
        }
        if let Ok(mut stopped) = self.stopped_at.lock() {
            stopped.get_or_insert_with(Utc::now);
        }
        Ok(())
    }
}

impl DataProducer for EdgeCounterWorker {
    fn name(&self) -> &str {
        "daq"
    }

    fn producer_type(&self) -> &str {
        "daq"
    }

    fn start(&self) -> AcqResult<()> {
        self.spawn()
    }

    fn stop(&self) -> AcqResult<()> {
        self.halt()
    }

    fn get_data(&self) -> Option<Reading> {
        self.latest.lock().ok()?.take()
    }

    fn metadata(&self) -> std::collections::BTreeMap<String, String> {
        let mut meta = std::collections::BTreeMap::new();
        meta.insert("device_name".to_string(), self.settings.device_name.clone());
        meta.insert("counter".to_string(), self.settings.counter.clone());
        meta
    }
}

impl HardwareDevice for EdgeCounterWorker {
    fn device_id(&self) -> &str {
        "daq"
    }

    fn device_type(&self) -> &str {
        "daq"
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
        writer.write_record(["edge_time"])?;
        for time in self.edge_times() {
            writer.write_record([time.to_string()])?;
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

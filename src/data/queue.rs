//! Shared device event queue and its CSV logger.
//!
//! Devices push small timestamped packets (raw ticks, derived speeds, DAQ
//! edge batches) into one unbounded `DataQueue`; a single `QueueLogger`
//! thread drains it to a CSV file for the lifetime of the session. The queue
//! is multi-producer, single-reader: taking the receiver claims the reader
//! role.

use crate::error::{AcqError, AcqResult};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// One device event: who sent it, when, and an opaque payload string.
#[derive(Clone, Debug, PartialEq)]
pub struct DataPacket {
    pub device_id: String,
    /// Wall-clock seconds since the Unix epoch, stamped at push time.
    pub timestamp: f64,
    /// Device-local timestamp, when the device has one (DAQ edge times).
    pub device_ts: Option<f64>,
    pub payload: String,
}

impl DataPacket {
    pub fn new(device_id: &str, payload: impl Into<String>) -> Self {
        Self {
            device_id: device_id.to_string(),
            timestamp: epoch_secs(),
            device_ts: None,
            payload: payload.into(),
        }
    }

    pub fn with_device_ts(device_id: &str, device_ts: f64, payload: impl Into<String>) -> Self {
        Self {
            device_ts: Some(device_ts),
            ..Self::new(device_id, payload)
        }
    }
}

fn epoch_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Unbounded multi-producer, single-reader packet queue.
pub struct DataQueue {
    sender: Sender<DataPacket>,
    receiver: Mutex<Option<Receiver<DataPacket>>>,
}

impl DataQueue {
    pub fn new() -> Arc<Self> {
        let (sender, receiver) = mpsc::channel();
        Arc::new(Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
        })
    }

    /// Push never blocks; a push after the reader has shut down is dropped.
    pub fn push(&self, packet: DataPacket) {
        if self.sender.send(packet).is_err() {
            log::debug!("queue reader gone; packet dropped");
        }
    }

    /// Claim the single reader end. Fails on the second call.
    pub fn take_receiver(&self) -> AcqResult<Receiver<DataPacket>> {
        self.receiver
            .lock()
            .ok()
            .and_then(|mut r| r.take())
            .ok_or_else(|| AcqError::Processing("queue receiver already taken".to_string()))
    }
}

/// Background thread draining the queue to a CSV file.
///
/// Header: `queue_elapsed, packet_ts, device_ts, device_id, payload`.
/// `queue_elapsed` is seconds since the logger started; `device_ts` is empty
/// when the device did not supply one.
pub struct QueueLogger {
    stop: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
    path: PathBuf,
}

impl QueueLogger {
    /// Spawn the writer thread. The CSV file and its header are written
    /// before this returns.
    pub fn start(queue: &Arc<DataQueue>, path: PathBuf) -> AcqResult<Self> {
        let receiver = queue.take_receiver()?;
        let mut writer = csv::Writer::from_path(&path)?;
        writer.write_record(["queue_elapsed", "packet_ts", "device_ts", "device_id", "payload"])?;
        writer.flush()?;

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let log_path = path.clone();
        let handle = std::thread::spawn(move || {
            let started = Instant::now();
            loop {
                match receiver.recv_timeout(Duration::from_millis(100)) {
                    Ok(packet) => {
                        if let Err(e) = write_packet(&mut writer, started, &packet) {
                            log::error!("queue log write failed ({}): {e}", log_path.display());
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        if stop_flag.load(Ordering::Relaxed) {
                            break;
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            // Drain whatever arrived before the stop flag was seen.
            while let Ok(packet) = receiver.try_recv() {
                if let Err(e) = write_packet(&mut writer, started, &packet) {
                    log::error!("queue log write failed ({}): {e}", log_path.display());
                }
            }
            if let Err(e) = writer.flush() {
                log::error!("queue log flush failed ({}): {e}", log_path.display());
            }
        });

        Ok(Self {
            stop,
            handle: Mutex::new(Some(handle)),
            path,
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Signal the writer thread and join it. Remaining packets are drained
    /// before the file is flushed.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        let handle = self.handle.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("queue logger thread panicked");
            }
        }
    }
}

fn write_packet(
    writer: &mut csv::Writer<std::fs::File>,
    started: Instant,
    packet: &DataPacket,
) -> AcqResult<()> {
    let device_ts = packet
        .device_ts
        .map(|t| t.to_string())
        .unwrap_or_default();
    writer.write_record([
        started.elapsed().as_secs_f64().to_string(),
        packet.timestamp.to_string(),
        device_ts,
        packet.device_id.clone(),
        packet.payload.clone(),
    ])?;
    Ok(())
}

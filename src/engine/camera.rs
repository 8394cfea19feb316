//! Camera core contract and the development-mode camera.
//!
//! `CameraCore` is the consumed surface of a triggered scientific camera:
//! hardware-sequenced acquisition into a bounded device ring buffer, polled
//! draining, and a programmable trigger switch (LED banks on the widefield
//! rig). Everything the engine does goes through this trait, so tests and
//! development mode run against `SimulatedCamera`.

use crate::core::FrameData;
use async_trait::async_trait;
use std::sync::Mutex;

#[async_trait]
pub trait CameraCore: Send + Sync {
    fn camera_id(&self) -> &str;

    /// Interleaved channels per event (1 for single-channel cameras).
    fn camera_channel_count(&self) -> usize;

    /// Arm the camera for `n_frames` hardware-timed exposures.
    async fn start_sequence_acquisition(
        &self,
        n_frames: usize,
        stop_on_overflow: bool,
    ) -> anyhow::Result<()>;

    async fn stop_sequence_acquisition(&self) -> anyhow::Result<()>;

    async fn is_sequence_running(&self) -> anyhow::Result<bool>;

    /// Images currently waiting in the device ring buffer.
    async fn remaining_image_count(&self) -> anyhow::Result<usize>;

    /// True once the device ring buffer has dropped a frame. Latched until
    /// the hardware is reset.
    async fn is_buffer_overflowed(&self) -> anyhow::Result<bool>;

    /// Pop the oldest buffered image. Only valid while the buffer is
    /// non-empty.
    async fn pop_next_image(&self) -> anyhow::Result<FrameData>;

    /// Load the programmable-switch (LED bank) pattern to cycle through.
    async fn load_trigger_pattern(&self, pattern: &[String]) -> anyhow::Result<()>;

    async fn start_trigger_sequence(&self) -> anyhow::Result<()>;

    async fn stop_trigger_sequence(&self) -> anyhow::Result<()>;
}

#[derive(Default, Debug)]
struct SimState {
    running: bool,
    produced: usize,
    popped: usize,
    target: usize,
    overflowed: bool,
    pattern: Vec<String>,
    trigger_running: bool,
}

/// In-memory camera: each buffer poll "exposes" one more frame until the
/// armed target is reached, at which point the sequence stops on its own.
#[derive(Debug)]
pub struct SimulatedCamera {
    id: String,
    channels: usize,
    width: u32,
    height: u32,
    state: Mutex<SimState>,
}

impl SimulatedCamera {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            channels: 1,
            width: 16,
            height: 16,
            state: Mutex::new(SimState::default()),
        }
    }

    pub fn with_channels(mut self, channels: usize) -> Self {
        self.channels = channels;
        self
    }

    /// Latch the overflow flag, as a dropped frame would.
    pub fn force_overflow(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.overflowed = true;
        }
    }

    pub fn loaded_pattern(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| s.pattern.clone())
            .unwrap_or_default()
    }

    pub fn trigger_running(&self) -> bool {
        self.state.lock().map(|s| s.trigger_running).unwrap_or(false)
    }

    fn lock(&self) -> anyhow::Result<std::sync::MutexGuard<'_, SimState>> {
        self.state
            .lock()
            .map_err(|_| anyhow::anyhow!("simulated camera state poisoned"))
    }
}

#[async_trait]
impl CameraCore for SimulatedCamera {
    fn camera_id(&self) -> &str {
        &self.id
    }

    fn camera_channel_count(&self) -> usize {
        self.channels
    }

    async fn start_sequence_acquisition(
        &self,
        n_frames: usize,
        _stop_on_overflow: bool,
    ) -> anyhow::Result<()> {
        let mut state = self.lock()?;
        state.running = n_frames > 0;
        state.produced = 0;
        state.popped = 0;
        state.target = n_frames;
        Ok(())
    }

    async fn stop_sequence_acquisition(&self) -> anyhow::Result<()> {
        self.lock()?.running = false;
        Ok(())
    }

    async fn is_sequence_running(&self) -> anyhow::Result<bool> {
        Ok(self.lock()?.running)
    }

    async fn remaining_image_count(&self) -> anyhow::Result<usize> {
        let mut state = self.lock()?;
        if state.running && state.produced < state.target {
            state.produced += 1;
            if state.produced == state.target {
                state.running = false;
            }
        }
        Ok(state.produced - state.popped)
    }

    async fn is_buffer_overflowed(&self) -> anyhow::Result<bool> {
        Ok(self.lock()?.overflowed)
    }

    async fn pop_next_image(&self) -> anyhow::Result<FrameData> {
        let mut state = self.lock()?;
        if state.popped >= state.produced {
            anyhow::bail!("camera '{}' buffer is empty", self.id);
        }
        let index = state.popped as u16;
        state.popped += 1;
        Ok(FrameData {
            width: self.width,
            height: self.height,
            pixels: vec![index; (self.width * self.height) as usize],
        })
    }

    async fn load_trigger_pattern(&self, pattern: &[String]) -> anyhow::Result<()> {
        self.lock()?.pattern = pattern.to_vec();
        Ok(())
    }

    async fn start_trigger_sequence(&self) -> anyhow::Result<()> {
        let mut state = self.lock()?;
        if state.pattern.is_empty() {
            anyhow::bail!("no trigger pattern loaded on camera '{}'", self.id);
        }
        state.trigger_running = true;
        Ok(())
    }

    async fn stop_trigger_sequence(&self) -> anyhow::Result<()> {
        self.lock()?.trigger_running = false;
        Ok(())
    }
}

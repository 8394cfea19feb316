//! Bounded, thread-safe sample buffer.
//!
//! A `DataBuffer` holds the most recent `maxsize` data points from one
//! producer, evicting the oldest entry on overflow. It is mutated only by
//! its owning stream's collection task and read from any thread; the one
//! mutex is held only for a push or a snapshot copy.

use crate::core::DataPoint;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Default capacity when a producer registration does not specify one.
pub const DEFAULT_BUFFER_SIZE: usize = 1000;

#[derive(Debug)]
pub struct DataBuffer {
    maxsize: usize,
    inner: Mutex<VecDeque<DataPoint>>,
}

impl DataBuffer {
    pub fn new(maxsize: usize) -> Self {
        let maxsize = if maxsize == 0 {
            DEFAULT_BUFFER_SIZE
        } else {
            maxsize
        };
        Self {
            maxsize,
            inner: Mutex::new(VecDeque::with_capacity(maxsize.min(DEFAULT_BUFFER_SIZE))),
        }
    }

    pub fn maxsize(&self) -> usize {
        self.maxsize
    }

    /// Append a point, evicting the oldest entry if the buffer is full.
    pub fn push(&self, point: DataPoint) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if inner.len() == self.maxsize {
            inner.pop_front();
        }
        inner.push_back(point);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the buffered points in arrival order.
    pub fn snapshot(&self) -> Vec<DataPoint> {
        self.inner
            .lock()
            .map(|i| i.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.clear();
        }
    }
}

impl Default for DataBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

//! Producer/consumer data streaming framework.
//!
//! A `DataStream` binds one producer to one bounded buffer and zero or more
//! consumers; the `StreamRegistry` owns all streams, the shared session
//! clock, and the consumer routing table. Device sampling is decoupled from
//! consumption: each stream runs its own collection task that polls the
//! producer at ~1 ms granularity, timestamps every reading against the one
//! shared clock, and fans it out without producer back-pressure.

use crate::core::{DataConsumer, DataPoint, DataProducer, SessionClock};
use crate::data::buffer::DataBuffer;
use crate::error::AcqResult;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Sleep between producer polls; bounds CPU without materially delaying
/// delivery.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Bounded join when stopping a collection task. A task that fails to exit
/// within this window is abandoned and logged rather than deadlocking
/// shutdown.
const JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// One producer bound to one buffer and its attached consumers.
pub struct DataStream {
    producer: Arc<dyn DataProducer>,
    buffer: Arc<DataBuffer>,
    consumers: Arc<Mutex<Vec<Arc<dyn DataConsumer>>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
}

impl DataStream {
    fn new(producer: Arc<dyn DataProducer>, buffer_size: usize) -> Self {
        Self {
            producer,
            buffer: Arc::new(DataBuffer::new(buffer_size)),
            consumers: Arc::new(Mutex::new(Vec::new())),
            task: Mutex::new(None),
            stop_tx: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        self.producer.name()
    }

    pub fn producer_type(&self) -> &str {
        self.producer.producer_type()
    }

    pub fn buffer(&self) -> &Arc<DataBuffer> {
        &self.buffer
    }

    fn attach_consumer(&self, consumer: Arc<dyn DataConsumer>) {
        if let Ok(mut consumers) = self.consumers.lock() {
            consumers.push(consumer);
        }
    }

    /// Start the producer and spawn the collection task. Producer start
    /// failures are logged and reported as `false`, never raised.
    fn start(&self, clock: SessionClock) -> bool {
        {
            let task = self.task.lock().ok();
            if task.as_ref().is_some_and(|t| t.is_some()) {
                return true;
            }
        }
        if let Err(e) = self.producer.start() {
            log::error!("failed to start producer '{}': {e}", self.producer.name());
            return false;
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(collection_loop(
            Arc::clone(&self.producer),
            Arc::clone(&self.buffer),
            Arc::clone(&self.consumers),
            clock,
            stop_rx,
        ));
        if let Ok(mut task) = self.task.lock() {
            *task = Some(handle);
        }
        if let Ok(mut tx) = self.stop_tx.lock() {
            *tx = Some(stop_tx);
        }
        true
    }

    /// Signal the collection task, join it with a bounded timeout, then
    /// stop the producer.
    async fn stop(&self) -> bool {
        let stop_tx = self.stop_tx.lock().ok().and_then(|mut tx| tx.take());
        if let Some(tx) = stop_tx {
            let _ = tx.send(true);
        }
        let handle = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(handle) = handle {
            if tokio::time::timeout(JOIN_TIMEOUT, handle).await.is_err() {
                log::warn!(
                    "collection task for '{}' did not exit within {:?}; abandoning it",
                    self.producer.name(),
                    JOIN_TIMEOUT
                );
            }
        }
        match self.producer.stop() {
            Ok(()) => true,
            Err(e) => {
                log::error!("failed to stop producer '{}': {e}", self.producer.name());
                false
            }
        }
    }

    /// Write the buffered points to one CSV file, header
    /// `timestamp, <metadata fields...>, data`, in arrival order.
    fn export_to(&self, dir: &Path) -> AcqResult<PathBuf> {
        let points = self.buffer.snapshot();
        let path = dir.join(format!("{}.csv", self.producer.name()));
        let mut writer = csv::Writer::from_path(&path)?;

        let keys: Vec<String> = points
            .first()
            .map(|p| p.metadata.keys().cloned().collect())
            .unwrap_or_default();
        let mut header = vec!["timestamp".to_string()];
        header.extend(keys.iter().cloned());
        header.push("data".to_string());
        writer.write_record(&header)?;

        for point in &points {
            let mut record = vec![point.timestamp.to_string()];
            for key in &keys {
                record.push(point.metadata.get(key).cloned().unwrap_or_default());
            }
            record.push(point.data.to_string());
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(path)
    }
}

async fn collection_loop(
    producer: Arc<dyn DataProducer>,
    buffer: Arc<DataBuffer>,
    consumers: Arc<Mutex<Vec<Arc<dyn DataConsumer>>>>,
    clock: SessionClock,
    stop_rx: watch::Receiver<bool>,
) {
    let source = producer.name().to_string();
    let producer_type = producer.producer_type().to_string();
    loop {
        if *stop_rx.borrow() {
            break;
        }
        // None is "no new sample this poll", not an error.
        if let Some(reading) = producer.get_data() {
            let timestamp = clock.elapsed_secs();
            let mut metadata = producer.metadata();
            metadata.insert("source".to_string(), source.clone());
            metadata.insert("type".to_string(), producer_type.clone());
            let point = DataPoint {
                data: reading,
                timestamp,
                metadata,
            };
            buffer.push(point.clone());

            let attached: Vec<Arc<dyn DataConsumer>> = consumers
                .lock()
                .map(|c| c.clone())
                .unwrap_or_default();
            for consumer in attached {
                // A failing consumer must not starve the others or the loop.
                if let Err(e) = consumer.process_data(&point) {
                    log::warn!(
                        "consumer '{}' failed on sample from '{}': {e}",
                        consumer.name(),
                        source
                    );
                }
            }
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    log::debug!("collection loop for '{source}' exited");
}

struct RegistryInner {
    streams: HashMap<String, Arc<DataStream>>,
    clock: Option<SessionClock>,
}

/// Registry of all data streams for one session.
pub struct StreamRegistry {
    inner: Mutex<RegistryInner>,
    consumers: Mutex<Vec<Arc<dyn DataConsumer>>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                streams: HashMap::new(),
                clock: None,
            }),
            consumers: Mutex::new(Vec::new()),
        }
    }

    /// Registry whose reference clock is shared with other components (the
    /// acquisition engine) instead of being established lazily.
    pub fn with_clock(clock: SessionClock) -> Self {
        let registry = Self::new();
        if let Ok(mut inner) = registry.inner.lock() {
            inner.clock = Some(clock);
        }
        registry
    }

    /// Create a stream for `producer`. Returns `false` (leaving the first
    /// registration intact) if the name is already taken.
    pub fn register_producer(&self, producer: Arc<dyn DataProducer>, buffer_size: usize) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        let name = producer.name().to_string();
        if inner.streams.contains_key(&name) {
            log::debug!("producer '{name}' already registered");
            return false;
        }
        let stream = Arc::new(DataStream::new(producer, buffer_size));
        if let Ok(consumers) = self.consumers.lock() {
            for consumer in consumers.iter() {
                if consumer
                    .accepted_types()
                    .iter()
                    .any(|t| t == stream.producer_type())
                {
                    stream.attach_consumer(Arc::clone(consumer));
                }
            }
        }
        inner.streams.insert(name, stream);
        true
    }

    /// Attach `consumer` to every current stream of a matching producer
    /// type; it is also attached to matching future producers.
    pub fn register_consumer(&self, consumer: Arc<dyn DataConsumer>) {
        if let Ok(inner) = self.inner.lock() {
            let accepted = consumer.accepted_types();
            for stream in inner.streams.values() {
                if accepted.iter().any(|t| t == stream.producer_type()) {
                    stream.attach_consumer(Arc::clone(&consumer));
                }
            }
        }
        if let Ok(mut consumers) = self.consumers.lock() {
            consumers.push(consumer);
        }
    }

    /// The shared reference clock, if it has been established.
    pub fn clock(&self) -> Option<SessionClock> {
        self.inner.lock().ok().and_then(|i| i.clock.clone())
    }

    pub fn stream_count(&self) -> usize {
        self.inner.lock().map(|i| i.streams.len()).unwrap_or(0)
    }

    /// Lazily establish the shared clock (under the registration lock, so a
    /// late `register_producer` cannot race it) and return it along with
    /// the requested streams.
    fn clock_and_streams(&self, name: Option<&str>) -> (SessionClock, Vec<Arc<DataStream>>) {
        let Ok(mut inner) = self.inner.lock() else {
            return (SessionClock::start(), Vec::new());
        };
        let clock = inner
            .clock
            .get_or_insert_with(SessionClock::start)
            .clone();
        let streams = match name {
            Some(name) => inner.streams.get(name).cloned().into_iter().collect(),
            None => inner.streams.values().cloned().collect(),
        };
        (clock, streams)
    }

    /// Start every registered stream. Returns `true` only if all started.
    pub fn start_all(&self) -> bool {
        let (clock, streams) = self.clock_and_streams(None);
        let mut all_ok = true;
        for stream in streams {
            all_ok &= stream.start(clock.clone());
        }
        all_ok
    }

    pub fn start_stream(&self, name: &str) -> bool {
        let (clock, streams) = self.clock_and_streams(Some(name));
        streams
            .first()
            .map(|s| s.start(clock))
            .unwrap_or(false)
    }

    /// Stop every stream: signal, join with a bounded timeout, stop the
    /// producer.
    pub async fn stop_all(&self) {
        let streams: Vec<Arc<DataStream>> = self
            .inner
            .lock()
            .map(|i| i.streams.values().cloned().collect())
            .unwrap_or_default();
        for stream in streams {
            stream.stop().await;
        }
    }

    pub async fn stop_stream(&self, name: &str) -> bool {
        let stream = self
            .inner
            .lock()
            .ok()
            .and_then(|i| i.streams.get(name).cloned());
        match stream {
            Some(stream) => stream.stop().await,
            None => false,
        }
    }

    /// Snapshot of the named stream's buffered points.
    pub fn get_data(&self, name: &str) -> Option<Vec<DataPoint>> {
        self.inner
            .lock()
            .ok()
            .and_then(|i| i.streams.get(name).map(|s| s.buffer().snapshot()))
    }

    /// Flush every stream's buffer to one CSV per producer under `dir`.
    pub fn export_all_to_directory(&self, dir: &Path) -> AcqResult<Vec<PathBuf>> {
        std::fs::create_dir_all(dir)?;
        let streams: Vec<Arc<DataStream>> = self
            .inner
            .lock()
            .map(|i| i.streams.values().cloned().collect())
            .unwrap_or_default();
        let mut written = Vec::with_capacity(streams.len());
        for stream in streams {
            written.push(stream.export_to(dir)?);
        }
        Ok(written)
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Reading;
    use crate::error::AcqError;
    use std::collections::VecDeque;

    /// Producer that yields a scripted list of readings, one per poll.
    struct ScriptedProducer {
        name: String,
        items: Mutex<VecDeque<Reading>>,
    }

    impl ScriptedProducer {
        fn new(name: &str, items: Vec<Reading>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                items: Mutex::new(items.into()),
            })
        }
    }

    impl DataProducer for ScriptedProducer {
        fn name(&self) -> &str {
            &self.name
        }
        fn producer_type(&self) -> &str {
            "scripted"
        }
        fn start(&self) -> AcqResult<()> {
            Ok(())
        }
        fn stop(&self) -> AcqResult<()> {
            Ok(())
        }
        fn get_data(&self) -> Option<Reading> {
            self.items.lock().ok()?.pop_front()
        }
    }

    struct CollectingConsumer {
        seen: Mutex<Vec<DataPoint>>,
    }

    impl DataConsumer for CollectingConsumer {
        fn name(&self) -> &str {
            "collector"
        }
        fn accepted_types(&self) -> Vec<String> {
            vec!["scripted".to_string()]
        }
        fn process_data(&self, point: &DataPoint) -> AcqResult<()> {
            if let Ok(mut seen) = self.seen.lock() {
                seen.push(point.clone());
            }
            Ok(())
        }
    }

    struct FailingConsumer;

    impl DataConsumer for FailingConsumer {
        fn name(&self) -> &str {
            "failing"
        }
        fn accepted_types(&self) -> Vec<String> {
            vec!["scripted".to_string()]
        }
        fn process_data(&self, _point: &DataPoint) -> AcqResult<()> {
            Err(AcqError::Processing("always fails".to_string()))
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = StreamRegistry::new();
        let first = ScriptedProducer::new("enc", vec![]);
        let second = ScriptedProducer::new("enc", vec![]);
        assert!(registry.register_producer(first, 10));
        assert!(!registry.register_producer(second, 10));
        assert_eq!(registry.stream_count(), 1);
    }

    #[tokio::test]
    async fn collection_loop_buffers_in_poll_order() {
        let registry = StreamRegistry::new();
        let producer = ScriptedProducer::new(
            "enc",
            (0..5).map(Reading::Ticks).collect(),
        );
        assert!(registry.register_producer(producer, 10));
        assert!(registry.start_all());
        tokio::time::sleep(Duration::from_millis(50)).await;
        registry.stop_all().await;

        let points = registry.get_data("enc").expect("stream exists");
        assert_eq!(points.len(), 5);
        for pair in points.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
        assert_eq!(points[0].metadata.get("source").map(String::as_str), Some("enc"));
        assert_eq!(points[0].metadata.get("type").map(String::as_str), Some("scripted"));
    }

    #[tokio::test]
    async fn failing_consumer_does_not_starve_others() {
        let registry = StreamRegistry::new();
        registry.register_consumer(Arc::new(FailingConsumer));
        let collector = Arc::new(CollectingConsumer {
            seen: Mutex::new(Vec::new()),
        });
        registry.register_consumer(Arc::clone(&collector) as Arc<dyn DataConsumer>);

        let producer = ScriptedProducer::new(
            "enc",
            (0..4).map(Reading::Ticks).collect(),
        );
        assert!(registry.register_producer(producer, 10));
        assert!(registry.start_all());
        tokio::time::sleep(Duration::from_millis(50)).await;
        registry.stop_all().await;

        let seen = collector.seen.lock().unwrap();
        assert_eq!(seen.len(), 4);
    }

    #[tokio::test]
    async fn export_round_trips_timestamps_and_data() {
        let registry = StreamRegistry::new();
        let producer = ScriptedProducer::new(
            "notes",
            vec![Reading::Text("a".to_string()), Reading::Text("b".to_string())],
        );
        assert!(registry.register_producer(producer, 10));
        assert!(registry.start_all());
        tokio::time::sleep(Duration::from_millis(50)).await;
        registry.stop_all().await;

        let dir = tempfile::tempdir().unwrap();
        let written = registry.export_all_to_directory(dir.path()).unwrap();
        assert_eq!(written.len(), 1);

        let original = registry.get_data("notes").unwrap();
        let mut reader = csv::Reader::from_path(&written[0]).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(&headers[0], "timestamp");
        assert_eq!(&headers[headers.len() - 1], "data");
        let rows: Vec<csv::StringRecord> =
            reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        for (row, point) in rows.iter().zip(&original) {
            assert_eq!(row[0].parse::<f64>().unwrap(), point.timestamp);
            assert_eq!(&row[row.len() - 1], point.data.to_string().as_str());
        }
    }

    #[tokio::test]
    async fn stop_unknown_stream_reports_false() {
        let registry = StreamRegistry::new();
        assert!(!registry.stop_stream("missing").await);
        assert!(!registry.start_stream("missing"));
    }
}

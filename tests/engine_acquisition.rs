//! Engine-level acquisition scenarios, including teardown side effects.

use mesodaq::config::{ExperimentConfig, Settings};
use mesodaq::core::{DataProducer, HardwareDevice, SequencedEvent, SessionClock};
use mesodaq::data::queue::DataQueue;
use mesodaq::data::saver::DataSaver;
use mesodaq::engine::{AcquisitionEngine, SimulatedCamera, TriggerMode};
use mesodaq::error::AcqError;
use mesodaq::hardware::encoder::EncoderWorker;
use mesodaq::paths::DataPaths;
use std::sync::Arc;
use std::time::Duration;

fn config(dir: &std::path::Path) -> Arc<ExperimentConfig> {
    let mut settings = Settings {
        subject: "m01".to_string(),
        session: "01".to_string(),
        task: "wheel".to_string(),
        protocol: "meso".to_string(),
        save_dir: dir.to_string_lossy().into_owned(),
        duration_secs: 1,
        frame_rate: 10.0,
        led_pattern: ["4", "2"].map(String::from).to_vec(),
        encoder: Default::default(),
        daq: Default::default(),
    };
    settings.encoder.sample_interval_ms = 5;
    settings.encoder.simulated = true;
    Arc::new(ExperimentConfig::new(settings).unwrap())
}

#[tokio::test]
async fn full_drain_yields_every_expected_frame_in_order() {
    let camera = Arc::new(SimulatedCamera::new("meso").with_channels(2));
    let engine = AcquisitionEngine::new(
        Arc::clone(&camera),
        TriggerMode::Untriggered,
        SessionClock::start(),
    );
    let seq = SequencedEvent::uniform(3, 100.0);
    let mut drain = engine.exec_sequenced_event(seq).await.unwrap();
    assert_eq!(drain.expected_frames(), 6);

    let mut tags = Vec::new();
    while let Some(payload) = drain.next_frame().await.unwrap() {
        tags.push((payload.event_index, payload.channel_index));
    }
    assert_eq!(
        tags,
        vec![(0, 0), (0, 1), (1, 0), (1, 1), (2, 0), (2, 1)]
    );
}

#[tokio::test]
async fn overflow_mid_sequence_aborts_with_fatal_error() {
    let camera = Arc::new(SimulatedCamera::new("meso"));
    let engine = AcquisitionEngine::new(
        Arc::clone(&camera),
        TriggerMode::Untriggered,
        SessionClock::start(),
    );
    let mut drain = engine
        .exec_sequenced_event(SequencedEvent::uniform(10, 100.0))
        .await
        .unwrap();

    // Yield a couple of frames, then the hardware drops one.
    for _ in 0..2 {
        assert!(drain.next_frame().await.unwrap().is_some());
    }
    camera.force_overflow();

    let err = drain.next_frame().await.unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(
        err,
        AcqError::BufferOverflow { frames_yielded: 2, .. }
    ));
    assert!(drain.next_frame().await.unwrap().is_none());
}

#[tokio::test]
async fn teardown_persists_encoder_samples_and_configuration() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let clock = SessionClock::start();
    let queue = DataQueue::new();
    let encoder = Arc::new(EncoderWorker::new(
        cfg.settings.encoder.clone(),
        queue,
        clock.clone(),
    ));
    let devices = vec![Arc::clone(&encoder) as Arc<dyn HardwareDevice>];
    let paths = DataPaths::build(&cfg, &devices).unwrap();
    let saver = DataSaver::new(Arc::clone(&cfg), paths.clone());

    let engine = AcquisitionEngine::new(
        Arc::new(SimulatedCamera::new("meso")),
        TriggerMode::LedPattern(cfg.settings.led_pattern.clone()),
        clock,
    )
    .with_encoder(Arc::clone(&encoder))
    .with_saver(saver);

    let seq = SequencedEvent::uniform(5, 100.0);
    engine.setup_sequence(&seq).await.unwrap();
    DataProducer::start(encoder.as_ref()).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut drain = engine.exec_sequenced_event(seq).await.unwrap();
    while drain.next_frame().await.unwrap().is_some() {}
    engine.teardown_sequence().await.unwrap();

    // Encoder CSV landed at the device's precomputed path.
    let encoder_path = paths.device("encoder").unwrap();
    let mut reader = csv::Reader::from_path(encoder_path).unwrap();
    assert_eq!(
        reader.headers().unwrap().iter().collect::<Vec<_>>(),
        vec!["timestamp", "clicks", "speed"]
    );
    assert!(reader.records().count() > 0);

    // Configuration snapshot landed too.
    assert!(paths.configuration.exists());
}

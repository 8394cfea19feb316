//! Demo binary: run one fully simulated acquisition session.

use clap::Parser;
use mesodaq::config::{ExperimentConfig, Settings};
use mesodaq::engine::{SimulatedCamera, TriggerMode};
use mesodaq::error::AcqResult;
use mesodaq::hardware::daq::{DaqInterface, SimulatedDaq};
use mesodaq::procedure::{FrameMetadataSink, Procedure};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "mesodaq", about = "Synchronized multi-device acquisition")]
struct Args {
    /// Path to a TOML or JSON settings file; omit for built-in demo
    /// settings.
    #[arg(short, long)]
    config: Option<String>,

    /// Override the acquisition duration in seconds.
    #[arg(short, long)]
    duration: Option<u64>,
}

fn demo_settings() -> AcqResult<Settings> {
    let mut settings = Settings {
        subject: "demo".to_string(),
        session: "01".to_string(),
        task: "wheel".to_string(),
        protocol: "meso".to_string(),
        save_dir: std::env::temp_dir()
            .join("mesodaq-demo")
            .to_string_lossy()
            .into_owned(),
        duration_secs: 2,
        frame_rate: 30.0,
        led_pattern: ["4", "4", "2", "2"].map(String::from).to_vec(),
        encoder: Default::default(),
        daq: Default::default(),
    };
    settings.encoder.simulated = true;
    settings.validate()?;
    Ok(settings)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut settings = match &args.config {
        Some(path) => Settings::from_file(path)?,
        None => demo_settings()?,
    };
    if let Some(duration) = args.duration {
        settings.duration_secs = duration;
    }
    let led_pattern = settings.led_pattern.clone();
    let config = Arc::new(ExperimentConfig::new(settings)?);

    let camera = Arc::new(SimulatedCamera::new("meso").with_channels(2));
    let daq = Arc::new(SimulatedDaq::new()) as Arc<dyn DaqInterface>;
    let mut procedure = Procedure::new(
        Arc::clone(&config),
        camera,
        TriggerMode::LedPattern(led_pattern),
        daq,
    )?;

    procedure.initialize()?;
    procedure.add_note("simulated demo session");

    let sink_path = config.make_path("frames", "csv", Some("func"))?;
    let mut sink = FrameMetadataSink::create(&sink_path)?;
    let frames = procedure.run(&mut sink).await?;
    procedure.finish().await?;

    log::info!("acquired {frames} frames; outputs under {}", config.bids_dir().display());
    println!(
        "acquired {frames} frames; outputs under {}",
        config.bids_dir().display()
    );
    Ok(())
}

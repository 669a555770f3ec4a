//! Duplex loopback example.
//!
//! Captures microphone audio, encodes it to wire frames, and plays it back
//! out of the default output device. Wear headphones.
//!
//! Run with: cargo run --example loopback

use std::sync::Arc;
use std::time::Duration;

use duplex_audio::{
    event_callback, CaptureConfig, CaptureEncoder, DeviceContextManager, PlaybackConfig,
    PlaybackScheduler, ProcessingUnitRegistry,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let contexts = Arc::new(DeviceContextManager::new());
    let registry = Arc::new(ProcessingUnitRegistry::new());
    let events = event_callback(|event| tracing::info!(?event, "pipeline event"));

    let capture = CaptureEncoder::new(
        // Match the playback rate so no resampling happens in between
        CaptureConfig {
            sample_rate: 24000,
            ..Default::default()
        },
        Arc::clone(&contexts),
        Arc::clone(&registry),
        Arc::clone(&events),
    );
    let mut frames = capture.start().await?.expect("first start");

    let playback = PlaybackScheduler::spawn_with_device(
        PlaybackConfig::default(),
        contexts,
        registry,
        events,
    )
    .await?;

    println!("Looping microphone to speakers for 10 seconds...");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(200), frames.recv()).await {
            Ok(Some(frame)) => playback.ingest_wire(frame),
            Ok(None) => break,
            Err(_) => {}
        }
    }

    capture.stop().await;
    playback.mark_stream_complete();
    playback.shutdown().await;

    println!(
        "Done: {} chunks scheduled, {} frames encoded",
        playback.stats().chunks_scheduled(),
        capture.stats().frames_encoded()
    );
    Ok(())
}

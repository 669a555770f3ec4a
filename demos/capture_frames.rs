//! Simple capture example.
//!
//! Captures five seconds of microphone audio and prints each encoded wire
//! frame alongside the live volume envelope.
//!
//! Run with: cargo run --example capture_frames

use std::sync::Arc;
use std::time::Duration;

use duplex_audio::{
    event_callback, CaptureConfig, CaptureEncoder, DeviceContextManager, ProcessingUnitRegistry,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing for debug output
    tracing_subscriber::fmt::init();

    let capture = CaptureEncoder::new(
        CaptureConfig::default(),
        Arc::new(DeviceContextManager::new()),
        Arc::new(ProcessingUnitRegistry::new()),
        event_callback(|event| tracing::info!(?event, "pipeline event")),
    );

    println!("Recording for 5 seconds...");
    let mut frames = capture.start().await?.expect("first start");
    let volume = capture.volume();

    let printer = tokio::spawn(async move {
        let mut count = 0usize;
        while let Some(frame) = frames.recv().await {
            count += 1;
            println!(
                "frame {count}: {} ({} base64 bytes, volume {:.3})",
                frame.mime_type,
                frame.data.len(),
                *volume.borrow()
            );
        }
        count
    });

    tokio::time::sleep(Duration::from_secs(5)).await;
    capture.stop().await;

    let total = printer.await?;
    println!(
        "Done: {total} frames, {} samples bridged",
        capture.stats().samples_bridged()
    );
    Ok(())
}

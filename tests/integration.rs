//! Integration tests for duplex-audio.
//!
//! Playback scheduling is exercised through `ManualRenderSink`, whose clock
//! is advanced by hand. Tests that require actual audio hardware are marked
//! with `#[ignore]` and should be run manually.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use duplex_audio::{
    event_callback, ContextOptions, DeviceContextManager, EventCallback, ManualRenderSink,
    PcmFrame, PipelineEvent, PlaybackConfig, PlaybackScheduler, PlaybackState,
    ProcessingUnitRegistry, RenderSink, UnitMessage, VolumeEnvelopeUnit,
};

type EventLog = Arc<Mutex<Vec<PipelineEvent>>>;

fn event_recorder() -> (EventCallback, EventLog) {
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let callback = event_callback(move |event| {
        sink.lock().unwrap().push(event);
    });
    (callback, log)
}

fn count_completes(log: &EventLog) -> usize {
    log.lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e, PipelineEvent::PlaybackComplete))
        .count()
}

async fn spawn_scheduler() -> (PlaybackScheduler, Arc<ManualRenderSink>, EventLog) {
    let config = PlaybackConfig::default();
    let sink = Arc::new(ManualRenderSink::new(config.sample_rate));
    let (callback, log) = event_recorder();
    let scheduler = PlaybackScheduler::spawn(
        config,
        Arc::new(DeviceContextManager::new()),
        Arc::new(ProcessingUnitRegistry::new()),
        Arc::clone(&sink) as Arc<dyn RenderSink>,
        callback,
    )
    .await
    .unwrap();
    (scheduler, sink, log)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_partial_chunk_stays_in_residual() {
    let (scheduler, sink, _log) = spawn_scheduler().await;

    // First payload is short of a chunk: everything is held in the residual
    // and the stream does not start
    scheduler.ingest_samples(vec![0.25; 4000]);
    settle().await;
    assert!(sink.records().is_empty());
    assert_eq!(scheduler.state(), PlaybackState::Idle);

    // The second payload tips the accumulator over the 7680-sample chunk
    // boundary: one chunk out, 320 held back
    scheduler.ingest_samples(vec![0.25; 4000]);
    settle().await;

    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].samples.len(), 7680);
    // First chunk starts after the initial buffering delay
    assert_eq!(records[0].start, Duration::from_millis(100));
    assert_eq!(scheduler.state(), PlaybackState::Playing);
    assert_eq!(scheduler.stats().chunks_scheduled(), 1);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_mark_complete_flushes_residual_and_completes_once() {
    let (scheduler, sink, log) = spawn_scheduler().await;

    scheduler.ingest_samples(vec![0.25; 8000]);
    settle().await;
    scheduler.mark_stream_complete();
    settle().await;

    // The 320-sample tail is queued but outside the lookahead window until
    // the clock catches up
    assert_eq!(sink.records().len(), 1);

    // Move the clock close to the first chunk's end; the re-armed timer
    // schedules the tail back-to-back at the cursor
    sink.advance_to(Duration::from_millis(400));
    tokio::time::sleep(Duration::from_millis(300)).await;

    let records = sink.records();
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].samples.len(), 320);
    assert_eq!(records[1].start, Duration::from_millis(420));
    // Cursor is non-decreasing: chunks are laid end to end
    assert!(records[1].start >= records[0].start);

    // Nothing has finished rendering yet
    assert_eq!(count_completes(&log), 0);

    // Render everything out; the last chunk's ended observer completes the
    // stream exactly once
    sink.advance_to(Duration::from_secs(1));
    settle().await;
    assert_eq!(count_completes(&log), 1);
    assert_eq!(scheduler.state(), PlaybackState::Complete);

    // A second advance or mark changes nothing
    scheduler.mark_stream_complete();
    sink.advance_to(Duration::from_secs(2));
    settle().await;
    assert_eq!(count_completes(&log), 1);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_eager_completion_with_nothing_pending() {
    let (scheduler, _sink, log) = spawn_scheduler().await;

    scheduler.mark_stream_complete();
    settle().await;

    assert_eq!(count_completes(&log), 1);
    assert_eq!(scheduler.state(), PlaybackState::Complete);

    scheduler.mark_stream_complete();
    settle().await;
    assert_eq!(count_completes(&log), 1);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_stop_fades_and_resume_restores_gain() {
    let (scheduler, sink, log) = spawn_scheduler().await;

    scheduler.ingest_samples(vec![0.5; 7680 * 2]);
    settle().await;
    assert_eq!(sink.records().len(), 1);

    scheduler.stop();
    settle().await;

    // Fade target reached, interruption reported
    assert_eq!(sink.gain(), 0.0);
    assert!(log
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, PipelineEvent::PlaybackInterrupted)));

    // After the fade window the gain stage is rebuilt: pending audio is
    // orphaned and gain returns to unity. An interruption is not a natural
    // end of stream, so no completion is signaled
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(sink.gain(), 1.0);
    assert_eq!(sink.pending(), 0);
    assert_eq!(count_completes(&log), 0);
    assert_eq!(scheduler.state(), PlaybackState::Complete);

    scheduler.resume();
    settle().await;
    assert!(log
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, PipelineEvent::PlaybackResumed)));

    // New audio plays at full gain; nothing from before the stop survives
    scheduler.ingest_samples(vec![0.25; 7680]);
    settle().await;
    assert_eq!(sink.gain(), 1.0);
    assert_eq!(sink.pending(), 1);
    let records = sink.records();
    let last = records.last().unwrap();
    assert!(last.samples.iter().all(|&s| (s - 0.25).abs() < 1e-6));
    assert_eq!(count_completes(&log), 0);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_resume_before_fade_settles_keeps_new_audio() {
    let (scheduler, sink, log) = spawn_scheduler().await;

    scheduler.ingest_samples(vec![0.5; 7680]);
    settle().await;
    assert_eq!(sink.records().len(), 1);

    // Resume right after the stop, before the deferred gain reset lands
    scheduler.stop();
    scheduler.resume();
    scheduler.ingest_samples(vec![0.25; 7680]);
    settle().await;
    assert_eq!(sink.pending(), 1);

    // Sleep past the fade window: the stale reset must not wipe the audio
    // scheduled after the resume
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(sink.pending(), 1);
    assert_eq!(sink.gain(), 1.0);
    let records = sink.records();
    let last = records.last().unwrap();
    assert!(last.samples.iter().all(|&s| (s - 0.25).abs() < 1e-6));
    assert!(log
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, PipelineEvent::PlaybackResumed)));
    assert_eq!(count_completes(&log), 0);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_releases_meter_registration() {
    let contexts = Arc::new(DeviceContextManager::new());
    let registry = Arc::new(ProcessingUnitRegistry::new());
    let config = PlaybackConfig::default();

    let first = PlaybackScheduler::spawn(
        config.clone(),
        Arc::clone(&contexts),
        Arc::clone(&registry),
        Arc::new(ManualRenderSink::new(config.sample_rate)) as Arc<dyn RenderSink>,
        event_callback(|_| {}),
    )
    .await
    .unwrap();
    let stale_volume = first.volume();
    first.shutdown().await;

    let second = PlaybackScheduler::spawn(
        config.clone(),
        Arc::clone(&contexts),
        Arc::clone(&registry),
        Arc::new(ManualRenderSink::new(config.sample_rate)) as Arc<dyn RenderSink>,
        event_callback(|_| {}),
    )
    .await
    .unwrap();

    // Feed the shared meter unit directly: only the live handle's watch
    // channel moves
    let ctx = contexts
        .acquire("playback", ContextOptions::new(config.sample_rate))
        .await
        .unwrap();
    registry.feed(ctx.id(), "volume-meter", &vec![0.8; 600]);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(*second.volume().borrow() > 0.0);
    assert_eq!(*stale_volume.borrow(), 0.0);

    second.shutdown().await;
}

#[tokio::test]
async fn test_schedule_failure_substitutes_silence() {
    let (scheduler, sink, log) = spawn_scheduler().await;

    sink.fail_next_schedule();
    scheduler.ingest_samples(vec![0.5; 7680]);
    settle().await;

    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert!(records[0].is_silent());
    assert_eq!(records[0].samples.len(), 7680);
    assert_eq!(scheduler.stats().silent_substitutions(), 1);
    assert!(log.lock().unwrap().iter().any(|e| matches!(
        e,
        PipelineEvent::SilentChunkSubstituted { duration_ms: 320 }
    )));

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_odd_byte_payload_is_trimmed_and_reported() {
    let (scheduler, sink, log) = spawn_scheduler().await;

    // One full sample (0x4000 = 0.5) plus a trailing byte
    scheduler.ingest_bytes(vec![0x00, 0x40, 0x7f]);
    settle().await;

    assert!(log
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, PipelineEvent::PayloadSkipped { .. })));
    assert_eq!(scheduler.stats().payloads_skipped(), 1);
    // The whole samples survived
    assert_eq!(scheduler.stats().samples_ingested(), 1);
    assert!(sink.records().is_empty());

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_wire_frame_round_trip_feeds_playback() {
    let (scheduler, sink, _log) = spawn_scheduler().await;

    let samples: Vec<i16> = (0..7680).map(|i| (i % 256) as i16 * 16).collect();
    let frame = PcmFrame::new(samples.clone(), 16000);
    scheduler.ingest_wire(frame.to_wire());
    settle().await;

    let records = sink.records();
    assert_eq!(records.len(), 1);
    // Normalization bound: one part in 32768
    for (decoded, original) in records[0].samples.iter().zip(&samples) {
        assert!((decoded - f32::from(*original) / 32768.0).abs() < 1e-6);
    }

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_corrupt_wire_frame_is_skipped() {
    let (scheduler, sink, log) = spawn_scheduler().await;

    let frame = duplex_audio::WireFrame {
        mime_type: "audio/pcm;rate=24000".to_string(),
        data: "not base64 !!!".to_string(),
    };
    scheduler.ingest_wire(frame);
    settle().await;

    assert!(log
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, PipelineEvent::PayloadSkipped { .. })));
    assert!(sink.records().is_empty());

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_playback_metering_decays_through_silence() {
    let registry = ProcessingUnitRegistry::new();
    let contexts = DeviceContextManager::new();
    let ctx = contexts
        .acquire("playback", ContextOptions::new(24000))
        .await
        .unwrap();

    let readings: Arc<Mutex<Vec<f32>>> = Arc::new(Mutex::new(Vec::new()));
    let out = Arc::clone(&readings);
    registry
        .register(
            &ctx,
            "volume-meter",
            &VolumeEnvelopeUnit::definition(Duration::from_millis(25)),
            duplex_audio::unit_handler(move |message| {
                if let UnitMessage::Volume(v) = message {
                    out.lock().unwrap().push(*v);
                }
            }),
        )
        .unwrap();

    // 600 frames covers the 25ms interval at 24kHz
    registry.feed(ctx.id(), "volume-meter", &vec![0.8; 600]);
    registry.feed(ctx.id(), "volume-meter", &vec![0.0; 600]);
    registry.feed(ctx.id(), "volume-meter", &vec![0.0; 600]);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let readings = readings.lock().unwrap();
    assert_eq!(readings.len(), 3);
    assert!((readings[0] - 0.8).abs() < 1e-6);
    // Decay is gradual (factor per block), never a snap to zero
    assert!((readings[1] - 0.8 * 0.75).abs() < 1e-6);
    assert!((readings[2] - 0.8 * 0.75 * 0.75).abs() < 1e-6);
    assert!(readings[2] > 0.0);
}

#[tokio::test]
#[ignore = "requires audio hardware"]
async fn test_duplex_round_trip_through_devices() {
    use duplex_audio::{CaptureConfig, CaptureEncoder};

    let contexts = Arc::new(DeviceContextManager::new());
    let registry = Arc::new(ProcessingUnitRegistry::new());
    let (callback, _log) = event_recorder();

    let capture = CaptureEncoder::new(
        CaptureConfig::default(),
        Arc::clone(&contexts),
        Arc::clone(&registry),
        Arc::clone(&callback),
    );
    let mut frames = capture.start().await.unwrap().expect("first start");

    let playback = PlaybackScheduler::spawn_with_device(
        PlaybackConfig::default(),
        contexts,
        registry,
        callback,
    )
    .await
    .unwrap();

    // Loop a second of microphone audio back out of the speakers
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while tokio::time::Instant::now() < deadline {
        if let Ok(Some(frame)) = tokio::time::timeout(Duration::from_millis(200), frames.recv())
            .await
        {
            playback.ingest_wire(frame);
        }
    }

    capture.stop().await;
    playback.mark_stream_complete();
    playback.shutdown().await;
}

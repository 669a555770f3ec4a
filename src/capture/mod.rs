//! The capture/encode half of the pipeline.
//!
//! [`CaptureEncoder`] opens the default input device, bridges its samples
//! off the real-time callback through a ring buffer, runs them through the
//! PCM encoder and volume meter units, and hands out the resulting wire
//! frames and loudness envelope.
//!
//! `start()` holds the session lock across the whole initialization
//! sequence, so a concurrent second `start()` parks until the first settles
//! and `stop()` issued mid-initialization waits for it too. A failed start
//! rolls back everything it acquired without emitting a stopped event.

mod device;
mod encoder;
mod mock;
mod source;

pub use device::{default_input_device_name, list_input_devices, CaptureDeviceStream};
pub use encoder::PcmFrameEncoder;
pub use mock::MockCaptureSource;
pub use source::{CaptureSource, CaptureStream, DeviceCaptureSource};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ringbuf::traits::Consumer;
use ringbuf::HeapCons;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::CaptureConfig;
use crate::context::{ContextOptions, DeviceContext, DeviceContextManager};
use crate::error::AudioPipelineError;
use crate::event::{EventCallback, PipelineEvent};
use crate::frame::WireFrame;
use crate::meter::VolumeEnvelopeUnit;
use crate::registry::{unit_handler, ProcessingUnitRegistry, RegistrationHandle, UnitMessage};

/// Registry name of the PCM frame encoder unit.
pub const PCM_ENCODER_UNIT: &str = "pcm-encoder";
/// Registry name of the volume meter unit.
pub const VOLUME_METER_UNIT: &str = "volume-meter";

/// Counters for a capture session. Cumulative across restarts.
#[derive(Debug, Default)]
pub struct CaptureStats {
    frames_encoded: AtomicU64,
    frames_dropped: AtomicU64,
    samples_bridged: AtomicU64,
}

impl CaptureStats {
    /// Wire frames emitted to the frame channel.
    pub fn frames_encoded(&self) -> u64 {
        self.frames_encoded.load(Ordering::Relaxed)
    }

    /// Wire frames dropped because the frame channel was full.
    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    /// Samples moved from the device ring buffer into the units.
    pub fn samples_bridged(&self) -> u64 {
        self.samples_bridged.load(Ordering::Relaxed)
    }
}

/// Resources held while recording.
struct ActiveCapture {
    stream: Box<dyn CaptureStream>,
    bridge_stop: oneshot::Sender<()>,
    bridge: JoinHandle<()>,
    encoder_handle: RegistrationHandle,
    meter_handle: RegistrationHandle,
    context: Arc<DeviceContext>,
}

enum CaptureState {
    Idle,
    Recording(ActiveCapture),
}

/// Captures microphone audio and encodes it into wire frames.
///
/// Owns the capture session lifecycle; the processing-unit registry and
/// device-context manager are shared with the rest of the pipeline.
pub struct CaptureEncoder {
    config: CaptureConfig,
    contexts: Arc<DeviceContextManager>,
    registry: Arc<ProcessingUnitRegistry>,
    callback: EventCallback,
    source: Arc<dyn CaptureSource>,
    state: Mutex<CaptureState>,
    volume_tx: watch::Sender<f32>,
    volume_rx: watch::Receiver<f32>,
    stats: Arc<CaptureStats>,
}

impl CaptureEncoder {
    /// Creates an encoder capturing from the default input device.
    /// `callback` receives lifecycle events.
    pub fn new(
        config: CaptureConfig,
        contexts: Arc<DeviceContextManager>,
        registry: Arc<ProcessingUnitRegistry>,
        callback: EventCallback,
    ) -> Self {
        Self::with_source(
            config,
            contexts,
            registry,
            callback,
            Arc::new(DeviceCaptureSource),
        )
    }

    /// Creates an encoder capturing from an arbitrary [`CaptureSource`]
    /// (a [`MockCaptureSource`] in tests).
    pub fn with_source(
        config: CaptureConfig,
        contexts: Arc<DeviceContextManager>,
        registry: Arc<ProcessingUnitRegistry>,
        callback: EventCallback,
        source: Arc<dyn CaptureSource>,
    ) -> Self {
        let (volume_tx, volume_rx) = watch::channel(0.0);
        Self {
            config,
            contexts,
            registry,
            callback,
            source,
            state: Mutex::new(CaptureState::Idle),
            volume_tx,
            volume_rx,
            stats: Arc::new(CaptureStats::default()),
        }
    }

    /// Watch channel carrying the capture loudness envelope.
    ///
    /// Starts at 0.0 and updates at the configured interval while recording.
    pub fn volume(&self) -> watch::Receiver<f32> {
        self.volume_rx.clone()
    }

    /// Session counters.
    pub fn stats(&self) -> &CaptureStats {
        &self.stats
    }

    /// Returns `true` if a capture session is active.
    pub async fn is_recording(&self) -> bool {
        matches!(*self.state.lock().await, CaptureState::Recording(_))
    }

    /// Starts capturing, returning the receiving end of the wire-frame
    /// channel.
    ///
    /// Returns `Ok(None)` if a session is already recording: the call is a
    /// no-op and the existing session's channel stays the only outlet. A
    /// concurrent `start()` waits for the in-flight one to settle first.
    ///
    /// # Errors
    ///
    /// Anything acquired before the failure (context, unit registrations,
    /// device stream) is released before the error is returned, and no
    /// [`PipelineEvent::CaptureStopped`] is emitted for the rollback.
    pub async fn start(&self) -> Result<Option<mpsc::Receiver<WireFrame>>, AudioPipelineError> {
        let mut state = self.state.lock().await;
        if matches!(*state, CaptureState::Recording(_)) {
            tracing::debug!("capture already recording, start is a no-op");
            return Ok(None);
        }

        let mut options = ContextOptions::new(self.config.sample_rate);
        if self.config.require_activation {
            options = options.require_activation();
        }
        let context = self.contexts.acquire("capture", options).await?;

        let (frames_tx, frames_rx) = mpsc::channel(self.config.frame_channel_capacity);
        let encoder_handle = self.register_encoder(&context, frames_tx)?;

        let meter_handle = match self.register_meter(&context) {
            Ok(handle) => handle,
            Err(e) => {
                self.registry.unregister(&encoder_handle);
                return Err(e);
            }
        };

        // Units survive across sessions; a new session must not inherit a
        // partial frame or a decayed envelope from the previous one
        self.registry.reset_unit(context.id(), PCM_ENCODER_UNIT);
        self.registry.reset_unit(context.id(), VOLUME_METER_UNIT);

        let (stream, consumer) = match self
            .source
            .open(self.config.sample_rate, self.config.ring_capacity)
            .await
        {
            Ok(opened) => opened,
            Err(e) => {
                tracing::error!("capture start failed, rolling back: {e}");
                self.registry.unregister(&encoder_handle);
                self.registry.unregister(&meter_handle);
                return Err(e);
            }
        };

        let (bridge_stop, stop_rx) = oneshot::channel();
        let bridge = self.spawn_bridge(Arc::clone(&context), consumer, stop_rx);

        *state = CaptureState::Recording(ActiveCapture {
            stream,
            bridge_stop,
            bridge,
            encoder_handle,
            meter_handle,
            context,
        });

        tracing::info!(
            sample_rate = self.config.sample_rate,
            frame_size = self.config.frame_size,
            "capture started"
        );
        (self.callback)(PipelineEvent::CaptureStarted);
        Ok(Some(frames_rx))
    }

    /// Stops capturing and releases the device.
    ///
    /// A no-op when idle. If a `start()` is still initializing, waits for it
    /// to settle and then tears down the session it produced. Emits
    /// [`PipelineEvent::CaptureStopped`] when a session was actually torn
    /// down.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut *state, CaptureState::Idle) {
            CaptureState::Idle => {
                tracing::debug!("capture already idle, stop is a no-op");
            }
            CaptureState::Recording(active) => {
                let context_id = active.context.id().clone();
                self.teardown(active).await;
                tracing::info!(context_id = %context_id, "capture stopped");
                (self.callback)(PipelineEvent::CaptureStopped);
            }
        }
    }

    async fn teardown(&self, mut active: ActiveCapture) {
        // Stop the bridge before the device so the final drain sees a quiet
        // ring buffer
        let _ = active.bridge_stop.send(());
        let _ = (&mut active.bridge).await;
        active.stream.stop();
        self.registry.unregister(&active.encoder_handle);
        self.registry.unregister(&active.meter_handle);
        let _ = self.volume_tx.send(0.0);
    }

    fn register_encoder(
        &self,
        context: &DeviceContext,
        frames_tx: mpsc::Sender<WireFrame>,
    ) -> Result<RegistrationHandle, AudioPipelineError> {
        let stats = Arc::clone(&self.stats);
        self.registry.register(
            context,
            PCM_ENCODER_UNIT,
            &PcmFrameEncoder::definition(self.config.frame_size),
            unit_handler(move |message| {
                if let UnitMessage::Frame(frame) = message {
                    match frames_tx.try_send(frame.to_wire()) {
                        Ok(()) => {
                            stats.frames_encoded.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(_) => {
                            stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!("frame channel full or closed, dropping frame");
                        }
                    }
                }
            }),
        )
    }

    fn register_meter(
        &self,
        context: &DeviceContext,
    ) -> Result<RegistrationHandle, AudioPipelineError> {
        let volume_tx = self.volume_tx.clone();
        self.registry.register(
            context,
            VOLUME_METER_UNIT,
            &VolumeEnvelopeUnit::definition(self.config.volume_update_interval),
            unit_handler(move |message| {
                if let UnitMessage::Volume(v) = message {
                    volume_tx.send_replace(*v);
                }
            }),
        )
    }

    /// Moves samples from the device ring buffer into the processing units
    /// at the configured poll interval.
    fn spawn_bridge(
        &self,
        context: Arc<DeviceContext>,
        mut consumer: HeapCons<f32>,
        mut stop_rx: oneshot::Receiver<()>,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        let stats = Arc::clone(&self.stats);
        let poll = self.config.bridge_poll_interval;

        tokio::spawn(async move {
            let mut scratch = vec![0.0f32; 4096];
            let mut ticker = tokio::time::interval(poll);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        drain(&mut consumer, &mut scratch, &registry, &context, &stats);
                    }
                }
            }
            // Final drain so samples captured just before stop still encode
            drain(&mut consumer, &mut scratch, &registry, &context, &stats);
            tracing::debug!("capture bridge finished");
        })
    }
}

fn drain(
    consumer: &mut HeapCons<f32>,
    scratch: &mut [f32],
    registry: &ProcessingUnitRegistry,
    context: &DeviceContext,
    stats: &CaptureStats,
) {
    loop {
        let n = consumer.pop_slice(scratch);
        if n == 0 {
            break;
        }
        registry.feed(context.id(), PCM_ENCODER_UNIT, &scratch[..n]);
        registry.feed(context.id(), VOLUME_METER_UNIT, &scratch[..n]);
        stats.samples_bridged.fetch_add(n as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::event_callback;
    use crate::frame::quantize;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Harness {
        encoder: CaptureEncoder,
        source: Arc<MockCaptureSource>,
        started: Arc<AtomicUsize>,
        stopped: Arc<AtomicUsize>,
    }

    fn harness(source: MockCaptureSource) -> Harness {
        let source = Arc::new(source);
        let started = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));
        let (sct, spt) = (Arc::clone(&started), Arc::clone(&stopped));
        let encoder = CaptureEncoder::with_source(
            CaptureConfig::default(),
            Arc::new(DeviceContextManager::new()),
            Arc::new(ProcessingUnitRegistry::new()),
            event_callback(move |event| match event {
                PipelineEvent::CaptureStarted => {
                    sct.fetch_add(1, Ordering::SeqCst);
                }
                PipelineEvent::CaptureStopped => {
                    spt.fetch_add(1, Ordering::SeqCst);
                }
                _ => {}
            }),
            Arc::clone(&source) as Arc<dyn CaptureSource>,
        );
        Harness {
            encoder,
            source,
            started,
            stopped,
        }
    }

    fn decode_samples(frame: &WireFrame) -> Vec<i16> {
        frame
            .decode()
            .unwrap()
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect()
    }

    async fn recv_frame(frames: &mut mpsc::Receiver<WireFrame>) -> WireFrame {
        tokio::time::timeout(Duration::from_secs(1), frames.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("frame channel closed")
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_silent() {
        let h = harness(MockCaptureSource::new());
        h.encoder.stop().await;
        assert_eq!(h.stopped.load(Ordering::SeqCst), 0);
        assert!(!h.encoder.is_recording().await);
    }

    #[tokio::test]
    async fn test_volume_starts_at_zero() {
        let h = harness(MockCaptureSource::new());
        assert_eq!(*h.encoder.volume().borrow(), 0.0);
    }

    #[tokio::test]
    async fn test_concurrent_starts_open_source_once() {
        // The open delay keeps the first start mid-initialization while the
        // second arrives
        let h = harness(MockCaptureSource::with_open_delay(Duration::from_millis(
            50,
        )));

        let (first, second) = tokio::join!(h.encoder.start(), h.encoder.start());
        let outcomes = [first.unwrap(), second.unwrap()];

        // Exactly one acquisition, one started signal, one frame channel
        assert_eq!(outcomes.iter().filter(|o| o.is_some()).count(), 1);
        assert_eq!(h.source.opens(), 1);
        assert_eq!(h.started.load(Ordering::SeqCst), 1);
        assert!(h.encoder.is_recording().await);

        h.encoder.stop().await;
        assert_eq!(h.stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_frames_flow_from_source_to_channel() {
        let h = harness(MockCaptureSource::new());
        let mut frames = h.encoder.start().await.unwrap().expect("first start");

        assert_eq!(h.source.push(&vec![0.5; 2048]), 2048);
        let frame = recv_frame(&mut frames).await;

        assert_eq!(frame.mime_type, "audio/pcm;rate=16000");
        let samples = decode_samples(&frame);
        assert_eq!(samples.len(), 2048);
        assert!(samples.iter().all(|&s| s == quantize(0.5)));
        assert!(h.encoder.stats().frames_encoded() >= 1);

        // The meter runs on its own dispatcher; give it a moment
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(*h.encoder.volume().borrow() > 0.0);

        h.encoder.stop().await;
        assert!(h.source.stream_stopped());
        assert_eq!(h.stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_restart_discards_partial_frame() {
        let h = harness(MockCaptureSource::new());

        // First session ends with a partial frame in the encoder
        let _frames = h.encoder.start().await.unwrap().expect("first start");
        h.source.push(&vec![0.5; 1000]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.encoder.stop().await;

        // The next session's first frame must contain only its own samples
        let mut frames = h.encoder.start().await.unwrap().expect("restart");
        h.source.push(&vec![0.25; 2048]);
        let frame = recv_frame(&mut frames).await;

        let samples = decode_samples(&frame);
        assert_eq!(samples.len(), 2048);
        assert!(samples.iter().all(|&s| s == quantize(0.25)));
    }

    #[tokio::test]
    #[ignore = "requires audio hardware"]
    async fn test_start_and_stop_round_trip_on_device() {
        let encoder = CaptureEncoder::new(
            CaptureConfig::default(),
            Arc::new(DeviceContextManager::new()),
            Arc::new(ProcessingUnitRegistry::new()),
            event_callback(|_| {}),
        );
        let frames = encoder.start().await.unwrap();
        assert!(frames.is_some());
        assert!(encoder.is_recording().await);

        // Second start is a no-op
        assert!(encoder.start().await.unwrap().is_none());

        encoder.stop().await;
        assert!(!encoder.is_recording().await);
    }
}

//! Render seam between the scheduler and the output device.
//!
//! The scheduler talks to a [`RenderSink`]: a device clock plus the ability
//! to schedule sample buffers at absolute times on that clock, with gain
//! control layered on top. [`CpalRenderSink`] renders through the default
//! output device; [`ManualRenderSink`] is a hardware-free stand-in whose
//! clock is advanced by hand, used to test scheduling behavior.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, StreamConfig as CpalStreamConfig};
use tokio::sync::{mpsc, oneshot};

use crate::error::AudioPipelineError;

use super::gain::GainStage;

/// One-shot observer fired when a scheduled buffer finishes rendering.
pub type EndedObserver = Box<dyn FnOnce() + Send + 'static>;

/// Clock, scheduling, and gain surface the scheduler renders through.
pub trait RenderSink: Send + Sync {
    /// Sample rate of the render clock.
    fn sample_rate(&self) -> u32;

    /// Current position of the device clock.
    fn now(&self) -> Duration;

    /// Schedules `samples` to start rendering at `start` on the device
    /// clock. `on_ended` fires once the buffer has fully rendered.
    ///
    /// # Errors
    ///
    /// Returns [`AudioPipelineError::PlaybackScheduling`] if the buffer
    /// cannot be materialized; the caller substitutes silence to keep the
    /// timeline intact.
    fn schedule(
        &self,
        samples: Vec<f32>,
        start: Duration,
        on_ended: Option<EndedObserver>,
    ) -> Result<(), AudioPipelineError>;

    /// Sets the output gain immediately.
    fn set_gain(&self, gain: f32);

    /// Ramps the output gain linearly to `target` over `over`.
    fn ramp_gain_to(&self, target: f32, over: Duration);

    /// Discards everything still scheduled (without firing their observers)
    /// and restores unity gain.
    ///
    /// The teardown step after a stop fade: pending audio is orphaned and
    /// the gain path comes back fresh for the next stream.
    fn reset_gain_stage(&self);
}

struct ScheduledBuffer {
    start_frame: u64,
    samples: Vec<f32>,
    on_ended: Option<EndedObserver>,
}

struct SinkShared {
    sample_rate: u32,
    clock_frames: AtomicU64,
    gain: GainStage,
    scheduled: Mutex<Vec<ScheduledBuffer>>,
    ended_tx: mpsc::UnboundedSender<EndedObserver>,
}

/// Renders scheduled buffers through the default CPAL output device.
///
/// The output stream lives on a dedicated thread (it is `!Send`); the
/// callback mixes every scheduled buffer that overlaps the block against a
/// sample-counter clock, applies the gain stage, and posts ended
/// notifications over a channel drained on the runtime.
pub struct CpalRenderSink {
    shared: Arc<SinkShared>,
    stop_tx: Option<std::sync::mpsc::Sender<()>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl CpalRenderSink {
    /// Opens the default output device at `sample_rate` and starts the
    /// render stream.
    ///
    /// # Errors
    ///
    /// Returns [`AudioPipelineError::Backend`] if no output device is
    /// available or the stream cannot be built or started.
    pub async fn open(sample_rate: u32) -> Result<Self, AudioPipelineError> {
        let (ended_tx, mut ended_rx) = mpsc::unbounded_channel::<EndedObserver>();
        let shared = Arc::new(SinkShared {
            sample_rate,
            clock_frames: AtomicU64::new(0),
            gain: GainStage::new(),
            scheduled: Mutex::new(Vec::new()),
            ended_tx,
        });

        // Observer bodies run on the runtime, never on the render thread
        tokio::spawn(async move {
            while let Some(observer) = ended_rx.recv().await {
                observer();
            }
        });

        let (init_tx, init_rx) = oneshot::channel::<Result<(), AudioPipelineError>>();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

        let thread_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("render-stream".to_string())
            .spawn(move || {
                let stream = match build_output_stream(sample_rate, thread_shared) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = init_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = init_tx.send(Err(AudioPipelineError::Backend(e.to_string())));
                    return;
                }
                let _ = init_tx.send(Ok(()));
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| {
                AudioPipelineError::Backend(format!("failed to spawn render thread: {e}"))
            })?;

        match init_rx.await {
            Ok(Ok(())) => Ok(Self {
                shared,
                stop_tx: Some(stop_tx),
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(AudioPipelineError::Backend(
                    "render thread exited before reporting".to_string(),
                ))
            }
        }
    }
}

impl RenderSink for CpalRenderSink {
    fn sample_rate(&self) -> u32 {
        self.shared.sample_rate
    }

    fn now(&self) -> Duration {
        let frames = self.shared.clock_frames.load(Ordering::Acquire);
        Duration::from_secs_f64(frames as f64 / self.shared.sample_rate as f64)
    }

    fn schedule(
        &self,
        samples: Vec<f32>,
        start: Duration,
        on_ended: Option<EndedObserver>,
    ) -> Result<(), AudioPipelineError> {
        let start_frame = (start.as_secs_f64() * self.shared.sample_rate as f64).round() as u64;
        let mut scheduled = self
            .shared
            .scheduled
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        scheduled.push(ScheduledBuffer {
            start_frame,
            samples,
            on_ended,
        });
        Ok(())
    }

    fn set_gain(&self, gain: f32) {
        self.shared.gain.set(gain);
    }

    fn ramp_gain_to(&self, target: f32, over: Duration) {
        self.shared.gain.ramp_to(target, over, self.shared.sample_rate);
    }

    fn reset_gain_stage(&self) {
        let mut scheduled = self
            .shared
            .scheduled
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        scheduled.clear();
        self.shared.gain.set(1.0);
    }
}

impl Drop for CpalRenderSink {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn build_output_stream(
    sample_rate: u32,
    shared: Arc<SinkShared>,
) -> Result<cpal::Stream, AudioPipelineError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| AudioPipelineError::Backend("no default output device".to_string()))?;

    let supported = device
        .default_output_config()
        .map_err(|e| AudioPipelineError::Backend(e.to_string()))?;
    if supported.sample_format() != SampleFormat::F32 {
        return Err(AudioPipelineError::Backend(format!(
            "unsupported output sample format: {:?}",
            supported.sample_format()
        )));
    }
    let channels = supported.channels();

    let config = CpalStreamConfig {
        channels,
        sample_rate: SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let channels = channels as usize;
    let mut mono = Vec::new();
    device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                render_block(&shared, data, channels, &mut mono);
            },
            |err| {
                tracing::error!("render stream error: {err}");
            },
            None,
        )
        .map_err(|e| AudioPipelineError::Backend(e.to_string()))
}

/// Mixes every scheduled buffer overlapping this block, applies gain, and
/// fans the mono mix out to the device channels.
fn render_block(shared: &SinkShared, data: &mut [f32], channels: usize, mono: &mut Vec<f32>) {
    let frames = data.len() / channels;
    let block_start = shared
        .clock_frames
        .fetch_add(frames as u64, Ordering::AcqRel);
    let block_end = block_start + frames as u64;

    mono.clear();
    mono.resize(frames, 0.0);

    let mut scheduled = shared.scheduled.lock().unwrap_or_else(|e| e.into_inner());
    for buffer in scheduled.iter() {
        let buf_start = buffer.start_frame;
        let buf_end = buf_start + buffer.samples.len() as u64;
        if buf_end <= block_start || buf_start >= block_end {
            continue;
        }
        let from = buf_start.max(block_start);
        let to = buf_end.min(block_end);
        for frame in from..to {
            mono[(frame - block_start) as usize] += buffer.samples[(frame - buf_start) as usize];
        }
    }
    scheduled.retain_mut(|buffer| {
        let finished = buffer.start_frame + buffer.samples.len() as u64 <= block_end;
        if finished {
            if let Some(observer) = buffer.on_ended.take() {
                let _ = shared.ended_tx.send(observer);
            }
        }
        !finished
    });
    drop(scheduled);

    shared.gain.apply(mono);

    for (frame, sample) in mono.iter().enumerate() {
        for channel in 0..channels {
            data[frame * channels + channel] = *sample;
        }
    }
}

/// A record of one `schedule()` call on a [`ManualRenderSink`].
#[derive(Debug, Clone)]
pub struct ScheduleRecord {
    /// Scheduled start time on the sink clock.
    pub start: Duration,
    /// The scheduled samples.
    pub samples: Vec<f32>,
}

impl ScheduleRecord {
    /// Duration of the scheduled buffer at the sink's sample rate.
    pub fn duration(&self, sample_rate: u32) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / sample_rate as f64)
    }

    /// `true` if every scheduled sample is zero.
    pub fn is_silent(&self) -> bool {
        self.samples.iter().all(|&s| s == 0.0)
    }
}

struct ManualScheduled {
    start: Duration,
    end: Duration,
    on_ended: Option<EndedObserver>,
}

struct ManualState {
    now: Duration,
    pending: Vec<ManualScheduled>,
    log: Vec<ScheduleRecord>,
}

/// Hardware-free render sink with a manually advanced clock.
///
/// `schedule()` records every call; [`advance_to`](ManualRenderSink::advance_to)
/// moves the clock and fires ended observers for buffers that finished.
/// Gain ramps settle immediately so tests can assert on the final value.
pub struct ManualRenderSink {
    sample_rate: u32,
    state: Mutex<ManualState>,
    gain: GainStage,
    fail_next_schedule: AtomicBool,
}

impl ManualRenderSink {
    /// Creates a sink with its clock at zero.
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            state: Mutex::new(ManualState {
                now: Duration::ZERO,
                pending: Vec::new(),
                log: Vec::new(),
            }),
            gain: GainStage::new(),
            fail_next_schedule: AtomicBool::new(false),
        }
    }

    /// Advances the clock to `now`, firing ended observers for every buffer
    /// whose end time has passed, in start order.
    pub fn advance_to(&self, now: Duration) {
        let mut fired = Vec::new();
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.now = now;
            state
                .pending
                .sort_by_key(|scheduled| (scheduled.start, scheduled.end));
            state.pending.retain_mut(|scheduled| {
                if scheduled.end <= now {
                    if let Some(observer) = scheduled.on_ended.take() {
                        fired.push(observer);
                    }
                    false
                } else {
                    true
                }
            });
        }
        // Observers run outside the lock; they may call back into the sink
        for observer in fired {
            observer();
        }
    }

    /// Advances the clock by `delta`.
    pub fn advance_by(&self, delta: Duration) {
        let now = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.now + delta
        };
        self.advance_to(now);
    }

    /// All `schedule()` calls so far, in call order.
    pub fn records(&self) -> Vec<ScheduleRecord> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.log.clone()
    }

    /// Number of buffers scheduled but not yet finished.
    pub fn pending(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.pending.len()
    }

    /// Current gain value.
    pub fn gain(&self) -> f32 {
        self.gain.current()
    }

    /// Makes the next `schedule()` call fail, to exercise the silent-chunk
    /// substitution path.
    pub fn fail_next_schedule(&self) {
        self.fail_next_schedule.store(true, Ordering::SeqCst);
    }
}

impl RenderSink for ManualRenderSink {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn now(&self) -> Duration {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.now
    }

    fn schedule(
        &self,
        samples: Vec<f32>,
        start: Duration,
        on_ended: Option<EndedObserver>,
    ) -> Result<(), AudioPipelineError> {
        if self.fail_next_schedule.swap(false, Ordering::SeqCst) {
            return Err(AudioPipelineError::scheduling("injected schedule failure"));
        }
        let end = start + Duration::from_secs_f64(samples.len() as f64 / self.sample_rate as f64);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.pending.push(ManualScheduled {
            start,
            end,
            on_ended,
        });
        state.log.push(ScheduleRecord { start, samples });
        Ok(())
    }

    fn set_gain(&self, gain: f32) {
        self.gain.set(gain);
    }

    fn ramp_gain_to(&self, target: f32, _over: Duration) {
        // Settles immediately so tests observe the final value
        self.gain.set(target);
    }

    fn reset_gain_stage(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.pending.clear();
        drop(state);
        self.gain.set(1.0);
    }
}

//! The receive/schedule/render half of the pipeline.
//!
//! [`PlaybackScheduler`] is a handle to an actor task that owns the playback
//! session: the chunk queue, the residual accumulator, and the monotonic
//! scheduling cursor. Inbound audio is normalized, sliced into fixed-size
//! chunks, and scheduled against the sink clock ahead of time within a
//! lookahead window. Timing is driven by the command channel plus one-shot
//! re-armed timers, never a tight loop.

mod gain;
mod sink;

pub use gain::GainStage;
pub use sink::{CpalRenderSink, EndedObserver, ManualRenderSink, RenderSink, ScheduleRecord};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::PlaybackConfig;
use crate::context::{ContextOptions, DeviceContext, DeviceContextManager};
use crate::error::AudioPipelineError;
use crate::event::{EventCallback, PipelineEvent};
use crate::frame::{PlaybackChunk, WireFrame};
use crate::meter::VolumeEnvelopeUnit;
use crate::registry::{unit_handler, ProcessingUnitRegistry, RegistrationHandle, UnitMessage};

/// Registry name of the playback volume meter unit.
pub const PLAYBACK_METER_UNIT: &str = "volume-meter";

/// Lifecycle of a playback session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    /// No stream has started.
    Idle,
    /// Data has arrived; the initial buffering delay is running.
    Buffering,
    /// Chunks are scheduled and rendering.
    Playing,
    /// The stream is marked complete and the last scheduled audio is still
    /// rendering out.
    Draining,
    /// The stream finished (naturally or by `stop()`).
    Complete,
}

/// Counters for a playback session. Cumulative across streams.
#[derive(Debug, Default)]
pub struct PlaybackStats {
    chunks_scheduled: AtomicU64,
    silent_substitutions: AtomicU64,
    payloads_skipped: AtomicU64,
    samples_ingested: AtomicU64,
}

impl PlaybackStats {
    /// Chunks handed to the render sink.
    pub fn chunks_scheduled(&self) -> u64 {
        self.chunks_scheduled.load(Ordering::Relaxed)
    }

    /// Silent chunks substituted for failed schedules.
    pub fn silent_substitutions(&self) -> u64 {
        self.silent_substitutions.load(Ordering::Relaxed)
    }

    /// Inbound payloads skipped as malformed.
    pub fn payloads_skipped(&self) -> u64 {
        self.payloads_skipped.load(Ordering::Relaxed)
    }

    /// Normalized samples accepted into the session.
    pub fn samples_ingested(&self) -> u64 {
        self.samples_ingested.load(Ordering::Relaxed)
    }
}

enum Command {
    IngestWire(WireFrame),
    IngestBytes(Vec<u8>),
    IngestSamples(Vec<f32>),
    MarkComplete,
    Stop,
    Resume,
    GainResetDue(u64),
    ChunkEnded(u64),
    Shutdown,
}

/// Handle to the playback actor.
///
/// Cheap to use from any task; every method posts a command to the actor.
/// Dropping the handle without calling [`shutdown`](Self::shutdown) leaves
/// the actor to finish draining its channel and exit.
pub struct PlaybackScheduler {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<PlaybackState>,
    volume_rx: watch::Receiver<f32>,
    stats: Arc<PlaybackStats>,
    registry: Arc<ProcessingUnitRegistry>,
    meter_handle: Mutex<Option<RegistrationHandle>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PlaybackScheduler {
    /// Spawns the playback actor against the given render sink.
    ///
    /// Acquires the playback device context and loads the volume meter unit
    /// on it before the actor starts.
    ///
    /// # Errors
    ///
    /// Returns an error if the context cannot be acquired or the meter unit
    /// fails to load.
    pub async fn spawn(
        config: PlaybackConfig,
        contexts: Arc<DeviceContextManager>,
        registry: Arc<ProcessingUnitRegistry>,
        sink: Arc<dyn RenderSink>,
        callback: EventCallback,
    ) -> Result<Self, AudioPipelineError> {
        let mut options = ContextOptions::new(config.sample_rate);
        if config.require_activation {
            options = options.require_activation();
        }
        let context = contexts.acquire("playback", options).await?;

        let (volume_tx, volume_rx) = watch::channel(0.0);
        let meter_handle = registry.register(
            &context,
            PLAYBACK_METER_UNIT,
            &VolumeEnvelopeUnit::definition(config.volume_update_interval),
            unit_handler(move |message| {
                if let UnitMessage::Volume(v) = message {
                    volume_tx.send_replace(*v);
                }
            }),
        )?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(PlaybackState::Idle);
        let stats = Arc::new(PlaybackStats::default());

        let session = Session {
            config,
            context,
            registry: Arc::clone(&registry),
            sink,
            callback,
            cmd_tx: cmd_tx.clone(),
            state_tx,
            stats: Arc::clone(&stats),
            queue: VecDeque::new(),
            residual: Vec::new(),
            cursor: Duration::ZERO,
            started: false,
            complete: false,
            completion_fired: false,
            last_scheduled: None,
            next_chunk_id: 1,
            stop_epoch: 0,
        };
        let task = tokio::spawn(run_actor(session, cmd_rx));

        Ok(Self {
            cmd_tx,
            state_rx,
            volume_rx,
            stats,
            registry,
            meter_handle: Mutex::new(Some(meter_handle)),
            task: Mutex::new(Some(task)),
        })
    }

    /// Spawns the actor rendering through the default output device.
    pub async fn spawn_with_device(
        config: PlaybackConfig,
        contexts: Arc<DeviceContextManager>,
        registry: Arc<ProcessingUnitRegistry>,
        callback: EventCallback,
    ) -> Result<Self, AudioPipelineError> {
        let sink = Arc::new(CpalRenderSink::open(config.sample_rate).await?);
        Self::spawn(config, contexts, registry, sink, callback).await
    }

    /// Ingests one wire frame of base64-encoded little-endian 16-bit PCM.
    pub fn ingest_wire(&self, frame: WireFrame) {
        let _ = self.cmd_tx.send(Command::IngestWire(frame));
    }

    /// Ingests raw little-endian 16-bit PCM bytes.
    pub fn ingest_bytes(&self, bytes: Vec<u8>) {
        let _ = self.cmd_tx.send(Command::IngestBytes(bytes));
    }

    /// Ingests already-normalized samples.
    pub fn ingest_samples(&self, samples: Vec<f32>) {
        let _ = self.cmd_tx.send(Command::IngestSamples(samples));
    }

    /// Marks the inbound stream complete: the residual is flushed as a short
    /// final chunk and completion fires once everything scheduled has
    /// rendered (immediately if nothing is pending).
    pub fn mark_stream_complete(&self) {
        let _ = self.cmd_tx.send(Command::MarkComplete);
    }

    /// Interrupts playback: pending audio is discarded and the output fades
    /// to silence over the configured fade duration.
    pub fn stop(&self) {
        let _ = self.cmd_tx.send(Command::Stop);
    }

    /// Resumes after an interruption: restores gain, resets the scheduling
    /// cursor, and schedules whatever data has accumulated.
    pub fn resume(&self) {
        let _ = self.cmd_tx.send(Command::Resume);
    }

    /// Current session state.
    pub fn state(&self) -> PlaybackState {
        *self.state_rx.borrow()
    }

    /// Watch channel of session state transitions.
    pub fn state_watch(&self) -> watch::Receiver<PlaybackState> {
        self.state_rx.clone()
    }

    /// Watch channel carrying the playback loudness envelope.
    pub fn volume(&self) -> watch::Receiver<f32> {
        self.volume_rx.clone()
    }

    /// Session counters.
    pub fn stats(&self) -> &PlaybackStats {
        &self.stats
    }

    /// Stops the actor and waits for it to exit, then releases the meter
    /// registration so the unit no longer feeds this handle's watch channel.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            let _ = task.await;
        }
        if let Some(handle) = self.meter_handle.lock().await.take() {
            self.registry.unregister(&handle);
        }
    }
}

struct Session {
    config: PlaybackConfig,
    context: Arc<DeviceContext>,
    registry: Arc<ProcessingUnitRegistry>,
    sink: Arc<dyn RenderSink>,
    callback: EventCallback,
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_tx: watch::Sender<PlaybackState>,
    stats: Arc<PlaybackStats>,
    /// Chunks sliced and waiting to be scheduled, FIFO.
    queue: VecDeque<PlaybackChunk>,
    /// Samples not yet filling a whole chunk.
    residual: Vec<f32>,
    /// Next free point on the sink clock. Non-decreasing within a stream.
    cursor: Duration,
    started: bool,
    complete: bool,
    completion_fired: bool,
    /// Id of the most recently scheduled chunk; its ended observer is the
    /// deferred completion trigger.
    last_scheduled: Option<u64>,
    next_chunk_id: u64,
    /// Bumped whenever a new stream supersedes an interruption; a deferred
    /// gain reset carrying an older value is stale and ignored.
    stop_epoch: u64,
}

async fn run_actor(mut session: Session, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
    loop {
        let deadline = session.next_wakeup();
        tokio::select! {
            command = cmd_rx.recv() => {
                match command {
                    None | Some(Command::Shutdown) => break,
                    Some(command) => session.handle(command),
                }
            }
            () = sleep_until_opt(deadline), if deadline.is_some() => {
                session.pass();
            }
        }
    }
    tracing::debug!("playback actor finished");
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Session {
    fn handle(&mut self, command: Command) {
        match command {
            Command::IngestWire(frame) => match frame.decode() {
                Ok(bytes) => self.ingest_bytes(bytes),
                Err(e) => self.skip_payload(e.to_string()),
            },
            Command::IngestBytes(bytes) => self.ingest_bytes(bytes),
            Command::IngestSamples(samples) => self.ingest_samples(samples),
            Command::MarkComplete => self.mark_complete(),
            Command::Stop => self.stop(),
            Command::Resume => self.resume(),
            Command::GainResetDue(epoch) => {
                if epoch != self.stop_epoch {
                    // A resume or fresh stream already superseded this stop
                    return;
                }
                self.sink.reset_gain_stage();
                self.last_scheduled = None;
                self.set_state(PlaybackState::Complete);
            }
            Command::ChunkEnded(id) => {
                if self.last_scheduled == Some(id) {
                    self.last_scheduled = None;
                }
                self.check_completion();
            }
            Command::Shutdown => {}
        }
    }

    fn ingest_bytes(&mut self, mut bytes: Vec<u8>) {
        if bytes.len() % 2 != 0 {
            self.skip_payload("odd byte count, dropping trailing byte".to_string());
            bytes.pop();
        }
        let samples: Vec<f32> = bytes
            .chunks_exact(2)
            .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0)
            .collect();
        self.ingest_samples(samples);
    }

    fn ingest_samples(&mut self, samples: Vec<f32>) {
        if samples.is_empty() {
            return;
        }

        // Data after a completed stream starts a fresh one; any deferred
        // gain reset from a stop belongs to the old stream
        if self.complete {
            self.complete = false;
            self.completion_fired = false;
            self.started = false;
            self.last_scheduled = None;
            self.stop_epoch += 1;
            self.sink.reset_gain_stage();
        }

        self.stats
            .samples_ingested
            .fetch_add(samples.len() as u64, Ordering::Relaxed);
        self.residual.extend_from_slice(&samples);

        let chunk_size = self.config.chunk_size;
        while self.residual.len() >= chunk_size {
            let rest = self.residual.split_off(chunk_size);
            let chunk = PlaybackChunk::new(std::mem::replace(&mut self.residual, rest));
            self.queue.push_back(chunk);
        }

        if !self.started && !self.queue.is_empty() {
            self.begin_stream();
        }
        self.pass();
    }

    fn begin_stream(&mut self) {
        self.cursor = self.sink.now() + self.config.initial_buffering_delay;
        self.started = true;
        self.set_state(PlaybackState::Buffering);
        tracing::debug!(cursor = ?self.cursor, "stream buffering");
    }

    fn mark_complete(&mut self) {
        if !self.residual.is_empty() {
            let tail = std::mem::take(&mut self.residual);
            self.queue.push_back(PlaybackChunk::new(tail));
            if !self.started {
                self.begin_stream();
            }
        }
        self.complete = true;
        tracing::debug!(queued = self.queue.len(), "stream marked complete");
        self.pass();
    }

    fn stop(&mut self) {
        self.queue.clear();
        self.residual.clear();
        self.complete = true;

        if self.started && !self.completion_fired {
            // Interruption is not a natural end of stream: mark the session
            // terminal here so no ended observer can fire a completion
            self.completion_fired = true;
            self.sink.ramp_gain_to(0.0, self.config.fade_duration);
            self.set_state(PlaybackState::Draining);
            (self.callback)(PipelineEvent::PlaybackInterrupted);
            tracing::info!("playback interrupted, fading out");

            // Reset the gain path once the fade has fully rendered
            let cmd_tx = self.cmd_tx.clone();
            let epoch = self.stop_epoch;
            let reset_after = self.config.fade_duration * 2;
            tokio::spawn(async move {
                tokio::time::sleep(reset_after).await;
                let _ = cmd_tx.send(Command::GainResetDue(epoch));
            });
        } else if !self.completion_fired {
            // Nothing audible to fade; settle the terminal state quietly
            self.completion_fired = true;
            self.set_state(PlaybackState::Complete);
        }
    }

    fn resume(&mut self) {
        if let Err(e) = self.context.resume() {
            tracing::warn!("playback context resume failed: {e}");
        }
        self.complete = false;
        self.completion_fired = false;
        self.cursor = self.sink.now() + self.config.initial_buffering_delay;
        self.started = true;
        self.last_scheduled = None;
        // Supersede any deferred reset from the stop and restore the gain
        // path now, dropping whatever was still fading
        self.stop_epoch += 1;
        self.sink.reset_gain_stage();
        self.set_state(if self.queue.is_empty() {
            PlaybackState::Buffering
        } else {
            PlaybackState::Playing
        });
        (self.callback)(PipelineEvent::PlaybackResumed);
        tracing::info!("playback resumed");
        self.pass();
    }

    /// One scheduling pass: pop chunks while the cursor is inside the
    /// lookahead window, meter them, and hand them to the sink.
    fn pass(&mut self) {
        if !self.started {
            self.check_completion();
            return;
        }

        let horizon = self.sink.now() + self.config.lookahead;
        while self.cursor < horizon {
            let Some(chunk) = self.queue.pop_front() else {
                break;
            };
            self.schedule_chunk(chunk);
        }
        self.check_completion();
    }

    fn schedule_chunk(&mut self, chunk: PlaybackChunk) {
        let rate = self.config.sample_rate;
        let duration = chunk.duration(rate);
        // Catch-up: never schedule into the past
        let start = self.cursor.max(self.sink.now());
        let id = self.next_chunk_id;
        self.next_chunk_id += 1;

        self.registry.feed_all(self.context.id(), &chunk.samples);

        let len = chunk.samples.len();
        match self.sink.schedule(chunk.samples, start, self.observer(id)) {
            Ok(()) => {
                self.stats.chunks_scheduled.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                // Substitute silence of the same duration so the timeline
                // stays intact
                tracing::warn!("chunk schedule failed, substituting silence: {e}");
                self.stats
                    .silent_substitutions
                    .fetch_add(1, Ordering::Relaxed);
                (self.callback)(PipelineEvent::SilentChunkSubstituted {
                    duration_ms: duration.as_millis() as u64,
                });
                if let Err(e) = self.sink.schedule(vec![0.0; len], start, self.observer(id)) {
                    tracing::error!("silent substitution also failed: {e}");
                    self.cursor = start + duration;
                    self.last_scheduled = None;
                    return;
                }
            }
        }

        self.cursor = start + duration;
        self.last_scheduled = Some(id);
        self.set_state(PlaybackState::Playing);
    }

    fn observer(&self, id: u64) -> Option<EndedObserver> {
        let cmd_tx = self.cmd_tx.clone();
        Some(Box::new(move || {
            let _ = cmd_tx.send(Command::ChunkEnded(id));
        }))
    }

    fn check_completion(&mut self) {
        if !self.complete || self.completion_fired {
            return;
        }
        if self.queue.is_empty() && self.residual.is_empty() && self.last_scheduled.is_none() {
            self.completion_fired = true;
            self.set_state(PlaybackState::Complete);
            (self.callback)(PipelineEvent::PlaybackComplete);
            tracing::info!("playback complete");
        } else if self.queue.is_empty() && self.last_scheduled.is_some() {
            self.set_state(PlaybackState::Draining);
        }
    }

    fn next_wakeup(&self) -> Option<Instant> {
        if !self.started || self.completion_fired {
            return None;
        }
        if self.queue.is_empty() {
            if self.complete {
                // Completion arrives through the ended observer
                return None;
            }
            return Some(Instant::now() + self.config.poll_interval);
        }
        let until_due = self
            .cursor
            .saturating_sub(self.config.lookahead)
            .saturating_sub(self.sink.now())
            .max(Duration::from_millis(1));
        Some(Instant::now() + until_due)
    }

    fn skip_payload(&mut self, reason: String) {
        self.stats.payloads_skipped.fetch_add(1, Ordering::Relaxed);
        tracing::warn!("inbound payload skipped: {reason}");
        (self.callback)(PipelineEvent::PayloadSkipped { reason });
    }

    fn set_state(&mut self, state: PlaybackState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }
}

//! # duplex-audio
//!
//! **Note:** This crate is under active development. The API may change before 1.0.
//!
//! Duplex real-time audio pipeline: microphone capture encoded into
//! wire-ready PCM frames in one direction, streamed PCM scheduled for
//! gapless playback in the other.
//!
//! `duplex-audio` captures via CPAL, quantizes into fixed-size 16-bit
//! frames with a live volume envelope, and on the receive side slices
//! inbound PCM into chunks scheduled back-to-back against the output
//! device clock, with buffering, fade-out interruption, and resume.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use duplex_audio::{
//!     event_callback, CaptureConfig, CaptureEncoder, DeviceContextManager,
//!     PlaybackConfig, PlaybackScheduler, ProcessingUnitRegistry,
//! };
//! use std::sync::Arc;
//!
//! let contexts = Arc::new(DeviceContextManager::new());
//! let registry = Arc::new(ProcessingUnitRegistry::new());
//! let events = event_callback(|e| tracing::info!(?e, "pipeline event"));
//!
//! // Outbound: microphone -> wire frames
//! let capture = CaptureEncoder::new(
//!     CaptureConfig::default(),
//!     Arc::clone(&contexts),
//!     Arc::clone(&registry),
//!     Arc::clone(&events),
//! );
//! let mut frames = capture.start().await?.expect("first start");
//! tokio::spawn(async move {
//!     while let Some(frame) = frames.recv().await {
//!         // Ship frame.data to the collaborator
//!     }
//! });
//!
//! // Inbound: wire frames -> speakers
//! let playback = PlaybackScheduler::spawn_with_device(
//!     PlaybackConfig::default(),
//!     contexts,
//!     registry,
//!     events,
//! )
//! .await?;
//! playback.ingest_bytes(incoming_pcm);
//! playback.mark_stream_complete();
//! ```
//!
//! ## Architecture
//!
//! Both directions keep a strict thread boundary:
//!
//! - **CPAL threads**: real-time callbacks that never block - capture pushes
//!   into a lock-free ring buffer, render mixes pre-scheduled buffers
//! - **Tokio runtime**: the capture bridge, the playback actor, and unit
//!   dispatch all run as tasks in the control domain
//! - **Processing units**: per-context, load-once sample routines (PCM
//!   encoder, volume meter) with fan-out to any number of subscribers
#![warn(missing_docs)]
// Audio code requires intentional numeric casts between sample formats
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_lossless
)]
#![allow(clippy::unwrap_used)]
// These doc lints are too strict for internal implementation details
#![allow(clippy::missing_panics_doc, clippy::missing_errors_doc)]

pub mod capture;
mod config;
mod context;
mod error;
mod event;
mod frame;
mod meter;
pub mod playback;
mod registry;

pub use capture::{CaptureEncoder, CaptureStats, PcmFrameEncoder};
pub use config::{CaptureConfig, PlaybackConfig};
pub use context::{ActivationGate, ContextId, ContextOptions, DeviceContext, DeviceContextManager};
pub use error::AudioPipelineError;
pub use event::{event_callback, EventCallback, PipelineEvent};
pub use frame::{dequantize, quantize, PcmFrame, PlaybackChunk, WireFrame};
pub use meter::VolumeEnvelopeUnit;
pub use playback::{ManualRenderSink, PlaybackScheduler, PlaybackState, PlaybackStats, RenderSink};
pub use registry::{
    unit_handler, ProcessingUnit, ProcessingUnitRegistry, RegistrationHandle, UnitDefinition,
    UnitHandler, UnitMessage,
};

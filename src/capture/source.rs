//! Capture source seam.
//!
//! A [`CaptureSource`] is anything that can open a stream of normalized
//! samples into a ring buffer: the default CPAL input device in production,
//! [`MockCaptureSource`](super::MockCaptureSource) in tests. The encoder
//! drives the session lifecycle through this trait so its start/stop
//! semantics can be exercised without hardware.

use async_trait::async_trait;
use ringbuf::HeapCons;

use crate::error::AudioPipelineError;

use super::device;

/// A handle keeping an open capture stream alive.
///
/// Capture continues while the handle is held; `stop()` (or drop) releases
/// the underlying device.
pub trait CaptureStream: Send {
    /// Stops the stream and releases its resources.
    fn stop(&mut self);
}

/// A source of normalized capture samples.
///
/// Implementations take `&self`; use interior mutability if `open` needs
/// state. `open` is called at most once per session, under the encoder's
/// session lock.
#[async_trait]
pub trait CaptureSource: Send + Sync {
    /// Opens a mono capture stream at `sample_rate` feeding a ring buffer of
    /// `ring_capacity` samples.
    ///
    /// # Errors
    ///
    /// Returns [`AudioPipelineError::Permission`] if the device is denied or
    /// unsupported, [`AudioPipelineError::Backend`] for other failures.
    async fn open(
        &self,
        sample_rate: u32,
        ring_capacity: usize,
    ) -> Result<(Box<dyn CaptureStream>, HeapCons<f32>), AudioPipelineError>;
}

/// The default input device as a capture source.
#[derive(Debug, Default)]
pub struct DeviceCaptureSource;

#[async_trait]
impl CaptureSource for DeviceCaptureSource {
    async fn open(
        &self,
        sample_rate: u32,
        ring_capacity: usize,
    ) -> Result<(Box<dyn CaptureStream>, HeapCons<f32>), AudioPipelineError> {
        let (stream, consumer) = device::open_default_capture(sample_rate, ring_capacity).await?;
        Ok((Box::new(stream), consumer))
    }
}

//! Mock capture source for testing without hardware.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ringbuf::traits::{Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

use crate::error::AudioPipelineError;

use super::source::{CaptureSource, CaptureStream};

/// A capture source whose samples are pushed by the test instead of a
/// device.
///
/// Suitable for CI: `open` hands out the consumer half of a fresh ring
/// buffer and keeps the producer half, so tests feed the session through
/// [`push`](MockCaptureSource::push). An optional open delay widens the
/// window for exercising concurrent `start()` calls.
///
/// # Example
///
/// ```
/// use duplex_audio::capture::MockCaptureSource;
///
/// let source = MockCaptureSource::new();
/// assert_eq!(source.opens(), 0);
/// ```
pub struct MockCaptureSource {
    open_delay: Duration,
    opens: AtomicUsize,
    producer: Mutex<Option<HeapProd<f32>>>,
    stopped: Mutex<Option<Arc<AtomicBool>>>,
}

impl MockCaptureSource {
    /// Creates a source that opens immediately.
    pub fn new() -> Self {
        Self::with_open_delay(Duration::ZERO)
    }

    /// Creates a source whose `open` sleeps for `delay` before succeeding.
    pub fn with_open_delay(delay: Duration) -> Self {
        Self {
            open_delay: delay,
            opens: AtomicUsize::new(0),
            producer: Mutex::new(None),
            stopped: Mutex::new(None),
        }
    }

    /// Number of times `open` has completed.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Pushes samples into the most recently opened session's ring buffer.
    /// Returns how many were accepted.
    pub fn push(&self, samples: &[f32]) -> usize {
        let mut producer = self.producer.lock().unwrap_or_else(|e| e.into_inner());
        match producer.as_mut() {
            Some(producer) => producer.push_slice(samples),
            None => 0,
        }
    }

    /// Returns `true` once the most recently opened stream has been stopped.
    pub fn stream_stopped(&self) -> bool {
        let stopped = self.stopped.lock().unwrap_or_else(|e| e.into_inner());
        stopped
            .as_ref()
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

impl Default for MockCaptureSource {
    fn default() -> Self {
        Self::new()
    }
}

struct MockStream {
    stopped: Arc<AtomicBool>,
}

impl CaptureStream for MockStream {
    fn stop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

impl Drop for MockStream {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl CaptureSource for MockCaptureSource {
    async fn open(
        &self,
        _sample_rate: u32,
        ring_capacity: usize,
    ) -> Result<(Box<dyn CaptureStream>, HeapCons<f32>), AudioPipelineError> {
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }

        let ring = HeapRb::<f32>::new(ring_capacity);
        let (producer, consumer) = ring.split();
        let stopped = Arc::new(AtomicBool::new(false));

        *self.producer.lock().unwrap_or_else(|e| e.into_inner()) = Some(producer);
        *self.stopped.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&stopped));
        self.opens.fetch_add(1, Ordering::SeqCst);

        Ok((Box::new(MockStream { stopped }), consumer))
    }
}

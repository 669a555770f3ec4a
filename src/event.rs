//! Runtime events for monitoring pipeline health.
//!
//! Events are non-fatal notifications about pipeline behavior. Sessions keep
//! running after an event is emitted - steady-state faults are recovered in
//! place and reported here instead of being raised as errors.

use std::sync::Arc;

/// Runtime events emitted by the capture and playback paths.
///
/// These are informational, not errors. Use the [`EventCallback`] to log
/// them or drive UI state (recording indicators, error toasts).
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// Capture initialization finished and the encoder is recording.
    CaptureStarted,

    /// Capture was stopped and all capture resources were released.
    ///
    /// Not emitted when the teardown is a rollback from a failed `start()`.
    CaptureStopped,

    /// An inbound playback payload was malformed and skipped.
    ///
    /// The session continues; only the bad payload (or its trailing bytes)
    /// is dropped.
    PayloadSkipped {
        /// What was wrong with the payload.
        reason: String,
    },

    /// A playback chunk could not be materialized or scheduled, and a silent
    /// chunk of the same duration was substituted to preserve timing.
    SilentChunkSubstituted {
        /// Duration of the substituted chunk in milliseconds.
        duration_ms: u64,
    },

    /// Playback was interrupted by `stop()` and is fading to silence.
    ///
    /// The session's terminal state is the same as a natural end of stream;
    /// this event is how callers tell the two apart.
    PlaybackInterrupted,

    /// Playback resumed after an interruption.
    PlaybackResumed,

    /// The playback stream completed: it was marked complete and the last
    /// scheduled chunk finished rendering (or there was nothing to render).
    PlaybackComplete,
}

/// Callback type for receiving runtime events.
///
/// Register one via the capture/playback constructors to receive
/// notifications about lifecycle edges and recovered faults.
///
/// # Example
///
/// ```
/// use duplex_audio::{event_callback, PipelineEvent};
///
/// let callback = event_callback(|event| {
///     tracing::info!(?event, "pipeline event");
/// });
/// callback(PipelineEvent::CaptureStarted);
/// ```
pub type EventCallback = Arc<dyn Fn(PipelineEvent) + Send + Sync>;

/// Creates an [`EventCallback`] from a closure.
///
/// Convenience so callers don't wrap in `Arc` by hand.
pub fn event_callback<F>(f: F) -> EventCallback
where
    F: Fn(PipelineEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_debug() {
        let event = PipelineEvent::SilentChunkSubstituted { duration_ms: 320 };
        let debug = format!("{:?}", event);
        assert!(debug.contains("SilentChunkSubstituted"));
        assert!(debug.contains("320"));
    }

    #[test]
    fn test_event_clone() {
        let event = PipelineEvent::PayloadSkipped {
            reason: "odd byte count".to_string(),
        };
        let cloned = event.clone();
        if let PipelineEvent::PayloadSkipped { reason } = cloned {
            assert_eq!(reason, "odd byte count");
        } else {
            panic!("Expected PayloadSkipped variant");
        }
    }

    #[test]
    fn test_event_callback_helper() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let called = Arc::new(AtomicBool::new(false));
        let called_clone = called.clone();

        let callback = event_callback(move |_| {
            called_clone.store(true, Ordering::SeqCst);
        });

        callback(PipelineEvent::CaptureStarted);
        assert!(called.load(Ordering::SeqCst));
    }
}

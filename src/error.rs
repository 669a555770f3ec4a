//! Error types for duplex-audio.
//!
//! Errors are split into two categories:
//! - **Fatal errors** ([`AudioPipelineError`]): abort the operation that
//!   triggered them (a `start()`, an `acquire()`, a unit registration)
//! - **Recoverable faults**: steady-state problems during an active session
//!   (a malformed inbound chunk, a failed buffer materialization) are logged,
//!   recovered in place, and surfaced via [`EventCallback`](crate::EventCallback)
//!   rather than tearing down the session.

/// Fatal errors surfaced by the audio pipeline.
///
/// Initialization-time errors always roll back partially acquired resources
/// before being returned. Teardown-path errors are logged and swallowed since
/// the resources are being discarded regardless.
#[derive(Debug, thiserror::Error)]
pub enum AudioPipelineError {
    /// Capture device access was denied or the device is unsupported.
    ///
    /// Fatal to the capture attempt that triggered it. Anything acquired
    /// before the failure has already been released.
    #[error("capture permission denied or device unsupported: {reason}")]
    Permission {
        /// Why the capture device could not be used.
        reason: String,
    },

    /// A device context could not be created or resumed.
    ///
    /// Includes the missing-user-activation case: context creation is retried
    /// once after the next interaction signal, and this error is returned
    /// only if that retry also fails.
    #[error("device context '{context_id}' unavailable: {reason}")]
    DeviceContext {
        /// The context id that failed to resolve.
        context_id: String,
        /// Why creation or resume failed.
        reason: String,
    },

    /// A named processing unit failed to load into a device context.
    ///
    /// Aborts the owning start sequence. The partial registry entry has
    /// already been removed.
    #[error("processing unit '{name}' failed to load: {reason}")]
    ProcessingUnitLoad {
        /// Name of the unit that failed.
        name: String,
        /// Why the unit failed to load.
        reason: String,
    },

    /// An inbound audio payload was malformed.
    ///
    /// During an active playback session this is recovered locally (the bad
    /// chunk is skipped) and reported as an event instead of being returned.
    #[error("malformed audio payload: {reason}")]
    Encoding {
        /// What was wrong with the payload.
        reason: String,
    },

    /// A playback buffer could not be materialized or scheduled.
    ///
    /// During an active session this is recovered by substituting a silent
    /// chunk of the same duration to preserve timing.
    #[error("playback scheduling failed: {reason}")]
    PlaybackScheduling {
        /// What went wrong while scheduling.
        reason: String,
    },

    /// An error from the underlying audio library (CPAL).
    #[error("audio backend error: {0}")]
    Backend(String),
}

impl AudioPipelineError {
    /// Creates a permission error with the given reason.
    pub fn permission(reason: impl Into<String>) -> Self {
        Self::Permission {
            reason: reason.into(),
        }
    }

    /// Creates a device context error for the given context id.
    pub fn device_context(context_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DeviceContext {
            context_id: context_id.into(),
            reason: reason.into(),
        }
    }

    /// Creates a unit load error for the given unit name.
    pub fn unit_load(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ProcessingUnitLoad {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Creates an encoding error with the given reason.
    pub fn encoding(reason: impl Into<String>) -> Self {
        Self::Encoding {
            reason: reason.into(),
        }
    }

    /// Creates a scheduling error with the given reason.
    pub fn scheduling(reason: impl Into<String>) -> Self {
        Self::PlaybackScheduling {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_error_display() {
        let err = AudioPipelineError::permission("microphone blocked by OS");
        assert_eq!(
            err.to_string(),
            "capture permission denied or device unsupported: microphone blocked by OS"
        );
    }

    #[test]
    fn test_device_context_error_display() {
        let err = AudioPipelineError::device_context("playback", "no activation signal");
        assert!(err.to_string().contains("playback"));
        assert!(err.to_string().contains("no activation signal"));
    }

    #[test]
    fn test_unit_load_error_display() {
        let err = AudioPipelineError::unit_load("volume-meter", "factory failed");
        assert_eq!(
            err.to_string(),
            "processing unit 'volume-meter' failed to load: factory failed"
        );
    }

    #[test]
    fn test_backend_error_display() {
        let err = AudioPipelineError::Backend("device disconnected".to_string());
        assert_eq!(err.to_string(), "audio backend error: device disconnected");
    }
}

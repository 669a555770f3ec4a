//! Configuration types for the capture and playback paths.

use std::time::Duration;

/// Configuration for the capture/encode path.
///
/// Use [`CaptureConfig::default()`] for the standard 16kHz mono
/// transcription-style format, or customize as needed.
///
/// # Example
///
/// ```
/// use duplex_audio::CaptureConfig;
///
/// let config = CaptureConfig {
///     frame_size: 1024,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Target capture sample rate in Hz.
    ///
    /// Default: 16000
    pub sample_rate: u32,

    /// Number of 16-bit samples per emitted PCM frame.
    ///
    /// Fixed for the lifetime of a capture session.
    /// Default: 2048
    pub frame_size: usize,

    /// How often the volume envelope is emitted.
    ///
    /// Default: 25ms (~40 updates per second)
    pub volume_update_interval: Duration,

    /// Capacity of the ring buffer between the device callback and the
    /// encoding bridge, in samples.
    ///
    /// This buffer absorbs pressure when the control domain stalls. If it
    /// fills, the device callback drops samples rather than blocking.
    /// Default: 30 seconds at the capture rate
    pub ring_capacity: usize,

    /// How often the bridge task polls the ring buffer.
    ///
    /// Default: 10ms
    pub bridge_poll_interval: Duration,

    /// Capacity of the outbound frame channel.
    ///
    /// Default: 64 frames (~8 seconds at the default frame size and rate)
    pub frame_channel_capacity: usize,

    /// Whether acquiring the capture context must wait for a user-interaction
    /// signal on the manager's activation gate.
    ///
    /// Default: false
    pub require_activation: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            frame_size: 2048,
            volume_update_interval: Duration::from_millis(25),
            ring_capacity: 16000 * 30,
            bridge_poll_interval: Duration::from_millis(10),
            frame_channel_capacity: 64,
            require_activation: false,
        }
    }
}

/// Configuration for the playback/scheduling path.
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Playback sample rate in Hz.
    ///
    /// Default: 24000
    pub sample_rate: u32,

    /// Number of samples per scheduled playback chunk.
    ///
    /// Fixed for the lifetime of a playback session.
    /// Default: 7680 (320ms at 24kHz)
    pub chunk_size: usize,

    /// Delay before the first chunk of a new stream starts playing.
    ///
    /// Gives the network a head start so early jitter doesn't underrun.
    /// Default: 100ms
    pub initial_buffering_delay: Duration,

    /// How far ahead of the device clock chunks may be scheduled.
    ///
    /// Default: 200ms
    pub lookahead: Duration,

    /// How often the scheduler polls for new data while the queue is empty
    /// and the stream is not yet complete.
    ///
    /// Default: 50ms
    pub poll_interval: Duration,

    /// Duration of the gain fade applied by `stop()` instead of a hard cut.
    ///
    /// Default: 100ms
    pub fade_duration: Duration,

    /// How often the volume envelope is emitted, for playback metering.
    ///
    /// Default: 25ms
    pub volume_update_interval: Duration,

    /// Whether acquiring the playback context must wait for a
    /// user-interaction signal on the manager's activation gate.
    ///
    /// Default: false
    pub require_activation: bool,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24000,
            chunk_size: 7680,
            initial_buffering_delay: Duration::from_millis(100),
            lookahead: Duration::from_millis(200),
            poll_interval: Duration::from_millis(50),
            fade_duration: Duration::from_millis(100),
            volume_update_interval: Duration::from_millis(25),
            require_activation: false,
        }
    }
}

//! Audio frame and chunk types, plus sample format conversion.
//!
//! Two fixed-size units flow through the pipeline:
//! - [`PcmFrame`]: quantized 16-bit capture output, serialized little-endian
//! - [`PlaybackChunk`]: normalized f32 samples queued for scheduled playback
//!
//! [`WireFrame`] is the text-safe encoded form of a [`PcmFrame`] for
//! embedding in outbound protocol messages.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::AudioPipelineError;

/// Quantizes a normalized f32 sample to i16.
///
/// Input is clamped to [-1.0, 1.0] before conversion. Uses `round(x * 32767)`
/// for symmetric scaling: -1.0 maps to -32767 rather than -32768, losing one
/// LSB at the negative extreme but never producing out-of-range values.
#[inline]
pub fn quantize(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * 32767.0).round() as i16
}

/// Dequantizes an i16 sample to normalized f32.
///
/// Output is in [-1.0, 1.0), using the `sample / 32768` convention the
/// playback path normalizes inbound PCM with.
#[inline]
pub fn dequantize(sample: i16) -> f32 {
    f32::from(sample) / 32768.0
}

/// A fixed-length block of quantized 16-bit mono samples.
///
/// Produced by the capture encoder once exactly `frame_size` samples have
/// accumulated. Self-contained: no inter-frame header, little-endian when
/// serialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcmFrame {
    /// Quantized samples, exactly the configured frame size.
    pub samples: Vec<i16>,
    /// Sample rate in Hz the frame was captured at.
    pub sample_rate: u32,
}

impl PcmFrame {
    /// Creates a frame from quantized samples.
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Duration of the frame at its sample rate.
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(self.sample_rate))
    }

    /// Serializes the frame as little-endian bytes (2 bytes per sample).
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.samples.len() * 2);
        for sample in &self.samples {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        bytes
    }

    /// The MIME-style descriptor tagging this frame's format on the wire.
    pub fn mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }

    /// Encodes the frame into its text-safe wire form.
    pub fn to_wire(&self) -> WireFrame {
        WireFrame {
            mime_type: self.mime_type(),
            data: BASE64.encode(self.to_le_bytes()),
        }
    }
}

/// A [`PcmFrame`] pre-encoded for embedding in outbound protocol messages.
///
/// The payload is base64 of the frame's little-endian bytes, tagged with a
/// MIME-style descriptor such as `audio/pcm;rate=16000`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    /// Format descriptor, e.g. `audio/pcm;rate=16000`.
    pub mime_type: String,
    /// Base64-encoded little-endian 16-bit PCM payload.
    pub data: String,
}

impl WireFrame {
    /// Decodes the base64 payload back to raw little-endian PCM bytes.
    ///
    /// # Errors
    ///
    /// Returns [`AudioPipelineError::Encoding`] if the payload is not valid
    /// base64.
    pub fn decode(&self) -> Result<Vec<u8>, AudioPipelineError> {
        BASE64
            .decode(&self.data)
            .map_err(|e| AudioPipelineError::encoding(format!("invalid base64 payload: {e}")))
    }
}

/// A fixed-length block of normalized samples queued for scheduled playback.
///
/// Chunks are consumed strictly in arrival order. The final chunk of a
/// stream may be shorter than the configured chunk size.
#[derive(Debug, Clone)]
pub struct PlaybackChunk {
    /// Normalized mono samples in [-1.0, 1.0].
    pub samples: Vec<f32>,
}

impl PlaybackChunk {
    /// Creates a chunk from normalized samples.
    pub fn new(samples: Vec<f32>) -> Self {
        Self { samples }
    }

    /// Duration of the chunk at the given playback rate.
    pub fn duration(&self, sample_rate: u32) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(sample_rate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantize_full_range() {
        assert_eq!(quantize(1.0), 32767);
        assert_eq!(quantize(-1.0), -32767);
        assert_eq!(quantize(0.0), 0);
    }

    #[test]
    fn test_quantize_clamping() {
        assert_eq!(quantize(2.0), 32767);
        assert_eq!(quantize(-2.0), -32767);
    }

    #[test]
    fn test_quantize_rounds() {
        // 0.5 * 32767 = 16383.5, rounds away from zero
        assert_eq!(quantize(0.5), 16384);
        assert_eq!(quantize(-0.5), -16384);
    }

    #[test]
    fn test_round_trip_error_bound() {
        // dequantize(quantize(x)) must be within 1/32768 of x
        let bound = 1.0 / 32768.0;
        for i in -1000..=1000 {
            let x = i as f32 / 1000.0;
            let back = dequantize(quantize(x));
            assert!(
                (back - x).abs() <= bound,
                "round trip of {x} drifted to {back}"
            );
        }
    }

    #[test]
    fn test_frame_duration() {
        let frame = PcmFrame::new(vec![0i16; 2048], 16000);
        assert_eq!(frame.duration(), Duration::from_millis(128));
    }

    #[test]
    fn test_frame_le_bytes() {
        let frame = PcmFrame::new(vec![0x0102, -2], 16000);
        assert_eq!(frame.to_le_bytes(), vec![0x02, 0x01, 0xFE, 0xFF]);
    }

    #[test]
    fn test_frame_mime_type() {
        let frame = PcmFrame::new(vec![0i16; 4], 16000);
        assert_eq!(frame.mime_type(), "audio/pcm;rate=16000");
    }

    #[test]
    fn test_wire_frame_round_trip() {
        let frame = PcmFrame::new(vec![100, -100, 32767, -32767], 16000);
        let wire = frame.to_wire();
        assert_eq!(wire.mime_type, "audio/pcm;rate=16000");
        assert_eq!(wire.decode().unwrap(), frame.to_le_bytes());
    }

    #[test]
    fn test_wire_frame_decode_rejects_garbage() {
        let wire = WireFrame {
            mime_type: "audio/pcm;rate=16000".to_string(),
            data: "not base64!!!".to_string(),
        };
        assert!(matches!(
            wire.decode(),
            Err(AudioPipelineError::Encoding { .. })
        ));
    }

    #[test]
    fn test_playback_chunk_duration() {
        let chunk = PlaybackChunk::new(vec![0.0; 7680]);
        assert_eq!(chunk.duration(24000), Duration::from_millis(320));
    }
}

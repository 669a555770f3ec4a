//! Volume-envelope metering unit.

use std::time::Duration;

use crate::registry::{ProcessingUnit, UnitDefinition, UnitMessage};

/// Envelope decay factor per processed block: fast attack, slow decay.
const ENVELOPE_DECAY: f32 = 0.75;

/// Computes a smoothed loudness envelope from sample blocks.
///
/// Per block: RMS of the samples, then `volume = max(rms, volume * 0.75)` so
/// the meter jumps up instantly on loud input and decays gradually through
/// silence. Output is throttled to the configured update interval (default
/// 25ms, ~40 emissions per second) independently of block size.
///
/// Reused by both pipeline directions: the capture path registers it against
/// the capture context, the playback path against the playback context.
pub struct VolumeEnvelopeUnit {
    volume: f32,
    interval_frames: f32,
    next_update_frame: f32,
}

impl VolumeEnvelopeUnit {
    /// Creates a meter for the given sample rate and update interval.
    pub fn new(sample_rate: u32, update_interval: Duration) -> Self {
        let interval_frames = update_interval.as_secs_f32() * sample_rate as f32;
        Self {
            volume: 0.0,
            interval_frames,
            next_update_frame: interval_frames,
        }
    }

    /// A [`UnitDefinition`] loading this meter with the given interval.
    pub fn definition(update_interval: Duration) -> UnitDefinition {
        UnitDefinition::new(move |sample_rate| {
            Ok(Box::new(VolumeEnvelopeUnit::new(sample_rate, update_interval)))
        })
    }

    /// Current envelope value. Non-negative, typically 0-1 but unbounded
    /// above on loud input.
    pub fn volume(&self) -> f32 {
        self.volume
    }
}

impl ProcessingUnit for VolumeEnvelopeUnit {
    fn process(&mut self, block: &[f32], emit: &mut dyn FnMut(UnitMessage)) {
        if block.is_empty() {
            return;
        }

        let sum_of_squares: f32 = block.iter().map(|s| s * s).sum();
        let rms = (sum_of_squares / block.len() as f32).sqrt();
        self.volume = rms.max(self.volume * ENVELOPE_DECAY);

        self.next_update_frame -= block.len() as f32;
        if self.next_update_frame <= 0.0 {
            self.next_update_frame += self.interval_frames;
            emit(UnitMessage::Volume(self.volume));
        }
    }

    fn reset(&mut self) {
        self.volume = 0.0;
        self.next_update_frame = self.interval_frames;
    }
}

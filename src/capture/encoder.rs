//! PCM frame encoder processing unit.
//!
//! Accumulates normalized samples into fixed-size 16-bit frames and emits
//! each completed frame as a [`UnitMessage::Frame`]. The frame buffer is
//! handed off by ownership transfer on emission rather than copied.

use std::sync::Arc;

use crate::error::AudioPipelineError;
use crate::frame::{quantize, PcmFrame};
use crate::registry::{ProcessingUnit, UnitDefinition, UnitMessage};

/// Quantizes incoming sample blocks into fixed-size [`PcmFrame`]s.
pub struct PcmFrameEncoder {
    buffer: Vec<i16>,
    frame_size: usize,
    write_index: usize,
    sample_rate: u32,
}

impl PcmFrameEncoder {
    /// Creates an encoder emitting `frame_size`-sample frames tagged with
    /// `sample_rate`.
    pub fn new(sample_rate: u32, frame_size: usize) -> Self {
        Self {
            buffer: vec![0; frame_size],
            frame_size,
            write_index: 0,
            sample_rate,
        }
    }

    /// Builds a registry definition producing encoders with the given
    /// frame size.
    pub fn definition(frame_size: usize) -> UnitDefinition {
        UnitDefinition::new(move |sample_rate| {
            if frame_size == 0 {
                return Err(AudioPipelineError::unit_load(
                    "pcm-encoder",
                    "frame size must be non-zero",
                ));
            }
            Ok(Box::new(PcmFrameEncoder::new(sample_rate, frame_size)))
        })
    }

    fn emit_frame(&mut self, emit: &mut dyn FnMut(UnitMessage)) {
        // Transfer the filled buffer out and start a fresh one
        let samples = std::mem::replace(&mut self.buffer, vec![0; self.frame_size]);
        self.write_index = 0;
        emit(UnitMessage::Frame(Arc::new(PcmFrame {
            samples,
            sample_rate: self.sample_rate,
        })));
    }
}

impl ProcessingUnit for PcmFrameEncoder {
    fn process(&mut self, block: &[f32], emit: &mut dyn FnMut(UnitMessage)) {
        for &sample in block {
            self.buffer[self.write_index] = quantize(sample);
            self.write_index += 1;
            if self.write_index >= self.frame_size {
                self.emit_frame(emit);
            }
        }
    }

    fn reset(&mut self) {
        // Discards the partial frame; the buffer is overwritten in order so
        // rewinding the index is enough
        self.write_index = 0;
    }
}

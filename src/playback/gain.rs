//! Lock-free gain stage shared between the control domain and the render
//! callback.
//!
//! Gain values are stored as `f32` bit patterns in atomics so the render
//! callback never takes a lock. A ramp is expressed as a per-sample step
//! toward a target; the callback advances the ramp as it renders.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Output gain with optional linear ramping.
pub struct GainStage {
    current: AtomicU32,
    target: AtomicU32,
    step: AtomicU32,
}

impl GainStage {
    /// Creates a gain stage at unity.
    pub fn new() -> Self {
        Self {
            current: AtomicU32::new(1.0f32.to_bits()),
            target: AtomicU32::new(1.0f32.to_bits()),
            step: AtomicU32::new(0.0f32.to_bits()),
        }
    }

    /// Current gain value.
    pub fn current(&self) -> f32 {
        f32::from_bits(self.current.load(Ordering::Acquire))
    }

    /// Ramp target. Equals `current()` once the ramp has settled.
    pub fn target(&self) -> f32 {
        f32::from_bits(self.target.load(Ordering::Acquire))
    }

    /// Sets the gain immediately, cancelling any ramp in progress.
    pub fn set(&self, gain: f32) {
        self.step.store(0.0f32.to_bits(), Ordering::Release);
        self.target.store(gain.to_bits(), Ordering::Release);
        self.current.store(gain.to_bits(), Ordering::Release);
    }

    /// Starts a linear ramp from the current gain to `target` over `over`.
    pub fn ramp_to(&self, target: f32, over: Duration, sample_rate: u32) {
        let samples = over.as_secs_f32() * sample_rate as f32;
        if samples < 1.0 {
            self.set(target);
            return;
        }
        let step = (target - self.current()) / samples;
        self.target.store(target.to_bits(), Ordering::Release);
        self.step.store(step.to_bits(), Ordering::Release);
    }

    /// Applies the gain to `block` in place, advancing any active ramp one
    /// step per sample.
    pub fn apply(&self, block: &mut [f32]) {
        let mut step = f32::from_bits(self.step.load(Ordering::Acquire));
        let target = f32::from_bits(self.target.load(Ordering::Acquire));
        let mut gain = self.current();

        if step == 0.0 {
            if gain != 1.0 {
                for sample in block {
                    *sample *= gain;
                }
            }
            return;
        }

        for sample in block.iter_mut() {
            *sample *= gain;
            if step != 0.0 {
                gain += step;
                if (step > 0.0 && gain >= target) || (step < 0.0 && gain <= target) {
                    // Ramp settled mid-block: the rest renders at the target
                    gain = target;
                    step = 0.0;
                    self.step.store(0.0f32.to_bits(), Ordering::Release);
                }
            }
        }
        self.current.store(gain.to_bits(), Ordering::Release);
    }
}

impl Default for GainStage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unity_passthrough() {
        let gain = GainStage::new();
        let mut block = vec![0.5, -0.5, 0.25];
        gain.apply(&mut block);
        assert_eq!(block, vec![0.5, -0.5, 0.25]);
    }

    #[test]
    fn test_set_applies_immediately() {
        let gain = GainStage::new();
        gain.set(0.5);
        let mut block = vec![1.0, 1.0];
        gain.apply(&mut block);
        assert_eq!(block, vec![0.5, 0.5]);
        assert_eq!(gain.current(), 0.5);
    }

    #[test]
    fn test_ramp_reaches_target_and_holds() {
        let gain = GainStage::new();
        // 1.0 -> 0.0 over 10 samples at 1kHz
        gain.ramp_to(0.0, Duration::from_millis(10), 1000);

        let mut block = vec![1.0; 10];
        gain.apply(&mut block);
        // First sample at full gain, decreasing after
        assert_eq!(block[0], 1.0);
        assert!(block[5] < block[1]);

        let mut tail = vec![1.0; 4];
        gain.apply(&mut tail);
        assert_eq!(gain.current(), 0.0);
        assert!(tail.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_zero_duration_ramp_is_a_set() {
        let gain = GainStage::new();
        gain.ramp_to(0.0, Duration::ZERO, 24000);
        assert_eq!(gain.current(), 0.0);
        assert_eq!(gain.target(), 0.0);
    }
}

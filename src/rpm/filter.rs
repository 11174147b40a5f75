//! Second-order low-pass filter for RPM smoothing.
//!
//! Butterworth response (Q = 1/√2), RBJ cookbook coefficients, direct form I.

use std::f32::consts::PI;

const BUTTERWORTH_Q: f32 = std::f32::consts::FRAC_1_SQRT_2;

/// Biquad low-pass filter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiquadLpf {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
}

impl Default for BiquadLpf {
    /// Pass-through filter
    fn default() -> Self {
        Self {
            b0: 1.0,
            b1: 0.0,
            b2: 0.0,
            a1: 0.0,
            a2: 0.0,
            x1: 0.0,
            x2: 0.0,
            y1: 0.0,
            y2: 0.0,
        }
    }
}

impl BiquadLpf {
    /// Low-pass at `cutoff_hz` for a filter run every `looptime_us`
    ///
    /// The cutoff is kept below the Nyquist frequency of the loop rate.
    pub fn new(cutoff_hz: f32, looptime_us: u32) -> Self {
        let sample_period = looptime_us.max(1) as f32 * 1e-6;
        let nyquist = 0.5 / sample_period;
        let cutoff = cutoff_hz.clamp(f32::MIN_POSITIVE, nyquist * 0.95);

        let omega = 2.0 * PI * cutoff * sample_period;
        let (sn, cs) = omega.sin_cos();
        let alpha = sn / (2.0 * BUTTERWORTH_Q);

        let a0 = 1.0 + alpha;
        let b1 = (1.0 - cs) / a0;

        Self {
            b0: b1 * 0.5,
            b1,
            b2: b1 * 0.5,
            a1: -2.0 * cs / a0,
            a2: (1.0 - alpha) / a0,
            ..Self::default()
        }
    }

    /// Filter one sample
    pub fn apply(&mut self, input: f32) -> f32 {
        let output = self.b0 * input + self.b1 * self.x1 + self.b2 * self.x2
            - self.a1 * self.y1
            - self.a2 * self.y2;

        self.x2 = self.x1;
        self.x1 = input;
        self.y2 = self.y1;
        self.y1 = output;

        output
    }
}

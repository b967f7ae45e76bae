//! Audio conditioning chain
//!
//! Runs on every captured frame before segmentation, in a fixed order:
//! high-pass, speech band-pass, compression, noise gate.

use std::f32::consts::PI;

use super::calculate_energy;
use crate::config::AudioConfig;

const BUTTERWORTH_Q: f32 = std::f32::consts::FRAC_1_SQRT_2;

/// Second-order IIR section (RBJ cookbook coefficients, direct form I)
#[derive(Debug, Clone)]
struct Biquad {
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

impl Biquad {
    fn new(b: [f32; 3], a: [f32; 3]) -> Self {
        let a0 = a[0];
        Self {
            b0: b[0] / a0,
            b1: b[1] / a0,
            b2: b[2] / a0,
            a1: a[1] / a0,
            a2: a[2] / a0,
            x1: 0.0,
            x2: 0.0,
            y1: 0.0,
            y2: 0.0,
        }
    }

    /// `None` when the cutoff is outside (0, nyquist)
    fn high_pass(cutoff_hz: f32, sample_rate: u32) -> Option<Self> {
        let (cos, alpha) = Self::omega(cutoff_hz, sample_rate)?;
        Some(Self::new(
            [(1.0 + cos) / 2.0, -(1.0 + cos), (1.0 + cos) / 2.0],
            [1.0 + alpha, -2.0 * cos, 1.0 - alpha],
        ))
    }

    fn low_pass(cutoff_hz: f32, sample_rate: u32) -> Option<Self> {
        let (cos, alpha) = Self::omega(cutoff_hz, sample_rate)?;
        Some(Self::new(
            [(1.0 - cos) / 2.0, 1.0 - cos, (1.0 - cos) / 2.0],
            [1.0 + alpha, -2.0 * cos, 1.0 - alpha],
        ))
    }

    fn omega(cutoff_hz: f32, sample_rate: u32) -> Option<(f32, f32)> {
        let nyquist = sample_rate as f32 / 2.0;
        if cutoff_hz <= 0.0 || cutoff_hz >= nyquist {
            return None;
        }
        let w0 = 2.0 * PI * cutoff_hz / sample_rate as f32;
        Some((w0.cos(), w0.sin() / (2.0 * BUTTERWORTH_Q)))
    }

    fn process(&mut self, x: f32) -> f32 {
        let y = self.b0 * x + self.b1 * self.x1 + self.b2 * self.x2
            - self.a1 * self.y1
            - self.a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = x;
        self.y2 = self.y1;
        self.y1 = y;
        y
    }
}

/// What the chain observed about one frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameInfo {
    /// RMS after compression, before gating
    pub rms: f32,
    /// Frame fell below the gate and was zeroed
    pub gated: bool,
}

/// Stateful filter chain; one per capture session
#[derive(Debug, Clone)]
pub struct ConditioningChain {
    filters: Vec<Biquad>,
    threshold: f32,
    ratio: f32,
    makeup_gain: f32,
    gate_threshold: f32,
}

impl ConditioningChain {
    pub fn new(config: &AudioConfig) -> Self {
        let rate = config.sample_rate;
        let filters = [
            Biquad::high_pass(config.high_pass_hz, rate),
            Biquad::high_pass(config.band_low_hz, rate),
            Biquad::low_pass(config.band_high_hz, rate),
        ]
        .into_iter()
        .flatten()
        .collect();

        Self {
            filters,
            threshold: config.compressor_threshold.clamp(0.0, 1.0),
            ratio: config.compressor_ratio.max(1.0),
            makeup_gain: config.makeup_gain.max(0.0),
            gate_threshold: config.noise_gate_threshold.max(0.0),
        }
    }

    /// Condition `frame` in place
    pub fn process(&mut self, frame: &mut [f32]) -> FrameInfo {
        for sample in frame.iter_mut() {
            let mut value = *sample;
            for filter in &mut self.filters {
                value = filter.process(value);
            }
            *sample = self.compress(value);
        }

        let rms = calculate_energy(frame);
        let gated = rms < self.gate_threshold;
        if gated {
            frame.fill(0.0);
        }
        FrameInfo { rms, gated }
    }

    fn compress(&self, value: f32) -> f32 {
        let magnitude = value.abs();
        let shaped = if magnitude > self.threshold {
            self.threshold + (magnitude - self.threshold) / self.ratio
        } else {
            magnitude
        };
        (shaped * self.makeup_gain).min(1.0).copysign(value)
    }
}

//! Amplitude envelope and delay compensation for the servo.
//!
//! Both work on one RMS value per block, so all timing is in blocks of
//! stream time rather than wall clock.

use std::collections::VecDeque;

/// Block RMS below this level reads as silence.
pub const SILENCE_GATE_DBFS: f32 = -45.0;
/// Percentile of recent RMS that maps to a fully open mouth.
pub const NORM_PERCENTILE: f32 = 95.0;
pub const HISTORY_SECONDS: f32 = 2.5;
pub const ATTACK_MS: f32 = 40.0;
pub const RELEASE_MS: f32 = 120.0;

/// Normalized, smoothed amplitude in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct Envelope {
    history: VecDeque<f32>,
    capacity: usize,
    sorted: Vec<f32>,
    gate: f32,
    attack: f32,
    release: f32,
    value: f32,
}

impl Envelope {
    pub fn new(sample_rate: u32, block_size: u32) -> Self {
        let sample_rate = sample_rate.max(1) as f32;
        let block_size = block_size.max(1) as f32;
        let block_ms = 1000.0 * block_size / sample_rate;
        let capacity = ((HISTORY_SECONDS * sample_rate / block_size) as usize).max(1);

        Self {
            history: VecDeque::with_capacity(capacity),
            capacity,
            sorted: Vec::with_capacity(capacity),
            gate: crate::backend::db_to_linear(SILENCE_GATE_DBFS),
            attack: (-block_ms / ATTACK_MS.max(1.0)).exp(),
            release: (-block_ms / RELEASE_MS.max(1.0)).exp(),
            value: 0.0,
        }
    }

    /// Feed one block RMS and return the smoothed envelope.
    pub fn step(&mut self, rms: f32) -> f32 {
        let rms = if rms.is_finite() { rms.max(0.0) } else { 0.0 };
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(rms);

        let target = if rms < self.gate {
            0.0
        } else {
            let reference = self.reference();
            (rms / reference).clamp(0.0, 1.0)
        };

        let coeff = if target > self.value {
            self.attack
        } else {
            self.release
        };
        self.value = coeff * self.value + (1.0 - coeff) * target;
        self.value
    }

    pub fn value(&self) -> f32 {
        self.value
    }

    /// 95th percentile of the positive history, linearly interpolated.
    fn reference(&mut self) -> f32 {
        self.sorted.clear();
        self.sorted.extend(self.history.iter().copied().filter(|v| *v > 0.0));
        if self.sorted.is_empty() {
            return 1.0;
        }
        self.sorted.sort_by(f32::total_cmp);

        let rank = NORM_PERCENTILE / 100.0 * (self.sorted.len() - 1) as f32;
        let lo = rank.floor() as usize;
        let hi = rank.ceil() as usize;
        let frac = rank - lo as f32;
        let reference = self.sorted[lo] + (self.sorted[hi] - self.sorted[lo]) * frac;
        if reference > 0.0 {
            reference
        } else {
            1.0
        }
    }
}

/// Number of blocks that best approximates `delay_ms`.
pub fn delay_blocks(delay_ms: f32, sample_rate: u32, block_size: u32) -> usize {
    (delay_ms.max(0.0) * sample_rate as f32 / block_size.max(1) as f32 / 1000.0).round() as usize
}

/// Fixed delay of whole blocks.
#[derive(Debug, Clone)]
pub struct DelayLine {
    ring: VecDeque<f32>,
    blocks: usize,
}

impl DelayLine {
    pub fn new(blocks: usize) -> Self {
        Self {
            ring: VecDeque::with_capacity(blocks + 1),
            blocks,
        }
    }

    /// Push a value and get the one from `blocks` pushes ago, once available.
    pub fn push(&mut self, value: f32) -> Option<f32> {
        if self.blocks == 0 {
            return Some(value);
        }
        self.ring.push_back(value);
        if self.ring.len() > self.blocks {
            self.ring.pop_front()
        } else {
            None
        }
    }

    pub fn blocks(&self) -> usize {
        self.blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_stays_closed() {
        let mut env = Envelope::new(48_000, 512);
        for _ in 0..100 {
            assert_eq!(env.step(0.001), 0.0);
        }
    }

    #[test]
    fn test_loud_signal_opens_and_release_is_slower() {
        let mut env = Envelope::new(48_000, 512);
        let mut rising = 0;
        while env.step(0.3) < 0.9 {
            rising += 1;
            assert!(rising < 100);
        }
        let mut falling = 0;
        while env.step(0.0) > 0.1 {
            falling += 1;
            assert!(falling < 200);
        }
        assert!(falling > rising, "release {falling} vs attack {rising}");
    }

    #[test]
    fn test_normalizes_to_recent_peak() {
        let mut env = Envelope::new(48_000, 512);
        // a quiet voice still opens the mouth fully
        for _ in 0..200 {
            env.step(0.02);
        }
        assert!(env.value() > 0.95);
    }

    #[test]
    fn test_delay_blocks_rounding() {
        assert_eq!(delay_blocks(180.0, 48_000, 256), 34);
        assert_eq!(delay_blocks(0.0, 48_000, 256), 0);
        assert_eq!(delay_blocks(-5.0, 48_000, 256), 0);
    }

    #[test]
    fn test_delay_line() {
        let mut line = DelayLine::new(2);
        assert_eq!(line.push(1.0), None);
        assert_eq!(line.push(2.0), None);
        assert_eq!(line.push(3.0), Some(1.0));
        assert_eq!(line.push(4.0), Some(2.0));

        let mut passthrough = DelayLine::new(0);
        assert_eq!(passthrough.push(7.0), Some(7.0));
    }
}

//! Capability interfaces for the audio hardware.
//!
//! The engine never talks to a sound server directly; it is handed an
//! [`AudioBackend`] (PipeWire in production, [`crate::sim::SimBackend`] in
//! tests) and opens sinks and sources through it.

use std::time::Duration;

use crate::error::ChatterError;
use crate::registry::DeviceDescriptor;

/// Sample layout of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
    /// Frames per block handed to `write`/`read`.
    pub block_frames: u32,
    /// Quantum requested from the sound server, in frames.
    pub latency_frames: u32,
}

impl StreamFormat {
    pub fn new(sample_rate: u32, channels: u16, block_frames: u32) -> Self {
        Self {
            sample_rate,
            channels,
            block_frames,
            latency_frames: block_frames,
        }
    }

    /// Interleaved samples per block.
    pub fn block_samples(&self) -> usize {
        self.block_frames as usize * self.channels as usize
    }

    /// Wall-clock length of one block.
    pub fn block_duration(&self) -> Duration {
        Duration::from_secs_f64(self.block_frames as f64 / self.sample_rate.max(1) as f64)
    }
}

/// Output side of a device. Exactly one thread writes to it.
pub trait AudioSink: Send {
    /// Queue one block of interleaved samples.
    ///
    /// Blocks for at most about one block duration while the device catches
    /// up, so the caller is paced at device rate.
    fn write(&mut self, block: &[f32]) -> Result<(), ChatterError>;

    /// Let queued audio play out (soft stop).
    fn drain(&mut self) -> Result<(), ChatterError>;

    /// Discard queued audio immediately (hard stop).
    fn abort(&mut self);
}

/// Input side of a device.
pub trait AudioSource: Send {
    /// Fill `block` with the next interleaved samples. An error means the
    /// capture stream is gone.
    fn read(&mut self, block: &mut [f32]) -> Result<(), ChatterError>;
}

/// Device enumeration and stream construction.
pub trait AudioBackend: Send + Sync {
    fn devices(&self) -> Result<Vec<DeviceDescriptor>, ChatterError>;

    fn open_output(
        &self,
        device: &str,
        format: StreamFormat,
    ) -> Result<Box<dyn AudioSink>, ChatterError>;

    fn open_input(
        &self,
        device: &str,
        format: StreamFormat,
    ) -> Result<Box<dyn AudioSource>, ChatterError>;
}

/// RMS of a block; 0 for an empty block.
pub fn block_rms(block: &[f32]) -> f32 {
    if block.is_empty() {
        return 0.0;
    }
    let sum: f32 = block.iter().map(|s| s * s).sum();
    (sum / block.len() as f32).sqrt()
}

/// Decibels to linear amplitude.
pub fn db_to_linear(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

/// Multiply by `gain` and clamp to full scale.
pub fn apply_gain(block: &mut [f32], gain: f32) {
    for s in block.iter_mut() {
        *s = (*s * gain).clamp(-1.0, 1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_geometry() {
        let format = StreamFormat::new(48_000, 2, 480);
        assert_eq!(format.block_samples(), 960);
        assert_eq!(format.block_duration(), Duration::from_millis(10));
    }

    #[test]
    fn test_rms_of_constant() {
        assert!((block_rms(&[0.5; 64]) - 0.5).abs() < 1e-6);
        assert_eq!(block_rms(&[]), 0.0);
    }

    #[test]
    fn test_db_conversion() {
        assert!((db_to_linear(0.0) - 1.0).abs() < 1e-6);
        assert!((db_to_linear(-6.0) - 0.501).abs() < 1e-3);
        assert!((db_to_linear(-3.0) - 0.708).abs() < 1e-3);
    }

    #[test]
    fn test_apply_gain_clamps() {
        let mut block = [0.9, -0.9, 0.1];
        apply_gain(&mut block, 2.0);
        assert_eq!(block, [1.0, -1.0, 0.2]);
    }
}

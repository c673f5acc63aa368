//! Shared rig for scenario tests: a soundboard on simulated hardware.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chatterbox::sim::{RecordingActuator, SimBackend, SimEffect, SimEffects};
use chatterbox::{Hardware, Soundboard};
use chatterconf::{MemoryStore, Settings};
use tempfile::TempDir;

pub struct Rig {
    pub board: Soundboard,
    pub backend: SimBackend,
    pub actuator: RecordingActuator,
    pub effects: SimEffects,
    pub store: Arc<MemoryStore>,
    pub dir: TempDir,
}

impl Rig {
    pub fn new() -> Result<Self> {
        Self::with(Settings::default(), SimEffect::Scale(1.0))
    }

    pub fn with(settings: Settings, effect: SimEffect) -> Result<Self> {
        let backend = SimBackend::paced();
        let actuator = RecordingActuator::new();
        let effects = SimEffects::new(effect);
        let store = Arc::new(MemoryStore::new(settings));
        let dir = TempDir::new()?;

        let board = Soundboard::open(
            store.clone(),
            dir.path(),
            Hardware {
                audio: Arc::new(backend.clone()),
                effects: Arc::new(effects.clone()),
                actuator: Box::new(actuator.clone()),
            },
        )?;

        Ok(Self {
            board,
            backend,
            actuator,
            effects,
            store,
            dir,
        })
    }

    /// Mono 8 kHz clip of a 200 Hz sine at `amplitude`.
    pub fn clip(&self, name: &str, seconds: f32, amplitude: f32) -> Result<()> {
        write_sine_wav(&self.dir.path().join(name), seconds, amplitude)
    }
}

pub fn write_sine_wav(path: &Path, seconds: f32, amplitude: f32) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 8_000,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    let frames = (seconds * 8_000.0) as usize;
    for i in 0..frames {
        let t = i as f32 / 8_000.0;
        writer.write_sample(amplitude * (std::f32::consts::TAU * 200.0 * t).sin())?;
    }
    writer.finalize()?;
    Ok(())
}

/// Poll `cond` every 2 ms until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

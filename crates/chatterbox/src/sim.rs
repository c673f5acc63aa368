//! Simulated hardware for tests and dry runs.
//!
//! [`SimBackend`] stands in for PipeWire, [`RecordingActuator`] for pigpiod and
//! [`SimEffects`] for SoX. All of them are cheap clones sharing one state, so
//! a test can keep a handle while the engine owns another.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use portable_atomic::AtomicF32;

use crate::actuator::ActuatorDriver;
use crate::backend::{AudioBackend, AudioSink, AudioSource, StreamFormat};
use crate::effects::{EffectBackend, EffectProcessor, FxPreset};
use crate::error::ChatterError;
use crate::registry::{DeviceDescriptor, DEFAULT_DEVICE};

/// Something that happened to a simulated output stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Opened { device: String, format: StreamFormat },
    Drained,
    Aborted,
    Closed,
}

#[derive(Debug, Default)]
struct SimState {
    paced: AtomicBool,
    failing_devices: Mutex<HashSet<String>>,
    events: Mutex<Vec<SinkEvent>>,
    blocks: Mutex<Vec<Vec<f32>>>,
    open_sinks: AtomicUsize,
    open_sources: AtomicUsize,
    fail_writes_after: Mutex<Option<u64>>,
    writes: AtomicU64,
    input_level: AtomicF32,
    fail_reads_after: Mutex<Option<u64>>,
    reads: AtomicU64,
}

/// In-process audio backend.
///
/// Devices: `sim.usb` ("USB Audio", output), `sim.hdmi` ("HDMI Out",
/// output) and `sim.mic` ("Mic", input only), plus `default`.
#[derive(Debug, Clone)]
pub struct SimBackend {
    devices: Vec<DeviceDescriptor>,
    state: Arc<SimState>,
}

impl Default for SimBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBackend {
    pub fn new() -> Self {
        let device = |id: &str, name: &str, input, output| DeviceDescriptor {
            id: id.to_string(),
            name: name.to_string(),
            input,
            output,
        };
        let state = SimState {
            input_level: AtomicF32::new(0.3),
            ..SimState::default()
        };
        Self {
            devices: vec![
                device("sim.usb", "USB Audio", false, true),
                device("sim.hdmi", "HDMI Out", false, true),
                device("sim.mic", "Mic", true, false),
            ],
            state: Arc::new(state),
        }
    }

    /// Paced sinks and sources take one block duration per call, like a device.
    pub fn paced() -> Self {
        let backend = Self::new();
        backend.set_paced(true);
        backend
    }

    pub fn set_paced(&self, paced: bool) {
        self.state.paced.store(paced, Ordering::Relaxed);
    }

    /// Make opening `device` fail.
    pub fn fail_open(&self, device: &str) {
        crate::lock(&self.state.failing_devices).insert(device.to_string());
    }

    /// Fail every write after `n` successful ones.
    pub fn fail_writes_after(&self, n: u64) {
        *crate::lock(&self.state.fail_writes_after) = Some(n);
    }

    /// Fail every capture read after `n` successful ones.
    pub fn fail_reads_after(&self, n: u64) {
        *crate::lock(&self.state.fail_reads_after) = Some(n);
    }

    /// Peak amplitude of the simulated microphone signal.
    pub fn set_input_level(&self, level: f32) {
        self.state.input_level.store(level, Ordering::Relaxed);
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        crate::lock(&self.state.events).clone()
    }

    /// Every block written to any sink, in order.
    pub fn written_blocks(&self) -> Vec<Vec<f32>> {
        crate::lock(&self.state.blocks).clone()
    }

    pub fn written_samples(&self) -> Vec<f32> {
        crate::lock(&self.state.blocks).concat()
    }

    pub fn open_sinks(&self) -> usize {
        self.state.open_sinks.load(Ordering::Acquire)
    }

    pub fn open_sources(&self) -> usize {
        self.state.open_sources.load(Ordering::Acquire)
    }

    fn check_open(&self, device: &str, output: bool) -> Result<(), ChatterError> {
        if crate::lock(&self.state.failing_devices).contains(device) {
            return Err(ChatterError::DeviceUnavailable(format!("{device}: simulated open failure")));
        }
        if device == DEFAULT_DEVICE {
            return Ok(());
        }
        match self.devices.iter().find(|d| d.id == device) {
            Some(d) if (output && d.output) || (!output && d.input) => Ok(()),
            Some(_) => Err(ChatterError::DeviceUnavailable(format!(
                "{device} has no {} ports",
                if output { "output" } else { "input" }
            ))),
            None => Err(ChatterError::DeviceUnavailable(format!("no device {device}"))),
        }
    }
}

impl AudioBackend for SimBackend {
    fn devices(&self) -> Result<Vec<DeviceDescriptor>, ChatterError> {
        Ok(self.devices.clone())
    }

    fn open_output(
        &self,
        device: &str,
        format: StreamFormat,
    ) -> Result<Box<dyn AudioSink>, ChatterError> {
        self.check_open(device, true)?;
        crate::lock(&self.state.events).push(SinkEvent::Opened {
            device: device.to_string(),
            format,
        });
        self.state.open_sinks.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(SimSink {
            state: Arc::clone(&self.state),
            format,
        }))
    }

    fn open_input(
        &self,
        device: &str,
        format: StreamFormat,
    ) -> Result<Box<dyn AudioSource>, ChatterError> {
        self.check_open(device, false)?;
        self.state.open_sources.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(SimSource {
            state: Arc::clone(&self.state),
            format,
            phase: 0.0,
        }))
    }
}

struct SimSink {
    state: Arc<SimState>,
    format: StreamFormat,
}

impl AudioSink for SimSink {
    fn write(&mut self, block: &[f32]) -> Result<(), ChatterError> {
        let n = self.state.writes.fetch_add(1, Ordering::AcqRel);
        if let Some(limit) = *crate::lock(&self.state.fail_writes_after) {
            if n >= limit {
                return Err(ChatterError::DeviceUnavailable("simulated write failure".into()));
            }
        }
        crate::lock(&self.state.blocks).push(block.to_vec());
        if self.state.paced.load(Ordering::Relaxed) {
            let frames = block.len() / self.format.channels.max(1) as usize;
            thread::sleep(Duration::from_secs_f64(
                frames as f64 / self.format.sample_rate.max(1) as f64,
            ));
        }
        Ok(())
    }

    fn drain(&mut self) -> Result<(), ChatterError> {
        crate::lock(&self.state.events).push(SinkEvent::Drained);
        if self.state.paced.load(Ordering::Relaxed) {
            // one block still queued in the "device"
            thread::sleep(self.format.block_duration());
        }
        Ok(())
    }

    fn abort(&mut self) {
        crate::lock(&self.state.events).push(SinkEvent::Aborted);
    }
}

impl Drop for SimSink {
    fn drop(&mut self) {
        crate::lock(&self.state.events).push(SinkEvent::Closed);
        self.state.open_sinks.fetch_sub(1, Ordering::AcqRel);
    }
}

struct SimSource {
    state: Arc<SimState>,
    format: StreamFormat,
    phase: f32,
}

impl AudioSource for SimSource {
    fn read(&mut self, block: &mut [f32]) -> Result<(), ChatterError> {
        let n = self.state.reads.fetch_add(1, Ordering::AcqRel);
        if let Some(limit) = *crate::lock(&self.state.fail_reads_after) {
            if n >= limit {
                return Err(ChatterError::DeviceUnavailable("simulated capture loss".into()));
            }
        }

        // 220 Hz sine
        let level = self.state.input_level.load(Ordering::Relaxed);
        let step = std::f32::consts::TAU * 220.0 / self.format.sample_rate.max(1) as f32;
        for s in block.iter_mut() {
            *s = level * self.phase.sin();
            self.phase = (self.phase + step) % std::f32::consts::TAU;
        }

        if self.state.paced.load(Ordering::Relaxed) {
            thread::sleep(self.format.block_duration());
        }
        Ok(())
    }
}

impl Drop for SimSource {
    fn drop(&mut self) {
        self.state.open_sources.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A command received by [`RecordingActuator`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ActuatorCommand {
    Angle(f32),
    Release,
    Power(bool),
}

/// Actuator that records every command.
#[derive(Debug, Clone, Default)]
pub struct RecordingActuator {
    commands: Arc<Mutex<Vec<ActuatorCommand>>>,
    failing: Arc<AtomicBool>,
}

impl RecordingActuator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every command fail (after recording nothing).
    pub fn fail_all(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    pub fn commands(&self) -> Vec<ActuatorCommand> {
        crate::lock(&self.commands).clone()
    }

    pub fn clear(&self) {
        crate::lock(&self.commands).clear();
    }

    /// Last angle commanded, if any.
    pub fn last_angle(&self) -> Option<f32> {
        crate::lock(&self.commands).iter().rev().find_map(|c| match c {
            ActuatorCommand::Angle(a) => Some(*a),
            _ => None,
        })
    }

    fn record(&self, command: ActuatorCommand) -> Result<(), ChatterError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(ChatterError::ActuatorFault(format!("simulated fault on {command:?}")));
        }
        crate::lock(&self.commands).push(command);
        Ok(())
    }
}

impl ActuatorDriver for RecordingActuator {
    fn set_angle(&mut self, angle: f32) -> Result<(), ChatterError> {
        self.record(ActuatorCommand::Angle(angle))
    }

    fn release(&mut self) -> Result<(), ChatterError> {
        self.record(ActuatorCommand::Release)
    }

    fn set_power(&mut self, on: bool) -> Result<(), ChatterError> {
        self.record(ActuatorCommand::Power(on))
    }
}

/// Behavior of processors spawned by [`SimEffects`].
#[derive(Debug, Clone, PartialEq)]
pub enum SimEffect {
    /// Multiply every sample.
    Scale(f32),
    /// Scale by `gain` for `blocks` blocks, then fail for good.
    FailAfter { blocks: u64, gain: f32 },
    /// Never meet the deadline.
    Stall(Duration),
    /// Panic inside `process`.
    Panic,
    /// Refuse to spawn.
    SpawnFailure,
}

/// Effect backend with scripted behavior.
#[derive(Debug, Clone)]
pub struct SimEffects {
    effect: SimEffect,
    spawned: Arc<AtomicUsize>,
}

impl SimEffects {
    pub fn new(effect: SimEffect) -> Self {
        Self {
            effect,
            spawned: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Processors spawned so far.
    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::Relaxed)
    }
}

impl EffectBackend for SimEffects {
    fn spawn(
        &self,
        preset: &FxPreset,
        _format: StreamFormat,
    ) -> Result<Box<dyn EffectProcessor>, ChatterError> {
        if self.effect == SimEffect::SpawnFailure {
            return Err(ChatterError::EffectFailure(format!(
                "simulated spawn failure for {}",
                preset.name
            )));
        }
        self.spawned.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(SimProcessor {
            effect: self.effect.clone(),
            blocks: 0,
        }))
    }
}

struct SimProcessor {
    effect: SimEffect,
    blocks: u64,
}

impl EffectProcessor for SimProcessor {
    fn process(
        &mut self,
        input: &[f32],
        output: &mut [f32],
        deadline: Duration,
    ) -> Result<(), ChatterError> {
        self.blocks += 1;
        let scale = |output: &mut [f32], gain: f32| {
            for (o, i) in output.iter_mut().zip(input) {
                *o = i * gain;
            }
        };
        match self.effect {
            SimEffect::Scale(gain) => {
                scale(output, gain);
                Ok(())
            }
            SimEffect::FailAfter { blocks, gain } => {
                if self.blocks > blocks {
                    Err(ChatterError::EffectFailure("simulated processor crash".into()))
                } else {
                    scale(output, gain);
                    Ok(())
                }
            }
            SimEffect::Stall(stall) => {
                thread::sleep(stall.min(deadline));
                Err(ChatterError::EffectOverrun {
                    elapsed: stall,
                    budget: deadline,
                })
            }
            SimEffect::Panic => panic!("simulated effect panic"),
            SimEffect::SpawnFailure => Err(ChatterError::EffectFailure("not spawned".into())),
        }
    }
}

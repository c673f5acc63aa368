//! Effect chain adapter
//!
//! The live pipeline hands every block to an [`EffectChainAdapter`]. With
//! [`EffectChain::Bypass`] the block is untouched; with a preset, an
//! [`EffectProcessor`] from an [`EffectBackend`] does the work under a
//! one-block deadline. Faults degrade the chain to bypass, never to silence.

use std::time::{Duration, Instant};

use chatterconf::PresetParams;
use serde::Serialize;
use tracing::{info, warn};

use crate::backend::StreamFormat;
use crate::error::ChatterError;

/// Named, immutable effect parameters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FxPreset {
    pub name: String,
    pub pitch_semitones: f32,
    pub reverb: f32,
    pub bass_db: f32,
    pub treble_db: f32,
}

impl FxPreset {
    pub fn from_params(name: &str, params: &PresetParams) -> Self {
        Self {
            name: name.to_string(),
            pitch_semitones: params.pitch_semitones,
            reverb: params.reverb,
            bass_db: params.bass_db,
            treble_db: params.treble_db,
        }
    }

    /// SoX effect arguments; parameters at their neutral value are left out.
    pub fn sox_effects(&self) -> Vec<String> {
        let mut fx = Vec::new();
        let cents = self.pitch_semitones * 100.0;
        if cents.abs() > 0.01 {
            fx.extend(["pitch".to_string(), format!("{cents:.1}")]);
        }
        if self.reverb > 0.0 {
            fx.extend(["reverb".to_string(), format!("{:.1}", self.reverb)]);
        }
        if self.bass_db.abs() > 0.01 {
            fx.extend(["bass".to_string(), format!("{:+.1}", self.bass_db)]);
        }
        if self.treble_db.abs() > 0.01 {
            fx.extend(["treble".to_string(), format!("{:+.1}", self.treble_db)]);
        }
        fx
    }
}

/// What the live pipeline runs each block through.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "preset", rename_all = "lowercase")]
pub enum EffectChain {
    Bypass,
    Preset(FxPreset),
}

/// One running effect pipeline. Lives for one session.
pub trait EffectProcessor: Send {
    /// Process `input` into `output` (same length).
    ///
    /// Must return within roughly `deadline`; a result that is not ready by
    /// then is reported as [`ChatterError::EffectOverrun`].
    fn process(
        &mut self,
        input: &[f32],
        output: &mut [f32],
        deadline: Duration,
    ) -> Result<(), ChatterError>;
}

/// Factory for processors.
pub trait EffectBackend: Send + Sync {
    fn spawn(
        &self,
        preset: &FxPreset,
        format: StreamFormat,
    ) -> Result<Box<dyn EffectProcessor>, ChatterError>;
}

/// Applies an [`EffectChain`] to blocks in place.
pub struct EffectChainAdapter {
    processor: Option<Box<dyn EffectProcessor>>,
    deadline: Duration,
    max_overruns: u32,
    consecutive_overruns: u32,
    total_overruns: u64,
    degraded: Option<ChatterError>,
    scratch: Vec<f32>,
}

impl EffectChainAdapter {
    /// Build the adapter for one session.
    ///
    /// A processor that cannot be spawned leaves the adapter in bypass with
    /// the failure available from [`EffectChainAdapter::degraded`].
    pub fn new(
        chain: &EffectChain,
        backend: &dyn EffectBackend,
        format: StreamFormat,
        max_overruns: u32,
    ) -> Self {
        let mut adapter = Self {
            processor: None,
            deadline: format.block_duration(),
            max_overruns: max_overruns.max(1),
            consecutive_overruns: 0,
            total_overruns: 0,
            degraded: None,
            scratch: vec![0.0; format.block_samples()],
        };

        if let EffectChain::Preset(preset) = chain {
            match backend.spawn(preset, format) {
                Ok(processor) => {
                    info!(preset = %preset.name, "effect chain ready");
                    adapter.processor = Some(processor);
                }
                Err(e) => {
                    warn!(preset = %preset.name, error = %e, "effect chain unavailable, bypassing");
                    adapter.degraded = Some(as_failure(e));
                }
            }
        }
        adapter
    }

    /// Identity adapter.
    pub fn bypass() -> Self {
        Self {
            processor: None,
            deadline: Duration::ZERO,
            max_overruns: 1,
            consecutive_overruns: 0,
            total_overruns: 0,
            degraded: None,
            scratch: Vec::new(),
        }
    }

    /// Transform `block` in place. On any error the block is left dry.
    pub fn process(&mut self, block: &mut [f32]) -> Result<(), ChatterError> {
        let Some(processor) = self.processor.as_mut() else {
            return Ok(());
        };

        self.scratch.resize(block.len(), 0.0);
        let started = Instant::now();
        match processor.process(block, &mut self.scratch, self.deadline) {
            Ok(()) => {
                let elapsed = started.elapsed();
                if elapsed > self.deadline {
                    return Err(self.overrun(elapsed));
                }
                self.consecutive_overruns = 0;
                block.copy_from_slice(&self.scratch);
                Ok(())
            }
            Err(ChatterError::EffectOverrun { elapsed, .. }) => Err(self.overrun(elapsed)),
            Err(e) => {
                let e = as_failure(e);
                self.degrade(e.clone());
                Err(e)
            }
        }
    }

    fn overrun(&mut self, elapsed: Duration) -> ChatterError {
        self.consecutive_overruns += 1;
        self.total_overruns += 1;
        let err = ChatterError::EffectOverrun {
            elapsed,
            budget: self.deadline,
        };
        if self.consecutive_overruns >= self.max_overruns {
            self.degrade(err.clone());
        }
        err
    }

    fn degrade(&mut self, reason: ChatterError) {
        if self.processor.take().is_some() {
            warn!(error = %reason, "effect chain degraded to bypass");
        }
        self.degraded = Some(reason);
    }

    /// True when blocks pass through untouched.
    pub fn is_bypassed(&self) -> bool {
        self.processor.is_none()
    }

    /// Why the chain fell back to bypass, if it did.
    pub fn degraded(&self) -> Option<&ChatterError> {
        self.degraded.as_ref()
    }

    pub fn total_overruns(&self) -> u64 {
        self.total_overruns
    }
}

fn as_failure(e: ChatterError) -> ChatterError {
    match e {
        ChatterError::EffectFailure(_) | ChatterError::EffectOverrun { .. } => e,
        other => ChatterError::EffectFailure(other.to_string()),
    }
}

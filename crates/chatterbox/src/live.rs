//! Live voice pipeline
//!
//! One block at a time, for as long as the session runs:
//!
//! ```text
//! source.read ─▶ input gain ─▶ effect chain (fx) ─▶ output gain ─▶ sink.write
//!                                                                    │
//!                                                        servo feed ◀┘
//! ```
//!
//! Block size and rate are fixed per session; gains are hot.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chatterconf::{LiveMode, Settings};
use portable_atomic::AtomicF32;
use tokio_util::sync::CancellationToken;

use crate::backend::{apply_gain, block_rms, db_to_linear, AudioSink, AudioSource, StreamFormat};
use crate::effects::{EffectBackend, EffectChain, EffectChainAdapter, FxPreset};
use crate::error::ChatterError;
use crate::log_buffer::LogBuffer;
use crate::servo::{ServoSynchronizer, ServoTiming};

/// Everything fixed for one session.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveConfig {
    pub mode: LiveMode,
    pub input_device: String,
    pub output_device: String,
    /// Always mono.
    pub format: StreamFormat,
    pub input_gain_db: f32,
    pub output_gain_db: f32,
    pub chain: EffectChain,
    pub servo: ServoTiming,
    pub max_overruns: u32,
}

impl LiveConfig {
    /// Session parameters for the configured mode.
    pub fn from_settings(settings: &Settings) -> Result<Self, ChatterError> {
        let live = &settings.live;
        let min_update_ms = settings.servo.min_update_ms;
        let config = match live.mode {
            LiveMode::Normal => {
                let n = &live.normal;
                let format = session_format(n.sample_rate, n.block_size, n.ultra_low_latency);
                Self {
                    mode: LiveMode::Normal,
                    input_device: n.input_device.clone(),
                    output_device: n.output_device.clone(),
                    format,
                    input_gain_db: n.input_gain_db,
                    output_gain_db: n.output_gain_db,
                    chain: EffectChain::Bypass,
                    servo: ServoTiming {
                        sample_rate: n.sample_rate,
                        block_size: n.block_size,
                        delay_ms: settings.servo.delay_ms,
                        min_update_ms,
                    },
                    max_overruns: live.fx.max_overruns,
                }
            }
            LiveMode::Fx => {
                let fx = &live.fx;
                let params = settings.presets.get(&fx.preset).ok_or_else(|| {
                    ChatterError::ConfigInvalid(format!("unknown preset '{}'", fx.preset))
                })?;
                Self {
                    mode: LiveMode::Fx,
                    input_device: fx.input_device.clone(),
                    output_device: fx.output_device.clone(),
                    format: session_format(fx.sample_rate, fx.block_size, fx.ultra_low_latency),
                    input_gain_db: fx.input_gain_db,
                    output_gain_db: fx.output_gain_db,
                    chain: EffectChain::Preset(FxPreset::from_params(&fx.preset, params)),
                    servo: ServoTiming {
                        sample_rate: fx.sample_rate,
                        block_size: fx.block_size,
                        delay_ms: fx.servo_delay_ms,
                        min_update_ms,
                    },
                    max_overruns: fx.max_overruns,
                }
            }
        };
        Ok(config)
    }

    pub fn preset_name(&self) -> Option<&str> {
        match &self.chain {
            EffectChain::Preset(p) => Some(&p.name),
            EffectChain::Bypass => None,
        }
    }
}

/// Mono format for a session; low latency asks for a half-block quantum.
fn session_format(sample_rate: u32, block_size: u32, ultra_low_latency: bool) -> StreamFormat {
    let mut format = StreamFormat::new(sample_rate, 1, block_size);
    if ultra_low_latency {
        format.latency_frames = (block_size / 2).max(16);
    }
    format
}

/// Gains the session reads every block.
#[derive(Debug)]
pub struct LiveGains {
    input_db: AtomicF32,
    output_db: AtomicF32,
    muted: AtomicBool,
}

impl Default for LiveGains {
    fn default() -> Self {
        Self::new(0.0, 0.0)
    }
}

impl LiveGains {
    pub fn new(input_db: f32, output_db: f32) -> Self {
        Self {
            input_db: AtomicF32::new(input_db),
            output_db: AtomicF32::new(output_db),
            muted: AtomicBool::new(false),
        }
    }

    pub fn set(&self, input_db: f32, output_db: f32) {
        self.input_db.store(input_db, Ordering::Relaxed);
        self.output_db.store(output_db, Ordering::Relaxed);
    }

    /// `(input, output)` in dB.
    pub fn get(&self) -> (f32, f32) {
        (
            self.input_db.load(Ordering::Relaxed),
            self.output_db.load(Ordering::Relaxed),
        )
    }

    /// Muted output is written as silence; the gains stay as they are.
    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    pub fn muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    /// Linear factor for the output stage.
    fn output_linear(&self, output_db: f32) -> f32 {
        if self.muted() {
            0.0
        } else {
            db_to_linear(output_db)
        }
    }
}

/// Counters published while a session runs.
#[derive(Debug, Default)]
pub struct LiveStats {
    pub blocks: AtomicU64,
    pub overruns: AtomicU64,
    pub fx_bypassed: AtomicBool,
}

impl LiveStats {
    pub fn reset(&self) {
        self.blocks.store(0, Ordering::Relaxed);
        self.overruns.store(0, Ordering::Relaxed);
        self.fx_bypassed.store(false, Ordering::Relaxed);
    }
}

/// What one session runs with.
pub struct SessionContext<'a> {
    pub config: &'a LiveConfig,
    pub effects: &'a dyn EffectBackend,
    pub servo: &'a ServoSynchronizer,
    pub gains: &'a LiveGains,
    pub stats: &'a LiveStats,
    pub log: &'a LogBuffer,
    pub cancel: &'a CancellationToken,
}

/// Run the block loop until cancelled (`Ok`) or until an I/O error.
///
/// `on_ready` fires once the effect chain is up and before the first block.
pub fn run_session(
    ctx: SessionContext<'_>,
    source: &mut dyn AudioSource,
    sink: &mut dyn AudioSink,
    on_ready: impl FnOnce(),
) -> Result<(), ChatterError> {
    let config = ctx.config;
    let mut adapter =
        EffectChainAdapter::new(&config.chain, ctx.effects, config.format, config.max_overruns);
    if let Some(reason) = adapter.degraded() {
        ctx.log.error(format!("{reason}; continuing without effects"));
    }
    let fx_mode = config.mode == LiveMode::Fx;
    ctx.stats
        .fx_bypassed
        .store(fx_mode && adapter.is_bypassed(), Ordering::Relaxed);

    on_ready();
    ctx.log.info(format!(
        "running {} mode: {} -> {} @ {} Hz, {} frames{}",
        config.mode,
        config.input_device,
        config.output_device,
        config.format.sample_rate,
        config.format.block_frames,
        config
            .preset_name()
            .map(|p| format!(", preset {p}"))
            .unwrap_or_default()
    ));

    let feed = ctx.servo.attach(config.servo);
    let mut block = vec![0.0f32; config.format.block_samples()];

    let result = loop {
        if ctx.cancel.is_cancelled() {
            break Ok(());
        }
        if let Err(e) = source.read(&mut block) {
            break Err(e);
        }

        let (input_db, output_db) = ctx.gains.get();
        apply_gain(&mut block, db_to_linear(input_db));

        match adapter.process(&mut block) {
            Ok(()) => {}
            Err(e @ ChatterError::EffectOverrun { .. }) => {
                let n = ctx.stats.overruns.fetch_add(1, Ordering::Relaxed) + 1;
                ctx.log.warn(format!("{e} (overrun #{n}), block passed dry"));
                if adapter.is_bypassed() {
                    ctx.log.error("effect chain keeps missing its deadline; bypassing for this session");
                }
            }
            Err(e) => {
                ctx.log.error(format!("{e}; continuing without effects"));
            }
        }
        if fx_mode && adapter.is_bypassed() {
            ctx.stats.fx_bypassed.store(true, Ordering::Relaxed);
        }

        apply_gain(&mut block, ctx.gains.output_linear(output_db));
        if let Err(e) = sink.write(&block) {
            break Err(e);
        }
        ctx.stats.blocks.fetch_add(1, Ordering::Relaxed);
        feed.push(block_rms(&block));
    };

    feed.finish();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fx_config_from_defaults() {
        let settings = Settings::default();
        let config = LiveConfig::from_settings(&settings).unwrap();
        assert_eq!(config.mode, LiveMode::Fx);
        assert_eq!(config.format.block_frames, 256);
        assert_eq!(config.format.latency_frames, 128);
        assert_eq!(config.preset_name(), Some("neutral"));
        assert_eq!(config.servo.delay_ms, 180.0);
        assert_eq!(config.max_overruns, 8);
    }

    #[test]
    fn test_normal_config_uses_servo_delay() {
        let mut settings = Settings::default();
        settings.live.mode = LiveMode::Normal;
        settings.live.normal.ultra_low_latency = true;
        settings.servo.delay_ms = 40.0;
        let config = LiveConfig::from_settings(&settings).unwrap();
        assert_eq!(config.chain, EffectChain::Bypass);
        assert_eq!(config.servo.delay_ms, 40.0);
        assert_eq!(config.format.latency_frames, 128);
    }

    #[test]
    fn test_latency_flag_off_keeps_block_quantum() {
        let mut settings = Settings::default();
        settings.live.fx.ultra_low_latency = false;
        let config = LiveConfig::from_settings(&settings).unwrap();
        assert_eq!(config.format, StreamFormat::new(48_000, 1, 256));
    }

    #[test]
    fn test_muted_output_is_silent() {
        let gains = LiveGains::new(0.0, 6.0);
        assert!((gains.output_linear(6.0) - 1.995).abs() < 0.01);
        gains.set_muted(true);
        assert_eq!(gains.output_linear(6.0), 0.0);
        assert_eq!(gains.get(), (0.0, 6.0));
    }

    #[test]
    fn test_unknown_preset_is_invalid() {
        let mut settings = Settings::default();
        settings.live.fx.preset = "robot".into();
        assert!(matches!(
            LiveConfig::from_settings(&settings),
            Err(ChatterError::ConfigInvalid(_))
        ));
    }
}

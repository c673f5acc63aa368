//! The soundboard control surface.
//!
//! Owns one of each component and the settings document. Mutations go
//! through [`Soundboard::update_settings`]: validate, persist, apply what can
//! change live, and report whether anything else needs a restart.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chatterconf::{LiveSettings, ServoSettings, Settings, SettingsStore, TrackMeta};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::actuator::ActuatorDriver;
use crate::backend::AudioBackend;
use crate::effects::EffectBackend;
use crate::error::{ChatterError, ErrorSlot, LastError};
use crate::live::LiveConfig;
use crate::log_buffer::LogEntry;
use crate::playback::{PlaybackController, PlaybackOptions, PlaybackStatus};
use crate::registry::{DeviceDescriptor, DeviceRegistry};
use crate::servo::{ServoControl, ServoSynchronizer};
use crate::supervisor::{LiveStatus, LiveSupervisor};
use crate::tracks::{list_tracks, resolve_track, Track};

/// The outside world the board drives.
pub struct Hardware {
    pub audio: Arc<dyn AudioBackend>,
    pub effects: Arc<dyn EffectBackend>,
    pub actuator: Box<dyn ActuatorDriver>,
}

/// Result of a settings mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ApplyOutcome {
    /// Some changed value only takes effect on the next session or process start.
    pub restart_required: bool,
}

pub struct Soundboard {
    store: Arc<dyn SettingsStore>,
    sound_dir: PathBuf,
    settings: RwLock<Settings>,
    updates: Mutex<()>,
    registry: Arc<DeviceRegistry>,
    servo: Arc<ServoSynchronizer>,
    playback: PlaybackController,
    live: LiveSupervisor,
    errors: ErrorSlot,
}

impl Soundboard {
    /// Load settings from `store` and bring up every component.
    pub fn open(
        store: Arc<dyn SettingsStore>,
        sound_dir: impl Into<PathBuf>,
        hardware: Hardware,
    ) -> Result<Self, ChatterError> {
        let settings = store.load()?;
        settings.validate()?;

        let errors = ErrorSlot::new();
        let registry = Arc::new(DeviceRegistry::new(
            Arc::clone(&hardware.audio),
            settings.audio.output_device.clone(),
        ));
        let servo = Arc::new(ServoSynchronizer::spawn(
            hardware.actuator,
            Arc::new(ServoControl::from_settings(&settings.servo)),
            errors.clone(),
        ));
        let playback = PlaybackController::new(
            Arc::clone(&registry),
            Arc::clone(&hardware.audio),
            Arc::clone(&servo),
            PlaybackOptions::from_settings(&settings),
            settings.audio.gain_db,
            errors.clone(),
        );
        let live = LiveSupervisor::new(
            Arc::clone(&registry),
            hardware.audio,
            hardware.effects,
            Arc::clone(&servo),
            errors.clone(),
        );
        playback.set_muted(settings.audio.muted);
        live.set_muted(settings.audio.muted);

        Ok(Self {
            store,
            sound_dir: sound_dir.into(),
            settings: RwLock::new(settings),
            updates: Mutex::new(()),
            registry,
            servo,
            playback,
            live,
            errors,
        })
    }

    pub fn sound_dir(&self) -> &Path {
        &self.sound_dir
    }

    pub fn servo(&self) -> &ServoSynchronizer {
        &self.servo
    }

    // --- devices ---

    pub fn devices(&self) -> Result<Vec<DeviceDescriptor>, ChatterError> {
        self.registry.devices()
    }

    pub fn current_device(&self) -> String {
        self.registry.selected()
    }

    /// Persist a new output selection. Streams already open keep their device.
    pub fn select_device(&self, id: &str) -> Result<ApplyOutcome, ChatterError> {
        self.modify(|s| s.audio.output_device = id.to_string())?;
        Ok(ApplyOutcome {
            restart_required: true,
        })
    }

    // --- playback ---

    /// Playable clips with their stored gain and categories.
    pub fn tracks(&self) -> Result<Vec<Track>, ChatterError> {
        let settings = self.settings();
        Ok(list_tracks(&self.sound_dir)?
            .into_iter()
            .map(|t| {
                let meta = settings.tracks.get(&t.file);
                t.with_meta(meta)
            })
            .collect())
    }

    /// Play a file from the sound directory.
    ///
    /// Without an explicit gain the file's stored gain applies.
    pub fn play(&self, file: &str, gain_db: Option<f32>) -> Result<Uuid, ChatterError> {
        let track = resolve_track(&self.sound_dir, file).inspect_err(|e| self.errors.record(e))?;
        let settings = self.settings();
        let meta = settings.tracks.get(&track.file);
        let track = track.with_meta(meta);
        self.playback.play(track, gain_db)
    }

    /// Store gain and categories for one clip; empty metadata removes the entry.
    pub fn set_track_meta(&self, file: &str, meta: TrackMeta) -> Result<ApplyOutcome, ChatterError> {
        let track = resolve_track(&self.sound_dir, file).inspect_err(|e| self.errors.record(e))?;
        self.modify(|s| {
            if meta == TrackMeta::default() {
                s.tracks.remove(&track.file);
            } else {
                s.tracks.insert(track.file, meta);
            }
        })
    }

    pub fn set_muted(&self, muted: bool) -> Result<ApplyOutcome, ChatterError> {
        self.modify(|s| s.audio.muted = muted)
    }

    /// Flip the mute flag; returns the new state.
    pub fn toggle_mute(&self) -> Result<bool, ChatterError> {
        let mut muted = false;
        self.modify(|s| {
            s.audio.muted = !s.audio.muted;
            muted = s.audio.muted;
        })?;
        Ok(muted)
    }

    pub fn stop(&self, hard: bool) -> bool {
        self.playback.stop(hard)
    }

    pub fn test_tone(&self, freq_hz: f32, level_dbfs: f32) -> Result<Uuid, ChatterError> {
        self.playback.test_tone(freq_hz, level_dbfs)
    }

    pub fn playback_status(&self) -> PlaybackStatus {
        self.playback.status()
    }

    pub fn wait_playback_idle(&self, timeout: Duration) -> bool {
        self.playback.wait_idle(timeout)
    }

    // --- live ---

    pub fn live_settings(&self) -> LiveSettings {
        self.settings().live
    }

    pub fn update_live_settings(&self, live: LiveSettings) -> Result<ApplyOutcome, ChatterError> {
        self.modify(|s| s.live = live)
    }

    /// Start a session from the current live settings.
    pub fn start_live(&self) -> Result<(), ChatterError> {
        let config = LiveConfig::from_settings(&self.settings())?;
        self.live.start(config)
    }

    /// Request a stop; the session winds down on its own thread.
    pub fn stop_live(&self) -> bool {
        self.live.stop()
    }

    pub fn wait_live_idle(&self, timeout: Duration) -> bool {
        self.live.wait_until_idle(timeout)
    }

    pub fn live_status(&self) -> LiveStatus {
        self.live.status()
    }

    pub fn live_log(&self, n: usize) -> Vec<LogEntry> {
        self.live.log_tail(n)
    }

    // --- servo ---

    pub fn servo_settings(&self) -> ServoSettings {
        self.settings().servo
    }

    pub fn update_servo_settings(&self, servo: ServoSettings) -> Result<ApplyOutcome, ChatterError> {
        self.modify(|s| s.servo = servo)
    }

    // --- whole document ---

    pub fn settings(&self) -> Settings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Validate, persist, then apply.
    ///
    /// Nothing is saved or applied unless every check passes.
    pub fn update_settings(&self, next: Settings) -> Result<ApplyOutcome, ChatterError> {
        let _serial = crate::lock(&self.updates);
        self.commit(next)
    }

    /// Change part of the current document as one update.
    fn modify(&self, change: impl FnOnce(&mut Settings)) -> Result<ApplyOutcome, ChatterError> {
        let _serial = crate::lock(&self.updates);
        let mut next = self.settings();
        change(&mut next);
        self.commit(next)
    }

    /// Caller holds `updates`.
    fn commit(&self, mut next: Settings) -> Result<ApplyOutcome, ChatterError> {
        next.validate().inspect_err(|e| self.errors.record_message(e.to_string()))?;

        let prev = self.settings();
        let output = if next.audio.output_device != prev.audio.output_device {
            let device = self
                .registry
                .validate_output(&next.audio.output_device)
                .inspect_err(|e| self.errors.record(e))?;
            // display names are stored as the stable id
            next.audio.output_device = device.id.clone();
            Some(device)
        } else {
            None
        };

        self.store.save(&next).map_err(|e| {
            let e = ChatterError::from(e);
            self.errors.record(&e);
            e
        })?;

        let restart_required = restart_required(&prev, &next);
        self.apply_hot(&next);
        if let Some(device) = &output {
            self.registry.select(device);
        }
        *self.settings.write().unwrap_or_else(PoisonError::into_inner) = next;

        info!(restart_required, "settings updated");
        Ok(ApplyOutcome { restart_required })
    }

    pub fn last_error(&self) -> Option<LastError> {
        self.errors.get()
    }

    /// Stop everything and close the actuator.
    pub fn shutdown(&self) {
        self.live.shutdown();
        self.playback.shutdown();
        self.servo.shutdown();
    }

    fn apply_hot(&self, next: &Settings) {
        let control = self.servo.control();
        control.set_range(next.servo.closed_angle, next.servo.open_angle);
        control.set_enabled(next.servo.enabled);

        self.playback.set_master_gain_db(next.audio.gain_db);
        self.playback.set_muted(next.audio.muted);
        self.live.set_muted(next.audio.muted);
        self.playback.set_options(PlaybackOptions::from_settings(next));

        // Gains of the mode the running session was started in
        if let Some(mode) = self.live.status().mode {
            let (input_db, output_db) = match mode {
                chatterconf::LiveMode::Normal => {
                    (next.live.normal.input_gain_db, next.live.normal.output_gain_db)
                }
                chatterconf::LiveMode::Fx => (next.live.fx.input_gain_db, next.live.fx.output_gain_db),
            };
            self.live.set_gains(input_db, output_db);
        }
    }
}

impl Drop for Soundboard {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Whether `next` changes anything that is only read at session or process start.
fn restart_required(prev: &Settings, next: &Settings) -> bool {
    let (ps, ns) = (&prev.servo, &next.servo);
    let servo = ps.gpio != ns.gpio
        || ps.power_gpio != ns.power_gpio
        || ps.delay_ms != ns.delay_ms
        || ps.min_update_ms != ns.min_update_ms;

    let (pn, nn) = (&prev.live.normal, &next.live.normal);
    let normal = pn.sample_rate != nn.sample_rate
        || pn.block_size != nn.block_size
        || pn.input_device != nn.input_device
        || pn.output_device != nn.output_device
        || pn.ultra_low_latency != nn.ultra_low_latency;

    let (pf, nf) = (&prev.live.fx, &next.live.fx);
    let fx = pf.sample_rate != nf.sample_rate
        || pf.block_size != nf.block_size
        || pf.input_device != nf.input_device
        || pf.output_device != nf.output_device
        || pf.preset != nf.preset
        || pf.sox_buffer_frames != nf.sox_buffer_frames
        || pf.servo_delay_ms != nf.servo_delay_ms
        || pf.max_overruns != nf.max_overruns
        || pf.ultra_low_latency != nf.ultra_low_latency
        || prev.presets.get(&nf.preset) != next.presets.get(&nf.preset);

    prev.audio.output_device != next.audio.output_device
        || prev.live.mode != next.live.mode
        || servo
        || normal
        || fx
}

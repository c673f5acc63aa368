//! The persisted settings document - runtime state seeded from defaults.
//!
//! Every section carries an `extra` map so that keys written by other tools
//! (a web front-end, category tags, UI-only toggles) survive a load/save
//! round trip untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::SettingsError;

/// GPIO pins usable for servo and power on a 40-pin header.
pub const GPIO_PINS: &[u8] = &[2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27];

/// Bounds for every gain in the document, and for per-clip overrides.
pub const MIN_GAIN_DB: f32 = -60.0;
pub const MAX_GAIN_DB: f32 = 24.0;

/// Complete settings document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub audio: AudioSettings,

    #[serde(default)]
    pub servo: ServoSettings,

    #[serde(default)]
    pub playback: PlaybackSettings,

    #[serde(default)]
    pub live: LiveSettings,

    #[serde(default = "default_presets")]
    pub presets: BTreeMap<String, PresetParams>,

    /// Per-file metadata keyed by file name in the sound directory.
    #[serde(default)]
    pub tracks: BTreeMap<String, TrackMeta>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            audio: AudioSettings::default(),
            servo: ServoSettings::default(),
            playback: PlaybackSettings::default(),
            live: LiveSettings::default(),
            presets: default_presets(),
            tracks: BTreeMap::new(),
            extra: Map::new(),
        }
    }
}

/// Output device and playback engine tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioSettings {
    /// Output device id or name; `"default"` lets the sound server route.
    #[serde(default = "default_device")]
    pub output_device: String,

    /// Tried in order when the selected device fails to open.
    #[serde(default)]
    pub fallback_devices: Vec<String>,

    /// Frames per block written by the playback path.
    #[serde(default = "AudioSettings::default_block_frames")]
    pub block_frames: u32,

    /// Master playback gain (hot).
    #[serde(default)]
    pub gain_db: f32,

    /// Silences clips and live output alike; the gains are kept (hot).
    #[serde(default)]
    pub muted: bool,

    #[serde(default = "AudioSettings::default_test_tone_ms")]
    pub test_tone_ms: u32,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AudioSettings {
    fn default_block_frames() -> u32 {
        512
    }

    fn default_test_tone_ms() -> u32 {
        1000
    }
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            output_device: default_device(),
            fallback_devices: Vec::new(),
            block_frames: Self::default_block_frames(),
            gain_db: 0.0,
            muted: false,
            test_tone_ms: Self::default_test_tone_ms(),
            extra: Map::new(),
        }
    }
}

/// Mouth servo and amplifier power pin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServoSettings {
    /// Servo signal pin; `null` disables actuation entirely.
    #[serde(default = "ServoSettings::default_gpio")]
    pub gpio: Option<u8>,

    /// Amplifier/servo power pin, driven high while a stream is attached.
    #[serde(default = "ServoSettings::default_power_gpio")]
    pub power_gpio: Option<u8>,

    #[serde(default = "ServoSettings::default_closed_angle")]
    pub closed_angle: f32,

    #[serde(default = "ServoSettings::default_open_angle")]
    pub open_angle: f32,

    /// Amplitude-to-angle delay compensating output latency.
    #[serde(default = "ServoSettings::default_delay_ms")]
    pub delay_ms: f32,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Minimum stream time between two angle writes.
    #[serde(default = "ServoSettings::default_min_update_ms")]
    pub min_update_ms: u32,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ServoSettings {
    fn default_gpio() -> Option<u8> {
        Some(17)
    }

    fn default_power_gpio() -> Option<u8> {
        Some(23)
    }

    fn default_closed_angle() -> f32 {
        5.0
    }

    fn default_open_angle() -> f32 {
        65.0
    }

    fn default_delay_ms() -> f32 {
        180.0
    }

    fn default_min_update_ms() -> u32 {
        20
    }
}

impl Default for ServoSettings {
    fn default() -> Self {
        Self {
            gpio: Self::default_gpio(),
            power_gpio: Self::default_power_gpio(),
            closed_angle: Self::default_closed_angle(),
            open_angle: Self::default_open_angle(),
            delay_ms: Self::default_delay_ms(),
            enabled: true,
            min_update_ms: Self::default_min_update_ms(),
            extra: Map::new(),
        }
    }
}

/// What happens when a clip is requested while another one is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayPolicy {
    /// Stop the active clip, then start the new one.
    #[default]
    Preempt,
    /// Refuse the new clip with a busy error.
    Reject,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlaybackSettings {
    #[serde(default)]
    pub policy: PlayPolicy,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LiveMode {
    /// Microphone straight to the output.
    Normal,
    /// Microphone through the effects processor.
    #[default]
    Fx,
}

impl std::fmt::Display for LiveMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LiveMode::Normal => f.write_str("normal"),
            LiveMode::Fx => f.write_str("fx"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LiveSettings {
    #[serde(default)]
    pub mode: LiveMode,

    #[serde(default)]
    pub normal: LiveNormalSettings,

    #[serde(default)]
    pub fx: LiveFxSettings,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Dry microphone pass-through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveNormalSettings {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    #[serde(default = "default_live_block_size")]
    pub block_size: u32,

    #[serde(default = "default_device")]
    pub input_device: String,

    #[serde(default = "default_device")]
    pub output_device: String,

    #[serde(default)]
    pub input_gain_db: f32,

    #[serde(default)]
    pub output_gain_db: f32,

    /// Ask the sound server for a half-block quantum.
    #[serde(default = "default_true")]
    pub ultra_low_latency: bool,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for LiveNormalSettings {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            block_size: default_live_block_size(),
            input_device: default_device(),
            output_device: default_device(),
            input_gain_db: 0.0,
            output_gain_db: 0.0,
            ultra_low_latency: true,
            extra: Map::new(),
        }
    }
}

/// Microphone through the SoX effect chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveFxSettings {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    #[serde(default = "default_live_block_size")]
    pub block_size: u32,

    #[serde(default = "default_device")]
    pub input_device: String,

    #[serde(default = "default_device")]
    pub output_device: String,

    #[serde(default)]
    pub input_gain_db: f32,

    #[serde(default)]
    pub output_gain_db: f32,

    /// Key into [`Settings::presets`].
    #[serde(default = "LiveFxSettings::default_preset")]
    pub preset: String,

    #[serde(default = "LiveFxSettings::default_sox_buffer_frames")]
    pub sox_buffer_frames: u32,

    /// Servo delay for this path; SoX adds its own buffering on top of the device.
    #[serde(default = "LiveFxSettings::default_servo_delay_ms")]
    pub servo_delay_ms: f32,

    /// Consecutive late blocks tolerated before the session drops to bypass.
    #[serde(default = "LiveFxSettings::default_max_overruns")]
    pub max_overruns: u32,

    #[serde(default = "default_true")]
    pub ultra_low_latency: bool,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LiveFxSettings {
    fn default_preset() -> String {
        "neutral".to_string()
    }

    fn default_sox_buffer_frames() -> u32 {
        256
    }

    fn default_servo_delay_ms() -> f32 {
        180.0
    }

    fn default_max_overruns() -> u32 {
        8
    }
}

impl Default for LiveFxSettings {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            block_size: default_live_block_size(),
            input_device: default_device(),
            output_device: default_device(),
            input_gain_db: 0.0,
            output_gain_db: 0.0,
            preset: Self::default_preset(),
            sox_buffer_frames: Self::default_sox_buffer_frames(),
            servo_delay_ms: Self::default_servo_delay_ms(),
            max_overruns: Self::default_max_overruns(),
            ultra_low_latency: true,
            extra: Map::new(),
        }
    }
}

/// One named effect bundle.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PresetParams {
    #[serde(default)]
    pub pitch_semitones: f32,

    #[serde(default)]
    pub reverb: f32,

    #[serde(default)]
    pub bass_db: f32,

    #[serde(default)]
    pub treble_db: f32,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PresetParams {
    pub fn new(pitch_semitones: f32, reverb: f32, bass_db: f32, treble_db: f32) -> Self {
        Self {
            pitch_semitones,
            reverb,
            bass_db,
            treble_db,
            extra: Map::new(),
        }
    }
}

/// What the library knows about one clip beyond the file itself.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrackMeta {
    /// Used when `play` is called without a gain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gain_db: Option<f32>,

    /// Category names, in the order they were assigned.
    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_device() -> String {
    "default".to_string()
}

fn default_sample_rate() -> u32 {
    48_000
}

fn default_live_block_size() -> u32 {
    256
}

fn default_true() -> bool {
    true
}

pub fn default_presets() -> BTreeMap<String, PresetParams> {
    [
        ("neutral", PresetParams::new(0.0, 0.0, 0.0, 0.0)),
        ("daemon", PresetParams::new(-8.0, 18.0, 6.0, -2.0)),
        ("monster", PresetParams::new(-12.0, 12.0, 9.0, -3.0)),
        ("cave", PresetParams::new(-4.0, 35.0, 2.0, -4.0)),
        ("helium", PresetParams::new(7.0, 8.0, -3.0, 5.0)),
        ("funky", PresetParams::new(3.0, 10.0, 2.0, 6.0)),
        ("whisper", PresetParams::new(0.0, 45.0, -6.0, 2.0)),
    ]
    .into_iter()
    .map(|(name, params)| (name.to_string(), params))
    .collect()
}

fn check_range<T>(field: &str, value: T, lo: T, hi: T) -> Result<(), SettingsError>
where
    T: PartialOrd + std::fmt::Display + Copy,
{
    // NaN fails both comparisons, so test containment rather than exclusion
    if value >= lo && value <= hi {
        Ok(())
    } else {
        Err(SettingsError::Invalid {
            field: field.to_string(),
            reason: format!("{value} is outside {lo}..={hi}"),
        })
    }
}

fn check_gpio(field: &str, pin: Option<u8>) -> Result<(), SettingsError> {
    match pin {
        Some(p) if !GPIO_PINS.contains(&p) => Err(SettingsError::Invalid {
            field: field.to_string(),
            reason: format!("GPIO {p} is not a usable header pin"),
        }),
        _ => Ok(()),
    }
}

fn check_stream(prefix: &str, sample_rate: u32, block_size: u32, in_db: f32, out_db: f32) -> Result<(), SettingsError> {
    check_range(&format!("{prefix}.sample_rate"), sample_rate, 8_000, 192_000)?;
    check_range(&format!("{prefix}.block_size"), block_size, 16, 8192)?;
    check_range(&format!("{prefix}.input_gain_db"), in_db, MIN_GAIN_DB, MAX_GAIN_DB)?;
    check_range(&format!("{prefix}.output_gain_db"), out_db, MIN_GAIN_DB, MAX_GAIN_DB)
}

impl Settings {
    /// Reject out-of-range values before anything is applied or persisted.
    pub fn validate(&self) -> Result<(), SettingsError> {
        let audio = &self.audio;
        if audio.output_device.trim().is_empty() {
            return Err(SettingsError::Invalid {
                field: "audio.output_device".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        check_range("audio.block_frames", audio.block_frames, 16, 8192)?;
        check_range("audio.gain_db", audio.gain_db, MIN_GAIN_DB, MAX_GAIN_DB)?;
        check_range("audio.test_tone_ms", audio.test_tone_ms, 50, 10_000)?;

        let servo = &self.servo;
        check_gpio("servo.gpio", servo.gpio)?;
        check_gpio("servo.power_gpio", servo.power_gpio)?;
        if servo.gpio.is_some() && servo.gpio == servo.power_gpio {
            return Err(SettingsError::Invalid {
                field: "servo.power_gpio".to_string(),
                reason: "must differ from servo.gpio".to_string(),
            });
        }
        check_range("servo.closed_angle", servo.closed_angle, 0.0, 180.0)?;
        check_range("servo.open_angle", servo.open_angle, 0.0, 180.0)?;
        if servo.open_angle < servo.closed_angle {
            return Err(SettingsError::Invalid {
                field: "servo.open_angle".to_string(),
                reason: format!(
                    "{} is below closed_angle {}",
                    servo.open_angle, servo.closed_angle
                ),
            });
        }
        check_range("servo.delay_ms", servo.delay_ms, 0.0, 1000.0)?;
        check_range("servo.min_update_ms", servo.min_update_ms, 1, 1000)?;

        let normal = &self.live.normal;
        check_stream(
            "live.normal",
            normal.sample_rate,
            normal.block_size,
            normal.input_gain_db,
            normal.output_gain_db,
        )?;

        let fx = &self.live.fx;
        check_stream("live.fx", fx.sample_rate, fx.block_size, fx.input_gain_db, fx.output_gain_db)?;
        check_range("live.fx.sox_buffer_frames", fx.sox_buffer_frames, 64, 8192)?;
        check_range("live.fx.servo_delay_ms", fx.servo_delay_ms, 0.0, 1000.0)?;
        check_range("live.fx.max_overruns", fx.max_overruns, 1, 1000)?;
        if !self.presets.contains_key(&fx.preset) {
            return Err(SettingsError::Invalid {
                field: "live.fx.preset".to_string(),
                reason: format!("unknown preset '{}'", fx.preset),
            });
        }

        for (file, meta) in &self.tracks {
            if let Some(gain_db) = meta.gain_db {
                check_range(&format!("tracks.{file}.gain_db"), gain_db, MIN_GAIN_DB, MAX_GAIN_DB)?;
            }
            if meta.tags.iter().any(|t| t.trim().is_empty()) {
                return Err(SettingsError::Invalid {
                    field: format!("tracks.{file}.tags"),
                    reason: "tags must not be blank".to_string(),
                });
            }
        }

        for (name, preset) in &self.presets {
            check_range(&format!("presets.{name}.pitch_semitones"), preset.pitch_semitones, -24.0, 24.0)?;
            check_range(&format!("presets.{name}.reverb"), preset.reverb, 0.0, 100.0)?;
            check_range(&format!("presets.{name}.bass_db"), preset.bass_db, -30.0, 30.0)?;
            check_range(&format!("presets.{name}.treble_db"), preset.treble_db, -30.0, 30.0)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.servo.gpio, Some(17));
        assert_eq!(settings.live.mode, LiveMode::Fx);
        assert_eq!(settings.presets.len(), 7);
        assert_eq!(settings.presets["monster"].pitch_semitones, -12.0);
    }

    #[test]
    fn test_empty_document_fills_defaults() {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_unknown_fields_round_trip() {
        let doc = r#"{
            "categories": {"intro.mp3": ["greetings"]},
            "servo": {"gpio": 18, "ui_color": "teal"},
            "live": {"mode": "normal", "fx": {"preset": "cave", "knob_layout": [1, 2]}},
            "presets": {"cave": {"pitch_semitones": -4, "reverb": 35, "label": "Cave"}}
        }"#;
        let settings: Settings = serde_json::from_str(doc).unwrap();
        assert_eq!(settings.servo.gpio, Some(18));
        assert_eq!(settings.live.mode, LiveMode::Normal);

        let written = serde_json::to_value(&settings).unwrap();
        assert_eq!(written["categories"]["intro.mp3"][0], "greetings");
        assert_eq!(written["servo"]["ui_color"], "teal");
        assert_eq!(written["live"]["fx"]["knob_layout"][1], 2);
        assert_eq!(written["presets"]["cave"]["label"], "Cave");

        let reread: Settings = serde_json::from_value(written).unwrap();
        assert_eq!(reread, settings);
    }

    #[test]
    fn test_null_gpio_disables_servo() {
        let settings: Settings = serde_json::from_str(r#"{"servo": {"gpio": null}}"#).unwrap();
        assert_eq!(settings.servo.gpio, None);
        settings.validate().unwrap();
    }

    #[test]
    fn test_rejects_inverted_angles() {
        let mut settings = Settings::default();
        settings.servo.closed_angle = 90.0;
        settings.servo.open_angle = 30.0;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("servo.open_angle"));
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        let mut settings = Settings::default();
        settings.servo.delay_ms = 1500.0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.servo.gpio = Some(14);
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.live.fx.block_size = 4;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.audio.gain_db = f32::NAN;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_low_latency_on_by_default_in_both_modes() {
        let settings: Settings = serde_json::from_str(r#"{"live": {"fx": {}}}"#).unwrap();
        assert!(settings.live.normal.ultra_low_latency);
        assert!(settings.live.fx.ultra_low_latency);
        assert!(!settings.audio.muted);
    }

    #[test]
    fn test_track_meta() {
        let doc = r#"{"tracks": {"intro.mp3": {"gain_db": -4.5, "tags": ["greetings"], "color": 3}}}"#;
        let mut settings: Settings = serde_json::from_str(doc).unwrap();
        settings.validate().unwrap();
        let meta = &settings.tracks["intro.mp3"];
        assert_eq!(meta.gain_db, Some(-4.5));
        assert_eq!(meta.tags, ["greetings"]);
        assert_eq!(serde_json::to_value(&settings).unwrap()["tracks"]["intro.mp3"]["color"], 3);

        settings.tracks.insert(
            "loud.wav".into(),
            TrackMeta {
                gain_db: Some(40.0),
                ..TrackMeta::default()
            },
        );
        assert!(settings.validate().unwrap_err().to_string().contains("tracks.loud.wav"));

        settings.tracks.remove("loud.wav");
        settings.tracks.insert(
            "blank.wav".into(),
            TrackMeta {
                tags: vec!["  ".into()],
                ..TrackMeta::default()
            },
        );
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_rejects_unknown_preset() {
        let mut settings = Settings::default();
        settings.live.fx.preset = "robot".to_string();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("robot"));
    }
}

//! Chatterbox: soundboard engine
//!
//! Plays clips and live microphone audio through one shared output device
//! and keeps a servo "mouth" moving with whatever is audible.
//!
//! ```text
//!                ┌────────────────────┐
//!  play/tone ──▶ │ PlaybackController │──┐
//!                └────────────────────┘  │ OwnershipToken  ┌──────────┐
//!                                        ├───────────────▶ │ PipeWire │
//!                ┌────────────────────┐  │                 └──────────┘
//!  start_live ─▶ │   LiveSupervisor   │──┘
//!                │  mic ▶ SoX ▶ out   │
//!                └─────────┬──────────┘
//!                          │ block RMS
//!                          ▼
//!                ┌────────────────────┐      ┌─────────┐
//!                │ ServoSynchronizer  │ ───▶ │ pigpiod │
//!                └────────────────────┘      └─────────┘
//! ```
//!
//! Hardware sits behind traits ([`AudioBackend`], [`EffectBackend`],
//! [`ActuatorDriver`]); the [`sim`] module provides in-process stand-ins.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod actuator;
pub mod backend;
pub mod board;
pub mod decode;
pub mod effects;
pub mod envelope;
pub mod error;
pub mod live;
pub mod log_buffer;
pub mod pigpio;
pub mod pipewire;
pub mod pipewire_input;
pub mod pipewire_output;
pub mod playback;
pub mod registry;
pub mod ring;
pub mod servo;
pub mod sim;
pub mod sox;
pub mod supervisor;
pub mod tracks;

pub use actuator::{angle_to_pulse_us, ActuatorDriver, NullActuator};
pub use backend::{AudioBackend, AudioSink, AudioSource, StreamFormat};
pub use board::{ApplyOutcome, Hardware, Soundboard};
pub use decode::{decode_audio, decode_file, decode_wav, read_duration, DecodedAudio};
pub use effects::{EffectBackend, EffectChain, EffectChainAdapter, EffectProcessor, FxPreset};
pub use envelope::{DelayLine, Envelope};
pub use error::{ChatterError, ErrorSlot, LastError};
pub use live::{LiveConfig, LiveGains, LiveStats};
pub use log_buffer::{LogBuffer, LogEntry, LogLevel};
pub use pigpio::{PigpioDriver, PigpioError};
pub use pipewire::PipeWireBackend;
pub use pipewire_input::{PipeWireInputConfig, PipeWireInputError, PipeWireSource};
pub use pipewire_output::{PipeWireOutputConfig, PipeWireOutputError, PipeWireSink};
pub use playback::{JobSource, JobState, PlaybackController, PlaybackJob, PlaybackOptions, PlaybackStatus};
pub use registry::{DeviceDescriptor, DeviceRegistry, Owner, OwnershipToken, DEFAULT_DEVICE};
pub use ring::{audio_ring_pair, AudioRingConsumer, AudioRingProducer};
pub use servo::{ServoControl, ServoFeed, ServoState, ServoSynchronizer, ServoTiming};
pub use sox::SoxBackend;
pub use supervisor::{LiveStatus, LiveSupervisor, SessionState, STOP_TIMEOUT};
pub use tracks::{list_tracks, resolve_track, Track};

/// Lock a mutex, taking the data even if another thread panicked with it held.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

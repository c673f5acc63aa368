//! Clip playback controller
//!
//! One job slot. A job owns the output device through an
//! [`OwnershipToken`] for its whole life and runs on its own thread:
//!
//! ```text
//! play() ─▶ acquire ─▶ decode ─▶ open sink ─▶ spawn ─┐
//!                                                    ▼
//!                         ┌──────── per block ────────────────┐
//!                         │ cancelled? ─▶ abort / drain, stop │
//!                         │ gain ─▶ sink.write ─▶ servo feed  │
//!                         └───────────────────────────────────┘
//!                                                    │
//!                servo closed ─▶ close sink ─▶ release ─▶ publish state
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chatterconf::{PlayPolicy, Settings, MAX_GAIN_DB, MIN_GAIN_DB};
use chrono::{DateTime, Utc};
use portable_atomic::AtomicF32;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{apply_gain, block_rms, db_to_linear, AudioBackend, AudioSink, StreamFormat};
use crate::decode::{decode_file, DecodedAudio};
use crate::error::{ChatterError, ErrorSlot, LastError};
use crate::registry::{DeviceRegistry, Owner, OwnershipToken};
use crate::servo::{ServoSynchronizer, ServoTiming};
use crate::tracks::Track;

/// Sample rate of synthesized test tones.
pub const TONE_SAMPLE_RATE: u32 = 48_000;

/// Lifecycle of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued = 0,
    Playing = 1,
    Finished = 2,
    Stopped = 3,
    Failed = 4,
}

impl JobState {
    fn from_code(code: u8) -> Self {
        match code {
            0 => JobState::Queued,
            1 => JobState::Playing,
            2 => JobState::Finished,
            3 => JobState::Stopped,
            _ => JobState::Failed,
        }
    }

    /// Queued or Playing.
    pub fn is_active(self) -> bool {
        matches!(self, JobState::Queued | JobState::Playing)
    }
}

/// What a job plays.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum JobSource {
    File { track: Track },
    Tone { freq_hz: f32, level_dbfs: f32 },
}

impl JobSource {
    pub fn label(&self) -> String {
        match self {
            JobSource::File { track } => track.name.clone(),
            JobSource::Tone { freq_hz, level_dbfs } => {
                format!("test tone {freq_hz:.0} Hz @ {level_dbfs:.1} dBFS")
            }
        }
    }
}

/// Snapshot of a job.
#[derive(Debug, Clone, Serialize)]
pub struct PlaybackJob {
    pub id: Uuid,
    pub source: JobSource,
    pub gain_db: f32,
    pub enqueued_at: DateTime<Utc>,
    pub state: JobState,
    pub frames_played: u64,
    pub sample_rate: u32,
    pub error: Option<String>,
}

/// What `status()` reports.
#[derive(Debug, Clone, Serialize)]
pub struct PlaybackStatus {
    pub job_id: Option<Uuid>,
    pub track: Option<String>,
    pub state: Option<JobState>,
    /// Seconds of audio written so far.
    pub elapsed: f64,
    /// 1 while a job is queued or playing.
    pub queue_depth: usize,
    pub last_error: Option<LastError>,
}

/// Tunables read at each `play`.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackOptions {
    pub policy: PlayPolicy,
    pub block_frames: u32,
    pub fallback_devices: Vec<String>,
    pub test_tone_ms: u32,
    pub servo_delay_ms: f32,
    pub servo_min_update_ms: u32,
}

impl PlaybackOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            policy: settings.playback.policy,
            block_frames: settings.audio.block_frames,
            fallback_devices: settings.audio.fallback_devices.clone(),
            test_tone_ms: settings.audio.test_tone_ms,
            servo_delay_ms: settings.servo.delay_ms,
            servo_min_update_ms: settings.servo.min_update_ms,
        }
    }
}

impl Default for PlaybackOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// Per-job state the job thread writes and `status()` reads.
#[derive(Debug)]
struct JobShared {
    state: AtomicU8,
    frames: AtomicU64,
    error: Mutex<Option<String>>,
}

impl JobShared {
    fn new(state: JobState) -> Self {
        Self {
            state: AtomicU8::new(state as u8),
            frames: AtomicU64::new(0),
            error: Mutex::new(None),
        }
    }

    fn state(&self) -> JobState {
        JobState::from_code(self.state.load(Ordering::Acquire))
    }
}

#[derive(Debug, Clone)]
struct JobRecord {
    id: Uuid,
    source: JobSource,
    gain_db: f32,
    enqueued_at: DateTime<Utc>,
    sample_rate: u32,
    shared: Arc<JobShared>,
}

impl JobRecord {
    fn snapshot(&self) -> PlaybackJob {
        PlaybackJob {
            id: self.id,
            source: self.source.clone(),
            gain_db: self.gain_db,
            enqueued_at: self.enqueued_at,
            state: self.shared.state(),
            frames_played: self.shared.frames.load(Ordering::Acquire),
            sample_rate: self.sample_rate,
            error: crate::lock(&self.shared.error).clone(),
        }
    }
}

struct ActiveJob {
    id: Uuid,
    cancel: CancellationToken,
    hard: Arc<AtomicBool>,
    shared: Arc<JobShared>,
    handle: JoinHandle<()>,
}

/// Plays clips and test tones through the shared output device.
pub struct PlaybackController {
    registry: Arc<DeviceRegistry>,
    backend: Arc<dyn AudioBackend>,
    servo: Arc<ServoSynchronizer>,
    master_gain_db: Arc<AtomicF32>,
    muted: Arc<AtomicBool>,
    options: RwLock<PlaybackOptions>,
    errors: ErrorSlot,
    current: Mutex<Option<JobRecord>>,
    active: Mutex<Option<ActiveJob>>,
    // Serializes play/test_tone so policy checks and acquisition don't interleave
    requests: Mutex<()>,
}

impl PlaybackController {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        backend: Arc<dyn AudioBackend>,
        servo: Arc<ServoSynchronizer>,
        options: PlaybackOptions,
        master_gain_db: f32,
        errors: ErrorSlot,
    ) -> Self {
        Self {
            registry,
            backend,
            servo,
            master_gain_db: Arc::new(AtomicF32::new(master_gain_db)),
            muted: Arc::new(AtomicBool::new(false)),
            options: RwLock::new(options),
            errors,
            current: Mutex::new(None),
            active: Mutex::new(None),
            requests: Mutex::new(()),
        }
    }

    /// Applies to the job in flight as well as future jobs.
    pub fn set_master_gain_db(&self, gain_db: f32) {
        self.master_gain_db.store(gain_db, Ordering::Relaxed);
    }

    pub fn master_gain_db(&self) -> f32 {
        self.master_gain_db.load(Ordering::Relaxed)
    }

    /// Silence output without touching the master gain. Applies mid-job.
    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    pub fn muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    /// Takes effect on the next job.
    pub fn set_options(&self, options: PlaybackOptions) {
        *self.options.write().unwrap_or_else(std::sync::PoisonError::into_inner) = options;
    }

    pub fn options(&self) -> PlaybackOptions {
        self.options
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Decode `track` and start playing it.
    pub fn play(&self, mut track: Track, gain_db: Option<f32>) -> Result<Uuid, ChatterError> {
        let gain_db = gain_db.or(track.gain_db).unwrap_or(0.0);
        if !(MIN_GAIN_DB..=MAX_GAIN_DB).contains(&gain_db) {
            let err = ChatterError::ConfigInvalid(format!(
                "clip gain {gain_db} dB outside {MIN_GAIN_DB}..={MAX_GAIN_DB}"
            ));
            self.errors.record(&err);
            return Err(err);
        }

        let _serial = crate::lock(&self.requests);
        let options = self.options();
        let token = self.claim_device(options.policy)?;

        let audio = match decode_file(&track.path) {
            Ok(audio) => audio,
            Err(e) => {
                warn!(track = %track.file, error = %e, "decode failed");
                self.record_failed(JobSource::File { track }, gain_db, &e);
                return Err(e);
            }
        };
        if track.duration.is_none() {
            track.duration = Some(audio.duration_seconds());
        }

        self.start(JobSource::File { track }, audio, gain_db, token, &options)
    }

    /// Play a sine through the same path as a clip.
    pub fn test_tone(&self, freq_hz: f32, level_dbfs: f32) -> Result<Uuid, ChatterError> {
        if !(20.0..=20_000.0).contains(&freq_hz) {
            return Err(ChatterError::ConfigInvalid(format!(
                "tone frequency {freq_hz} Hz outside 20..=20000"
            )));
        }
        if !level_dbfs.is_finite() || level_dbfs > 0.0 {
            return Err(ChatterError::ConfigInvalid(format!(
                "tone level {level_dbfs} dBFS must be <= 0"
            )));
        }

        let _serial = crate::lock(&self.requests);
        let options = self.options();
        let token = self.claim_device(options.policy)?;
        let audio = DecodedAudio::sine(freq_hz, level_dbfs, options.test_tone_ms, TONE_SAMPLE_RATE);
        self.start(
            JobSource::Tone {
                freq_hz,
                level_dbfs,
            },
            audio,
            0.0,
            token,
            &options,
        )
    }

    /// Signal the active job to stop; returns without waiting.
    pub fn stop(&self, hard: bool) -> bool {
        let active = crate::lock(&self.active);
        match active.as_ref() {
            Some(job) if job.shared.state().is_active() => {
                job.hard.store(hard, Ordering::Release);
                job.cancel.cancel();
                info!(job.id = %job.id, hard, "stop requested");
                true
            }
            _ => false,
        }
    }

    /// Hard-stop and join the active job.
    pub fn shutdown(&self) {
        if let Some(job) = crate::lock(&self.active).take() {
            job.hard.store(true, Ordering::Release);
            job.cancel.cancel();
            let _ = job.handle.join();
        }
    }

    pub fn status(&self) -> PlaybackStatus {
        let job = self.current_job();
        PlaybackStatus {
            job_id: job.as_ref().map(|j| j.id),
            track: job.as_ref().map(|j| j.source.label()),
            state: job.as_ref().map(|j| j.state),
            elapsed: job
                .as_ref()
                .map(|j| j.frames_played as f64 / j.sample_rate.max(1) as f64)
                .unwrap_or(0.0),
            queue_depth: job.as_ref().map_or(0, |j| j.state.is_active() as usize),
            last_error: self.errors.get(),
        }
    }

    /// The most recent job, active or not.
    pub fn current_job(&self) -> Option<PlaybackJob> {
        crate::lock(&self.current).as_ref().map(JobRecord::snapshot)
    }

    /// Poll until no job is active; false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let busy = crate::lock(&self.current)
                .as_ref()
                .is_some_and(|j| j.shared.state().is_active());
            if !busy {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(2));
        }
    }

    /// Apply the live check and the play policy, then take the device.
    fn claim_device(&self, policy: PlayPolicy) -> Result<OwnershipToken, ChatterError> {
        if self.registry.holder() == Some(Owner::Live) {
            return Err(ChatterError::DeviceBusy { holder: Owner::Live });
        }

        let mut active = crate::lock(&self.active);
        if let Some(job) = active.take() {
            let running = job.shared.state().is_active() && !job.handle.is_finished();
            if running && policy == PlayPolicy::Reject {
                *active = Some(job);
                return Err(ChatterError::DeviceBusy {
                    holder: Owner::Playback,
                });
            }
            if running {
                info!(job.id = %job.id, "preempting active job");
                job.hard.store(true, Ordering::Release);
                job.cancel.cancel();
            }
            if job.handle.join().is_err() {
                warn!(job.id = %job.id, "playback thread panicked");
            }
        }
        drop(active);

        self.registry.acquire(Owner::Playback)
    }

    fn record_failed(&self, source: JobSource, gain_db: f32, error: &ChatterError) {
        self.errors.record(error);
        let shared = Arc::new(JobShared::new(JobState::Failed));
        *crate::lock(&shared.error) = Some(error.to_string());
        *crate::lock(&self.current) = Some(JobRecord {
            id: Uuid::new_v4(),
            source,
            gain_db,
            enqueued_at: Utc::now(),
            sample_rate: 0,
            shared,
        });
    }

    /// Try the selected device, then the fallbacks.
    fn open_sink(
        &self,
        format: StreamFormat,
        options: &PlaybackOptions,
    ) -> Result<Box<dyn AudioSink>, ChatterError> {
        let mut candidates = vec![self.registry.selected()];
        for device in &options.fallback_devices {
            if !candidates.contains(device) {
                candidates.push(device.clone());
            }
        }

        let mut last = None;
        for device in &candidates {
            match self.backend.open_output(device, format) {
                Ok(sink) => {
                    debug!(%device, "output opened");
                    return Ok(sink);
                }
                Err(e) => {
                    warn!(%device, error = %e, "output open failed");
                    last = Some(e);
                }
            }
        }

        let detail = last.map(|e| e.to_string()).unwrap_or_default();
        Err(ChatterError::DeviceUnavailable(format!(
            "no output could be opened (tried {}): {}",
            candidates.join(", "),
            detail
        )))
    }

    fn start(
        &self,
        source: JobSource,
        audio: DecodedAudio,
        gain_db: f32,
        token: OwnershipToken,
        options: &PlaybackOptions,
    ) -> Result<Uuid, ChatterError> {
        // a zero-frame block would never advance
        let format = StreamFormat::new(
            audio.sample_rate,
            audio.channels as u16,
            options.block_frames.max(1),
        );
        let sink = match self.open_sink(format, options) {
            Ok(sink) => sink,
            Err(e) => {
                self.errors.record(&e);
                drop(token);
                return Err(e);
            }
        };

        let id = Uuid::new_v4();
        let shared = Arc::new(JobShared::new(JobState::Queued));
        *crate::lock(&self.current) = Some(JobRecord {
            id,
            source: source.clone(),
            gain_db,
            enqueued_at: Utc::now(),
            sample_rate: audio.sample_rate,
            shared: Arc::clone(&shared),
        });

        let cancel = CancellationToken::new();
        let hard = Arc::new(AtomicBool::new(false));
        let run = JobRun {
            id,
            audio,
            format,
            gain_db,
            master_gain_db: Arc::clone(&self.master_gain_db),
            muted: Arc::clone(&self.muted),
            cancel: cancel.clone(),
            hard: Arc::clone(&hard),
            shared: Arc::clone(&shared),
            servo: Arc::clone(&self.servo),
            timing: ServoTiming {
                sample_rate: format.sample_rate,
                block_size: format.block_frames,
                delay_ms: options.servo_delay_ms,
                min_update_ms: options.servo_min_update_ms,
            },
            errors: self.errors.clone(),
        };

        let handle = thread::Builder::new()
            .name("playback".to_string())
            .spawn(move || run.run(sink, token));
        let handle = match handle {
            Ok(handle) => handle,
            Err(e) => {
                // the closure (and with it sink and token) is dropped on failure
                let err = ChatterError::DeviceUnavailable(format!("cannot spawn playback thread: {e}"));
                shared.state.store(JobState::Failed as u8, Ordering::Release);
                self.errors.record(&err);
                return Err(err);
            }
        };

        info!(job.id = %id, source = %source.label(), gain_db, "job queued");
        *crate::lock(&self.active) = Some(ActiveJob {
            id,
            cancel,
            hard,
            shared,
            handle,
        });
        Ok(id)
    }
}

impl Drop for PlaybackController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

enum Outcome {
    Finished,
    Stopped,
    Failed(ChatterError),
}

/// Everything the job thread owns.
struct JobRun {
    id: Uuid,
    audio: DecodedAudio,
    format: StreamFormat,
    gain_db: f32,
    master_gain_db: Arc<AtomicF32>,
    muted: Arc<AtomicBool>,
    cancel: CancellationToken,
    hard: Arc<AtomicBool>,
    shared: Arc<JobShared>,
    servo: Arc<ServoSynchronizer>,
    timing: ServoTiming,
    errors: ErrorSlot,
}

impl JobRun {
    fn run(self, mut sink: Box<dyn AudioSink>, token: OwnershipToken) {
        let feed = self.servo.attach(self.timing);
        let channels = self.format.channels.max(1) as usize;
        let block_samples = self.format.block_samples();
        let mut block = vec![0.0f32; block_samples];
        let mut position = 0usize;

        let outcome = loop {
            if self.cancel.is_cancelled() {
                if self.hard.load(Ordering::Acquire) {
                    sink.abort();
                } else if let Err(e) = sink.drain() {
                    warn!(job.id = %self.id, error = %e, "drain failed");
                }
                break Outcome::Stopped;
            }

            let remaining = self.audio.samples.len() - position;
            if remaining == 0 {
                if let Err(e) = sink.drain() {
                    warn!(job.id = %self.id, error = %e, "drain failed");
                }
                break Outcome::Finished;
            }

            let n = remaining.min(block_samples);
            let out = &mut block[..n];
            out.copy_from_slice(&self.audio.samples[position..position + n]);
            let gain = if self.muted.load(Ordering::Relaxed) {
                0.0
            } else {
                db_to_linear(self.gain_db + self.master_gain_db.load(Ordering::Relaxed))
            };
            apply_gain(out, gain);

            if let Err(e) = sink.write(out) {
                break Outcome::Failed(e);
            }
            position += n;

            if self.shared.state() == JobState::Queued {
                self.shared.state.store(JobState::Playing as u8, Ordering::Release);
                debug!(job.id = %self.id, "playing");
            }
            self.shared
                .frames
                .fetch_add((n / channels) as u64, Ordering::AcqRel);
            feed.push(block_rms(out));
        };

        feed.finish();
        drop(sink);
        drop(token);

        let state = match outcome {
            Outcome::Finished => JobState::Finished,
            Outcome::Stopped => JobState::Stopped,
            Outcome::Failed(e) => {
                warn!(job.id = %self.id, error = %e, "job failed");
                *crate::lock(&self.shared.error) = Some(e.to_string());
                self.errors.record(&e);
                JobState::Failed
            }
        };
        self.shared.state.store(state as u8, Ordering::Release);
        info!(
            job.id = %self.id,
            state = ?state,
            frames = self.shared.frames.load(Ordering::Relaxed),
            "job ended"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DEFAULT_DEVICE;
    use crate::servo::ServoControl;
    use crate::sim::{RecordingActuator, SimBackend, SinkEvent};

    struct Rig {
        backend: SimBackend,
        registry: Arc<DeviceRegistry>,
        playback: PlaybackController,
        dir: tempfile::TempDir,
        clip: Track,
    }

    fn write_clip(dir: &std::path::Path, name: &str, seconds: f32) -> Track {
        let path = dir.join(name);
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 8_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for i in 0..(8_000.0 * seconds) as u32 {
            let s = ((i as f32 * 0.3).sin() * 12_000.0) as i16;
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
        Track::from_path(path).unwrap()
    }

    fn rig(backend: SimBackend, options: PlaybackOptions) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let clip = write_clip(dir.path(), "clip.wav", 0.5);
        let audio: Arc<dyn AudioBackend> = Arc::new(backend.clone());
        let registry = Arc::new(DeviceRegistry::new(Arc::clone(&audio), DEFAULT_DEVICE));
        let servo = Arc::new(ServoSynchronizer::spawn(
            Box::new(RecordingActuator::new()),
            Arc::new(ServoControl::new(5.0, 65.0, true)),
            ErrorSlot::new(),
        ));
        let playback = PlaybackController::new(
            Arc::clone(&registry),
            audio,
            servo,
            options,
            0.0,
            ErrorSlot::new(),
        );
        Rig {
            backend,
            registry,
            playback,
            dir,
            clip,
        }
    }

    fn options(policy: PlayPolicy) -> PlaybackOptions {
        PlaybackOptions {
            policy,
            block_frames: 256,
            ..PlaybackOptions::default()
        }
    }

    #[test]
    fn test_play_to_finish_releases_device() {
        let rig = rig(SimBackend::new(), options(PlayPolicy::Preempt));
        let id = rig.playback.play(rig.clip.clone(), Some(-3.0)).unwrap();
        assert!(rig.playback.wait_idle(Duration::from_secs(5)));

        let job = rig.playback.current_job().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.state, JobState::Finished);
        assert_eq!(job.frames_played, 4_000);
        assert!(matches!(
            &job.source,
            JobSource::File { track } if track.duration == Some(0.5)
        ));
        assert_eq!(rig.registry.holder(), None);

        let status = rig.playback.status();
        assert_eq!(status.queue_depth, 0);
        assert!((status.elapsed - 0.5).abs() < 1e-9);

        // -3 dB applied
        let peak_in = 12_000.0 / 32_768.0;
        let peak_out = rig
            .backend
            .written_samples()
            .iter()
            .fold(0.0f32, |m, s| m.max(s.abs()));
        assert!((peak_out / peak_in - 0.708).abs() < 0.01);
    }

    #[test]
    fn test_decode_failure_records_failed_job() {
        let rig = rig(SimBackend::new(), options(PlayPolicy::Preempt));
        let bad = rig.dir.path().join("broken.wav");
        std::fs::write(&bad, b"RIFF....garbage").unwrap();

        let err = rig
            .playback
            .play(Track::from_path(bad).unwrap(), None)
            .unwrap_err();
        assert!(matches!(err, ChatterError::DecodeFailure(_)));
        assert_eq!(rig.playback.current_job().unwrap().state, JobState::Failed);
        assert_eq!(rig.registry.holder(), None);
        assert!(rig.playback.status().last_error.is_some());
    }

    #[test]
    fn test_open_failure_leaves_jobs_untouched() {
        let backend = SimBackend::new();
        backend.fail_open(DEFAULT_DEVICE);
        let rig = rig(backend, options(PlayPolicy::Preempt));

        let err = rig.playback.play(rig.clip.clone(), None).unwrap_err();
        assert!(matches!(err, ChatterError::DeviceUnavailable(_)));
        assert!(rig.playback.current_job().is_none());
        assert_eq!(rig.registry.holder(), None);
        assert!(rig.playback.status().last_error.is_some());
    }

    #[test]
    fn test_fallback_device_used() {
        let backend = SimBackend::new();
        backend.fail_open(DEFAULT_DEVICE);
        let mut opts = options(PlayPolicy::Preempt);
        opts.fallback_devices = vec!["sim.hdmi".into(), "sim.usb".into()];
        let rig = rig(backend, opts);

        rig.playback.play(rig.clip.clone(), None).unwrap();
        assert!(rig.playback.wait_idle(Duration::from_secs(5)));
        assert!(matches!(
            &rig.backend.events()[0],
            SinkEvent::Opened { device, .. } if device == "sim.hdmi"
        ));
    }

    #[test]
    fn test_live_holder_rejects_play() {
        let rig = rig(SimBackend::new(), options(PlayPolicy::Preempt));
        let _live = rig.registry.acquire(Owner::Live).unwrap();
        assert_eq!(
            rig.playback.play(rig.clip.clone(), None).unwrap_err(),
            ChatterError::DeviceBusy { holder: Owner::Live }
        );
        assert!(rig.playback.current_job().is_none());
    }

    #[test]
    fn test_write_failure_fails_job() {
        let backend = SimBackend::new();
        backend.fail_writes_after(3);
        let rig = rig(backend, options(PlayPolicy::Preempt));

        rig.playback.play(rig.clip.clone(), None).unwrap();
        assert!(rig.playback.wait_idle(Duration::from_secs(5)));
        let job = rig.playback.current_job().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.frames_played, 3 * 256);
        assert!(job.error.is_some());
        assert_eq!(rig.registry.holder(), None);
    }

    #[test]
    fn test_tone_validation() {
        let rig = rig(SimBackend::new(), options(PlayPolicy::Preempt));
        for (freq, level) in [(10.0, -6.0), (30_000.0, -6.0), (440.0, 3.0), (440.0, f32::NAN)] {
            assert!(matches!(
                rig.playback.test_tone(freq, level),
                Err(ChatterError::ConfigInvalid(_))
            ));
        }
        assert_eq!(rig.registry.holder(), None);
    }

    #[test]
    fn test_clip_gain_out_of_range_is_rejected() {
        let rig = rig(SimBackend::new(), options(PlayPolicy::Preempt));
        for gain in [f32::NAN, f32::INFINITY, -61.0, 30.0] {
            assert!(matches!(
                rig.playback.play(rig.clip.clone(), Some(gain)),
                Err(ChatterError::ConfigInvalid(_))
            ));
        }
        assert!(rig.playback.current_job().is_none());
        assert_eq!(rig.registry.holder(), None);
        assert!(rig.backend.events().is_empty());
        assert!(rig.playback.status().last_error.is_some());

        let mut track = rig.clip.clone();
        track.gain_db = Some(f32::NAN);
        assert!(matches!(
            rig.playback.play(track, None),
            Err(ChatterError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_zero_block_frames_still_finishes() {
        let mut opts = options(PlayPolicy::Preempt);
        opts.block_frames = 0;
        let rig = rig(SimBackend::new(), opts);
        let short = write_clip(rig.dir.path(), "short.wav", 0.01);

        rig.playback.play(short, None).unwrap();
        assert!(rig.playback.wait_idle(Duration::from_secs(5)));
        let job = rig.playback.current_job().unwrap();
        assert_eq!(job.state, JobState::Finished);
        assert_eq!(job.frames_played, 80);
    }

    #[test]
    fn test_mute_silences_without_losing_gain() {
        let rig = rig(SimBackend::new(), options(PlayPolicy::Preempt));
        rig.playback.set_master_gain_db(-6.0);
        rig.playback.set_muted(true);

        rig.playback.play(rig.clip.clone(), None).unwrap();
        assert!(rig.playback.wait_idle(Duration::from_secs(5)));
        assert_eq!(rig.playback.current_job().unwrap().state, JobState::Finished);
        assert!(rig.backend.written_samples().iter().all(|s| *s == 0.0));
        assert_eq!(rig.playback.master_gain_db(), -6.0);

        rig.playback.set_muted(false);
        rig.playback.play(rig.clip.clone(), None).unwrap();
        assert!(rig.playback.wait_idle(Duration::from_secs(5)));
        assert!(rig.backend.written_samples().iter().any(|s| s.abs() > 0.1));
    }

    #[test]
    fn test_tone_plays_configured_duration() {
        let mut opts = options(PlayPolicy::Preempt);
        opts.test_tone_ms = 100;
        let rig = rig(SimBackend::new(), opts);
        rig.playback.test_tone(440.0, -12.0).unwrap();
        assert!(rig.playback.wait_idle(Duration::from_secs(5)));
        let job = rig.playback.current_job().unwrap();
        assert_eq!(job.state, JobState::Finished);
        assert_eq!(job.frames_played, 4_800);
        assert!(matches!(job.source, JobSource::Tone { .. }));
    }
}

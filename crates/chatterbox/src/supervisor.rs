//! Live session supervisor
//!
//! At most one live session runs at a time. The supervisor owns its
//! lifecycle: it takes the output device from the registry, opens both
//! streams, hands them to a dedicated thread and watches for that thread to
//! end. Whatever happens inside the session (I/O error, panic) the device is
//! released and the state settles on `Stopped` or `Crashed`; the session log
//! survives until the next start.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chatterconf::LiveMode;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backend::{AudioBackend, AudioSink, AudioSource};
use crate::effects::EffectBackend;
use crate::error::{ChatterError, ErrorSlot, LastError};
use crate::live::{run_session, LiveConfig, LiveGains, LiveStats, SessionContext};
use crate::log_buffer::{LogBuffer, LogEntry};
use crate::registry::{DeviceRegistry, Owner, OwnershipToken};
use crate::servo::ServoSynchronizer;

/// How long `shutdown` waits for the session thread before giving up on it.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
}

impl SessionState {
    /// Starting, Running or Stopping.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SessionState::Starting | SessionState::Running | SessionState::Stopping
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LiveStatus {
    pub state: SessionState,
    pub mode: Option<LiveMode>,
    pub preset: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub blocks: u64,
    pub overruns: u64,
    /// Fx mode is running without its effect chain.
    pub fx_bypassed: bool,
    pub last_error: Option<LastError>,
}

#[derive(Debug)]
struct Session {
    state: SessionState,
    mode: Option<LiveMode>,
    preset: Option<String>,
    started_at: Option<DateTime<Utc>>,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            state: SessionState::Stopped,
            mode: None,
            preset: None,
            started_at: None,
        }
    }
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Starts, stops and reports on the live session.
pub struct LiveSupervisor {
    registry: Arc<DeviceRegistry>,
    backend: Arc<dyn AudioBackend>,
    effects: Arc<dyn EffectBackend>,
    servo: Arc<ServoSynchronizer>,
    errors: ErrorSlot,
    gains: Arc<LiveGains>,
    stats: Arc<LiveStats>,
    log: LogBuffer,
    session: Arc<Mutex<Session>>,
    running: Mutex<Option<Running>>,
    session_errors: ErrorSlot,
}

impl LiveSupervisor {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        backend: Arc<dyn AudioBackend>,
        effects: Arc<dyn EffectBackend>,
        servo: Arc<ServoSynchronizer>,
        errors: ErrorSlot,
    ) -> Self {
        Self {
            registry,
            backend,
            effects,
            servo,
            errors,
            gains: Arc::new(LiveGains::default()),
            stats: Arc::new(LiveStats::default()),
            log: LogBuffer::new(),
            session: Arc::new(Mutex::new(Session::default())),
            running: Mutex::new(None),
            session_errors: ErrorSlot::new(),
        }
    }

    /// Start a session; returns once both streams are open.
    pub fn start(&self, config: LiveConfig) -> Result<(), ChatterError> {
        let mut running = crate::lock(&self.running);
        if let Some(prev) = running.take() {
            // A thread that has settled its state is only returning
            if !prev.handle.is_finished() && self.state().is_active() {
                *running = Some(prev);
                return Err(ChatterError::DeviceBusy { holder: Owner::Live });
            }
            if prev.handle.join().is_err() {
                warn!("previous live session thread panicked");
            }
        }

        let token = self.registry.acquire(Owner::Live)?;
        let (source, sink) = match self.open_streams(&config) {
            Ok(streams) => streams,
            Err(e) => {
                self.errors.record(&e);
                drop(token);
                return Err(e);
            }
        };

        self.log.clear();
        self.stats.reset();
        self.session_errors.clear();
        self.gains.set(config.input_gain_db, config.output_gain_db);
        *crate::lock(&self.session) = Session {
            state: SessionState::Starting,
            mode: Some(config.mode),
            preset: config.preset_name().map(str::to_string),
            started_at: Some(Utc::now()),
        };
        self.log.info(format!(
            "starting {} session: {} -> {}",
            config.mode, config.input_device, config.output_device
        ));

        let cancel = CancellationToken::new();
        let session = SessionThread {
            config,
            source,
            sink,
            token,
            effects: Arc::clone(&self.effects),
            servo: Arc::clone(&self.servo),
            gains: Arc::clone(&self.gains),
            stats: Arc::clone(&self.stats),
            log: self.log.clone(),
            session: Arc::clone(&self.session),
            cancel: cancel.clone(),
            errors: self.errors.clone(),
            session_errors: self.session_errors.clone(),
        };

        let handle = thread::Builder::new()
            .name("live-session".to_string())
            .spawn(move || session.run());
        match handle {
            Ok(handle) => {
                *running = Some(Running { cancel, handle });
                Ok(())
            }
            Err(e) => {
                // The closure, and with it the streams and token, is gone
                let err = ChatterError::DeviceUnavailable(format!("cannot spawn live session: {e}"));
                self.errors.record(&err);
                self.log.error(err.to_string());
                crate::lock(&self.session).state = SessionState::Crashed;
                Err(err)
            }
        }
    }

    /// Ask the session to stop and return without waiting for it.
    ///
    /// The state moves to `Stopping` and settles on `Stopped` once the thread
    /// has released the device; poll [`Self::wait_until_idle`] for that.
    /// False when nothing was running or a stop is already under way.
    pub fn stop(&self) -> bool {
        let running = crate::lock(&self.running);
        let Some(current) = running.as_ref() else {
            return false;
        };
        if current.handle.is_finished() || current.cancel.is_cancelled() {
            return false;
        }
        {
            let mut session = crate::lock(&self.session);
            if !session.state.is_active() {
                return false;
            }
            session.state = SessionState::Stopping;
        }
        current.cancel.cancel();
        self.log.info("stop requested");
        true
    }

    pub fn status(&self) -> LiveStatus {
        let session = crate::lock(&self.session);
        LiveStatus {
            state: session.state,
            mode: session.mode,
            preset: session.preset.clone(),
            started_at: session.started_at,
            blocks: self.stats.blocks.load(Ordering::Relaxed),
            overruns: self.stats.overruns.load(Ordering::Relaxed),
            fx_bypassed: self.stats.fx_bypassed.load(Ordering::Relaxed),
            last_error: self.session_errors.get(),
        }
    }

    pub fn state(&self) -> SessionState {
        crate::lock(&self.session).state
    }

    /// Newest `n` lines of the current (or last) session.
    pub fn log_tail(&self, n: usize) -> Vec<LogEntry> {
        self.log.tail(n)
    }

    /// Applied to the running session on its next block.
    pub fn set_gains(&self, input_db: f32, output_db: f32) {
        self.gains.set(input_db, output_db);
    }

    pub fn gains(&self) -> (f32, f32) {
        self.gains.get()
    }

    /// Survives across sessions until changed.
    pub fn set_muted(&self, muted: bool) {
        self.gains.set_muted(muted);
    }

    pub fn muted(&self) -> bool {
        self.gains.muted()
    }

    /// Poll until the session is neither starting, running nor stopping.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.state().is_active() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(2));
        }
    }

    /// Stop and reap the session thread, waiting at most [`STOP_TIMEOUT`].
    pub fn shutdown(&self) {
        self.stop();
        let Some(prev) = crate::lock(&self.running).take() else {
            return;
        };

        let deadline = Instant::now() + STOP_TIMEOUT;
        while !prev.handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        if prev.handle.is_finished() {
            if prev.handle.join().is_err() {
                warn!("live session thread panicked");
            }
        } else {
            // Detached; it releases the device whenever its I/O returns
            error!(timeout = ?STOP_TIMEOUT, "live session did not stop in time");
            self.log.error("session did not stop in time");
        }
    }

    fn open_streams(
        &self,
        config: &LiveConfig,
    ) -> Result<(Box<dyn AudioSource>, Box<dyn AudioSink>), ChatterError> {
        let source = self
            .backend
            .open_input(&config.input_device, config.format)
            .map_err(|e| unavailable("input", &config.input_device, e))?;
        let sink = self
            .backend
            .open_output(&config.output_device, config.format)
            .map_err(|e| unavailable("output", &config.output_device, e))?;
        Ok((source, sink))
    }
}

impl Drop for LiveSupervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn unavailable(direction: &str, device: &str, error: ChatterError) -> ChatterError {
    match error {
        ChatterError::DeviceUnavailable(msg) => {
            ChatterError::DeviceUnavailable(format!("{direction} '{device}': {msg}"))
        }
        other => ChatterError::DeviceUnavailable(format!("{direction} '{device}': {other}")),
    }
}

/// Marks the session crashed if the thread unwinds.
struct CrashGuard {
    session: Arc<Mutex<Session>>,
    log: LogBuffer,
    errors: ErrorSlot,
    session_errors: ErrorSlot,
}

impl Drop for CrashGuard {
    fn drop(&mut self) {
        if thread::panicking() {
            let message = "live session panicked";
            self.log.error(message);
            self.errors.record_message(message);
            self.session_errors.record_message(message);
            crate::lock(&self.session).state = SessionState::Crashed;
        }
    }
}

/// Everything the session thread owns.
struct SessionThread {
    config: LiveConfig,
    source: Box<dyn AudioSource>,
    sink: Box<dyn AudioSink>,
    token: OwnershipToken,
    effects: Arc<dyn EffectBackend>,
    servo: Arc<ServoSynchronizer>,
    gains: Arc<LiveGains>,
    stats: Arc<LiveStats>,
    log: LogBuffer,
    session: Arc<Mutex<Session>>,
    cancel: CancellationToken,
    errors: ErrorSlot,
    session_errors: ErrorSlot,
}

impl SessionThread {
    fn run(self) {
        // Declared first so it drops last, after the streams and the device token
        let _guard = CrashGuard {
            session: Arc::clone(&self.session),
            log: self.log.clone(),
            errors: self.errors.clone(),
            session_errors: self.session_errors.clone(),
        };
        let SessionThread {
            config,
            mut source,
            mut sink,
            token,
            effects,
            servo,
            gains,
            stats,
            log,
            session,
            cancel,
            errors,
            session_errors,
        } = self;

        let ctx = SessionContext {
            config: &config,
            effects: effects.as_ref(),
            servo: &servo,
            gains: &gains,
            stats: &stats,
            log: &log,
            cancel: &cancel,
        };
        let result = run_session(ctx, source.as_mut(), sink.as_mut(), || {
            let mut s = crate::lock(&session);
            if s.state == SessionState::Starting {
                s.state = SessionState::Running;
            }
        });

        if result.is_ok() {
            sink.abort();
        }
        drop(source);
        drop(sink);
        drop(token);

        let state = match result {
            Ok(()) => {
                log.info("session stopped");
                info!(blocks = stats.blocks.load(Ordering::Relaxed), "live session stopped");
                SessionState::Stopped
            }
            Err(e) => {
                log.error(format!("session crashed: {e}"));
                errors.record(&e);
                session_errors.record(&e);
                SessionState::Crashed
            }
        };
        crate::lock(&session).state = state;
    }
}

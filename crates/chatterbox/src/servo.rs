//! Servo mouth synchronization
//!
//! Audio paths push one RMS value per block through a [`ServoFeed`]; a single
//! worker thread turns those into actuator commands. The worker is the only
//! writer to the [`ActuatorDriver`].
//!
//! ```text
//! playback / live thread          servo worker
//!        │                              │
//!   feed.push(rms) ──── mpsc ────▶ DelayLine ─▶ Envelope ─▶ angle
//!                                       │
//!                             rate limit + deadband
//!                                       │
//!                                       ▼
//!                                 ActuatorDriver
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use portable_atomic::AtomicF32;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::actuator::ActuatorDriver;
use crate::envelope::{delay_blocks, DelayLine, Envelope};
use crate::error::{ChatterError, ErrorSlot};

/// Angle changes smaller than this are not sent.
pub const DEADBAND_DEGREES: f32 = 0.5;
/// Time the servo gets to reach the closed angle before the pulse is cut.
pub const RELEASE_DELAY: Duration = Duration::from_millis(100);
const ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// Values the worker reads on every sample; writable while streams run.
#[derive(Debug)]
pub struct ServoControl {
    enabled: AtomicBool,
    closed: AtomicF32,
    open: AtomicF32,
}

impl ServoControl {
    pub fn new(closed: f32, open: f32, enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            closed: AtomicF32::new(closed),
            open: AtomicF32::new(open),
        }
    }

    pub fn from_settings(settings: &chatterconf::ServoSettings) -> Self {
        Self::new(settings.closed_angle, settings.open_angle, settings.enabled)
    }

    pub fn set_range(&self, closed: f32, open: f32) {
        self.closed.store(closed, Ordering::Relaxed);
        self.open.store(open, Ordering::Relaxed);
    }

    /// `(closed, open)` in degrees.
    pub fn range(&self) -> (f32, f32) {
        (
            self.closed.load(Ordering::Relaxed),
            self.open.load(Ordering::Relaxed),
        )
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }
}

/// Block clock and offsets for one attached stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServoTiming {
    pub sample_rate: u32,
    pub block_size: u32,
    pub delay_ms: f32,
    pub min_update_ms: u32,
}

impl ServoTiming {
    pub fn block_ms(&self) -> f64 {
        1000.0 * self.block_size as f64 / self.sample_rate.max(1) as f64
    }
}

/// Deterministic amplitude-to-angle mapping for one stream.
///
/// Time advances one block per [`ServoCore::step`], so behavior does not
/// depend on scheduling.
#[derive(Debug, Clone)]
pub struct ServoCore {
    delay: DelayLine,
    envelope: Envelope,
    block_ms: f64,
    min_update_ms: f64,
    blocks: u64,
    last_write_ms: Option<f64>,
    last_angle: Option<f32>,
}

impl ServoCore {
    pub fn new(timing: ServoTiming) -> Self {
        Self {
            delay: DelayLine::new(delay_blocks(
                timing.delay_ms,
                timing.sample_rate,
                timing.block_size,
            )),
            envelope: Envelope::new(timing.sample_rate, timing.block_size),
            block_ms: timing.block_ms(),
            min_update_ms: timing.min_update_ms as f64,
            blocks: 0,
            last_write_ms: None,
            last_angle: None,
        }
    }

    /// Consume one block RMS; returns the angle to command, if any.
    pub fn step(&mut self, rms: f32, closed: f32, open: f32, enabled: bool) -> Option<f32> {
        let now_ms = self.blocks as f64 * self.block_ms;
        self.blocks += 1;

        let delayed = self.delay.push(rms)?;
        let envelope = self.envelope.step(delayed);
        if !enabled {
            return None;
        }

        let angle = closed + (open - closed) * envelope;
        if let Some(last) = self.last_write_ms {
            if now_ms - last < self.min_update_ms {
                return None;
            }
        }
        if let Some(last) = self.last_angle {
            if (angle - last).abs() < DEADBAND_DEGREES {
                return None;
            }
        }

        self.last_write_ms = Some(now_ms);
        self.last_angle = Some(angle);
        Some(angle)
    }

    /// Blocks consumed so far.
    pub fn blocks(&self) -> u64 {
        self.blocks
    }
}

/// Whether a stream is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServoState {
    Idle,
    Active,
}

/// Counters kept by the worker
#[derive(Debug, Default)]
pub struct ServoStats {
    pub commands: AtomicU64,
    pub faults: AtomicU64,
}

/// Point-in-time copy of [`ServoStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ServoStatsSnapshot {
    pub commands: u64,
    pub faults: u64,
}

enum ServoMsg {
    Attach { id: u64, timing: ServoTiming },
    Level { id: u64, rms: f32 },
    Detach { id: u64, ack: Option<mpsc::SyncSender<()>> },
    Barrier(mpsc::SyncSender<()>),
    Shutdown,
}

/// Owns the actuator worker thread.
pub struct ServoSynchronizer {
    tx: mpsc::Sender<ServoMsg>,
    control: Arc<ServoControl>,
    stats: Arc<ServoStats>,
    state: Arc<AtomicU8>,
    next_id: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ServoSynchronizer {
    pub fn spawn(
        driver: Box<dyn ActuatorDriver>,
        control: Arc<ServoControl>,
        errors: ErrorSlot,
    ) -> Self {
        let (tx, rx) = mpsc::channel();
        let stats = Arc::new(ServoStats::default());
        let state = Arc::new(AtomicU8::new(ServoState::Idle as u8));

        let worker = Worker {
            driver,
            control: Arc::clone(&control),
            stats: Arc::clone(&stats),
            state: Arc::clone(&state),
            errors,
            active: None,
            powered: false,
        };
        let handle = thread::Builder::new()
            .name("servo".to_string())
            .spawn(move || worker.run(rx));

        let worker = match handle {
            Ok(handle) => Some(handle),
            Err(e) => {
                // Without a worker, feeds still accept samples and nothing moves
                warn!(error = %e, "failed to spawn servo worker");
                None
            }
        };

        Self {
            tx,
            control,
            stats,
            state,
            next_id: AtomicU64::new(1),
            worker: Mutex::new(worker),
        }
    }

    /// Attach a stream; the returned feed detaches when finished or dropped.
    pub fn attach(&self, timing: ServoTiming) -> ServoFeed {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.tx.send(ServoMsg::Attach { id, timing });
        ServoFeed {
            id,
            tx: self.tx.clone(),
            finished: false,
        }
    }

    pub fn control(&self) -> &Arc<ServoControl> {
        &self.control
    }

    pub fn state(&self) -> ServoState {
        if self.state.load(Ordering::Acquire) == ServoState::Active as u8 {
            ServoState::Active
        } else {
            ServoState::Idle
        }
    }

    pub fn stats(&self) -> ServoStatsSnapshot {
        ServoStatsSnapshot {
            commands: self.stats.commands.load(Ordering::Relaxed),
            faults: self.stats.faults.load(Ordering::Relaxed),
        }
    }

    /// Wait until everything sent so far has been handled.
    pub fn barrier(&self) {
        let (ack, done) = mpsc::sync_channel(1);
        if self.tx.send(ServoMsg::Barrier(ack)).is_ok() {
            let _ = done.recv_timeout(ACK_TIMEOUT);
        }
    }

    /// Tear down any attached stream and stop the worker.
    pub fn shutdown(&self) {
        let _ = self.tx.send(ServoMsg::Shutdown);
        if let Some(handle) = crate::lock(&self.worker).take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ServoSynchronizer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A stream's handle into the synchronizer.
pub struct ServoFeed {
    id: u64,
    tx: mpsc::Sender<ServoMsg>,
    finished: bool,
}

impl ServoFeed {
    /// Hand over one block RMS. Never blocks.
    pub fn push(&self, rms: f32) {
        let _ = self.tx.send(ServoMsg::Level { id: self.id, rms });
    }

    /// Detach and wait until the closed angle has been commanded.
    pub fn finish(mut self) {
        self.finished = true;
        let (ack, done) = mpsc::sync_channel(1);
        if self
            .tx
            .send(ServoMsg::Detach {
                id: self.id,
                ack: Some(ack),
            })
            .is_ok()
        {
            let _ = done.recv_timeout(ACK_TIMEOUT);
        }
    }
}

impl Drop for ServoFeed {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.tx.send(ServoMsg::Detach {
                id: self.id,
                ack: None,
            });
        }
    }
}

struct Worker {
    driver: Box<dyn ActuatorDriver>,
    control: Arc<ServoControl>,
    stats: Arc<ServoStats>,
    state: Arc<AtomicU8>,
    errors: ErrorSlot,
    active: Option<(u64, ServoCore)>,
    powered: bool,
}

impl Worker {
    fn run(mut self, rx: mpsc::Receiver<ServoMsg>) {
        debug!("servo worker started");
        while let Ok(msg) = rx.recv() {
            match msg {
                ServoMsg::Attach { id, timing } => {
                    if self.active.is_some() {
                        self.teardown(None);
                    }
                    self.active = Some((id, ServoCore::new(timing)));
                    self.state.store(ServoState::Active as u8, Ordering::Release);
                    if self.control.enabled() {
                        self.power_up();
                        let (closed, _) = self.control.range();
                        self.apply(|d| d.set_angle(closed));
                    }
                    debug!(stream = id, delay_ms = timing.delay_ms, "servo attached");
                }
                ServoMsg::Level { id, rms } => {
                    let (closed, open) = self.control.range();
                    let enabled = self.control.enabled();
                    let angle = match self.active.as_mut() {
                        Some((active, core)) if *active == id => {
                            core.step(rms, closed, open, enabled)
                        }
                        _ => None,
                    };
                    if let Some(angle) = angle {
                        self.power_up();
                        self.apply(|d| d.set_angle(angle));
                    }
                }
                ServoMsg::Detach { id, ack } => {
                    if matches!(self.active, Some((active, _)) if active == id) {
                        self.teardown(ack);
                        debug!(stream = id, "servo detached");
                    } else if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                }
                ServoMsg::Barrier(ack) => {
                    let _ = ack.send(());
                }
                ServoMsg::Shutdown => break,
            }
        }
        if self.active.is_some() {
            self.teardown(None);
        }
        info!(
            commands = self.stats.commands.load(Ordering::Relaxed),
            faults = self.stats.faults.load(Ordering::Relaxed),
            "servo worker stopped"
        );
    }

    fn power_up(&mut self) {
        if !self.powered {
            self.powered = true;
            self.apply(|d| d.set_power(true));
        }
    }

    /// Closed angle, pulse release, power off. Runs whether or not enabled.
    ///
    /// `ack` fires once the closed angle is commanded; the rest finishes on
    /// this thread.
    fn teardown(&mut self, ack: Option<mpsc::SyncSender<()>>) {
        self.active = None;
        let (closed, _) = self.control.range();
        self.apply(|d| d.set_angle(closed));
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
        thread::sleep(RELEASE_DELAY);
        self.apply(|d| d.release());
        self.apply(|d| d.set_power(false));
        self.powered = false;
        self.state.store(ServoState::Idle as u8, Ordering::Release);
    }

    fn apply(
        &mut self,
        command: impl FnOnce(&mut Box<dyn ActuatorDriver>) -> Result<(), ChatterError>,
    ) {
        self.stats.commands.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = command(&mut self.driver) {
            self.stats.faults.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "actuator command failed");
            self.errors.record(&e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{ActuatorCommand, RecordingActuator};

    fn timing(delay_ms: f32) -> ServoTiming {
        ServoTiming {
            sample_rate: 48_000,
            block_size: 480,
            delay_ms,
            min_update_ms: 20,
        }
    }

    #[test]
    fn test_core_delay_shifts_step() {
        // 10ms blocks, 100ms delay: 10 blocks
        let mut core = ServoCore::new(timing(100.0));
        let mut first_open = None;
        for block in 0..60 {
            let rms = if block >= 20 { 0.5 } else { 0.0 };
            if let Some(angle) = core.step(rms, 5.0, 65.0, true) {
                if angle > 5.0 && first_open.is_none() {
                    first_open = Some(block);
                }
            }
        }
        let shift = first_open.unwrap() as i64 - 20;
        assert!((10..=11).contains(&shift), "shift was {shift} blocks");
    }

    #[test]
    fn test_core_rate_limit_and_deadband() {
        let mut core = ServoCore::new(timing(0.0));
        let mut writes = Vec::new();
        for block in 0..40u64 {
            if core.step(0.5, 5.0, 65.0, true).is_some() {
                writes.push(block);
            }
        }
        // 20ms min spacing at 10ms blocks
        assert!(writes.windows(2).all(|w| w[1] - w[0] >= 2), "{writes:?}");
        // the envelope settles, then the deadband silences the stream
        assert!(*writes.last().unwrap() < 39);
    }

    #[test]
    fn test_core_disabled_emits_nothing() {
        let mut core = ServoCore::new(timing(0.0));
        for _ in 0..50 {
            assert_eq!(core.step(0.9, 5.0, 65.0, false), None);
        }
        // re-enable resumes on the next sample
        assert!(core.step(0.9, 5.0, 65.0, true).is_some());
    }

    #[test]
    fn test_attach_and_detach_sequence() {
        let actuator = RecordingActuator::new();
        let control = Arc::new(ServoControl::new(5.0, 65.0, true));
        let servo =
            ServoSynchronizer::spawn(Box::new(actuator.clone()), control, ErrorSlot::new());

        let feed = servo.attach(timing(0.0));
        for _ in 0..20 {
            feed.push(0.5);
        }
        servo.barrier();
        assert_eq!(servo.state(), ServoState::Active);
        feed.finish();
        assert_eq!(actuator.last_angle(), Some(5.0));
        servo.barrier();
        assert_eq!(servo.state(), ServoState::Idle);

        let commands = actuator.commands();
        assert_eq!(commands[0], ActuatorCommand::Power(true));
        assert_eq!(commands[1], ActuatorCommand::Angle(5.0));
        assert!(commands.iter().any(|c| matches!(c, ActuatorCommand::Angle(a) if *a > 5.0)));
        let tail = &commands[commands.len() - 3..];
        assert_eq!(
            tail,
            [
                ActuatorCommand::Angle(5.0),
                ActuatorCommand::Release,
                ActuatorCommand::Power(false)
            ]
        );
    }

    #[test]
    fn test_disabled_servo_only_tears_down() {
        let actuator = RecordingActuator::new();
        let control = Arc::new(ServoControl::new(5.0, 65.0, false));
        let servo = ServoSynchronizer::spawn(
            Box::new(actuator.clone()),
            Arc::clone(&control),
            ErrorSlot::new(),
        );

        let feed = servo.attach(timing(0.0));
        for _ in 0..30 {
            feed.push(0.8);
        }
        servo.barrier();
        assert!(actuator.commands().is_empty());

        control.set_enabled(true);
        feed.push(0.8);
        servo.barrier();
        let commands = actuator.commands();
        assert_eq!(commands[0], ActuatorCommand::Power(true));
        assert!(matches!(commands[1], ActuatorCommand::Angle(a) if a > 5.0));
        drop(feed);
        servo.barrier();
    }

    #[test]
    fn test_faults_are_counted_and_recorded() {
        let actuator = RecordingActuator::new();
        actuator.fail_all(true);
        let errors = ErrorSlot::new();
        let servo = ServoSynchronizer::spawn(
            Box::new(actuator.clone()),
            Arc::new(ServoControl::new(5.0, 65.0, true)),
            errors.clone(),
        );

        let feed = servo.attach(timing(0.0));
        feed.push(0.5);
        feed.finish();
        servo.barrier();
        assert!(servo.stats().faults > 0);
        assert!(errors.get().unwrap().message.contains("actuator"));
    }
}

//! SoX subprocess effect backend
//!
//! Mono f32 blocks are streamed through `sox` over its stdin/stdout as raw
//! little-endian floats. Two helper threads move bytes so the audio thread
//! only touches lock-free rings:
//!
//! ```text
//! live thread ──▶ in ring ──▶ writer thread ──▶ sox stdin
//!                                                  │
//! live thread ◀── out ring ◀── reader thread ◀── sox stdout
//! ```

use std::io::{BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::backend::StreamFormat;
use crate::effects::{EffectBackend, EffectProcessor, FxPreset};
use crate::error::ChatterError;
use crate::ring::{audio_ring_pair, AudioRingConsumer, AudioRingProducer};

/// Longest time the first processed block may take to appear.
pub const WARMUP_LIMIT: Duration = Duration::from_secs(2);
/// Smallest `--buffer` handed to SoX.
pub const MIN_BUFFER_FRAMES: u32 = 64;

/// Full SoX argument list for a mono raw-float pipe.
pub fn sox_args(preset: &FxPreset, sample_rate: u32, buffer_frames: u32) -> Vec<String> {
    let raw = |args: &mut Vec<String>| {
        args.extend(
            ["-t", "raw", "-e", "floating-point", "-b", "32", "-L", "-c", "1", "-r"]
                .map(String::from),
        );
        args.push(sample_rate.to_string());
        args.push("-".to_string());
    };

    let mut args: Vec<String> = ["-V1", "-q", "--buffer"].map(String::from).to_vec();
    args.push(buffer_frames.max(MIN_BUFFER_FRAMES).to_string());
    raw(&mut args);
    raw(&mut args);
    args.extend(preset.sox_effects());
    args
}

/// Spawns one `sox` process per session.
#[derive(Debug, Clone)]
pub struct SoxBackend {
    program: PathBuf,
    buffer_frames: u32,
}

impl SoxBackend {
    pub fn new(program: impl Into<PathBuf>, buffer_frames: u32) -> Self {
        Self {
            program: program.into(),
            buffer_frames,
        }
    }
}

impl EffectBackend for SoxBackend {
    fn spawn(
        &self,
        preset: &FxPreset,
        format: StreamFormat,
    ) -> Result<Box<dyn EffectProcessor>, ChatterError> {
        if format.channels != 1 {
            return Err(ChatterError::EffectFailure(format!(
                "sox pipe is mono, got {} channels",
                format.channels
            )));
        }
        let args = sox_args(preset, format.sample_rate, self.buffer_frames);
        info!(program = %self.program.display(), args = %args.join(" "), "starting sox");
        Ok(Box::new(SoxProcessor::spawn(&self.program, &args, format)?))
    }
}

/// A running `sox` child.
pub struct SoxProcessor {
    child: Child,
    input: AudioRingProducer,
    output: AudioRingConsumer,
    exited: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
    started: Instant,
    warmed_up: bool,
}

impl SoxProcessor {
    pub fn spawn(
        program: &std::path::Path,
        args: &[String],
        format: StreamFormat,
    ) -> Result<Self, ChatterError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                ChatterError::EffectFailure(format!("cannot start {}: {}", program.display(), e))
            })?;

        let missing = || ChatterError::EffectFailure("sox pipes unavailable".to_string());
        let stdin = child.stdin.take().ok_or_else(missing)?;
        let stdout = child.stdout.take().ok_or_else(missing)?;
        let stderr = child.stderr.take();

        // Room for the SoX buffer plus a few blocks either way
        let capacity = format.block_samples() * 16 + 8192;
        let (input, input_rx) = audio_ring_pair(capacity);
        let (output_tx, output) = audio_ring_pair(capacity);
        let exited = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(AtomicBool::new(false));

        let mut threads = Vec::with_capacity(3);
        let spawn = |name: &str, body: Box<dyn FnOnce() + Send>| {
            thread::Builder::new()
                .name(name.to_string())
                .spawn(body)
                .map_err(|e| ChatterError::EffectFailure(format!("cannot spawn {name}: {e}")))
        };

        let (x, s) = (Arc::clone(&exited), Arc::clone(&stop));
        threads.push(spawn(
            "sox-writer",
            Box::new(move || pump_stdin(stdin, input_rx, x, s)),
        )?);
        let x = Arc::clone(&exited);
        threads.push(spawn(
            "sox-reader",
            Box::new(move || pump_stdout(stdout, output_tx, x)),
        )?);
        if let Some(stderr) = stderr {
            threads.push(spawn(
                "sox-stderr",
                Box::new(move || {
                    for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                        warn!(target: "chatterbox::sox", "{}", line);
                    }
                }),
            )?);
        }

        Ok(Self {
            child,
            input,
            output,
            exited,
            stop,
            threads,
            started: Instant::now(),
            warmed_up: false,
        })
    }
}

impl EffectProcessor for SoxProcessor {
    fn process(
        &mut self,
        input: &[f32],
        output: &mut [f32],
        deadline: Duration,
    ) -> Result<(), ChatterError> {
        let started = Instant::now();
        if self.exited.load(Ordering::Acquire) {
            return Err(ChatterError::EffectFailure("sox exited".to_string()));
        }
        if self.input.write(input) < input.len() {
            return Err(ChatterError::EffectOverrun {
                elapsed: started.elapsed(),
                budget: deadline,
            });
        }

        // Leave headroom for the caller inside its block budget
        let wait = deadline.mul_f32(0.8);
        while self.output.available() < output.len() {
            if self.exited.load(Ordering::Acquire) {
                return Err(ChatterError::EffectFailure("sox exited".to_string()));
            }
            if started.elapsed() >= wait {
                break;
            }
            thread::sleep(Duration::from_micros(200));
        }

        if self.output.available() >= output.len() {
            self.output.read(output);
            if !self.warmed_up {
                self.warmed_up = true;
                debug!(after = ?self.started.elapsed(), "sox warmed up");
            }
            return Ok(());
        }

        if !self.warmed_up {
            if self.started.elapsed() > WARMUP_LIMIT {
                return Err(ChatterError::EffectFailure(format!(
                    "sox produced no audio within {:?}",
                    WARMUP_LIMIT
                )));
            }
            output.copy_from_slice(input);
            return Ok(());
        }

        Err(ChatterError::EffectOverrun {
            elapsed: started.elapsed(),
            budget: deadline,
        })
    }
}

impl Drop for SoxProcessor {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.child.kill();
        let _ = self.child.wait();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        debug!("sox stopped");
    }
}

fn pump_stdin(
    mut stdin: ChildStdin,
    mut ring: AudioRingConsumer,
    exited: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
) {
    let mut samples = vec![0.0f32; 4096];
    let mut bytes = Vec::with_capacity(samples.len() * 4);
    while !stop.load(Ordering::Acquire) {
        let n = ring.read(&mut samples);
        if n == 0 {
            if ring.is_abandoned() {
                break;
            }
            thread::sleep(Duration::from_micros(500));
            continue;
        }
        bytes.clear();
        for s in &samples[..n] {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        if let Err(e) = stdin.write_all(&bytes).and_then(|_| stdin.flush()) {
            debug!(error = %e, "sox stdin closed");
            exited.store(true, Ordering::Release);
            break;
        }
    }
}

fn pump_stdout(mut stdout: ChildStdout, mut ring: AudioRingProducer, exited: Arc<AtomicBool>) {
    let mut buf = [0u8; 4096];
    let mut pending: Vec<u8> = Vec::with_capacity(8);
    let mut samples = Vec::with_capacity(buf.len() / 4 + 1);
    loop {
        let n = match stdout.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        pending.extend_from_slice(&buf[..n]);
        let whole = pending.len() / 4 * 4;
        samples.clear();
        samples.extend(
            pending[..whole]
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        );
        pending.drain(..whole);

        let written = ring.write(&samples);
        if written < samples.len() {
            // Nobody is reading fast enough; the overflow is lost
            debug!(dropped = samples.len() - written, "sox output overflow");
        }
    }
    exited.store(true, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatterconf::PresetParams;

    fn preset() -> FxPreset {
        FxPreset::from_params("monster", &PresetParams::new(-12.0, 12.0, 9.0, -3.0))
    }

    #[test]
    fn test_args_layout() {
        let args = sox_args(&preset(), 48_000, 32);
        let joined = args.join(" ");
        assert!(joined.starts_with("-V1 -q --buffer 64 -t raw -e floating-point -b 32 -L -c 1 -r 48000 - -t raw"));
        assert!(joined.ends_with("- pitch -1200.0 reverb 12.0 bass +9.0 treble -3.0"));
    }

    #[test]
    fn test_missing_program_is_effect_failure() {
        let backend = SoxBackend::new("/nonexistent/sox", 256);
        let result = backend.spawn(&preset(), StreamFormat::new(48_000, 1, 256));
        assert!(matches!(result, Err(ChatterError::EffectFailure(_))));
    }

    #[test]
    fn test_stereo_rejected() {
        let backend = SoxBackend::new("sox", 256);
        let result = backend.spawn(&preset(), StreamFormat::new(48_000, 2, 256));
        assert!(matches!(result, Err(ChatterError::EffectFailure(_))));
    }

    /// `cat` behaves like a zero-effect SoX: bytes in, same bytes out.
    #[cfg(unix)]
    #[test]
    fn test_pipe_round_trip_through_cat() {
        let format = StreamFormat::new(48_000, 1, 64);
        let mut processor = SoxProcessor::spawn(std::path::Path::new("cat"), &[], format).unwrap();
        let input: Vec<f32> = (0..64).map(|i| i as f32 / 64.0).collect();
        let mut output = vec![0.0; 64];

        let mut processed = false;
        for _ in 0..200 {
            processor
                .process(&input, &mut output, Duration::from_millis(20))
                .unwrap();
            if processor.warmed_up {
                processed = true;
                break;
            }
        }
        assert!(processed);
        assert_eq!(output, input);
    }

    #[cfg(unix)]
    #[test]
    fn test_exited_process_is_failure() {
        let format = StreamFormat::new(48_000, 1, 64);
        let mut processor = SoxProcessor::spawn(std::path::Path::new("true"), &[], format).unwrap();
        let input = vec![0.1; 64];
        let mut output = vec![0.0; 64];
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match processor.process(&input, &mut output, Duration::from_millis(5)) {
                Err(ChatterError::EffectFailure(_)) => break,
                _ if Instant::now() > deadline => panic!("exit not detected"),
                _ => {}
            }
        }
    }
}

//! PipeWire playback stream
//!
//! The engine writes blocks into a lock-free ring; PipeWire's RT callback
//! drains it into the device.
//!
//! Architecture:
//! ```text
//! audio path thread                 PipeWire (PW's RT thread)
//!        │                                    │
//!        ▼                                    ▼
//!   sink.write(block)                process callback
//!        │ (waits for space)                  │
//!        └──────────► AudioRing ─────────────►│
//!                    (lock-free SPSC)         │
//!                                             ▼
//!                                      dequeue_buffer()
//!                                      copy / zero-fill
//!                                      queue_buffer()
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::backend::{AudioSink, StreamFormat};
use crate::error::ChatterError;
use crate::ring::{audio_ring_pair, AudioRingConsumer, AudioRingProducer};

/// How long `open` waits for the stream to connect.
const OPEN_TIMEOUT: Duration = Duration::from_secs(2);

/// Configuration for a PipeWire output stream
#[derive(Debug, Clone)]
pub struct PipeWireOutputConfig {
    pub name: String,
    /// Node to link to; `None` lets the session manager pick.
    pub target: Option<String>,
    pub sample_rate: u32,
    pub channels: u32,
    /// Frames requested per callback (`node.latency`).
    pub latency_frames: u32,
    /// Frames per engine block; sizes the ring and the write deadline.
    pub block_frames: u32,
}

impl Default for PipeWireOutputConfig {
    fn default() -> Self {
        Self {
            name: "chatterbox".to_string(),
            target: None,
            sample_rate: 48000,
            channels: 2,
            latency_frames: 256, // ~5.3ms at 48kHz
            block_frames: 512,
        }
    }
}

impl PipeWireOutputConfig {
    pub fn from_format(name: &str, target: Option<String>, format: StreamFormat) -> Self {
        Self {
            name: name.to_string(),
            target,
            sample_rate: format.sample_rate,
            channels: format.channels as u32,
            latency_frames: format.latency_frames,
            block_frames: format.block_frames,
        }
    }

    /// Calculate latency in milliseconds
    pub fn latency_ms(&self) -> f64 {
        self.latency_frames as f64 / self.sample_rate as f64 * 1000.0
    }

    fn block_duration(&self) -> Duration {
        Duration::from_secs_f64(self.block_frames as f64 / self.sample_rate.max(1) as f64)
    }

    /// Ring holds four blocks or four quanta, whichever is larger.
    fn ring_capacity(&self) -> usize {
        self.block_frames.max(self.latency_frames) as usize * self.channels as usize * 4
    }
}

/// Runtime statistics from the PipeWire callback
#[derive(Debug, Default)]
pub struct StreamStats {
    pub callbacks: AtomicU64,
    pub samples_written: AtomicU64,
    pub underruns: AtomicU64,
    // Underruns only count once audio has flowed
    pub warmed_up: AtomicBool,
}

/// Handle to a running PipeWire output stream.
pub struct PipeWireSink {
    producer: AudioRingProducer,
    capacity: usize,
    running: Arc<AtomicBool>,
    discard: Arc<AtomicBool>,
    stats: Arc<StreamStats>,
    thread_handle: Option<JoinHandle<()>>,
    config: PipeWireOutputConfig,
}

impl PipeWireSink {
    /// Spawn the stream thread and wait until the stream is connected.
    pub fn open(config: PipeWireOutputConfig) -> Result<Self, PipeWireOutputError> {
        crate::pipewire::init_once();

        let capacity = config.ring_capacity();
        let (producer, consumer) = audio_ring_pair(capacity);
        let running = Arc::new(AtomicBool::new(true));
        let discard = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(StreamStats::default());
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);

        debug!(
            "Creating output stream: {} -> {:?} @ {}Hz, {} channels, ring {} samples",
            config.name, config.target, config.sample_rate, config.channels, capacity
        );

        let running_for_thread = Arc::clone(&running);
        let discard_for_thread = Arc::clone(&discard);
        let stats_for_thread = Arc::clone(&stats);
        let config_clone = config.clone();

        let thread_handle = thread::Builder::new()
            .name("pipewire-output".to_string())
            .spawn(move || {
                let ready_err = ready_tx.clone();
                if let Err(e) = run_pipewire_loop(
                    config_clone,
                    consumer,
                    Arc::clone(&running_for_thread),
                    discard_for_thread,
                    stats_for_thread,
                    ready_tx,
                ) {
                    error!("PipeWire output thread failed: {}", e);
                    let _ = ready_err.try_send(Err(e.to_string()));
                }
                running_for_thread.store(false, Ordering::Release);
            })
            .map_err(|e| PipeWireOutputError::ThreadSpawn(e.to_string()))?;

        let mut sink = Self {
            producer,
            capacity,
            running,
            discard,
            stats,
            thread_handle: Some(thread_handle),
            config,
        };

        match ready_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(())) => {
                info!(
                    "PipeWire output stream started: {} @ {}Hz, {} channels",
                    sink.config.name, sink.config.sample_rate, sink.config.channels
                );
                Ok(sink)
            }
            Ok(Err(message)) => {
                sink.stop();
                Err(PipeWireOutputError::Init(message))
            }
            Err(_) => {
                sink.stop();
                Err(PipeWireOutputError::Init("timed out connecting stream".to_string()))
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &PipeWireOutputConfig {
        &self.config
    }

    pub fn stats(&self) -> &Arc<StreamStats> {
        &self.stats
    }

    fn queued(&self) -> usize {
        self.capacity.saturating_sub(self.producer.space())
    }

    /// Stop the stream
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread_handle.take() {
            debug!("Waiting for PipeWire output thread to stop...");
            let _ = handle.join();
            info!(
                underruns = self.stats.underruns.load(Ordering::Relaxed),
                "PipeWire output stream stopped"
            );
        }
    }
}

impl AudioSink for PipeWireSink {
    fn write(&mut self, block: &[f32]) -> Result<(), ChatterError> {
        let deadline = Instant::now() + self.config.block_duration() * 4 + Duration::from_millis(50);
        let mut offset = 0;
        while offset < block.len() {
            if !self.is_running() {
                return Err(ChatterError::DeviceUnavailable(format!(
                    "output stream {} closed",
                    self.config.name
                )));
            }
            offset += self.producer.write(&block[offset..]);
            if offset < block.len() {
                if Instant::now() > deadline {
                    return Err(ChatterError::DeviceUnavailable(format!(
                        "output stream {} stalled",
                        self.config.name
                    )));
                }
                thread::sleep(Duration::from_millis(1));
            }
        }
        Ok(())
    }

    fn drain(&mut self) -> Result<(), ChatterError> {
        let budget = self.config.block_duration() * 8 + Duration::from_millis(100);
        let deadline = Instant::now() + budget;
        while self.queued() > 0 && self.is_running() {
            if Instant::now() > deadline {
                warn!(queued = self.queued(), "output drain timed out");
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    }

    fn abort(&mut self) {
        self.discard.store(true, Ordering::Release);
    }
}

impl Drop for PipeWireSink {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run the PipeWire main loop (called from thread)
fn run_pipewire_loop(
    config: PipeWireOutputConfig,
    consumer: AudioRingConsumer,
    running: Arc<AtomicBool>,
    discard: Arc<AtomicBool>,
    stats: Arc<StreamStats>,
    ready: mpsc::SyncSender<Result<(), String>>,
) -> Result<(), PipeWireOutputError> {
    use pipewire as pw;
    use pw::spa::pod::Pod;
    use pw::{properties::properties, spa};

    let mainloop = pw::main_loop::MainLoopRc::new(None)
        .map_err(|e| PipeWireOutputError::Init(format!("Failed to create main loop: {}", e)))?;

    let context = pw::context::ContextRc::new(&mainloop, None)
        .map_err(|e| PipeWireOutputError::Init(format!("Failed to create context: {}", e)))?;

    let core = context
        .connect_rc(None)
        .map_err(|e| PipeWireOutputError::Init(format!("Failed to connect to PipeWire: {}", e)))?;

    // "frames/rate"
    let latency_str = format!("{}/{}", config.latency_frames, config.sample_rate);

    let mut props = properties! {
        *pw::keys::MEDIA_TYPE => "Audio",
        *pw::keys::MEDIA_ROLE => "Music",
        *pw::keys::MEDIA_CATEGORY => "Playback",
        *pw::keys::AUDIO_CHANNELS => config.channels.to_string(),
    };
    props.insert("node.latency", latency_str.as_str());
    if let Some(target) = config.target.as_deref() {
        props.insert("target.object", target);
    }
    debug!("Requesting latency: {} ({:.1}ms)", latency_str, config.latency_ms());

    let stream = pw::stream::StreamBox::new(&core, &config.name, props)
        .map_err(|e| PipeWireOutputError::Init(format!("Failed to create stream: {}", e)))?;

    let channels = config.channels as usize;
    let sample_size = std::mem::size_of::<f32>();
    let stride = sample_size * channels;
    let target_frames = config.latency_frames as usize;

    // Pre-allocated so the RT callback never allocates
    let scratch = vec![0.0f32; 8192 * channels];

    let _listener = stream
        .add_local_listener_with_user_data((consumer, stats, discard, scratch))
        .process(move |stream, (consumer, stats, discard, scratch)| {
            stats.callbacks.fetch_add(1, Ordering::Relaxed);

            let Some(mut buffer) = stream.dequeue_buffer() else {
                return;
            };

            let requested = buffer.requested() as usize;
            let datas = buffer.datas_mut();
            let Some(data) = datas.first_mut() else {
                return;
            };
            let Some(slice) = data.data() else {
                return;
            };

            let max_frames = (slice.len() / stride).min(scratch.len() / channels);
            let n_frames = if requested > 0 {
                target_frames.min(requested).min(max_frames)
            } else {
                target_frames.min(max_frames)
            };
            let samples_needed = n_frames * channels;
            let out = &mut scratch[..samples_needed];

            if discard.load(Ordering::Acquire) {
                consumer.clear();
                out.fill(0.0);
            } else {
                let read = consumer.read(out);
                if read > 0 {
                    stats.warmed_up.store(true, Ordering::Relaxed);
                }
                if read < samples_needed {
                    out[read..].fill(0.0);
                    if stats.warmed_up.load(Ordering::Relaxed) {
                        stats.underruns.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }

            for (i, sample) in out.iter().enumerate() {
                let start = i * sample_size;
                slice[start..start + sample_size].copy_from_slice(&sample.to_le_bytes());
            }

            stats
                .samples_written
                .fetch_add(samples_needed as u64, Ordering::Relaxed);

            let chunk = data.chunk_mut();
            *chunk.offset_mut() = 0;
            *chunk.stride_mut() = stride as i32;
            *chunk.size_mut() = (stride * n_frames) as u32;
        })
        .register()
        .map_err(|e| PipeWireOutputError::Init(format!("Failed to register listener: {}", e)))?;

    let values = crate::pipewire::format_pod(config.sample_rate, config.channels)
        .map_err(PipeWireOutputError::Init)?;
    let mut params = [Pod::from_bytes(&values)
        .ok_or_else(|| PipeWireOutputError::Init("Failed to create Pod from bytes".to_string()))?];

    stream
        .connect(
            spa::utils::Direction::Output,
            None,
            pw::stream::StreamFlags::AUTOCONNECT
                | pw::stream::StreamFlags::MAP_BUFFERS
                | pw::stream::StreamFlags::RT_PROCESS,
            &mut params,
        )
        .map_err(|e| PipeWireOutputError::Init(format!("Failed to connect stream: {}", e)))?;

    let _ = ready.try_send(Ok(()));
    info!("PipeWire output connected, entering main loop");

    let mainloop_weak = mainloop.downgrade();
    let timer = mainloop.loop_().add_timer(move |_| {
        if !running.load(Ordering::Acquire) {
            if let Some(ml) = mainloop_weak.upgrade() {
                ml.quit();
            }
        }
    });

    timer
        .update_timer(
            Some(Duration::from_millis(10)),
            Some(Duration::from_millis(10)),
        )
        .into_result()
        .map_err(|e| PipeWireOutputError::Init(format!("Failed to set timer: {}", e)))?;

    mainloop.run();

    info!("PipeWire output main loop exited");
    Ok(())
}

/// Errors from PipeWire output
#[derive(Debug, thiserror::Error)]
pub enum PipeWireOutputError {
    #[error("Failed to initialize PipeWire output: {0}")]
    Init(String),

    #[error("Failed to spawn PipeWire thread: {0}")]
    ThreadSpawn(String),
}

impl From<PipeWireOutputError> for ChatterError {
    fn from(e: PipeWireOutputError) -> Self {
        ChatterError::DeviceUnavailable(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = PipeWireOutputConfig::default();
        assert_eq!(config.sample_rate, 48000);
        assert_eq!(config.channels, 2);
        assert_eq!(config.name, "chatterbox");
        assert!(config.target.is_none());
    }

    #[test]
    fn test_config_from_format() {
        let format = StreamFormat::new(44_100, 1, 1024);
        let config = PipeWireOutputConfig::from_format("clip", Some("usb".into()), format);
        assert_eq!(config.latency_frames, 1024);
        assert_eq!(config.ring_capacity(), 1024 * 4);
        assert!((config.latency_ms() - 23.2).abs() < 0.1);
    }
}

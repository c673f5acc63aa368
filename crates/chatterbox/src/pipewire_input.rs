//! PipeWire audio input (capture) stream
//!
//! Captures from a device through PipeWire into a ring that the live
//! session reads block by block.
//!
//! Architecture:
//! ```text
//! Hardware Device               Chatterbox
//!       │                            │
//!       ▼                            ▼
//! PipeWire Graph ─────▶ Input Stream (RT thread)
//!                              │
//!                              ▼
//!                       process callback
//!                              │
//!                              ▼
//!                         AudioRing ─────▶ source.read(block)
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use crate::backend::{AudioSource, StreamFormat};
use crate::error::ChatterError;
use crate::ring::{audio_ring_pair, AudioRingConsumer, AudioRingProducer};

const OPEN_TIMEOUT: Duration = Duration::from_secs(2);

/// Configuration for PipeWire input stream
#[derive(Debug, Clone)]
pub struct PipeWireInputConfig {
    pub name: String,
    /// Node to capture from (e.g., "alsa_input.usb-..."); `None` for the default source.
    pub target: Option<String>,
    /// Sample rate (must match device or will fail)
    pub sample_rate: u32,
    /// Number of channels (1=mono, 2=stereo, etc.)
    pub channels: u32,
    pub latency_frames: u32,
    pub block_frames: u32,
}

impl PipeWireInputConfig {
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

    fn block_duration(&self) -> Duration {
        Duration::from_secs_f64(self.block_frames as f64 / self.sample_rate.max(1) as f64)
    }
}

/// Runtime statistics from the PipeWire callback
#[derive(Debug, Default)]
pub struct StreamStats {
    pub callbacks: AtomicU64,
    pub samples_captured: AtomicU64,
    /// Samples dropped because the reader fell behind.
    pub overflows: AtomicU64,
}

/// Handle to a running PipeWire input stream
pub struct PipeWireSource {
    consumer: AudioRingConsumer,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    config: PipeWireInputConfig,
    stats: Arc<StreamStats>,
}

impl PipeWireSource {
    /// Start capturing; returns once the stream is connected.
    pub fn open(config: PipeWireInputConfig) -> Result<Self, PipeWireInputError> {
        crate::pipewire::init_once();

        let capacity = config.block_frames.max(config.latency_frames) as usize
            * config.channels as usize
            * 8;
        let (producer, consumer) = audio_ring_pair(capacity);
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(StreamStats::default());
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);

        let running_clone = Arc::clone(&running);
        let stats_clone = Arc::clone(&stats);
        let config_clone = config.clone();

        let thread_handle = thread::Builder::new()
            .name("pipewire-input".to_string())
            .spawn(move || {
                let ready_err = ready_tx.clone();
                if let Err(e) = run_pipewire_capture_loop(
                    config_clone,
                    producer,
                    Arc::clone(&running_clone),
                    stats_clone,
                    ready_tx,
                ) {
                    error!("PipeWire input thread failed: {}", e);
                    let _ = ready_err.try_send(Err(e.to_string()));
                }
                running_clone.store(false, Ordering::Release);
            })
            .map_err(|e| PipeWireInputError::ThreadSpawn(e.to_string()))?;

        let mut source = Self {
            consumer,
            running,
            thread_handle: Some(thread_handle),
            config,
            stats,
        };

        match ready_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(())) => {
                info!(
                    "PipeWire input stream started: {:?} @ {}Hz",
                    source.config.target, source.config.sample_rate
                );
                Ok(source)
            }
            Ok(Err(message)) => {
                source.stop();
                Err(PipeWireInputError::Init(message))
            }
            Err(_) => {
                source.stop();
                Err(PipeWireInputError::Init("timed out connecting stream".to_string()))
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> &Arc<StreamStats> {
        &self.stats
    }

    /// Stop the stream
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread_handle.take() {
            debug!("Waiting for PipeWire input thread to stop...");
            let _ = handle.join();
            info!(
                overflows = self.stats.overflows.load(Ordering::Relaxed),
                "PipeWire input stream stopped"
            );
        }
    }
}

impl AudioSource for PipeWireSource {
    fn read(&mut self, block: &mut [f32]) -> Result<(), ChatterError> {
        let deadline = Instant::now() + self.config.block_duration() * 4 + Duration::from_millis(100);
        let mut filled = 0;
        while filled < block.len() {
            filled += self.consumer.read(&mut block[filled..]);
            if filled == block.len() {
                break;
            }
            if !self.is_running() || Instant::now() > deadline {
                return Err(ChatterError::DeviceUnavailable(format!(
                    "capture stream {:?} stopped delivering audio",
                    self.config.target
                )));
            }
            thread::sleep(Duration::from_micros(500));
        }
        Ok(())
    }
}

impl Drop for PipeWireSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run the PipeWire capture loop (called from thread)
fn run_pipewire_capture_loop(
    config: PipeWireInputConfig,
    producer: AudioRingProducer,
    running: Arc<AtomicBool>,
    stats: Arc<StreamStats>,
    ready: mpsc::SyncSender<Result<(), String>>,
) -> Result<(), PipeWireInputError> {
    use pipewire as pw;
    use pw::spa::pod::Pod;
    use pw::{properties::properties, spa};

    let mainloop = pw::main_loop::MainLoopRc::new(None).map_err(|e| {
        PipeWireInputError::Init(format!("Failed to create main loop: {}", e))
    })?;

    let context = pw::context::ContextRc::new(&mainloop, None).map_err(|e| {
        PipeWireInputError::Init(format!("Failed to create context: {}", e))
    })?;

    let core = context.connect_rc(None).map_err(|e| {
        PipeWireInputError::Init(format!("Failed to connect to PipeWire: {}", e))
    })?;

    let latency_str = format!("{}/{}", config.latency_frames, config.sample_rate);
    let mut props = properties! {
        *pw::keys::MEDIA_TYPE => "Audio",
        *pw::keys::MEDIA_ROLE => "Communication",
        *pw::keys::MEDIA_CATEGORY => "Capture",
        *pw::keys::AUDIO_CHANNELS => config.channels.to_string(),
    };
    props.insert("node.latency", latency_str.as_str());
    if let Some(target) = config.target.as_deref() {
        props.insert("target.object", target);
    }

    let stream = pw::stream::StreamBox::new(&core, &config.name, props)
        .map_err(|e| PipeWireInputError::Init(format!("Failed to create stream: {}", e)))?;

    let channels = config.channels as usize;
    let sample_size = std::mem::size_of::<f32>();
    let stride = sample_size * channels;
    let scratch = vec![0.0f32; 8192 * channels];

    // RT callback: no allocation, no blocking
    let _listener = stream
        .add_local_listener_with_user_data((producer, stats, scratch))
        .process(move |stream, (producer, stats, scratch)| {
            stats.callbacks.fetch_add(1, Ordering::Relaxed);

            let Some(mut buffer) = stream.dequeue_buffer() else {
                return;
            };

            let datas = buffer.datas_mut();
            let Some(data) = datas.first_mut() else {
                return;
            };

            let size = data.chunk().size() as usize;
            let Some(slice) = data.data() else {
                return;
            };
            let n_samples = (size.min(slice.len()) / stride * channels).min(scratch.len());
            if n_samples == 0 {
                return;
            }

            for (i, sample) in scratch[..n_samples].iter_mut().enumerate() {
                let at = i * sample_size;
                *sample = f32::from_le_bytes([slice[at], slice[at + 1], slice[at + 2], slice[at + 3]]);
            }

            let written = producer.write(&scratch[..n_samples]);
            stats
                .samples_captured
                .fetch_add(written as u64, Ordering::Relaxed);
            if written < n_samples {
                stats
                    .overflows
                    .fetch_add((n_samples - written) as u64, Ordering::Relaxed);
            }
        })
        .register()
        .map_err(|e| {
            PipeWireInputError::Init(format!("Failed to register listener: {}", e))
        })?;

    let values = crate::pipewire::format_pod(config.sample_rate, config.channels)
        .map_err(PipeWireInputError::Init)?;
    let mut params = [Pod::from_bytes(&values).ok_or_else(|| {
        PipeWireInputError::Init("Failed to create Pod from bytes".to_string())
    })?];

    stream
        .connect(
            spa::utils::Direction::Input,
            None,
            pw::stream::StreamFlags::AUTOCONNECT
                | pw::stream::StreamFlags::MAP_BUFFERS
                | pw::stream::StreamFlags::RT_PROCESS,
            &mut params,
        )
        .map_err(|e| PipeWireInputError::Init(format!("Failed to connect stream: {}", e)))?;

    let _ = ready.try_send(Ok(()));
    info!("PipeWire capture stream connected to {:?}, entering main loop", config.target);

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
        .map_err(|e| PipeWireInputError::Init(format!("Failed to set timer: {}", e)))?;

    mainloop.run();

    info!("PipeWire capture main loop exited");
    Ok(())
}

/// Errors from PipeWire input
#[derive(Debug, thiserror::Error)]
pub enum PipeWireInputError {
    #[error("Failed to initialize PipeWire input: {0}")]
    Init(String),

    #[error("Failed to spawn PipeWire thread: {0}")]
    ThreadSpawn(String),
}

impl From<PipeWireInputError> for ChatterError {
    fn from(e: PipeWireInputError) -> Self {
        ChatterError::DeviceUnavailable(e.to_string())
    }
}

//! chatterbox command line
//!
//! Drives the soundboard engine directly against PipeWire, SoX and pigpiod.
//! Long-running commands stop cleanly on Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chatterbox::{
    ActuatorDriver, Hardware, JobState, NullActuator, PigpioDriver, PipeWireBackend, SessionState,
    Soundboard, SoxBackend, STOP_TIMEOUT,
};
use chatterconf::{ChatterConfig, JsonFileStore, LiveMode, MemoryStore, SettingsStore};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// Soundboard engine: clips, live voice effects and a servo mouth
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file used in place of ./chatterbox.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print listings and final status as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List audio devices
    Devices,

    /// List playable clips in the sound directory
    Tracks,

    /// Play a clip from the sound directory
    Play {
        file: String,

        /// Per-clip gain in dB
        #[arg(long, allow_hyphen_values = true)]
        gain_db: Option<f32>,
    },

    /// Play a sine test tone
    Tone {
        #[arg(long, default_value = "440")]
        freq: f32,

        #[arg(long, default_value = "-12", allow_hyphen_values = true)]
        level_db: f32,
    },

    /// Run the live microphone pipeline until Ctrl-C
    Live {
        /// Override the configured mode for this run (not persisted)
        #[arg(long, value_parser = parse_mode)]
        mode: Option<LiveMode>,

        /// Override the fx preset for this run (not persisted)
        #[arg(long)]
        preset: Option<String>,
    },

    /// Show or change the master gain and mute state
    Volume {
        /// New master gain in dB
        #[arg(long, allow_hyphen_values = true)]
        gain_db: Option<f32>,

        #[arg(long)]
        toggle_mute: bool,
    },

    /// Show the effective configuration
    Config,
}

fn parse_mode(s: &str) -> Result<LiveMode, String> {
    match s {
        "normal" => Ok(LiveMode::Normal),
        "fx" => Ok(LiveMode::Fx),
        other => Err(format!("unknown mode '{other}' (normal|fx)")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, sources) = ChatterConfig::load_with_sources_from(cli.config.as_deref())
        .context("Failed to load configuration")?;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.infra.telemetry.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    if let Command::Config = cli.command {
        for file in &sources.files {
            println!("# loaded {}", file.display());
        }
        for var in &sources.env_overrides {
            println!("# override {var}");
        }
        print!("{}", config.to_toml());
        return Ok(());
    }

    let file_store = JsonFileStore::new(&config.infra.paths.settings_file);
    let store: Arc<dyn SettingsStore> = match &cli.command {
        Command::Live { mode, preset } if mode.is_some() || preset.is_some() => {
            let mut settings = file_store.load().context("Failed to load settings")?;
            if let Some(mode) = mode {
                settings.live.mode = *mode;
            }
            if let Some(preset) = preset {
                settings.live.fx.preset = preset.clone();
            }
            Arc::new(MemoryStore::new(settings))
        }
        _ => Arc::new(file_store),
    };
    let settings = store.load().context("Failed to load settings")?;

    let hardware = Hardware {
        audio: Arc::new(PipeWireBackend::new()),
        effects: Arc::new(SoxBackend::new(
            &config.infra.effects.sox_program,
            settings.live.fx.sox_buffer_frames,
        )),
        actuator: connect_actuator(&config, settings.servo.gpio, settings.servo.power_gpio),
    };
    let board = Soundboard::open(store, &config.infra.paths.sound_dir, hardware)
        .context("Failed to start soundboard")?;

    match cli.command {
        // printed before the board was built
        Command::Config => {}
        Command::Devices => {
            let current = board.current_device();
            let devices = board.devices()?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&devices)?);
                return Ok(());
            }
            for device in devices {
                let marker = if device.id == current { "*" } else { " " };
                let dir = match (device.input, device.output) {
                    (true, true) => "in/out",
                    (true, false) => "in",
                    _ => "out",
                };
                println!("{marker} {:<48} {:<6} {}", device.id, dir, device.name);
            }
        }
        Command::Tracks => {
            let tracks = board.tracks()?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&tracks)?);
                return Ok(());
            }
            for track in tracks {
                println!("{:<40} {}", track.file, track.name);
            }
        }
        Command::Play { file, gain_db } => {
            let id = board.play(&file, gain_db)?;
            tracing::info!(job.id = %id, %file, "playing");
            wait_for_playback(&board).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&board.playback_status())?);
            }
        }
        Command::Tone { freq, level_db } => {
            board.test_tone(freq, level_db)?;
            wait_for_playback(&board).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&board.playback_status())?);
            }
        }
        Command::Volume { gain_db, toggle_mute } => {
            if let Some(gain_db) = gain_db {
                let mut next = board.settings();
                next.audio.gain_db = gain_db;
                board.update_settings(next)?;
            }
            if toggle_mute {
                board.toggle_mute()?;
            }
            let audio = board.settings().audio;
            if cli.json {
                let volume = serde_json::json!({ "gain_db": audio.gain_db, "muted": audio.muted });
                println!("{}", serde_json::to_string_pretty(&volume)?);
            } else {
                let state = if audio.muted { "muted" } else { "on" };
                println!("gain {:+.1} dB ({state})", audio.gain_db);
            }
        }
        Command::Live { .. } => {
            board.start_live()?;
            tracing::info!("live session started; Ctrl-C to stop");
            let ctrl_c = tokio::signal::ctrl_c();
            tokio::pin!(ctrl_c);
            loop {
                tokio::select! {
                    _ = &mut ctrl_c => {
                        board.stop_live();
                        if !board.wait_live_idle(STOP_TIMEOUT) {
                            tracing::warn!("live session still winding down");
                        }
                        break;
                    }
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {
                        if board.live_status().state == SessionState::Crashed {
                            for entry in board.live_log(20) {
                                eprintln!("{} {:?} {}", entry.at, entry.level, entry.message);
                            }
                            board.shutdown();
                            anyhow::bail!("live session crashed");
                        }
                    }
                }
            }
            let status = board.live_status();
            tracing::info!(blocks = status.blocks, overruns = status.overruns, "live session ended");
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            }
        }
    }

    board.shutdown();
    Ok(())
}

fn connect_actuator(
    config: &ChatterConfig,
    servo_gpio: Option<u8>,
    power_gpio: Option<u8>,
) -> Box<dyn ActuatorDriver> {
    if servo_gpio.is_none() && power_gpio.is_none() {
        return Box::new(NullActuator);
    }
    let actuator = &config.infra.actuator;
    match PigpioDriver::connect(
        &actuator.pigpiod_addr,
        Duration::from_millis(actuator.connect_timeout_ms),
        servo_gpio,
        power_gpio,
    ) {
        Ok(driver) => Box::new(driver),
        Err(e) => {
            tracing::warn!(error = %e, "pigpiod unavailable; servo disabled for this run");
            Box::new(NullActuator)
        }
    }
}

async fn wait_for_playback(board: &Soundboard) -> Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                board.stop(true);
                board.wait_playback_idle(Duration::from_secs(1));
                return Ok(());
            }
            _ = tokio::time::sleep(Duration::from_millis(50)) => {
                let status = board.playback_status();
                match status.state {
                    Some(JobState::Failed) => {
                        let reason = status.last_error.map(|e| e.message).unwrap_or_default();
                        anyhow::bail!("playback failed: {reason}");
                    }
                    Some(state) if state.is_active() => {}
                    _ => return Ok(()),
                }
            }
        }
    }
}

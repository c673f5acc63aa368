//! Clip decoding
//!
//! WAV goes through hound (always available); everything else through
//! symphonia when the `symphonia-decode` feature is enabled. Decoding happens
//! up front on the caller's thread, never on an audio path.

use std::io::Cursor;
use std::path::Path;

use anyhow::{anyhow, Context, Result};

use crate::error::ChatterError;

/// Decoded audio ready for playback
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    /// Interleaved samples (L, R, L, R, ...)
    pub samples: Vec<f32>,
    /// Original sample rate
    pub sample_rate: u32,
    /// Number of channels (1 = mono, 2 = stereo)
    pub channels: u8,
}

impl DecodedAudio {
    /// Total number of frames (samples per channel)
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }

    /// Duration in seconds
    pub fn duration_seconds(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    /// A mono sine at `freq_hz` and `level_dbfs`, `duration_ms` long.
    pub fn sine(freq_hz: f32, level_dbfs: f32, duration_ms: u32, sample_rate: u32) -> Self {
        let amplitude = crate::backend::db_to_linear(level_dbfs);
        let frames = (sample_rate as u64 * duration_ms as u64 / 1000) as usize;
        let step = std::f32::consts::TAU * freq_hz / sample_rate as f32;
        let samples = (0..frames)
            .map(|i| amplitude * (step * i as f32).sin())
            .collect();
        Self {
            samples,
            sample_rate,
            channels: 1,
        }
    }
}

/// Decode WAV audio using hound (always available)
pub fn decode_wav(data: &[u8]) -> Result<DecodedAudio> {
    let cursor = Cursor::new(data);
    let reader = hound::WavReader::new(cursor).context("failed to parse WAV header")?;

    let spec = reader.spec();
    let channels = spec.channels as u8;
    let sample_rate = spec.sample_rate;

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<Vec<_>, _>>()
            .context("failed to read float samples")?,
        hound::SampleFormat::Int => {
            let bits = spec.bits_per_sample;
            let max_val = (1i64 << (bits - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_val))
                .collect::<Result<Vec<_>, _>>()
                .context("failed to read int samples")?
        }
    };

    Ok(DecodedAudio {
        samples,
        sample_rate,
        channels,
    })
}

/// Decode audio using symphonia (MP3 and whatever else the default registry knows)
#[cfg(feature = "symphonia-decode")]
pub fn decode_audio_symphonia(data: &[u8], extension: Option<&str>) -> Result<DecodedAudio> {
    use symphonia::core::audio::SampleBuffer;
    use symphonia::core::codecs::DecoderOptions;
    use symphonia::core::formats::FormatOptions;
    use symphonia::core::io::MediaSourceStream;
    use symphonia::core::meta::MetadataOptions;
    use symphonia::core::probe::Hint;

    let cursor = Cursor::new(data.to_vec());
    let mss = MediaSourceStream::new(Box::new(cursor), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = extension {
        hint.with_extension(ext);
    }

    let found = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .context("failed to detect audio format")?;

    let mut format = found.format;
    let track = format
        .default_track()
        .ok_or_else(|| anyhow!("no audio track found"))?;

    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| anyhow!("no sample rate"))?;
    let channels = track
        .codec_params
        .channels
        .map(|c| c.count() as u8)
        .unwrap_or(2);

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .context("failed to create decoder")?;

    let track_id = track.id;
    let mut samples: Vec<f32> = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(symphonia::core::errors::Error::IoError(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(e) => return Err(e).context("failed to read packet"),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = decoder.decode(&packet).context("failed to decode packet")?;

        let spec = *decoded.spec();
        let duration = decoded.capacity();

        let mut sample_buf = SampleBuffer::<f32>::new(duration as u64, spec);
        sample_buf.copy_interleaved_ref(decoded);

        samples.extend(sample_buf.samples());
    }

    Ok(DecodedAudio {
        samples,
        sample_rate,
        channels,
    })
}

/// Decode audio from raw bytes
///
/// Tries WAV first (hound), then symphonia formats if the feature is enabled.
pub fn decode_audio(data: &[u8], extension: Option<&str>) -> Result<DecodedAudio> {
    if data.len() >= 4 && &data[0..4] == b"RIFF" {
        return decode_wav(data);
    }

    #[cfg(feature = "symphonia-decode")]
    {
        decode_audio_symphonia(data, extension)
    }

    #[cfg(not(feature = "symphonia-decode"))]
    {
        let _ = extension;
        Err(anyhow!(
            "unsupported audio format (enable symphonia-decode feature for MP3/FLAC)"
        ))
    }
}

/// Read and decode a clip from disk.
pub fn decode_file(path: &Path) -> Result<DecodedAudio, ChatterError> {
    let decoded = std::fs::read(path)
        .with_context(|| format!("failed to read {}", path.display()))
        .and_then(|data| {
            let ext = path.extension().and_then(|e| e.to_str());
            decode_audio(&data, ext)
        })
        .and_then(|audio| {
            if audio.channels == 0 || audio.sample_rate == 0 {
                Err(anyhow!("stream has no channels or no sample rate"))
            } else if audio.samples.is_empty() {
                Err(anyhow!("stream has no samples"))
            } else {
                Ok(audio)
            }
        });

    decoded.map_err(|e| ChatterError::DecodeFailure(format!("{}: {:#}", path.display(), e)))
}

/// Clip length from the container header, without decoding any audio.
pub fn read_duration(path: &Path) -> Option<f64> {
    if let Ok(reader) = hound::WavReader::open(path) {
        let rate = reader.spec().sample_rate;
        return (rate > 0).then(|| reader.duration() as f64 / rate as f64);
    }
    symphonia_duration(path)
}

#[cfg(feature = "symphonia-decode")]
fn symphonia_duration(path: &Path) -> Option<f64> {
    use symphonia::core::formats::FormatOptions;
    use symphonia::core::io::MediaSourceStream;
    use symphonia::core::meta::MetadataOptions;
    use symphonia::core::probe::Hint;

    let file = std::fs::File::open(path).ok()?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());
    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }
    let found = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .ok()?;
    let params = &found.format.default_track()?.codec_params;
    let frames = params.n_frames?;
    let rate = params.sample_rate.filter(|r| *r > 0)?;
    Some(frames as f64 / rate as f64)
}

#[cfg(not(feature = "symphonia-decode"))]
fn symphonia_duration(_path: &Path) -> Option<f64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wav_bytes(samples: &[i16], channels: u16) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels,
            sample_rate: 22_050,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for s in samples {
                writer.write_sample(*s).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn test_decode_int_wav_scales_to_unit() {
        let data = wav_bytes(&[16384, -16384, 0, 32767], 2);
        let audio = decode_audio(&data, Some("wav")).unwrap();
        assert_eq!(audio.channels, 2);
        assert_eq!(audio.sample_rate, 22_050);
        assert_eq!(audio.frames(), 2);
        assert!((audio.samples[0] - 0.5).abs() < 1e-4);
        assert!((audio.samples[1] + 0.5).abs() < 1e-4);
    }

    #[test]
    fn test_garbage_is_decode_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("noise.mp3");
        std::fs::write(&path, b"definitely not audio").unwrap();

        let err = decode_file(&path).unwrap_err();
        assert!(matches!(err, ChatterError::DecodeFailure(_)));
    }

    #[test]
    fn test_missing_file_is_decode_failure() {
        let err = decode_file(Path::new("/nonexistent/clip.wav")).unwrap_err();
        assert!(matches!(err, ChatterError::DecodeFailure(_)));
    }

    #[test]
    fn test_read_duration_from_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        // 22050 stereo frames: one second
        std::fs::write(&path, wav_bytes(&vec![0i16; 44_100], 2)).unwrap();
        let seconds = read_duration(&path).unwrap();
        assert!((seconds - 1.0).abs() < 1e-9);

        let junk = dir.path().join("junk.mp3");
        std::fs::write(&junk, b"definitely not audio").unwrap();
        assert_eq!(read_duration(&junk), None);
    }

    #[test]
    fn test_sine_level() {
        let tone = DecodedAudio::sine(1000.0, -6.0, 100, 48_000);
        assert_eq!(tone.frames(), 4800);
        let peak = tone.samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        assert!((peak - 0.501).abs() < 0.01);
    }
}

//! Application configuration
//!
//! Loaded from a TOML file; every section falls back to defaults so a
//! partial file (or none at all) is fine.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::audio::backend::VoiceFormat;
use crate::audio::playback::UnderrunPolicy;
use crate::constants::{DEFAULT_BITRATE, MAX_PACKET_SIZE, OPUS_SAMPLE_RATE};
use crate::error::{Error, Result};

/// Opus application mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OpusApplication {
    #[default]
    Voip,
    Audio,
    LowDelay,
}

/// Opus encoder settings. Voice is always mono.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpusConfig {
    pub sample_rate: u32,
    pub bitrate: u32,
    pub vbr: bool,
    /// Constrained VBR, only used when `vbr` is set
    pub cvbr: bool,
    /// In-band forward error correction
    pub fec: bool,
    pub packet_loss_perc: u8,
    pub application: OpusApplication,
}

impl Default for OpusConfig {
    fn default() -> Self {
        Self {
            sample_rate: OPUS_SAMPLE_RATE,
            bitrate: DEFAULT_BITRATE,
            vbr: true,
            cvbr: false,
            fec: true,
            packet_loss_perc: 5,
            application: OpusApplication::Voip,
        }
    }
}

impl OpusConfig {
    /// Duration of `frame_size` samples in milliseconds
    pub fn frame_duration_ms(&self, frame_size: usize) -> f32 {
        frame_size as f32 * 1000.0 / self.sample_rate as f32
    }
}

/// Remote voice playback settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Length of the device's circular buffer
    pub buffer_seconds: f32,
    pub input_format: VoiceFormat,
    pub underrun_policy: UnderrunPolicy,
    pub volume: f32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            buffer_seconds: 1.0,
            input_format: VoiceFormat::Pcm16Samples,
            underrun_policy: UnderrunPolicy::SnapWriteCursor,
            volume: 1.0,
        }
    }
}

/// Microphone capture settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub driver_index: usize,
    pub output_format: VoiceFormat,
    /// Forces resampling when the driver records at a different rate
    pub output_sample_rate: u32,
    pub resample_chunk: usize,
    /// Length of the capture device's circular buffer
    pub buffer_seconds: f32,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            driver_index: 0,
            output_format: VoiceFormat::Pcm16Samples,
            output_sample_rate: OPUS_SAMPLE_RATE,
            resample_chunk: crate::audio::capture::DEFAULT_RESAMPLE_CHUNK,
            buffer_seconds: 1.0,
        }
    }
}

/// UDP transport settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub bind_address: SocketAddr,
    pub peer_address: Option<SocketAddr>,
    pub max_packet_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], crate::constants::DEFAULT_UDP_PORT)),
            peer_address: None,
            max_packet_size: MAX_PACKET_SIZE,
        }
    }
}

/// Tick scheduling and failure handling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub tick_interval_ms: u64,
    /// Consecutive failed ticks before a session reports itself unavailable
    pub max_backend_failures: u32,
    /// Also play back our own voice
    pub monitor_own_voice: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 10,
            max_backend_failures: 50,
            monitor_own_voice: false,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub codec: OpusConfig,
    pub playback: PlaybackConfig,
    pub recording: RecordingConfig,
    pub network: NetworkConfig,
    pub session: SessionConfig,
}

impl AppConfig {
    /// Platform config file location, if a home directory can be found
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "proximity-voice")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the default location, falling back to defaults when absent
    pub fn load_or_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.codec.sample_rate != OPUS_SAMPLE_RATE {
            return Err(Error::Config(format!(
                "Codec sample rate must be {} Hz, got {}",
                OPUS_SAMPLE_RATE, self.codec.sample_rate
            )));
        }
        if self.playback.buffer_seconds <= 0.0 || self.recording.buffer_seconds <= 0.0 {
            return Err(Error::Config("Buffer lengths must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.playback.volume) {
            return Err(Error::Config(format!("Volume {} outside 0..=1", self.playback.volume)));
        }
        if self.recording.resample_chunk == 0 {
            return Err(Error::Config("Resample chunk size must be positive".into()));
        }
        if self.session.tick_interval_ms == 0 {
            return Err(Error::Config("Tick interval must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [playback]
            underrun_policy = "rewind_playback"
            volume = 0.5

            [recording]
            output_format = "pcm16_bytes"
            "#,
        )
        .unwrap();

        assert_eq!(config.playback.underrun_policy, UnderrunPolicy::RewindPlayback);
        assert_eq!(config.playback.volume, 0.5);
        assert_eq!(config.recording.output_format, VoiceFormat::Pcm16Bytes);
        assert_eq!(config.codec, OpusConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = AppConfig::default();
        config.session.tick_interval_ms = 20;
        config.network.peer_address = Some("127.0.0.1:6000".parse().unwrap());
        config.save(&path).unwrap();

        assert_eq!(AppConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_rejects_wrong_codec_rate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[codec]\nsample_rate = 44100\n").unwrap();

        assert!(matches!(AppConfig::load(&path), Err(Error::Config(_))));
    }

    #[test]
    fn test_frame_duration() {
        let config = OpusConfig::default();
        assert!((config.frame_duration_ms(960) - 20.0).abs() < 1e-3);
        assert!((config.frame_duration_ms(120) - 2.5).abs() < 1e-3);
    }
}

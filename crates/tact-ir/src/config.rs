//! Sound configuration read by the scheduler at startup and on
//! reconfiguration.

use alloc::string::{String, ToString};
use core::time::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audio_buffer::{SampleFormat, MAX_CHANNELS, MAX_FRAMES};

/// Lowest accepted sample rate (Hz).
pub const MIN_SAMPLERATE: u32 = 8000;
/// Highest accepted sample rate (Hz).
pub const MAX_SAMPLERATE: u32 = 192_000;

/// Errors detected while building or validating a [`SoundConfig`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("samplerate {0} Hz out of range")]
    Samplerate(u32),

    #[error("buffer size {0} out of range")]
    BufferSize(u32),

    #[error("pcm channel count {0} out of range")]
    PcmChannels(u32),

    #[error("unsupported sample format: {0}-bit")]
    UnsupportedFormat(u32),

    #[error("invalid value {value:?} for key {key}")]
    InvalidValue { key: String, value: String },

    #[error("super-threaded model requires an audio or channel scope")]
    MissingScope,
}

/// How recycling chains are mapped onto OS threads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ThreadModel {
    /// Every chain is walked on the orchestrating thread.
    #[default]
    SingleThreaded,
    /// Chains get dedicated worker threads, see [`SuperThreadedScope`].
    SuperThreaded,
}

/// Granularity of worker threads in the super-threaded model.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SuperThreadedScope {
    #[default]
    None,
    /// One worker per audio, walking all of its chains.
    Audio,
    /// One worker per recycling chain.
    Channel,
}

/// Sample rate, block size and format shared by the whole engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SoundConfig {
    pub samplerate: u32,
    pub buffer_size: u32,
    pub pcm_channels: u16,
    pub format: SampleFormat,
    pub thread_model: ThreadModel,
    pub super_threaded_scope: SuperThreadedScope,
}

impl Default for SoundConfig {
    fn default() -> Self {
        Self {
            samplerate: 44100,
            buffer_size: 512,
            pcm_channels: 2,
            format: SampleFormat::S16,
            thread_model: ThreadModel::SingleThreaded,
            super_threaded_scope: SuperThreadedScope::None,
        }
    }
}

impl SoundConfig {
    /// Build a configuration from a flat key/value map.
    ///
    /// Missing keys keep their defaults and unknown keys are ignored, so
    /// a full preferences map can be passed through unfiltered.
    pub fn from_map<I, K, V>(entries: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = SoundConfig::default();
        for (key, value) in entries {
            let (key, value) = (key.as_ref(), value.as_ref().trim());
            match key {
                "samplerate" => config.samplerate = parse_number(key, value)?,
                "buffer-size" => config.buffer_size = parse_number(key, value)?,
                "pcm-channels" => config.pcm_channels = parse_number(key, value)?,
                "format" => {
                    let bits: u32 = parse_number(key, value)?;
                    config.format = u8::try_from(bits)
                        .ok()
                        .and_then(SampleFormat::from_bits)
                        .ok_or(ConfigError::UnsupportedFormat(bits))?;
                }
                "thread-model" => {
                    config.thread_model = match value {
                        "single-threaded" => ThreadModel::SingleThreaded,
                        "super-threaded" => ThreadModel::SuperThreaded,
                        _ => return Err(invalid(key, value)),
                    }
                }
                "super-threaded-scope" => {
                    config.super_threaded_scope = match value {
                        "none" => SuperThreadedScope::None,
                        "audio" => SuperThreadedScope::Audio,
                        "channel" => SuperThreadedScope::Channel,
                        _ => return Err(invalid(key, value)),
                    }
                }
                _ => {}
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Check every field against the supported ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_SAMPLERATE..=MAX_SAMPLERATE).contains(&self.samplerate) {
            return Err(ConfigError::Samplerate(self.samplerate));
        }
        if !(1..=MAX_FRAMES).contains(&self.buffer_size) {
            return Err(ConfigError::BufferSize(self.buffer_size));
        }
        if !(1..=MAX_CHANNELS).contains(&self.pcm_channels) {
            return Err(ConfigError::PcmChannels(self.pcm_channels as u32));
        }
        if self.thread_model == ThreadModel::SuperThreaded
            && self.super_threaded_scope == SuperThreadedScope::None
        {
            return Err(ConfigError::MissingScope);
        }
        Ok(())
    }

    /// Ticks per second.
    pub fn delay(&self) -> f64 {
        self.samplerate as f64 / self.buffer_size as f64
    }

    /// Wall-clock budget of one tick.
    pub fn tick_duration(&self) -> Duration {
        Duration::from_nanos(self.buffer_size as u64 * 1_000_000_000 / self.samplerate as u64)
    }

    pub fn is_super_threaded(&self) -> bool {
        self.thread_model == ThreadModel::SuperThreaded
    }
}

fn parse_number<T: core::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| invalid(key, value))
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

//! Multichannel f32 audio buffer with planar layout and a PCM format tag.

use alloc::vec;
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// Maximum number of audio channels per buffer.
pub const MAX_CHANNELS: u16 = 8;

/// Maximum number of frames per buffer.
pub const MAX_FRAMES: u32 = 8192;

/// Signed integer PCM format the buffer is rendered to at the sink.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum SampleFormat {
    S8,
    #[default]
    S16,
    S24,
    S32,
    S64,
}

impl SampleFormat {
    /// Bits per sample.
    pub const fn bits(self) -> u8 {
        match self {
            SampleFormat::S8 => 8,
            SampleFormat::S16 => 16,
            SampleFormat::S24 => 24,
            SampleFormat::S32 => 32,
            SampleFormat::S64 => 64,
        }
    }

    /// Bytes per encoded sample.
    pub const fn bytes(self) -> usize {
        self.bits() as usize / 8
    }

    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            8 => Some(SampleFormat::S8),
            16 => Some(SampleFormat::S16),
            24 => Some(SampleFormat::S24),
            32 => Some(SampleFormat::S32),
            64 => Some(SampleFormat::S64),
            _ => None,
        }
    }

    /// Largest positive integer value of this format.
    fn full_scale(self) -> f64 {
        match self {
            SampleFormat::S8 => i8::MAX as f64,
            SampleFormat::S16 => i16::MAX as f64,
            SampleFormat::S24 => 8_388_607.0,
            SampleFormat::S32 => i32::MAX as f64,
            SampleFormat::S64 => i64::MAX as f64,
        }
    }
}

impl TryFrom<u8> for SampleFormat {
    type Error = ConfigError;

    fn try_from(bits: u8) -> Result<Self, Self::Error> {
        SampleFormat::from_bits(bits).ok_or(ConfigError::UnsupportedFormat(bits as u32))
    }
}

impl From<SampleFormat> for u8 {
    fn from(format: SampleFormat) -> u8 {
        format.bits()
    }
}

/// A multichannel f32 audio buffer in planar layout.
///
/// Data is stored as `channels` contiguous planes of `frames` samples each.
/// `data[ch * frames + frame]` gives the sample for channel `ch` at `frame`.
/// The `format` tag names the PCM encoding used when the buffer leaves
/// the engine; interleaved output uses a stride of `channels` samples.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioBuffer {
    data: Vec<f32>,
    channels: u16,
    frames: u32,
    format: SampleFormat,
}

impl AudioBuffer {
    /// Create a new silent buffer with the given dimensions.
    pub fn new(channels: u16, frames: u32, format: SampleFormat) -> Self {
        Self {
            data: vec![0.0; channels as usize * frames as usize],
            channels,
            frames,
            format,
        }
    }

    /// Fill all samples with zero.
    pub fn silence(&mut self) {
        self.data.fill(0.0);
    }

    /// Number of channels.
    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Number of frames.
    pub fn frames(&self) -> u32 {
        self.frames
    }

    /// Sample count across all channels.
    pub fn samples(&self) -> usize {
        self.data.len()
    }

    /// Distance between two frames of one channel in interleaved output.
    pub fn stride(&self) -> usize {
        self.channels as usize
    }

    pub fn format(&self) -> SampleFormat {
        self.format
    }

    /// Read-only access to one channel's sample data.
    pub fn channel(&self, ch: u16) -> &[f32] {
        let start = ch as usize * self.frames as usize;
        &self.data[start..start + self.frames as usize]
    }

    /// Mutable access to one channel's sample data.
    pub fn channel_mut(&mut self, ch: u16) -> &mut [f32] {
        let start = ch as usize * self.frames as usize;
        let len = self.frames as usize;
        &mut self.data[start..start + len]
    }

    /// Whether every sample is zero.
    pub fn is_silent(&self) -> bool {
        self.data.iter().all(|&s| s == 0.0)
    }

    /// Change dimensions and format, discarding the content.
    ///
    /// Used when the sound configuration changes and for one-shot
    /// operations that need a buffer of a different length.
    pub fn reallocate(&mut self, channels: u16, frames: u32, format: SampleFormat) {
        self.data.clear();
        self.data.resize(channels as usize * frames as usize, 0.0);
        self.channels = channels;
        self.frames = frames;
        self.format = format;
    }

    /// Overwrite overlapping channels with `source`, silencing the rest.
    pub fn copy_from(&mut self, source: &AudioBuffer) {
        self.silence();
        self.mix_from(source);
    }

    /// Sum overlapping channels from `source` into this buffer.
    pub fn mix_from(&mut self, source: &AudioBuffer) {
        self.mix_from_scaled(source, 1.0);
    }

    /// Sum overlapping channels from `source` into this buffer with gain.
    pub fn mix_from_scaled(&mut self, source: &AudioBuffer, gain: f32) {
        let chs = self.channels.min(source.channels);
        let frs = self.frames.min(source.frames) as usize;
        for ch in 0..chs {
            let dst = self.channel_mut(ch);
            let src = source.channel(ch);
            for i in 0..frs {
                dst[i] += src[i] * gain;
            }
        }
    }

    /// Scale all samples by `gain`.
    pub fn apply_gain(&mut self, gain: f32) {
        for s in &mut self.data {
            *s *= gain;
        }
    }

    /// Append the buffer as interleaved little-endian signed PCM.
    pub fn write_pcm(&self, out: &mut Vec<u8>) {
        let scale = self.format.full_scale();
        out.reserve(self.samples() * self.format.bytes());
        for frame in 0..self.frames as usize {
            for ch in 0..self.channels as usize {
                let sample = self.data[ch * self.frames as usize + frame].clamp(-1.0, 1.0) as f64;
                let value = sample * scale;
                match self.format {
                    SampleFormat::S8 => out.push(value as i8 as u8),
                    SampleFormat::S16 => out.extend_from_slice(&(value as i16).to_le_bytes()),
                    SampleFormat::S24 => out.extend_from_slice(&(value as i32).to_le_bytes()[..3]),
                    SampleFormat::S32 => out.extend_from_slice(&(value as i32).to_le_bytes()),
                    SampleFormat::S64 => out.extend_from_slice(&(value as i64).to_le_bytes()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_is_silent() {
        let buf = AudioBuffer::new(2, 4, SampleFormat::S16);
        assert_eq!(buf.channels(), 2);
        assert_eq!(buf.frames(), 4);
        assert_eq!(buf.stride(), 2);
        assert!(buf.is_silent());
    }

    #[test]
    fn channel_mut_writes_correctly() {
        let mut buf = AudioBuffer::new(2, 2, SampleFormat::S16);
        buf.channel_mut(0)[0] = 1.0;
        buf.channel_mut(1)[1] = -0.5;
        assert_eq!(buf.channel(0), &[1.0, 0.0]);
        assert_eq!(buf.channel(1), &[0.0, -0.5]);
    }

    #[test]
    fn copy_from_replaces_content() {
        let mut dst = AudioBuffer::new(2, 2, SampleFormat::S16);
        dst.channel_mut(1)[0] = 0.9;
        let mut src = AudioBuffer::new(1, 2, SampleFormat::S16);
        src.channel_mut(0)[1] = 0.25;

        dst.copy_from(&src);
        assert_eq!(dst.channel(0), &[0.0, 0.25]);
        assert_eq!(dst.channel(1), &[0.0, 0.0]);
    }

    #[test]
    fn mix_from_scaled_applies_gain() {
        let mut dst = AudioBuffer::new(1, 2, SampleFormat::S16);
        let mut src = AudioBuffer::new(1, 2, SampleFormat::S16);
        src.channel_mut(0)[0] = 1.0;
        src.channel_mut(0)[1] = -1.0;

        dst.mix_from_scaled(&src, 0.5);
        assert!((dst.channel(0)[0] - 0.5).abs() < 1e-6);
        assert!((dst.channel(0)[1] - -0.5).abs() < 1e-6);
    }

    #[test]
    fn reallocate_changes_length() {
        let mut buf = AudioBuffer::new(2, 512, SampleFormat::S16);
        buf.channel_mut(0)[0] = 1.0;
        buf.reallocate(1, 1024, SampleFormat::S32);
        assert_eq!(buf.frames(), 1024);
        assert_eq!(buf.channels(), 1);
        assert_eq!(buf.format(), SampleFormat::S32);
        assert!(buf.is_silent());
    }

    #[test]
    fn pcm16_is_interleaved() {
        let mut buf = AudioBuffer::new(2, 2, SampleFormat::S16);
        buf.channel_mut(0)[0] = 1.0;
        buf.channel_mut(1)[0] = -1.0;
        buf.channel_mut(0)[1] = 0.5;

        let mut out = Vec::new();
        buf.write_pcm(&mut out);
        assert_eq!(out.len(), 8);
        assert_eq!(i16::from_le_bytes([out[0], out[1]]), i16::MAX);
        assert_eq!(i16::from_le_bytes([out[2], out[3]]), -i16::MAX);
        assert_eq!(i16::from_le_bytes([out[4], out[5]]), 16383);
        assert_eq!(i16::from_le_bytes([out[6], out[7]]), 0);
    }

    #[test]
    fn pcm_width_follows_format() {
        for (format, width) in [
            (SampleFormat::S8, 1),
            (SampleFormat::S24, 3),
            (SampleFormat::S32, 4),
            (SampleFormat::S64, 8),
        ] {
            let buf = AudioBuffer::new(2, 3, format);
            let mut out = Vec::new();
            buf.write_pcm(&mut out);
            assert_eq!(out.len(), 2 * 3 * width);
        }
    }

    #[test]
    fn format_from_bits() {
        assert_eq!(SampleFormat::try_from(24u8).ok(), Some(SampleFormat::S24));
        assert!(SampleFormat::try_from(12u8).is_err());
    }
}

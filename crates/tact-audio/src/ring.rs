//! Lock-free ring-buffer sink drained by a consumer thread.

use ringbuf::traits::{Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use tact_ir::{AudioBuffer, SampleFormat, SoundConfig};

use crate::traits::{AudioError, AudioSink, OutputLine};

/// Mixes the outputs of a tick into `pcm-channels` device channels and
/// pushes them interleaved into a ring buffer.
///
/// Samples that do not fit are dropped; the producer side never blocks.
pub struct RingSink {
    mix: AudioBuffer,
    producer: HeapProd<f32>,
    dropped: u64,
}

impl RingSink {
    /// Create a sink holding `ticks` ticks of audio and its consumer half.
    pub fn new(config: &SoundConfig, ticks: usize) -> (Self, HeapCons<f32>) {
        let capacity = ticks.max(1) * config.buffer_size as usize * config.pcm_channels as usize;
        let (producer, consumer) = HeapRb::<f32>::new(capacity).split();
        let sink = Self {
            mix: AudioBuffer::new(config.pcm_channels, config.buffer_size, config.format),
            producer,
            dropped: 0,
        };
        (sink, consumer)
    }

    /// Samples discarded because the consumer fell behind.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Adapt the mix buffer to a new configuration.
    pub fn reconfigure(&mut self, pcm_channels: u16, frames: u32, format: SampleFormat) {
        self.mix.reallocate(pcm_channels, frames, format);
    }
}

impl AudioSink for RingSink {
    fn write(&mut self, line: OutputLine, buffer: &AudioBuffer) -> Result<(), AudioError> {
        let target = line.audio_channel % self.mix.channels();
        let frames = self.mix.frames().min(buffer.frames()) as usize;
        for ch in 0..buffer.channels() {
            let dst = (target + ch) % self.mix.channels();
            let src = buffer.channel(ch);
            let out = self.mix.channel_mut(dst);
            for i in 0..frames {
                out[i] += src[i];
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), AudioError> {
        for frame in 0..self.mix.frames() as usize {
            for ch in 0..self.mix.channels() {
                let sample = self.mix.channel(ch)[frame];
                if self.producer.try_push(sample).is_err() {
                    self.dropped += 1;
                }
            }
        }
        self.mix.silence();
        Ok(())
    }
}

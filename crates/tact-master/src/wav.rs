//! WAV encoding of rendered ticks.

use std::io::Write;
use tact_audio::WrittenBlock;
use tact_ir::{AudioBuffer, SoundConfig};

/// Write interleaved PCM bytes as a WAV file in the layout of `config`.
pub fn write_wav(w: &mut impl Write, pcm: &[u8], config: &SoundConfig) -> std::io::Result<()> {
    let num_channels = config.pcm_channels;
    let bits_per_sample = config.format.bits() as u16;
    let block_align = num_channels * (bits_per_sample / 8);
    let data_size = pcm.len() as u32;

    write_riff_header(w, data_size)?;
    write_fmt_chunk(w, num_channels, config.samplerate, block_align, bits_per_sample)?;
    w.write_all(b"data")?;
    w.write_all(&data_size.to_le_bytes())?;
    w.write_all(pcm)
}

/// Mix captured blocks down to the device channel layout, tick by tick,
/// and encode them as a WAV file.
pub fn blocks_to_wav(blocks: &[WrittenBlock], config: &SoundConfig) -> Vec<u8> {
    let mut pcm = Vec::new();
    let mut mix = AudioBuffer::new(config.pcm_channels, config.buffer_size, config.format);
    let mut current = blocks.first().map(|b| b.tick);
    for block in blocks {
        if Some(block.tick) != current {
            mix.write_pcm(&mut pcm);
            mix.silence();
            current = Some(block.tick);
        }
        mix_into(&mut mix, block);
    }
    if current.is_some() {
        mix.write_pcm(&mut pcm);
    }

    let mut buf = Vec::with_capacity(pcm.len() + 44);
    if let Err(err) = write_wav(&mut buf, &pcm, config) {
        log::error!("wav encoding failed: {err}");
    }
    buf
}

fn mix_into(mix: &mut AudioBuffer, block: &WrittenBlock) {
    let channels = mix.channels();
    for ch in 0..block.buffer.channels() {
        let target = (block.line.audio_channel + ch) % channels;
        for (out, sample) in mix.channel_mut(target).iter_mut().zip(block.buffer.channel(ch)) {
            *out += sample;
        }
    }
}

fn write_riff_header(w: &mut impl Write, data_size: u32) -> std::io::Result<()> {
    w.write_all(b"RIFF")?;
    w.write_all(&(36 + data_size).to_le_bytes())?;
    w.write_all(b"WAVE")
}

fn write_fmt_chunk(
    w: &mut impl Write,
    num_channels: u16,
    sample_rate: u32,
    block_align: u16,
    bits_per_sample: u16,
) -> std::io::Result<()> {
    w.write_all(b"fmt ")?;
    w.write_all(&16u32.to_le_bytes())?;
    w.write_all(&1u16.to_le_bytes())?;
    w.write_all(&num_channels.to_le_bytes())?;
    w.write_all(&sample_rate.to_le_bytes())?;
    w.write_all(&(sample_rate * block_align as u32).to_le_bytes())?;
    w.write_all(&block_align.to_le_bytes())?;
    w.write_all(&bits_per_sample.to_le_bytes())
}

//! CPAL-based device sink.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig};
use ringbuf::traits::Consumer;
use ringbuf::HeapCons;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tact_ir::{AudioBuffer, SoundConfig};

use crate::ring::RingSink;
use crate::traits::{AudioError, AudioSink, OutputLine};

/// Ticks of audio buffered between the scheduler and the device callback.
const RING_TICKS: usize = 4;

/// Plays tick output on a soundcard through a [`RingSink`].
pub struct CpalSink {
    ring: RingSink,
    config: SoundConfig,
    stream: Option<Stream>,
    running: Arc<AtomicBool>,
}

impl CpalSink {
    /// Open the default output device.
    pub fn new(config: &SoundConfig) -> Result<Self, AudioError> {
        let host = cpal::default_host();
        let device = host.default_output_device().ok_or(AudioError::NoDevice)?;
        Self::with_device(device, config)
    }

    fn with_device(device: Device, config: &SoundConfig) -> Result<Self, AudioError> {
        let (ring, consumer) = RingSink::new(config, RING_TICKS);
        let running = Arc::new(AtomicBool::new(true));
        let stream = build_stream(&device, config, consumer, running.clone())?;
        log::info!(
            "opened output device {:?}",
            device.name().unwrap_or_default()
        );
        Ok(Self {
            ring,
            config: *config,
            stream: Some(stream),
            running,
        })
    }

    pub fn pause(&mut self) -> Result<(), AudioError> {
        self.running.store(false, Ordering::Relaxed);
        if let Some(ref stream) = self.stream {
            stream.pause().map_err(|e| AudioError::Playback(e.to_string()))?;
        }
        Ok(())
    }
}

fn build_stream(
    device: &Device,
    config: &SoundConfig,
    mut consumer: HeapCons<f32>,
    running: Arc<AtomicBool>,
) -> Result<Stream, AudioError> {
    let stream_config = StreamConfig {
        channels: config.pcm_channels,
        sample_rate: cpal::SampleRate(config.samplerate),
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                if !running.load(Ordering::Relaxed) {
                    data.fill(0.0);
                    return;
                }
                for sample in data.iter_mut() {
                    *sample = consumer.try_pop().unwrap_or(0.0);
                }
            },
            |err| log::error!("audio stream error: {err}"),
            None,
        )
        .map_err(|e| AudioError::StreamCreate(e.to_string()))?;

    stream.play().map_err(|e| AudioError::Playback(e.to_string()))?;
    Ok(stream)
}

impl AudioSink for CpalSink {
    fn write(&mut self, line: OutputLine, buffer: &AudioBuffer) -> Result<(), AudioError> {
        self.ring.write(line, buffer)
    }

    fn flush(&mut self) -> Result<(), AudioError> {
        self.ring.flush()
    }

    fn set_device(&mut self, name: &str) -> Result<(), AudioError> {
        let host = cpal::default_host();
        let device = host
            .output_devices()
            .map_err(|e| AudioError::DeviceInit(e.to_string()))?
            .find(|d| d.name().is_ok_and(|n| n == name))
            .ok_or_else(|| AudioError::UnknownDevice(name.to_string()))?;

        // drop the old stream before the new one claims the device
        self.stream = None;
        let config = self.config;
        *self = Self::with_device(device, &config)?;
        Ok(())
    }
}

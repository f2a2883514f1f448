//! Sink trait and error types.

use tact_ir::{AudioBuffer, ChannelKey};
use thiserror::Error;

/// Error type for sink operations.
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("device init error: {0}")]
    DeviceInit(String),

    #[error("stream create error: {0}")]
    StreamCreate(String),

    #[error("playback error: {0}")]
    Playback(String),

    #[error("no audio device available")]
    NoDevice,

    #[error("no output device named {0:?}")]
    UnknownDevice(String),
}

/// Terminal output channel a buffer was produced on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutputLine {
    pub channel: ChannelKey,
    /// Audio channel within the pad, used to pick the device channel.
    pub audio_channel: u16,
}

/// Receiver of the buffers produced by each tick.
///
/// Device sinks may hold thread-bound streams, so a sink lives on the
/// thread that created it.
pub trait AudioSink {
    /// Accept the buffer of one output channel for the current tick.
    fn write(&mut self, line: OutputLine, buffer: &AudioBuffer) -> Result<(), AudioError>;

    /// Called once after every output of a tick has been written.
    fn flush(&mut self) -> Result<(), AudioError> {
        Ok(())
    }

    /// Switch to another output device. Sinks without devices ignore it.
    fn set_device(&mut self, name: &str) -> Result<(), AudioError> {
        log::debug!("sink has no devices, ignoring {name:?}");
        Ok(())
    }
}

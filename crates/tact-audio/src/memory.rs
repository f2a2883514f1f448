//! Sink that keeps every written block in memory.

use tact_ir::AudioBuffer;

use crate::traits::{AudioError, AudioSink, OutputLine};

/// One buffer captured by a [`MemorySink`].
#[derive(Clone, Debug)]
pub struct WrittenBlock {
    pub tick: usize,
    pub line: OutputLine,
    pub buffer: AudioBuffer,
}

/// Collects written buffers, grouped by the flush that closed their tick.
///
/// Used for offline rendering and by tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    blocks: Vec<WrittenBlock>,
    ticks: usize,
    device: Option<String>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blocks(&self) -> &[WrittenBlock] {
        &self.blocks
    }

    /// Blocks written during tick `tick`.
    pub fn tick_blocks(&self, tick: usize) -> impl Iterator<Item = &WrittenBlock> {
        self.blocks.iter().filter(move |b| b.tick == tick)
    }

    /// Number of completed (flushed) ticks.
    pub fn ticks(&self) -> usize {
        self.ticks
    }

    /// Last device requested through [`AudioSink::set_device`].
    pub fn device(&self) -> Option<&str> {
        self.device.as_deref()
    }

    pub fn take_blocks(&mut self) -> Vec<WrittenBlock> {
        std::mem::take(&mut self.blocks)
    }
}

impl AudioSink for MemorySink {
    fn write(&mut self, line: OutputLine, buffer: &AudioBuffer) -> Result<(), AudioError> {
        self.blocks.push(WrittenBlock {
            tick: self.ticks,
            line,
            buffer: buffer.clone(),
        });
        Ok(())
    }

    fn flush(&mut self) -> Result<(), AudioError> {
        self.ticks += 1;
        Ok(())
    }

    fn set_device(&mut self, name: &str) -> Result<(), AudioError> {
        self.device = Some(name.to_string());
        Ok(())
    }
}

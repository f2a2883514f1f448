//! Per-recycling sample buffers.

use parking_lot::{Mutex, MutexGuard};
use slotmap::SecondaryMap;
use tact_ir::{AudioBuffer, RecyclingKey, SoundConfig};

/// One buffer per recycling, each behind its own lock.
///
/// Chains running on different threads may meet at a shared output
/// channel, so writers lock the buffer for the duration of one write and
/// never hold two buffers at once.
#[derive(Default)]
pub struct BufferPool {
    buffers: SecondaryMap<RecyclingKey, Mutex<AudioBuffer>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a silent mono buffer sized by `config` for `recycling`.
    pub fn allocate(&mut self, recycling: RecyclingKey, config: &SoundConfig) {
        self.buffers.insert(
            recycling,
            Mutex::new(AudioBuffer::new(1, config.buffer_size, config.format)),
        );
    }

    pub fn remove(&mut self, recycling: RecyclingKey) {
        self.buffers.remove(recycling);
    }

    pub fn lock(&self, recycling: RecyclingKey) -> Option<MutexGuard<'_, AudioBuffer>> {
        self.buffers.get(recycling).map(Mutex::lock)
    }

    /// Clear every buffer before a tick starts.
    pub fn silence_all(&self) {
        for buffer in self.buffers.values() {
            buffer.lock().silence();
        }
    }

    /// Resize every buffer after a configuration change.
    pub fn reconfigure(&mut self, config: &SoundConfig) {
        for buffer in self.buffers.values_mut() {
            let buffer = buffer.get_mut();
            let channels = buffer.channels();
            buffer.reallocate(channels, config.buffer_size, config.format);
        }
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

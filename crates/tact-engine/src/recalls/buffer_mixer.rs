//! Mixes the walked chain's source into downstream channels.

use tact_ir::{AudioBuffer, Port, PortValue, Ports};

use crate::recall::{Recall, RecallContext, RecallError, RecallInfo};

static INFO: RecallInfo = RecallInfo {
    name: "buffer-mixer",
    version: "1.0.0",
    build_id: "builtin",
    dependencies: &[],
};

/// Adds the source recycling's buffer to the target buffer during the
/// inter stage.
///
/// The source is copied into a scratch buffer first, so at most one
/// buffer lock is held at a time.
pub struct BufferMixer {
    scratch: AudioBuffer,
}

impl BufferMixer {
    pub fn new() -> Self {
        Self {
            scratch: AudioBuffer::new(1, 0, Default::default()),
        }
    }

    fn mix(&mut self, ctx: &mut RecallContext<'_>) -> Result<(), RecallError> {
        if ctx.target_recycling() == Some(ctx.source_recycling()) {
            return Ok(());
        }
        let gain = ctx.ports.f32_or("gain", 1.0);
        if !ctx.copy_source(&mut self.scratch) {
            return Err(RecallError::transient("source recycling has no buffer"));
        }
        if let Some(mut target) = ctx.target_buffer() {
            target.mix_from_scaled(&self.scratch, gain);
        }
        Ok(())
    }
}

impl Default for BufferMixer {
    fn default() -> Self {
        Self::new()
    }
}

impl Recall for BufferMixer {
    fn info(&self) -> &'static RecallInfo {
        &INFO
    }

    fn ports(&self) -> Ports {
        Ports::new(vec![Port::new("gain", PortValue::Float(1.0))])
    }

    fn duplicate(&self) -> Box<dyn Recall> {
        Box::new(BufferMixer::new())
    }

    fn run_init_inter(&mut self, ctx: &mut RecallContext<'_>) -> Result<(), RecallError> {
        self.mix(ctx)
    }

    fn run_inter(&mut self, ctx: &mut RecallContext<'_>) -> Result<(), RecallError> {
        self.mix(ctx)
    }
}

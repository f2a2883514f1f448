//! Sine generator.

use tact_ir::{Port, PortValue, Ports};

use crate::recall::{Recall, RecallContext, RecallError, RecallInfo};

static INFO: RecallInfo = RecallInfo {
    name: "tone",
    version: "1.0.0",
    build_id: "builtin",
    dependencies: &[],
};

/// Adds a sine wave to the target buffer during the inter stage.
pub struct Tone {
    phase: f32,
}

impl Tone {
    pub fn new() -> Self {
        Self { phase: 0.0 }
    }

    fn render(&mut self, ctx: &mut RecallContext<'_>) -> Result<(), RecallError> {
        let freq = ctx.ports.f32_or("freq", 440.0);
        let amplitude = ctx.ports.f32_or("amplitude", 0.5);
        let samplerate = ctx.config.samplerate as f32;
        if !(freq > 0.0 && freq < samplerate / 2.0) {
            return Err(RecallError::transient(format!("frequency {freq} Hz out of range")));
        }

        let increment = freq / samplerate;
        let mut buffer = ctx
            .target_buffer()
            .ok_or_else(|| RecallError::transient("no target buffer"))?;
        let mut end = self.phase;
        for ch in 0..buffer.channels() {
            let mut phase = self.phase;
            for sample in buffer.channel_mut(ch) {
                *sample += amplitude * libm::sinf(phase * core::f32::consts::TAU);
                phase = (phase + increment).fract();
            }
            end = phase;
        }
        self.phase = end;
        Ok(())
    }
}

impl Default for Tone {
    fn default() -> Self {
        Self::new()
    }
}

impl Recall for Tone {
    fn info(&self) -> &'static RecallInfo {
        &INFO
    }

    fn ports(&self) -> Ports {
        Ports::new(vec![
            Port::new("freq", PortValue::Float(440.0)),
            Port::new("amplitude", PortValue::Float(0.5)),
        ])
    }

    fn duplicate(&self) -> Box<dyn Recall> {
        Box::new(Tone::new())
    }

    fn run_init_inter(&mut self, ctx: &mut RecallContext<'_>) -> Result<(), RecallError> {
        self.render(ctx)
    }

    fn run_inter(&mut self, ctx: &mut RecallContext<'_>) -> Result<(), RecallError> {
        self.render(ctx)
    }
}

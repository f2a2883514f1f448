//! Gain stage.

use tact_ir::{Port, PortValue, Ports};

use crate::recall::{Recall, RecallContext, RecallError, RecallInfo};

static INFO: RecallInfo = RecallInfo {
    name: "volume",
    version: "1.0.0",
    build_id: "builtin",
    dependencies: &[],
};

/// Scales the target buffer by the `gain` port in the post stage.
pub struct Volume;

impl Volume {
    fn apply(ctx: &mut RecallContext<'_>) -> Result<(), RecallError> {
        let gain = ctx.ports.f32_or("gain", 1.0);
        if let Some(mut buffer) = ctx.target_buffer() {
            buffer.apply_gain(gain);
        }
        Ok(())
    }
}

impl Recall for Volume {
    fn info(&self) -> &'static RecallInfo {
        &INFO
    }

    fn ports(&self) -> Ports {
        Ports::new(vec![Port::new("gain", PortValue::Float(1.0))])
    }

    fn duplicate(&self) -> Box<dyn Recall> {
        Box::new(Volume)
    }

    fn run_init_post(&mut self, ctx: &mut RecallContext<'_>) -> Result<(), RecallError> {
        Self::apply(ctx)
    }

    fn run_post(&mut self, ctx: &mut RecallContext<'_>) -> Result<(), RecallError> {
        Self::apply(ctx)
    }
}

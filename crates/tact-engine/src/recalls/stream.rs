//! Tick counter that finishes its playback after a fixed length.

use tact_ir::{Port, PortValue, Ports};

use crate::recall::{Recall, RecallContext, RecallError, RecallInfo};

static INFO: RecallInfo = RecallInfo {
    name: "stream",
    version: "1.0.0",
    build_id: "builtin",
    dependencies: &[],
};

/// Advances `position` once per tick and completes itself when it
/// reaches `length`.
pub struct Stream;

impl Stream {
    fn advance(ctx: &mut RecallContext<'_>) -> Result<(), RecallError> {
        let length = match ctx.ports.get("length") {
            Some(PortValue::UInt(length)) => length,
            _ => return Err(RecallError::transient("length port missing")),
        };
        let position = match ctx.ports.get("position") {
            Some(PortValue::UInt(position)) => position + 1,
            _ => 1,
        };
        ctx.ports.set("position", PortValue::UInt(position));
        if position >= length {
            ctx.request_done();
        }
        Ok(())
    }
}

impl Recall for Stream {
    fn info(&self) -> &'static RecallInfo {
        &INFO
    }

    fn ports(&self) -> Ports {
        Ports::new(vec![
            Port::new("length", PortValue::UInt(16)),
            Port::new("position", PortValue::UInt(0)),
        ])
    }

    fn duplicate(&self) -> Box<dyn Recall> {
        Box::new(Stream)
    }

    fn run_init_post(&mut self, ctx: &mut RecallContext<'_>) -> Result<(), RecallError> {
        Self::advance(ctx)
    }

    fn run_post(&mut self, ctx: &mut RecallContext<'_>) -> Result<(), RecallError> {
        Self::advance(ctx)
    }
}

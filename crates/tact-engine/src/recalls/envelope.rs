//! Linear fade-out following a sibling stream.

use tact_ir::PortValue;

use crate::recall::{Recall, RecallContext, RecallError, RecallInfo, ResolvedDependency};
use crate::recall_unit::RecallState;

static INFO: RecallInfo = RecallInfo {
    name: "envelope",
    version: "1.0.0",
    build_id: "builtin",
    dependencies: &["stream"],
};

/// Scales the target buffer by `1 - position / length` of the stream
/// bound for the same recall id, and finishes with it.
pub struct Envelope;

impl Envelope {
    fn apply(ctx: &mut RecallContext<'_>) -> Result<(), RecallError> {
        if ctx.dependency_state("stream").is_some_and(RecallState::is_finished) {
            ctx.request_done();
            return Ok(());
        }
        let (Some(position), Some(PortValue::UInt(length))) = (
            ctx.dependency_port("stream", "position"),
            ctx.dependency_port("stream", "length"),
        ) else {
            return Err(RecallError::MissingDependency { name: "stream" });
        };
        if length == 0 {
            return Err(RecallError::transient("stream length is zero"));
        }
        let gain = (1.0 - position.as_f64() / length as f64).clamp(0.0, 1.0) as f32;
        if let Some(mut buffer) = ctx.target_buffer() {
            buffer.apply_gain(gain);
        }
        Ok(())
    }
}

impl Recall for Envelope {
    fn info(&self) -> &'static RecallInfo {
        &INFO
    }

    fn duplicate(&self) -> Box<dyn Recall> {
        Box::new(Envelope)
    }

    fn resolve_dependencies(&mut self, deps: &[ResolvedDependency]) -> Result<(), RecallError> {
        match deps.iter().find(|d| d.name == "stream") {
            Some(dep) if dep.unit.port_value("length").is_some() => Ok(()),
            _ => Err(RecallError::MissingDependency { name: "stream" }),
        }
    }

    fn run_init_post(&mut self, ctx: &mut RecallContext<'_>) -> Result<(), RecallError> {
        Self::apply(ctx)
    }

    fn run_post(&mut self, ctx: &mut RecallContext<'_>) -> Result<(), RecallError> {
        Self::apply(ctx)
    }
}

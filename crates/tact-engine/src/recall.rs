//! The recall protocol: lifecycle callbacks every processing unit
//! implements, and the context they run in.

use parking_lot::MutexGuard;
use tact_ir::{
    AudioBuffer, AudioKey, ChainStep, ChannelKey, Graph, PortValue, Ports, RecallId,
    RecyclingKey, SoundConfig,
};
use thiserror::Error;

use crate::buffers::BufferPool;
use crate::dispatch::Stage;
use crate::recall_unit::{RecallHandle, RecallState};

/// Static metadata shared by every instance of a recall.
#[derive(Debug)]
pub struct RecallInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub build_id: &'static str,
    /// Names of sibling recalls that must exist for the same recall id.
    pub dependencies: &'static [&'static str],
}

/// Errors raised by recall callbacks.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecallError {
    /// Processing failed for this tick only; the unit keeps running.
    #[error("{0}")]
    Transient(String),

    #[error("missing dependency {name:?}")]
    MissingDependency { name: &'static str },
}

impl RecallError {
    pub fn transient(msg: impl Into<String>) -> Self {
        RecallError::Transient(msg.into())
    }
}

/// Node a recall list hangs off.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Attachment {
    Channel(ChannelKey),
    Audio(AudioKey),
}

/// A sibling instance bound during dependency resolution.
#[derive(Clone)]
pub struct ResolvedDependency {
    pub name: &'static str,
    pub unit: RecallHandle,
}

/// A unit of signal processing attached to a channel or audio.
///
/// Callbacks must not block; a unit waiting on I/O polls a flag set by
/// its own loader thread. Every callback defaults to a no-op.
pub trait Recall: Send {
    fn info(&self) -> &'static RecallInfo;

    /// Control port descriptors with their default values.
    fn ports(&self) -> Ports {
        Ports::default()
    }

    /// Fresh body for a new instance. Per-instance processing state is
    /// not carried over.
    fn duplicate(&self) -> Box<dyn Recall>;

    /// Inspect the siblings bound for [`RecallInfo::dependencies`].
    fn resolve_dependencies(&mut self, _deps: &[ResolvedDependency]) -> Result<(), RecallError> {
        Ok(())
    }

    fn run_init_pre(&mut self, _ctx: &mut RecallContext<'_>) -> Result<(), RecallError> {
        Ok(())
    }

    fn run_init_inter(&mut self, _ctx: &mut RecallContext<'_>) -> Result<(), RecallError> {
        Ok(())
    }

    fn run_init_post(&mut self, _ctx: &mut RecallContext<'_>) -> Result<(), RecallError> {
        Ok(())
    }

    fn run_pre(&mut self, _ctx: &mut RecallContext<'_>) -> Result<(), RecallError> {
        Ok(())
    }

    fn run_inter(&mut self, _ctx: &mut RecallContext<'_>) -> Result<(), RecallError> {
        Ok(())
    }

    fn run_post(&mut self, _ctx: &mut RecallContext<'_>) -> Result<(), RecallError> {
        Ok(())
    }

    fn done(&mut self) {}

    fn cancel(&mut self) {}
}

/// What a callback asked for once it returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Request {
    Done,
    StopPersistent,
    Cancel,
}

impl Request {
    /// The stronger of two requests: cancel, then stop, then done.
    pub(crate) fn merge(self, other: Request) -> Request {
        match (self, other) {
            (Request::Cancel, _) | (_, Request::Cancel) => Request::Cancel,
            (Request::StopPersistent, _) | (_, Request::StopPersistent) => Request::StopPersistent,
            _ => Request::Done,
        }
    }
}

/// Everything a callback may read or write during one dispatch.
pub struct RecallContext<'a> {
    pub graph: &'a Graph,
    pub config: &'a SoundConfig,
    pub recall_id: &'a RecallId,
    pub attached: Attachment,
    /// Chain step being walked.
    pub step: ChainStep,
    pub tick: u64,
    pub stage: Stage,
    pub ports: &'a mut Ports,
    pub(crate) buffers: &'a BufferPool,
    pub(crate) dependencies: &'a [ResolvedDependency],
    pub(crate) request: Option<Request>,
}

impl RecallContext<'_> {
    /// Recycling the unit writes into: the first recycling of its channel,
    /// or of the step's output channel for audio-level units.
    pub fn target_recycling(&self) -> Option<RecyclingKey> {
        let channel = match self.attached {
            Attachment::Channel(channel) => channel,
            Attachment::Audio(_) => self.step.output.unwrap_or(self.step.channel),
        };
        self.graph.channel(channel)?.first_recycling()
    }

    /// Recycling whose chain is being walked.
    pub fn source_recycling(&self) -> RecyclingKey {
        self.recall_id.recycling
    }

    /// Lock and borrow the target buffer.
    pub fn target_buffer(&self) -> Option<MutexGuard<'_, AudioBuffer>> {
        self.buffers.lock(self.target_recycling()?)
    }

    /// Copy the source buffer into `scratch`. Returns `false` when the
    /// source has no buffer.
    pub fn copy_source(&self, scratch: &mut AudioBuffer) -> bool {
        match self.buffers.lock(self.source_recycling()) {
            Some(source) => {
                if scratch.channels() != source.channels() || scratch.frames() != source.frames() {
                    scratch.reallocate(source.channels(), source.frames(), source.format());
                }
                scratch.copy_from(&source);
                true
            }
            None => false,
        }
    }

    /// Port value of a resolved dependency.
    pub fn dependency_port(&self, name: &str, port: &str) -> Option<PortValue> {
        self.dependency(name)?.port_value(port)
    }

    /// Lifecycle state of a resolved dependency.
    pub fn dependency_state(&self, name: &str) -> Option<RecallState> {
        Some(self.dependency(name)?.state())
    }

    /// Finish this unit once the callback returns.
    pub fn request_done(&mut self) {
        self.request.get_or_insert(Request::Done);
    }

    /// Cancel this unit once the callback returns.
    pub fn request_cancel(&mut self) {
        self.request = Some(Request::Cancel);
    }

    fn dependency(&self, name: &str) -> Option<&RecallHandle> {
        self.dependencies.iter().find(|d| d.name == name).map(|d| &d.unit)
    }
}

//! Task queue applied between ticks.
//!
//! Graph mutations from outside the audio loop are queued as tasks and
//! launched by the session under the structural lock, before any
//! recycling thread starts the next iteration.

use crossbeam_channel::{Receiver, Sender, TrySendError};
use tact_ir::{AudioKey, ChannelKey, ChannelRole, SoundConfig};

use crate::context::EngineGraph;
use crate::error::{EngineError, Result};
use crate::recall::{Attachment, Recall};
use crate::recall_unit::{RecallHandle, RecallUnit};

/// What a task may touch while it runs.
pub struct TaskContext<'a> {
    pub graph: &'a mut EngineGraph,
    /// Device the sink should switch to before the next write.
    pub output_device: &'a mut Option<String>,
    /// Tick about to be run.
    pub tick: u64,
}

/// A one-shot mutation launched once, between two ticks.
pub trait Task: Send {
    fn name(&self) -> &'static str;
    fn launch(self: Box<Self>, ctx: &mut TaskContext<'_>) -> Result<()>;
}

/// A task launched before every tick until it is removed.
pub trait CyclicTask: Send {
    fn name(&self) -> &'static str;
    fn launch(&mut self, ctx: &mut TaskContext<'_>) -> Result<()>;
}

/// Cloneable handle for queueing tasks from any thread.
#[derive(Clone)]
pub struct TaskSender {
    sender: Sender<Vec<Box<dyn Task>>>,
}

impl TaskSender {
    /// Queue one task. Returns `false` if the task thread is gone.
    pub fn append_task(&self, task: impl Task + 'static) -> bool {
        self.send(vec![Box::new(task)])
    }

    /// Queue several tasks launched in order within the same tick boundary.
    pub fn append_tasks(&self, tasks: Vec<Box<dyn Task>>) -> bool {
        if tasks.is_empty() {
            return true;
        }
        self.send(tasks)
    }

    fn send(&self, batch: Vec<Box<dyn Task>>) -> bool {
        match self.sender.try_send(batch) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                log::warn!("task queue closed, dropping tasks");
                false
            }
        }
    }
}

/// Serialises queued tasks against the live graph.
pub struct TaskThread {
    sender: TaskSender,
    receiver: Receiver<Vec<Box<dyn Task>>>,
    cyclic: Vec<(u64, Box<dyn CyclicTask>)>,
    next_cyclic: u64,
}

impl TaskThread {
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self {
            sender: TaskSender { sender },
            receiver,
            cyclic: Vec::new(),
            next_cyclic: 1,
        }
    }

    pub fn sender(&self) -> TaskSender {
        self.sender.clone()
    }

    pub fn append_task(&self, task: impl Task + 'static) -> bool {
        self.sender.append_task(task)
    }

    pub fn append_tasks(&self, tasks: Vec<Box<dyn Task>>) -> bool {
        self.sender.append_tasks(tasks)
    }

    /// Register a task launched before every tick. Returns its id.
    pub fn append_cyclic_task(&mut self, task: impl CyclicTask + 'static) -> u64 {
        let id = self.next_cyclic;
        self.next_cyclic += 1;
        self.cyclic.push((id, Box::new(task)));
        id
    }

    pub fn remove_cyclic_task(&mut self, id: u64) -> bool {
        let before = self.cyclic.len();
        self.cyclic.retain(|(i, _)| *i != id);
        self.cyclic.len() != before
    }

    /// Number of one-shot batches waiting.
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }

    /// Launch every queued task, then every cyclic task.
    ///
    /// A failing task is logged and its error returned; the tasks after
    /// it still run.
    pub fn launch_pending(&mut self, ctx: &mut TaskContext<'_>) -> Vec<EngineError> {
        let mut errors = Vec::new();
        for batch in self.receiver.try_iter() {
            for task in batch {
                let name = task.name();
                log::debug!("launching task {name} before tick {}", ctx.tick);
                if let Err(err) = task.launch(ctx) {
                    log::warn!("task {name} failed: {err}");
                    errors.push(err);
                }
            }
        }
        for (_, task) in &mut self.cyclic {
            if let Err(err) = task.launch(ctx) {
                log::warn!("cyclic task {} failed: {err}", task.name());
                errors.push(err);
            }
        }
        errors
    }
}

impl Default for TaskThread {
    fn default() -> Self {
        Self::new()
    }
}

/// Ask the sink to switch to another output device.
pub struct SetOutputDevice(pub String);

impl Task for SetOutputDevice {
    fn name(&self) -> &'static str {
        "set-output-device"
    }

    fn launch(self: Box<Self>, ctx: &mut TaskContext<'_>) -> Result<()> {
        log::info!("output device set to {:?}", self.0);
        *ctx.output_device = Some(self.0);
        Ok(())
    }
}

/// Validate and apply a new sound configuration. Buffers are resized;
/// the new thread model takes effect on the same tick.
pub struct ApplySoundConfig(pub SoundConfig);

impl Task for ApplySoundConfig {
    fn name(&self) -> &'static str {
        "apply-sound-config"
    }

    fn launch(self: Box<Self>, ctx: &mut TaskContext<'_>) -> Result<()> {
        self.0.validate()?;
        ctx.graph.reconfigure(self.0);
        log::info!(
            "sound config applied: {} Hz, {} frames, {} channels",
            self.0.samplerate,
            self.0.buffer_size,
            self.0.pcm_channels
        );
        Ok(())
    }
}

/// Attach a recall as a play/recall template pair.
pub struct AddRecall {
    attached: Attachment,
    body: Box<dyn Recall>,
    play_only: bool,
    persistent: bool,
    parent: Option<RecallHandle>,
    container: Option<Sender<u64>>,
}

impl AddRecall {
    pub fn new(attached: Attachment, body: Box<dyn Recall>) -> Self {
        Self {
            attached,
            body,
            play_only: false,
            persistent: false,
            parent: None,
            container: None,
        }
    }

    /// Only attach the play-side template.
    pub fn play_only(mut self) -> Self {
        self.play_only = true;
        self
    }

    /// Instances ignore `done` until stopped or cancelled.
    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    /// Add the templates as children of `parent`; their instances join
    /// the parent's instance of the same recall id.
    pub fn child_of(mut self, parent: RecallHandle) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Report the container id of the added templates once launched.
    pub fn container(mut self, reply: Sender<u64>) -> Self {
        self.container = Some(reply);
        self
    }
}

impl Task for AddRecall {
    fn name(&self) -> &'static str {
        "add-recall"
    }

    fn launch(self: Box<Self>, ctx: &mut TaskContext<'_>) -> Result<()> {
        let AddRecall {
            attached,
            body,
            play_only,
            persistent,
            parent,
            container: reply,
        } = *self;
        let (play, recall) = if play_only {
            (RecallUnit::template(body), None)
        } else {
            let (play, recall) = RecallUnit::template_pair(body);
            (play, Some(recall))
        };
        for unit in std::iter::once(&play).chain(recall.as_ref()) {
            unit.set_persistent(persistent);
            if let Some(parent) = &parent {
                parent.add_child(unit.clone());
            }
        }
        let container = play.container();
        ctx.graph.add_recall(attached, Some(play), recall)?;
        if let Some(reply) = reply {
            let _ = reply.try_send(container);
        }
        Ok(())
    }
}

/// Remove both templates of a container and cancel their instances.
pub struct RemoveRecall {
    pub attached: Attachment,
    pub container: u64,
}

impl Task for RemoveRecall {
    fn name(&self) -> &'static str {
        "remove-recall"
    }

    fn launch(self: Box<Self>, ctx: &mut TaskContext<'_>) -> Result<()> {
        if ctx.graph.remove_container(self.attached, self.container) == 0 {
            return Err(EngineError::Task {
                name: "remove-recall",
                reason: format!("no recall in container {}", self.container),
            });
        }
        Ok(())
    }
}

/// Link an output to an input, or unlink it when `input` is `None`.
pub struct LinkChannel {
    pub output: ChannelKey,
    pub input: Option<ChannelKey>,
}

impl Task for LinkChannel {
    fn name(&self) -> &'static str {
        "link-channel"
    }

    fn launch(self: Box<Self>, ctx: &mut TaskContext<'_>) -> Result<()> {
        match self.input {
            Some(input) => ctx.graph.link(self.output, input)?,
            None => ctx.graph.unlink(self.output)?,
        }
        Ok(())
    }
}

/// Cancel a running instance.
pub struct CancelRecall {
    pub unit: RecallHandle,
}

impl Task for CancelRecall {
    fn name(&self) -> &'static str {
        "cancel-recall"
    }

    fn launch(self: Box<Self>, _ctx: &mut TaskContext<'_>) -> Result<()> {
        self.unit.cancel();
        Ok(())
    }
}

/// Change the pad count of one side of an audio.
pub struct ResizeChannels {
    pub audio: AudioKey,
    pub role: ChannelRole,
    pub pads: u16,
}

impl Task for ResizeChannels {
    fn name(&self) -> &'static str {
        "resize-channels"
    }

    fn launch(self: Box<Self>, ctx: &mut TaskContext<'_>) -> Result<()> {
        let resized = ctx.graph.resize(self.audio, self.role, self.pads)?;
        log::debug!(
            "resized {:?} pads: {} channels added, {} removed",
            self.role,
            resized.added_channels.len(),
            resized.removed.channels.len()
        );
        Ok(())
    }
}

/// Ad-hoc task from a closure.
pub struct FnTask<F> {
    name: &'static str,
    f: F,
}

impl<F> FnTask<F>
where
    F: FnOnce(&mut TaskContext<'_>) -> Result<()> + Send,
{
    pub fn new(name: &'static str, f: F) -> Self {
        Self { name, f }
    }
}

impl<F> Task for FnTask<F>
where
    F: FnOnce(&mut TaskContext<'_>) -> Result<()> + Send,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn launch(self: Box<Self>, ctx: &mut TaskContext<'_>) -> Result<()> {
        (self.f)(ctx)
    }
}

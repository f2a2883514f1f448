//! Shared fixtures for the scheduler integration tests.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tact_engine::{
    create_recall, Attachment, EngineGraph, Recall, RecallContext, RecallError, RecallHandle,
    RecallInfo, RecallUnit, Stage,
};
use tact_ir::{AudioKey, AudioMode, ChannelKey, ChannelRole, SoundConfig};

/// One callback observed by a [`Recorder`].
#[derive(Clone, Debug)]
pub struct Event {
    pub label: &'static str,
    pub tick: u64,
    pub stage: Stage,
    pub init: bool,
    pub at: Instant,
}

pub type Events = Arc<Mutex<Vec<Event>>>;

static RECORDER: RecallInfo = RecallInfo {
    name: "recorder",
    version: "1.0.0",
    build_id: "test",
    dependencies: &[],
};

/// Records every callback; can fail or stall on demand.
#[derive(Clone)]
pub struct Recorder {
    pub label: &'static str,
    pub events: Events,
    /// Fail every run callback with a transient error.
    pub fail: bool,
    /// Sleep this long in `run_inter` of the given tick.
    pub stall: Option<(u64, Duration)>,
}

impl Recorder {
    pub fn new(label: &'static str, events: &Events) -> Self {
        Self {
            label,
            events: events.clone(),
            fail: false,
            stall: None,
        }
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn stalling(mut self, tick: u64, duration: Duration) -> Self {
        self.stall = Some((tick, duration));
        self
    }

    pub fn template(self) -> RecallHandle {
        RecallUnit::template(Box::new(self))
    }

    fn record(&self, ctx: &RecallContext<'_>, init: bool) -> Result<(), RecallError> {
        if let Some((tick, duration)) = self.stall {
            if ctx.tick == tick && ctx.stage == Stage::Inter && !init {
                std::thread::sleep(duration);
            }
        }
        self.events.lock().push(Event {
            label: self.label,
            tick: ctx.tick,
            stage: ctx.stage,
            init,
            at: Instant::now(),
        });
        if self.fail && !init {
            return Err(RecallError::transient(format!("{} failed", self.label)));
        }
        Ok(())
    }
}

impl Recall for Recorder {
    fn info(&self) -> &'static RecallInfo {
        &RECORDER
    }
    fn duplicate(&self) -> Box<dyn Recall> {
        Box::new(self.clone())
    }
    fn run_init_pre(&mut self, ctx: &mut RecallContext<'_>) -> Result<(), RecallError> {
        self.record(ctx, true)
    }
    fn run_init_inter(&mut self, ctx: &mut RecallContext<'_>) -> Result<(), RecallError> {
        self.record(ctx, true)
    }
    fn run_init_post(&mut self, ctx: &mut RecallContext<'_>) -> Result<(), RecallError> {
        self.record(ctx, true)
    }
    fn run_pre(&mut self, ctx: &mut RecallContext<'_>) -> Result<(), RecallError> {
        self.record(ctx, false)
    }
    fn run_inter(&mut self, ctx: &mut RecallContext<'_>) -> Result<(), RecallError> {
        self.record(ctx, false)
    }
    fn run_post(&mut self, ctx: &mut RecallContext<'_>) -> Result<(), RecallError> {
        self.record(ctx, false)
    }
}

pub fn events_of(events: &Events, label: &str) -> Vec<Event> {
    events.lock().iter().filter(|e| e.label == label).cloned().collect()
}

pub fn builtin(name: &str) -> RecallHandle {
    RecallUnit::template(create_recall(name).unwrap())
}

pub fn config(buffer_size: u32) -> SoundConfig {
    SoundConfig {
        buffer_size,
        ..SoundConfig::default()
    }
}

/// An audio with `pads` input and output pads; inputs feed the outputs
/// of the same pad.
pub struct Machine {
    pub audio: AudioKey,
    pub inputs: Vec<ChannelKey>,
    pub outputs: Vec<ChannelKey>,
}

pub fn machine(g: &mut EngineGraph, name: &str, pads: u16) -> Machine {
    machine_in(g, name, AudioMode::Sync, pads)
}

pub fn machine_in(g: &mut EngineGraph, name: &str, mode: AudioMode, pads: u16) -> Machine {
    let audio = g.add_audio(name, mode, 1);
    let outputs = g.resize(audio, ChannelRole::Output, pads).unwrap().added_channels;
    let inputs = g.resize(audio, ChannelRole::Input, pads).unwrap().added_channels;
    Machine {
        audio,
        inputs,
        outputs,
    }
}

pub fn attach(g: &mut EngineGraph, channel: ChannelKey, template: RecallHandle) {
    g.add_recall(Attachment::Channel(channel), Some(template), None)
        .unwrap();
}

//! Orchestrator: task launch, per-tick barrier and output delivery.

use crossbeam_utils::sync::WaitGroup;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tact_audio::{AudioSink, OutputLine};
use tact_ir::{
    AudioKey, GraphError, RecallId, SoundConfig, SoundScope, SuperThreadedScope, ThreadModel,
    Timeline, Timestamp,
};

use crate::context::{EngineContext, EngineGraph};
use crate::dispatch::run_iteration;
use crate::error::{EngineError, Result};
use crate::playback::{ScopeThread, ThreadHandle};
use crate::recall_unit::RecallHandle;
use crate::recycling_thread::RecyclingThread;
use crate::report::{TickReport, WalkReport};
use crate::task::{TaskContext, TaskThread};

/// A playback scope started on one audio.
struct ActiveScope {
    audio: AudioKey,
    scope: SoundScope,
    recall_ids: Vec<Arc<RecallId>>,
    /// Template ids already duplicated, per recall id.
    seen: HashMap<u64, HashSet<u64>>,
    workers: Vec<Arc<RecyclingThread>>,
}

impl ActiveScope {
    fn stop_workers(&mut self) {
        for worker in self.workers.drain(..) {
            worker.stop();
        }
    }

    fn started_any(&self) -> bool {
        self.seen.values().any(|templates| !templates.is_empty())
    }
}

/// Runs the tick loop over every started playback scope.
///
/// One `Session` is driven by one thread, which calls [`Session::tick`]
/// at the soundcard cadence. Everything else talks to it through the
/// task queue.
pub struct Session {
    context: Arc<EngineContext>,
    tasks: TaskThread,
    tick: u64,
    active: Vec<ActiveScope>,
    generation: u64,
    threading: (ThreadModel, SuperThreadedScope),
    aborted: bool,
    pending_errors: Vec<EngineError>,
    markers: Timeline,
}

impl Session {
    pub fn new(config: SoundConfig) -> Result<Self> {
        config.validate()?;
        log::info!(
            "session: {} Hz, {} frames, {} channels, {:?}/{:?}",
            config.samplerate,
            config.buffer_size,
            config.pcm_channels,
            config.thread_model,
            config.super_threaded_scope
        );
        Ok(Self {
            context: EngineContext::new(config),
            tasks: TaskThread::new(),
            tick: 0,
            active: Vec::new(),
            generation: 0,
            threading: (config.thread_model, config.super_threaded_scope),
            aborted: false,
            pending_errors: Vec::new(),
            markers: Timeline::new(),
        })
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.context
    }

    pub fn tasks(&self) -> &TaskThread {
        &self.tasks
    }

    pub fn tasks_mut(&mut self) -> &mut TaskThread {
        &mut self.tasks
    }

    /// Edit the graph directly. Only for setup before the first tick or
    /// from the thread that drives the session.
    pub fn edit<R>(&self, f: impl FnOnce(&mut EngineGraph) -> R) -> R {
        f(&mut self.context.graph_mut())
    }

    pub fn config(&self) -> SoundConfig {
        self.context.config()
    }

    /// Index of the next tick to run.
    pub fn current_tick(&self) -> u64 {
        self.tick
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Frame offset of the next tick.
    pub fn position(&self) -> Timestamp {
        Timestamp::from_tick(self.tick, self.config().buffer_size)
    }

    /// Record the current position on the session timeline.
    pub fn mark(&mut self) -> Option<usize> {
        self.markers.insert(self.position())
    }

    pub fn markers(&self) -> &Timeline {
        &self.markers
    }

    /// Start `scope` on `audio`: one recall id per input channel (per
    /// output channel for audios without inputs), instantiated along its
    /// chain.
    ///
    /// Dependency failures are not fatal here; they show up in the
    /// report of the next tick.
    pub fn start_playback(&mut self, audio: AudioKey, scope: SoundScope) -> Result<Vec<Arc<RecallId>>> {
        if self.aborted {
            return Err(EngineError::SessionAborted);
        }
        self.stop_playback(audio, scope);

        let mut active = ActiveScope {
            audio,
            scope,
            recall_ids: Vec::new(),
            seen: HashMap::new(),
            workers: Vec::new(),
        };
        {
            let graph = self.context.graph();
            let node = graph.graph().audio(audio).ok_or(GraphError::UnknownAudio)?;
            let channels = if node.input.is_empty() {
                node.output.clone()
            } else {
                node.input.clone()
            };
            for channel in channels {
                let Some(recycling) = graph.graph().channel(channel).and_then(|c| c.first_recycling())
                else {
                    continue;
                };
                let recall_id = Arc::new(RecallId::new(self.context.next_recall_id(), scope, recycling));
                if let Some(playback) = graph.playback(channel) {
                    playback.set_recall_id(scope.index(), Some(recall_id.clone()));
                }
                let seen = active.seen.entry(recall_id.id).or_default();
                let created = graph.instantiate(&recall_id, seen)?;
                self.pending_errors.extend(graph.resolve(&recall_id, &created));
                active.recall_ids.push(recall_id);
            }
            self.generation = graph.generation();
        }
        log::info!(
            "started {scope:?} on audio {audio:?} with {} recall ids",
            active.recall_ids.len()
        );

        active.workers = self.spawn_workers(&active)?;
        let recall_ids = active.recall_ids.clone();
        self.active.push(active);
        Ok(recall_ids)
    }

    /// Stop `scope` on `audio`, cancelling its instances. Returns whether
    /// the scope was running.
    pub fn stop_playback(&mut self, audio: AudioKey, scope: SoundScope) -> bool {
        let Some(pos) = self.active.iter().position(|a| a.audio == audio && a.scope == scope) else {
            return false;
        };
        let mut active = self.active.remove(pos);
        self.release(&mut active);
        for recall_id in &active.recall_ids {
            self.context.graph().cancel_instances(recall_id.id);
        }
        log::info!("stopped {scope:?} on audio {audio:?}");
        true
    }

    /// Instances currently attached for `recall_id`.
    pub fn instances(&self, recall_id: u64) -> Vec<RecallHandle> {
        self.context.graph().instances(recall_id)
    }

    /// Whether `scope` is still running on `audio`.
    pub fn is_playing(&self, audio: AudioKey, scope: SoundScope) -> bool {
        self.active.iter().any(|a| a.audio == audio && a.scope == scope)
    }

    /// Worker threads of every running scope.
    pub fn workers(&self) -> Vec<Arc<RecyclingThread>> {
        self.active.iter().flat_map(|a| a.workers.iter().cloned()).collect()
    }

    /// Run one tick and hand the terminal outputs to `sink`.
    ///
    /// Returns an error only for structural failures, which abort the
    /// session; every later call returns [`EngineError::SessionAborted`].
    pub fn tick(&mut self, sink: &mut dyn AudioSink) -> Result<TickReport> {
        if self.aborted {
            return Err(EngineError::SessionAborted);
        }
        let started = Instant::now();
        let tick = self.tick;
        let mut report = TickReport {
            tick,
            errors: std::mem::take(&mut self.pending_errors),
            ..TickReport::default()
        };

        let device = self.launch_tasks(&mut report);
        if let Some(name) = device {
            if let Err(err) = sink.set_device(&name) {
                log::warn!("cannot switch output to {name:?}: {err}");
                report.errors.push(err.into());
            }
        }

        if let Err(err) = self.refresh(&mut report) {
            return Err(self.abort(err));
        }

        self.context.graph().buffers().silence_all();
        let walk = self.iterate(tick);
        report.failures = walk.failures;
        report.dispatched = walk.dispatched;
        if let Some(err) = walk.structural {
            return Err(self.abort(err));
        }

        report.outputs = self.deliver(sink, &mut report.errors);
        report.released = self.release_finished();

        self.tick += 1;
        report.elapsed = started.elapsed();
        let budget = self.config().tick_duration();
        if report.elapsed > budget {
            log::debug!("tick {tick} took {:?}, budget {budget:?}", report.elapsed);
        }
        Ok(report)
    }

    /// Stop every scope and tear the graph's bookkeeping down.
    pub fn shutdown(&mut self) {
        let mut active = std::mem::take(&mut self.active);
        for scope in &mut active {
            self.release(scope);
        }
        self.context.graph_mut().dispose();
        log::info!("session shut down after {} ticks", self.tick);
    }

    /// Launch queued tasks under the structural lock. Returns the output
    /// device a task asked for.
    fn launch_tasks(&mut self, report: &mut TickReport) -> Option<String> {
        let mut device = None;
        {
            let mut graph = self.context.graph_mut();
            let mut ctx = TaskContext {
                graph: &mut graph,
                output_device: &mut device,
                tick: self.tick,
            };
            report.errors.extend(self.tasks.launch_pending(&mut ctx));
        }
        if let Some(name) = &device {
            *self.context.output_device_slot().lock() = Some(name.clone());
        }
        device
    }

    /// Pick up graph changes made since the last tick: instantiate new
    /// templates along every running chain and follow a changed thread
    /// model.
    ///
    /// A recall id whose chain no longer resolves is a structural error.
    fn refresh(&mut self, report: &mut TickReport) -> std::result::Result<(), GraphError> {
        {
            let graph = self.context.graph();
            if graph.generation() != self.generation {
                for active in &mut self.active {
                    for recall_id in &active.recall_ids {
                        let seen = active.seen.entry(recall_id.id).or_default();
                        let created = graph.instantiate(recall_id, seen)?;
                        if !created.is_empty() {
                            log::debug!("{} new instances for recall id {}", created.len(), recall_id.id);
                        }
                        report.errors.extend(graph.resolve(recall_id, &created));
                    }
                }
                self.generation = graph.generation();
            }
        }

        let config = self.config();
        let threading = (config.thread_model, config.super_threaded_scope);
        if threading == self.threading {
            return Ok(());
        }
        log::info!("thread model changed to {:?}/{:?}", threading.0, threading.1);
        self.threading = threading;
        for index in 0..self.active.len() {
            self.active[index].stop_workers();
            match self.spawn_workers(&self.active[index]) {
                Ok(workers) => self.active[index].workers = workers,
                // the scope falls back to the inline walk
                Err(err) => {
                    log::error!("cannot spawn recycling threads: {err}");
                    report.errors.push(err);
                }
            }
        }
        Ok(())
    }

    /// Walk every running chain for `tick`, inline or on the workers.
    ///
    /// With workers, the call returns once every worker has released the
    /// tick's latch.
    fn iterate(&self, tick: u64) -> WalkReport {
        let mut inline: Vec<Arc<RecallId>> = Vec::new();
        let latch = WaitGroup::new();
        let mut posted = Vec::new();
        for active in &self.active {
            if active.workers.is_empty() {
                inline.extend(active.recall_ids.iter().cloned());
                continue;
            }
            for worker in &active.workers {
                if worker.start_iterate(tick, latch.clone()) {
                    posted.push(worker);
                }
            }
        }

        let mut report = if inline.is_empty() {
            WalkReport::default()
        } else {
            run_iteration(&self.context.graph(), &inline, tick)
        };
        latch.wait();
        for worker in posted {
            report.merge(worker.take_report());
        }
        report
    }

    /// Write every terminal output to the sink. Returns the number of
    /// buffers written.
    fn deliver(&self, sink: &mut dyn AudioSink, errors: &mut Vec<EngineError>) -> usize {
        let graph = self.context.graph();
        let mut outputs = 0;
        for (channel, audio_channel) in graph.terminal_outputs() {
            let Some(recycling) = graph.graph().channel(channel).and_then(|c| c.first_recycling())
            else {
                continue;
            };
            let Some(buffer) = graph.buffers().lock(recycling) else {
                continue;
            };
            match sink.write(OutputLine { channel, audio_channel }, &buffer) {
                Ok(()) => outputs += 1,
                Err(err) => {
                    log::warn!("sink rejected output of tick {}: {err}", self.tick);
                    errors.push(err.into());
                }
            }
        }
        if let Err(err) = sink.flush() {
            log::warn!("sink flush failed: {err}");
            errors.push(err.into());
        }
        outputs
    }

    /// Release scopes whose instances have all finished.
    fn release_finished(&mut self) -> Vec<(AudioKey, SoundScope)> {
        let finished: Vec<usize> = {
            let graph = self.context.graph();
            self.active
                .iter()
                .enumerate()
                .filter(|(_, a)| a.started_any() && a.recall_ids.iter().all(|id| graph.is_done(id.id)))
                .map(|(index, _)| index)
                .collect()
        };
        let mut released = Vec::with_capacity(finished.len());
        for index in finished.into_iter().rev() {
            let mut active = self.active.remove(index);
            self.release(&mut active);
            log::info!("{:?} on audio {:?} finished", active.scope, active.audio);
            released.push((active.audio, active.scope));
        }
        released.reverse();
        released
    }

    /// Stop a scope's threads and clear its playback slots.
    fn release(&self, active: &mut ActiveScope) {
        active.stop_workers();
        let graph = self.context.graph();
        let slot = active.scope.index();
        if let Some(domain) = graph.domain(active.audio) {
            domain.set_audio_thread(slot, None);
        }
        let channels = graph
            .graph()
            .audio(active.audio)
            .map(|a| a.input.iter().chain(&a.output).copied().collect::<Vec<_>>())
            .unwrap_or_default();
        for channel in channels {
            if let Some(playback) = graph.playback(channel) {
                playback.set_channel_thread(slot, None);
                playback.set_recall_id(slot, None);
            }
        }
    }

    fn spawn_workers(&self, active: &ActiveScope) -> Result<Vec<Arc<RecyclingThread>>> {
        if self.threading.0 != ThreadModel::SuperThreaded {
            return Ok(Vec::new());
        }
        let slot = active.scope.index();
        let mut workers = Vec::new();
        match self.threading.1 {
            SuperThreadedScope::None => {}
            SuperThreadedScope::Channel => {
                for recall_id in &active.recall_ids {
                    let worker = RecyclingThread::spawn(
                        format!("recycling-{}", recall_id.id),
                        &self.context,
                        vec![recall_id.clone()],
                    )?;
                    let graph = self.context.graph();
                    let channel = graph.graph().recycling(recall_id.recycling).map(|r| r.channel);
                    if let Some(playback) = channel.and_then(|c| graph.playback(c)) {
                        playback.set_channel_thread(slot, Some(worker.clone() as ThreadHandle));
                    }
                    workers.push(worker);
                }
            }
            SuperThreadedScope::Audio => {
                let worker = RecyclingThread::spawn(
                    format!("recycling-audio-{}", slot),
                    &self.context,
                    active.recall_ids.clone(),
                )?;
                if let Some(domain) = self.context.graph().domain(active.audio) {
                    domain.set_audio_thread(slot, Some(worker.clone() as ThreadHandle));
                }
                workers.push(worker);
            }
        }
        Ok(workers)
    }

    /// Stop everything after a structural error.
    fn abort(&mut self, err: GraphError) -> EngineError {
        log::error!("aborting session at tick {}: {err}", self.tick);
        self.aborted = true;
        let mut active = std::mem::take(&mut self.active);
        for scope in &mut active {
            self.release(scope);
        }
        EngineError::Structural(err)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let mut active = std::mem::take(&mut self.active);
        for scope in &mut active {
            self.release(scope);
        }
    }
}

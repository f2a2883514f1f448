//! Worker thread walking a set of recycling chains once per tick.

use crossbeam_utils::sync::WaitGroup;
use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use tact_ir::RecallId;

use crate::context::EngineContext;
use crate::dispatch::{run_iteration_with, Stage};
use crate::error::Result;
use crate::playback::ScopeThread;
use crate::report::WalkReport;

/// Where a recycling thread is within the current tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IterState {
    Idle,
    /// An iteration was requested and has not started a stage yet.
    Waiting,
    Stage(Stage),
    Done,
}

impl IterState {
    fn in_flight(self) -> bool {
        matches!(self, IterState::Waiting | IterState::Stage(_))
    }
}

struct Job {
    tick: u64,
    /// Released when the iteration finishes, or when the job is dropped
    /// unrun because the thread stopped.
    latch: WaitGroup,
}

struct ThreadState {
    iter: IterState,
    running: bool,
    entries: Vec<Arc<RecallId>>,
    job: Option<Job>,
    report: WalkReport,
}

struct Shared {
    name: String,
    state: Mutex<ThreadState>,
    /// Signalled when a job is posted or the thread is stopped.
    wakeup: Condvar,
    /// Signalled when an iteration completes or the thread exits.
    done: Condvar,
    /// Weak: the context's playbacks hold this thread.
    context: Weak<EngineContext>,
}

/// A dedicated OS thread for one chain (channel scope) or for all chains
/// of one audio (audio scope).
pub struct RecyclingThread {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RecyclingThread {
    /// Spawn a worker for `entries`.
    pub fn spawn(
        name: impl Into<String>,
        context: &Arc<EngineContext>,
        entries: Vec<Arc<RecallId>>,
    ) -> Result<Arc<Self>> {
        let name = name.into();
        let shared = Arc::new(Shared {
            name: name.clone(),
            state: Mutex::new(ThreadState {
                iter: IterState::Idle,
                running: true,
                entries,
                job: None,
                report: WalkReport::default(),
            }),
            wakeup: Condvar::new(),
            done: Condvar::new(),
            context: Arc::downgrade(context),
        });
        let worker = shared.clone();
        let handle = std::thread::Builder::new()
            .name(name)
            .spawn(move || worker_loop(&worker))?;
        Ok(Arc::new(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        }))
    }

    /// Post the iteration of `tick`.
    ///
    /// Blocks while the previous iteration is still in flight. Returns
    /// `false` without running when the thread has been stopped; the latch
    /// is released either way.
    pub fn start_iterate(&self, tick: u64, latch: WaitGroup) -> bool {
        let mut state = self.shared.state.lock();
        while state.running && state.iter.in_flight() {
            self.shared.done.wait(&mut state);
        }
        if !state.running {
            return false;
        }
        state.iter = IterState::Waiting;
        state.job = Some(Job { tick, latch });
        self.shared.wakeup.notify_one();
        true
    }

    /// Block until no iteration is in flight.
    pub fn wait_done(&self) {
        let mut state = self.shared.state.lock();
        while state.running && state.iter.in_flight() {
            self.shared.done.wait(&mut state);
        }
    }

    pub fn state(&self) -> IterState {
        self.shared.state.lock().iter
    }

    /// Replace the recall ids walked from the next iteration on.
    pub fn set_entries(&self, entries: Vec<Arc<RecallId>>) {
        self.shared.state.lock().entries = entries;
    }

    pub fn entries(&self) -> Vec<Arc<RecallId>> {
        self.shared.state.lock().entries.clone()
    }

    /// Report of the iterations finished since the last call.
    pub fn take_report(&self) -> WalkReport {
        std::mem::take(&mut self.shared.state.lock().report)
    }
}

fn worker_loop(shared: &Shared) {
    log::debug!("{} started", shared.name);
    loop {
        let (job, entries) = {
            let mut state = shared.state.lock();
            while state.running && state.job.is_none() {
                shared.wakeup.wait(&mut state);
            }
            if !state.running {
                break;
            }
            match state.job.take() {
                Some(job) => (job, state.entries.clone()),
                None => continue,
            }
        };

        let Some(context) = shared.context.upgrade() else {
            log::debug!("{}: engine context gone", shared.name);
            break;
        };
        let report = {
            let graph = context.graph();
            run_iteration_with(&graph, &entries, job.tick, |stage| {
                shared.state.lock().iter = IterState::Stage(stage);
            })
        };
        drop(context);

        {
            let mut state = shared.state.lock();
            state.iter = IterState::Done;
            state.report.merge(report);
            shared.done.notify_all();
        }
        drop(job.latch);
    }

    let mut state = shared.state.lock();
    state.running = false;
    state.iter = IterState::Idle;
    state.job = None;
    shared.done.notify_all();
    log::debug!("{} stopped", shared.name);
}

impl ScopeThread for RecyclingThread {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            state.running = false;
            // an unstarted job must not hold the barrier
            state.job = None;
            self.shared.wakeup.notify_all();
            self.shared.done.notify_all();
        }
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }
}

impl Drop for RecyclingThread {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recall::Attachment;
    use crate::recall_unit::{RecallState, RecallUnit};
    use crate::recalls::create_recall;
    use std::collections::HashSet;
    use tact_ir::{AudioMode, ChannelRole, SoundConfig, SoundScope};

    fn context_with_tone() -> (Arc<EngineContext>, Arc<RecallId>) {
        let context = EngineContext::new(SoundConfig::default());
        let recall_id = {
            let mut graph = context.graph_mut();
            let audio = graph.add_audio("synth", AudioMode::Async, 1);
            graph.resize(audio, ChannelRole::Output, 1).unwrap();
            let input = graph.resize(audio, ChannelRole::Input, 1).unwrap();
            let tone = RecallUnit::template(create_recall("tone").unwrap());
            graph
                .add_recall(Attachment::Channel(input.added_channels[0]), Some(tone), None)
                .unwrap();
            let recall_id = Arc::new(RecallId::new(1, SoundScope::Playback, input.added_recyclings[0]));
            graph.instantiate(&recall_id, &mut HashSet::new()).unwrap();
            recall_id
        };
        (context, recall_id)
    }

    #[test]
    fn iteration_runs_and_releases_latch() {
        let (context, recall_id) = context_with_tone();
        let thread = RecyclingThread::spawn("recycling-test", &context, vec![recall_id.clone()]).unwrap();

        for tick in 0..3 {
            let latch = WaitGroup::new();
            assert!(thread.start_iterate(tick, latch.clone()));
            latch.wait();
            assert_eq!(thread.state(), IterState::Done);
        }
        let report = thread.take_report();
        assert!(report.failures.is_empty());
        assert!(report.dispatched >= 9);

        let instances = context.graph().instances(recall_id.id);
        assert_eq!(instances[0].state(), RecallState::Running);
        thread.stop();
    }

    #[test]
    fn worker_does_not_keep_the_context_alive() {
        let (context, recall_id) = context_with_tone();
        let thread = RecyclingThread::spawn("recycling-test", &context, vec![recall_id]).unwrap();
        let weak = Arc::downgrade(&context);
        drop(context);
        assert!(weak.upgrade().is_none());

        // the job finds no context; the latch is still released
        let latch = WaitGroup::new();
        if thread.start_iterate(0, latch.clone()) {
            latch.wait();
        }
        thread.stop();
        assert!(!thread.is_running());
    }

    #[test]
    fn stop_is_idempotent_and_refuses_new_work() {
        let (context, recall_id) = context_with_tone();
        let thread = RecyclingThread::spawn("recycling-test", &context, vec![recall_id]).unwrap();
        thread.stop();
        thread.stop();
        assert!(!thread.is_running());

        let latch = WaitGroup::new();
        assert!(!thread.start_iterate(0, latch.clone()));
        // returns at once: the refused job dropped its latch clone
        latch.wait();
        thread.wait_done();
    }
}

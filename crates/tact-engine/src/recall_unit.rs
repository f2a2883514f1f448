//! Recall unit lifecycle: templates, duplication per recall id, staged
//! dispatch and completion.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;
use tact_ir::{ChainStep, Graph, PortValue, Ports, RecallId, SoundConfig};

use crate::buffers::BufferPool;
use crate::dispatch::Stage;
use crate::recall::{Attachment, Recall, RecallContext, RecallError, RecallInfo, Request, ResolvedDependency};

/// Shared handle of a recall unit.
pub type RecallHandle = Arc<RecallUnit>;

pub(crate) type UnitList = Mutex<Vec<RecallHandle>>;

static NEXT_UNIT_ID: AtomicU64 = AtomicU64::new(1);

fn next_unit_id() -> u64 {
    NEXT_UNIT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Lifecycle state of a recall unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecallState {
    /// Never run; duplicated per recall id.
    Template,
    Instantiated,
    InitPre,
    InitInter,
    Running,
    Done,
    Cancelled,
    /// Dependencies could not be resolved.
    Failed,
}

impl RecallState {
    pub fn is_finished(self) -> bool {
        matches!(self, RecallState::Done | RecallState::Cancelled | RecallState::Failed)
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct Flags {
    run_initialized: bool,
    initial_run: bool,
    persistent: bool,
    propagate_done: bool,
}

struct Inner {
    state: RecallState,
    flags: Flags,
    ports: Ports,
    body: Box<dyn Recall>,
    dependencies: Vec<ResolvedDependency>,
    resolution: Option<Result<(), RecallError>>,
}

/// Thread running the unit's callback, and what it asked for through the
/// unit's own handle meanwhile.
#[derive(Default)]
struct Reentry {
    thread: Option<ThreadId>,
    deferred: Option<Request>,
}

/// Graph data a dispatch runs against.
#[derive(Clone, Copy)]
pub struct DispatchEnv<'a> {
    pub graph: &'a Graph,
    pub buffers: &'a BufferPool,
    pub config: &'a SoundConfig,
    pub attached: Attachment,
    pub step: ChainStep,
    pub tick: u64,
}

/// A recall body with its ports, lifecycle state and list membership.
///
/// Lock order: a unit's state lock is taken before the lock of the list
/// that holds it, never the other way round. The parent and children
/// locks are never held while taking another lock.
///
/// Units form a tree: a parent owns its children, a child refers back
/// weakly. Cancelling a parent cancels its children; a parent flagged
/// with [`Self::set_propagate_done`] is done once its last child leaves.
pub struct RecallUnit {
    id: u64,
    info: &'static RecallInfo,
    /// Shared by the play and recall templates added together and by all
    /// their instances.
    container: u64,
    is_template: bool,
    template: Option<Weak<RecallUnit>>,
    recall_id: Option<Arc<RecallId>>,
    inner: Mutex<Inner>,
    owner: Mutex<Option<Weak<UnitList>>>,
    parent: Mutex<Option<Weak<RecallUnit>>>,
    children: Mutex<Vec<RecallHandle>>,
    reentry: Mutex<Reentry>,
}

impl RecallUnit {
    /// Create a template in its own container.
    pub fn template(body: Box<dyn Recall>) -> RecallHandle {
        Self::template_in(next_unit_id(), body)
    }

    /// Create a play template and a recall template sharing one container.
    pub fn template_pair(body: Box<dyn Recall>) -> (RecallHandle, RecallHandle) {
        let container = next_unit_id();
        let recall = body.duplicate();
        (Self::template_in(container, body), Self::template_in(container, recall))
    }

    fn template_in(container: u64, body: Box<dyn Recall>) -> RecallHandle {
        let ports = body.ports();
        Arc::new(RecallUnit {
            id: next_unit_id(),
            info: body.info(),
            container,
            is_template: true,
            template: None,
            recall_id: None,
            inner: Mutex::new(Inner {
                state: RecallState::Template,
                flags: Flags::default(),
                ports,
                body,
                dependencies: Vec::new(),
                resolution: None,
            }),
            owner: Mutex::new(None),
            parent: Mutex::new(None),
            children: Mutex::new(Vec::new()),
            reentry: Mutex::new(Reentry::default()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn info(&self) -> &'static RecallInfo {
        self.info
    }

    pub fn name(&self) -> &'static str {
        self.info.name
    }

    pub fn container(&self) -> u64 {
        self.container
    }

    pub fn is_template(&self) -> bool {
        self.is_template
    }

    /// Template this instance was duplicated from, while it is alive.
    pub fn template_unit(&self) -> Option<RecallHandle> {
        self.template.as_ref()?.upgrade()
    }

    /// Whether this instance was duplicated from `template`.
    pub fn is_instance_of(&self, template: &RecallUnit) -> bool {
        self.template
            .as_ref()
            .is_some_and(|t| std::ptr::eq(t.as_ptr(), template))
    }

    pub fn recall_id(&self) -> Option<&Arc<RecallId>> {
        self.recall_id.as_ref()
    }

    pub fn state(&self) -> RecallState {
        self.inner.lock().state
    }

    pub fn is_persistent(&self) -> bool {
        self.inner.lock().flags.persistent
    }

    /// Keep the unit alive across `done` until [`Self::stop_persistent`].
    /// Instances inherit the flag from their template.
    pub fn set_persistent(&self, persistent: bool) {
        self.inner.lock().flags.persistent = persistent;
    }

    pub fn propagates_done(&self) -> bool {
        self.inner.lock().flags.propagate_done
    }

    /// Finish the unit once its last child is removed. Instances inherit
    /// the flag from their template and from their parent.
    pub fn set_propagate_done(&self, propagate: bool) {
        self.inner.lock().flags.propagate_done = propagate;
    }

    /// Set by `run_init_post` and cleared by the first `run_post`.
    pub fn is_initial_run(&self) -> bool {
        self.inner.lock().flags.initial_run
    }

    pub fn port_value(&self, name: &str) -> Option<PortValue> {
        self.inner.lock().ports.get(name)
    }

    pub fn set_port(&self, name: &str, value: PortValue) -> bool {
        self.inner.lock().ports.set(name, value)
    }

    /// Create an instance bound to `recall_id`.
    ///
    /// Ports are deep-copied so instances mutate their values
    /// independently; the static info is shared.
    pub fn duplicate(self: &Arc<Self>, recall_id: Arc<RecallId>) -> RecallHandle {
        let inner = self.inner.lock();
        let unit = Arc::new(RecallUnit {
            id: next_unit_id(),
            info: self.info,
            container: self.container,
            is_template: false,
            template: Some(Arc::downgrade(self)),
            recall_id: Some(recall_id),
            inner: Mutex::new(Inner {
                state: RecallState::Instantiated,
                flags: Flags {
                    persistent: inner.flags.persistent,
                    propagate_done: inner.flags.propagate_done,
                    ..Flags::default()
                },
                ports: inner.ports.clone(),
                body: inner.body.duplicate(),
                dependencies: Vec::new(),
                resolution: None,
            }),
            owner: Mutex::new(None),
            parent: Mutex::new(None),
            children: Mutex::new(Vec::new()),
            reentry: Mutex::new(Reentry::default()),
        });
        log::debug!("duplicated {} #{} as #{}", self.info.name, self.id, unit.id);
        unit
    }

    /// Bind the dependencies named in the unit's info to instances among
    /// `siblings` that share its recall id.
    ///
    /// Runs once per instance; later calls return the first outcome
    /// without binding again. On failure the unit moves to `Failed` and
    /// leaves its list.
    pub fn resolve_dependencies(&self, siblings: &[RecallHandle]) -> Result<(), RecallError> {
        if self.is_template {
            return Ok(());
        }
        let Some(recall_id) = self.recall_id.as_ref() else {
            return Ok(());
        };

        let mut inner = self.inner.lock();
        if let Some(resolution) = &inner.resolution {
            return resolution.clone();
        }

        let mut resolved = Vec::with_capacity(self.info.dependencies.len());
        let mut result = Ok(());
        for &name in self.info.dependencies {
            let found = siblings.iter().find(|s| {
                s.id != self.id
                    && !s.is_template
                    && s.info.name == name
                    && s.recall_id.as_ref().is_some_and(|r| r.id == recall_id.id)
            });
            match found {
                Some(unit) => resolved.push(ResolvedDependency {
                    name,
                    unit: unit.clone(),
                }),
                None => {
                    result = Err(RecallError::MissingDependency { name });
                    break;
                }
            }
        }
        if result.is_ok() {
            result = inner.body.resolve_dependencies(&resolved);
        }

        inner.resolution = Some(result.clone());
        match result {
            Ok(()) => {
                inner.dependencies = resolved;
                Ok(())
            }
            Err(err) => {
                inner.state = RecallState::Failed;
                drop(inner);
                self.remove();
                Err(err)
            }
        }
    }

    /// Run the callback of `stage`.
    ///
    /// An instance that has not finished its init stages receives the init
    /// variant. A transient error still advances the lifecycle, so the
    /// unit behaves as a no-op for this stage.
    pub fn dispatch(&self, stage: Stage, env: &DispatchEnv<'_>) -> Result<(), RecallError> {
        if self.is_template {
            log::warn!("running on template {} #{}", self.info.name, self.id);
            return Ok(());
        }
        let Some(recall_id) = self.recall_id.as_deref() else {
            return Ok(());
        };

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let init = !inner.flags.run_initialized;
        let expected = match stage {
            Stage::Pre => RecallState::Instantiated,
            Stage::Inter => RecallState::InitPre,
            Stage::Post => RecallState::InitInter,
        };
        if inner.state.is_finished() || (init && inner.state != expected) {
            return Ok(());
        }

        let mut ctx = RecallContext {
            graph: env.graph,
            config: env.config,
            recall_id,
            attached: env.attached,
            step: env.step,
            tick: env.tick,
            stage,
            ports: &mut inner.ports,
            buffers: env.buffers,
            dependencies: &inner.dependencies,
            request: None,
        };
        let body = &mut inner.body;
        self.reentry.lock().thread = Some(std::thread::current().id());
        let result = match (init, stage) {
            (true, Stage::Pre) => body.run_init_pre(&mut ctx),
            (true, Stage::Inter) => body.run_init_inter(&mut ctx),
            (true, Stage::Post) => body.run_init_post(&mut ctx),
            (false, Stage::Pre) => body.run_pre(&mut ctx),
            (false, Stage::Inter) => body.run_inter(&mut ctx),
            (false, Stage::Post) => body.run_post(&mut ctx),
        };
        let deferred = std::mem::take(&mut *self.reentry.lock()).deferred;
        let request = match (ctx.request, deferred) {
            (Some(a), Some(b)) => Some(a.merge(b)),
            (a, b) => a.or(b),
        };

        match (init, stage) {
            (true, Stage::Pre) => inner.state = RecallState::InitPre,
            (true, Stage::Inter) => inner.state = RecallState::InitInter,
            (true, Stage::Post) => {
                inner.state = RecallState::Running;
                inner.flags.run_initialized = true;
                inner.flags.initial_run = true;
            }
            (false, Stage::Post) => inner.flags.initial_run = false,
            (false, _) => {}
        }

        drop(guard);
        match request {
            Some(Request::Done) => self.done(),
            Some(Request::StopPersistent) => self.stop_persistent(),
            Some(Request::Cancel) => self.cancel(),
            None => {}
        }
        result
    }

    /// Complete the unit and detach it from its list before returning.
    ///
    /// Ignored on templates, on persistent units and on finished units.
    /// Called from the unit's own callback, it takes effect once the
    /// callback returns, like [`RecallContext::request_done`].
    pub fn done(&self) {
        if self.is_template || self.defer(Request::Done) {
            return;
        }
        let finished = Self::complete(&mut self.inner.lock());
        if finished {
            self.remove();
        }
    }

    /// Cancel the unit and its children, and detach it before returning.
    ///
    /// Idempotent. A persistent unit goes through [`Self::stop_persistent`]
    /// after its cancel hook and ends `Done`; any other unit ends
    /// `Cancelled`. Called from the unit's own callback, it takes effect
    /// once the callback returns.
    pub fn cancel(&self) {
        if self.is_template || self.defer(Request::Cancel) {
            return;
        }
        let finished = {
            let mut inner = self.inner.lock();
            if inner.state.is_finished() {
                false
            } else {
                inner.body.cancel();
                if inner.flags.persistent {
                    Self::stop_persistent_locked(&mut inner)
                } else {
                    inner.state = RecallState::Cancelled;
                    true
                }
            }
        };
        for child in self.children() {
            child.cancel();
        }
        if finished {
            self.remove();
        }
    }

    /// Clear the persistent flag and complete the unit.
    pub fn stop_persistent(&self) {
        if self.is_template || self.defer(Request::StopPersistent) {
            return;
        }
        let finished = Self::stop_persistent_locked(&mut self.inner.lock());
        if finished {
            self.remove();
        }
    }

    fn stop_persistent_locked(inner: &mut Inner) -> bool {
        inner.flags.persistent = false;
        Self::complete(inner)
    }

    /// Run the done hook and move to `Done`. Returns whether the state
    /// changed.
    fn complete(inner: &mut Inner) -> bool {
        if inner.state.is_finished() || inner.flags.persistent {
            return false;
        }
        inner.body.done();
        inner.state = RecallState::Done;
        true
    }

    /// Record `request` when the calling thread is inside this unit's
    /// callback, where the state lock is already held.
    fn defer(&self, request: Request) -> bool {
        let mut reentry = self.reentry.lock();
        if reentry.thread != Some(std::thread::current().id()) {
            return false;
        }
        reentry.deferred = Some(match reentry.deferred {
            Some(queued) => queued.merge(request),
            None => request,
        });
        true
    }

    pub fn parent(&self) -> Option<RecallHandle> {
        self.parent.lock().as_ref()?.upgrade()
    }

    pub fn children(&self) -> Vec<RecallHandle> {
        self.children.lock().clone()
    }

    /// Make `child` a child of this unit, moving it from its previous
    /// parent. The child inherits the persistent and propagate-done flags.
    ///
    /// Refused when `child` is this unit or one of its ancestors.
    pub fn add_child(self: &Arc<Self>, child: RecallHandle) {
        if child.parent().is_some_and(|p| Arc::ptr_eq(&p, self)) {
            return;
        }
        let mut ancestor = Some(self.clone());
        while let Some(unit) = ancestor {
            if unit.id == child.id {
                log::warn!("{} #{} cannot be its own descendant", child.name(), child.id);
                return;
            }
            ancestor = unit.parent();
        }

        let old = child.parent.lock().take().and_then(|w| w.upgrade());
        if let Some(old) = old {
            old.children.lock().retain(|c| c.id != child.id);
        }
        let flags = self.inner.lock().flags;
        {
            let mut inner = child.inner.lock();
            inner.flags.persistent |= flags.persistent;
            inner.flags.propagate_done |= flags.propagate_done;
        }
        *child.parent.lock() = Some(Arc::downgrade(self));
        log::debug!("{} #{} adopted {} #{}", self.name(), self.id, child.name(), child.id);
        self.children.lock().push(child);
    }

    /// Drop `child` from this unit's children without finishing either.
    pub fn remove_child(&self, child: &RecallUnit) -> bool {
        let removed = {
            let mut children = self.children.lock();
            let before = children.len();
            children.retain(|c| c.id != child.id);
            children.len() != before
        };
        if removed {
            let mut parent = child.parent.lock();
            if parent.as_ref().is_some_and(|w| std::ptr::eq(w.as_ptr(), self)) {
                *parent = None;
            }
        }
        removed
    }

    pub(crate) fn attach(&self, list: Weak<UnitList>) {
        *self.owner.lock() = Some(list);
    }

    pub(crate) fn clear_owner(&self, list: &Arc<UnitList>) {
        let mut owner = self.owner.lock();
        if owner.as_ref().is_some_and(|w| std::ptr::eq(w.as_ptr(), Arc::as_ptr(list))) {
            *owner = None;
        }
    }

    /// Remove this unit from the list holding it.
    fn detach(&self) {
        let list = self.owner.lock().take().and_then(|w| w.upgrade());
        if let Some(list) = list {
            list.lock().retain(|unit| unit.id != self.id);
            log::debug!("{} #{} detached", self.info.name, self.id);
        }
    }

    /// Detach a finished unit and leave its parent, completing the parent
    /// when it propagates done and this was its last child.
    fn remove(&self) {
        self.detach();
        let parent = self.parent.lock().take().and_then(|w| w.upgrade());
        let Some(parent) = parent else {
            return;
        };
        let last = {
            let mut children = parent.children.lock();
            children.retain(|c| c.id != self.id);
            children.is_empty()
        };
        if last && parent.propagates_done() {
            log::debug!("{} #{} done with its last child", parent.name(), parent.id);
            parent.done();
        }
    }
}

impl std::fmt::Debug for RecallUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecallUnit")
            .field("id", &self.id)
            .field("name", &self.info.name)
            .field("template", &self.is_template)
            .field("recall_id", &self.recall_id.as_ref().map(|r| r.id))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recall_list::RecallList;
    use tact_ir::{AudioMode, ChannelRole, Port, SoundScope};

    static RECORDER: RecallInfo = RecallInfo {
        name: "recorder",
        version: "1.0.0",
        build_id: "test",
        dependencies: &[],
    };

    static NEEDS_SOURCE: RecallInfo = RecallInfo {
        name: "needs-source",
        version: "1.0.0",
        build_id: "test",
        dependencies: &["source"],
    };

    struct Recorder {
        info: &'static RecallInfo,
        calls: Arc<Mutex<Vec<&'static str>>>,
        finish_on_post: bool,
    }

    impl Recorder {
        fn new(calls: &Arc<Mutex<Vec<&'static str>>>) -> Box<Self> {
            Box::new(Recorder {
                info: &RECORDER,
                calls: calls.clone(),
                finish_on_post: false,
            })
        }

        fn log(&self, name: &'static str) {
            self.calls.lock().push(name);
        }
    }

    impl Recall for Recorder {
        fn info(&self) -> &'static RecallInfo {
            self.info
        }
        fn ports(&self) -> Ports {
            Ports::new(vec![Port::new("gain", PortValue::Float(1.0))])
        }
        fn duplicate(&self) -> Box<dyn Recall> {
            Box::new(Recorder {
                info: self.info,
                calls: self.calls.clone(),
                finish_on_post: self.finish_on_post,
            })
        }
        fn run_init_pre(&mut self, _: &mut RecallContext<'_>) -> Result<(), RecallError> {
            self.log("init_pre");
            Ok(())
        }
        fn run_init_inter(&mut self, _: &mut RecallContext<'_>) -> Result<(), RecallError> {
            self.log("init_inter");
            Ok(())
        }
        fn run_init_post(&mut self, _: &mut RecallContext<'_>) -> Result<(), RecallError> {
            self.log("init_post");
            Ok(())
        }
        fn run_pre(&mut self, _: &mut RecallContext<'_>) -> Result<(), RecallError> {
            self.log("pre");
            Err(RecallError::transient("glitch"))
        }
        fn run_post(&mut self, ctx: &mut RecallContext<'_>) -> Result<(), RecallError> {
            self.log("post");
            if self.finish_on_post {
                ctx.request_done();
            }
            Ok(())
        }
        fn done(&mut self) {
            self.log("done");
        }
        fn cancel(&mut self) {
            self.log("cancel");
        }
    }

    struct Fixture {
        graph: Graph,
        buffers: BufferPool,
        config: SoundConfig,
        step: ChainStep,
        recall_id: Arc<RecallId>,
    }

    fn fixture() -> Fixture {
        let mut graph = Graph::new();
        let audio = graph.add_audio("a", AudioMode::Async, 1);
        let resized = graph.resize(audio, ChannelRole::Input, 1).unwrap();
        let channel = resized.added_channels[0];
        Fixture {
            recall_id: Arc::new(RecallId::new(1, SoundScope::Playback, resized.added_recyclings[0])),
            graph,
            buffers: BufferPool::new(),
            config: SoundConfig::default(),
            step: ChainStep {
                channel,
                audio,
                output: None,
            },
        }
    }

    impl Fixture {
        fn env(&self) -> DispatchEnv<'_> {
            DispatchEnv {
                graph: &self.graph,
                buffers: &self.buffers,
                config: &self.config,
                attached: Attachment::Audio(self.step.audio),
                step: self.step,
                tick: 0,
            }
        }

        fn tick(&self, unit: &RecallUnit) -> Vec<Result<(), RecallError>> {
            let env = self.env();
            Stage::ALL.iter().map(|&s| unit.dispatch(s, &env)).collect()
        }
    }

    #[test]
    fn init_variants_then_run_variants() {
        let f = fixture();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let template = RecallUnit::template(Recorder::new(&calls));
        let unit = template.duplicate(f.recall_id.clone());
        assert_eq!(unit.state(), RecallState::Instantiated);

        f.tick(&unit);
        assert_eq!(unit.state(), RecallState::Running);
        assert!(unit.is_initial_run());

        let results = f.tick(&unit);
        assert!(matches!(results[0], Err(RecallError::Transient(_))));
        assert!(!unit.is_initial_run());
        assert_eq!(
            *calls.lock(),
            vec!["init_pre", "init_inter", "init_post", "pre", "post"]
        );
    }

    #[test]
    fn template_is_never_run() {
        let f = fixture();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let template = RecallUnit::template(Recorder::new(&calls));
        f.tick(&template);
        template.done();
        template.cancel();
        assert_eq!(template.state(), RecallState::Template);
        assert!(calls.lock().is_empty());
    }

    #[test]
    fn duplicates_have_independent_ports() {
        let f = fixture();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let template = RecallUnit::template(Recorder::new(&calls));
        let a = template.duplicate(f.recall_id.clone());
        let b = template.duplicate(Arc::new(RecallId::new(2, SoundScope::Sequencer, f.recall_id.recycling)));

        assert!(a.set_port("gain", PortValue::Float(0.25)));
        assert!(b.set_port("gain", PortValue::Float(0.75)));
        assert_eq!(a.port_value("gain"), Some(PortValue::Float(0.25)));
        assert_eq!(b.port_value("gain"), Some(PortValue::Float(0.75)));
        assert_eq!(template.port_value("gain"), Some(PortValue::Float(1.0)));
        assert!(a.is_instance_of(&template));
        assert!(Arc::ptr_eq(&a.template_unit().unwrap(), &template));
    }

    #[test]
    fn cancel_is_idempotent_and_detaches() {
        let f = fixture();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let list = RecallList::new();
        let unit = RecallUnit::template(Recorder::new(&calls)).duplicate(f.recall_id.clone());
        list.add(unit.clone());

        unit.cancel();
        unit.cancel();
        unit.done();
        assert_eq!(unit.state(), RecallState::Cancelled);
        assert!(list.is_empty());
        assert_eq!(*calls.lock(), vec!["cancel"]);
        assert!(f.tick(&unit).iter().all(Result::is_ok));
    }

    #[test]
    fn done_requested_from_callback_detaches_before_return() {
        let f = fixture();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut body = Recorder::new(&calls);
        body.finish_on_post = true;
        let list = RecallList::new();
        let unit = RecallUnit::template(body).duplicate(f.recall_id.clone());
        list.add(unit.clone());

        f.tick(&unit);
        f.tick(&unit);
        assert_eq!(unit.state(), RecallState::Done);
        assert!(list.is_empty());
    }

    #[test]
    fn persistent_ignores_done_until_stopped() {
        let f = fixture();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let template = RecallUnit::template(Recorder::new(&calls));
        template.set_persistent(true);
        let unit = template.duplicate(f.recall_id.clone());
        assert!(unit.is_persistent());

        unit.done();
        assert_eq!(unit.state(), RecallState::Instantiated);
        unit.stop_persistent();
        assert_eq!(unit.state(), RecallState::Done);
        assert_eq!(*calls.lock(), vec!["done"]);
    }

    #[test]
    fn missing_dependency_fails_instance() {
        let f = fixture();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut body = Recorder::new(&calls);
        body.info = &NEEDS_SOURCE;
        let list = RecallList::new();
        let unit = RecallUnit::template(body).duplicate(f.recall_id.clone());
        list.add(unit.clone());

        let err = unit.resolve_dependencies(&[unit.clone()]).unwrap_err();
        assert_eq!(err, RecallError::MissingDependency { name: "source" });
        assert_eq!(unit.state(), RecallState::Failed);
        assert!(list.is_empty());
        f.tick(&unit);
        assert!(calls.lock().is_empty());
    }

    #[test]
    fn dependency_binds_sibling_with_same_recall_id() {
        let f = fixture();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut source = Recorder::new(&calls);
        source.info = &SOURCE;
        let mut dependent = Recorder::new(&calls);
        dependent.info = &NEEDS_SOURCE;

        let other_id = Arc::new(RecallId::new(9, SoundScope::Playback, f.recall_id.recycling));
        let foreign = RecallUnit::template(source.duplicate()).duplicate(other_id);
        let sibling = RecallUnit::template(source).duplicate(f.recall_id.clone());
        let dependent = RecallUnit::template(dependent);

        let lonely = dependent.duplicate(f.recall_id.clone());
        assert!(lonely.resolve_dependencies(&[foreign.clone()]).is_err());

        let unit = dependent.duplicate(f.recall_id.clone());
        assert!(unit.resolve_dependencies(&[foreign, sibling]).is_ok());
        assert!(unit.resolve_dependencies(&[]).is_ok());
        assert_eq!(unit.state(), RecallState::Instantiated);
    }

    #[test]
    fn persistent_cancel_runs_cancel_then_done() {
        let f = fixture();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let template = RecallUnit::template(Recorder::new(&calls));
        template.set_persistent(true);
        let list = RecallList::new();
        let unit = template.duplicate(f.recall_id.clone());
        list.add(unit.clone());

        unit.cancel();
        assert_eq!(unit.state(), RecallState::Done);
        assert!(!unit.is_persistent());
        assert!(list.is_empty());
        assert_eq!(*calls.lock(), vec!["cancel", "done"]);
    }

    fn family(f: &Fixture, calls: &Arc<Mutex<Vec<&'static str>>>) -> (RecallHandle, RecallHandle, RecallHandle) {
        let parent = RecallUnit::template(Recorder::new(calls)).duplicate(f.recall_id.clone());
        let a = RecallUnit::template(Recorder::new(calls)).duplicate(f.recall_id.clone());
        let b = RecallUnit::template(Recorder::new(calls)).duplicate(f.recall_id.clone());
        parent.add_child(a.clone());
        parent.add_child(b.clone());
        (parent, a, b)
    }

    #[test]
    fn cancel_reaches_every_child() {
        let f = fixture();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (parent, a, b) = family(&f, &calls);
        let list = RecallList::new();
        for unit in [&parent, &a, &b] {
            list.add(unit.clone());
        }

        parent.cancel();
        for unit in [&parent, &a, &b] {
            assert_eq!(unit.state(), RecallState::Cancelled);
        }
        assert!(list.is_empty());
        assert!(parent.children().is_empty());
        assert!(a.parent().is_none());
    }

    #[test]
    fn last_child_leaving_completes_a_propagating_parent() {
        let f = fixture();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (parent, a, b) = family(&f, &calls);
        parent.set_propagate_done(true);

        a.done();
        assert_eq!(parent.state(), RecallState::Instantiated);
        assert_eq!(parent.children().len(), 1);
        b.cancel();
        assert_eq!(parent.state(), RecallState::Done);
        assert_eq!(*calls.lock(), vec!["done", "cancel", "done"]);
    }

    #[test]
    fn parent_without_propagation_outlives_its_children() {
        let f = fixture();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (parent, a, b) = family(&f, &calls);
        a.done();
        b.done();
        assert!(parent.children().is_empty());
        assert_eq!(parent.state(), RecallState::Instantiated);
    }

    #[test]
    fn children_move_between_parents_and_cycles_are_refused() {
        let f = fixture();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (parent, a, _) = family(&f, &calls);
        let other = RecallUnit::template(Recorder::new(&calls)).duplicate(f.recall_id.clone());
        other.set_persistent(true);

        other.add_child(a.clone());
        assert!(Arc::ptr_eq(&a.parent().unwrap(), &other));
        assert_eq!(parent.children().len(), 1);
        assert!(a.is_persistent());

        a.add_child(other.clone());
        assert!(other.parent().is_none());
        a.add_child(a.clone());
        assert!(a.children().is_empty());

        assert!(other.remove_child(&a));
        assert!(!other.remove_child(&a));
        assert!(a.parent().is_none());
        assert_eq!(a.state(), RecallState::Instantiated);
    }

    static SELF_CANCEL: RecallInfo = RecallInfo {
        name: "self-cancel",
        version: "1.0.0",
        build_id: "test",
        dependencies: &[],
    };

    /// Cancels itself through its own handle from `run_inter`.
    struct SelfCancel {
        handle: Arc<Mutex<Option<Weak<RecallUnit>>>>,
    }

    impl Recall for SelfCancel {
        fn info(&self) -> &'static RecallInfo {
            &SELF_CANCEL
        }
        fn duplicate(&self) -> Box<dyn Recall> {
            Box::new(SelfCancel {
                handle: self.handle.clone(),
            })
        }
        fn run_inter(&mut self, _: &mut RecallContext<'_>) -> Result<(), RecallError> {
            let unit = self.handle.lock().as_ref().and_then(Weak::upgrade);
            if let Some(unit) = unit {
                unit.cancel();
                unit.done();
            }
            Ok(())
        }
    }

    #[test]
    fn cancel_from_own_callback_applies_after_return() {
        let f = fixture();
        let handle = Arc::new(Mutex::new(None));
        let template = RecallUnit::template(Box::new(SelfCancel { handle: handle.clone() }));
        let list = RecallList::new();
        let unit = template.duplicate(f.recall_id.clone());
        list.add(unit.clone());
        *handle.lock() = Some(Arc::downgrade(&unit));

        f.tick(&unit);
        assert_eq!(unit.state(), RecallState::Running);
        f.tick(&unit);
        assert_eq!(unit.state(), RecallState::Cancelled);
        assert!(list.is_empty());
    }

    static SOURCE: RecallInfo = RecallInfo {
        name: "source",
        version: "1.0.0",
        build_id: "test",
        dependencies: &[],
    };
}

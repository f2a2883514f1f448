//! Process-wide engine context: the audio graph with everything the
//! scheduler keeps per node, behind one structural lock.

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use slotmap::SecondaryMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tact_ir::{
    AudioKey, AudioMode, Chain, ChainSide, ChainStep, ChannelKey, ChannelRole, Graph, GraphError,
    RecallId, RecyclingKey, Removed, Resized, SoundConfig,
};

use crate::buffers::BufferPool;
use crate::error::EngineError;
use crate::playback::{Playback, PlaybackDomain};
use crate::recall::Attachment;
use crate::recall_list::RecallList;
use crate::recall_unit::RecallHandle;

/// Play-side and recall-side lists of one channel or audio.
#[derive(Clone, Debug, Default)]
pub struct NodeRecalls {
    pub play: RecallList,
    pub recall: RecallList,
}

impl NodeRecalls {
    pub fn side(&self, side: ChainSide) -> &RecallList {
        match side {
            ChainSide::Play => &self.play,
            ChainSide::Recall => &self.recall,
        }
    }

    fn lists(&self) -> [&RecallList; 2] {
        [&self.play, &self.recall]
    }
}

/// One list visit of a chain walk.
#[derive(Clone, Debug)]
pub struct ListVisit {
    pub attached: Attachment,
    pub step: ChainStep,
    pub list: RecallList,
}

/// The audio graph plus buffers, recall lists and playback bookkeeping.
///
/// Mutated only by the orchestrator between ticks; recycling threads read
/// it during a tick.
pub struct EngineGraph {
    graph: Graph,
    config: SoundConfig,
    buffers: BufferPool,
    channel_recalls: SecondaryMap<ChannelKey, NodeRecalls>,
    audio_recalls: SecondaryMap<AudioKey, NodeRecalls>,
    playbacks: SecondaryMap<ChannelKey, Arc<Playback>>,
    domains: SecondaryMap<AudioKey, Arc<PlaybackDomain>>,
    generation: u64,
}

impl EngineGraph {
    pub fn new(config: SoundConfig) -> Self {
        Self {
            graph: Graph::new(),
            config,
            buffers: BufferPool::new(),
            channel_recalls: SecondaryMap::new(),
            audio_recalls: SecondaryMap::new(),
            playbacks: SecondaryMap::new(),
            domains: SecondaryMap::new(),
            generation: 0,
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn config(&self) -> &SoundConfig {
        &self.config
    }

    pub fn buffers(&self) -> &BufferPool {
        &self.buffers
    }

    /// Bumped by every structural change.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn recalls(&self, attached: Attachment) -> Option<&NodeRecalls> {
        match attached {
            Attachment::Channel(channel) => self.channel_recalls.get(channel),
            Attachment::Audio(audio) => self.audio_recalls.get(audio),
        }
    }

    pub fn playback(&self, channel: ChannelKey) -> Option<&Arc<Playback>> {
        self.playbacks.get(channel)
    }

    pub fn domain(&self, audio: AudioKey) -> Option<&Arc<PlaybackDomain>> {
        self.domains.get(audio)
    }

    pub fn add_audio(&mut self, name: &str, mode: AudioMode, audio_channels: u16) -> AudioKey {
        let audio = self.graph.add_audio(name, mode, audio_channels);
        self.audio_recalls.insert(audio, NodeRecalls::default());
        self.domains.insert(audio, PlaybackDomain::new(audio));
        self.generation += 1;
        log::debug!("added audio {name:?}");
        audio
    }

    /// Remove an audio, cancelling its recalls and disposing its playbacks.
    pub fn remove_audio(&mut self, audio: AudioKey) -> Result<(), GraphError> {
        let removed = self.graph.remove_audio(audio)?;
        if let Some(domain) = self.domains.remove(audio) {
            domain.dispose();
        }
        if let Some(recalls) = self.audio_recalls.remove(audio) {
            cancel_all(&recalls);
        }
        self.forget(removed);
        self.generation += 1;
        Ok(())
    }

    /// Resize one direction of an audio, keeping lists, playbacks and
    /// buffers in step with the channels.
    pub fn resize(
        &mut self,
        audio: AudioKey,
        role: ChannelRole,
        pads: u16,
    ) -> Result<Resized, GraphError> {
        let resized = self.graph.resize(audio, role, pads)?;
        let domain = self.domains.get(audio).cloned();
        for &channel in &resized.added_channels {
            self.channel_recalls.insert(channel, NodeRecalls::default());
            let playback = Playback::new(channel, role);
            if let Some(domain) = &domain {
                domain.add_playback(&playback, role);
            }
            self.playbacks.insert(channel, playback);
        }
        for &recycling in &resized.added_recyclings {
            self.buffers.allocate(recycling, &self.config);
        }
        self.forget(resized.removed.clone());
        self.generation += 1;
        Ok(resized)
    }

    pub fn add_recycling(
        &mut self,
        channel: ChannelKey,
        parent: Option<RecyclingKey>,
    ) -> Result<RecyclingKey, GraphError> {
        let recycling = self.graph.add_recycling(channel, parent)?;
        self.buffers.allocate(recycling, &self.config);
        self.generation += 1;
        Ok(recycling)
    }

    pub fn link(&mut self, a: ChannelKey, b: ChannelKey) -> Result<(), GraphError> {
        self.graph.link(a, b)?;
        self.generation += 1;
        Ok(())
    }

    pub fn unlink(&mut self, channel: ChannelKey) -> Result<(), GraphError> {
        self.graph.unlink(channel)?;
        self.generation += 1;
        Ok(())
    }

    /// Attach templates to the play and recall lists of a node.
    pub fn add_recall(
        &mut self,
        attached: Attachment,
        play: Option<RecallHandle>,
        recall: Option<RecallHandle>,
    ) -> Result<(), GraphError> {
        let lists = self.recalls(attached).ok_or(match attached {
            Attachment::Channel(_) => GraphError::UnknownChannel,
            Attachment::Audio(_) => GraphError::UnknownAudio,
        })?;
        if let Some(play) = play {
            lists.play.add(play);
        }
        if let Some(recall) = recall {
            lists.recall.add(recall);
        }
        self.generation += 1;
        Ok(())
    }

    /// Cancel the instances and remove the templates of a container.
    /// Returns the number of units removed.
    pub fn remove_container(&mut self, attached: Attachment, container: u64) -> usize {
        let Some(lists) = self.recalls(attached) else {
            return 0;
        };
        let mut removed = 0;
        for list in lists.lists() {
            for unit in list.container(container) {
                unit.cancel();
                if list.remove(&unit) || !unit.is_template() {
                    removed += 1;
                }
            }
        }
        self.generation += 1;
        removed
    }

    /// Apply a new configuration and resize every buffer.
    pub fn reconfigure(&mut self, config: SoundConfig) {
        self.buffers.reconfigure(&config);
        self.config = config;
        self.generation += 1;
    }

    /// Lists a walk of `chain` visits, in order, with repetitions.
    ///
    /// Per step: the entry channel's list, the audio's play list (twice
    /// when the chain asks for the extra pass), the audio's recall list on
    /// the recall side, then the corresponding output channel's list.
    pub fn walk_lists(&self, chain: &Chain) -> Vec<ListVisit> {
        let mut visits = Vec::new();
        let mut push = |attached: Attachment, step: ChainStep, list: &RecallList| {
            visits.push(ListVisit {
                attached,
                step,
                list: list.clone(),
            });
        };
        for &step in &chain.steps {
            if let Some(lists) = self.channel_recalls.get(step.channel) {
                push(Attachment::Channel(step.channel), step, lists.side(chain.side));
            }
            if let Some(lists) = self.audio_recalls.get(step.audio) {
                let attached = Attachment::Audio(step.audio);
                push(attached, step, &lists.play);
                // FIXME: the extra pass runs one level too deep into the tree
                if chain.extra_audio_pass {
                    push(attached, step, &lists.play);
                }
                if chain.side == ChainSide::Recall {
                    push(attached, step, &lists.recall);
                }
            }
            if let Some(output) = step.output {
                if let Some(lists) = self.channel_recalls.get(output) {
                    push(Attachment::Channel(output), step, lists.side(chain.side));
                }
            }
        }
        visits
    }

    /// Duplicate the templates along `recall_id`'s chain that were not yet
    /// instantiated for it. `seen` holds the template ids already handled.
    pub fn instantiate(
        &self,
        recall_id: &Arc<RecallId>,
        seen: &mut HashSet<u64>,
    ) -> Result<Vec<RecallHandle>, GraphError> {
        let chain = self.graph.chain(recall_id.recycling)?;
        let mut created = Vec::new();
        for visit in self.walk_lists(&chain) {
            for template in visit.list.templates() {
                if seen.insert(template.id()) {
                    let instance = template.duplicate(recall_id.clone());
                    visit.list.add(instance.clone());
                    created.push(instance);
                }
            }
        }
        self.adopt(recall_id, &created);
        Ok(created)
    }

    /// Mirror the template tree: each new instance whose template has a
    /// parent becomes a child of that parent's instance for the same
    /// recall id.
    fn adopt(&self, recall_id: &RecallId, created: &[RecallHandle]) {
        let mut existing = None;
        for instance in created {
            let Some(parent_template) = instance.template_unit().and_then(|t| t.parent()) else {
                continue;
            };
            let parent = created
                .iter()
                .find(|u| u.is_instance_of(&parent_template))
                .cloned()
                .or_else(|| {
                    existing
                        .get_or_insert_with(|| self.instances(recall_id.id))
                        .iter()
                        .find(|u| u.is_instance_of(&parent_template))
                        .cloned()
                });
            match parent {
                Some(parent) => parent.add_child(instance.clone()),
                None => log::debug!(
                    "{} #{} has no {} instance to join",
                    instance.name(),
                    instance.id(),
                    parent_template.name()
                ),
            }
        }
    }

    /// Resolve dependencies of freshly created instances against every
    /// instance of the same recall id along its chain.
    pub fn resolve(&self, recall_id: &RecallId, created: &[RecallHandle]) -> Vec<EngineError> {
        let mut siblings: Vec<RecallHandle> = Vec::new();
        if let Ok(chain) = self.graph.chain(recall_id.recycling) {
            for visit in self.walk_lists(&chain) {
                for unit in visit.list.instances(recall_id.id) {
                    if !siblings.iter().any(|s| Arc::ptr_eq(s, &unit)) {
                        siblings.push(unit);
                    }
                }
            }
        }

        let mut errors = Vec::new();
        for unit in created {
            if let Err(source) = unit.resolve_dependencies(&siblings) {
                log::warn!("{} #{} not started: {source}", unit.name(), unit.id());
                errors.push(EngineError::Dependency {
                    unit: unit.name(),
                    unit_id: unit.id(),
                    source,
                });
            }
        }
        errors
    }

    /// Every instance of `recall_id` still attached anywhere in the graph.
    pub fn instances(&self, recall_id: u64) -> Vec<RecallHandle> {
        self.all_lists()
            .flat_map(|list| list.instances(recall_id))
            .collect()
    }

    /// Whether every instance of `recall_id` has finished.
    pub fn is_done(&self, recall_id: u64) -> bool {
        self.all_lists().all(|list| list.is_done(recall_id))
    }

    /// Cancel every instance of `recall_id`.
    pub fn cancel_instances(&self, recall_id: u64) {
        for unit in self.instances(recall_id) {
            unit.cancel();
        }
    }

    /// Output channels without a link, with their audio channel.
    pub fn terminal_outputs(&self) -> Vec<(ChannelKey, u16)> {
        self.graph
            .terminal_outputs()
            .filter_map(|c| Some((c, self.graph.channel(c)?.audio_channel)))
            .collect()
    }

    /// Stop every thread and drop all playback bookkeeping.
    pub fn dispose(&mut self) {
        for (_, domain) in self.domains.iter() {
            domain.dispose();
        }
        for lists in self.channel_recalls.values().chain(self.audio_recalls.values()) {
            cancel_all(lists);
        }
    }

    fn all_lists(&self) -> impl Iterator<Item = &RecallList> {
        self.channel_recalls
            .values()
            .chain(self.audio_recalls.values())
            .flat_map(|n| n.lists())
    }

    fn forget(&mut self, removed: Removed) {
        for channel in removed.channels {
            if let Some(recalls) = self.channel_recalls.remove(channel) {
                cancel_all(&recalls);
            }
            if let Some(playback) = self.playbacks.remove(channel) {
                playback.dispose();
            }
        }
        for recycling in removed.recyclings {
            self.buffers.remove(recycling);
        }
    }
}

fn cancel_all(recalls: &NodeRecalls) {
    for list in recalls.lists() {
        for unit in list.snapshot() {
            unit.cancel();
        }
    }
}

/// Explicitly constructed context shared by the session, its recycling
/// threads and the task queue.
pub struct EngineContext {
    graph: RwLock<EngineGraph>,
    output_device: Mutex<Option<String>>,
    next_recall_id: AtomicU64,
}

impl EngineContext {
    pub fn new(config: SoundConfig) -> Arc<Self> {
        Arc::new(Self {
            graph: RwLock::new(EngineGraph::new(config)),
            output_device: Mutex::new(None),
            next_recall_id: AtomicU64::new(1),
        })
    }

    /// Shared access for walks and queries.
    pub fn graph(&self) -> RwLockReadGuard<'_, EngineGraph> {
        self.graph.read()
    }

    /// The structural lock. Only taken between ticks.
    pub fn graph_mut(&self) -> RwLockWriteGuard<'_, EngineGraph> {
        self.graph.write()
    }

    pub fn config(&self) -> SoundConfig {
        *self.graph.read().config()
    }

    pub fn next_recall_id(&self) -> u64 {
        self.next_recall_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Output device requested by the last set-output-device task.
    pub fn output_device(&self) -> Option<String> {
        self.output_device.lock().clone()
    }

    pub(crate) fn output_device_slot(&self) -> &Mutex<Option<String>> {
        &self.output_device
    }
}

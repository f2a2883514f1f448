//! Stage walk over a recycling chain.

use std::sync::Arc;
use tact_ir::{Chain, RecallId};

use crate::context::EngineGraph;
use crate::recall_unit::DispatchEnv;
use crate::report::{UnitFailure, WalkReport};

/// Sub-phase of a tick. Every tick walks all three in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    Pre,
    Inter,
    Post,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Pre, Stage::Inter, Stage::Post];
}

/// Walk `chain` once for `stage`, dispatching every instance bound to
/// `recall_id` in the lists the walk visits.
///
/// A failing unit is logged and recorded; the walk goes on.
pub fn walk_stage(
    graph: &EngineGraph,
    chain: &Chain,
    recall_id: &RecallId,
    stage: Stage,
    tick: u64,
    report: &mut WalkReport,
) {
    for visit in graph.walk_lists(chain) {
        let env = DispatchEnv {
            graph: graph.graph(),
            buffers: graph.buffers(),
            config: graph.config(),
            attached: visit.attached,
            step: visit.step,
            tick,
        };
        for unit in visit.list.snapshot() {
            if unit.is_template() || unit.recall_id().map(|r| r.id) != Some(recall_id.id) {
                continue;
            }
            report.dispatched += 1;
            if let Err(error) = unit.dispatch(stage, &env) {
                log::warn!(
                    "{} #{} failed in {stage:?} of tick {tick}: {error}",
                    unit.name(),
                    unit.id()
                );
                report.failures.push(UnitFailure {
                    unit: unit.name(),
                    unit_id: unit.id(),
                    recall_id: recall_id.id,
                    tick,
                    stage,
                    error,
                });
            }
        }
    }
}

/// Run one tick for a set of recall ids: each stage walks every chain
/// before the next stage starts.
pub fn run_iteration(graph: &EngineGraph, entries: &[Arc<RecallId>], tick: u64) -> WalkReport {
    run_iteration_with(graph, entries, tick, |_| {})
}

/// [`run_iteration`] with a hook called as each stage begins.
pub(crate) fn run_iteration_with(
    graph: &EngineGraph,
    entries: &[Arc<RecallId>],
    tick: u64,
    mut on_stage: impl FnMut(Stage),
) -> WalkReport {
    let mut report = WalkReport::default();
    let mut chains = Vec::with_capacity(entries.len());
    for recall_id in entries {
        match graph.graph().chain(recall_id.recycling) {
            Ok(chain) => chains.push((chain, recall_id)),
            Err(err) => {
                log::error!("chain of recall id {} is broken: {err}", recall_id.id);
                report.structural.get_or_insert(err);
            }
        }
    }
    for stage in Stage::ALL {
        on_stage(stage);
        for (chain, recall_id) in &chains {
            walk_stage(graph, chain, recall_id, stage, tick, &mut report);
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recall::{Attachment, Recall, RecallContext, RecallError, RecallInfo};
    use crate::recall_unit::RecallUnit;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use tact_ir::{AudioMode, ChannelRole, SoundConfig, SoundScope};

    static COUNTER: RecallInfo = RecallInfo {
        name: "counter",
        version: "1.0.0",
        build_id: "test",
        dependencies: &[],
    };

    /// Records `(label, stage)` for every run callback.
    struct Counter {
        label: &'static str,
        calls: Arc<Mutex<Vec<(&'static str, Stage)>>>,
        fail: bool,
    }

    impl Counter {
        fn record(&self, stage: Stage) -> Result<(), RecallError> {
            self.calls.lock().push((self.label, stage));
            if self.fail {
                return Err(RecallError::transient("bad buffer position"));
            }
            Ok(())
        }
    }

    impl Recall for Counter {
        fn info(&self) -> &'static RecallInfo {
            &COUNTER
        }
        fn duplicate(&self) -> Box<dyn Recall> {
            Box::new(Counter {
                label: self.label,
                calls: self.calls.clone(),
                fail: self.fail,
            })
        }
        fn run_pre(&mut self, _: &mut RecallContext<'_>) -> Result<(), RecallError> {
            self.record(Stage::Pre)
        }
        fn run_inter(&mut self, _: &mut RecallContext<'_>) -> Result<(), RecallError> {
            self.record(Stage::Inter)
        }
        fn run_post(&mut self, _: &mut RecallContext<'_>) -> Result<(), RecallError> {
            self.record(Stage::Post)
        }
    }

    type Calls = Arc<Mutex<Vec<(&'static str, Stage)>>>;

    fn counter(label: &'static str, calls: &Calls, fail: bool) -> Option<crate::RecallHandle> {
        Some(RecallUnit::template(Box::new(Counter {
            label,
            calls: calls.clone(),
            fail,
        })))
    }

    /// synth (1 in, 1 out) linked into mixer (1 in, 1 out).
    struct Rig {
        graph: EngineGraph,
        synth: tact_ir::AudioKey,
        synth_in: tact_ir::ChannelKey,
        mixer_out: tact_ir::ChannelKey,
    }

    fn rig() -> Rig {
        let mut graph = EngineGraph::new(SoundConfig::default());
        let synth = graph.add_audio("synth", AudioMode::Async, 1);
        let mixer = graph.add_audio("mixer", AudioMode::Async, 1);
        let synth_out = graph.resize(synth, ChannelRole::Output, 1).unwrap().added_channels[0];
        let synth_in = graph.resize(synth, ChannelRole::Input, 1).unwrap().added_channels[0];
        let mixer_out = graph.resize(mixer, ChannelRole::Output, 1).unwrap().added_channels[0];
        let mixer_in = graph.resize(mixer, ChannelRole::Input, 1).unwrap().added_channels[0];
        graph.link(synth_out, mixer_in).unwrap();
        Rig {
            graph,
            synth,
            synth_in,
            mixer_out,
        }
    }

    fn start(graph: &EngineGraph, recycling: tact_ir::RecyclingKey) -> Arc<RecallId> {
        let recall_id = Arc::new(RecallId::new(1, SoundScope::Playback, recycling));
        let created = graph.instantiate(&recall_id, &mut HashSet::new()).unwrap();
        assert!(graph.resolve(&recall_id, &created).is_empty());
        // first tick runs the init variants
        run_iteration(graph, &[recall_id.clone()], 0);
        recall_id
    }

    #[test]
    fn stages_run_in_order_across_chain() {
        let calls: Calls = Arc::default();
        let mut r = rig();
        r.graph.add_recall(Attachment::Channel(r.synth_in), counter("synth-in", &calls, false), None).unwrap();
        r.graph.add_recall(Attachment::Channel(r.mixer_out), counter("mixer-out", &calls, false), None).unwrap();

        let origin = r.graph.graph().channel(r.synth_in).unwrap().first_recycling().unwrap();
        let recall_id = start(&r.graph, origin);
        let report = run_iteration(&r.graph, &[recall_id], 1);

        assert!(report.failures.is_empty());
        assert_eq!(
            *calls.lock(),
            vec![
                ("synth-in", Stage::Pre),
                ("mixer-out", Stage::Pre),
                ("synth-in", Stage::Inter),
                ("mixer-out", Stage::Inter),
                ("synth-in", Stage::Post),
                ("mixer-out", Stage::Post),
            ]
        );
    }

    #[test]
    fn audio_play_list_runs_twice_below_top_level_parent() {
        let calls: Calls = Arc::default();
        let mut r = rig();
        r.graph.add_recall(Attachment::Audio(r.synth), counter("audio", &calls, false), None).unwrap();

        let parent = r.graph.graph().channel(r.mixer_out).unwrap().first_recycling().unwrap();
        let nested = r.graph.add_recycling(r.synth_in, Some(parent)).unwrap();
        let recall_id = start(&r.graph, nested);

        let chain = r.graph.graph().chain(nested).unwrap();
        let mut report = WalkReport::default();
        walk_stage(&r.graph, &chain, &recall_id, Stage::Pre, 1, &mut report);
        assert_eq!(calls.lock().len(), 2);
    }

    #[test]
    fn audio_play_list_runs_once_otherwise() {
        let calls: Calls = Arc::default();
        let mut r = rig();
        r.graph.add_recall(Attachment::Audio(r.synth), counter("audio", &calls, false), None).unwrap();

        let top = r.graph.graph().channel(r.mixer_out).unwrap().first_recycling().unwrap();
        let middle = r.graph.add_recycling(r.synth_in, Some(top)).unwrap();
        let deep = r.graph.add_recycling(r.synth_in, Some(middle)).unwrap();

        for origin in [r.graph.graph().channel(r.synth_in).unwrap().first_recycling().unwrap(), deep] {
            calls.lock().clear();
            let recall_id = start(&r.graph, origin);
            let chain = r.graph.graph().chain(origin).unwrap();
            let mut report = WalkReport::default();
            walk_stage(&r.graph, &chain, &recall_id, Stage::Pre, 1, &mut report);
            assert_eq!(calls.lock().len(), 1);
            r.graph.cancel_instances(recall_id.id);
        }
    }

    #[test]
    fn failing_unit_does_not_stop_the_walk() {
        let calls: Calls = Arc::default();
        let mut r = rig();
        r.graph.add_recall(Attachment::Channel(r.synth_in), counter("broken", &calls, true), None).unwrap();
        r.graph.add_recall(Attachment::Channel(r.mixer_out), counter("healthy", &calls, false), None).unwrap();

        let origin = r.graph.graph().channel(r.synth_in).unwrap().first_recycling().unwrap();
        let recall_id = start(&r.graph, origin);
        let report = run_iteration(&r.graph, &[recall_id], 1);

        assert_eq!(report.failures.len(), 3);
        assert!(report.failures.iter().all(|f| f.unit == "counter" && f.tick == 1));
        let healthy_posts = calls
            .lock()
            .iter()
            .filter(|(label, stage)| *label == "healthy" && *stage == Stage::Post)
            .count();
        assert_eq!(healthy_posts, 1);
    }

    #[test]
    fn broken_chain_is_reported_as_structural() {
        let r = rig();
        let origin = r.graph.graph().channel(r.synth_in).unwrap().first_recycling().unwrap();
        let mut graph = r.graph;
        let recall_id = Arc::new(RecallId::new(1, SoundScope::Playback, origin));
        graph.resize(r.synth, ChannelRole::Input, 0).unwrap();

        let report = run_iteration(&graph, &[recall_id], 0);
        assert_eq!(report.structural, Some(tact_ir::GraphError::UnknownRecycling));
    }
}

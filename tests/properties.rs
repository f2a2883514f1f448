//! Integration test: scheduler and bookkeeping properties.

mod common;

use common::{attach, builtin, config, events_of, machine, Events, Recorder};
use std::collections::HashSet;
use std::sync::Arc;
use tact_audio::MemorySink;
use tact_engine::{
    run_iteration, walk_stage, Attachment, EngineGraph, IterState, Playback, PlaybackDomain,
    RecyclingThread, ScopeThread, Session, Stage, ThreadHandle, WalkReport,
};
use tact_ir::{
    ChannelRole, PortValue, RecallId, SoundConfig, SoundScope, SuperThreadedScope, ThreadModel,
};

// --- P1: idempotent add ---

#[test]
fn add_playback_twice_keeps_one_entry() {
    let mut graph = EngineGraph::new(config(64));
    let m = machine(&mut graph, "synth", 3);
    let domain = PlaybackDomain::new(m.audio);
    for &output in &m.outputs {
        let playback = Playback::new(output, ChannelRole::Output);
        domain.add_playback(&playback, ChannelRole::Output);
        domain.add_playback(&playback, ChannelRole::Output);
    }
    let playbacks = domain.playbacks(ChannelRole::Output);
    assert_eq!(playbacks.len(), 3);
    let channels: HashSet<_> = playbacks.iter().map(|p| p.channel()).collect();
    assert_eq!(channels.len(), 3);
}

// --- P2: barrier ---

#[test]
fn no_tick_starts_before_every_chain_finished_the_last() {
    let cfg = SoundConfig {
        buffer_size: 128,
        thread_model: ThreadModel::SuperThreaded,
        super_threaded_scope: SuperThreadedScope::Channel,
        ..SoundConfig::default()
    };
    let events = Events::default();
    let labels = ["a", "b", "c", "d"];
    let mut session = Session::new(cfg).unwrap();
    let m = session.edit(|g| {
        let m = machine(g, "voices", labels.len() as u16);
        for (&input, label) in m.inputs.iter().zip(labels) {
            attach(g, input, Recorder::new(label, &events).template());
        }
        m
    });
    session.start_playback(m.audio, SoundScope::Playback).unwrap();
    let workers = session.workers();
    assert_eq!(workers.len(), labels.len());

    let mut sink = MemorySink::new();
    for tick in 0..8u64 {
        session.tick(&mut sink).unwrap();
        assert!(workers.iter().all(|w| w.state() == IterState::Done));
        for label in labels {
            let posts = events_of(&events, label)
                .into_iter()
                .filter(|e| e.tick == tick && e.stage == Stage::Post)
                .count();
            assert_eq!(posts, 1, "{label} missed post of tick {tick}");
        }
    }

    let all = events.lock().clone();
    for tick in 1..8u64 {
        let last_of_previous = all.iter().filter(|e| e.tick == tick - 1).map(|e| e.at).max().unwrap();
        let first = all.iter().filter(|e| e.tick == tick).map(|e| e.at).min().unwrap();
        assert!(first >= last_of_previous);
    }
    session.shutdown();
}

// --- P3: ownership transfer ---

#[test]
fn replacing_channel_thread_stops_the_previous_one() {
    let session = Session::new(config(64)).unwrap();
    let context = session.context().clone();
    let (channel, recall_id) = session.edit(|g| {
        let m = machine(g, "synth", 1);
        let recycling = g.graph().channel(m.inputs[0]).unwrap().first_recycling().unwrap();
        (m.inputs[0], Arc::new(RecallId::new(1, SoundScope::Playback, recycling)))
    });
    let playback = context.graph().playback(channel).cloned().unwrap();
    let scope = SoundScope::Playback.index();

    let first = RecyclingThread::spawn("first", &context, vec![recall_id.clone()]).unwrap();
    let second = RecyclingThread::spawn("second", &context, vec![recall_id]).unwrap();
    playback.set_channel_thread(scope, Some(first.clone() as ThreadHandle));
    assert!(first.is_running());

    playback.set_channel_thread(scope, Some(second.clone() as ThreadHandle));
    assert!(!first.is_running());
    assert!(second.is_running());
    assert_eq!(playback.get_channel_thread(scope).unwrap().name(), "second");

    playback.dispose();
    assert!(!second.is_running());
}

// --- P4: two-pass rule ---

#[test]
fn audio_play_list_runs_twice_only_below_top_level_parent() {
    let events = Events::default();
    let mut graph = EngineGraph::new(config(64));
    let synth = machine(&mut graph, "synth", 1);
    let master = machine(&mut graph, "master", 1);
    graph.link(synth.outputs[0], master.inputs[0]).unwrap();
    graph
        .add_recall(
            Attachment::Audio(synth.audio),
            Some(Recorder::new("audio", &events).template()),
            None,
        )
        .unwrap();

    let top = graph.graph().channel(master.outputs[0]).unwrap().first_recycling().unwrap();
    let below_top = graph.add_recycling(synth.inputs[0], Some(top)).unwrap();
    let deeper = graph.add_recycling(synth.inputs[0], Some(below_top)).unwrap();
    let root = graph.graph().channel(synth.inputs[0]).unwrap().first_recycling().unwrap();

    for (id, origin, expected) in [(1, below_top, 2), (2, deeper, 1), (3, root, 1)] {
        let recall_id = Arc::new(RecallId::new(id, SoundScope::Playback, origin));
        let created = graph.instantiate(&recall_id, &mut HashSet::new()).unwrap();
        assert!(graph.resolve(&recall_id, &created).is_empty());
        // tick 0 runs the init variants
        run_iteration(&graph, &[recall_id.clone()], 0);

        events.lock().clear();
        let chain = graph.graph().chain(origin).unwrap();
        let mut report = WalkReport::default();
        walk_stage(&graph, &chain, &recall_id, Stage::Pre, 1, &mut report);
        assert_eq!(events.lock().len(), expected, "origin of recall id {id}");
    }
}

// --- P5: duplication ---

#[test]
fn duplicates_mutate_ports_independently() {
    let template = builtin("tone");
    let mut graph = EngineGraph::new(config(64));
    let m = machine(&mut graph, "synth", 1);
    let recycling = graph.graph().channel(m.inputs[0]).unwrap().first_recycling().unwrap();

    let a = template.duplicate(Arc::new(RecallId::new(1, SoundScope::Playback, recycling)));
    let b = template.duplicate(Arc::new(RecallId::new(2, SoundScope::Sequencer, recycling)));
    assert_ne!(a.id(), b.id());
    assert!(a.is_instance_of(&template) && b.is_instance_of(&template));

    assert!(a.set_port("freq", PortValue::Float(110.0)));
    assert!(b.set_port("freq", PortValue::Float(880.0)));
    assert_eq!(a.port_value("freq"), Some(PortValue::Float(110.0)));
    assert_eq!(b.port_value("freq"), Some(PortValue::Float(880.0)));
    assert_eq!(template.port_value("freq"), Some(PortValue::Float(440.0)));
    assert!(!a.set_port("freq", PortValue::UInt(1)));
}

// --- P6: isolation ---

#[test]
fn failing_unit_leaves_the_rest_of_the_chain_running() {
    let events = Events::default();
    let mut session = Session::new(config(64)).unwrap();
    let m = session.edit(|g| {
        let m = machine(g, "synth", 1);
        attach(g, m.inputs[0], Recorder::new("before", &events).template());
        attach(g, m.inputs[0], Recorder::new("broken", &events).failing().template());
        attach(g, m.outputs[0], Recorder::new("after", &events).template());
        m
    });
    session.start_playback(m.audio, SoundScope::Playback).unwrap();

    let mut sink = MemorySink::new();
    session.tick(&mut sink).unwrap();
    for tick in 1..4 {
        let report = session.tick(&mut sink).unwrap();
        assert_eq!(report.failures.len(), 3);
        assert!(report.failures.iter().all(|f| f.tick == tick));
        assert_eq!(report.outputs, 1);
        for label in ["before", "after"] {
            assert!(events_of(&events, label)
                .iter()
                .any(|e| e.tick == tick && e.stage == Stage::Post && !e.init));
        }
    }
}

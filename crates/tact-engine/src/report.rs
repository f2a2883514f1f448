//! Per-walk and per-tick outcome records.

use std::time::Duration;
use tact_ir::{AudioKey, GraphError, SoundScope};

use crate::dispatch::Stage;
use crate::error::EngineError;
use crate::recall::RecallError;

/// A unit callback that failed for one stage of one tick.
#[derive(Clone, Debug, PartialEq)]
pub struct UnitFailure {
    pub unit: &'static str,
    pub unit_id: u64,
    pub recall_id: u64,
    pub tick: u64,
    pub stage: Stage,
    pub error: RecallError,
}

/// Outcome of walking a set of chains for one tick.
#[derive(Clone, Debug, Default)]
pub struct WalkReport {
    pub failures: Vec<UnitFailure>,
    /// First structural error hit; the chain it came from was not walked.
    pub structural: Option<GraphError>,
    /// Callbacks invoked.
    pub dispatched: usize,
}

impl WalkReport {
    pub fn merge(&mut self, other: WalkReport) {
        self.failures.extend(other.failures);
        self.structural = self.structural.or(other.structural);
        self.dispatched += other.dispatched;
    }
}

/// Outcome of one session tick.
#[derive(Debug, Default)]
pub struct TickReport {
    pub tick: u64,
    /// Isolated unit failures, already logged.
    pub failures: Vec<UnitFailure>,
    /// Task and dependency errors collected since the previous tick.
    pub errors: Vec<EngineError>,
    /// Playback scopes whose instances all finished during this tick.
    pub released: Vec<(AudioKey, SoundScope)>,
    /// Buffers handed to the sink.
    pub outputs: usize,
    pub dispatched: usize,
    pub elapsed: Duration,
}

//! Engine error taxonomy.

use tact_audio::AudioError;
use tact_ir::{ConfigError, GraphError};
use thiserror::Error;

use crate::recall::RecallError;

/// Errors surfaced to the orchestrator and its callers.
///
/// Transient unit failures never become an `EngineError`; they are
/// logged and collected in the tick report instead.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid sound configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("structural graph error: {0}")]
    Structural(#[from] GraphError),

    #[error("recall {unit} (id {unit_id}) cannot run: {source}")]
    Dependency {
        unit: &'static str,
        unit_id: u64,
        #[source]
        source: RecallError,
    },

    #[error("session aborted after a structural error")]
    SessionAborted,

    #[error("task {name} failed: {reason}")]
    Task { name: &'static str, reason: String },

    #[error("failed to spawn recycling thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error(transparent)]
    Audio(#[from] AudioError),
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

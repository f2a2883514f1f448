//! Execution-context identifiers.

use crate::graph::RecyclingKey;

/// Number of sound scopes tracked per channel and audio.
pub const SOUND_SCOPE_COUNT: usize = 4;

/// Parallel, independent execution contexts of the same channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SoundScope {
    Playback,
    Sequencer,
    Notation,
    Audio,
}

impl SoundScope {
    pub const ALL: [SoundScope; SOUND_SCOPE_COUNT] = [
        SoundScope::Playback,
        SoundScope::Sequencer,
        SoundScope::Notation,
        SoundScope::Audio,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }
}

/// Identifier correlating every recall instance of one execution context.
///
/// Shared as `Arc<RecallId>`; identity is the numeric `id`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RecallId {
    pub id: u64,
    pub scope: SoundScope,
    /// Recycling whose chain this context runs on.
    pub recycling: RecyclingKey,
}

impl RecallId {
    pub fn new(id: u64, scope: SoundScope, recycling: RecyclingKey) -> Self {
        Self { id, scope, recycling }
    }
}

//! Core data model for the tact recall scheduler.
//!
//! This crate defines the types shared by the scheduler, the playback
//! bookkeeping and the sinks: the arena audio graph, sample buffers,
//! sound configuration, recall identifiers and control ports.
//!
//! Designed to be `no_std` compatible with the `alloc` crate.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

mod audio_buffer;
mod config;
mod graph;
mod port;
mod recall_id;
mod timestamp;

pub use audio_buffer::{AudioBuffer, SampleFormat, MAX_CHANNELS, MAX_FRAMES};
pub use config::{ConfigError, SoundConfig, SuperThreadedScope, ThreadModel};
pub use graph::{
    Audio, AudioKey, AudioMode, Chain, ChainSide, ChainStep, Channel, ChannelKey, ChannelRole,
    Graph, GraphError, Recycling, RecyclingKey, Removed, Resized,
};
pub use port::{Port, PortValue, Ports};
pub use recall_id::{RecallId, SoundScope, SOUND_SCOPE_COUNT};
pub use timestamp::{Timeline, Timestamp};

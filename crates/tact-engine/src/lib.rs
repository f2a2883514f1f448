//! Recall scheduler for tact.
//!
//! Walks the recall units attached to the audio graph once per tick, in
//! three stages, for every recycling chain of every active playback
//! scope. Chains run inline or on dedicated recycling threads joined by a
//! per-tick barrier.

mod buffers;
mod context;
mod dispatch;
mod error;
mod playback;
mod recall;
mod recall_list;
mod recall_unit;
pub mod recalls;
mod recycling_thread;
mod report;
mod session;
pub mod task;

pub use buffers::BufferPool;
pub use context::{EngineContext, EngineGraph, NodeRecalls};
pub use dispatch::{run_iteration, walk_stage, Stage};
pub use error::{EngineError, Result};
pub use playback::{Playback, PlaybackDomain, ScopeThread, ThreadHandle};
pub use recall::{
    Attachment, Recall, RecallContext, RecallError, RecallInfo, ResolvedDependency,
};
pub use recall_list::RecallList;
pub use recall_unit::{DispatchEnv, RecallHandle, RecallState, RecallUnit};
pub use recalls::create_recall;
pub use recycling_thread::{IterState, RecyclingThread};
pub use report::{TickReport, UnitFailure, WalkReport};
pub use session::Session;
pub use task::{CyclicTask, Task, TaskContext, TaskSender, TaskThread};

//! Output sinks for the tact recall scheduler.
//!
//! The scheduler pushes one filled buffer per terminal output channel per
//! tick into an [`AudioSink`], then flushes it once the tick is complete.

mod memory;
mod ring;
mod traits;

#[cfg(feature = "cpal")]
mod cpal_backend;

#[cfg(feature = "cpal")]
pub use cpal_backend::CpalSink;
pub use memory::{MemorySink, WrittenBlock};
pub use ring::RingSink;
pub use traits::{AudioError, AudioSink, OutputLine};

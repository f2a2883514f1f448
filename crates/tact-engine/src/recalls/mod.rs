//! Built-in recall implementations.

mod buffer_mixer;
mod envelope;
mod stream;
mod tone;
mod volume;

pub use buffer_mixer::BufferMixer;
pub use envelope::Envelope;
pub use stream::Stream;
pub use tone::Tone;
pub use volume::Volume;

use crate::recall::Recall;

/// Create a built-in recall by name.
pub fn create_recall(name: &str) -> Option<Box<dyn Recall>> {
    Some(match name {
        "tone" => Box::new(Tone::new()),
        "volume" => Box::new(Volume),
        "buffer-mixer" => Box::new(BufferMixer::new()),
        "stream" => Box::new(Stream),
        "envelope" => Box::new(Envelope),
        _ => return None,
    })
}

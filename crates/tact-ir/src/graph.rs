//! Audio graph types: audios, their channels and the recyclings beneath
//! them, stored in arenas.
//!
//! Ownership flows Audio → Channel → Recycling. Links between channels
//! of different audios and recycling parents are plain keys, so the
//! routing graph cannot form ownership cycles.

use alloc::vec::Vec;
use arrayvec::ArrayString;
use slotmap::SlotMap;
use thiserror::Error;

slotmap::new_key_type! {
    /// Handle of an [`Audio`] in the graph arena.
    pub struct AudioKey;
    /// Handle of a [`Channel`] in the graph arena.
    pub struct ChannelKey;
    /// Handle of a [`Recycling`] in the graph arena.
    pub struct RecyclingKey;
}

/// Structural errors of the audio graph.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphError {
    #[error("unknown audio")]
    UnknownAudio,
    #[error("unknown channel")]
    UnknownChannel,
    #[error("unknown recycling")]
    UnknownRecycling,
    #[error("a link must join an output channel to an input channel")]
    InvalidLink,
    #[error("link would close a cycle in the routing graph")]
    CyclicLink,
    #[error("link chain points at a channel or audio that no longer exists")]
    BrokenLink,
}

/// How input channels map onto output channels inside one audio.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AudioMode {
    /// Inputs feed the output with the same audio channel (pad 0).
    #[default]
    Async,
    /// Input line `n` feeds output line `n`.
    Sync,
}

/// Direction of a channel within its audio.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelRole {
    Output,
    Input,
}

/// A machine: an ordered set of output and input channels.
#[derive(Clone, Debug)]
pub struct Audio {
    pub name: ArrayString<32>,
    pub mode: AudioMode,
    /// Channels per pad.
    pub audio_channels: u16,
    pub output_pads: u16,
    pub input_pads: u16,
    /// Output channels ordered by line.
    pub output: Vec<ChannelKey>,
    /// Input channels ordered by line.
    pub input: Vec<ChannelKey>,
}

impl Audio {
    pub fn channels(&self, role: ChannelRole) -> &[ChannelKey] {
        match role {
            ChannelRole::Output => &self.output,
            ChannelRole::Input => &self.input,
        }
    }
}

/// A node of the graph: one line of an audio.
#[derive(Clone, Debug)]
pub struct Channel {
    pub audio: AudioKey,
    pub role: ChannelRole,
    pub pad: u16,
    pub audio_channel: u16,
    pub line: u32,
    /// Partner channel in another audio (back-reference, not ownership).
    pub link: Option<ChannelKey>,
    /// Recyclings held by this channel, first one is the channel's buffer.
    pub recyclings: Vec<RecyclingKey>,
}

impl Channel {
    pub fn first_recycling(&self) -> Option<RecyclingKey> {
        self.recyclings.first().copied()
    }
}

/// Buffer-holding node beneath a channel.
#[derive(Clone, Debug)]
pub struct Recycling {
    pub channel: ChannelKey,
    /// Enclosing recycling when this one is nested, `None` at top level.
    pub parent: Option<RecyclingKey>,
}

/// Keys dropped from the arenas by a structural change.
#[derive(Clone, Debug, Default)]
pub struct Removed {
    pub channels: Vec<ChannelKey>,
    pub recyclings: Vec<RecyclingKey>,
}

/// Keys added to and dropped from the arenas by [`Graph::resize`].
#[derive(Clone, Debug, Default)]
pub struct Resized {
    pub added_channels: Vec<ChannelKey>,
    pub added_recyclings: Vec<RecyclingKey>,
    pub removed: Removed,
}

/// Which recall list a chain walk consults at channel level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChainSide {
    /// Top-level recycling: play lists.
    Play,
    /// Nested recycling: recall lists.
    Recall,
}

/// One audio visited by a chain walk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChainStep {
    /// Channel through which the walk entered the audio.
    pub channel: ChannelKey,
    pub audio: AudioKey,
    /// Corresponding output channel, when it differs from `channel`.
    pub output: Option<ChannelKey>,
}

/// Path of one recycling's ownership chain through the routing graph.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chain {
    pub origin: RecyclingKey,
    pub side: ChainSide,
    /// The origin's parent is top level, so the audio-level play list is
    /// consulted a second time at every step.
    pub extra_audio_pass: bool,
    pub steps: Vec<ChainStep>,
}

/// The audio processing graph.
#[derive(Clone, Debug, Default)]
pub struct Graph {
    audios: SlotMap<AudioKey, Audio>,
    channels: SlotMap<ChannelKey, Channel>,
    recyclings: SlotMap<RecyclingKey, Recycling>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an audio without channels and return its key.
    pub fn add_audio(&mut self, name: &str, mode: AudioMode, audio_channels: u16) -> AudioKey {
        let mut audio_name = ArrayString::new();
        let _ = audio_name.try_push_str(name);
        self.audios.insert(Audio {
            name: audio_name,
            mode,
            audio_channels: audio_channels.max(1),
            output_pads: 0,
            input_pads: 0,
            output: Vec::new(),
            input: Vec::new(),
        })
    }

    /// Remove an audio with all its channels and recyclings.
    pub fn remove_audio(&mut self, key: AudioKey) -> Result<Removed, GraphError> {
        let audio = self.audios.remove(key).ok_or(GraphError::UnknownAudio)?;
        let mut removed = Removed::default();
        for channel in audio.output.into_iter().chain(audio.input) {
            self.drop_channel(channel, &mut removed);
        }
        Ok(removed)
    }

    /// Resize one direction of an audio to `pads` pads.
    ///
    /// New channels are appended with one top-level recycling each;
    /// surplus channels are unlinked and dropped from the end.
    pub fn resize(
        &mut self,
        key: AudioKey,
        role: ChannelRole,
        pads: u16,
    ) -> Result<Resized, GraphError> {
        let audio = self.audios.get(key).ok_or(GraphError::UnknownAudio)?;
        let per_pad = audio.audio_channels as usize;
        let wanted = pads as usize * per_pad;
        let mut current = audio.channels(role).to_vec();
        let mut resized = Resized::default();

        while current.len() > wanted {
            if let Some(channel) = current.pop() {
                self.drop_channel(channel, &mut resized.removed);
            }
        }
        while current.len() < wanted {
            let line = current.len();
            let channel = self.channels.insert(Channel {
                audio: key,
                role,
                pad: (line / per_pad) as u16,
                audio_channel: (line % per_pad) as u16,
                line: line as u32,
                link: None,
                recyclings: Vec::new(),
            });
            let recycling = self.recyclings.insert(Recycling {
                channel,
                parent: None,
            });
            if let Some(ch) = self.channels.get_mut(channel) {
                ch.recyclings.push(recycling);
            }
            current.push(channel);
            resized.added_channels.push(channel);
            resized.added_recyclings.push(recycling);
        }

        if let Some(audio) = self.audios.get_mut(key) {
            match role {
                ChannelRole::Output => {
                    audio.output = current;
                    audio.output_pads = pads;
                }
                ChannelRole::Input => {
                    audio.input = current;
                    audio.input_pads = pads;
                }
            }
        }
        Ok(resized)
    }

    /// Add a recycling to `channel`, nested below `parent` if given.
    pub fn add_recycling(
        &mut self,
        channel: ChannelKey,
        parent: Option<RecyclingKey>,
    ) -> Result<RecyclingKey, GraphError> {
        if !self.channels.contains_key(channel) {
            return Err(GraphError::UnknownChannel);
        }
        if let Some(parent) = parent {
            if !self.recyclings.contains_key(parent) {
                return Err(GraphError::UnknownRecycling);
            }
        }
        let recycling = self.recyclings.insert(Recycling { channel, parent });
        if let Some(ch) = self.channels.get_mut(channel) {
            ch.recyclings.push(recycling);
        }
        Ok(recycling)
    }

    /// Link an output channel with an input channel of another audio.
    ///
    /// Previous partners of either end are unlinked first. The order of
    /// the two arguments does not matter.
    pub fn link(&mut self, a: ChannelKey, b: ChannelKey) -> Result<(), GraphError> {
        let ca = self.channels.get(a).ok_or(GraphError::UnknownChannel)?;
        let cb = self.channels.get(b).ok_or(GraphError::UnknownChannel)?;
        let (output, input) = match (ca.role, cb.role) {
            (ChannelRole::Output, ChannelRole::Input) => (a, b),
            (ChannelRole::Input, ChannelRole::Output) => (b, a),
            _ => return Err(GraphError::InvalidLink),
        };
        let from = self.channels[output].audio;
        let to = self.channels[input].audio;
        if from == to || self.reaches(to, from) {
            return Err(GraphError::CyclicLink);
        }

        self.unlink(output)?;
        self.unlink(input)?;
        self.channels[output].link = Some(input);
        self.channels[input].link = Some(output);
        Ok(())
    }

    /// Clear the link of `channel` and of its partner.
    pub fn unlink(&mut self, channel: ChannelKey) -> Result<(), GraphError> {
        let partner = self
            .channels
            .get_mut(channel)
            .ok_or(GraphError::UnknownChannel)?
            .link
            .take();
        if let Some(partner) = partner {
            if let Some(p) = self.channels.get_mut(partner) {
                if p.link == Some(channel) {
                    p.link = None;
                }
            }
        }
        Ok(())
    }

    /// Output channel of pad 0 carrying `audio_channel`.
    pub fn nth_output_by_audio_channel(
        &self,
        audio: AudioKey,
        audio_channel: u16,
    ) -> Option<ChannelKey> {
        let audio = self.audios.get(audio)?;
        audio
            .output
            .iter()
            .copied()
            .find(|&c| self.channels.get(c).is_some_and(|ch| ch.pad == 0 && ch.audio_channel == audio_channel))
    }

    /// Output channel at `line`.
    pub fn nth_output_by_line(&self, audio: AudioKey, line: u32) -> Option<ChannelKey> {
        self.audios.get(audio)?.output.get(line as usize).copied()
    }

    /// Output channel a chain walk continues with after visiting `channel`.
    ///
    /// Output channels map to themselves; inputs of an async audio map by
    /// audio channel, inputs of a sync audio by line.
    pub fn corresponding_output(&self, channel: ChannelKey) -> Result<Option<ChannelKey>, GraphError> {
        let ch = self.channels.get(channel).ok_or(GraphError::UnknownChannel)?;
        if ch.role == ChannelRole::Output {
            return Ok(Some(channel));
        }
        let audio = self.audios.get(ch.audio).ok_or(GraphError::BrokenLink)?;
        Ok(match audio.mode {
            AudioMode::Async => self.nth_output_by_audio_channel(ch.audio, ch.audio_channel),
            AudioMode::Sync => self.nth_output_by_line(ch.audio, ch.line),
        })
    }

    /// Compute the chain a recycling thread walks for `origin`.
    ///
    /// The walk starts at the origin's channel, visits its audio and the
    /// corresponding output, then follows the output's link into the next
    /// audio. It ends at an unlinked output, at an audio without a
    /// corresponding output, or when it would re-enter the channel of the
    /// origin's parent recycling.
    pub fn chain(&self, origin: RecyclingKey) -> Result<Chain, GraphError> {
        let recycling = self.recyclings.get(origin).ok_or(GraphError::UnknownRecycling)?;
        let (side, boundary, extra_audio_pass) = match recycling.parent {
            None => (ChainSide::Play, None, false),
            Some(parent) => {
                let parent = self.recyclings.get(parent).ok_or(GraphError::BrokenLink)?;
                (ChainSide::Recall, Some(parent.channel), parent.parent.is_none())
            }
        };

        let mut steps: Vec<ChainStep> = Vec::new();
        let mut current = recycling.channel;
        loop {
            if steps.iter().any(|s| s.channel == current) {
                return Err(GraphError::CyclicLink);
            }
            let channel = self.channels.get(current).ok_or(GraphError::BrokenLink)?;
            if !self.audios.contains_key(channel.audio) {
                return Err(GraphError::BrokenLink);
            }
            let output = self.corresponding_output(current)?;
            let at_boundary = output.is_some() && output == boundary;
            steps.push(ChainStep {
                channel: current,
                audio: channel.audio,
                output: output.filter(|&o| o != current && !at_boundary),
            });

            let Some(output) = output.filter(|_| !at_boundary) else {
                break;
            };
            let out = self.channels.get(output).ok_or(GraphError::BrokenLink)?;
            match out.link {
                None => break,
                Some(next) if Some(next) == boundary => break,
                Some(next) => {
                    if !self.channels.contains_key(next) {
                        return Err(GraphError::BrokenLink);
                    }
                    current = next;
                }
            }
        }

        Ok(Chain {
            origin,
            side,
            extra_audio_pass,
            steps,
        })
    }

    pub fn audio(&self, key: AudioKey) -> Option<&Audio> {
        self.audios.get(key)
    }

    pub fn channel(&self, key: ChannelKey) -> Option<&Channel> {
        self.channels.get(key)
    }

    pub fn recycling(&self, key: RecyclingKey) -> Option<&Recycling> {
        self.recyclings.get(key)
    }

    pub fn audios(&self) -> impl Iterator<Item = (AudioKey, &Audio)> {
        self.audios.iter()
    }

    pub fn channels(&self) -> impl Iterator<Item = (ChannelKey, &Channel)> {
        self.channels.iter()
    }

    pub fn recyclings(&self) -> impl Iterator<Item = (RecyclingKey, &Recycling)> {
        self.recyclings.iter()
    }

    /// Output channels without a link: the lines that reach the sink.
    pub fn terminal_outputs(&self) -> impl Iterator<Item = ChannelKey> + '_ {
        self.audios.values().flat_map(move |audio| {
            audio
                .output
                .iter()
                .copied()
                .filter(move |&c| self.channels.get(c).is_some_and(|ch| ch.link.is_none()))
        })
    }

    /// Whether audio `from` reaches audio `to` by following output links.
    fn reaches(&self, from: AudioKey, to: AudioKey) -> bool {
        let mut stack = alloc::vec![from];
        let mut seen: Vec<AudioKey> = Vec::new();
        while let Some(audio) = stack.pop() {
            if audio == to {
                return true;
            }
            if seen.contains(&audio) {
                continue;
            }
            seen.push(audio);
            let Some(a) = self.audios.get(audio) else {
                continue;
            };
            for &output in &a.output {
                let next = self
                    .channels
                    .get(output)
                    .and_then(|c| c.link)
                    .and_then(|l| self.channels.get(l))
                    .map(|c| c.audio);
                if let Some(next) = next {
                    stack.push(next);
                }
            }
        }
        false
    }

    fn drop_channel(&mut self, channel: ChannelKey, removed: &mut Removed) {
        if let Err(err) = self.unlink(channel) {
            log::debug!("dropping channel {channel:?}: {err}");
            return;
        }
        let Some(ch) = self.channels.remove(channel) else {
            return;
        };
        for recycling in ch.recyclings {
            self.recyclings.remove(recycling);
            for (_, nested) in self.recyclings.iter_mut() {
                if nested.parent == Some(recycling) {
                    nested.parent = None;
                }
            }
            removed.recyclings.push(recycling);
        }
        removed.channels.push(channel);
    }
}

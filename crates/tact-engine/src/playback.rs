//! Per-channel and per-audio bookkeeping of which thread and which recall
//! id currently drive each sound scope.

use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use std::sync::{Arc, Weak};
use tact_ir::{AudioKey, ChannelKey, ChannelRole, RecallId, SOUND_SCOPE_COUNT};

/// A processing thread that can own a sound scope.
pub trait ScopeThread: Send + Sync {
    fn name(&self) -> &str;
    /// Stop the thread and wait for it to exit. Idempotent.
    fn stop(&self);
    fn is_running(&self) -> bool;
}

pub type ThreadHandle = Arc<dyn ScopeThread>;

type ThreadSlots = [Option<ThreadHandle>; SOUND_SCOPE_COUNT];

/// Replace the thread in `slot`, stopping the previous occupant first.
fn replace_thread(slots: &RefCell<ThreadSlots>, scope: usize, thread: Option<ThreadHandle>) {
    let old = slots.borrow_mut()[scope].take();
    if let Some(old) = old {
        if old.is_running() {
            log::debug!("stopping {} before replacing it", old.name());
            old.stop();
        }
    }
    slots.borrow_mut()[scope] = thread;
}

struct PlaybackState {
    channel_thread: RefCell<ThreadSlots>,
    recall_id: RefCell<[Option<Arc<RecallId>>; SOUND_SCOPE_COUNT]>,
    domain: RefCell<Weak<PlaybackDomain>>,
}

/// Shadow of one channel.
///
/// Every accessor takes the playback's re-entrant lock; no `RefCell`
/// borrow is held across a call into another object.
pub struct Playback {
    channel: ChannelKey,
    role: ChannelRole,
    state: ReentrantMutex<PlaybackState>,
}

impl Playback {
    pub fn new(channel: ChannelKey, role: ChannelRole) -> Arc<Self> {
        Arc::new(Self {
            channel,
            role,
            state: ReentrantMutex::new(PlaybackState {
                channel_thread: RefCell::new(Default::default()),
                recall_id: RefCell::new(Default::default()),
                domain: RefCell::new(Weak::new()),
            }),
        })
    }

    pub fn channel(&self) -> ChannelKey {
        self.channel
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }

    /// Install `thread` for `scope`. A running previous thread is stopped
    /// before the new one becomes visible. Out-of-range scopes are ignored.
    pub fn set_channel_thread(&self, scope: usize, thread: Option<ThreadHandle>) {
        if scope >= SOUND_SCOPE_COUNT {
            log::debug!("ignoring channel thread for scope {scope}");
            return;
        }
        let state = self.state.lock();
        replace_thread(&state.channel_thread, scope, thread);
    }

    pub fn get_channel_thread(&self, scope: usize) -> Option<ThreadHandle> {
        let state = self.state.lock();
        let threads = state.channel_thread.borrow();
        threads.get(scope)?.clone()
    }

    pub fn set_recall_id(&self, scope: usize, recall_id: Option<Arc<RecallId>>) {
        if scope >= SOUND_SCOPE_COUNT {
            return;
        }
        let state = self.state.lock();
        state.recall_id.borrow_mut()[scope] = recall_id;
    }

    pub fn get_recall_id(&self, scope: usize) -> Option<Arc<RecallId>> {
        let state = self.state.lock();
        let ids = state.recall_id.borrow();
        ids.get(scope)?.clone()
    }

    /// Domain this playback belongs to, while both are alive.
    pub fn domain(&self) -> Option<Arc<PlaybackDomain>> {
        self.state.lock().domain.borrow().upgrade()
    }

    fn set_domain(&self, domain: Weak<PlaybackDomain>) {
        *self.state.lock().domain.borrow_mut() = domain;
    }

    /// Stop every scope's thread, clear the recall ids and leave the
    /// owning domain.
    pub fn dispose(self: &Arc<Self>) {
        let domain = {
            let state = self.state.lock();
            for scope in 0..SOUND_SCOPE_COUNT {
                replace_thread(&state.channel_thread, scope, None);
            }
            *state.recall_id.borrow_mut() = Default::default();
            let domain = state.domain.borrow().upgrade();
            domain
        };
        if let Some(domain) = domain {
            domain.remove_playback(self, self.role);
        }
    }
}

struct DomainState {
    audio_thread: RefCell<ThreadSlots>,
    output: RefCell<Vec<Arc<Playback>>>,
    input: RefCell<Vec<Arc<Playback>>>,
}

impl DomainState {
    fn list(&self, role: ChannelRole) -> &RefCell<Vec<Arc<Playback>>> {
        match role {
            ChannelRole::Output => &self.output,
            ChannelRole::Input => &self.input,
        }
    }
}

/// Shadow of one audio: per-scope audio threads plus the playbacks of its
/// output and input channels.
///
/// Lock order is domain before playback. `dispose` re-enters the domain
/// lock through each playback's own `dispose`.
pub struct PlaybackDomain {
    audio: AudioKey,
    state: ReentrantMutex<DomainState>,
}

impl PlaybackDomain {
    pub fn new(audio: AudioKey) -> Arc<Self> {
        Arc::new(Self {
            audio,
            state: ReentrantMutex::new(DomainState {
                audio_thread: RefCell::new(Default::default()),
                output: RefCell::new(Vec::new()),
                input: RefCell::new(Vec::new()),
            }),
        })
    }

    pub fn audio(&self) -> AudioKey {
        self.audio
    }

    /// Same replace-and-stop semantics as [`Playback::set_channel_thread`].
    pub fn set_audio_thread(&self, scope: usize, thread: Option<ThreadHandle>) {
        if scope >= SOUND_SCOPE_COUNT {
            log::debug!("ignoring audio thread for scope {scope}");
            return;
        }
        let state = self.state.lock();
        replace_thread(&state.audio_thread, scope, thread);
    }

    pub fn get_audio_thread(&self, scope: usize) -> Option<ThreadHandle> {
        let state = self.state.lock();
        let threads = state.audio_thread.borrow();
        threads.get(scope)?.clone()
    }

    /// Insert `playback` into the list for `role` and point it back at
    /// this domain, in one step under the domain lock.
    ///
    /// Already present, mismatched role, or owned by another domain: the
    /// call is ignored.
    pub fn add_playback(self: &Arc<Self>, playback: &Arc<Playback>, role: ChannelRole) {
        let state = self.state.lock();
        if playback.role() != role {
            log::warn!("ignoring {:?} playback added as {:?}", playback.role(), role);
            return;
        }
        if let Some(owner) = playback.domain() {
            if !Arc::ptr_eq(&owner, self) {
                log::warn!("ignoring playback owned by another domain");
                return;
            }
        }
        {
            let mut list = state.list(role).borrow_mut();
            if list.iter().any(|p| Arc::ptr_eq(p, playback)) {
                return;
            }
            list.push(playback.clone());
        }
        playback.set_domain(Arc::downgrade(self));
    }

    /// Remove `playback` from the list for `role` and clear its
    /// back-reference. Returns whether it was present.
    pub fn remove_playback(&self, playback: &Arc<Playback>, role: ChannelRole) -> bool {
        let state = self.state.lock();
        let removed = {
            let mut list = state.list(role).borrow_mut();
            let before = list.len();
            list.retain(|p| !Arc::ptr_eq(p, playback));
            list.len() != before
        };
        if removed {
            playback.set_domain(Weak::new());
        }
        removed
    }

    pub fn playbacks(&self, role: ChannelRole) -> Vec<Arc<Playback>> {
        self.state.lock().list(role).borrow().clone()
    }

    /// Stop the audio threads and dispose every child playback.
    pub fn dispose(&self) {
        let state = self.state.lock();
        for scope in 0..SOUND_SCOPE_COUNT {
            replace_thread(&state.audio_thread, scope, None);
        }
        for role in [ChannelRole::Output, ChannelRole::Input] {
            let playbacks = state.list(role).borrow().clone();
            for playback in playbacks {
                playback.dispose();
            }
        }
    }
}

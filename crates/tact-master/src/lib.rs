//! Headless controller for the tact recall scheduler.
//!
//! Owns a [`Session`], drives it from its own thread at the soundcard
//! cadence, and renders offline to memory or WAV. Shared by the CLI and
//! by embedders.

mod wav;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

// Re-export common types so callers don't need tact-engine directly.
pub use tact_audio::{AudioError, AudioSink, MemorySink, WrittenBlock};
pub use tact_engine::{EngineError, Session, TaskSender, TickReport};
pub use tact_ir::{AudioKey, SoundConfig, SoundScope, Timestamp};

pub use wav::{blocks_to_wav, write_wav};

/// Builds the sink on the playback thread; device streams are bound to
/// the thread that opened them.
pub type SinkFactory = Box<dyn FnOnce(&SoundConfig) -> Result<Box<dyn AudioSink>, AudioError> + Send>;

/// Notifications kept for readers that fall behind; older ones are dropped.
pub const NOTIFY_CAPACITY: usize = 256;

/// Events published by the playback thread.
#[derive(Clone, Debug, PartialEq)]
pub enum Notification {
    /// A tick completed.
    Tick { tick: u64, outputs: usize, failures: usize },
    /// Every instance of a playback scope finished.
    Released { audio: AudioKey, scope: SoundScope },
    /// The session hit a structural error and stopped.
    Aborted(String),
}

/// Headless controller: owns a session and manages playback.
pub struct Controller {
    session: Arc<Mutex<Session>>,
    tasks: TaskSender,
    playback: Option<PlaybackHandle>,
    notifier: Notifier,
}

/// Bounded event queue that evicts the oldest entry when full.
#[derive(Clone)]
struct Notifier {
    tx: Sender<Notification>,
    rx: Receiver<Notification>,
}

impl Notifier {
    fn new() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(NOTIFY_CAPACITY);
        Self { tx, rx }
    }

    fn send(&self, mut event: Notification) {
        loop {
            match self.tx.try_send(event) {
                Ok(()) => return,
                Err(TrySendError::Full(back)) => {
                    let _ = self.rx.try_recv();
                    event = back;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    fn publish(&self, report: &TickReport) {
        self.send(Notification::Tick {
            tick: report.tick,
            outputs: report.outputs,
            failures: report.failures.len(),
        });
        for &(audio, scope) in &report.released {
            self.send(Notification::Released { audio, scope });
        }
    }
}

struct PlaybackHandle {
    stop_signal: Arc<AtomicBool>,
    current_tick: Arc<AtomicU64>,
    finished: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Controller {
    pub fn new(config: SoundConfig) -> Result<Self, EngineError> {
        let session = Session::new(config)?;
        let tasks = session.tasks().sender();
        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            tasks,
            playback: None,
            notifier: Notifier::new(),
        })
    }

    /// Run `f` with exclusive access to the session. Blocks for at most
    /// one tick while playing.
    pub fn with_session<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
        f(&mut self.session.lock())
    }

    /// Queue for graph changes applied between ticks.
    pub fn tasks(&self) -> TaskSender {
        self.tasks.clone()
    }

    /// Events from the playback thread. At most [`NOTIFY_CAPACITY`] are
    /// queued; receivers share one queue.
    pub fn notifications(&self) -> Receiver<Notification> {
        self.notifier.rx.clone()
    }

    // --- Real-time playback ---

    /// Start ticking at the configured cadence into the sink built by
    /// `sink_factory`.
    pub fn play(&mut self, sink_factory: SinkFactory) {
        self.stop();

        let stop_signal = Arc::new(AtomicBool::new(false));
        let current_tick = Arc::new(AtomicU64::new(self.session.lock().current_tick()));
        let finished = Arc::new(AtomicBool::new(false));

        let session = self.session.clone();
        let notify = self.notifier.clone();
        let stop = stop_signal.clone();
        let tick = current_tick.clone();
        let done = finished.clone();

        let thread = std::thread::Builder::new()
            .name("tact-audio-loop".into())
            .spawn(move || audio_thread(session, sink_factory, notify, stop, tick, done));
        let thread = match thread {
            Ok(thread) => Some(thread),
            Err(err) => {
                log::error!("cannot spawn playback thread: {err}");
                finished.store(true, Ordering::Relaxed);
                None
            }
        };

        self.playback = Some(PlaybackHandle {
            stop_signal,
            current_tick,
            finished,
            thread,
        });
    }

    /// Play on the default sound device.
    #[cfg(feature = "cpal")]
    pub fn play_device(&mut self) {
        self.play(Box::new(
            |config: &SoundConfig| -> Result<Box<dyn AudioSink>, AudioError> {
                Ok(Box::new(tact_audio::CpalSink::new(config)?))
            },
        ));
    }

    pub fn stop(&mut self) {
        if let Some(mut pb) = self.playback.take() {
            pb.stop_signal.store(true, Ordering::Relaxed);
            if let Some(handle) = pb.thread.take() {
                let _ = handle.join();
            }
        }
    }

    pub fn is_playing(&self) -> bool {
        self.playback
            .as_ref()
            .is_some_and(|p| !p.finished.load(Ordering::Relaxed))
    }

    pub fn is_finished(&self) -> bool {
        self.playback
            .as_ref()
            .is_some_and(|p| p.finished.load(Ordering::Relaxed))
    }

    /// Frame offset of the tick the playback thread is about to run.
    pub fn position(&self) -> Option<Timestamp> {
        let pb = self.playback.as_ref()?;
        if pb.finished.load(Ordering::Relaxed) {
            return None;
        }
        let tick = pb.current_tick.load(Ordering::Relaxed);
        let buffer_size = self.session.lock().config().buffer_size;
        Some(Timestamp::from_tick(tick, buffer_size))
    }

    // --- Offline rendering ---

    /// Run `ticks` ticks as fast as possible into a memory sink. Stops
    /// real-time playback first.
    pub fn render_ticks(&mut self, ticks: u64) -> Result<MemorySink, EngineError> {
        self.stop();
        let mut sink = MemorySink::new();
        let mut session = self.session.lock();
        for _ in 0..ticks {
            let report = session.tick(&mut sink)?;
            self.notifier.publish(&report);
        }
        Ok(sink)
    }

    pub fn render_to_wav(&mut self, ticks: u64) -> Result<Vec<u8>, EngineError> {
        let sink = self.render_ticks(ticks)?;
        let config = self.session.lock().config();
        Ok(wav::blocks_to_wav(sink.blocks(), &config))
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.stop();
        self.session.lock().shutdown();
    }
}

fn audio_thread(
    session: Arc<Mutex<Session>>,
    sink_factory: SinkFactory,
    notify: Notifier,
    stop_signal: Arc<AtomicBool>,
    current_tick: Arc<AtomicU64>,
    finished: Arc<AtomicBool>,
) {
    let config = session.lock().config();
    let mut sink = match sink_factory(&config) {
        Ok(sink) => sink,
        Err(err) => {
            log::error!("cannot open sink: {err}");
            finished.store(true, Ordering::Relaxed);
            return;
        }
    };

    let mut deadline = Instant::now();
    while !stop_signal.load(Ordering::Relaxed) {
        let result = {
            let mut session = session.lock();
            let result = session.tick(sink.as_mut());
            current_tick.store(session.current_tick(), Ordering::Relaxed);
            // a reconfiguration changes the cadence from the next tick on
            (result, session.config().tick_duration())
        };
        match result {
            (Ok(report), period) => {
                for err in &report.errors {
                    log::warn!("tick {}: {err}", report.tick);
                }
                notify.publish(&report);
                deadline += period;
            }
            (Err(err), _) => {
                log::error!("playback stopped: {err}");
                notify.send(Notification::Aborted(err.to_string()));
                break;
            }
        }

        let now = Instant::now();
        if deadline > now {
            std::thread::sleep(deadline - now);
        } else {
            // late; don't try to catch up
            deadline = now;
        }
    }
    finished.store(true, Ordering::Relaxed);
}

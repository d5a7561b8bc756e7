//! Dialog UX state: one coarse state derived from ASR, TTS, session and
//! connection signals.
//!
//! Inputs are queued to a single actor task, so the state machine never runs
//! concurrently with itself and listeners see changes strictly in order.
//! Entering [`DialogUxState::Idle`] is debounced: a multi-turn dialog that
//! re-opens the microphone right after speaking never flickers to idle.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{Instrument, Span};

use crate::observer::ObserverRegistry;
use crate::scheduler::TaskScheduler;
use crate::session::{Session, SessionListener};
use crate::settings::Settings;

/// Speech recognizer state as reported by the ASR agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AsrState {
    #[default]
    Idle,
    ExpectingSpeech,
    Listening,
    Recognizing,
    Busy,
}

/// Speech synthesis state as reported by the TTS agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TtsState {
    #[default]
    Idle,
    Playing,
    Stopped,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Connected,
    Connecting,
    Disconnected,
}

/// Coarse state shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DialogUxState {
    #[default]
    Idle,
    /// The user is speaking.
    Listening,
    /// The microphone is open, waiting for speech.
    Expecting,
    /// Waiting for the server to answer.
    Thinking,
    Speaking,
}

/// What listeners receive: the state and whether a session is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DialogUxSnapshot {
    pub state: DialogUxState,
    pub dialog_mode: bool,
}

/// Observer of dialog UX changes. Called from the aggregator's task; must
/// not block.
pub trait DialogUxStateListener: Send + Sync {
    fn on_dialog_ux_state_changed(&self, snapshot: DialogUxSnapshot);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Asr(AsrState),
    Tts(TtsState),
    TtsTextReceived,
    Connection(ConnectionStatus),
    SessionOpened,
    SessionClosed,
}

/// The state machine proper, free of channels and timers.
#[derive(Debug)]
struct Machine {
    asr: AsrState,
    tts: TtsState,
    tts_preparing: bool,
    dialog_mode: bool,
    state: DialogUxState,
    idle_deadline: Option<Instant>,
    debounce: Duration,
}

impl Machine {
    fn new(debounce: Duration) -> Self {
        Self {
            asr: AsrState::Idle,
            tts: TtsState::Idle,
            tts_preparing: false,
            dialog_mode: false,
            state: DialogUxState::Idle,
            idle_deadline: None,
            debounce,
        }
    }

    fn snapshot(&self) -> DialogUxSnapshot {
        DialogUxSnapshot {
            state: self.state,
            dialog_mode: self.dialog_mode,
        }
    }

    fn can_idle(&self) -> bool {
        self.asr == AsrState::Idle && self.tts != TtsState::Playing && !self.tts_preparing
    }

    fn enter(&mut self, state: DialogUxState) {
        self.idle_deadline = None;
        self.state = state;
    }

    fn try_idle(&mut self, now: Instant) {
        if !self.can_idle() {
            return;
        }
        if self.debounce.is_zero() {
            self.enter(DialogUxState::Idle);
        } else {
            self.idle_deadline = Some(now + self.debounce);
        }
    }

    fn apply(&mut self, event: Event, now: Instant) {
        match event {
            Event::Asr(asr) => {
                self.asr = asr;
                match asr {
                    AsrState::Recognizing => self.enter(DialogUxState::Listening),
                    AsrState::Listening | AsrState::ExpectingSpeech => {
                        self.enter(DialogUxState::Expecting);
                    }
                    AsrState::Busy => self.enter(DialogUxState::Thinking),
                    AsrState::Idle => self.try_idle(now),
                }
            }
            Event::Tts(tts) => {
                self.tts = tts;
                match tts {
                    TtsState::Playing => {
                        self.tts_preparing = false;
                        self.enter(DialogUxState::Speaking);
                    }
                    // Speech cancelled before it played ends the preparation too.
                    TtsState::Stopped | TtsState::Finished => {
                        self.tts_preparing = false;
                        self.try_idle(now);
                    }
                    TtsState::Idle => self.try_idle(now),
                }
            }
            Event::TtsTextReceived => {
                self.tts_preparing = true;
                self.idle_deadline = None;
            }
            Event::Connection(ConnectionStatus::Disconnected) => {
                self.tts_preparing = false;
                self.enter(DialogUxState::Idle);
            }
            Event::Connection(_) => {}
            Event::SessionOpened => self.dialog_mode = true,
            Event::SessionClosed => self.dialog_mode = false,
        }
    }

    /// The debounce elapsed: go idle unless activity resumed.
    fn on_deadline(&mut self) {
        self.idle_deadline = None;
        if self.can_idle() {
            self.state = DialogUxState::Idle;
        }
    }
}

async fn run(
    mut machine: Machine,
    mut events: mpsc::UnboundedReceiver<Event>,
    published: watch::Sender<DialogUxSnapshot>,
    listeners: Arc<ObserverRegistry<dyn DialogUxStateListener>>,
) {
    loop {
        let deadline = machine.idle_deadline;
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Some(event) => {
                    tracing::trace!(?event, "Dialog UX input");
                    machine.apply(event, Instant::now());
                }
                None => break,
            },
            () = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                machine.on_deadline();
            }
        }

        let snapshot = machine.snapshot();
        if *published.borrow() != snapshot {
            tracing::debug!(state = ?snapshot.state, dialog_mode = snapshot.dialog_mode, "Dialog UX state changed");
            // Listeners first: a subscriber that sees the new value can rely on
            // every listener having seen it too.
            listeners.notify(|l| l.on_dialog_ux_state_changed(snapshot));
            published.send_replace(snapshot);
        }
    }
    tracing::debug!("Dialog UX aggregator stopped");
}

/// Derives the coarse dialog UX state.
///
/// Input methods never block: they queue to the aggregator's task and return.
pub struct DialogUxStateAggregator {
    events: mpsc::UnboundedSender<Event>,
    current: watch::Receiver<DialogUxSnapshot>,
    listeners: Arc<ObserverRegistry<dyn DialogUxStateListener>>,
}

impl DialogUxStateAggregator {
    /// Start the aggregator task on `scheduler`'s runtime.
    pub fn spawn(scheduler: &TaskScheduler, idle_debounce: Duration) -> Self {
        Self::spawn_with_span(scheduler, idle_debounce, tracing::info_span!("dialog_ux"))
    }

    pub fn from_settings(scheduler: &TaskScheduler, settings: &Settings) -> Self {
        Self::spawn(scheduler, settings.effective_ux_idle_debounce())
    }

    pub fn spawn_with_span(scheduler: &TaskScheduler, idle_debounce: Duration, span: Span) -> Self {
        let (events, receiver) = mpsc::unbounded_channel();
        let (published, current) = watch::channel(DialogUxSnapshot::default());
        let listeners = Arc::new(ObserverRegistry::new());

        scheduler.handle().spawn(
            run(
                Machine::new(idle_debounce),
                receiver,
                published,
                Arc::clone(&listeners),
            )
            .instrument(span),
        );

        Self {
            events,
            current,
            listeners,
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn DialogUxStateListener>) -> bool {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, listener: &Arc<dyn DialogUxStateListener>) -> bool {
        self.listeners.remove(listener)
    }

    /// Last published snapshot.
    pub fn current(&self) -> DialogUxSnapshot {
        *self.current.borrow()
    }

    /// Channel following every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<DialogUxSnapshot> {
        self.current.clone()
    }

    pub fn on_asr_state_changed(&self, state: AsrState) {
        self.push(Event::Asr(state));
    }

    pub fn on_tts_state_changed(&self, state: TtsState) {
        self.push(Event::Tts(state));
    }

    /// Text for the next utterance arrived; speech is about to start.
    pub fn on_tts_text_received(&self) {
        self.push(Event::TtsTextReceived);
    }

    pub fn on_connection_status_changed(&self, status: ConnectionStatus) {
        self.push(Event::Connection(status));
    }

    pub fn on_session_opened(&self) {
        self.push(Event::SessionOpened);
    }

    pub fn on_session_closed(&self) {
        self.push(Event::SessionClosed);
    }

    fn push(&self, event: Event) {
        if self.events.send(event).is_err() {
            tracing::warn!(?event, "Dialog UX aggregator is not running");
        }
    }
}

impl SessionListener for DialogUxStateAggregator {
    fn on_session_activated(&self, _key: &str, _session: &Session) {
        self.on_session_opened();
    }

    fn on_session_deactivated(&self, _key: &str, _session: &Session) {
        self.on_session_closed();
    }
}

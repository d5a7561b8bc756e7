//! End-to-end dialog turns over every runtime component.
//!
//! One turn: the microphone opens, a capture consumer reads 100 ms of audio,
//! the turn's context is assembled, and a directive group (session, speech,
//! card) is dispatched and played out under play sync. The UX aggregator
//! follows along and the run ends once it settles back to idle.

use std::f32::consts::TAU;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cadence_audio::{
    AudioError, AudioFormat, AudioProvider, AudioRingStream, AudioSource, ConsumerId, ReadOutcome,
    SharedAudioProvider,
};
use cadence_core::utils::lock;
use cadence_core::{
    AsrState, ConnectionStatus, ContextAggregator, ContextRequestError, ContextRequester,
    DialogUxSnapshot, DialogUxState, DialogUxStateAggregator, DialogUxStateListener, Directive,
    DirectiveEvent, DirectiveSequencer, DirectiveSequencerListener, Header, PlaySynchronizer,
    SessionListener, SessionManager, Settings, TaskScheduler, validate_settings,
};
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;

use crate::agents::{DisplayAgent, SessionAgent, SpeakerAgent};
use crate::error::CliError;

/// How long each simulated utterance plays.
const SPEAK_FOR: Duration = Duration::from_millis(300);

/// How long a card stays up after the rest of its turn ended.
const CARD_LINGER: Duration = Duration::from_millis(150);

/// Milliseconds of audio captured per turn.
const CAPTURE_MS: u64 = 100;

/// Slack on top of the expected turn length before giving up.
const SETTLE_SLACK: Duration = Duration::from_secs(2);

const TONE_HZ: f32 = 440.0;
const TONE_AMPLITUDE: f32 = 8_000.0;

/// Outcome of one dialog turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnReport {
    pub dialog_request_id: String,
    /// Assembled context, or `None` if the request failed.
    pub context: Option<serde_json::Value>,
    pub audio_bytes: usize,
    /// Sessions active once the turn's directives completed.
    pub active_sessions: usize,
}

/// Outcome of a simulation run.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub turns: Vec<TurnReport>,
    pub directives_completed: usize,
    pub directives_failed: usize,
    /// Every UX snapshot published during the run, in order.
    pub ux_states: Vec<DialogUxSnapshot>,
}

// ── Audio source ───────────────────────────────────────────────────

/// Paced sine tone in 16-bit little-endian mono.
struct ToneSource {
    format: AudioFormat,
    phase: f32,
    open: bool,
}

impl ToneSource {
    fn new() -> Self {
        Self {
            format: AudioFormat::default(),
            phase: 0.0,
            open: false,
        }
    }
}

impl AudioSource for ToneSource {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn open(&mut self) -> Result<(), AudioError> {
        self.open = true;
        Ok(())
    }

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, AudioError> {
        if !self.open {
            return Err(AudioError::Source("tone source is closed".to_string()));
        }

        let rate = self.format.sample_rate as f32;
        let step = TONE_HZ * TAU / rate;
        let mut written = 0;
        for frame in buf.chunks_exact_mut(2) {
            let sample = (self.phase.sin() * TONE_AMPLITUDE) as i16;
            frame.copy_from_slice(&sample.to_le_bytes());
            self.phase = (self.phase + step) % TAU;
            written += 2;
        }

        // Real devices deliver in real time.
        std::thread::sleep(Duration::from_secs_f32((written / 2) as f32 / rate));
        Ok(written)
    }

    fn close(&mut self) {
        self.open = false;
    }
}

fn capture(
    provider: &SharedAudioProvider<ToneSource>,
    consumer: &ConsumerId,
) -> Result<Arc<AudioRingStream>, CliError> {
    provider
        .acquire(consumer)
        .ok_or_else(|| CliError::Runtime("audio source failed to start".to_string()))
}

// ── Observers ──────────────────────────────────────────────────────

#[derive(Default)]
struct UxRecorder {
    snapshots: Mutex<Vec<DialogUxSnapshot>>,
}

impl DialogUxStateListener for UxRecorder {
    fn on_dialog_ux_state_changed(&self, snapshot: DialogUxSnapshot) {
        tracing::info!(state = ?snapshot.state, dialog_mode = snapshot.dialog_mode, "Dialog UX");
        lock(&self.snapshots).push(snapshot);
    }
}

#[derive(Default)]
struct DirectiveTally {
    completed: Mutex<usize>,
    failed: Mutex<usize>,
}

impl DirectiveSequencerListener for DirectiveTally {
    fn on_directive_event(&self, event: &DirectiveEvent) {
        let directive = event.directive();
        match event {
            DirectiveEvent::Completed(_) => {
                *lock(&self.completed) += 1;
                tracing::debug!(message_id = %directive.message_id(), "Directive completed");
            }
            DirectiveEvent::Failed { description, .. } => {
                *lock(&self.failed) += 1;
                tracing::warn!(message_id = %directive.message_id(), %description, "Directive failed");
            }
            DirectiveEvent::Requested(_) | DirectiveEvent::Canceled(_) | DirectiveEvent::Skipped(_) => {
                tracing::trace!(message_id = %directive.message_id(), ?event, "Directive event");
            }
        }
    }
}

/// Forwards the context request's single answer to the waiting turn.
struct ChannelRequester {
    tx: mpsc::UnboundedSender<Result<String, ContextRequestError>>,
}

impl ContextRequester for ChannelRequester {
    fn on_context_available(&self, context: String) {
        let _ = self.tx.send(Ok(context));
    }

    fn on_context_failure(&self, error: ContextRequestError) {
        let _ = self.tx.send(Err(error));
    }
}

// ── Runtime ────────────────────────────────────────────────────────

struct Runtime {
    settings: Settings,
    sequencer: DirectiveSequencer,
    sync: Arc<PlaySynchronizer>,
    context: ContextAggregator,
    sessions: Arc<SessionManager>,
    ux: Arc<DialogUxStateAggregator>,
    audio: SharedAudioProvider<ToneSource>,
    session_agent: Arc<SessionAgent>,
    recorder: Arc<UxRecorder>,
    tally: Arc<DirectiveTally>,
}

impl Runtime {
    fn wire(settings: &Settings, scheduler: &TaskScheduler) -> Result<Self, CliError> {
        let sync = Arc::new(PlaySynchronizer::new());
        let context = ContextAggregator::new(scheduler.clone());
        let sessions = Arc::new(SessionManager::from_settings(scheduler.clone(), settings));
        let ux = Arc::new(DialogUxStateAggregator::from_settings(scheduler, settings));

        let ux_sessions: Arc<dyn SessionListener> = ux.clone();
        sessions.add_listener(ux_sessions);
        let recorder = Arc::new(UxRecorder::default());
        ux.add_listener(recorder.clone());

        let speaker = SpeakerAgent::new(
            Arc::clone(&sync),
            Arc::clone(&ux),
            scheduler.clone(),
            context.setter(),
            SPEAK_FOR,
        );
        let display = DisplayAgent::new(Arc::clone(&sync), scheduler.clone(), CARD_LINGER);
        let session_agent = SessionAgent::new(Arc::clone(&sessions));

        context.add_provider(speaker.clone());
        context.add_provider(display.clone());

        let sequencer = DirectiveSequencer::new();
        sequencer
            .add_handler(speaker)
            .and_then(|()| sequencer.add_handler(display))
            .and_then(|()| sequencer.add_handler(session_agent.clone()))
            .map_err(|e| CliError::Runtime(e.to_string()))?;
        let tally = Arc::new(DirectiveTally::default());
        sequencer.add_listener(tally.clone());

        let audio = SharedAudioProvider::new(
            ToneSource::new(),
            settings.effective_audio_buffer_capacity(),
            scheduler.handle().clone(),
        );

        Ok(Self {
            settings: settings.clone(),
            sequencer,
            sync,
            context,
            sessions,
            ux,
            audio,
            session_agent,
            recorder,
            tally,
        })
    }

    /// Open the microphone and read [`CAPTURE_MS`] worth of audio.
    async fn listen(&self) -> Result<usize, CliError> {
        let consumer = ConsumerId::new("asr");
        self.ux.on_asr_state_changed(AsrState::ExpectingSpeech);

        let stream = capture(&self.audio, &consumer)?;
        let mut reader = stream.create_reader(None).map_err(CliError::from)?;
        self.ux.on_asr_state_changed(AsrState::Listening);

        let bytes = usize::try_from(self.audio.format().bytes_per_second() * CAPTURE_MS / 1_000)
            .map_err(|e| CliError::Runtime(e.to_string()))?;
        let read = tokio::task::spawn_blocking(move || -> Result<usize, AudioError> {
            let mut buf = vec![0u8; bytes];
            match reader.read(&mut buf)? {
                ReadOutcome::Data(n) => Ok(n),
                ReadOutcome::Overrun => {
                    let position = reader.resync();
                    tracing::warn!(position, "Capture overrun, resynchronized");
                    Ok(0)
                }
                ReadOutcome::Underrun | ReadOutcome::Eos => Ok(0),
            }
        })
        .await
        .map_err(|e| CliError::Runtime(format!("capture task failed: {e}")));

        self.ux.on_asr_state_changed(AsrState::Recognizing);
        self.audio.release(&consumer);
        let read: Result<usize, AudioError> = read?;
        Ok(read?)
    }

    /// Assemble the turn's context.
    async fn request_context(&self) -> Option<serde_json::Value> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let token = self.context.get_context(
            Arc::new(ChannelRequester { tx }),
            None,
            self.settings.effective_context_request_timeout(),
        );

        match rx.recv().await {
            Some(Ok(context)) => serde_json::from_str(&context).ok(),
            Some(Err(e)) => {
                tracing::warn!(token, error = %e, "Context request failed");
                None
            }
            None => None,
        }
    }

    async fn turn(&self, index: usize) -> Result<TurnReport, CliError> {
        let dialog_request_id = format!("dialog-{index}");
        tracing::info!(%dialog_request_id, "Turn started");

        let audio_bytes = self.listen().await?;
        self.ux.on_asr_state_changed(AsrState::Busy);
        let context = self.request_context().await;

        self.sequencer.on_directives(directive_group(&dialog_request_id, index));
        self.ux.on_asr_state_changed(AsrState::Idle);

        let settled = tokio::time::timeout(SPEAK_FOR + CARD_LINGER + SETTLE_SLACK, async {
            while !self.sequencer.is_idle() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        if settled.is_err() {
            return Err(CliError::Runtime(format!(
                "{dialog_request_id}: {} directive(s) never completed",
                self.sequencer.pending_count()
            )));
        }

        let active_sessions = self.sessions.get_active_sessions().len();
        self.sessions
            .deactivate(&dialog_request_id, self.session_agent.requester());
        tracing::info!(
            %dialog_request_id,
            audio_bytes,
            active_sessions,
            sync_contexts = self.sync.context_count(),
            "Turn finished"
        );

        Ok(TurnReport {
            dialog_request_id,
            context,
            audio_bytes,
            active_sessions,
        })
    }

    /// Wait until the UX is idle with no dialog open.
    async fn settle(&self) -> Result<(), CliError> {
        let mut rx = self.ux.subscribe();
        let idle = DialogUxSnapshot {
            state: DialogUxState::Idle,
            dialog_mode: false,
        };
        let limit = self.settings.effective_ux_idle_debounce() + SETTLE_SLACK;
        match tokio::time::timeout(limit, rx.wait_for(|s| *s == idle)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(CliError::Runtime("dialog UX aggregator stopped".to_string())),
            Err(_) => Err(CliError::Runtime(format!(
                "dialog UX did not settle: {:?}",
                self.ux.current()
            ))),
        }
    }
}

fn directive_group(dialog_request_id: &str, index: usize) -> Vec<Directive> {
    let header = |namespace: &str, name: &str, suffix: &str| {
        Header::new(namespace, name, format!("{dialog_request_id}-{suffix}"), dialog_request_id)
    };
    vec![
        Directive::new(
            header("Session", "Set", "session"),
            json!({ "sessionId": format!("session-{index}"), "playServiceId": "simulator" }).to_string(),
        ),
        Directive::new(
            header("TTS", "Speak", "speak"),
            json!({ "text": format!("Answer number {index}") }).to_string(),
        ),
        Directive::new(
            header("Display", "Card", "card"),
            json!({ "title": format!("Card {index}") }).to_string(),
        ),
    ]
}

/// Run `turns` dialog turns and report what every component did.
///
/// Must be called from within a tokio runtime.
pub async fn run_simulation(settings: &Settings, turns: usize) -> Result<SimulationReport, CliError> {
    validate_settings(settings)?;
    let scheduler = TaskScheduler::current()?;
    let runtime = Runtime::wire(settings, &scheduler)?;

    runtime.ux.on_connection_status_changed(ConnectionStatus::Connected);

    let mut reports = Vec::with_capacity(turns);
    for index in 1..=turns {
        reports.push(runtime.turn(index).await?);
    }
    runtime.settle().await?;

    let ux_states = lock(&runtime.recorder.snapshots).clone();
    let directives_completed = *lock(&runtime.tally.completed);
    let directives_failed = *lock(&runtime.tally.failed);

    Ok(SimulationReport {
        turns: reports,
        directives_completed,
        directives_failed,
        ux_states,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directive_group_shares_dialog_request_id() {
        let group = directive_group("dialog-7", 7);
        assert_eq!(group.len(), 3);
        assert!(group.iter().all(|d| d.dialog_request_id() == "dialog-7"));
        assert_eq!(group[1].message_id(), "dialog-7-speak");

        let session: cadence_core::Session = serde_json::from_str(group[0].payload()).unwrap();
        assert_eq!(session.session_id, "session-7");
    }

    #[test]
    fn tone_source_requires_open() {
        let mut source = ToneSource::new();
        let mut buf = [0u8; 4];
        assert!(source.read(&mut buf).is_err());
        source.open().unwrap();
        assert_eq!(source.read(&mut buf).unwrap(), 4);
        source.close();
        assert!(source.read(&mut buf).is_err());
    }
}

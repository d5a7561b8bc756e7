//! Simulated capability agents.
//!
//! Each agent handles one directive kind the way a real one would: it joins
//! play sync on pre-handle, starts on handle, and reports a result when its
//! work ends. Playback and display time are timers on the shared scheduler.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use cadence_core::utils::lock;
use cadence_core::{
    BlockingPolicy, CancelPolicy, ContextSetter, ContextStateProvider, ContextType,
    DialogUxStateAggregator, DirectiveHandler, DirectiveInfo, Medium, NamespaceAndName,
    OnRequestSyncListener, PlaySynchronizer, Requester, Session, SessionManager,
    StateRefreshPolicy, SynchronizeObject, TaskScheduler, TimerHandle, TtsState,
};
use serde_json::json;

/// Logs the answer to a sync request.
struct SyncLog {
    what: &'static str,
    message_id: String,
}

impl OnRequestSyncListener for SyncLog {
    fn on_granted(&self) {
        tracing::trace!(what = self.what, message_id = %self.message_id, "Sync granted");
    }

    fn on_denied(&self) {
        tracing::debug!(what = self.what, message_id = %self.message_id, "Sync denied");
    }
}

fn sync_log(what: &'static str, message_id: &str) -> SyncLog {
    SyncLog {
        what,
        message_id: message_id.to_string(),
    }
}

// ── Speaker ────────────────────────────────────────────────────────

/// Play-sync member for one utterance.
struct Utterance {
    dialog_request_id: String,
    message_id: String,
    agent: Weak<SpeakerAgent>,
}

impl SynchronizeObject for Utterance {
    fn dialog_request_id(&self) -> String {
        self.dialog_request_id.clone()
    }

    fn request_release_sync(&self, immediate: bool) {
        if immediate && let Some(agent) = self.agent.upgrade() {
            agent.stop(&self.message_id);
        }
    }

    fn on_sync_state_changed(
        &self,
        _prepared: &[Arc<dyn SynchronizeObject>],
        _started: &[Arc<dyn SynchronizeObject>],
    ) {
    }
}

struct Playback {
    info: DirectiveInfo,
    utterance: Arc<dyn SynchronizeObject>,
    timer: Option<TimerHandle>,
}

/// Handles `TTS.Speak`: occupies the audio medium for `speak_for`.
pub struct SpeakerAgent {
    me: Weak<Self>,
    sync: Arc<PlaySynchronizer>,
    ux: Arc<DialogUxStateAggregator>,
    scheduler: TaskScheduler,
    setter: ContextSetter,
    speak_for: Duration,
    playbacks: Mutex<HashMap<String, Playback>>,
    last_text: Mutex<Option<String>>,
}

impl SpeakerAgent {
    pub const DIRECTIVE: (&'static str, &'static str) = ("TTS", "Speak");

    pub fn new(
        sync: Arc<PlaySynchronizer>,
        ux: Arc<DialogUxStateAggregator>,
        scheduler: TaskScheduler,
        setter: ContextSetter,
        speak_for: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            sync,
            ux,
            scheduler,
            setter,
            speak_for,
            playbacks: Mutex::default(),
            last_text: Mutex::default(),
        })
    }

    fn state_json(&self) -> String {
        let playing = !lock(&self.playbacks).is_empty();
        json!({
            "ttsActivity": if playing { "PLAYING" } else { "IDLE" },
            "lastText": *lock(&self.last_text),
        })
        .to_string()
    }

    fn publish_state(&self) {
        let state = self.state_json();
        let result = self.setter.set_state(
            &self.namespace_and_name(),
            state,
            StateRefreshPolicy::Always,
            ContextType::Full,
            None,
        );
        tracing::trace!(?result, "Speaker state published");
    }

    /// Playback reached its end.
    fn finish(&self, message_id: &str) {
        let Some(playback) = lock(&self.playbacks).remove(message_id) else {
            return;
        };

        self.sync
            .release_sync(&playback.utterance, &sync_log("speech", message_id));
        self.ux.on_tts_state_changed(TtsState::Finished);
        self.publish_state();

        if let Err(e) = playback.info.result.set_completed() {
            tracing::debug!(%message_id, error = %e, "Speech result not delivered");
        }
    }

    /// Playback was cut short by the rest of the turn.
    fn stop(&self, message_id: &str) {
        let Some(playback) = lock(&self.playbacks).remove(message_id) else {
            return;
        };
        drop(playback.timer);

        self.sync.release_without_sync(&playback.utterance);
        self.ux.on_tts_state_changed(TtsState::Stopped);

        if !playback.info.result.is_cancelled()
            && let Err(e) = playback
                .info
                .result
                .set_failed("Playback stopped", CancelPolicy::none())
        {
            tracing::debug!(%message_id, error = %e, "Speech result not delivered");
        }
    }
}

impl DirectiveHandler for SpeakerAgent {
    fn configurations(&self) -> HashMap<NamespaceAndName, BlockingPolicy> {
        let (namespace, name) = Self::DIRECTIVE;
        HashMap::from([(
            NamespaceAndName::new(namespace, name),
            BlockingPolicy::new(Medium::AUDIO, Medium::AUDIO),
        )])
    }

    fn pre_handle_directive(&self, info: DirectiveInfo) {
        let message_id = info.directive.message_id().to_string();
        let text = serde_json::from_str::<serde_json::Value>(info.directive.payload())
            .ok()
            .and_then(|v| v.get("text").and_then(|t| t.as_str()).map(str::to_string));
        *lock(&self.last_text) = text;

        let utterance: Arc<dyn SynchronizeObject> = Arc::new(Utterance {
            dialog_request_id: info.directive.dialog_request_id().to_string(),
            message_id: message_id.clone(),
            agent: self.me.clone(),
        });
        self.ux.on_tts_text_received();
        self.sync.prepare_sync(&utterance);

        lock(&self.playbacks).insert(
            message_id,
            Playback {
                info,
                utterance,
                timer: None,
            },
        );
    }

    fn handle_directive(&self, message_id: &str) -> bool {
        let Some(utterance) = lock(&self.playbacks)
            .get(message_id)
            .map(|p| Arc::clone(&p.utterance))
        else {
            return false;
        };

        self.sync.start_sync(&utterance, &sync_log("speech", message_id));
        self.ux.on_tts_state_changed(TtsState::Playing);

        let me = self.me.clone();
        let id = message_id.to_string();
        let timer = self.scheduler.schedule(self.speak_for, move || {
            if let Some(agent) = me.upgrade() {
                agent.finish(&id);
            }
        });
        if let Some(playback) = lock(&self.playbacks).get_mut(message_id) {
            playback.timer = Some(timer);
        }
        true
    }

    fn cancel_directive(&self, message_id: &str) {
        tracing::debug!(%message_id, "Speech cancelled");
        self.stop(message_id);
    }
}

impl ContextStateProvider for SpeakerAgent {
    fn namespace_and_name(&self) -> NamespaceAndName {
        NamespaceAndName::new("TTS", "SpeechState")
    }

    fn provide_state(
        &self,
        setter: &ContextSetter,
        namespace_and_name: &NamespaceAndName,
        _context_type: ContextType,
        token: u64,
    ) {
        setter.set_state(
            namespace_and_name,
            self.state_json(),
            StateRefreshPolicy::Always,
            ContextType::Full,
            Some(token),
        );
    }
}

// ── Display ────────────────────────────────────────────────────────

/// Play-sync member for one card.
struct Card {
    dialog_request_id: String,
    message_id: String,
    agent: Weak<DisplayAgent>,
}

impl SynchronizeObject for Card {
    fn dialog_request_id(&self) -> String {
        self.dialog_request_id.clone()
    }

    fn request_release_sync(&self, _immediate: bool) {
        if let Some(agent) = self.agent.upgrade() {
            agent.dismiss(&self.message_id);
        }
    }

    fn on_sync_state_changed(
        &self,
        prepared: &[Arc<dyn SynchronizeObject>],
        started: &[Arc<dyn SynchronizeObject>],
    ) {
        // Alone on screen: everything else of the turn has ended.
        if prepared.is_empty()
            && started.len() == 1
            && let Some(agent) = self.agent.upgrade()
        {
            agent.linger(&self.message_id);
        }
    }
}

struct Shown {
    info: DirectiveInfo,
    card: Arc<dyn SynchronizeObject>,
    started: bool,
    dismiss: Option<TimerHandle>,
}

/// Handles `Display.Card`: keeps a card up until the rest of its turn is
/// done, then for `linger` more.
pub struct DisplayAgent {
    me: Weak<Self>,
    sync: Arc<PlaySynchronizer>,
    scheduler: TaskScheduler,
    linger: Duration,
    cards: Mutex<HashMap<String, Shown>>,
}

impl DisplayAgent {
    pub const DIRECTIVE: (&'static str, &'static str) = ("Display", "Card");

    pub fn new(sync: Arc<PlaySynchronizer>, scheduler: TaskScheduler, linger: Duration) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            sync,
            scheduler,
            linger,
            cards: Mutex::default(),
        })
    }

    /// Number of cards currently tracked.
    pub fn shown(&self) -> usize {
        lock(&self.cards).len()
    }

    fn linger(&self, message_id: &str) {
        let mut cards = lock(&self.cards);
        let Some(shown) = cards.get_mut(message_id) else {
            return;
        };
        if !shown.started || shown.dismiss.is_some() {
            return;
        }

        let me = self.me.clone();
        let id = message_id.to_string();
        shown.dismiss = Some(self.scheduler.schedule(self.linger, move || {
            if let Some(agent) = me.upgrade() {
                agent.dismiss(&id);
            }
        }));
        tracing::debug!(%message_id, linger_ms = self.linger.as_millis(), "Card dismiss scheduled");
    }

    fn dismiss(&self, message_id: &str) {
        let Some(shown) = lock(&self.cards).remove(message_id) else {
            return;
        };
        drop(shown.dismiss);

        self.sync.release_sync(&shown.card, &sync_log("card", message_id));
        if !shown.info.result.is_cancelled()
            && let Err(e) = shown.info.result.set_completed()
        {
            tracing::debug!(%message_id, error = %e, "Card result not delivered");
        }
    }
}

impl DirectiveHandler for DisplayAgent {
    fn configurations(&self) -> HashMap<NamespaceAndName, BlockingPolicy> {
        let (namespace, name) = Self::DIRECTIVE;
        HashMap::from([(
            NamespaceAndName::new(namespace, name),
            BlockingPolicy::new(Medium::VISUAL, Medium::VISUAL),
        )])
    }

    fn pre_handle_directive(&self, info: DirectiveInfo) {
        let message_id = info.directive.message_id().to_string();
        let card: Arc<dyn SynchronizeObject> = Arc::new(Card {
            dialog_request_id: info.directive.dialog_request_id().to_string(),
            message_id: message_id.clone(),
            agent: self.me.clone(),
        });
        lock(&self.cards).insert(
            message_id,
            Shown {
                info,
                card: Arc::clone(&card),
                started: false,
                dismiss: None,
            },
        );
        self.sync.prepare_sync(&card);
    }

    fn handle_directive(&self, message_id: &str) -> bool {
        let card = {
            let mut cards = lock(&self.cards);
            let Some(shown) = cards.get_mut(message_id) else {
                return false;
            };
            shown.started = true;
            Arc::clone(&shown.card)
        };
        self.sync.start_sync(&card, &sync_log("card", message_id));
        true
    }

    fn cancel_directive(&self, message_id: &str) {
        let Some(shown) = lock(&self.cards).remove(message_id) else {
            return;
        };
        tracing::debug!(%message_id, "Card cancelled");
        self.sync.release_without_sync(&shown.card);
    }
}

impl ContextStateProvider for DisplayAgent {
    fn namespace_and_name(&self) -> NamespaceAndName {
        NamespaceAndName::new("Display", "CardState")
    }

    fn provide_state(
        &self,
        setter: &ContextSetter,
        namespace_and_name: &NamespaceAndName,
        _context_type: ContextType,
        token: u64,
    ) {
        let visible: Vec<String> = lock(&self.cards)
            .iter()
            .filter(|(_, s)| s.started)
            .map(|(id, _)| id.clone())
            .collect();
        // Nothing on screen contributes nothing.
        let state = if visible.is_empty() {
            String::new()
        } else {
            json!({ "visibleCards": visible }).to_string()
        };
        setter.set_state(
            namespace_and_name,
            state,
            StateRefreshPolicy::Sometimes,
            ContextType::Full,
            Some(token),
        );
    }
}

// ── Session ────────────────────────────────────────────────────────

/// Handles `Session.Set`: records the payload's session for the turn and
/// keeps it active for the dialog.
pub struct SessionAgent {
    sessions: Arc<SessionManager>,
    requester: Requester,
    pending: Mutex<HashMap<String, DirectiveInfo>>,
}

impl SessionAgent {
    pub const DIRECTIVE: (&'static str, &'static str) = ("Session", "Set");

    pub fn new(sessions: Arc<SessionManager>) -> Arc<Self> {
        Arc::new(Self {
            sessions,
            requester: Requester::new("dialog"),
            pending: Mutex::default(),
        })
    }

    /// The requester this agent activates sessions with.
    pub const fn requester(&self) -> &Requester {
        &self.requester
    }
}

impl DirectiveHandler for SessionAgent {
    fn configurations(&self) -> HashMap<NamespaceAndName, BlockingPolicy> {
        let (namespace, name) = Self::DIRECTIVE;
        HashMap::from([(NamespaceAndName::new(namespace, name), BlockingPolicy::non_blocking())])
    }

    fn pre_handle_directive(&self, info: DirectiveInfo) {
        lock(&self.pending).insert(info.directive.message_id().to_string(), info);
    }

    fn handle_directive(&self, message_id: &str) -> bool {
        let Some(info) = lock(&self.pending).remove(message_id) else {
            return false;
        };

        let outcome = match serde_json::from_str::<Session>(info.directive.payload()) {
            Ok(session) => {
                let key = info.directive.dialog_request_id();
                tracing::debug!(%key, session_id = %session.session_id, "Session set");
                self.sessions.set(key, session);
                self.sessions.activate(key, self.requester.clone());
                info.result.set_completed()
            }
            Err(e) => {
                tracing::warn!(%message_id, error = %e, "Malformed session payload");
                info.result
                    .set_failed(format!("Malformed session payload: {e}"), CancelPolicy::none())
            }
        };
        if let Err(e) = outcome {
            tracing::debug!(%message_id, error = %e, "Session result not delivered");
        }
        true
    }

    fn cancel_directive(&self, message_id: &str) {
        lock(&self.pending).remove(message_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::{ContextAggregator, Directive, DirectiveSequencer, Header};

    fn directive(ns: &str, name: &str, id: &str, payload: &str) -> Directive {
        Directive::new(Header::new(ns, name, id, "turn-1"), payload)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn session_directive_activates_session() {
        let scheduler = TaskScheduler::current().unwrap();
        let sessions = Arc::new(SessionManager::new(scheduler, Duration::from_secs(30)));
        let agent = SessionAgent::new(Arc::clone(&sessions));
        let sequencer = DirectiveSequencer::new();
        sequencer.add_handler(agent.clone()).unwrap();

        sequencer.on_directives(vec![directive(
            "Session",
            "Set",
            "m-1",
            r#"{"sessionId":"s-1","playServiceId":"weather"}"#,
        )]);

        assert!(sequencer.is_idle());
        assert!(sessions.is_active("turn-1"));
        assert_eq!(
            sessions.get_session("turn-1"),
            Some(Session::new("s-1", "weather"))
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn malformed_session_fails_without_cancelling_siblings() {
        let scheduler = TaskScheduler::current().unwrap();
        let sessions = Arc::new(SessionManager::new(scheduler.clone(), Duration::from_secs(30)));
        let sync = Arc::new(PlaySynchronizer::new());
        let display = DisplayAgent::new(Arc::clone(&sync), scheduler, Duration::from_secs(60));
        let sequencer = DirectiveSequencer::new();
        sequencer.add_handler(SessionAgent::new(Arc::clone(&sessions))).unwrap();
        sequencer.add_handler(display.clone()).unwrap();

        sequencer.on_directives(vec![
            directive("Session", "Set", "m-1", "not json"),
            directive("Display", "Card", "m-2", "{}"),
        ]);

        assert!(!sessions.is_active("turn-1"));
        assert_eq!(display.shown(), 1);
        assert_eq!(sequencer.pending_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn lone_card_is_dismissed_after_linger() {
        let scheduler = TaskScheduler::current().unwrap();
        let sync = Arc::new(PlaySynchronizer::new());
        let display = DisplayAgent::new(Arc::clone(&sync), scheduler, Duration::from_millis(20));
        let sequencer = DirectiveSequencer::new();
        sequencer.add_handler(display.clone()).unwrap();

        sequencer.on_directives(vec![directive("Display", "Card", "m-1", "{}")]);
        assert_eq!(display.shown(), 1);

        tokio::time::timeout(Duration::from_secs(2), async {
            while !sequencer.is_idle() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("card should be dismissed");
        assert_eq!(display.shown(), 0);
        assert!(!sync.has_context("turn-1"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn speech_reports_state_to_context() {
        let scheduler = TaskScheduler::current().unwrap();
        let aggregator = ContextAggregator::new(scheduler.clone());
        let ux = Arc::new(DialogUxStateAggregator::spawn(&scheduler, Duration::ZERO));
        let speaker = SpeakerAgent::new(
            Arc::new(PlaySynchronizer::new()),
            ux,
            scheduler,
            aggregator.setter(),
            Duration::from_millis(200),
        );
        assert!(aggregator.add_provider(speaker.clone()));
        let sequencer = DirectiveSequencer::new();
        sequencer.add_handler(speaker.clone()).unwrap();

        sequencer.on_directives(vec![directive("TTS", "Speak", "m-1", r#"{"text":"hello"}"#)]);
        assert!(speaker.state_json().contains("PLAYING"));

        tokio::time::timeout(Duration::from_secs(2), async {
            while !sequencer.is_idle() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("speech should finish");

        let state: serde_json::Value = serde_json::from_str(&speaker.state_json()).unwrap();
        assert_eq!(state["ttsActivity"], "IDLE");
        assert_eq!(state["lastText"], "hello");
    }
}

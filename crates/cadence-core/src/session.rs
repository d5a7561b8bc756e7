//! Multi-turn dialog sessions.
//!
//! A session is set by the server, kept alive by the requesters that hold it
//! active, and expires silently after a period with no active requester.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::Span;

use crate::observer::ObserverRegistry;
use crate::scheduler::{TaskScheduler, TimerHandle};
use crate::settings::Settings;
use crate::utils;

/// A dialog continuation window.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub play_service_id: String,
}

impl Session {
    pub fn new(session_id: impl Into<String>, play_service_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            play_service_id: play_service_id.into(),
        }
    }
}

/// Opaque identity of whoever holds a session active.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Requester(String);

impl Requester {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Requester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Observer of session activation changes.
#[cfg_attr(test, mockall::automock)]
pub trait SessionListener: Send + Sync {
    fn on_session_activated(&self, key: &str, session: &Session);
    fn on_session_deactivated(&self, key: &str, session: &Session);
}

#[derive(Debug, Clone, Copy)]
enum Change {
    Activated,
    Deactivated,
}

#[derive(Default)]
struct State {
    sessions: HashMap<String, Session>,
    /// Logical time of the last `set` per key; newer wins on dedup.
    set_order: HashMap<String, u64>,
    active: HashMap<String, HashSet<Requester>>,
    timers: HashMap<String, (u64, TimerHandle)>,
    clock: u64,
    timer_generation: u64,
}

impl State {
    fn is_active(&self, key: &str) -> bool {
        self.active.get(key).is_some_and(|r| !r.is_empty())
    }
}

struct Inner {
    state: Mutex<State>,
    listeners: ObserverRegistry<dyn SessionListener>,
    scheduler: TaskScheduler,
    inactivity_timeout: Duration,
    span: Span,
}

impl Inner {
    /// (Re)arm the inactivity timer of `key`. Must be called with the lock held.
    fn arm_timer(self: &Arc<Self>, state: &mut State, key: &str) {
        state.timer_generation += 1;
        let generation = state.timer_generation;

        let weak = Arc::downgrade(self);
        let owned_key = key.to_string();
        let timer = self.scheduler.schedule(self.inactivity_timeout, move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_timeout(&owned_key, generation);
            }
        });
        state.timers.insert(key.to_string(), (generation, timer));
    }

    fn on_timeout(&self, key: &str, generation: u64) {
        let _guard = self.span.enter();
        let mut state = utils::lock(&self.state);

        let current = state.timers.get(key).map(|(g, _)| *g);
        if current != Some(generation) || state.is_active(key) {
            return;
        }

        state.timers.remove(key);
        state.set_order.remove(key);
        state.active.remove(key);
        if let Some(session) = state.sessions.remove(key) {
            tracing::debug!(%key, session_id = %session.session_id, "Session expired");
        }
    }

    fn notify(&self, change: Change, key: &str, session: &Session) {
        tracing::debug!(%key, session_id = %session.session_id, ?change, "Session changed");
        self.listeners.notify(|listener| match change {
            Change::Activated => listener.on_session_activated(key, session),
            Change::Deactivated => listener.on_session_deactivated(key, session),
        });
    }
}

/// Reference-counted session lifecycle with inactivity expiry.
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(scheduler: TaskScheduler, inactivity_timeout: Duration) -> Self {
        Self::with_span(
            scheduler,
            inactivity_timeout,
            tracing::info_span!("session_manager"),
        )
    }

    /// Build with the inactivity timeout from `settings`.
    pub fn from_settings(scheduler: TaskScheduler, settings: &Settings) -> Self {
        Self::new(scheduler, settings.effective_session_inactivity_timeout())
    }

    pub fn with_span(scheduler: TaskScheduler, inactivity_timeout: Duration, span: Span) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::default(),
                listeners: ObserverRegistry::new(),
                scheduler,
                inactivity_timeout,
                span,
            }),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) -> bool {
        self.inner.listeners.add(listener)
    }

    pub fn remove_listener(&self, listener: &Arc<dyn SessionListener>) -> bool {
        self.inner.listeners.remove(listener)
    }

    /// Store `session` under `key`.
    ///
    /// If a requester already holds `key` active the activation is reported
    /// now; otherwise the inactivity timer starts.
    pub fn set(&self, key: &str, session: Session) {
        let _guard = self.inner.span.enter();

        let activated = {
            let mut state = utils::lock(&self.inner.state);
            state.clock += 1;
            let stamp = state.clock;
            state.set_order.insert(key.to_string(), stamp);
            state.sessions.insert(key.to_string(), session.clone());

            if state.is_active(key) {
                state.timers.remove(key);
                true
            } else {
                self.inner.arm_timer(&mut state, key);
                false
            }
        };

        tracing::debug!(%key, session_id = %session.session_id, activated, "Session set");
        if activated {
            self.inner.notify(Change::Activated, key, &session);
        }
    }

    /// Hold `key` active on behalf of `requester`.
    ///
    /// The first requester of a set session cancels its timer and reports
    /// activation. Activating a key that is not set yet only records the
    /// requester; the activation is reported by the later `set`.
    pub fn activate(&self, key: &str, requester: Requester) {
        let _guard = self.inner.span.enter();

        let activated = {
            let mut state = utils::lock(&self.inner.state);
            let requesters = state.active.entry(key.to_string()).or_default();
            let first = requesters.is_empty();
            if !requesters.insert(requester) || !first {
                return;
            }

            match state.sessions.get(key).cloned() {
                Some(session) => {
                    state.timers.remove(key);
                    Some(session)
                }
                None => {
                    tracing::debug!(%key, "Activated before set, deferring");
                    None
                }
            }
        };

        if let Some(session) = activated {
            self.inner.notify(Change::Activated, key, &session);
        }
    }

    /// Release `requester`'s hold on `key`.
    ///
    /// When the last requester leaves a set session, its timer restarts and
    /// deactivation is reported.
    pub fn deactivate(&self, key: &str, requester: &Requester) {
        let _guard = self.inner.span.enter();

        let deactivated = {
            let mut state = utils::lock(&self.inner.state);
            let Some(requesters) = state.active.get_mut(key) else {
                return;
            };
            if !requesters.remove(requester) || !requesters.is_empty() {
                return;
            }
            state.active.remove(key);

            let session = state.sessions.get(key).cloned();
            if session.is_some() {
                self.inner.arm_timer(&mut state, key);
            }
            session
        };

        if let Some(session) = deactivated {
            self.inner.notify(Change::Deactivated, key, &session);
        }
    }

    /// Active sessions, at most one per play service id (the latest set).
    pub fn get_active_sessions(&self) -> HashMap<String, Session> {
        let state = utils::lock(&self.inner.state);

        let mut newest: HashMap<&str, (u64, &str, &Session)> = HashMap::new();
        for (key, session) in &state.sessions {
            if !state.is_active(key) {
                continue;
            }
            let stamp = state.set_order.get(key).copied().unwrap_or_default();
            newest
                .entry(session.play_service_id.as_str())
                .and_modify(|slot| {
                    if stamp > slot.0 {
                        *slot = (stamp, key.as_str(), session);
                    }
                })
                .or_insert((stamp, key.as_str(), session));
        }

        newest
            .into_values()
            .map(|(_, key, session)| (key.to_string(), session.clone()))
            .collect()
    }

    pub fn get_session(&self, key: &str) -> Option<Session> {
        utils::lock(&self.inner.state).sessions.get(key).cloned()
    }

    /// Whether any requester holds `key` active.
    pub fn is_active(&self, key: &str) -> bool {
        utils::lock(&self.inner.state).is_active(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;

    const SHORT: Duration = Duration::from_millis(40);

    fn manager(timeout: Duration) -> SessionManager {
        SessionManager::new(TaskScheduler::current().unwrap(), timeout)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn activation_after_set_is_reported() {
        let mut listener = MockSessionListener::new();
        listener
            .expect_on_session_activated()
            .with(eq("k1"), eq(Session::new("s1", "ps1")))
            .times(1)
            .return_const(());
        listener
            .expect_on_session_deactivated()
            .with(eq("k1"), eq(Session::new("s1", "ps1")))
            .times(1)
            .return_const(());

        let sessions = manager(Duration::from_secs(30));
        sessions.add_listener(Arc::new(listener));
        let tts = Requester::new("tts");

        sessions.set("k1", Session::new("s1", "ps1"));
        sessions.activate("k1", tts.clone());
        sessions.activate("k1", Requester::new("display"));
        sessions.deactivate("k1", &tts);
        sessions.deactivate("k1", &Requester::new("display"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unused_session_expires_silently() {
        let mut listener = MockSessionListener::new();
        listener.expect_on_session_activated().never();
        listener.expect_on_session_deactivated().never();

        let sessions = manager(SHORT);
        sessions.add_listener(Arc::new(listener));
        sessions.set("k1", Session::new("s1", "ps1"));
        assert!(sessions.get_session("k1").is_some());

        tokio::time::sleep(SHORT * 4).await;
        assert!(sessions.get_session("k1").is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn activation_cancels_expiry() {
        let sessions = manager(SHORT);
        sessions.set("k1", Session::new("s1", "ps1"));
        sessions.activate("k1", Requester::new("asr"));

        tokio::time::sleep(SHORT * 4).await;
        assert!(sessions.get_session("k1").is_some());
        assert_eq!(sessions.get_active_sessions().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn deactivation_restarts_expiry() {
        let sessions = manager(SHORT);
        let asr = Requester::new("asr");
        sessions.set("k1", Session::new("s1", "ps1"));
        sessions.activate("k1", asr.clone());
        sessions.deactivate("k1", &asr);

        assert!(sessions.get_active_sessions().is_empty());
        tokio::time::sleep(SHORT * 4).await;
        assert!(sessions.get_session("k1").is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn activate_before_set_is_deferred() {
        let mut listener = MockSessionListener::new();
        listener
            .expect_on_session_activated()
            .with(eq("k1"), eq(Session::new("s1", "ps1")))
            .times(1)
            .return_const(());
        listener.expect_on_session_deactivated().never();

        let sessions = manager(SHORT);
        let listener: Arc<dyn SessionListener> = Arc::new(listener);
        sessions.add_listener(Arc::clone(&listener));

        sessions.activate("k1", Requester::new("asr"));
        assert!(sessions.get_active_sessions().is_empty());

        sessions.set("k1", Session::new("s1", "ps1"));
        tokio::time::sleep(SHORT * 4).await;
        assert!(sessions.get_session("k1").is_some());
        assert!(sessions.remove_listener(&listener));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn duplicate_play_service_keeps_latest_set() {
        let sessions = manager(Duration::from_secs(30));
        sessions.set("old", Session::new("s1", "weather"));
        sessions.set("new", Session::new("s2", "weather"));
        sessions.set("other", Session::new("s3", "music"));
        for key in ["new", "old", "other"] {
            sessions.activate(key, Requester::new(key));
        }

        let active = sessions.get_active_sessions();

        assert_eq!(active.len(), 2);
        assert_eq!(active["new"], Session::new("s2", "weather"));
        assert!(active.contains_key("other"));
        assert!(sessions.get_session("old").is_some());
    }
}
